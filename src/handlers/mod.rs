//! Handler layer.
//!
//! A handler is the uniform control surface of one capability of one device.
//! Devices create their handlers during startup; the depot collects them and
//! everything above (interfaces, experiments, GUI) talks to handlers only.
//!
//! ```text
//! ┌────────────┐  creates   ┌─────────────────────────┐
//! │ CameraDev  │──────────▶ │ CameraHandler "camera"  │
//! │ StageDev   │──────────▶ │ StagePositioner "x","y" │
//! │ LaserDev   │──────────▶ │ LightSource "488"       │
//! └────────────┘            └─────────────────────────┘
//! ```
//!
//! Every state change is published as [`Event::DeviceStatus`] so the GUI and
//! interfaces can follow along without polling.

pub mod adaptive_optics;
pub mod camera;
pub mod generic;
pub mod light;
pub mod objective;
pub mod stage;

use crate::error::{AppResult, CockpitError};
use crate::events::{Event, EventBus};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

pub use adaptive_optics::AdaptiveOpticsHandler;
pub use camera::CameraHandler;
pub use generic::GenericHandler;
pub use light::LightSourceHandler;
pub use objective::ObjectiveHandler;
pub use stage::StagePositionerHandler;

/// Run-time state of a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HandlerState {
    /// Switched on and ready
    Enabled,
    /// Switched off
    Disabled,
    /// Switching on is in progress
    Enabling,
    /// Working on something; cannot accept new commands
    Busy,
    /// The last operation failed
    Error,
}

impl std::fmt::Display for HandlerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HandlerState::Enabled => "enabled",
            HandlerState::Disabled => "disabled",
            HandlerState::Enabling => "enabling",
            HandlerState::Busy => "busy",
            HandlerState::Error => "error",
        };
        f.write_str(s)
    }
}

/// Capability category of a handler (used for depot lookups).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HandlerKind {
    /// Plain enable/disable device
    Generic,
    /// Camera
    Camera,
    /// One axis of a stage
    StagePositioner,
    /// Light source
    LightSource,
    /// Objective turret
    Objective,
    /// Deformable mirror / wavefront shaper
    AdaptiveOptics,
}

impl std::fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HandlerKind::Generic => "generic",
            HandlerKind::Camera => "camera",
            HandlerKind::StagePositioner => "stage positioner",
            HandlerKind::LightSource => "light source",
            HandlerKind::Objective => "objective",
            HandlerKind::AdaptiveOptics => "adaptive optics",
        };
        f.write_str(s)
    }
}

/// State shared by every handler: identity plus the observable state.
pub struct HandlerCore {
    name: String,
    group_name: String,
    eligible_for_experiments: bool,
    state: RwLock<HandlerState>,
    bus: EventBus,
}

impl HandlerCore {
    /// Create a core in the given initial state.
    pub fn new(
        name: impl Into<String>,
        group_name: impl Into<String>,
        eligible_for_experiments: bool,
        initial: HandlerState,
        bus: EventBus,
    ) -> Self {
        Self {
            name: name.into(),
            group_name: group_name.into(),
            eligible_for_experiments,
            state: RwLock::new(initial),
            bus,
        }
    }

    /// Handler name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Group the handler is shown under in the GUI
    pub fn group_name(&self) -> &str {
        &self.group_name
    }

    /// Whether experiments may use this handler
    pub fn eligible_for_experiments(&self) -> bool {
        self.eligible_for_experiments
    }

    /// Event bus the handler publishes on
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Current state
    pub fn state(&self) -> HandlerState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Change state and publish `DeviceStatus`.
    pub fn set_state(&self, state: HandlerState) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = state;
        self.bus.publish(Event::DeviceStatus {
            handler: self.name.clone(),
            state,
        });
    }

    /// Drive an enable/disable request through the state machine.
    ///
    /// `toggle` performs the hardware call and reports whether the device
    /// ended up enabled. The state goes through `Enabling` when switching on
    /// and lands on `Error` if the call fails.
    pub async fn apply_enable<Fut>(&self, enabled: bool, toggle: Fut) -> AppResult<HandlerState>
    where
        Fut: Future<Output = anyhow::Result<bool>>,
    {
        if enabled {
            self.set_state(HandlerState::Enabling);
        }
        match toggle.await {
            Ok(true) => {
                self.set_state(HandlerState::Enabled);
                Ok(HandlerState::Enabled)
            }
            Ok(false) => {
                self.set_state(HandlerState::Disabled);
                Ok(HandlerState::Disabled)
            }
            Err(e) => {
                tracing::error!(handler = %self.name, error = %e, "enable/disable failed");
                self.set_state(HandlerState::Error);
                Err(CockpitError::device(&self.name, e))
            }
        }
    }

    /// Fail with `DeviceDisabled` unless the handler is enabled.
    pub fn ensure_enabled(&self) -> AppResult<()> {
        if self.state() == HandlerState::Enabled {
            Ok(())
        } else {
            Err(CockpitError::DeviceDisabled(self.name.clone()))
        }
    }
}

/// Common handler contract.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Shared identity and state
    fn core(&self) -> &HandlerCore;

    /// Capability category
    fn kind(&self) -> HandlerKind;

    /// Switch the underlying capability on or off
    async fn set_enabled(&self, enabled: bool) -> AppResult<HandlerState>;

    /// Handler name
    fn name(&self) -> &str {
        self.core().name()
    }

    /// GUI group name
    fn group_name(&self) -> &str {
        self.core().group_name()
    }

    /// Whether experiments may use this handler
    fn is_eligible_for_experiments(&self) -> bool {
        self.core().eligible_for_experiments()
    }

    /// Current state
    fn state(&self) -> HandlerState {
        self.core().state()
    }

    /// Shorthand for `state() == Enabled`
    fn is_enabled(&self) -> bool {
        self.state() == HandlerState::Enabled
    }

    /// Get ready for an experiment
    async fn prepare_for_experiment(&self) -> AppResult<()> {
        Ok(())
    }

    /// Restore state after an experiment
    async fn cleanup_after_experiment(&self) -> AppResult<()> {
        Ok(())
    }
}

/// A handler of any concrete type.
///
/// Lets the depot keep a single list while callers still get typed access
/// to the capability they need.
#[derive(Clone)]
pub enum HandlerRef {
    /// Plain enable/disable handler
    Generic(Arc<GenericHandler>),
    /// Camera handler
    Camera(Arc<CameraHandler>),
    /// Stage axis handler
    StagePositioner(Arc<StagePositionerHandler>),
    /// Light source handler
    LightSource(Arc<LightSourceHandler>),
    /// Objective handler
    Objective(Arc<ObjectiveHandler>),
    /// Adaptive optics handler
    AdaptiveOptics(Arc<AdaptiveOpticsHandler>),
}

impl HandlerRef {
    /// View as the common handler trait
    pub fn as_handler(&self) -> &dyn Handler {
        match self {
            HandlerRef::Generic(h) => h.as_ref(),
            HandlerRef::Camera(h) => h.as_ref(),
            HandlerRef::StagePositioner(h) => h.as_ref(),
            HandlerRef::LightSource(h) => h.as_ref(),
            HandlerRef::Objective(h) => h.as_ref(),
            HandlerRef::AdaptiveOptics(h) => h.as_ref(),
        }
    }

    /// Handler name
    pub fn name(&self) -> &str {
        self.as_handler().name()
    }

    /// Capability category
    pub fn kind(&self) -> HandlerKind {
        self.as_handler().kind()
    }

    /// Typed access to a camera handler
    pub fn as_camera(&self) -> Option<&Arc<CameraHandler>> {
        match self {
            HandlerRef::Camera(h) => Some(h),
            _ => None,
        }
    }

    /// Typed access to a stage axis handler
    pub fn as_stage_positioner(&self) -> Option<&Arc<StagePositionerHandler>> {
        match self {
            HandlerRef::StagePositioner(h) => Some(h),
            _ => None,
        }
    }

    /// Typed access to a light source handler
    pub fn as_light_source(&self) -> Option<&Arc<LightSourceHandler>> {
        match self {
            HandlerRef::LightSource(h) => Some(h),
            _ => None,
        }
    }

    /// Typed access to an objective handler
    pub fn as_objective(&self) -> Option<&Arc<ObjectiveHandler>> {
        match self {
            HandlerRef::Objective(h) => Some(h),
            _ => None,
        }
    }

    /// Typed access to an adaptive optics handler
    pub fn as_adaptive_optics(&self) -> Option<&Arc<AdaptiveOpticsHandler>> {
        match self {
            HandlerRef::AdaptiveOptics(h) => Some(h),
            _ => None,
        }
    }

    /// Typed access to a generic handler
    pub fn as_generic(&self) -> Option<&Arc<GenericHandler>> {
        match self {
            HandlerRef::Generic(h) => Some(h),
            _ => None,
        }
    }
}

impl std::fmt::Debug for HandlerRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRef")
            .field("name", &self.name())
            .field("kind", &self.kind())
            .field("state", &self.as_handler().state())
            .finish()
    }
}

/// Ordered, name-indexed collection of handlers.
///
/// Keeps registration order so GUI panels and stage movers come out in the
/// order the configuration declared them.
#[derive(Clone, Default)]
pub struct HandlerDirectory {
    handlers: Vec<HandlerRef>,
    by_name: HashMap<String, usize>,
}

impl HandlerDirectory {
    /// Empty directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handler; names must be unique.
    pub fn insert(&mut self, handler: HandlerRef) -> AppResult<()> {
        let name = handler.name().to_string();
        if self.by_name.contains_key(&name) {
            return Err(CockpitError::DuplicateHandler(name));
        }
        self.by_name.insert(name, self.handlers.len());
        self.handlers.push(handler);
        Ok(())
    }

    /// Look a handler up by name
    pub fn get(&self, name: &str) -> Option<&HandlerRef> {
        self.by_name.get(name).and_then(|&i| self.handlers.get(i))
    }

    /// Look a handler up by name and kind (`depot.getHandler(name, kind)`)
    pub fn get_with_kind(&self, name: &str, kind: HandlerKind) -> Option<&HandlerRef> {
        self.get(name).filter(|h| h.kind() == kind)
    }

    /// All handlers of one kind, in registration order
    pub fn of_kind(&self, kind: HandlerKind) -> Vec<HandlerRef> {
        self.handlers
            .iter()
            .filter(|h| h.kind() == kind)
            .cloned()
            .collect()
    }

    /// Camera handler by name
    pub fn camera(&self, name: &str) -> Option<Arc<CameraHandler>> {
        self.get(name).and_then(|h| h.as_camera()).cloned()
    }

    /// Iterate in registration order
    pub fn iter(&self) -> impl Iterator<Item = &HandlerRef> {
        self.handlers.iter()
    }

    /// Number of handlers
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no handler is registered
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

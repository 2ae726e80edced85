//! Device layer.
//!
//! A device is one physical instrument. It owns its driver, creates the
//! handlers through which the rest of the application controls it, and may
//! contribute device-specific GUI controls.
//!
//! # Lifecycle
//!
//! ```text
//! factory.create(def) -> initialize() -> create_handlers() -> finalize_initialization(dir)
//!                                                          ... on_event() / invoke() ...
//!                                                          -> shutdown()
//! ```
//!
//! Drivers talk to hardware through the capability traits in
//! [`capabilities`]; every concrete device here wraps a simulated driver but
//! would take a real one unchanged.

pub mod camera;
pub mod capabilities;
pub mod clarity;
pub mod deformable_mirror;
pub mod frame;
pub mod light;
pub mod objective;
pub mod simulated;
pub mod stage;

use crate::config::DeviceDefinition;
use crate::error::{AppResult, CockpitError};
use crate::events::{Event, EventBus};
use crate::gui::model::Control;
use crate::handlers::{HandlerDirectory, HandlerRef};
use crate::user_config::UserConfig;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Shared services handed to every device at construction.
#[derive(Clone)]
pub struct DeviceContext {
    /// Application event bus
    pub bus: EventBus,
    /// Per-user settings
    pub user_config: UserConfig,
}

impl DeviceContext {
    /// Bundle the shared services.
    pub fn new(bus: EventBus, user_config: UserConfig) -> Self {
        Self { bus, user_config }
    }
}

/// A physical instrument.
#[async_trait]
pub trait Device: Send + Sync {
    /// Unique device name (the configuration section name)
    fn name(&self) -> &str;

    /// Configuration type string this device was built from
    fn type_name(&self) -> &'static str;

    /// Connect to the hardware and read its initial state.
    async fn initialize(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Create this device's handlers. Repeated calls return the same handlers.
    fn create_handlers(&self) -> anyhow::Result<Vec<HandlerRef>>;

    /// Second initialization pass, run once every device's handlers exist.
    async fn finalize_initialization(&self, _handlers: &HandlerDirectory) -> anyhow::Result<()> {
        Ok(())
    }

    /// React to an application event.
    async fn on_event(&self, _event: &Event) -> anyhow::Result<()> {
        Ok(())
    }

    /// Device-specific GUI controls
    async fn controls(&self) -> Vec<Control> {
        Vec::new()
    }

    /// Run a device-specific action (the target of a control).
    async fn invoke(&self, action: &str, _value: Option<&str>) -> anyhow::Result<String> {
        anyhow::bail!("device '{}' has no action '{}'", self.name(), action)
    }

    /// Release the hardware.
    async fn shutdown(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Constructor registered for a configuration type string.
pub type DeviceConstructor = fn(&DeviceDefinition, &DeviceContext) -> AppResult<Arc<dyn Device>>;

/// Maps configuration `type` strings to device constructors.
#[derive(Clone)]
pub struct DeviceFactory {
    constructors: BTreeMap<String, DeviceConstructor>,
}

impl DeviceFactory {
    /// Factory without any registered types
    pub fn empty() -> Self {
        Self {
            constructors: BTreeMap::new(),
        }
    }

    /// Factory knowing every built-in device type.
    pub fn with_builtin() -> Self {
        let mut factory = Self::empty();
        factory.register(camera::TYPE_NAME, camera::from_definition);
        factory.register(stage::TYPE_NAME, stage::from_definition);
        factory.register(light::TYPE_NAME, light::from_definition);
        factory.register(objective::TYPE_NAME, objective::from_definition);
        factory.register(clarity::TYPE_NAME, clarity::from_definition);
        factory.register(
            deformable_mirror::TYPE_NAME,
            deformable_mirror::from_definition,
        );
        factory
    }

    /// Register (or replace) a constructor.
    pub fn register(&mut self, type_name: impl Into<String>, constructor: DeviceConstructor) {
        self.constructors.insert(type_name.into(), constructor);
    }

    /// Known type strings, sorted
    pub fn type_names(&self) -> Vec<&str> {
        self.constructors.keys().map(String::as_str).collect()
    }

    /// Build the device described by `definition`.
    pub fn create(
        &self,
        definition: &DeviceDefinition,
        context: &DeviceContext,
    ) -> AppResult<Arc<dyn Device>> {
        let constructor = self.constructors.get(&definition.r#type).ok_or_else(|| {
            CockpitError::UnknownDeviceType {
                device: definition.name.clone(),
                type_name: definition.r#type.clone(),
            }
        })?;
        tracing::debug!(device = %definition.name, r#type = %definition.r#type, "constructing device");
        constructor(definition, context)
    }
}

impl Default for DeviceFactory {
    fn default() -> Self {
        Self::with_builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> DeviceContext {
        DeviceContext::new(EventBus::default(), UserConfig::in_memory())
    }

    #[test]
    fn builtin_types_are_registered() {
        let factory = DeviceFactory::with_builtin();
        assert_eq!(
            factory.type_names(),
            vec![
                "clarity",
                "deformable_mirror",
                "objectives",
                "simulated_camera",
                "simulated_light",
                "simulated_stage",
            ]
        );
    }

    #[test]
    fn unknown_type_is_reported() {
        let factory = DeviceFactory::with_builtin();
        let def = DeviceDefinition::new("mystery", "quantum_flux");
        match factory.create(&def, &context()) {
            Err(CockpitError::UnknownDeviceType { device, type_name }) => {
                assert_eq!(device, "mystery");
                assert_eq!(type_name, "quantum_flux");
            }
            Err(other) => panic!("unexpected error {}", other),
            Ok(_) => panic!("device should not have been created"),
        }
    }

    #[test]
    fn factory_builds_named_device() {
        let factory = DeviceFactory::with_builtin();
        let device = factory
            .create(&DeviceDefinition::new("camera", "simulated_camera"), &context())
            .unwrap();
        assert_eq!(device.name(), "camera");
        assert_eq!(device.type_name(), "simulated_camera");
    }
}

//! Camera handler and image post-processing.
//!
//! The handler is what the rest of the application sees of a camera: it
//! works in milliseconds, reports the size of the images it will publish,
//! and owns the post-processing chain that other devices (for example a
//! sectioning unit) plug into.
//!
//! # Post-processors
//!
//! Post-processors run on every received frame in ascending priority order.
//! Processors with equal priority run in the order they were added. Each
//! processor also declares how it changes the image shape, so the expected
//! image size is known before any data arrives.

use super::{Handler, HandlerCore, HandlerKind, HandlerState};
use crate::devices::capabilities::{Roi, TriggerMode, TriggerType};
use crate::devices::frame::Frame;
use crate::error::{AppResult, CockpitError};
use crate::events::EventBus;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

/// Image data function of a post-processor.
pub type DataFn = Arc<dyn Fn(Frame) -> Frame + Send + Sync>;

/// Shape function of a post-processor: (width, height) in, (width, height) out.
pub type ShapeFn = Arc<dyn Fn((u32, u32)) -> (u32, u32) + Send + Sync>;

/// One post-processing unit.
#[derive(Clone)]
pub struct PostProcessor {
    /// Identifies the processor for removal
    pub name: String,
    /// Lower runs first
    pub priority: i32,
    /// Transforms the pixels
    pub data: DataFn,
    /// Predicts the output shape
    pub shape: ShapeFn,
}

impl PostProcessor {
    /// Build a post-processor from plain closures.
    pub fn new<D, S>(name: impl Into<String>, priority: i32, data: D, shape: S) -> Self
    where
        D: Fn(Frame) -> Frame + Send + Sync + 'static,
        S: Fn((u32, u32)) -> (u32, u32) + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            priority,
            data: Arc::new(data),
            shape: Arc::new(shape),
        }
    }
}

impl std::fmt::Debug for PostProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostProcessor")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .finish()
    }
}

/// Priority-ordered list of post-processors shared between a camera device
/// and its handler.
#[derive(Clone, Default)]
pub struct PostProcessorChain {
    inner: Arc<RwLock<Vec<PostProcessor>>>,
}

impl PostProcessorChain {
    /// Empty chain
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a processor. The sort is stable, so equal priorities keep insertion order.
    pub fn add(&self, processor: PostProcessor) {
        let mut list = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        list.push(processor);
        list.sort_by_key(|p| p.priority);
    }

    /// Remove the first processor with `priority` (and `name`, when given).
    pub fn remove(&self, priority: i32, name: Option<&str>) -> anyhow::Result<PostProcessor> {
        let mut list = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let index = list
            .iter()
            .position(|p| p.priority == priority && name.map_or(true, |n| p.name == n))
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "no post-processor with priority {}{}",
                    priority,
                    name.map(|n| format!(" named '{}'", n)).unwrap_or_default()
                )
            })?;
        Ok(list.remove(index))
    }

    /// Run every processor over `frame`.
    pub fn apply(&self, frame: Frame) -> Frame {
        let list = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        list.iter().fold(frame, |frame, p| (p.data)(frame))
    }

    /// Shape of the image after every processor has run.
    pub fn output_shape(&self, shape: (u32, u32)) -> (u32, u32) {
        let list = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        list.iter().fold(shape, |shape, p| (p.shape)(shape))
    }

    /// Processor names in execution order
    pub fn names(&self) -> Vec<String> {
        let list = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        list.iter().map(|p| p.name.clone()).collect()
    }

    /// Whether a processor with this name is installed
    pub fn contains(&self, name: &str) -> bool {
        let list = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        list.iter().any(|p| p.name == name)
    }

    /// Number of processors
    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether the chain is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// How exposures are triggered, from the point of view of experiment timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExposureMode {
    /// Software trigger starts a fixed-length exposure
    TriggerSoft,
    /// Hardware edge starts a fixed-length exposure
    TriggerBefore,
    /// Hardware edge ends the exposure
    TriggerAfter,
    /// Exposure lasts as long as the trigger line is held
    TriggerDuration,
}

impl ExposureMode {
    /// Map a hardware trigger configuration onto an exposure mode.
    ///
    /// Only four combinations are supported; anything else is `None`.
    pub fn from_trigger(trigger_type: TriggerType, mode: TriggerMode) -> Option<Self> {
        match (trigger_type, mode) {
            (TriggerType::Software, TriggerMode::Once) => Some(ExposureMode::TriggerSoft),
            (TriggerType::High, TriggerMode::Once) => Some(ExposureMode::TriggerBefore),
            (TriggerType::Low, TriggerMode::Once) => Some(ExposureMode::TriggerAfter),
            (TriggerType::High, TriggerMode::Bulb) => Some(ExposureMode::TriggerDuration),
            _ => None,
        }
    }
}

/// Device-side callbacks for a [`CameraHandler`].
///
/// Times are in milliseconds at this seam.
#[async_trait]
pub trait CameraControl: Send + Sync {
    /// Switch the camera on or off; returns the resulting enabled state.
    async fn set_enabled(&self, enabled: bool) -> anyhow::Result<bool>;

    /// Current exposure time (ms)
    async fn exposure_time_ms(&self) -> anyhow::Result<f64>;

    /// Change the exposure time (ms)
    async fn set_exposure_time_ms(&self, ms: f64) -> anyhow::Result<()>;

    /// Minimum gap between the end of one exposure and the start of the next (ms)
    async fn time_between_exposures_ms(&self) -> anyhow::Result<f64>;

    /// Size of the images the camera will publish
    async fn image_size(&self) -> anyhow::Result<(u32, u32)>;

    /// Current region of interest
    async fn roi(&self) -> anyhow::Result<Roi>;

    /// Change the region of interest
    async fn set_roi(&self, roi: Roi) -> anyhow::Result<()>;

    /// Full sensor shape
    fn sensor_shape(&self) -> (u32, u32);

    /// Start one exposure
    async fn soft_trigger(&self) -> anyhow::Result<()>;

    /// Current exposure mode
    async fn exposure_mode(&self) -> anyhow::Result<ExposureMode>;

    /// Snapshot the settings that an experiment may change
    async fn prepare_for_experiment(&self) -> anyhow::Result<()>;

    /// Most recent published image
    fn last_image(&self) -> Option<Arc<Frame>>;
}

/// Handler for one camera.
pub struct CameraHandler {
    core: HandlerCore,
    control: Arc<dyn CameraControl>,
    post_processors: PostProcessorChain,
    exposure_mode: RwLock<ExposureMode>,
    trigger_source: Option<String>,
    trigger_line: Option<String>,
}

impl CameraHandler {
    /// Create a disabled camera handler.
    pub fn new(
        name: impl Into<String>,
        group_name: impl Into<String>,
        control: Arc<dyn CameraControl>,
        post_processors: PostProcessorChain,
        bus: EventBus,
    ) -> Self {
        Self {
            core: HandlerCore::new(name, group_name, true, HandlerState::Disabled, bus),
            control,
            post_processors,
            exposure_mode: RwLock::new(ExposureMode::TriggerSoft),
            trigger_source: None,
            trigger_line: None,
        }
    }

    /// Record the hardware trigger wiring (`triggersource` / `triggerline`).
    pub fn with_trigger(mut self, source: Option<String>, line: Option<String>) -> Self {
        self.trigger_source = source;
        self.trigger_line = line;
        self
    }

    fn wrap<T>(&self, result: anyhow::Result<T>) -> AppResult<T> {
        result.map_err(|e| CockpitError::device(self.name(), e))
    }

    /// Exposure time in ms
    pub async fn exposure_time_ms(&self) -> AppResult<f64> {
        self.wrap(self.control.exposure_time_ms().await)
    }

    /// Change the exposure time (ms).
    ///
    /// Times that are negative, not finite, or too long to wait for are
    /// rejected.
    pub async fn set_exposure_time_ms(&self, ms: f64) -> AppResult<()> {
        if Duration::try_from_secs_f64(ms / 1000.0).is_err() {
            return Err(CockpitError::device(
                self.name(),
                format!("invalid exposure time {} ms", ms),
            ));
        }
        self.wrap(self.control.set_exposure_time_ms(ms).await)
    }

    /// Gap needed between exposures (ms)
    pub async fn time_between_exposures_ms(&self) -> AppResult<f64> {
        self.wrap(self.control.time_between_exposures_ms().await)
    }

    /// Size of published images, post-processing included
    pub async fn image_size(&self) -> AppResult<(u32, u32)> {
        self.wrap(self.control.image_size().await)
    }

    /// Region of interest
    pub async fn roi(&self) -> AppResult<Roi> {
        self.wrap(self.control.roi().await)
    }

    /// Change the region of interest
    pub async fn set_roi(&self, roi: Roi) -> AppResult<()> {
        self.wrap(self.control.set_roi(roi).await)
    }

    /// Full sensor shape
    pub fn sensor_shape(&self) -> (u32, u32) {
        self.control.sensor_shape()
    }

    /// Trigger one exposure. The camera must be enabled.
    pub async fn soft_trigger(&self) -> AppResult<()> {
        self.core.ensure_enabled()?;
        self.wrap(self.control.soft_trigger().await)
    }

    /// Exposure mode as of the last enable or experiment cleanup
    pub fn exposure_mode(&self) -> ExposureMode {
        *self
            .exposure_mode
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Re-read the exposure mode from the device.
    pub async fn refresh_exposure_mode(&self) -> AppResult<ExposureMode> {
        let mode = self.wrap(self.control.exposure_mode().await)?;
        *self
            .exposure_mode
            .write()
            .unwrap_or_else(PoisonError::into_inner) = mode;
        Ok(mode)
    }

    /// Post-processing chain applied to this camera's images
    pub fn post_processors(&self) -> &PostProcessorChain {
        &self.post_processors
    }

    /// Most recent image
    pub fn last_image(&self) -> Option<Arc<Frame>> {
        self.control.last_image()
    }

    /// Name of the handler that fires this camera's hardware trigger
    pub fn trigger_source(&self) -> Option<&str> {
        self.trigger_source.as_deref()
    }

    /// Trigger line on the trigger source
    pub fn trigger_line(&self) -> Option<&str> {
        self.trigger_line.as_deref()
    }
}

#[async_trait]
impl Handler for CameraHandler {
    fn core(&self) -> &HandlerCore {
        &self.core
    }

    fn kind(&self) -> HandlerKind {
        HandlerKind::Camera
    }

    async fn set_enabled(&self, enabled: bool) -> AppResult<HandlerState> {
        let control = self.control.clone();
        let state = self
            .core
            .apply_enable(enabled, async move { control.set_enabled(enabled).await })
            .await?;
        if state == HandlerState::Enabled {
            self.refresh_exposure_mode().await?;
        }
        Ok(state)
    }

    async fn prepare_for_experiment(&self) -> AppResult<()> {
        self.wrap(self.control.prepare_for_experiment().await)
    }

    async fn cleanup_after_experiment(&self) -> AppResult<()> {
        if self.is_enabled() {
            self.refresh_exposure_mode().await?;
        }
        Ok(())
    }
}

//! Camera device.
//!
//! Wraps any [`CameraDriver`] and exposes it through a [`CameraHandler`].
//! The device owns the image path: frames from the driver pass through the
//! post-processing chain, are cached as the camera's last image and are
//! published as [`Event::NewImage`].
//!
//! Configuration keys (`[devices.config]`):
//!
//! | key             | default | meaning                                 |
//! |-----------------|---------|-----------------------------------------|
//! | `sensor_width`  | 512     | simulated sensor width                  |
//! | `sensor_height` | 512     | simulated sensor height                 |
//! | `readout_modes` | 3 modes | readout mode descriptions               |
//! | `exposure_ms`   | 10      | initial exposure                        |
//! | `transform`     | none    | base image transform of the light path  |
//! | `triggersource` | none    | handler firing the hardware trigger     |
//! | `triggerline`   | none    | line on the trigger source              |

use crate::config::DeviceDefinition;
use crate::devices::capabilities::{CameraDriver, Roi};
use crate::devices::frame::{Frame, Transform};
use crate::devices::simulated::{SimulatedCameraDriver, DEFAULT_READOUT_MODES};
use crate::devices::{Device, DeviceContext};
use crate::error::AppResult;
use crate::events::{Event, EventBus};
use crate::gui::model::{Control, Widget};
use crate::handlers::camera::{CameraControl, CameraHandler, ExposureMode, PostProcessorChain};
use crate::handlers::{Handler, HandlerRef};
use crate::user_config::UserConfig;
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, PoisonError, RwLock as StdRwLock};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

/// Configuration type string
pub const TYPE_NAME: &str = "simulated_camera";

/// How long enabling may take before it is reported as failed.
pub const ENABLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Camera configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Sensor width in pixels
    pub sensor_width: u32,
    /// Sensor height in pixels
    pub sensor_height: u32,
    /// Readout mode descriptions
    pub readout_modes: Vec<String>,
    /// Initial exposure (ms)
    pub exposure_ms: f64,
    /// Readout time added to each exposure (ms)
    pub readout_ms: f64,
    /// Base transform of this camera's light path
    pub transform: Transform,
    /// Handler that fires this camera's hardware trigger
    pub triggersource: Option<String>,
    /// Line on the trigger source
    pub triggerline: Option<String>,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            sensor_width: 512,
            sensor_height: 512,
            readout_modes: DEFAULT_READOUT_MODES.iter().map(|s| s.to_string()).collect(),
            exposure_ms: 10.0,
            readout_ms: 5.0,
            transform: Transform::default(),
            triggersource: None,
            triggerline: None,
        }
    }
}

/// Build a simulated camera from its configuration.
pub fn from_definition(
    definition: &DeviceDefinition,
    context: &DeviceContext,
) -> AppResult<Arc<dyn Device>> {
    let config: CameraConfig = definition.parse_config()?;
    let driver = SimulatedCameraDriver::with_readout_modes(
        config.sensor_width,
        config.sensor_height,
        config.readout_modes.clone(),
    )
    .with_readout_time(config.readout_ms / 1000.0);
    Ok(Arc::new(CameraDevice::new(
        definition.name.clone(),
        config,
        Arc::new(driver),
        context,
    )))
}

/// Display names for readout modes.
///
/// `CONVENTIONAL ` is shortened to `CONV `, and the ` CHn` channel suffix is
/// dropped unless the modes span at least two channels. No modes at all
/// gives a single `default` entry.
pub fn readout_mode_names(modes: &[(i64, String)]) -> Vec<String> {
    if modes.is_empty() {
        return vec!["default".to_string()];
    }
    let mut channels = std::collections::BTreeSet::new();
    let names: Vec<String> = modes
        .iter()
        .map(|(_, m)| {
            if let Some(ch) = channel_of(m) {
                channels.insert(ch);
            }
            replace_ignore_case(m, "CONVENTIONAL ", "CONV ")
        })
        .collect();
    if channels.len() < 2 {
        names.iter().map(|m| strip_channel(m)).collect()
    } else {
        names
    }
}

fn replace_ignore_case(s: &str, pattern: &str, with: &str) -> String {
    let lower = s.to_lowercase();
    let pat = pattern.to_lowercase();
    let mut out = String::with_capacity(s.len());
    let mut i = 0;
    while let Some(pos) = lower[i..].find(&pat) {
        out.push_str(&s[i..i + pos]);
        out.push_str(with);
        i += pos + pat.len();
    }
    out.push_str(&s[i..]);
    out
}

/// Byte range of a ` CH<digits>` suffix token, case-insensitive.
fn channel_span(s: &str) -> Option<(usize, usize)> {
    let lower = s.to_lowercase();
    let mut from = 0;
    while let Some(pos) = lower[from..].find(" ch") {
        let start = from + pos;
        let digits = lower[start + 3..]
            .chars()
            .take_while(|c| c.is_ascii_digit())
            .count();
        if digits > 0 {
            return Some((start, start + 3 + digits));
        }
        from = start + 3;
    }
    None
}

fn channel_of(s: &str) -> Option<String> {
    channel_span(s).map(|(a, b)| s[a + 3..b].to_string())
}

fn strip_channel(s: &str) -> String {
    match channel_span(s) {
        Some((a, b)) => format!("{}{}", &s[..a], &s[b..]),
        None => s.to_string(),
    }
}

/// Whether user defaults are waiting to be sent to the hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Defaults {
    None,
    Pending,
    Sent,
}

/// State shared between the device, its handler and the frame listener.
struct CameraShared {
    name: String,
    driver: Arc<dyn CameraDriver>,
    bus: EventBus,
    user_config: UserConfig,
    post_processors: PostProcessorChain,
    base_transform: Transform,
    enabled: AtomicBool,
    settings: RwLock<BTreeMap<String, Value>>,
    cached_settings: RwLock<BTreeMap<String, Value>>,
    defaults: RwLock<Defaults>,
    modes: RwLock<Vec<(i64, String)>>,
    last_image: StdRwLock<Option<Arc<Frame>>>,
}

impl CameraShared {
    /// Optionally push settings, then re-read all of them and announce the change.
    async fn update_settings(&self, settings: Option<BTreeMap<String, Value>>) -> Result<()> {
        if let Some(settings) = settings {
            self.driver.update_settings(settings).await?;
        }
        let all = self.driver.all_settings().await?;
        *self.settings.write().await = all;
        self.bus.publish(Event::SettingsChanged {
            device: self.name.clone(),
        });
        Ok(())
    }

    async fn set_any_defaults(&self) {
        if *self.defaults.read().await != Defaults::Pending {
            return;
        }
        let settings = self.settings.read().await.clone();
        match self.driver.update_settings(settings).await {
            Ok(()) => *self.defaults.write().await = Defaults::Sent,
            Err(e) => tracing::warn!(camera = %self.name, error = %e, "could not apply user defaults"),
        }
    }

    async fn update_transform(&self, objective: Transform) -> Result<()> {
        self.driver
            .set_transform(self.base_transform.combine(objective))
            .await?;
        self.update_settings(None).await
    }

    /// Handle one delivery from the driver.
    async fn receive_data(&self, data: Result<Frame>) -> Result<()> {
        match data {
            Ok(frame) => {
                let frame = Arc::new(self.post_processors.apply(frame));
                *self
                    .last_image
                    .write()
                    .unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&frame));
                self.bus.publish(Event::NewImage {
                    camera: self.name.clone(),
                    frame,
                    timestamp: Utc::now(),
                });
                Ok(())
            }
            Err(e) => {
                // Keep consumers in step: a dropped frame still yields an image.
                let (w, h) = self.image_size().await.unwrap_or((0, 0));
                self.bus.publish(Event::NewImage {
                    camera: self.name.clone(),
                    frame: Arc::new(Frame::zeros(w, h)),
                    timestamp: Utc::now(),
                });
                Err(e.context(format!("camera '{}' dropped a frame", self.name)))
            }
        }
    }
}

#[async_trait]
impl CameraControl for CameraShared {
    async fn set_enabled(&self, enabled: bool) -> Result<bool> {
        if !enabled {
            if self.enabled.swap(false, Ordering::SeqCst) {
                self.driver.disable().await?;
            }
            return Ok(false);
        }
        if self.enabled.load(Ordering::SeqCst) {
            return Ok(true);
        }

        self.set_any_defaults().await;
        tokio::time::timeout(ENABLE_TIMEOUT, self.driver.enable())
            .await
            .map_err(|_| anyhow!("camera did not enable within {:?}", ENABLE_TIMEOUT))??;
        let now_enabled = self.driver.is_enabled().await?;
        self.enabled.store(now_enabled, Ordering::SeqCst);
        self.update_settings(None).await?;
        Ok(now_enabled)
    }

    async fn exposure_time_ms(&self) -> Result<f64> {
        Ok(self.driver.get_exposure().await? * 1000.0)
    }

    async fn set_exposure_time_ms(&self, ms: f64) -> Result<()> {
        self.driver.set_exposure(ms / 1000.0).await
    }

    async fn time_between_exposures_ms(&self) -> Result<f64> {
        let cycle = self.driver.cycle_time().await? * 1000.0;
        let exposure = self.driver.get_exposure().await? * 1000.0;
        Ok(cycle - exposure)
    }

    async fn image_size(&self) -> Result<(u32, u32)> {
        let roi = self.driver.roi().await?;
        let binning = self.driver.binning().await?;
        let size = (roi.width / binning.h.max(1), roi.height / binning.v.max(1));
        Ok(self.post_processors.output_shape(size))
    }

    async fn roi(&self) -> Result<Roi> {
        self.driver.roi().await
    }

    async fn set_roi(&self, roi: Roi) -> Result<()> {
        if !self.driver.set_roi(roi).await? {
            tracing::warn!(camera = %self.name, ?roi, "could not set ROI");
        }
        Ok(())
    }

    fn sensor_shape(&self) -> (u32, u32) {
        self.driver.sensor_shape()
    }

    async fn soft_trigger(&self) -> Result<()> {
        if self.enabled.load(Ordering::SeqCst) {
            self.driver.soft_trigger().await?;
        }
        Ok(())
    }

    async fn exposure_mode(&self) -> Result<ExposureMode> {
        let (trigger_type, mode) = self.driver.trigger().await?;
        ExposureMode::from_trigger(trigger_type, mode).ok_or_else(|| {
            anyhow!(
                "unsupported trigger combination {:?}/{:?}",
                trigger_type,
                mode
            )
        })
    }

    async fn prepare_for_experiment(&self) -> Result<()> {
        let current = self.settings.read().await.clone();
        self.cached_settings.write().await.extend(current);
        Ok(())
    }

    fn last_image(&self) -> Option<Arc<Frame>> {
        self.last_image
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// A camera and its handler.
pub struct CameraDevice {
    config: CameraConfig,
    shared: Arc<CameraShared>,
    handler: OnceLock<Arc<CameraHandler>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl CameraDevice {
    /// Wrap `driver` as a device called `name`.
    pub fn new(
        name: String,
        config: CameraConfig,
        driver: Arc<dyn CameraDriver>,
        context: &DeviceContext,
    ) -> Self {
        let shared = Arc::new(CameraShared {
            name,
            driver,
            bus: context.bus.clone(),
            user_config: context.user_config.clone(),
            post_processors: PostProcessorChain::new(),
            base_transform: config.transform,
            enabled: AtomicBool::new(false),
            settings: RwLock::new(BTreeMap::new()),
            cached_settings: RwLock::new(BTreeMap::new()),
            defaults: RwLock::new(Defaults::None),
            modes: RwLock::new(Vec::new()),
            last_image: StdRwLock::new(None),
        });
        Self {
            config,
            shared,
            handler: OnceLock::new(),
            listener: Mutex::new(None),
        }
    }

    /// The camera handler, once created
    pub fn handler(&self) -> Option<&Arc<CameraHandler>> {
        self.handler.get()
    }

    /// Post-processing chain of this camera
    pub fn post_processors(&self) -> &PostProcessorChain {
        &self.shared.post_processors
    }

    /// Snapshot of the last-read settings
    pub async fn settings(&self) -> BTreeMap<String, Value> {
        self.shared.settings.read().await.clone()
    }

    /// Readout mode display names
    pub async fn mode_names(&self) -> Vec<String> {
        readout_mode_names(&self.shared.modes.read().await)
    }

    /// Select a readout mode by index into the mode list.
    pub async fn set_readout_mode(&self, index: usize) -> Result<()> {
        let modes = self.shared.modes.read().await.clone();
        if modes.len() <= 1 {
            return Ok(());
        }
        let (value, _) = modes
            .get(index)
            .ok_or_else(|| anyhow!("no readout mode {}", index))?;
        let mut update = BTreeMap::new();
        update.insert("readout mode".to_string(), Value::from(*value));
        self.shared.update_settings(Some(update)).await
    }

    /// Set the gain setting.
    pub async fn set_gain(&self, gain: i64) -> Result<()> {
        if self.shared.driver.describe_setting("gain").is_none() {
            bail!("camera '{}' has no gain setting", self.shared.name);
        }
        let mut update = BTreeMap::new();
        update.insert("gain".to_string(), Value::from(gain));
        self.shared.update_settings(Some(update)).await
    }

    /// Apply settings and refresh the cached copy.
    pub async fn update_settings(&self, settings: BTreeMap<String, Value>) -> Result<()> {
        self.shared.update_settings(Some(settings)).await
    }

    /// Feed one driver delivery through the image path.
    pub async fn receive_data(&self, data: Result<Frame>) -> Result<()> {
        self.shared.receive_data(data).await
    }

    async fn cleanup_after_experiment(&self) -> Result<()> {
        let gap = self.shared.time_between_exposures_ms().await.unwrap_or(0.0);
        let gap = Duration::try_from_secs_f64(gap / 1000.0).unwrap_or(Duration::ZERO);
        tokio::time::sleep(gap).await;
        if self.shared.enabled.load(Ordering::SeqCst) {
            let cached = self.shared.cached_settings.read().await.clone();
            self.shared.update_settings(Some(cached)).await?;
            self.shared.driver.enable().await?;
        }
        if let Some(handler) = self.handler.get() {
            handler.cleanup_after_experiment().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Device for CameraDevice {
    fn name(&self) -> &str {
        &self.shared.name
    }

    fn type_name(&self) -> &'static str {
        TYPE_NAME
    }

    async fn initialize(&self) -> Result<()> {
        let shared = &self.shared;
        if let Err(e) = shared
            .driver
            .set_exposure(self.config.exposure_ms / 1000.0)
            .await
        {
            tracing::warn!(camera = %shared.name, error = %e, "initial exposure rejected");
        }
        if let Err(e) = shared.update_settings(None).await {
            tracing::warn!(camera = %shared.name, error = %e, "could not read settings");
        }

        let modes = match shared
            .driver
            .describe_setting("readout mode")
            .map(|d| d.kind)
        {
            Some(crate::devices::capabilities::SettingKind::Enum(values)) => values,
            _ => Vec::new(),
        };
        *shared.modes.write().await = modes;

        if shared.base_transform != Transform::default() {
            shared.driver.set_transform(shared.base_transform).await?;
        }

        if let Some(mut rx) = shared.driver.take_frame_receiver().await {
            let listener_shared = Arc::clone(shared);
            let task = tokio::spawn(async move {
                while let Some(data) = rx.recv().await {
                    if let Err(e) = listener_shared.receive_data(data).await {
                        tracing::error!(error = %e, "image acquisition error");
                    }
                }
            });
            *self.listener.lock().await = Some(task);
        }
        Ok(())
    }

    fn create_handlers(&self) -> Result<Vec<HandlerRef>> {
        let handler = self.handler.get_or_init(|| {
            let control: Arc<dyn CameraControl> = self.shared.clone();
            Arc::new(
                CameraHandler::new(
                    self.shared.name.clone(),
                    "universal camera",
                    control,
                    self.shared.post_processors.clone(),
                    self.shared.bus.clone(),
                )
                .with_trigger(
                    self.config.triggersource.clone(),
                    self.config.triggerline.clone(),
                ),
            )
        });
        Ok(vec![HandlerRef::Camera(Arc::clone(handler))])
    }

    async fn finalize_initialization(
        &self,
        handlers: &crate::handlers::HandlerDirectory,
    ) -> Result<()> {
        if let Some(source) = &self.config.triggersource {
            if handlers.get(source).is_none() {
                tracing::warn!(camera = %self.shared.name, trigger_source = %source, "trigger source handler not found");
            }
        }

        // The starting objective is chosen before anything listens to the bus.
        if let Some(objective) = handlers
            .of_kind(crate::handlers::HandlerKind::Objective)
            .first()
            .and_then(HandlerRef::as_objective)
        {
            self.shared.update_transform(objective.transform()).await?;
        }

        let key = format!("{}_SETTINGS", self.shared.name);
        let defaults: Option<BTreeMap<String, Value>> = self.shared.user_config.get(&key);
        match defaults {
            None => *self.shared.defaults.write().await = Defaults::None,
            Some(defaults) => {
                self.shared.update_settings(Some(defaults)).await?;
                *self.shared.defaults.write().await = Defaults::Pending;
                self.shared.set_any_defaults().await;
            }
        }
        Ok(())
    }

    async fn on_event(&self, event: &Event) -> Result<()> {
        match event {
            Event::CleanupAfterExperiment => self.cleanup_after_experiment().await,
            Event::ObjectiveChange { transform, .. } => {
                self.shared.update_transform(*transform).await
            }
            _ => Ok(()),
        }
    }

    async fn controls(&self) -> Vec<Control> {
        let settings = self.settings().await;
        let mut controls = Vec::new();

        let selected = settings
            .get("readout mode")
            .and_then(Value::as_u64)
            .unwrap_or(0) as usize;
        controls.push(Control::new(
            self.name(),
            "readout_mode",
            "Readout mode",
            Widget::Choice {
                options: self.mode_names().await,
                selected,
            },
        ));

        if let Some(desc) = self.shared.driver.describe_setting("gain") {
            let (min, max) = match desc.kind {
                crate::devices::capabilities::SettingKind::Int { min, max } => {
                    (min as f64, max as f64)
                }
                _ => (0.0, 0.0),
            };
            controls.push(Control::new(
                self.name(),
                "gain",
                "Gain",
                Widget::Number {
                    value: settings.get("gain").and_then(Value::as_f64).unwrap_or(0.0),
                    min,
                    max,
                    unit: String::new(),
                },
            ));
        }

        if let Some(handler) = self.handler.get() {
            if let Ok(ms) = handler.exposure_time_ms().await {
                controls.push(Control::new(
                    handler.name(),
                    "exposure",
                    "Exposure",
                    Widget::Number {
                        value: ms,
                        min: 0.0,
                        max: 10_000.0,
                        unit: "ms".into(),
                    },
                ));
            }
        }
        controls
    }

    async fn invoke(&self, action: &str, value: Option<&str>) -> Result<String> {
        let value = value.ok_or_else(|| anyhow!("action '{}' needs a value", action))?;
        match action {
            "readout_mode" => {
                let index: usize = value.parse()?;
                self.set_readout_mode(index).await?;
                Ok(format!("readout mode set to {}", index))
            }
            "gain" => {
                let gain: i64 = value.parse()?;
                self.set_gain(gain).await?;
                Ok(format!("gain set to {}", gain))
            }
            other => bail!("camera '{}' has no action '{}'", self.name(), other),
        }
    }

    async fn shutdown(&self) -> Result<()> {
        if let Some(handler) = self.handler.get() {
            if handler.is_enabled() {
                handler.set_enabled(false).await?;
            }
        }
        if let Some(task) = self.listener.lock().await.take() {
            task.abort();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CockpitError;
    use crate::handlers::camera::PostProcessor;
    use crate::handlers::{HandlerDirectory, HandlerState};
    use serde_json::json;

    fn modes(names: &[&str]) -> Vec<(i64, String)> {
        names
            .iter()
            .enumerate()
            .map(|(i, n)| (i as i64, n.to_string()))
            .collect()
    }

    async fn camera(user_config: UserConfig) -> (CameraDevice, Arc<CameraHandler>, EventBus) {
        let bus = EventBus::default();
        let context = DeviceContext::new(bus.clone(), user_config);
        let config = CameraConfig {
            sensor_width: 64,
            sensor_height: 32,
            exposure_ms: 1.0,
            ..Default::default()
        };
        let driver = SimulatedCameraDriver::with_readout_modes(64, 32, config.readout_modes.clone())
            .with_readout_time(0.002);
        let device = CameraDevice::new("cam".into(), config, Arc::new(driver), &context);
        device.initialize().await.unwrap();
        let handler = device.create_handlers().unwrap()[0]
            .as_camera()
            .cloned()
            .unwrap();
        (device, handler, bus)
    }

    #[test]
    fn mode_names_single_channel() {
        let names = readout_mode_names(&modes(&["CONVENTIONAL 1MHz CH1", "EM 10MHz CH1"]));
        assert_eq!(names, vec!["CONV 1MHz", "EM 10MHz"]);
    }

    #[test]
    fn mode_names_keep_channels_when_several() {
        let names = readout_mode_names(&modes(&["EM 10MHz CH1", "EM 10MHz CH2"]));
        assert_eq!(names, vec!["EM 10MHz CH1", "EM 10MHz CH2"]);
        assert_eq!(readout_mode_names(&[]), vec!["default"]);
    }

    #[tokio::test]
    async fn exposure_is_milliseconds_at_handler() {
        let (_device, handler, _bus) = camera(UserConfig::in_memory()).await;
        handler.set_exposure_time_ms(20.0).await.unwrap();
        assert!((handler.exposure_time_ms().await.unwrap() - 20.0).abs() < 1e-9);
        let gap = handler.time_between_exposures_ms().await.unwrap();
        assert!((gap - 2.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn unrepresentable_exposure_is_refused_by_handler() {
        let (_device, handler, _bus) = camera(UserConfig::in_memory()).await;
        handler.set_exposure_time_ms(20.0).await.unwrap();
        for ms in [1e300, f64::INFINITY, f64::NAN, -5.0] {
            let err = handler.set_exposure_time_ms(ms).await.unwrap_err();
            assert!(matches!(err, CockpitError::Device { .. }), "{}", ms);
        }
        assert!((handler.exposure_time_ms().await.unwrap() - 20.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn image_size_follows_post_processors() {
        let (device, handler, _bus) = camera(UserConfig::in_memory()).await;
        assert_eq!(handler.image_size().await.unwrap(), (64, 32));
        device.post_processors().add(PostProcessor::new(
            "half",
            100,
            |f: Frame| f.split_halves().0,
            |(w, h)| (w / 2, h),
        ));
        assert_eq!(handler.image_size().await.unwrap(), (32, 32));
    }

    #[tokio::test]
    async fn trigger_publishes_processed_image() {
        let (device, handler, bus) = camera(UserConfig::in_memory()).await;
        device.post_processors().add(PostProcessor::new(
            "half",
            100,
            |f: Frame| f.split_halves().0,
            |(w, h)| (w / 2, h),
        ));
        assert_eq!(handler.set_enabled(true).await.unwrap(), HandlerState::Enabled);
        assert_eq!(handler.exposure_mode(), ExposureMode::TriggerSoft);

        let h = Arc::clone(&handler);
        let event = bus
            .execute_and_wait_for(
                |e| e.is_image_from("cam"),
                || async move { h.soft_trigger().await },
                Duration::from_secs(2),
                "image",
            )
            .await
            .unwrap();
        match event {
            Event::NewImage { frame, .. } => assert_eq!(frame.shape(), (32, 32)),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(handler.last_image().is_some());
    }

    #[tokio::test]
    async fn dropped_frame_publishes_zero_image() {
        let (device, _handler, bus) = camera(UserConfig::in_memory()).await;
        let mut rx = bus.subscribe();
        let result = device.receive_data(Err(anyhow!("timeout"))).await;
        assert!(result.is_err());
        match rx.recv().await.unwrap() {
            Event::NewImage { frame, .. } => {
                assert_eq!(frame.shape(), (64, 32));
                assert_eq!(frame.mean(), 0.0);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn user_defaults_applied_on_finalize() {
        let user_config = UserConfig::in_memory();
        user_config
            .set_value("cam_SETTINGS", json!({"gain": 7}))
            .unwrap();
        let (device, _handler, _bus) = camera(user_config).await;
        device
            .finalize_initialization(&HandlerDirectory::new())
            .await
            .unwrap();
        assert_eq!(device.settings().await.get("gain"), Some(&json!(7)));
    }

    #[tokio::test]
    async fn cleanup_restores_cached_settings() {
        let (device, handler, _bus) = camera(UserConfig::in_memory()).await;
        handler.set_enabled(true).await.unwrap();
        device.set_gain(3).await.unwrap();
        handler.prepare_for_experiment().await.unwrap();

        device.set_gain(50).await.unwrap();
        device.on_event(&Event::CleanupAfterExperiment).await.unwrap();
        assert_eq!(device.settings().await.get("gain"), Some(&json!(3)));
    }

    #[tokio::test]
    async fn readout_mode_action() {
        let (device, _handler, _bus) = camera(UserConfig::in_memory()).await;
        device.invoke("readout_mode", Some("2")).await.unwrap();
        assert_eq!(device.settings().await.get("readout mode"), Some(&json!(2)));
        assert!(device.invoke("readout_mode", Some("9")).await.is_err());
        assert!(device.invoke("warp", Some("1")).await.is_err());
    }
}

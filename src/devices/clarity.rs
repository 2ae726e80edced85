//! Spinning-disk optical sectioning unit.
//!
//! The unit splits the image onto two halves of the camera sensor. Once a
//! filter position has been calibrated from a reference image, sectioning
//! mode installs a post-processor on the associated camera that combines the
//! two halves into one sectioned image of half the width.
//!
//! Required configuration:
//!
//! ```toml
//! [[devices]]
//! name = "clarity"
//! type = "clarity"
//! [devices.config]
//! camera = "camera"
//! "filter cubes" = """
//! DAPI
//! GFP
//! dsRed
//! Cy5
//! """
//! ```
//!
//! While enabled, the unit is polled once per `poll_interval_ms` and its
//! handler state reflects the hardware: `Busy` while the disk or turret is
//! moving or the door is open, `Error` when the unit does not answer.

use crate::config::DeviceDefinition;
use crate::devices::capabilities::Switchable;
use crate::devices::frame::Frame;
use crate::devices::simulated::SimulatedClarity;
use crate::devices::{Device, DeviceContext};
use crate::error::{AppResult, CockpitError};
use crate::events::{Event, EventBus};
use crate::gui::model::{Control, Widget};
use crate::handlers::camera::{CameraHandler, PostProcessor};
use crate::handlers::generic::EnableControl;
use crate::handlers::{GenericHandler, Handler, HandlerDirectory, HandlerRef, HandlerState};
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Configuration type string
pub const TYPE_NAME: &str = "clarity";

/// Priority of the sectioning post-processor.
pub const PRIORITY_SECTIONING: i32 = 100;

/// Name of the sectioning post-processor on the camera.
pub const SECTIONING_PROCESSOR: &str = "clarity sectioning";

/// Number of filter turret positions.
pub const FILTER_POSITIONS: usize = 4;

/// Disk position, i.e. sectioning strength.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiskSectioning {
    /// Low sectioning
    Low,
    /// Medium sectioning
    Mid,
    /// High sectioning
    High,
    /// Disk out of the light path
    Ext,
}

impl DiskSectioning {
    /// All positions in disk order
    pub const ALL: [DiskSectioning; 4] = [
        DiskSectioning::Low,
        DiskSectioning::Mid,
        DiskSectioning::High,
        DiskSectioning::Ext,
    ];

    /// Display name
    pub fn label(self) -> &'static str {
        match self {
            DiskSectioning::Low => "LOW",
            DiskSectioning::Mid => "MID",
            DiskSectioning::High => "HIGH",
            DiskSectioning::Ext => "EXT",
        }
    }
}

/// Capability: Sectioning Unit
#[async_trait]
pub trait ClarityUnit: Switchable {
    /// Serial number
    async fn id(&self) -> Result<String>;

    /// Disk position; `None` while moving
    async fn disk_position(&self) -> Result<Option<DiskSectioning>>;

    /// Move the disk
    async fn set_disk_position(&self, position: DiskSectioning) -> Result<()>;

    /// Filter turret position; `None` while moving
    async fn filter_position(&self) -> Result<Option<usize>>;

    /// Move the filter turret
    async fn set_filter_position(&self, position: usize) -> Result<()>;

    /// Whether the service door is closed
    async fn door_closed(&self) -> Result<bool>;

    /// Calibration LED state
    async fn calibration_led(&self) -> Result<bool>;

    /// Switch the calibration LED
    async fn set_calibration_led(&self, on: bool) -> Result<()>;
}

/// Filter cube labels: a newline-separated string or an array.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum FilterCubes {
    /// One label per line
    Lines(String),
    /// Explicit list
    List(Vec<String>),
}

impl FilterCubes {
    /// Labels with blank entries removed
    pub fn labels(&self) -> Vec<String> {
        let raw: Vec<String> = match self {
            FilterCubes::Lines(s) => s.lines().map(str::to_string).collect(),
            FilterCubes::List(v) => v.clone(),
        };
        raw.into_iter()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect()
    }
}

/// Clarity configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ClarityConfig {
    /// Labels of the four turret positions
    #[serde(rename = "filter cubes", alias = "filter_cubes", default)]
    pub filter_cubes: Option<FilterCubes>,
    /// Camera imaging through the unit
    #[serde(default)]
    pub camera: Option<String>,
    /// Status poll period (ms)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

fn default_poll_interval() -> u64 {
    1000
}

/// Build a simulated sectioning unit from its configuration.
pub fn from_definition(
    definition: &DeviceDefinition,
    context: &DeviceContext,
) -> AppResult<Arc<dyn Device>> {
    let config: ClarityConfig = definition.parse_config()?;
    let unit = Arc::new(SimulatedClarity::new(
        format!("SIM-{}", definition.name),
        Duration::from_millis(50),
    ));
    Ok(Arc::new(ClarityDevice::new(
        definition.name.clone(),
        config,
        unit,
        context.bus.clone(),
    )?))
}

/// Calibration of one filter position.
///
/// Stores per-row intensity ratios between the two sensor halves, which are
/// the deformation data that can be exported.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SectioningProcessor {
    row_gain: Vec<f64>,
}

impl SectioningProcessor {
    /// Calibrate from a reference image of a uniform sample.
    pub fn calibrate(reference: &Frame) -> Result<Self> {
        if reference.width < 2 || reference.height == 0 {
            bail!("reference image too small to calibrate");
        }
        let (left, right) = reference.split_halves();
        let w = left.width as usize;
        let row_gain = left
            .pixels
            .chunks(w)
            .zip(right.pixels.chunks(w))
            .map(|(l, r)| {
                let l: f64 = l.iter().map(|&v| v as f64).sum();
                let r: f64 = r.iter().map(|&v| v as f64).sum();
                if r > 0.0 {
                    l / r
                } else {
                    1.0
                }
            })
            .collect();
        Ok(Self { row_gain })
    }

    /// Combine the halves of `frame` into a sectioned image.
    pub fn process(&self, frame: Frame) -> Frame {
        let (left, right) = frame.split_halves();
        let w = left.width as usize;
        if w == 0 {
            return left;
        }
        let pixels = left
            .pixels
            .chunks(w)
            .zip(right.pixels.chunks(w))
            .enumerate()
            .flat_map(|(row, (l, r))| {
                let gain = self.row_gain.get(row).copied().unwrap_or(1.0);
                l.iter()
                    .zip(r.iter())
                    .map(move |(&a, &b)| {
                        (a as f64 - b as f64 * gain).abs().min(u16::MAX as f64) as u16
                    })
                    .collect::<Vec<_>>()
            })
            .collect();
        Frame {
            width: left.width,
            height: left.height,
            pixels,
        }
    }

    /// Deformation data
    pub fn deforms(&self) -> &[f64] {
        &self.row_gain
    }
}

/// Calibration state read by the camera post-processor.
#[derive(Default)]
struct SectioningState {
    processors: RwLock<[Option<Arc<SectioningProcessor>>; FILTER_POSITIONS]>,
    filter: RwLock<Option<usize>>,
}

impl SectioningState {
    fn processor_for_current(&self) -> Option<Arc<SectioningProcessor>> {
        let filter = (*self.filter.read().unwrap_or_else(PoisonError::into_inner))?;
        self.processors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(filter)
            .cloned()
            .flatten()
    }

    fn is_calibrated(&self, position: Option<usize>) -> bool {
        position.map_or(false, |p| {
            self.processors
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(p)
                .map_or(false, Option::is_some)
        })
    }

    fn section(&self, frame: Frame) -> Frame {
        match self.processor_for_current() {
            Some(p) => p.process(frame),
            // Turret moving: keep the promised shape.
            None => frame.split_halves().0,
        }
    }
}

struct ClarityShared {
    name: String,
    unit: Arc<dyn ClarityUnit>,
    state: Arc<SectioningState>,
    handler: OnceLock<Arc<GenericHandler>>,
    camera: OnceLock<Arc<CameraHandler>>,
}

impl ClarityShared {
    async fn query_state(&self) -> Result<HandlerState> {
        let mut state = if self.unit.is_enabled().await? {
            HandlerState::Enabled
        } else {
            HandlerState::Disabled
        };
        let disk = self.unit.disk_position().await?;
        let filter = self.unit.filter_position().await?;
        let door_closed = self.unit.door_closed().await?;
        *self
            .state
            .filter
            .write()
            .unwrap_or_else(PoisonError::into_inner) = filter;
        if disk.is_none() || filter.is_none() || !door_closed {
            state = HandlerState::Busy;
        }
        Ok(state)
    }

    /// Poll the hardware and publish the resulting handler state.
    async fn poll_status(&self) -> HandlerState {
        let state = match self.query_state().await {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!(device = %self.name, error = %e, "status query failed");
                HandlerState::Error
            }
        };
        if let Some(handler) = self.handler.get() {
            handler.core().set_state(state);
        }

        let filter = *self
            .state
            .filter
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        if state != HandlerState::Error && !self.state.is_calibrated(filter) && self.sectioning()
        {
            // Turret moved to an uncalibrated position while sectioning.
            if let Err(e) = self.set_sectioning(false) {
                tracing::warn!(device = %self.name, error = %e, "could not stop sectioning");
            }
        }
        state
    }

    fn camera(&self) -> Result<&Arc<CameraHandler>> {
        self.camera
            .get()
            .ok_or_else(|| anyhow!("camera for '{}' is not available", self.name))
    }

    fn sectioning(&self) -> bool {
        self.camera
            .get()
            .map_or(false, |c| c.post_processors().contains(SECTIONING_PROCESSOR))
    }

    fn set_sectioning(&self, on: bool) -> Result<()> {
        let camera = self.camera()?;
        let chain = camera.post_processors();
        if on {
            if chain.contains(SECTIONING_PROCESSOR) {
                return Ok(());
            }
            let filter = *self
                .state
                .filter
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            if !self.state.is_calibrated(filter) {
                bail!("current filter position is not calibrated");
            }
            let state = Arc::clone(&self.state);
            chain.add(PostProcessor::new(
                SECTIONING_PROCESSOR,
                PRIORITY_SECTIONING,
                move |frame| state.section(frame),
                |(w, h)| (w / 2, h),
            ));
        } else if chain.contains(SECTIONING_PROCESSOR) {
            chain.remove(PRIORITY_SECTIONING, Some(SECTIONING_PROCESSOR))?;
        }
        Ok(())
    }
}

struct ClarityEnable {
    unit: Arc<dyn ClarityUnit>,
}

#[async_trait]
impl EnableControl for ClarityEnable {
    async fn set_enabled(&self, enabled: bool) -> Result<bool> {
        if enabled {
            self.unit.enable().await?;
        } else {
            self.unit.disable().await?;
        }
        self.unit.is_enabled().await
    }

    async fn is_enabled(&self) -> Result<bool> {
        self.unit.is_enabled().await
    }
}

/// Optical sectioning unit attached to one camera.
pub struct ClarityDevice {
    filter_cubes: Vec<String>,
    camera_name: String,
    poll_interval: Duration,
    bus: EventBus,
    shared: Arc<ClarityShared>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl ClarityDevice {
    /// Validate the configuration and wrap `unit`.
    pub fn new(
        name: String,
        config: ClarityConfig,
        unit: Arc<dyn ClarityUnit>,
        bus: EventBus,
    ) -> AppResult<Self> {
        let missing = |key: &str| {
            CockpitError::Configuration(format!(
                "Missing '{}' key in configuration of device '{}'.",
                key, name
            ))
        };
        let filter_cubes = config
            .filter_cubes
            .as_ref()
            .ok_or_else(|| missing("filter cubes"))?
            .labels();
        let camera_name = config.camera.clone().ok_or_else(|| missing("camera"))?;
        if filter_cubes.len() != FILTER_POSITIONS {
            return Err(CockpitError::Configuration(format!(
                "Wrong value of key 'filter cubes' of device '{}'. Expected a list of four labels, each on a new line.",
                name
            )));
        }
        Ok(Self {
            filter_cubes,
            camera_name,
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(10)),
            bus,
            shared: Arc::new(ClarityShared {
                name,
                unit,
                state: Arc::new(SectioningState::default()),
                handler: OnceLock::new(),
                camera: OnceLock::new(),
            }),
            timer: Mutex::new(None),
        })
    }

    /// Filter cube labels in turret order
    pub fn filter_cubes(&self) -> &[String] {
        &self.filter_cubes
    }

    /// Poll the unit once and publish its state.
    pub async fn poll_status(&self) -> HandlerState {
        self.shared.poll_status().await
    }

    /// Whether `position` has a calibration
    pub fn is_calibrated(&self, position: usize) -> bool {
        self.shared.state.is_calibrated(Some(position))
    }

    /// Whether sectioning is active on the camera
    pub fn sectioning(&self) -> bool {
        self.shared.sectioning()
    }

    /// Calibrate the current filter position from the camera's last image.
    pub async fn calibrate(&self) -> Result<usize> {
        let camera = self.shared.camera()?;
        let image = camera
            .last_image()
            .ok_or_else(|| anyhow!("No image data found for the associated camera."))?;
        let handler = self.shared.handler.get();
        if let Some(h) = handler {
            h.core().set_state(HandlerState::Busy);
        }

        let result = async {
            let position = tokio::time::timeout(Duration::from_secs(10), async {
                loop {
                    if let Some(p) = self.shared.unit.filter_position().await? {
                        return Ok::<usize, anyhow::Error>(p);
                    }
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
            })
            .await
            .map_err(|_| anyhow!("filter turret did not settle"))??;
            let processor = SectioningProcessor::calibrate(&image)?;
            {
                let mut processors = self
                    .shared
                    .state
                    .processors
                    .write()
                    .unwrap_or_else(PoisonError::into_inner);
                let Some(slot) = processors.get_mut(position) else {
                    bail!("unit reports filter position {} out of range", position);
                };
                *slot = Some(Arc::new(processor));
            }
            *self
                .shared
                .state
                .filter
                .write()
                .unwrap_or_else(PoisonError::into_inner) = Some(position);
            Ok::<usize, anyhow::Error>(position)
        }
        .await;

        if let Some(h) = handler {
            h.core().set_state(if result.is_ok() {
                HandlerState::Enabled
            } else {
                HandlerState::Error
            });
        }
        result
    }

    /// Turn sectioning mode on or off.
    pub fn set_sectioning(&self, on: bool) -> Result<()> {
        self.shared.set_sectioning(on)
    }

    /// Deformation data per calibrated filter cube label.
    pub fn deforms(&self) -> Result<BTreeMap<String, Vec<f64>>> {
        let processors = self
            .shared
            .state
            .processors
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let deforms: BTreeMap<String, Vec<f64>> = processors
            .iter()
            .enumerate()
            .filter_map(|(i, p)| {
                p.as_ref()
                    .map(|p| (self.filter_cubes[i].clone(), p.deforms().to_vec()))
            })
            .collect();
        if deforms.is_empty() {
            bail!("No deformation maps found. Ensure at least one of the channels is calibrated.");
        }
        Ok(deforms)
    }

    /// Write deformation data as JSON.
    pub fn save_deforms(&self, path: &Path) -> Result<()> {
        let deforms = self.deforms()?;
        let json = serde_json::to_string_pretty(&deforms)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, json)?;
        tracing::info!(device = %self.shared.name, ?path, "saved deformation maps");
        Ok(())
    }

    async fn start_timer(&self) {
        let mut timer = self.timer.lock().await;
        if timer.as_ref().map_or(false, |t| !t.is_finished()) {
            return;
        }
        let shared = Arc::clone(&self.shared);
        let period = self.poll_interval;
        *timer = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                shared.poll_status().await;
            }
        }));
    }

    async fn stop_timer(&self) {
        if let Some(task) = self.timer.lock().await.take() {
            task.abort();
        }
    }

    fn parse_filter(&self, value: &str) -> Result<usize> {
        if let Ok(i) = value.parse::<usize>() {
            if i < FILTER_POSITIONS {
                return Ok(i);
            }
        }
        self.filter_cubes
            .iter()
            .position(|l| l.eq_ignore_ascii_case(value))
            .ok_or_else(|| anyhow!("unknown filter cube '{}'", value))
    }
}

fn parse_on_off(value: Option<&str>) -> Result<bool> {
    match value.map(|v| v.trim().to_lowercase()).as_deref() {
        Some("on") | Some("true") | Some("1") => Ok(true),
        Some("off") | Some("false") | Some("0") => Ok(false),
        other => bail!("expected on/off, got {:?}", other),
    }
}

#[async_trait]
impl Device for ClarityDevice {
    fn name(&self) -> &str {
        &self.shared.name
    }

    fn type_name(&self) -> &'static str {
        TYPE_NAME
    }

    async fn initialize(&self) -> Result<()> {
        let id = self.shared.unit.id().await?;
        tracing::info!(device = %self.shared.name, serial = %id, "sectioning unit connected");
        Ok(())
    }

    fn create_handlers(&self) -> Result<Vec<HandlerRef>> {
        let handler = self.shared.handler.get_or_init(|| {
            Arc::new(GenericHandler::new(
                self.shared.name.clone(),
                "Aurox Clarity",
                Arc::new(ClarityEnable {
                    unit: Arc::clone(&self.shared.unit),
                }),
                self.bus.clone(),
            ))
        });
        Ok(vec![HandlerRef::Generic(Arc::clone(handler))])
    }

    async fn finalize_initialization(&self, handlers: &HandlerDirectory) -> Result<()> {
        let camera = handlers.camera(&self.camera_name).ok_or_else(|| {
            anyhow!(
                "Couldn't find camera handler with name '{}'.",
                self.camera_name
            )
        })?;
        let _ = self.shared.camera.set(camera);
        Ok(())
    }

    async fn on_event(&self, event: &Event) -> Result<()> {
        if let Event::DeviceStatus { handler, state } = event {
            if handler == self.name() {
                if *state == HandlerState::Disabled {
                    self.stop_timer().await;
                } else {
                    self.start_timer().await;
                }
            }
        }
        Ok(())
    }

    async fn controls(&self) -> Vec<Control> {
        let unit = &self.shared.unit;
        let name = self.name().to_string();
        let serial = unit.id().await.unwrap_or_else(|_| "?".into());
        let disk = unit.disk_position().await.ok().flatten();
        let filter = unit.filter_position().await.ok().flatten();
        let led = unit.calibration_led().await.unwrap_or(false);
        let door = unit.door_closed().await.unwrap_or(false);

        vec![
            Control::new(&name, "serial", "S/N", Widget::Readout { text: serial }),
            Control::new(
                &name,
                "disk",
                "Sectioning",
                Widget::Choice {
                    options: DiskSectioning::ALL
                        .iter()
                        .map(|d| d.label().to_string())
                        .collect(),
                    selected: disk
                        .and_then(|d| DiskSectioning::ALL.iter().position(|x| *x == d))
                        .unwrap_or(0),
                },
            ),
            Control::new(
                &name,
                "filter",
                "Filter cube",
                Widget::Choice {
                    options: self.filter_cubes.clone(),
                    selected: filter.unwrap_or(0),
                },
            ),
            Control::new(
                &name,
                "calibrated",
                "Channel calibrated",
                Widget::Readout {
                    text: self.shared.state.is_calibrated(filter).to_string(),
                },
            ),
            Control::new(
                &name,
                "calibration_led",
                "Calibration LED",
                Widget::Toggle { on: led },
            ),
            Control::new(&name, "calibrate", "Calibrate", Widget::Button),
            Control::new(&name, "save_deforms", "Save deforms", Widget::Button),
            Control::new(
                &name,
                "sectioning",
                "Sectioning mode",
                Widget::Toggle {
                    on: self.sectioning(),
                },
            ),
            Control::new(
                &name,
                "door",
                "Door closed",
                Widget::Readout {
                    text: door.to_string(),
                },
            ),
        ]
    }

    async fn invoke(&self, action: &str, value: Option<&str>) -> Result<String> {
        match action {
            "disk" => {
                let wanted = value.ok_or_else(|| anyhow!("disk position required"))?;
                let position = DiskSectioning::ALL
                    .iter()
                    .enumerate()
                    .find(|(i, d)| d.label().eq_ignore_ascii_case(wanted) || i.to_string() == wanted)
                    .map(|(_, d)| *d)
                    .ok_or_else(|| anyhow!("unknown disk position '{}'", wanted))?;
                self.shared.unit.set_disk_position(position).await?;
                Ok(format!("disk at {}", position.label()))
            }
            "filter" => {
                let position =
                    self.parse_filter(value.ok_or_else(|| anyhow!("filter position required"))?)?;
                self.shared.unit.set_filter_position(position).await?;
                self.poll_status().await;
                Ok(format!("filter cube {}", self.filter_cubes[position]))
            }
            "calibration_led" => {
                let on = parse_on_off(value)?;
                self.shared.unit.set_calibration_led(on).await?;
                Ok(format!("calibration LED {}", if on { "on" } else { "off" }))
            }
            "calibrate" => {
                let position = self.calibrate().await?;
                Ok(format!("calibrated {}", self.filter_cubes[position]))
            }
            "sectioning" => {
                let on = parse_on_off(value)?;
                self.set_sectioning(on)?;
                Ok(format!("sectioning {}", if on { "on" } else { "off" }))
            }
            "save_deforms" => {
                let path = value.ok_or_else(|| anyhow!("output path required"))?;
                self.save_deforms(Path::new(path))?;
                Ok(format!("deformation maps saved to {}", path))
            }
            other => bail!("device '{}' has no action '{}'", self.name(), other),
        }
    }

    async fn shutdown(&self) -> Result<()> {
        self.stop_timer().await;
        if self.sectioning() {
            self.set_sectioning(false)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::camera::{CameraControl, ExposureMode, PostProcessorChain};
    use crate::devices::capabilities::Roi;

    struct StillCamera {
        image: Option<Arc<Frame>>,
    }

    #[async_trait]
    impl CameraControl for StillCamera {
        async fn set_enabled(&self, enabled: bool) -> Result<bool> {
            Ok(enabled)
        }
        async fn exposure_time_ms(&self) -> Result<f64> {
            Ok(10.0)
        }
        async fn set_exposure_time_ms(&self, _ms: f64) -> Result<()> {
            Ok(())
        }
        async fn time_between_exposures_ms(&self) -> Result<f64> {
            Ok(0.0)
        }
        async fn image_size(&self) -> Result<(u32, u32)> {
            Ok((8, 2))
        }
        async fn roi(&self) -> Result<Roi> {
            Ok(Roi {
                left: 0,
                top: 0,
                width: 8,
                height: 2,
            })
        }
        async fn set_roi(&self, _roi: Roi) -> Result<()> {
            Ok(())
        }
        fn sensor_shape(&self) -> (u32, u32) {
            (8, 2)
        }
        async fn soft_trigger(&self) -> Result<()> {
            Ok(())
        }
        async fn exposure_mode(&self) -> Result<ExposureMode> {
            Ok(ExposureMode::TriggerSoft)
        }
        async fn prepare_for_experiment(&self) -> Result<()> {
            Ok(())
        }
        fn last_image(&self) -> Option<Arc<Frame>> {
            self.image.clone()
        }
    }

    fn config(cubes: &str) -> ClarityConfig {
        ClarityConfig {
            filter_cubes: Some(FilterCubes::Lines(cubes.to_string())),
            camera: Some("cam".into()),
            poll_interval_ms: 1000,
        }
    }

    fn camera(image: Option<Frame>) -> Arc<CameraHandler> {
        Arc::new(CameraHandler::new(
            "cam",
            "cameras",
            Arc::new(StillCamera {
                image: image.map(Arc::new),
            }),
            PostProcessorChain::new(),
            EventBus::default(),
        ))
    }

    async fn device(image: Option<Frame>) -> (ClarityDevice, Arc<SimulatedClarity>, Arc<CameraHandler>) {
        let unit = Arc::new(SimulatedClarity::new("SN1", Duration::ZERO));
        let device = ClarityDevice::new(
            "clarity".into(),
            config("DAPI\n\nGFP\ndsRed\nCy5\n"),
            unit.clone(),
            EventBus::default(),
        )
        .unwrap();
        device.create_handlers().unwrap();
        let camera = camera(image);
        let mut dir = HandlerDirectory::new();
        dir.insert(HandlerRef::Camera(camera.clone())).unwrap();
        device.finalize_initialization(&dir).await.unwrap();
        (device, unit, camera)
    }

    fn reference() -> Frame {
        // Left half twice as bright as the right half.
        Frame::new(8, 2, vec![20, 20, 20, 20, 10, 10, 10, 10, 20, 20, 20, 20, 10, 10, 10, 10]).unwrap()
    }

    #[test]
    fn filter_cubes_skip_blank_lines() {
        let device = ClarityDevice::new(
            "c".into(),
            config("A\n\nB\nC\n\nD"),
            Arc::new(SimulatedClarity::new("SN", Duration::ZERO)),
            EventBus::default(),
        )
        .unwrap();
        assert_eq!(device.filter_cubes(), ["A", "B", "C", "D"]);
    }

    #[test]
    fn config_requires_four_cubes_and_camera() {
        let unit = || -> Arc<dyn ClarityUnit> { Arc::new(SimulatedClarity::new("SN", Duration::ZERO)) };
        assert!(ClarityDevice::new("c".into(), config("A\nB\nC"), unit(), EventBus::default()).is_err());

        let mut no_camera = config("A\nB\nC\nD");
        no_camera.camera = None;
        let err = ClarityDevice::new("c".into(), no_camera, unit(), EventBus::default())
            .err()
            .unwrap();
        assert!(err.to_string().contains("camera"));

        let mut no_cubes = config("");
        no_cubes.filter_cubes = None;
        assert!(ClarityDevice::new("c".into(), no_cubes, unit(), EventBus::default()).is_err());
    }

    #[test]
    fn processor_halves_width_and_balances_halves() {
        let processor = SectioningProcessor::calibrate(&reference()).unwrap();
        assert_eq!(processor.deforms(), &[2.0, 2.0]);
        let out = processor.process(reference());
        assert_eq!(out.shape(), (4, 2));
        assert!(out.pixels.iter().all(|&v| v == 0));
    }

    #[tokio::test]
    async fn status_reflects_hardware() {
        let (device, unit, _camera) = device(None).await;
        assert_eq!(device.poll_status().await, HandlerState::Disabled);

        unit.enable().await.unwrap();
        assert_eq!(device.poll_status().await, HandlerState::Enabled);

        unit.set_door_closed(false).await;
        assert_eq!(device.poll_status().await, HandlerState::Busy);

        unit.set_fail_queries(true);
        assert_eq!(device.poll_status().await, HandlerState::Error);
    }

    #[tokio::test]
    async fn calibration_needs_an_image() {
        let (device, _unit, _camera) = device(None).await;
        assert!(device.calibrate().await.is_err());
        assert!(device.deforms().is_err());
    }

    #[tokio::test]
    async fn calibration_rejects_unknown_filter_position() {
        let (device, unit, _camera) = device(Some(reference())).await;
        unit.report_filter_position(Some(FILTER_POSITIONS + 3)).await;

        let err = device.calibrate().await.unwrap_err();
        assert!(err.to_string().contains("out of range"));
        assert!((0..FILTER_POSITIONS).all(|p| !device.is_calibrated(p)));
        assert!(device.deforms().is_err());

        unit.report_filter_position(Some(1)).await;
        assert_eq!(device.calibrate().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn sectioning_requires_calibration() {
        let (device, _unit, camera) = device(Some(reference())).await;
        device.poll_status().await;
        assert!(device.set_sectioning(true).is_err());

        assert_eq!(device.calibrate().await.unwrap(), 0);
        assert!(device.is_calibrated(0));
        device.set_sectioning(true).unwrap();
        assert!(device.sectioning());
        assert_eq!(camera.image_size().await.unwrap(), (8, 2));
        assert_eq!(camera.post_processors().output_shape((8, 2)), (4, 2));

        device.set_sectioning(false).unwrap();
        assert!(camera.post_processors().is_empty());
    }

    #[tokio::test]
    async fn moving_to_uncalibrated_filter_stops_sectioning() {
        let (device, _unit, _camera) = device(Some(reference())).await;
        device.calibrate().await.unwrap();
        device.set_sectioning(true).unwrap();

        device.invoke("filter", Some("GFP")).await.unwrap();
        assert!(!device.sectioning());
    }

    #[tokio::test]
    async fn deforms_saved_per_label() {
        let (device, _unit, _camera) = device(Some(reference())).await;
        device.calibrate().await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deforms.json");
        device.save_deforms(&path).unwrap();
        let saved: BTreeMap<String, Vec<f64>> =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(saved.keys().collect::<Vec<_>>(), vec!["DAPI"]);
    }
}

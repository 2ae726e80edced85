//! Simulated Hardware
//!
//! Stand-ins for the physical instruments, implementing the same capability
//! traits a real driver would. All waiting uses `tokio::time::sleep`.
//!
//! # Available Simulations
//!
//! - `SimulatedAxis` - one stage axis with limits and a travel speed
//! - `SimulatedCameraDriver` - camera with settings, ROI, binning and triggers
//! - `SimulatedLight` - laser/LED with a power setpoint
//! - `SimulatedMirror` - deformable mirror with a pattern queue
//! - `SimulatedClarity` - spinning-disk sectioning unit with a filter turret

use crate::devices::capabilities::{
    Binning, Configurable, ExposureControl, FrameSource, LightOutput, Movable, PhaseControl, Roi,
    SettingDescriptor, SettingKind, Switchable, TriggerMode, TriggerType, Triggerable,
};
use crate::devices::clarity::{ClarityUnit, DiskSectioning};
use crate::devices::frame::{Frame, Transform};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use rand::Rng;
use serde_json::{json, Value};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::{sleep, Duration};

// =============================================================================
// SimulatedAxis - Stage Axis
// =============================================================================

/// Simulated linear axis.
///
/// Positions are microns. A speed of zero makes moves instantaneous, which
/// is what the tests use.
pub struct SimulatedAxis {
    position: RwLock<f64>,
    limits: (f64, f64),
    speed_um_per_s: f64,
    settle: Duration,
}

impl SimulatedAxis {
    /// Create an axis with travel `[min, max]`, starting at `initial`.
    pub fn new(min: f64, max: f64, initial: f64, speed_um_per_s: f64) -> Self {
        let settle = if speed_um_per_s > 0.0 {
            Duration::from_millis(10)
        } else {
            Duration::ZERO
        };
        Self {
            position: RwLock::new(initial.clamp(min, max)),
            limits: (min, max),
            speed_um_per_s,
            settle,
        }
    }
}

#[async_trait]
impl Movable for SimulatedAxis {
    async fn move_abs(&self, target: f64) -> Result<()> {
        let (min, max) = self.limits;
        if !(min..=max).contains(&target) {
            bail!("target {} outside travel [{}, {}]", target, min, max);
        }
        let current = *self.position.read().await;
        if self.speed_um_per_s > 0.0 {
            let secs = (target - current).abs() / self.speed_um_per_s;
            sleep(Duration::try_from_secs_f64(secs).context("move duration out of range")?).await;
        }
        *self.position.write().await = target;
        Ok(())
    }

    async fn move_rel(&self, distance: f64) -> Result<()> {
        let current = *self.position.read().await;
        self.move_abs(current + distance).await
    }

    async fn position(&self) -> Result<f64> {
        Ok(*self.position.read().await)
    }

    async fn wait_settled(&self) -> Result<()> {
        sleep(self.settle).await;
        Ok(())
    }

    fn limits(&self) -> (f64, f64) {
        self.limits
    }
}

// =============================================================================
// SimulatedCameraDriver - Camera
// =============================================================================

const TRIGGER_TYPES: [(TriggerType, &str); 5] = [
    (TriggerType::Software, "software"),
    (TriggerType::High, "high"),
    (TriggerType::Low, "low"),
    (TriggerType::RisingEdge, "rising edge"),
    (TriggerType::FallingEdge, "falling edge"),
];

const TRIGGER_MODES: [(TriggerMode, &str); 4] = [
    (TriggerMode::Once, "once"),
    (TriggerMode::Bulb, "bulb"),
    (TriggerMode::Strobe, "strobe"),
    (TriggerMode::Start, "start"),
];

/// Default readout modes of the simulated camera.
pub const DEFAULT_READOUT_MODES: [&str; 3] = [
    "CONVENTIONAL 1MHz CH1",
    "EM 10MHz CH1",
    "EM 30MHz CH1",
];

/// Simulated scientific camera.
///
/// Frames are produced after each software trigger (one exposure later) and
/// delivered on the channel from [`FrameSource::take_frame_receiver`].
pub struct SimulatedCameraDriver {
    sensor: (u32, u32),
    readout_s: f64,
    readout_modes: Vec<String>,
    enabled: Arc<RwLock<bool>>,
    exposure_s: Arc<RwLock<f64>>,
    roi: RwLock<Roi>,
    binning: RwLock<Binning>,
    transform: Arc<RwLock<Transform>>,
    trigger: RwLock<(TriggerType, TriggerMode)>,
    settings: RwLock<BTreeMap<String, Value>>,
    frame_count: Arc<AtomicU64>,
    frame_tx: mpsc::Sender<Result<Frame>>,
    frame_rx: Mutex<Option<mpsc::Receiver<Result<Frame>>>>,
}

impl SimulatedCameraDriver {
    /// Camera with a `width` x `height` sensor.
    pub fn new(width: u32, height: u32) -> Self {
        Self::with_readout_modes(
            width,
            height,
            DEFAULT_READOUT_MODES.iter().map(|s| s.to_string()).collect(),
        )
    }

    /// Camera with custom readout mode descriptions.
    pub fn with_readout_modes(width: u32, height: u32, readout_modes: Vec<String>) -> Self {
        let (frame_tx, frame_rx) = mpsc::channel(32);
        let mut settings = BTreeMap::new();
        settings.insert("gain".to_string(), json!(0));
        settings.insert("cooling".to_string(), json!(false));
        if !readout_modes.is_empty() {
            settings.insert("readout mode".to_string(), json!(0));
        }
        Self {
            sensor: (width, height),
            readout_s: 0.005,
            readout_modes,
            enabled: Arc::new(RwLock::new(false)),
            exposure_s: Arc::new(RwLock::new(0.01)),
            roi: RwLock::new(Roi {
                left: 0,
                top: 0,
                width,
                height,
            }),
            binning: RwLock::new(Binning::default()),
            transform: Arc::new(RwLock::new(Transform::default())),
            trigger: RwLock::new((TriggerType::Software, TriggerMode::Once)),
            settings: RwLock::new(settings),
            frame_count: Arc::new(AtomicU64::new(0)),
            frame_tx,
            frame_rx: Mutex::new(Some(frame_rx)),
        }
    }

    /// Set the readout time added to the exposure to form the cycle time.
    pub fn with_readout_time(mut self, seconds: f64) -> Self {
        self.readout_s = seconds.max(0.0);
        self
    }

    /// Number of frames produced so far
    pub fn frame_count(&self) -> u64 {
        self.frame_count.load(Ordering::SeqCst)
    }

    /// Report a dropped frame on the data channel.
    pub async fn inject_dropped_frame(&self, message: &str) -> Result<()> {
        self.frame_tx
            .send(Err(anyhow!("{}", message)))
            .await
            .map_err(|_| anyhow!("frame channel closed"))
    }

    fn trigger_index<T: PartialEq + Copy, const N: usize>(table: &[(T, &str); N], v: T) -> i64 {
        table.iter().position(|(t, _)| *t == v).unwrap_or(0) as i64
    }
}

/// Synthetic image: a bright spot on a sloped background with shot noise.
fn synth_frame(width: u32, height: u32, count: u64, gain: f64) -> Frame {
    let mut rng = rand::thread_rng();
    let (cx, cy) = (width as f64 / 2.0, height as f64 / 2.0);
    let sigma2 = ((width.min(height) as f64) / 8.0).powi(2).max(1.0);
    let mut pixels = Vec::with_capacity((width * height) as usize);
    for y in 0..height {
        for x in 0..width {
            let dx = x as f64 - cx;
            let dy = y as f64 - cy;
            let spot = 2000.0 * (-(dx * dx + dy * dy) / (2.0 * sigma2)).exp();
            let background = 100.0 + (x + y) as f64 * 0.1 + (count % 16) as f64;
            let noise: f64 = rng.gen_range(0.0..10.0);
            let value = (spot + background + noise) * (1.0 + gain / 10.0);
            pixels.push(value.min(u16::MAX as f64) as u16);
        }
    }
    Frame {
        width,
        height,
        pixels,
    }
}

#[async_trait]
impl Switchable for SimulatedCameraDriver {
    async fn enable(&self) -> Result<()> {
        *self.enabled.write().await = true;
        Ok(())
    }

    async fn disable(&self) -> Result<()> {
        *self.enabled.write().await = false;
        Ok(())
    }

    async fn is_enabled(&self) -> Result<bool> {
        Ok(*self.enabled.read().await)
    }
}

#[async_trait]
impl ExposureControl for SimulatedCameraDriver {
    async fn set_exposure(&self, seconds: f64) -> Result<()> {
        if seconds <= 0.0 || Duration::try_from_secs_f64(seconds).is_err() {
            bail!("exposure must be positive and finite, got {} s", seconds);
        }
        *self.exposure_s.write().await = seconds;
        Ok(())
    }

    async fn get_exposure(&self) -> Result<f64> {
        Ok(*self.exposure_s.read().await)
    }
}

#[async_trait]
impl Triggerable for SimulatedCameraDriver {
    async fn soft_trigger(&self) -> Result<()> {
        if !*self.enabled.read().await {
            bail!("cannot trigger: camera disabled");
        }
        let (trigger_type, _) = *self.trigger.read().await;
        if trigger_type != TriggerType::Software {
            bail!("cannot soft trigger in {:?} trigger mode", trigger_type);
        }

        let roi = *self.roi.read().await;
        let binning = *self.binning.read().await;
        let (width, height) = (
            roi.width / binning.h.max(1),
            roi.height / binning.v.max(1),
        );
        let exposure = Duration::try_from_secs_f64(*self.exposure_s.read().await)
            .context("exposure out of range")?;
        let gain = self
            .settings
            .read()
            .await
            .get("gain")
            .and_then(Value::as_f64)
            .unwrap_or(0.0);
        let transform = Arc::clone(&self.transform);
        let count = Arc::clone(&self.frame_count);
        let tx = self.frame_tx.clone();

        tokio::spawn(async move {
            sleep(exposure).await;
            let n = count.fetch_add(1, Ordering::SeqCst) + 1;
            let frame = synth_frame(width, height, n, gain).transformed(*transform.read().await);
            if tx.send(Ok(frame)).await.is_err() {
                tracing::debug!("frame receiver dropped");
            }
        });
        Ok(())
    }

    async fn trigger(&self) -> Result<(TriggerType, TriggerMode)> {
        Ok(*self.trigger.read().await)
    }

    async fn set_trigger(&self, trigger_type: TriggerType, mode: TriggerMode) -> Result<()> {
        *self.trigger.write().await = (trigger_type, mode);
        Ok(())
    }
}

#[async_trait]
impl FrameSource for SimulatedCameraDriver {
    fn sensor_shape(&self) -> (u32, u32) {
        self.sensor
    }

    async fn roi(&self) -> Result<Roi> {
        Ok(*self.roi.read().await)
    }

    async fn set_roi(&self, roi: Roi) -> Result<bool> {
        let (w, h) = self.sensor;
        if roi.width == 0
            || roi.height == 0
            || roi.left + roi.width > w
            || roi.top + roi.height > h
        {
            return Ok(false);
        }
        *self.roi.write().await = roi;
        Ok(true)
    }

    async fn binning(&self) -> Result<Binning> {
        Ok(*self.binning.read().await)
    }

    async fn set_binning(&self, binning: Binning) -> Result<()> {
        if binning.h == 0 || binning.v == 0 {
            bail!("binning must be at least 1x1");
        }
        *self.binning.write().await = binning;
        Ok(())
    }

    async fn cycle_time(&self) -> Result<f64> {
        Ok(*self.exposure_s.read().await + self.readout_s)
    }

    async fn set_transform(&self, transform: Transform) -> Result<()> {
        *self.transform.write().await = transform;
        Ok(())
    }

    async fn take_frame_receiver(&self) -> Option<mpsc::Receiver<Result<Frame>>> {
        self.frame_rx.lock().await.take()
    }
}

#[async_trait]
impl Configurable for SimulatedCameraDriver {
    async fn all_settings(&self) -> Result<BTreeMap<String, Value>> {
        let mut all = self.settings.read().await.clone();
        let (trigger_type, mode) = *self.trigger.read().await;
        all.insert(
            "trigger type".to_string(),
            json!(Self::trigger_index(&TRIGGER_TYPES, trigger_type)),
        );
        all.insert(
            "trigger mode".to_string(),
            json!(Self::trigger_index(&TRIGGER_MODES, mode)),
        );
        Ok(all)
    }

    async fn update_settings(&self, settings: BTreeMap<String, Value>) -> Result<()> {
        for (name, value) in &settings {
            let descriptor = self
                .describe_setting(name)
                .ok_or_else(|| anyhow!("unknown setting '{}'", name))?;
            descriptor.validate(name, value)?;
        }
        for (name, value) in settings {
            match name.as_str() {
                "trigger type" => {
                    let index = value.as_u64().unwrap_or(0) as usize;
                    let mut trigger = self.trigger.write().await;
                    trigger.0 = TRIGGER_TYPES[index.min(TRIGGER_TYPES.len() - 1)].0;
                }
                "trigger mode" => {
                    let index = value.as_u64().unwrap_or(0) as usize;
                    let mut trigger = self.trigger.write().await;
                    trigger.1 = TRIGGER_MODES[index.min(TRIGGER_MODES.len() - 1)].0;
                }
                _ => {
                    self.settings.write().await.insert(name, value);
                }
            }
        }
        Ok(())
    }

    fn describe_setting(&self, name: &str) -> Option<SettingDescriptor> {
        let kind = match name {
            "gain" => SettingKind::Int { min: 0, max: 100 },
            "cooling" => SettingKind::Bool,
            "readout mode" if !self.readout_modes.is_empty() => SettingKind::Enum(
                self.readout_modes
                    .iter()
                    .enumerate()
                    .map(|(i, m)| (i as i64, m.clone()))
                    .collect(),
            ),
            "trigger type" => SettingKind::Enum(
                TRIGGER_TYPES
                    .iter()
                    .enumerate()
                    .map(|(i, (_, n))| (i as i64, n.to_string()))
                    .collect(),
            ),
            "trigger mode" => SettingKind::Enum(
                TRIGGER_MODES
                    .iter()
                    .enumerate()
                    .map(|(i, (_, n))| (i as i64, n.to_string()))
                    .collect(),
            ),
            _ => return None,
        };
        Some(SettingDescriptor {
            kind,
            read_only: false,
        })
    }
}

// =============================================================================
// SimulatedLight - Laser / LED
// =============================================================================

/// Simulated light source.
pub struct SimulatedLight {
    wavelength_nm: f64,
    power_range: (f64, f64),
    enabled: RwLock<bool>,
    power_mw: RwLock<f64>,
}

impl SimulatedLight {
    /// Light at `wavelength_nm` with power range `(min, max)` mW.
    pub fn new(wavelength_nm: f64, power_range: (f64, f64)) -> Self {
        Self {
            wavelength_nm,
            power_range,
            enabled: RwLock::new(false),
            power_mw: RwLock::new(power_range.0),
        }
    }
}

#[async_trait]
impl Switchable for SimulatedLight {
    async fn enable(&self) -> Result<()> {
        *self.enabled.write().await = true;
        Ok(())
    }

    async fn disable(&self) -> Result<()> {
        *self.enabled.write().await = false;
        Ok(())
    }

    async fn is_enabled(&self) -> Result<bool> {
        Ok(*self.enabled.read().await)
    }
}

#[async_trait]
impl LightOutput for SimulatedLight {
    fn wavelength_nm(&self) -> f64 {
        self.wavelength_nm
    }

    fn power_range(&self) -> (f64, f64) {
        self.power_range
    }

    async fn power_mw(&self) -> Result<f64> {
        Ok(*self.power_mw.read().await)
    }

    async fn set_power_mw(&self, power: f64) -> Result<()> {
        let (min, max) = self.power_range;
        if !(min..=max).contains(&power) {
            bail!("power {} mW outside [{}, {}]", power, min, max);
        }
        *self.power_mw.write().await = power;
        Ok(())
    }
}

// =============================================================================
// SimulatedMirror - Deformable Mirror
// =============================================================================

/// Simulated deformable mirror driven by modal amplitudes.
pub struct SimulatedMirror {
    n_modes: usize,
    movement_time: Duration,
    phase: RwLock<Vec<f64>>,
    queue: RwLock<VecDeque<Vec<f64>>>,
}

impl SimulatedMirror {
    /// Mirror accepting `n_modes` modes.
    pub fn new(n_modes: usize, movement_time: Duration) -> Self {
        Self {
            n_modes,
            movement_time,
            phase: RwLock::new(vec![0.0; n_modes]),
            queue: RwLock::new(VecDeque::new()),
        }
    }

    /// Phase currently on the surface
    pub async fn current_phase(&self) -> Vec<f64> {
        self.phase.read().await.clone()
    }
}

#[async_trait]
impl PhaseControl for SimulatedMirror {
    fn n_modes(&self) -> usize {
        self.n_modes
    }

    async fn set_phase(&self, modes: &[f64]) -> Result<()> {
        if modes.len() != self.n_modes {
            bail!("expected {} modes, got {}", self.n_modes, modes.len());
        }
        *self.phase.write().await = modes.to_vec();
        sleep(self.movement_time).await;
        Ok(())
    }

    async fn queue_patterns(&self, patterns: Vec<Vec<f64>>) -> Result<()> {
        if let Some(bad) = patterns.iter().find(|p| p.len() != self.n_modes) {
            bail!("expected {} modes, got {}", self.n_modes, bad.len());
        }
        *self.queue.write().await = patterns.into();
        Ok(())
    }

    async fn next_pattern(&self) -> Result<bool> {
        let next = self.queue.write().await.pop_front();
        match next {
            Some(pattern) => {
                self.set_phase(&pattern).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn movement_time(&self) -> Duration {
        self.movement_time
    }
}

// =============================================================================
// SimulatedClarity - Sectioning Unit
// =============================================================================

/// Simulated spinning-disk sectioning unit with a four-position filter turret.
pub struct SimulatedClarity {
    id: String,
    move_time: Duration,
    enabled: RwLock<bool>,
    disk: RwLock<Option<DiskSectioning>>,
    filter: RwLock<Option<usize>>,
    door_closed: RwLock<bool>,
    calibration_led: RwLock<bool>,
    fail_queries: AtomicBool,
}

impl SimulatedClarity {
    /// Unit with serial number `id`; turret moves take `move_time`.
    pub fn new(id: impl Into<String>, move_time: Duration) -> Self {
        Self {
            id: id.into(),
            move_time,
            enabled: RwLock::new(false),
            disk: RwLock::new(Some(DiskSectioning::Low)),
            filter: RwLock::new(Some(0)),
            door_closed: RwLock::new(true),
            calibration_led: RwLock::new(false),
            fail_queries: AtomicBool::new(false),
        }
    }

    /// Open or close the service door.
    pub async fn set_door_closed(&self, closed: bool) {
        *self.door_closed.write().await = closed;
    }

    /// Make every status query fail, as if the unit stopped responding.
    pub fn set_fail_queries(&self, fail: bool) {
        self.fail_queries.store(fail, Ordering::SeqCst);
    }

    /// Report `position` from the turret encoder without moving, whether or
    /// not it is a real position.
    pub async fn report_filter_position(&self, position: Option<usize>) {
        *self.filter.write().await = position;
    }

    fn check(&self) -> Result<()> {
        if self.fail_queries.load(Ordering::SeqCst) {
            bail!("no response from sectioning unit");
        }
        Ok(())
    }
}

#[async_trait]
impl Switchable for SimulatedClarity {
    async fn enable(&self) -> Result<()> {
        *self.enabled.write().await = true;
        Ok(())
    }

    async fn disable(&self) -> Result<()> {
        *self.enabled.write().await = false;
        Ok(())
    }

    async fn is_enabled(&self) -> Result<bool> {
        self.check()?;
        Ok(*self.enabled.read().await)
    }
}

#[async_trait]
impl ClarityUnit for SimulatedClarity {
    async fn id(&self) -> Result<String> {
        Ok(self.id.clone())
    }

    async fn disk_position(&self) -> Result<Option<DiskSectioning>> {
        self.check()?;
        Ok(*self.disk.read().await)
    }

    async fn set_disk_position(&self, position: DiskSectioning) -> Result<()> {
        *self.disk.write().await = None;
        sleep(self.move_time).await;
        *self.disk.write().await = Some(position);
        Ok(())
    }

    async fn filter_position(&self) -> Result<Option<usize>> {
        self.check()?;
        Ok(*self.filter.read().await)
    }

    async fn set_filter_position(&self, position: usize) -> Result<()> {
        if position >= 4 {
            bail!("filter position {} out of range 0-3", position);
        }
        *self.filter.write().await = None;
        sleep(self.move_time).await;
        *self.filter.write().await = Some(position);
        Ok(())
    }

    async fn door_closed(&self) -> Result<bool> {
        self.check()?;
        Ok(*self.door_closed.read().await)
    }

    async fn calibration_led(&self) -> Result<bool> {
        Ok(*self.calibration_led.read().await)
    }

    async fn set_calibration_led(&self, on: bool) -> Result<()> {
        *self.calibration_led.write().await = on;
        Ok(())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn axis_respects_travel() {
        let axis = SimulatedAxis::new(-10.0, 10.0, 0.0, 0.0);
        axis.move_abs(5.0).await.unwrap();
        axis.move_rel(2.5).await.unwrap();
        assert_eq!(axis.position().await.unwrap(), 7.5);
        assert!(axis.move_rel(5.0).await.is_err());
    }

    #[tokio::test]
    async fn camera_delivers_frame_after_trigger() {
        let camera = SimulatedCameraDriver::new(32, 16);
        let mut rx = camera.take_frame_receiver().await.unwrap();
        assert!(camera.take_frame_receiver().await.is_none());

        assert!(camera.soft_trigger().await.is_err());
        camera.enable().await.unwrap();
        camera.set_exposure(0.001).await.unwrap();
        camera.soft_trigger().await.unwrap();

        let frame = rx.recv().await.unwrap().unwrap();
        assert_eq!(frame.shape(), (32, 16));
        assert_eq!(camera.frame_count(), 1);
    }

    #[tokio::test]
    async fn camera_rejects_exposures_it_cannot_wait_for() {
        let camera = SimulatedCameraDriver::new(8, 8);
        camera.set_exposure(0.5).await.unwrap();
        for seconds in [0.0, -1.0, f64::NAN, f64::INFINITY, 1e300] {
            assert!(camera.set_exposure(seconds).await.is_err(), "{}", seconds);
        }
        assert_eq!(camera.get_exposure().await.unwrap(), 0.5);
    }

    #[tokio::test]
    async fn camera_binning_shrinks_frames() {
        let camera = SimulatedCameraDriver::new(32, 16);
        let mut rx = camera.take_frame_receiver().await.unwrap();
        camera.enable().await.unwrap();
        camera.set_exposure(0.001).await.unwrap();
        camera.set_binning(Binning { h: 2, v: 2 }).await.unwrap();
        camera.soft_trigger().await.unwrap();
        assert_eq!(rx.recv().await.unwrap().unwrap().shape(), (16, 8));
    }

    #[tokio::test]
    async fn camera_settings_drive_trigger() {
        let camera = SimulatedCameraDriver::new(8, 8);
        let mut update = BTreeMap::new();
        update.insert("trigger type".to_string(), json!(1));
        update.insert("trigger mode".to_string(), json!(1));
        camera.update_settings(update).await.unwrap();
        assert_eq!(
            camera.trigger().await.unwrap(),
            (TriggerType::High, TriggerMode::Bulb)
        );

        let mut bad = BTreeMap::new();
        bad.insert("gain".to_string(), json!(1000));
        assert!(camera.update_settings(bad).await.is_err());

        let mut unknown = BTreeMap::new();
        unknown.insert("shutter".to_string(), json!(1));
        assert!(camera.update_settings(unknown).await.is_err());
    }

    #[tokio::test]
    async fn camera_rejects_roi_outside_sensor() {
        let camera = SimulatedCameraDriver::new(64, 64);
        let roi = Roi {
            left: 60,
            top: 0,
            width: 10,
            height: 10,
        };
        assert!(!camera.set_roi(roi).await.unwrap());
    }

    #[tokio::test]
    async fn clarity_turret_reports_motion() {
        let unit = SimulatedClarity::new("SN1", Duration::ZERO);
        unit.set_filter_position(2).await.unwrap();
        assert_eq!(unit.filter_position().await.unwrap(), Some(2));
        assert!(unit.set_filter_position(4).await.is_err());

        unit.set_fail_queries(true);
        assert!(unit.door_closed().await.is_err());
    }
}

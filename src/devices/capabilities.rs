//! Driver capabilities.
//!
//! The seam between a device and the hardware it drives. A device holds its
//! driver through these traits, so the simulated drivers in
//! [`simulated`](super::simulated) and a vendor driver are interchangeable:
//!
//! - camera: `Switchable + ExposureControl + Triggerable + FrameSource + Configurable`
//! - stage axis: `Movable`
//! - light source: `Switchable + LightOutput`
//! - deformable mirror: `PhaseControl`
//!
//! Drivers report failures as `anyhow` errors; the device layer attaches the
//! device name on the way up.

use crate::devices::frame::{Frame, Transform};
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::mpsc;

/// Hardware that has to be switched on before it does anything useful.
#[async_trait]
pub trait Switchable: Send + Sync {
    /// Switch the hardware on
    async fn enable(&self) -> Result<()>;

    /// Switch the hardware off. Disabling a disabled device is not an error.
    async fn disable(&self) -> Result<()>;

    /// Query whether the hardware is on
    async fn is_enabled(&self) -> Result<bool>;
}

/// One motorised axis: a stage axis or a focus drive.
///
/// Positions are in microns. The move calls return once the motion is
/// commanded; `wait_settled` returns when the axis has stopped. Targets
/// outside `limits()` are refused.
#[async_trait]
pub trait Movable: Send + Sync {
    /// Start a move to `position`
    async fn move_abs(&self, position: f64) -> Result<()>;

    /// Start a move by `distance`
    async fn move_rel(&self, distance: f64) -> Result<()>;

    /// Where the axis is now
    async fn position(&self) -> Result<f64>;

    /// Wait for the axis to stop
    async fn wait_settled(&self) -> Result<()>;

    /// Travel range (min, max)
    fn limits(&self) -> (f64, f64);

    /// Halt the axis. Axes that cannot be halted refuse.
    async fn stop(&self) -> Result<()> {
        anyhow::bail!("this axis cannot be halted")
    }
}

/// Exposure time, in seconds at this level (handlers speak milliseconds).
///
/// Changing the exposure never starts an acquisition.
#[async_trait]
pub trait ExposureControl: Send + Sync {
    /// Set the exposure time
    async fn set_exposure(&self, seconds: f64) -> Result<()>;

    /// Current exposure time
    async fn get_exposure(&self) -> Result<f64>;
}

/// Electrical signal that starts an exposure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    /// Software trigger
    Software,
    /// Active high
    High,
    /// Active low
    Low,
    /// Rising edge
    RisingEdge,
    /// Falling edge
    FallingEdge,
}

/// What a trigger does once received.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    /// One exposure per trigger
    Once,
    /// Expose for as long as the trigger is asserted
    Bulb,
    /// Burst of exposures per trigger
    Strobe,
    /// Trigger starts free-running acquisition
    Start,
}

/// Trigger configuration and software triggering.
#[async_trait]
pub trait Triggerable: Send + Sync {
    /// Send a software trigger
    async fn soft_trigger(&self) -> Result<()>;

    /// Current trigger type and mode
    async fn trigger(&self) -> Result<(TriggerType, TriggerMode)>;

    /// Change trigger type and mode
    async fn set_trigger(&self, trigger_type: TriggerType, mode: TriggerMode) -> Result<()>;
}

/// Region of interest on a sensor, in unbinned pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roi {
    /// First column
    pub left: u32,
    /// First row
    pub top: u32,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
}

/// Pixel binning (horizontal, vertical).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binning {
    /// Horizontal binning
    pub h: u32,
    /// Vertical binning
    pub v: u32,
}

impl Default for Binning {
    fn default() -> Self {
        Self { h: 1, v: 1 }
    }
}

/// Image acquisition.
///
/// Frames, or the error of a dropped frame, arrive on the
/// channel returned by `take_frame_receiver()`, which can be taken once.
#[async_trait]
pub trait FrameSource: Send + Sync {
    /// Full sensor shape (width, height)
    fn sensor_shape(&self) -> (u32, u32);

    /// Current region of interest
    async fn roi(&self) -> Result<Roi>;

    /// Set the region of interest. Returns false if the hardware refused it.
    async fn set_roi(&self, roi: Roi) -> Result<bool>;

    /// Current binning
    async fn binning(&self) -> Result<Binning>;

    /// Set binning
    async fn set_binning(&self, binning: Binning) -> Result<()>;

    /// Time from the start of one exposure to the start of the next, in seconds
    async fn cycle_time(&self) -> Result<f64>;

    /// Image transform applied to every frame before delivery
    async fn set_transform(&self, transform: Transform) -> Result<()>;

    /// Take the frame receiver. Subsequent calls return None.
    async fn take_frame_receiver(&self) -> Option<mpsc::Receiver<Result<Frame>>> {
        None
    }
}

/// Shape of a device setting, used to build controls and validate updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SettingKind {
    /// Integer in an inclusive range
    Int {
        /// Minimum
        min: i64,
        /// Maximum
        max: i64,
    },
    /// Floating point in an inclusive range
    Float {
        /// Minimum
        min: f64,
        /// Maximum
        max: f64,
    },
    /// On/off
    Bool,
    /// One of a set of (index, description) pairs
    Enum(Vec<(i64, String)>),
}

/// Description of a single device setting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingDescriptor {
    /// Value shape
    pub kind: SettingKind,
    /// Whether the setting can be written
    pub read_only: bool,
}

impl SettingDescriptor {
    /// Check a candidate value against this descriptor.
    pub fn validate(&self, name: &str, value: &Value) -> Result<()> {
        if self.read_only {
            anyhow::bail!("Setting '{}' is read-only", name);
        }
        let ok = match &self.kind {
            SettingKind::Int { min, max } => value
                .as_i64()
                .map(|v| v >= *min && v <= *max)
                .unwrap_or(false),
            SettingKind::Float { min, max } => value
                .as_f64()
                .map(|v| v >= *min && v <= *max)
                .unwrap_or(false),
            SettingKind::Bool => value.is_boolean(),
            SettingKind::Enum(values) => value
                .as_i64()
                .map(|v| values.iter().any(|(i, _)| *i == v))
                .unwrap_or(false),
        };
        if !ok {
            anyhow::bail!("Invalid value {} for setting '{}'", value, name);
        }
        Ok(())
    }
}

/// Vendor-specific settings (gain, readout mode, ...) exposed as a name/value map.
#[async_trait]
pub trait Configurable: Send + Sync {
    /// Snapshot of all settings
    async fn all_settings(&self) -> Result<BTreeMap<String, Value>>;

    /// Apply a batch of settings
    async fn update_settings(&self, settings: BTreeMap<String, Value>) -> Result<()>;

    /// Describe a setting, if it exists
    fn describe_setting(&self, name: &str) -> Option<SettingDescriptor>;
}

/// A light source with adjustable power.
#[async_trait]
pub trait LightOutput: Send + Sync {
    /// Emission wavelength in nm
    fn wavelength_nm(&self) -> f64;

    /// Allowed power range (min, max) in mW
    fn power_range(&self) -> (f64, f64);

    /// Current power setpoint in mW
    async fn power_mw(&self) -> Result<f64>;

    /// Change the power setpoint
    async fn set_power_mw(&self, power: f64) -> Result<()>;
}

/// Deformable mirrors and spatial light modulators driven by modal amplitudes.
#[async_trait]
pub trait PhaseControl: Send + Sync {
    /// Number of modes the device accepts
    fn n_modes(&self) -> usize;

    /// Apply a phase immediately
    async fn set_phase(&self, modes: &[f64]) -> Result<()>;

    /// Load a sequence of patterns to step through on trigger
    async fn queue_patterns(&self, patterns: Vec<Vec<f64>>) -> Result<()>;

    /// Advance to the next queued pattern. Returns false when the queue is empty.
    async fn next_pattern(&self) -> Result<bool>;

    /// Time the surface needs to settle after a change
    fn movement_time(&self) -> Duration;
}

// Combined traits, for trait objects.

/// Combined trait for cameras.
///
/// Implement the individual traits and get this automatically via blanket impl.
pub trait CameraDriver:
    Switchable + ExposureControl + Triggerable + FrameSource + Configurable
{
}

impl<T> CameraDriver for T where
    T: Switchable + ExposureControl + Triggerable + FrameSource + Configurable
{
}

/// Combined trait for light sources.
pub trait LightDriver: Switchable + LightOutput {}

impl<T: Switchable + LightOutput> LightDriver for T {}

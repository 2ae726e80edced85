//! Configuration System using Figment
//!
//! This module provides strongly-typed configuration loading for the cockpit.
//! Configuration is loaded from:
//! 1. a TOML file (`config/cockpit.toml` by default)
//! 2. Environment variables (prefixed with `COCKPIT_`, nested keys separated by `__`)
//!
//! The file declares application settings and the list of devices the depot
//! builds at startup. Each device entry carries a free-form `config` table that
//! is deserialized by the device type that owns it.
//!
//! # Example
//! ```no_run
//! use rust_cockpit::config::CockpitConfig;
//!
//! let config = CockpitConfig::load()?;
//! for device in config.enabled_devices() {
//!     println!("{} ({})", device.name, device.r#type);
//! }
//! # Ok::<(), rust_cockpit::error::CockpitError>(())
//! ```

use crate::error::{AppResult, CockpitError};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default configuration file location, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/cockpit.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CockpitConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// GUI and event loop settings
    #[serde(default)]
    pub gui: GuiConfig,
    /// Device definitions, in initialization order
    #[serde(default)]
    pub devices: Vec<DeviceDefinition>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name (used as the main window title)
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// Location of the per-user settings file. Defaults to the platform config dir.
    #[serde(default)]
    pub user_config_path: Option<PathBuf>,
    /// Directory experiments write their data to. Overrides the user setting.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            user_config_path: None,
            data_dir: None,
        }
    }
}

/// GUI configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuiConfig {
    /// Whether to open the graphical frontend (requires the `gui` feature)
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Delay between images while video mode is running
    #[serde(default = "default_video_interval")]
    pub video_interval_ms: u64,
}

impl Default for GuiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            video_interval_ms: default_video_interval(),
        }
    }
}

/// Device definition in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceDefinition {
    /// Unique device name (the depot key)
    pub name: String,
    /// Device type (e.g. "simulated_camera", "clarity")
    pub r#type: String,
    /// Whether this device is built at startup
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Device-specific configuration (dynamic)
    #[serde(default = "empty_table")]
    pub config: toml::Value,
}

impl DeviceDefinition {
    /// Create a definition with an empty config table.
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            r#type: type_name.into(),
            enabled: true,
            config: empty_table(),
        }
    }

    /// Builder helper to attach a config table.
    pub fn with_config(mut self, config: toml::Value) -> Self {
        self.config = config;
        self
    }

    /// Deserialize the device-specific table into the device's settings type.
    pub fn parse_config<T: DeserializeOwned>(&self) -> AppResult<T> {
        self.config.clone().try_into().map_err(|e| {
            CockpitError::Configuration(format!(
                "Invalid configuration for device '{}': {}",
                self.name, e
            ))
        })
    }
}

// Default value functions
fn default_name() -> String {
    "Cockpit".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_enabled() -> bool {
    true
}

fn default_video_interval() -> u64 {
    100
}

fn empty_table() -> toml::Value {
    toml::Value::Table(toml::map::Map::new())
}

impl CockpitConfig {
    /// Load configuration from the default path and environment variables
    ///
    /// Environment variables can override configuration with prefix `COCKPIT_`.
    /// Example: `COCKPIT_APPLICATION__LOG_LEVEL=debug`
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(CockpitError::Configuration(format!(
                "Configuration file {} does not exist",
                path.display()
            )));
        }

        let config: Self = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("COCKPIT_").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string (no environment overrides)
    pub fn from_toml_str(contents: &str) -> AppResult<Self> {
        let config: Self = Figment::new().merge(Toml::string(contents)).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(CockpitError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return Err(CockpitError::Configuration(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        if self.gui.video_interval_ms == 0 {
            return Err(CockpitError::Configuration(
                "gui.video_interval_ms must be greater than zero".to_string(),
            ));
        }

        let mut names = std::collections::HashSet::new();
        for device in &self.devices {
            if device.name.trim().is_empty() {
                return Err(CockpitError::Configuration(format!(
                    "Device of type '{}' has an empty name",
                    device.r#type
                )));
            }
            if !names.insert(&device.name) {
                return Err(CockpitError::Configuration(format!(
                    "Duplicate device name: {}",
                    device.name
                )));
            }
        }

        Ok(())
    }

    /// Get all enabled devices, in declaration order
    pub fn enabled_devices(&self) -> Vec<&DeviceDefinition> {
        self.devices.iter().filter(|d| d.enabled).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [application]
        name = "Test Scope"
        log_level = "debug"

        [gui]
        enabled = false

        [[devices]]
        name = "camera"
        type = "simulated_camera"
        config = { sensor_width = 64, sensor_height = 32 }

        [[devices]]
        name = "spare"
        type = "simulated_light"
        enabled = false
    "#;

    #[test]
    fn test_parse_sample() {
        let config = CockpitConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.application.name, "Test Scope");
        assert_eq!(config.application.log_format, "pretty");
        assert!(!config.gui.enabled);
        assert_eq!(config.gui.video_interval_ms, 100);
        assert_eq!(config.devices.len(), 2);

        let enabled = config.enabled_devices();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].name, "camera");
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = CockpitConfig::from_toml_str("").unwrap();
        assert_eq!(config.application.name, "Cockpit");
        assert!(config.devices.is_empty());
    }

    #[test]
    fn test_invalid_log_level() {
        let result = CockpitConfig::from_toml_str("[application]\nlog_level = \"loud\"\n");
        assert!(matches!(result, Err(CockpitError::Configuration(_))));
    }

    #[test]
    fn test_duplicate_device_names() {
        let toml = r#"
            [[devices]]
            name = "stage"
            type = "simulated_stage"

            [[devices]]
            name = "stage"
            type = "simulated_stage"
        "#;
        let err = CockpitConfig::from_toml_str(toml).unwrap_err();
        assert!(err.to_string().contains("Duplicate device name"));
    }

    #[test]
    fn test_parse_device_config() {
        #[derive(Deserialize)]
        struct CameraSettings {
            sensor_width: u32,
            sensor_height: u32,
        }

        let config = CockpitConfig::from_toml_str(SAMPLE).unwrap();
        let settings: CameraSettings = config.devices[0].parse_config().unwrap();
        assert_eq!(settings.sensor_width, 64);
        assert_eq!(settings.sensor_height, 32);
    }

    #[test]
    fn test_load_missing_file() {
        let result = CockpitConfig::load_from("does/not/exist.toml");
        assert!(result.is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cockpit.toml");
        std::fs::write(&path, SAMPLE).unwrap();

        let config = CockpitConfig::load_from(&path).unwrap();
        assert_eq!(config.devices[0].r#type, "simulated_camera");
    }

    #[test]
    fn test_env_overrides_file() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("cockpit.toml", SAMPLE)?;
            jail.set_env("COCKPIT_APPLICATION__NAME", "Env Scope");
            jail.set_env("COCKPIT_GUI__VIDEO_INTERVAL_MS", "250");

            let config = CockpitConfig::load_from("cockpit.toml").unwrap();
            assert_eq!(config.application.name, "Env Scope");
            assert_eq!(config.gui.video_interval_ms, 250);
            // Keys the environment leaves alone come from the file.
            assert_eq!(config.application.log_level, "debug");
            assert_eq!(config.devices.len(), 2);
            Ok(())
        });
    }

    #[test]
    fn test_env_override_is_validated() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("cockpit.toml", SAMPLE)?;
            jail.set_env("COCKPIT_APPLICATION__LOG_LEVEL", "loud");
            let result = CockpitConfig::load_from("cockpit.toml");
            assert!(matches!(result, Err(CockpitError::Configuration(_))));
            Ok(())
        });
    }
}

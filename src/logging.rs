//! Logging setup.
//!
//! One `tracing-subscriber` fmt layer, in the format chosen by
//! `application.log_format`, filtered by `RUST_LOG` when it is set and by
//! `application.log_level` otherwise. The windowing stack logs a lot at info
//! level, so the default filter holds it at `warn`.
//!
//! ```no_run
//! use rust_cockpit::{config::CockpitConfig, logging};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = CockpitConfig::load()?;
//! logging::init_from_config(&config)?;
//! tracing::info!(devices = config.devices.len(), "configuration loaded");
//! # Ok(())
//! # }
//! ```

use crate::config::CockpitConfig;
use crate::error::{AppResult, CockpitError};
use std::str::FromStr;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

/// Crates held at `warn` unless `RUST_LOG` says otherwise.
const QUIET_CRATES: &[&str] = &["eframe", "egui_glow", "egui-winit", "winit", "wgpu"];

/// Log line layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Multi-line, coloured
    Pretty,
    /// One line per event
    Compact,
    /// Newline-delimited JSON
    Json,
}

impl FromStr for LogFormat {
    type Err = CockpitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "compact" => Ok(LogFormat::Compact),
            "json" => Ok(LogFormat::Json),
            _ => Err(CockpitError::Configuration(format!(
                "unknown log format '{}' (pretty, compact or json)",
                s
            ))),
        }
    }
}

/// Subscriber settings.
#[derive(Debug, Clone)]
pub struct LogSettings {
    /// Most verbose level logged by cockpit code
    pub level: Level,
    /// Line layout
    pub format: LogFormat,
    /// Log span enter/close, useful to time the startup steps
    pub span_events: bool,
    /// Colour output (pretty format only)
    pub ansi: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Pretty,
            span_events: false,
            ansi: true,
        }
    }
}

impl LogSettings {
    /// Settings at `level`, other options default.
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Settings named by `[application]`.
    pub fn from_config(config: &CockpitConfig) -> AppResult<Self> {
        Ok(Self {
            level: parse_level(&config.application.log_level)?,
            format: config.application.log_format.parse()?,
            ..Default::default()
        })
    }

    /// Line layout
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Log span enter/close
    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.span_events = enabled;
        self
    }

    /// Colour output
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.ansi = enabled;
        self
    }

    /// Filter directives used when `RUST_LOG` is unset.
    pub fn default_directives(&self) -> String {
        let level = self.level.to_string().to_lowercase();
        std::iter::once(level)
            .chain(QUIET_CRATES.iter().map(|c| format!("{}=warn", c)))
            .collect::<Vec<_>>()
            .join(",")
    }

    fn filter(&self) -> AppResult<EnvFilter> {
        match EnvFilter::try_from_default_env() {
            Ok(filter) => Ok(filter),
            Err(_) => EnvFilter::try_new(self.default_directives())
                .map_err(|e| CockpitError::Configuration(format!("log filter: {}", e))),
        }
    }
}

/// Install the subscriber described by the configuration.
pub fn init_from_config(config: &CockpitConfig) -> AppResult<()> {
    init(LogSettings::from_config(config)?)
}

/// Install the global subscriber.
///
/// Does nothing when a subscriber is already installed, so tests and the GUI
/// may call it more than once.
pub fn init(settings: LogSettings) -> AppResult<()> {
    if tracing::dispatcher::has_been_set() {
        return Ok(());
    }

    let spans = if settings.span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };
    let layer: Box<dyn Layer<Registry> + Send + Sync> = match settings.format {
        LogFormat::Pretty => fmt::layer()
            .pretty()
            .with_span_events(spans)
            .with_ansi(settings.ansi)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_span_events(spans)
            .with_ansi(false)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_span_events(spans)
            .with_current_span(true)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(layer.with_filter(settings.filter()?))
        .try_init()
        .or_else(|e| {
            if tracing::dispatcher::has_been_set() {
                Ok(())
            } else {
                Err(CockpitError::Configuration(format!(
                    "could not install log subscriber: {}",
                    e
                )))
            }
        })
}

/// Parse a level name, case-insensitively.
pub fn parse_level(level: &str) -> AppResult<Level> {
    Level::from_str(level).map_err(|_| {
        CockpitError::Configuration(format!(
            "unknown log level '{}' (trace, debug, info, warn or error)",
            level
        ))
    })
}

//! The top-level application object.
//!
//! `CockpitApp` owns the depot, the interfaces and the GUI windows. It is
//! created once by [`CockpitApp::startup`], which brings the layers up in
//! order:
//!
//! 1. the depot is built from the device definitions and every device is
//!    initialized, each creating its own handlers;
//! 2. devices resolve references to each other's handlers;
//! 3. the interfaces are built over the collected handlers;
//! 4. the GUI windows are built from the handlers and interfaces.
//!
//! [`CockpitApp::run`] then hands control to the event loop.

use crate::config::CockpitConfig;
use crate::depot::Depot;
use crate::error::AppResult;
use crate::events::EventBus;
use crate::gui::commands::{CommandDispatcher, UiCommand};
use crate::gui::event_loop::{CommandReply, EventLoop, ExitReason};
use crate::gui::model::Window;
use crate::gui::{build_windows, spawn_window_refresher};
use crate::interfaces::Interfaces;
use crate::user_config::UserConfig;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::Instrument;

/// How often the window model is rebuilt for a live frontend.
const WINDOW_REFRESH: Duration = Duration::from_millis(250);

/// The running application.
pub struct CockpitApp {
    config: CockpitConfig,
    user_config: UserConfig,
    bus: EventBus,
    depot: Arc<Depot>,
    interfaces: Arc<Interfaces>,
    windows: Vec<Window>,
    dispatcher: Arc<CommandDispatcher>,
    dispatch_task: JoinHandle<()>,
}

impl CockpitApp {
    /// Start up with the user settings named by the configuration.
    pub async fn startup(config: CockpitConfig) -> AppResult<Self> {
        let user_config =
            UserConfig::load_or_default(config.application.user_config_path.as_deref())?;
        Self::startup_with(config, user_config).await
    }

    /// Start up with explicit user settings.
    pub async fn startup_with(config: CockpitConfig, user_config: UserConfig) -> AppResult<Self> {
        tracing::info!(
            name = %config.application.name,
            devices = config.enabled_devices().len(),
            "starting"
        );
        let bus = EventBus::default();

        let mut depot = Depot::from_config(&config, &bus, &user_config)?;
        depot
            .initialize_all()
            .instrument(tracing::info_span!("startup", step = "devices"))
            .await?;
        depot
            .finalize_all()
            .instrument(tracing::info_span!("startup", step = "finalize"))
            .await?;
        let depot = Arc::new(depot);
        let dispatch_task = depot.spawn_event_dispatch();

        let interfaces = tracing::info_span!("startup", step = "interfaces").in_scope(|| {
            Arc::new(Interfaces::initialize(
                &depot,
                Duration::from_millis(config.gui.video_interval_ms),
            ))
        });

        let title = config.application.name.clone();
        let windows = build_windows(&title, &depot, &interfaces)
            .instrument(tracing::info_span!("startup", step = "windows"))
            .await;
        tracing::info!(windows = windows.len(), "windows built");

        let data_dir = config
            .application
            .data_dir
            .clone()
            .unwrap_or_else(|| user_config.data_dir());
        let dispatcher = Arc::new(CommandDispatcher::new(
            title,
            Arc::clone(&depot),
            Arc::clone(&interfaces),
            data_dir,
        ));

        Ok(Self {
            config,
            user_config,
            bus,
            depot,
            interfaces,
            windows,
            dispatcher,
            dispatch_task,
        })
    }

    /// Configuration the application started with
    pub fn config(&self) -> &CockpitConfig {
        &self.config
    }

    /// Per-user settings
    pub fn user_config(&self) -> &UserConfig {
        &self.user_config
    }

    /// Event bus
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Device registry
    pub fn depot(&self) -> &Arc<Depot> {
        &self.depot
    }

    /// Interfaces
    pub fn interfaces(&self) -> &Arc<Interfaces> {
        &self.interfaces
    }

    /// Windows as built at startup
    pub fn windows(&self) -> &[Window] {
        &self.windows
    }

    /// Where experiments write their data
    pub fn data_dir(&self) -> PathBuf {
        self.config
            .application
            .data_dir
            .clone()
            .unwrap_or_else(|| self.user_config.data_dir())
    }

    /// Command executor shared with the frontends
    pub fn dispatcher(&self) -> &Arc<CommandDispatcher> {
        &self.dispatcher
    }

    /// Keep a live copy of the windows, rebuilt periodically.
    pub fn watch_windows(&self) -> (watch::Receiver<Vec<Window>>, JoinHandle<()>) {
        spawn_window_refresher(
            self.config.application.name.clone(),
            Arc::clone(&self.depot),
            Arc::clone(&self.interfaces),
            self.windows.clone(),
            WINDOW_REFRESH,
        )
    }

    /// Run the event loop over `commands` until it stops.
    pub async fn run(
        &self,
        commands: mpsc::Receiver<UiCommand>,
        replies: Option<mpsc::UnboundedSender<CommandReply>>,
    ) -> AppResult<ExitReason> {
        let mut event_loop = EventLoop::new(Arc::clone(&self.dispatcher), commands, &self.bus);
        if let Some(replies) = replies {
            event_loop = event_loop.with_replies(replies);
        }
        event_loop
            .run()
            .instrument(tracing::info_span!("event_loop"))
            .await
    }

    /// Stop video and shut every device down.
    pub async fn shutdown(self) -> AppResult<()> {
        tracing::info!("shutting down");
        self.interfaces.imager.stop_video().await;
        let result = self.depot.shutdown().await;
        self.dispatch_task.abort();
        result
    }
}

/// Where [`load_config`] found the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    /// Read from this file, with environment overrides
    File(PathBuf),
    /// Nothing at the default location; built-in defaults
    Defaults,
}

/// Load the configuration file, falling back to defaults when `path` is the
/// default location and nothing is there.
///
/// Nothing is logged here since logging is configured from the result; the
/// caller reports the source once the subscriber is installed.
pub fn load_config(path: Option<&Path>) -> AppResult<(CockpitConfig, ConfigSource)> {
    match path {
        Some(path) => Ok((
            CockpitConfig::load_from(path)?,
            ConfigSource::File(path.to_path_buf()),
        )),
        None if Path::new(crate::config::DEFAULT_CONFIG_PATH).exists() => Ok((
            CockpitConfig::load()?,
            ConfigSource::File(PathBuf::from(crate::config::DEFAULT_CONFIG_PATH)),
        )),
        None => Ok((CockpitConfig::default(), ConfigSource::Defaults)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    #[traced_test]
    fn missing_default_config_is_reported_not_logged() {
        figment::Jail::expect_with(|_jail| {
            let (config, source) = load_config(None).unwrap();
            assert_eq!(source, ConfigSource::Defaults);
            assert!(config.devices.is_empty());
            Ok(())
        });
        assert!(!logs_contain("no configuration file"));
    }

    #[test]
    fn default_location_is_used_when_present() {
        figment::Jail::expect_with(|jail| {
            jail.create_dir("config")?;
            jail.create_file(
                crate::config::DEFAULT_CONFIG_PATH,
                "[application]\nname = \"Bench\"\n",
            )?;
            let (config, source) = load_config(None).unwrap();
            assert_eq!(config.application.name, "Bench");
            assert_eq!(
                source,
                ConfigSource::File(PathBuf::from(crate::config::DEFAULT_CONFIG_PATH))
            );
            Ok(())
        });
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        assert!(load_config(Some(Path::new("does/not/exist.toml"))).is_err());
    }
}

//! CLI entry point for rust_cockpit.
//!
//! Reads the configuration, starts the application and hands control to the
//! event loop. With the `gui` feature and `gui.enabled` the egui window is
//! the frontend; otherwise commands are read from the console.
//!
//! ```bash
//! rust_cockpit --config config/cockpit.toml
//! rust_cockpit --headless --log-level debug
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use rust_cockpit::app::{load_config, CockpitApp, ConfigSource};
use rust_cockpit::config::DEFAULT_CONFIG_PATH;
use rust_cockpit::gui::event_loop::{spawn_console_printer, spawn_console_reader};
use rust_cockpit::logging;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;

const COMMAND_CHANNEL_CAPACITY: usize = 32;

#[derive(Parser)]
#[command(name = "rust_cockpit")]
#[command(about = "Microscope control", long_about = None)]
struct Cli {
    /// Configuration file (default: config/cockpit.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the configured log level
    #[arg(long)]
    log_level: Option<String>,

    /// Use the console frontend even when the GUI is available
    #[arg(long)]
    headless: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let (mut config, source) =
        load_config(cli.config.as_deref()).context("loading configuration")?;
    if let Some(level) = cli.log_level {
        config.application.log_level = level;
        config.validate()?;
    }
    logging::init_from_config(&config)?;
    match source {
        ConfigSource::File(path) => tracing::info!(path = %path.display(), "configuration loaded"),
        ConfigSource::Defaults => tracing::warn!(
            path = DEFAULT_CONFIG_PATH,
            "no configuration file, starting without devices"
        ),
    }

    let runtime = tokio::runtime::Runtime::new().context("starting tokio runtime")?;
    let app = runtime.block_on(CockpitApp::startup(config))?;
    for (device, reason) in app.depot().failed_devices() {
        tracing::warn!(%device, %reason, "device unavailable");
    }

    let use_gui = cfg!(feature = "gui") && app.config().gui.enabled && !cli.headless;
    let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
    let (reply_tx, reply_rx) = mpsc::unbounded_channel();

    let outcome = if use_gui {
        run_gui(&runtime, &app, tx, rx, reply_tx, reply_rx)
    } else {
        runtime.block_on(async {
            println!("{} ready, type 'help' for commands", app.config().application.name);
            let _reader = spawn_console_reader(tx);
            let _printer = spawn_console_printer(reply_rx);
            app.run(rx, Some(reply_tx)).await.map(|_| ())
        })
    };

    let shutdown = runtime.block_on(app.shutdown());
    // The console reader may still be blocked on stdin.
    runtime.shutdown_timeout(Duration::from_millis(200));
    outcome?;
    shutdown?;
    Ok(())
}

#[cfg(feature = "gui")]
fn run_gui(
    runtime: &tokio::runtime::Runtime,
    app: &CockpitApp,
    tx: mpsc::Sender<rust_cockpit::gui::commands::UiCommand>,
    rx: mpsc::Receiver<rust_cockpit::gui::commands::UiCommand>,
    reply_tx: mpsc::UnboundedSender<rust_cockpit::gui::event_loop::CommandReply>,
    reply_rx: mpsc::UnboundedReceiver<rust_cockpit::gui::event_loop::CommandReply>,
) -> rust_cockpit::error::AppResult<()> {
    use rust_cockpit::gui::commands::UiCommand;

    let _guard = runtime.enter();
    let (windows, refresher) = app.watch_windows();
    let title = app.config().application.name.clone();
    let bus = app.bus().clone();
    let quit = tx.clone();

    // The event loop runs on the runtime while eframe owns the main thread.
    let result = std::thread::scope(|scope| {
        let event_loop = scope.spawn(|| runtime.block_on(app.run(rx, Some(reply_tx))));
        let gui = rust_cockpit::gui::egui_app::run(&title, windows, tx, reply_rx, bus);
        let _ = quit.try_send(UiCommand::Quit);
        let looped = event_loop.join().unwrap_or_else(|_| {
            Err(rust_cockpit::error::CockpitError::Gui(
                "event loop panicked".into(),
            ))
        });
        gui.and(looped.map(|_| ()))
    });
    refresher.abort();
    result
}

#[cfg(not(feature = "gui"))]
fn run_gui(
    _runtime: &tokio::runtime::Runtime,
    _app: &CockpitApp,
    _tx: mpsc::Sender<rust_cockpit::gui::commands::UiCommand>,
    _rx: mpsc::Receiver<rust_cockpit::gui::commands::UiCommand>,
    _reply_tx: mpsc::UnboundedSender<rust_cockpit::gui::event_loop::CommandReply>,
    _reply_rx: mpsc::UnboundedReceiver<rust_cockpit::gui::event_loop::CommandReply>,
) -> rust_cockpit::error::AppResult<()> {
    Err(rust_cockpit::error::CockpitError::Gui(
        "built without the 'gui' feature".into(),
    ))
}

//! The main event loop.
//!
//! Commands arrive over an mpsc channel from whichever frontend is running
//! and are executed one at a time, in order. Bus events are logged as they
//! pass. The loop ends on `quit`, when every command sender is gone, on
//! Ctrl-C, or on an error the application cannot recover from.

use super::commands::{parse_command, CommandDispatcher, UiCommand};
use crate::error::AppResult;
use crate::events::{Event, EventBus};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// Result of one command, sent back to the frontend.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandReply {
    /// The command as dispatched
    pub command: String,
    /// Message for the user, or the error text
    pub outcome: Result<String, String>,
}

/// Why the loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// The user asked to quit
    Quit,
    /// All command senders were dropped
    Disconnected,
    /// Ctrl-C
    Interrupted,
}

/// Sequential command executor.
pub struct EventLoop {
    dispatcher: Arc<CommandDispatcher>,
    commands: mpsc::Receiver<UiCommand>,
    events: broadcast::Receiver<Event>,
    replies: Option<mpsc::UnboundedSender<CommandReply>>,
    handle_ctrl_c: bool,
}

impl EventLoop {
    /// Loop executing `commands` and logging events from `bus`.
    pub fn new(
        dispatcher: Arc<CommandDispatcher>,
        commands: mpsc::Receiver<UiCommand>,
        bus: &EventBus,
    ) -> Self {
        Self {
            dispatcher,
            commands,
            events: bus.subscribe(),
            replies: None,
            handle_ctrl_c: true,
        }
    }

    /// Send every command result to `replies`.
    pub fn with_replies(mut self, replies: mpsc::UnboundedSender<CommandReply>) -> Self {
        self.replies = Some(replies);
        self
    }

    /// Whether Ctrl-C stops the loop (default true).
    pub fn with_ctrl_c(mut self, enabled: bool) -> Self {
        self.handle_ctrl_c = enabled;
        self
    }

    fn reply(&self, command: &UiCommand, outcome: Result<String, String>) {
        match &self.replies {
            Some(tx) => {
                let _ = tx.send(CommandReply {
                    command: format!("{:?}", command),
                    outcome,
                });
            }
            None => match outcome {
                Ok(message) => tracing::info!(%message, "command done"),
                Err(error) => tracing::warn!(%error, "command failed"),
            },
        }
    }

    /// Run until quit. Unrecoverable command errors are returned.
    pub async fn run(mut self) -> AppResult<ExitReason> {
        tracing::info!("event loop started");
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);

        let reason = loop {
            tokio::select! {
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        break ExitReason::Disconnected;
                    };
                    let quit = command == UiCommand::Quit;
                    match self.dispatcher.dispatch(command.clone()).await {
                        Ok(message) => self.reply(&command, Ok(message)),
                        Err(e) if e.can_recover() => self.reply(&command, Err(e.to_string())),
                        Err(e) => {
                            tracing::error!(error = %e, "unrecoverable error");
                            self.reply(&command, Err(e.to_string()));
                            return Err(e);
                        }
                    }
                    if quit {
                        break ExitReason::Quit;
                    }
                }
                event = self.events.recv() => match event {
                    Ok(event) => log_event(&event),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::debug!(skipped = n, "event log lagged");
                    }
                    // The dispatcher holds a sender, so the bus never closes under us.
                    Err(broadcast::error::RecvError::Closed) => {}
                },
                result = &mut ctrl_c, if self.handle_ctrl_c => {
                    if let Err(e) = result {
                        tracing::warn!(error = %e, "could not listen for Ctrl-C");
                        self.handle_ctrl_c = false;
                        continue;
                    }
                    break ExitReason::Interrupted;
                }
            }
        };

        // Leave no experiment running behind us.
        if let Err(e) = self.dispatcher.dispatch(UiCommand::Abort).await {
            tracing::warn!(error = %e, "abort on exit failed");
        }
        self.dispatcher.wait_for_experiment().await;
        tracing::info!(?reason, "event loop stopped");
        Ok(reason)
    }
}

fn log_event(event: &Event) {
    match event {
        Event::DeviceStatus { handler, state } => {
            tracing::info!(%handler, %state, "device status");
        }
        Event::ExperimentComplete { name } => tracing::info!(%name, "experiment complete"),
        Event::UserAbort => tracing::info!("user abort"),
        Event::NewImage { .. } | Event::StagePositionChanged { .. } => {
            tracing::trace!(event = event.kind_name());
        }
        other => tracing::debug!(event = other.kind_name()),
    }
}

/// Read commands from stdin until EOF or `quit`.
///
/// Lines that do not parse are reported on stderr and skipped.
pub fn spawn_console_reader(tx: mpsc::Sender<UiCommand>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "stdin read failed");
                    break;
                }
            };
            match parse_command(&line) {
                Ok(Some(command)) => {
                    let quit = command == UiCommand::Quit;
                    if tx.send(command).await.is_err() || quit {
                        break;
                    }
                }
                Ok(None) => {}
                Err(e) => eprintln!("{}", e),
            }
        }
    })
}

/// Print command replies on stdout.
pub fn spawn_console_printer(mut rx: mpsc::UnboundedReceiver<CommandReply>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(reply) = rx.recv().await {
            match reply.outcome {
                Ok(message) => println!("{}", message),
                Err(error) => eprintln!("error: {}", error),
            }
        }
    })
}

//! The eframe/egui frontend.
//!
//! Renders the window model published by the refresher task and turns widget
//! interaction into [`UiCommand`]s for the event loop. The main window fills
//! the central panel. Stage and camera windows float and can be hidden from
//! the top bar.

use super::commands::UiCommand;
use super::event_loop::CommandReply;
use super::log_panel::{self, EventLog};
use super::model::{Control, Widget, Window, WindowKind};
use crate::error::{AppResult, CockpitError};
use crate::events::{Event, EventBus};
use eframe::egui;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};

const REPAINT_INTERVAL: Duration = Duration::from_millis(100);

/// The main GUI struct.
pub struct CockpitGui {
    windows: watch::Receiver<Vec<Window>>,
    commands: mpsc::Sender<UiCommand>,
    replies: mpsc::UnboundedReceiver<CommandReply>,
    events: broadcast::Receiver<Event>,
    log: EventLog,
    visible: BTreeMap<String, bool>,
    // Numbers being edited, keyed by target/id, so refreshes do not fight the user.
    editing: HashMap<String, f64>,
}

impl CockpitGui {
    /// Creates a new GUI.
    pub fn new(
        _cc: &eframe::CreationContext<'_>,
        windows: watch::Receiver<Vec<Window>>,
        commands: mpsc::Sender<UiCommand>,
        replies: mpsc::UnboundedReceiver<CommandReply>,
        bus: &EventBus,
    ) -> Self {
        Self {
            windows,
            commands,
            replies,
            events: bus.subscribe(),
            log: EventLog::default(),
            visible: BTreeMap::new(),
            editing: HashMap::new(),
        }
    }

    fn send(&self, command: UiCommand) {
        if let Err(e) = self.commands.try_send(command) {
            tracing::warn!(error = %e, "command dropped");
        }
    }

    fn drain(&mut self) {
        loop {
            match self.events.try_recv() {
                Ok(event) => self.log.push(&event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
        while let Ok(reply) = self.replies.try_recv() {
            match reply.outcome {
                Ok(message) => self.log.note(message),
                Err(error) => self.log.note(format!("error: {}", error)),
            }
        }
    }

    fn control_ui(&mut self, ui: &mut egui::Ui, control: &Control) {
        let key = format!("{}/{}", control.target, control.id);
        let changed = match &control.widget {
            Widget::Toggle { on } => {
                let mut value = *on;
                ui.checkbox(&mut value, &control.label)
                    .changed()
                    .then_some(Widget::Toggle { on: value })
            }
            Widget::Choice { options, selected } => {
                let mut picked = None;
                ui.horizontal(|ui| {
                    ui.label(&control.label);
                    egui::ComboBox::from_id_salt(&key)
                        .selected_text(options.get(*selected).cloned().unwrap_or_default())
                        .show_ui(ui, |ui| {
                            for (i, option) in options.iter().enumerate() {
                                if ui.selectable_label(i == *selected, option).clicked() {
                                    picked = Some(i);
                                }
                            }
                        });
                });
                picked.filter(|i| i != selected).map(|i| Widget::Choice {
                    options: options.clone(),
                    selected: i,
                })
            }
            Widget::Number {
                value,
                min,
                max,
                unit,
            } => {
                let mut current = self.editing.get(&key).copied().unwrap_or(*value);
                let response = ui
                    .horizontal(|ui| {
                        ui.label(&control.label);
                        ui.add(
                            egui::DragValue::new(&mut current)
                                .range(*min..=*max)
                                .suffix(format!(" {}", unit)),
                        )
                    })
                    .inner;
                if response.changed() {
                    self.editing.insert(key.clone(), current);
                }
                if response.drag_stopped() || response.lost_focus() {
                    self.editing.remove(&key).map(|v| Widget::Number {
                        value: v,
                        min: *min,
                        max: *max,
                        unit: unit.clone(),
                    })
                } else {
                    None
                }
            }
            Widget::Button => ui.button(&control.label).clicked().then_some(Widget::Button),
            Widget::Readout { text } => {
                ui.label(format!("{}: {}", control.label, text));
                None
            }
        };

        if let Some(widget) = changed {
            match UiCommand::from_control(control, &widget) {
                Ok(command) => self.send(command),
                Err(e) => self.log.note(format!("error: {}", e)),
            }
        }
    }

    fn window_ui(&mut self, ui: &mut egui::Ui, window: &Window) {
        for panel in &window.panels {
            egui::CollapsingHeader::new(&panel.title)
                .id_salt(format!("{}/{}", window.title, panel.title))
                .default_open(true)
                .show(ui, |ui| {
                    for control in &panel.controls {
                        self.control_ui(ui, control);
                    }
                });
        }
    }
}

impl eframe::App for CockpitGui {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        self.drain();
        let windows = self.windows.borrow().clone();

        egui::TopBottomPanel::bottom("bottom_panel")
            .resizable(true)
            .min_height(150.0)
            .show(ctx, |ui| {
                log_panel::render(ui, &mut self.log);
            });

        egui::TopBottomPanel::top("top_panel").show(ctx, |ui| {
            ui.horizontal(|ui| {
                if let Some(main) = windows.iter().find(|w| w.kind == WindowKind::Main) {
                    ui.heading(&main.title);
                }
                ui.separator();
                for window in windows.iter().filter(|w| w.kind != WindowKind::Main) {
                    let shown = self.visible.entry(window.title.clone()).or_insert(true);
                    ui.toggle_value(shown, &window.title);
                }
                ui.separator();
                if ui.button("Abort").clicked() {
                    self.send(UiCommand::Abort);
                }
            });
        });

        egui::CentralPanel::default().show(ctx, |ui| {
            egui::ScrollArea::vertical().show(ui, |ui| {
                for window in windows.iter().filter(|w| w.kind == WindowKind::Main) {
                    self.window_ui(ui, window);
                }
            });
        });

        for window in windows.iter().filter(|w| w.kind != WindowKind::Main) {
            let mut open = self.visible.get(&window.title).copied().unwrap_or(true);
            egui::Window::new(&window.title)
                .open(&mut open)
                .show(ctx, |ui| self.window_ui(ui, window));
            self.visible.insert(window.title.clone(), open);
        }

        ctx.request_repaint_after(REPAINT_INTERVAL);
    }
}

/// Open the native window and block until it is closed.
pub fn run(
    title: &str,
    windows: watch::Receiver<Vec<Window>>,
    commands: mpsc::Sender<UiCommand>,
    replies: mpsc::UnboundedReceiver<CommandReply>,
    bus: EventBus,
) -> AppResult<()> {
    let options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default()
            .with_inner_size([1200.0, 800.0])
            .with_min_inner_size([800.0, 600.0])
            .with_title(title),
        ..Default::default()
    };
    eframe::run_native(
        title,
        options,
        Box::new(move |cc| Ok(Box::new(CockpitGui::new(cc, windows, commands, replies, &bus)))),
    )
    .map_err(|e| CockpitError::Gui(e.to_string()))
}

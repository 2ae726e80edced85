//! Renders the event log panel in the GUI.
//!
//! The panel shows the events published on the bus, newest at the bottom,
//! with a text filter, a clear button and a toggle to stick to the latest
//! entry. Only the visible rows are laid out (`ScrollArea::show_rows`).

use crate::events::Event;
use chrono::{DateTime, Local};
use eframe::egui::{self, Color32, ScrollArea, Ui};
use std::collections::VecDeque;

const LOG_CAPACITY: usize = 2000;

/// One logged event.
pub struct LogEntry {
    timestamp: DateTime<Local>,
    kind: &'static str,
    message: String,
}

impl LogEntry {
    fn color(&self) -> Color32 {
        match self.kind {
            "user abort" => Color32::from_rgb(230, 80, 80),
            "experiment complete" => Color32::from_rgb(100, 200, 100),
            "device status" => Color32::from_rgb(220, 180, 80),
            _ => Color32::from_gray(180),
        }
    }
}

/// Event log state.
pub struct EventLog {
    entries: VecDeque<LogEntry>,
    filter_text: String,
    scroll_to_bottom: bool,
}

impl Default for EventLog {
    fn default() -> Self {
        Self {
            entries: VecDeque::with_capacity(LOG_CAPACITY),
            filter_text: String::new(),
            scroll_to_bottom: true,
        }
    }
}

fn describe(event: &Event) -> String {
    match event {
        Event::DeviceStatus { handler, state } => format!("{} is {}", handler, state),
        Event::NewImage { camera, frame, .. } => {
            format!("{}: {}x{} image", camera, frame.width, frame.height)
        }
        Event::SettingsChanged { device } => format!("{} settings changed", device),
        Event::ObjectiveChange { objective, .. } => format!("objective {}", objective),
        Event::StagePositionChanged {
            handler, position, ..
        } => format!("{} at {:.2} µm", handler, position),
        Event::LightPowerChanged { light, power_mw } => format!("{} at {} mW", light, power_mw),
        Event::ExperimentComplete { name } => format!("{} complete", name),
        Event::VideoModeToggled { running } => {
            format!("video {}", if *running { "started" } else { "stopped" })
        }
        other => other.kind_name().to_string(),
    }
}

impl EventLog {
    /// Record an event. Images are too frequent to log.
    pub fn push(&mut self, event: &Event) {
        if matches!(event, Event::NewImage { .. }) {
            return;
        }
        if self.entries.len() >= LOG_CAPACITY {
            self.entries.pop_front();
        }
        self.entries.push_back(LogEntry {
            timestamp: Local::now(),
            kind: event.kind_name(),
            message: describe(event),
        });
    }

    /// Record a line that did not come from the bus (command replies).
    pub fn note(&mut self, message: String) {
        if self.entries.len() >= LOG_CAPACITY {
            self.entries.pop_front();
        }
        self.entries.push_back(LogEntry {
            timestamp: Local::now(),
            kind: "command",
            message,
        });
    }
}

/// Renders the log panel.
pub fn render(ui: &mut Ui, log: &mut EventLog) {
    ui.heading("Event Log");

    ui.horizontal(|ui| {
        ui.label("Filter Text:");
        let _ = ui.text_edit_singleline(&mut log.filter_text);

        ui.with_layout(egui::Layout::right_to_left(egui::Align::Center), |ui| {
            if ui.button("Clear").clicked() {
                log.entries.clear();
            }
            ui.toggle_value(&mut log.scroll_to_bottom, "Scroll to Bottom");
        });
    });

    ui.separator();

    let scroll_area = ScrollArea::vertical()
        .auto_shrink([false; 2])
        .stick_to_bottom(log.scroll_to_bottom);
    let text_style = egui::TextStyle::Monospace;
    let row_height = ui.text_style_height(&text_style);

    let filter = log.filter_text.as_str();
    let filtered: Vec<&LogEntry> = log
        .entries
        .iter()
        .filter(|e| filter.is_empty() || e.message.contains(filter) || e.kind.contains(filter))
        .collect();

    scroll_area.show_rows(ui, row_height, filtered.len(), |ui, row_range| {
        for i in row_range {
            if let Some(entry) = filtered.get(i) {
                ui.horizontal(|ui| {
                    ui.label(entry.timestamp.format("%H:%M:%S%.3f").to_string());
                    ui.colored_label(entry.color(), format!("[{}]", entry.kind));
                    ui.label(&entry.message);
                });
            }
        }
    });
}

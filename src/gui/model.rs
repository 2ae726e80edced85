//! Toolkit-neutral window model.
//!
//! Windows are described as data: panels of labelled controls. The console
//! frontend prints them, the egui frontend renders them, and tests inspect
//! them directly.

use serde::Serialize;

/// Role of a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WindowKind {
    /// Device list and per-group panels
    Main,
    /// Stage position and movement
    Stage,
    /// Live view for one camera
    Camera,
}

/// Input or display element.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Widget {
    /// On/off switch
    Toggle {
        /// Current value
        on: bool,
    },
    /// Pick one of several options
    Choice {
        /// Option labels
        options: Vec<String>,
        /// Index of the selected option
        selected: usize,
    },
    /// Numeric entry
    Number {
        /// Current value
        value: f64,
        /// Minimum
        min: f64,
        /// Maximum
        max: f64,
        /// Unit label
        unit: String,
    },
    /// Action button
    Button,
    /// Read-only text
    Readout {
        /// Text to show
        text: String,
    },
}

/// One labelled widget.
///
/// `target` names the handler or device the control acts on and `id` is the
/// action; together they map to a [`UiCommand`](super::commands::UiCommand).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Control {
    /// Handler or device name
    pub target: String,
    /// Action identifier
    pub id: String,
    /// Label shown to the user
    pub label: String,
    /// Widget
    pub widget: Widget,
}

impl Control {
    /// Build a control.
    pub fn new(
        target: impl Into<String>,
        id: impl Into<String>,
        label: impl Into<String>,
        widget: Widget,
    ) -> Self {
        Self {
            target: target.into(),
            id: id.into(),
            label: label.into(),
            widget,
        }
    }
}

/// Group of controls with a title.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Panel {
    /// Panel title
    pub title: String,
    /// Controls in display order
    pub controls: Vec<Control>,
}

/// Top-level window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Window {
    /// Window title
    pub title: String,
    /// Role
    pub kind: WindowKind,
    /// Panels in display order
    pub panels: Vec<Panel>,
}

impl Window {
    /// Panel by title
    pub fn panel(&self, title: &str) -> Option<&Panel> {
        self.panels.iter().find(|p| p.title == title)
    }

    /// Every control across all panels
    pub fn controls(&self) -> impl Iterator<Item = &Control> {
        self.panels.iter().flat_map(|p| p.controls.iter())
    }

    /// Plain-text rendering used by the console frontend.
    pub fn render_text(&self) -> String {
        let mut out = format!("== {} ==\n", self.title);
        for panel in &self.panels {
            out.push_str(&format!("[{}]\n", panel.title));
            for control in &panel.controls {
                let value = match &control.widget {
                    Widget::Toggle { on } => if *on { "on" } else { "off" }.to_string(),
                    Widget::Choice { options, selected } => options
                        .get(*selected)
                        .cloned()
                        .unwrap_or_else(|| "-".to_string()),
                    Widget::Number { value, unit, .. } => format!("{} {}", value, unit),
                    Widget::Button => "[button]".to_string(),
                    Widget::Readout { text } => text.clone(),
                };
                out.push_str(&format!("  {:<28} {}\n", control.label, value));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_rendering_lists_controls() {
        let window = Window {
            title: "Cockpit".into(),
            kind: WindowKind::Main,
            panels: vec![Panel {
                title: "lights".into(),
                controls: vec![
                    Control::new("488", "enable", "488 enabled", Widget::Toggle { on: true }),
                    Control::new(
                        "488",
                        "power",
                        "488 power",
                        Widget::Number {
                            value: 5.0,
                            min: 0.0,
                            max: 100.0,
                            unit: "mW".into(),
                        },
                    ),
                ],
            }],
        };
        let text = window.render_text();
        assert!(text.contains("== Cockpit =="));
        assert!(text.contains("[lights]"));
        assert!(text.contains("on"));
        assert!(text.contains("5 mW"));
        assert_eq!(window.controls().count(), 2);
        assert!(window.panel("lights").is_some());
    }
}

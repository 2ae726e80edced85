//! GUI layer.
//!
//! Windows are built from whatever handlers and interfaces the depot ended up
//! with, as a toolkit-neutral [`model`]. Frontends render that model and turn
//! user input into [`commands::UiCommand`]s, which the [`event_loop`]
//! dispatches one at a time.
//!
//! The console frontend is always available. The egui frontend is compiled
//! with the `gui` feature.

pub mod commands;
#[cfg(feature = "gui")]
pub mod egui_app;
pub mod event_loop;
#[cfg(feature = "gui")]
mod log_panel;
pub mod model;

use crate::depot::Depot;
use crate::handlers::stage::Axis;
use crate::handlers::{Handler, HandlerRef};
use crate::interfaces::Interfaces;
use model::{Control, Panel, Widget, Window, WindowKind};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Control target for imager actions.
pub const IMAGER_TARGET: &str = "imager";
/// Control target for stage actions.
pub const STAGE_TARGET: &str = "stage";

async fn handler_controls(handler: &HandlerRef) -> Vec<Control> {
    let name = handler.name().to_string();
    let base = handler.as_handler();
    let mut controls = vec![Control::new(
        &name,
        "enable",
        format!("{} ({})", name, base.state()),
        Widget::Toggle {
            on: base.is_enabled(),
        },
    )];
    if let HandlerRef::LightSource(light) = handler {
        let (min, max) = light.power_range();
        if let Ok(power) = light.power_mw().await {
            controls.push(Control::new(
                &name,
                "power",
                format!("{} power", name),
                Widget::Number {
                    value: power,
                    min,
                    max,
                    unit: "mW".into(),
                },
            ));
        }
    }
    controls
}

fn imager_panel(video_running: bool) -> Panel {
    Panel {
        title: "Imaging".into(),
        controls: vec![
            Control::new(IMAGER_TARGET, "take_image", "Snap", Widget::Button),
            Control::new(
                IMAGER_TARGET,
                "video",
                "Video mode",
                Widget::Toggle { on: video_running },
            ),
        ],
    }
}

async fn main_window(title: &str, depot: &Depot, interfaces: &Interfaces) -> Window {
    // One panel per handler group, in order of first appearance.
    let mut order: Vec<String> = Vec::new();
    let mut groups: BTreeMap<String, Vec<Control>> = BTreeMap::new();
    for handler in depot.handlers().iter() {
        let group = handler.as_handler().group_name().to_string();
        if !groups.contains_key(&group) {
            order.push(group.clone());
        }
        let controls = handler_controls(handler).await;
        groups.entry(group).or_default().extend(controls);
    }
    let mut panels: Vec<Panel> = order
        .into_iter()
        .map(|title| Panel {
            controls: groups.remove(&title).unwrap_or_default(),
            title,
        })
        .collect();

    for device in depot.devices() {
        let controls = device.controls().await;
        if !controls.is_empty() {
            panels.push(Panel {
                title: device.name().to_string(),
                controls,
            });
        }
    }
    panels.push(imager_panel(interfaces.imager.is_video_running().await));

    if !depot.failed_devices().is_empty() {
        panels.push(Panel {
            title: "Failed devices".into(),
            controls: depot
                .failed_devices()
                .iter()
                .map(|(name, reason)| {
                    Control::new(
                        name,
                        "failed",
                        name,
                        Widget::Readout {
                            text: reason.clone(),
                        },
                    )
                })
                .collect(),
        });
    }

    Window {
        title: title.to_string(),
        kind: WindowKind::Main,
        panels,
    }
}

async fn stage_window(interfaces: &Interfaces) -> Option<Window> {
    let stage = interfaces.stage.as_ref()?;
    let mut position = Vec::new();
    for axis in Axis::ALL {
        if stage.movers(axis).is_empty() {
            continue;
        }
        let text = match stage.position_of(axis).await {
            Ok(p) => format!("{:.2} µm", p),
            Err(e) => format!("error: {}", e),
        };
        position.push(Control::new(
            STAGE_TARGET,
            format!("position_{}", axis),
            axis.to_string().to_uppercase(),
            Widget::Readout { text },
        ));
    }

    let movers = (0..stage.mover_count()).map(|i| i.to_string()).collect();
    let steps = stage.step_sizes();
    let control = vec![
        Control::new(
            STAGE_TARGET,
            "mover",
            "Mover",
            Widget::Choice {
                options: movers,
                selected: stage.current_mover(),
            },
        ),
        Control::new(
            STAGE_TARGET,
            "step_size",
            "Step size",
            Widget::Choice {
                options: steps.iter().map(|s| format!("{} µm", s)).collect(),
                selected: steps
                    .iter()
                    .position(|s| *s == stage.step_size(Axis::X))
                    .unwrap_or(0),
            },
        ),
        Control::new(STAGE_TARGET, "step_x+", "X +", Widget::Button),
        Control::new(STAGE_TARGET, "step_x-", "X -", Widget::Button),
        Control::new(STAGE_TARGET, "step_y+", "Y +", Widget::Button),
        Control::new(STAGE_TARGET, "step_y-", "Y -", Widget::Button),
        Control::new(STAGE_TARGET, "step_z+", "Z +", Widget::Button),
        Control::new(STAGE_TARGET, "step_z-", "Z -", Widget::Button),
    ];

    Some(Window {
        title: "Stage".into(),
        kind: WindowKind::Stage,
        panels: vec![
            Panel {
                title: "Position".into(),
                controls: position,
            },
            Panel {
                title: "Movement".into(),
                controls: control,
            },
        ],
    })
}

async fn camera_window(camera: &crate::handlers::CameraHandler) -> Window {
    let name = camera.name().to_string();
    let size = camera
        .image_size()
        .await
        .map(|(w, h)| format!("{} x {}", w, h))
        .unwrap_or_else(|e| format!("error: {}", e));
    let last = camera
        .last_image()
        .map(|f| format!("{}x{}, mean {:.1}", f.width, f.height, f.mean()))
        .unwrap_or_else(|| "no image yet".into());
    let mut controls = vec![
        Control::new(&name, "state", "State", Widget::Readout {
            text: camera.state().to_string(),
        }),
        Control::new(&name, "image_size", "Image size", Widget::Readout { text: size }),
        Control::new(&name, "last_image", "Last image", Widget::Readout { text: last }),
    ];
    if let Ok(ms) = camera.exposure_time_ms().await {
        controls.push(Control::new(
            &name,
            "exposure",
            "Exposure",
            Widget::Number {
                value: ms,
                min: 0.0,
                max: 10_000.0,
                unit: "ms".into(),
            },
        ));
    }
    let processors = camera.post_processors().names();
    if !processors.is_empty() {
        controls.push(Control::new(
            &name,
            "post_processors",
            "Post-processing",
            Widget::Readout {
                text: processors.join(", "),
            },
        ));
    }
    Window {
        title: name,
        kind: WindowKind::Camera,
        panels: vec![Panel {
            title: "Camera".into(),
            controls,
        }],
    }
}

/// Build every window: main, stage (when positioners exist) and one per camera.
pub async fn build_windows(title: &str, depot: &Depot, interfaces: &Interfaces) -> Vec<Window> {
    let mut windows = vec![main_window(title, depot, interfaces).await];
    if let Some(stage) = stage_window(interfaces).await {
        windows.push(stage);
    }
    for camera in depot.cameras() {
        windows.push(camera_window(&camera).await);
    }
    windows
}

/// Rebuild the windows every `period` and publish them on a watch channel.
pub fn spawn_window_refresher(
    title: String,
    depot: Arc<Depot>,
    interfaces: Arc<Interfaces>,
    initial: Vec<Window>,
    period: Duration,
) -> (watch::Receiver<Vec<Window>>, JoinHandle<()>) {
    let (tx, rx) = watch::channel(initial);
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            let windows = build_windows(&title, &depot, &interfaces).await;
            if tx.send(windows).is_err() {
                break;
            }
        }
    });
    (rx, task)
}

//! Objective turret handler.

use super::{Handler, HandlerCore, HandlerKind, HandlerState};
use crate::devices::frame::Transform;
use crate::error::{AppResult, CockpitError};
use crate::events::{Event, EventBus};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{PoisonError, RwLock};

/// One objective lens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectiveSpec {
    /// Display name, e.g. "60x water"
    pub name: String,
    /// Microns per pixel at the camera
    pub pixel_size: f64,
    /// Image transform of the light path through this objective
    #[serde(default)]
    pub transform: Transform,
    /// XYZ offset relative to the reference objective (µm)
    #[serde(default)]
    pub offset: [f64; 3],
    /// Colour used in the GUI
    #[serde(default)]
    pub colour: Option<String>,
    /// Working-distance safety lens ID, if any
    #[serde(default)]
    pub lens_id: Option<u32>,
}

/// Handler tracking which objective is in the light path.
pub struct ObjectiveHandler {
    core: HandlerCore,
    objectives: Vec<ObjectiveSpec>,
    current: RwLock<usize>,
}

impl ObjectiveHandler {
    /// Create the handler. `initial` selects the starting objective by name
    /// and defaults to the first one.
    pub fn new(
        name: impl Into<String>,
        group_name: impl Into<String>,
        objectives: Vec<ObjectiveSpec>,
        initial: Option<&str>,
        bus: EventBus,
    ) -> AppResult<Self> {
        let name = name.into();
        if objectives.is_empty() {
            return Err(CockpitError::Configuration(format!(
                "objective handler '{}' needs at least one objective",
                name
            )));
        }
        let current = match initial {
            Some(wanted) => objectives
                .iter()
                .position(|o| o.name == wanted)
                .ok_or_else(|| {
                    CockpitError::Configuration(format!(
                        "initial objective '{}' is not defined",
                        wanted
                    ))
                })?,
            None => 0,
        };
        Ok(Self {
            core: HandlerCore::new(name, group_name, false, HandlerState::Enabled, bus),
            objectives,
            current: RwLock::new(current),
        })
    }

    /// Objective names in configuration order
    pub fn names(&self) -> Vec<&str> {
        self.objectives.iter().map(|o| o.name.as_str()).collect()
    }

    /// All objectives
    pub fn objectives(&self) -> &[ObjectiveSpec] {
        &self.objectives
    }

    /// The objective currently in use
    pub fn current(&self) -> &ObjectiveSpec {
        let index = *self.current.read().unwrap_or_else(PoisonError::into_inner);
        &self.objectives[index.min(self.objectives.len() - 1)]
    }

    /// Pixel size of the current objective (µm)
    pub fn pixel_size(&self) -> f64 {
        self.current().pixel_size
    }

    /// Offset of the current objective (µm)
    pub fn offset(&self) -> [f64; 3] {
        self.current().offset
    }

    /// Transform of the current objective
    pub fn transform(&self) -> Transform {
        self.current().transform
    }

    /// Switch objective and publish `ObjectiveChange`.
    pub fn change_objective(&self, name: &str) -> AppResult<()> {
        let index = self
            .objectives
            .iter()
            .position(|o| o.name == name)
            .ok_or_else(|| CockpitError::device(self.name(), format!("no objective '{}'", name)))?;
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = index;

        let objective = &self.objectives[index];
        tracing::info!(objective = %objective.name, pixel_size = objective.pixel_size, "objective changed");
        self.core.bus().publish(Event::ObjectiveChange {
            objective: objective.name.clone(),
            transform: objective.transform,
        });
        Ok(())
    }
}

#[async_trait]
impl Handler for ObjectiveHandler {
    fn core(&self) -> &HandlerCore {
        &self.core
    }

    fn kind(&self) -> HandlerKind {
        HandlerKind::Objective
    }

    async fn set_enabled(&self, enabled: bool) -> AppResult<HandlerState> {
        self.core.apply_enable(enabled, async move { Ok(enabled) }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, pixel_size: f64, flip_lr: bool) -> ObjectiveSpec {
        ObjectiveSpec {
            name: name.to_string(),
            pixel_size,
            transform: Transform::new(flip_lr, false, false),
            offset: [0.0; 3],
            colour: None,
            lens_id: None,
        }
    }

    #[test]
    fn change_publishes_transform() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let handler = ObjectiveHandler::new(
            "objective",
            "objectives",
            vec![spec("10x", 0.65, false), spec("60x", 0.108, true)],
            None,
            bus,
        )
        .unwrap();
        assert_eq!(handler.current().name, "10x");

        handler.change_objective("60x").unwrap();
        assert_eq!(handler.pixel_size(), 0.108);
        match rx.try_recv().unwrap() {
            Event::ObjectiveChange {
                objective,
                transform,
            } => {
                assert_eq!(objective, "60x");
                assert!(transform.flip_lr);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(handler.change_objective("100x").is_err());
    }

    #[test]
    fn initial_objective_must_exist() {
        let result = ObjectiveHandler::new(
            "objective",
            "objectives",
            vec![spec("10x", 0.65, false)],
            Some("40x"),
            EventBus::default(),
        );
        assert!(result.is_err());
    }
}

//! Objective lookup for the rest of the application.
//!
//! Without a configured objective turret the microscope behaves as if a
//! single unnamed objective with unit pixel size and no offset were fitted.

use crate::devices::frame::Transform;
use crate::error::{AppResult, CockpitError};
use crate::handlers::ObjectiveHandler;
use std::sync::Arc;

/// Name reported when no objective handler exists.
pub const NO_OBJECTIVE: &str = "none";

/// Objective interface.
pub struct Objectives {
    handler: Option<Arc<ObjectiveHandler>>,
}

impl Objectives {
    /// Wrap the depot's objective handler, if any.
    pub fn new(handler: Option<Arc<ObjectiveHandler>>) -> Self {
        Self { handler }
    }

    /// Whether an objective turret is configured
    pub fn is_configured(&self) -> bool {
        self.handler.is_some()
    }

    /// Objective names in turret order
    pub fn names(&self) -> Vec<String> {
        self.handler.as_ref().map_or_else(Vec::new, |h| {
            h.names().into_iter().map(str::to_string).collect()
        })
    }

    /// Name of the objective in use
    pub fn current(&self) -> String {
        self.handler
            .as_ref()
            .map_or_else(|| NO_OBJECTIVE.to_string(), |h| h.current().name.clone())
    }

    /// Pixel size (µm) of the objective in use
    pub fn pixel_size(&self) -> f64 {
        self.handler.as_ref().map_or(1.0, |h| h.pixel_size())
    }

    /// XYZ offset (µm) of the objective in use
    pub fn offset(&self) -> [f64; 3] {
        self.handler.as_ref().map_or([0.0; 3], |h| h.offset())
    }

    /// Image transform of the objective in use
    pub fn transform(&self) -> Transform {
        self.handler
            .as_ref()
            .map_or_else(Transform::default, |h| h.transform())
    }

    /// Switch objective.
    pub fn change(&self, name: &str) -> AppResult<()> {
        self.handler
            .as_ref()
            .ok_or_else(|| CockpitError::HandlerNotFound("objective".into()))?
            .change_objective(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::handlers::objective::ObjectiveSpec;

    fn spec(name: &str, pixel_size: f64) -> ObjectiveSpec {
        ObjectiveSpec {
            name: name.into(),
            pixel_size,
            transform: Transform::default(),
            offset: [0.0, 0.0, 10.0],
            colour: None,
            lens_id: None,
        }
    }

    #[test]
    fn defaults_without_turret() {
        let objectives = Objectives::new(None);
        assert!(!objectives.is_configured());
        assert_eq!(objectives.current(), NO_OBJECTIVE);
        assert_eq!(objectives.pixel_size(), 1.0);
        assert!(objectives.change("60x").is_err());
    }

    #[test]
    fn change_updates_pixel_size() {
        let handler = ObjectiveHandler::new(
            "objectives",
            "objective",
            vec![spec("10x", 0.65), spec("60x", 0.108)],
            None,
            EventBus::default(),
        )
        .unwrap();
        let objectives = Objectives::new(Some(Arc::new(handler)));
        assert_eq!(objectives.current(), "10x");
        objectives.change("60x").unwrap();
        assert_eq!(objectives.pixel_size(), 0.108);
        assert_eq!(objectives.offset()[2], 10.0);
    }
}

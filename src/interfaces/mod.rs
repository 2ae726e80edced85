//! Interfaces: capabilities that span several handlers.
//!
//! Interfaces reference handlers collected by the depot; they never own a
//! device. They are built once, after the depot is finalized.

pub mod imager;
pub mod objectives;
pub mod stage_mover;

pub use imager::Imager;
pub use objectives::Objectives;
pub use stage_mover::StageMover;

use crate::depot::Depot;
use std::sync::Arc;
use std::time::Duration;

/// All interfaces of a running application.
pub struct Interfaces {
    /// Stage control; `None` without any positioner
    pub stage: Option<Arc<StageMover>>,
    /// Image acquisition
    pub imager: Arc<Imager>,
    /// Objective lookup
    pub objectives: Arc<Objectives>,
}

impl Interfaces {
    /// Build the interfaces from the depot's handlers.
    pub fn initialize(depot: &Arc<Depot>, video_interval: Duration) -> Self {
        let positioners = depot.stage_positioners();
        let stage = (!positioners.is_empty()).then(|| Arc::new(StageMover::new(positioners)));
        let interfaces = Self {
            stage,
            imager: Arc::new(Imager::new(Arc::clone(depot), video_interval)),
            objectives: Arc::new(Objectives::new(depot.objective())),
        };
        tracing::info!(
            stage = interfaces.stage.is_some(),
            cameras = depot.cameras().len(),
            objective = %interfaces.objectives.current(),
            "interfaces initialized"
        );
        interfaces
    }
}

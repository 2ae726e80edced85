//! Experiments.
//!
//! Experiments run on top of the interfaces: they drive the imager and the
//! stage, talk to handlers directly where no interface exists, and announce
//! their start and end on the event bus so devices can save and restore
//! their settings.

pub mod bias;
pub mod dataset;
pub mod state;
pub mod tiff;

pub use bias::{make_bias_polytope, AberrationGenerator, BiasSet, SweepParameters};
pub use dataset::{BiasDatasetConfig, BiasDatasetExperiment};
pub use state::{ExperimentState, RunRecord};
pub use tiff::TiffWriter;

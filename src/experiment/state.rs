//! Experiment state and run records.
//!
//! Each finished (or aborted) run leaves a small JSON record next to its data
//! so a dataset can be traced back to the parameters that produced it.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Experiment execution state.
///
/// ```text
/// Idle ──run──> Running ──last rep──> Complete
///                  │
///                  ├──abort──> Aborted
///                  └──error──> Error
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExperimentState {
    /// Not started
    Idle,
    /// Reps are being executed
    Running,
    /// All reps done
    Complete,
    /// Stopped by the user
    Aborted,
    /// Stopped by an error
    Error,
}

impl std::fmt::Display for ExperimentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExperimentState::Idle => write!(f, "Idle"),
            ExperimentState::Running => write!(f, "Running"),
            ExperimentState::Complete => write!(f, "Complete"),
            ExperimentState::Aborted => write!(f, "Aborted"),
            ExperimentState::Error => write!(f, "Error"),
        }
    }
}

impl ExperimentState {
    /// Whether a run may start from this state.
    pub fn can_begin(&self) -> bool {
        !matches!(self, ExperimentState::Running)
    }

    /// Whether the run has ended, successfully or not.
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            ExperimentState::Complete | ExperimentState::Aborted | ExperimentState::Error
        )
    }
}

/// Summary of one experiment run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    /// Unique run identifier
    pub run_id: String,
    /// Experiment name
    pub experiment: String,
    /// Start time
    pub started: DateTime<Utc>,
    /// End time
    pub finished: Option<DateTime<Utc>>,
    /// Final state
    pub state: ExperimentState,
    /// Reps executed
    pub reps_done: usize,
    /// Reps planned
    pub reps_total: usize,
    /// Files written, in order
    pub files: Vec<PathBuf>,
    /// Experiment parameters
    pub parameters: BTreeMap<String, String>,
    /// Error message if the run failed
    pub error: Option<String>,
}

impl RunRecord {
    /// Record for a run that is starting now.
    pub fn start(experiment: impl Into<String>, reps_total: usize) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            experiment: experiment.into(),
            started: Utc::now(),
            finished: None,
            state: ExperimentState::Running,
            reps_done: 0,
            reps_total,
            files: Vec::new(),
            parameters: BTreeMap::new(),
            error: None,
        }
    }

    /// Attach a parameter.
    pub fn with_parameter(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.parameters.insert(key.into(), value.to_string());
        self
    }

    /// Close the record with its final state.
    pub fn finish(&mut self, state: ExperimentState, error: Option<String>) {
        self.state = state;
        self.error = error;
        self.finished = Some(Utc::now());
    }

    /// Save as pretty JSON, creating parent directories.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("Failed to serialize run record")?;
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent).context("Failed to create run record directory")?;
        }
        fs::write(&path, json)
            .with_context(|| format!("Failed to write run record to {:?}", path.as_ref()))?;
        Ok(())
    }

    /// Load a saved record.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read run record from {:?}", path.as_ref()))?;
        serde_json::from_str(&json).context("Failed to deserialize run record")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_state_transitions() {
        assert!(ExperimentState::Idle.can_begin());
        assert!(!ExperimentState::Running.can_begin());
        assert!(ExperimentState::Aborted.can_begin());
        assert!(ExperimentState::Aborted.is_finished());
        assert!(!ExperimentState::Running.is_finished());
    }

    #[test]
    fn test_record_save_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("run.json");

        let mut record = RunRecord::start("bias dataset", 4).with_parameter("areas", 2);
        record.reps_done = 4;
        record.files.push(PathBuf::from("a.tiff"));
        record.finish(ExperimentState::Complete, None);
        record.save(&path).unwrap();

        let loaded = RunRecord::load(&path).unwrap();
        assert_eq!(loaded.run_id, record.run_id);
        assert_eq!(loaded.state, ExperimentState::Complete);
        assert_eq!(loaded.parameters["areas"], "2");
        assert!(loaded.finished.is_some());
    }
}

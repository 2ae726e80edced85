//! Bias image dataset acquisition.
//!
//! For every bias set produced by the [`AberrationGenerator`] the experiment
//! applies each mode vector to the deformable mirror, takes one image per
//! vector and writes the images as a TIFF stack named after the set. Before
//! the first set of a new area the stage moves diagonally to fresh sample.
//!
//! Mirror failures are logged and imaging continues; a camera that does not
//! deliver an image in time fails the run.

use crate::depot::Depot;
use crate::devices::frame::Frame;
use crate::error::{AppResult, CockpitError};
use crate::events::{Event, EventBus};
use crate::experiment::bias::{AberrationGenerator, BiasSet, SweepParameters};
use crate::experiment::state::{ExperimentState, RunRecord};
use crate::experiment::tiff::TiffWriter;
use crate::handlers::stage::Axis;
use crate::handlers::{AdaptiveOpticsHandler, CameraHandler, Handler};
use crate::interfaces::{Imager, Interfaces, StageMover};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

/// Name shown to the user and published on completion.
pub const EXPERIMENT_NAME: &str = "BiasImageDatasetExperiment";

/// Allowance on top of the exposure time when waiting for an image.
pub const CAMERA_TIMEOUT: Duration = Duration::from_secs(2);

/// Stage displacement (µm) between imaging areas.
pub const AREA_SHIFT: (f64, f64) = (50.0, -50.0);

/// Experiment parameters.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BiasDatasetConfig {
    /// Modes biased in every polytope (0-indexed Noll)
    pub bias_modes: Vec<usize>,
    /// Modes swept through the applied amplitudes
    pub applied_modes: Vec<usize>,
    /// Largest applied amplitude
    pub magnitude: f64,
    /// Number of applied amplitudes
    pub steps: usize,
    /// Number of imaging areas
    pub areas: usize,
    /// Prefix of every file written
    pub save_prefix: String,
    /// Adaptive optics handler name
    pub ao: String,
    /// Camera to image with; the first active camera when unset
    pub camera: Option<String>,
}

impl Default for BiasDatasetConfig {
    fn default() -> Self {
        let sweep = SweepParameters::default();
        Self {
            bias_modes: sweep.bias_modes,
            applied_modes: sweep.applied_modes,
            magnitude: sweep.magnitude,
            steps: sweep.steps,
            areas: sweep.areas,
            save_prefix: "BIDE_".into(),
            ao: "ao".into(),
            camera: None,
        }
    }
}

impl BiasDatasetConfig {
    /// Sweep described by these parameters
    pub fn sweep(&self) -> SweepParameters {
        SweepParameters {
            bias_modes: self.bias_modes.clone(),
            applied_modes: self.applied_modes.clone(),
            magnitude: self.magnitude,
            steps: self.steps,
            areas: self.areas,
        }
    }
}

/// The bias dataset experiment.
pub struct BiasDatasetExperiment {
    config: BiasDatasetConfig,
    depot: Arc<Depot>,
    imager: Arc<Imager>,
    stage: Option<Arc<StageMover>>,
    ao: Arc<AdaptiveOpticsHandler>,
    bus: EventBus,
    data_dir: PathBuf,
    abort: Arc<AtomicBool>,
    state: RwLock<ExperimentState>,
}

impl BiasDatasetExperiment {
    /// Prepare an experiment writing to `data_dir`.
    pub fn new(
        config: BiasDatasetConfig,
        depot: Arc<Depot>,
        interfaces: &Interfaces,
        data_dir: impl Into<PathBuf>,
    ) -> AppResult<Self> {
        let ao = depot.adaptive_optics(&config.ao)?;
        let vector_len = config.sweep().vector_len();
        if vector_len > ao.n_modes() {
            return Err(CockpitError::Experiment(format!(
                "sweep needs {} modes but '{}' has {}",
                vector_len,
                config.ao,
                ao.n_modes()
            )));
        }
        Ok(Self {
            bus: depot.bus().clone(),
            imager: Arc::clone(&interfaces.imager),
            stage: interfaces.stage.clone(),
            config,
            depot,
            ao,
            data_dir: data_dir.into(),
            abort: Arc::new(AtomicBool::new(false)),
            state: RwLock::new(ExperimentState::Idle),
        })
    }

    /// Number of reps (bias sets) the run executes
    pub fn rep_count(&self) -> usize {
        self.config.sweep().set_count()
    }

    /// Current state
    pub fn state(&self) -> ExperimentState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ExperimentState) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Ask the run to stop after the current image.
    pub fn abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }

    fn camera(&self) -> AppResult<Arc<CameraHandler>> {
        let active = self.depot.active_cameras();
        match &self.config.camera {
            Some(name) => active
                .into_iter()
                .find(|c| c.name() == name)
                .ok_or_else(|| CockpitError::Experiment(format!("camera '{}' is not active", name))),
            None => active
                .into_iter()
                .next()
                .ok_or_else(|| CockpitError::Experiment("no active camera".into())),
        }
    }

    /// File the images of `set` are written to.
    pub fn set_path(&self, set: &BiasSet) -> PathBuf {
        self.data_dir
            .join(format!("{}{}.tiff", self.config.save_prefix, set.prefix))
    }

    /// Execute the whole sweep.
    ///
    /// Video mode is suspended for the duration. The run record is written
    /// to the data directory whatever the outcome.
    pub async fn run(&self) -> AppResult<RunRecord> {
        let camera = self.camera()?;
        std::fs::create_dir_all(&self.data_dir).map_err(|e| {
            CockpitError::Experiment(format!(
                "cannot create data directory {}: {}",
                self.data_dir.display(),
                e
            ))
        })?;
        {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            if !state.can_begin() {
                return Err(CockpitError::ExperimentRunning);
            }
            *state = ExperimentState::Running;
        }
        self.abort.store(false, Ordering::SeqCst);

        let mut record = RunRecord::start(EXPERIMENT_NAME, self.rep_count())
            .with_parameter("bias_modes", format!("{:?}", self.config.bias_modes))
            .with_parameter("applied_modes", format!("{:?}", self.config.applied_modes))
            .with_parameter("magnitude", self.config.magnitude)
            .with_parameter("steps", self.config.steps)
            .with_parameter("areas", self.config.areas)
            .with_parameter("camera", camera.name());

        let abort_watch = self.watch_user_abort();
        self.bus.publish(Event::PrepareForExperiment);
        if let Err(e) = camera.prepare_for_experiment().await {
            tracing::warn!(error = %e, "camera preparation failed");
        }

        let outcome = self
            .imager
            .pause_video(|| self.execute(&camera, &mut record))
            .await
            .and_then(|r| r);

        abort_watch.abort();
        self.bus.publish(Event::CleanupAfterExperiment);

        let state = match &outcome {
            Ok(()) if self.abort.load(Ordering::SeqCst) => ExperimentState::Aborted,
            Ok(()) => ExperimentState::Complete,
            Err(_) => ExperimentState::Error,
        };
        record.finish(state, outcome.as_ref().err().map(ToString::to_string));
        self.set_state(state);
        let record_path = self
            .data_dir
            .join(format!("{}{}.json", self.config.save_prefix, record.run_id));
        if let Err(e) = record.save(&record_path) {
            tracing::warn!(error = %e, path = ?record_path, "could not save run record");
        }

        match outcome {
            Ok(()) => {
                if state == ExperimentState::Complete {
                    tracing::info!(files = record.files.len(), "-----Experiment Complete-----");
                    self.bus.publish(Event::ExperimentComplete {
                        name: EXPERIMENT_NAME.into(),
                    });
                } else {
                    tracing::info!(reps_done = record.reps_done, "experiment aborted");
                }
                Ok(record)
            }
            Err(e) => Err(e),
        }
    }

    fn watch_user_abort(&self) -> tokio::task::JoinHandle<()> {
        let mut rx = self.bus.subscribe();
        let abort = Arc::clone(&self.abort);
        tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                if matches!(event, Event::UserAbort) {
                    abort.store(true, Ordering::SeqCst);
                }
            }
        })
    }

    async fn execute(&self, camera: &CameraHandler, record: &mut RunRecord) -> AppResult<()> {
        let started = std::time::Instant::now();
        let total = self.rep_count();
        for (rep, set) in AberrationGenerator::new(self.config.sweep()).enumerate() {
            if self.abort.load(Ordering::SeqCst) {
                return Ok(());
            }
            tracing::info!(
                rep = rep + 1,
                total,
                elapsed_s = format!("{:.1}", started.elapsed().as_secs_f64()),
                "started rep"
            );

            if set.new_area {
                self.move_to_new_area().await?;
            }

            let images = self.image_set(camera, &set).await?;
            if images.len() < set.biases.len() {
                // Aborted part way through the set.
                return Ok(());
            }
            let path = self.set_path(&set);
            let written = TiffWriter::write_stack(&images, &path)
                .map_err(|e| CockpitError::Experiment(format!("{:#}", e)))?;
            record.files.push(written);
            record.reps_done += 1;
        }
        Ok(())
    }

    async fn image_set(&self, camera: &CameraHandler, set: &BiasSet) -> AppResult<Vec<Frame>> {
        let exposure_ms = camera.exposure_time_ms().await?;
        let timeout = Duration::try_from_secs_f64(exposure_ms / 1000.0)
            .ok()
            .and_then(|exposure| exposure.checked_add(CAMERA_TIMEOUT))
            .ok_or_else(|| {
                CockpitError::Experiment(format!("exposure time {} ms is out of range", exposure_ms))
            })?;
        let mut images = Vec::with_capacity(set.biases.len());
        let mut mirror_failed = false;

        for bias in &set.biases {
            if self.abort.load(Ordering::SeqCst) {
                break;
            }
            if let Err(e) = self.ao.set_phase(bias).await {
                tracing::debug!(error = %e, "set_phase failed");
                mirror_failed = true;
            }
            let name = camera.name().to_string();
            let event = self
                .bus
                .execute_and_wait_for(
                    |e| e.is_image_from(&name),
                    || self.imager.take_image(),
                    timeout,
                    "image capture",
                )
                .await?;
            if let Event::NewImage { frame, .. } = event {
                images.push(Frame::clone(&frame));
            }
        }
        if mirror_failed {
            tracing::warn!(set = %set.prefix, "Didn't set the aberration on the DM");
        }
        Ok(images)
    }

    async fn move_to_new_area(&self) -> AppResult<()> {
        let Some(stage) = &self.stage else {
            tracing::warn!("no stage: new area imaged in place");
            return Ok(());
        };
        let x = stage.position_of(Axis::X).await?;
        let y = stage.position_of(Axis::Y).await?;
        tracing::info!(x = x + AREA_SHIFT.0, y = y + AREA_SHIFT.1, "moving to new area");
        stage.go_to_xy(x + AREA_SHIFT.0, y + AREA_SHIFT.1).await
    }

    /// Directory data is written to
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }
}

//! Coordinated XYZ stage control.
//!
//! An axis may be driven by several positioners, e.g. a coarse motor stage
//! and a fine piezo. The position of an axis is the sum of its positioners.
//! Moves go through the *current mover*: a single index selecting, on every
//! axis, which positioner the user is driving.

use crate::error::{AppResult, CockpitError};
use crate::handlers::stage::{Axis, StagePositionerHandler};
use crate::handlers::Handler;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// Step sizes (µm) offered for keyboard/button stepping.
pub const DEFAULT_STEP_SIZES: [f64; 10] = [0.1, 0.2, 0.5, 1.0, 2.0, 5.0, 10.0, 50.0, 100.0, 1000.0];

const DEFAULT_STEP_INDEX: usize = 6;

/// Stage interface over all positioners.
pub struct StageMover {
    movers: [Vec<Arc<StagePositionerHandler>>; 3],
    current: AtomicUsize,
    step_sizes: Vec<f64>,
    step_index: RwLock<[usize; 3]>,
}

impl StageMover {
    /// Group `positioners` by axis, keeping their order.
    pub fn new(positioners: Vec<Arc<StagePositionerHandler>>) -> Self {
        let mut movers: [Vec<Arc<StagePositionerHandler>>; 3] = Default::default();
        for positioner in positioners {
            movers[positioner.axis().index()].push(positioner);
        }
        let start = DEFAULT_STEP_INDEX.min(DEFAULT_STEP_SIZES.len() - 1);
        Self {
            movers,
            current: AtomicUsize::new(0),
            step_sizes: DEFAULT_STEP_SIZES.to_vec(),
            step_index: RwLock::new([start; 3]),
        }
    }

    /// Positioners of one axis, coarsest first
    pub fn movers(&self, axis: Axis) -> &[Arc<StagePositionerHandler>] {
        &self.movers[axis.index()]
    }

    /// Largest number of positioners on any axis
    pub fn mover_count(&self) -> usize {
        self.movers.iter().map(Vec::len).max().unwrap_or(0)
    }

    /// Index of the positioner being driven
    pub fn current_mover(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    /// Select which positioner moves are sent to.
    pub fn set_current_mover(&self, index: usize) -> AppResult<()> {
        if index >= self.mover_count() {
            return Err(CockpitError::device(
                "stage",
                format!("no mover {} (have {})", index, self.mover_count()),
            ));
        }
        self.current.store(index, Ordering::SeqCst);
        Ok(())
    }

    /// Advance to the next mover, wrapping around.
    pub fn next_mover(&self) -> usize {
        let count = self.mover_count().max(1);
        let next = (self.current_mover() + 1) % count;
        self.current.store(next, Ordering::SeqCst);
        next
    }

    fn mover_for(&self, axis: Axis) -> AppResult<&Arc<StagePositionerHandler>> {
        let movers = self.movers(axis);
        if movers.is_empty() {
            return Err(CockpitError::HandlerNotFound(format!("stage {} axis", axis)));
        }
        // Axes with fewer positioners use their finest one.
        Ok(&movers[self.current_mover().min(movers.len() - 1)])
    }

    /// Position of one axis: the sum of its positioners.
    pub async fn position_of(&self, axis: Axis) -> AppResult<f64> {
        let mut sum = 0.0;
        for mover in self.movers(axis) {
            sum += mover.position().await?;
        }
        Ok(sum)
    }

    /// XYZ position in microns
    pub async fn position(&self) -> AppResult<[f64; 3]> {
        Ok([
            self.position_of(Axis::X).await?,
            self.position_of(Axis::Y).await?,
            self.position_of(Axis::Z).await?,
        ])
    }

    /// Move `axis` so that its summed position is `target`.
    pub async fn go_to(&self, axis: Axis, target: f64) -> AppResult<f64> {
        let mover = self.mover_for(axis)?;
        let others = self.position_of(axis).await? - mover.position().await?;
        mover.move_absolute(target - others).await?;
        self.position_of(axis).await
    }

    /// Move X then Y.
    pub async fn go_to_xy(&self, x: f64, y: f64) -> AppResult<()> {
        self.go_to(Axis::X, x).await?;
        self.go_to(Axis::Y, y).await?;
        Ok(())
    }

    /// Move all three axes.
    pub async fn go_to_xyz(&self, position: [f64; 3]) -> AppResult<()> {
        for axis in Axis::ALL {
            if !self.movers(axis).is_empty() {
                self.go_to(axis, position[axis.index()]).await?;
            }
        }
        Ok(())
    }

    /// Move the current mover of `axis` by `delta`.
    pub async fn move_relative(&self, axis: Axis, delta: f64) -> AppResult<f64> {
        self.mover_for(axis)?.move_relative(delta).await?;
        self.position_of(axis).await
    }

    /// Step `axis` by one step size; `direction` is +1 or -1.
    pub async fn step(&self, axis: Axis, direction: i8) -> AppResult<f64> {
        let delta = self.step_size(axis) * f64::from(direction.signum());
        self.move_relative(axis, delta).await
    }

    /// Current step size for `axis`
    pub fn step_size(&self, axis: Axis) -> f64 {
        let index = self.step_index.read().unwrap_or_else(PoisonError::into_inner)[axis.index()];
        self.step_sizes[index]
    }

    /// Available step sizes
    pub fn step_sizes(&self) -> &[f64] {
        &self.step_sizes
    }

    /// Move to the next larger (`up`) or smaller step size on every axis.
    ///
    /// Stays at the end of the list rather than wrapping.
    pub fn change_step_size(&self, up: bool) -> f64 {
        let last = self.step_sizes.len() - 1;
        let mut indices = self
            .step_index
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        for index in indices.iter_mut() {
            *index = if up {
                (*index + 1).min(last)
            } else {
                index.saturating_sub(1)
            };
        }
        self.step_sizes[indices[Axis::X.index()]]
    }

    /// Pick a step size by its index in [`step_sizes`](Self::step_sizes).
    pub fn set_step_size_index(&self, index: usize) -> AppResult<f64> {
        let size = *self.step_sizes.get(index).ok_or_else(|| {
            CockpitError::device("stage", format!("no step size {}", index))
        })?;
        *self
            .step_index
            .write()
            .unwrap_or_else(PoisonError::into_inner) = [index; 3];
        Ok(size)
    }

    /// Soft limits of the current mover on `axis`.
    pub fn soft_limits(&self, axis: Axis) -> AppResult<(f64, f64)> {
        Ok(self.mover_for(axis)?.soft_limits())
    }

    /// Names of the enabled positioners, for status display.
    pub fn enabled_movers(&self) -> Vec<String> {
        self.movers
            .iter()
            .flatten()
            .filter(|m| m.is_enabled())
            .map(|m| m.name().to_string())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::simulated::SimulatedAxis;
    use crate::events::EventBus;

    fn positioner(name: &str, axis: Axis, min: f64, max: f64) -> Arc<StagePositionerHandler> {
        Arc::new(StagePositionerHandler::new(
            name,
            "stage",
            axis,
            Arc::new(SimulatedAxis::new(min, max, 0.0, 0.0)),
            EventBus::default(),
        ))
    }

    fn coarse_and_fine() -> StageMover {
        StageMover::new(vec![
            positioner("x", Axis::X, -1000.0, 1000.0),
            positioner("y", Axis::Y, -1000.0, 1000.0),
            positioner("z", Axis::Z, -1000.0, 1000.0),
            positioner("z piezo", Axis::Z, 0.0, 100.0),
        ])
    }

    #[tokio::test]
    async fn position_sums_movers() {
        let stage = coarse_and_fine();
        stage.go_to(Axis::Z, 30.0).await.unwrap();
        stage.set_current_mover(1).unwrap();
        stage.move_relative(Axis::Z, 5.0).await.unwrap();
        assert_eq!(stage.position_of(Axis::Z).await.unwrap(), 35.0);
        assert_eq!(stage.movers(Axis::Z)[1].position().await.unwrap(), 5.0);
    }

    #[tokio::test]
    async fn go_to_accounts_for_other_movers() {
        let stage = coarse_and_fine();
        stage.set_current_mover(1).unwrap();
        stage.go_to(Axis::Z, 50.0).await.unwrap();
        stage.set_current_mover(0).unwrap();
        let z = stage.go_to(Axis::Z, 200.0).await.unwrap();
        assert_eq!(z, 200.0);
        assert_eq!(stage.movers(Axis::Z)[0].position().await.unwrap(), 150.0);
    }

    #[tokio::test]
    async fn axes_with_one_mover_use_it_for_any_index() {
        let stage = coarse_and_fine();
        stage.set_current_mover(1).unwrap();
        stage.go_to_xy(10.0, -20.0).await.unwrap();
        let [x, y, _] = stage.position().await.unwrap();
        assert_eq!((x, y), (10.0, -20.0));
    }

    #[test]
    fn mover_selection_is_bounded_and_wraps() {
        let stage = coarse_and_fine();
        assert_eq!(stage.mover_count(), 2);
        assert!(stage.set_current_mover(2).is_err());
        assert_eq!(stage.next_mover(), 1);
        assert_eq!(stage.next_mover(), 0);
    }

    #[test]
    fn step_size_stops_at_ends() {
        let stage = coarse_and_fine();
        for _ in 0..20 {
            stage.change_step_size(true);
        }
        assert_eq!(stage.step_size(Axis::X), 1000.0);
        for _ in 0..20 {
            stage.change_step_size(false);
        }
        assert_eq!(stage.step_size(Axis::Y), 0.1);
    }

    #[tokio::test]
    async fn moves_outside_soft_limits_fail() {
        let stage = coarse_and_fine();
        stage.set_current_mover(1).unwrap();
        assert_eq!(stage.soft_limits(Axis::Z).unwrap(), (0.0, 100.0));
        assert!(stage.move_relative(Axis::Z, 500.0).await.is_err());
    }
}

//! Stage positioner handler: one axis of one stage.

use super::{Handler, HandlerCore, HandlerKind, HandlerState};
use crate::devices::capabilities::Movable;
use crate::error::{AppResult, CockpitError};
use crate::events::{Event, EventBus};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, PoisonError, RwLock};

/// Stage axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    /// X (horizontal)
    X,
    /// Y (horizontal)
    Y,
    /// Z (focus)
    Z,
}

impl Axis {
    /// All axes in index order
    pub const ALL: [Axis; 3] = [Axis::X, Axis::Y, Axis::Z];

    /// Index into per-axis arrays
    pub fn index(self) -> usize {
        match self {
            Axis::X => 0,
            Axis::Y => 1,
            Axis::Z => 2,
        }
    }
}

impl std::fmt::Display for Axis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Axis::X => "x",
            Axis::Y => "y",
            Axis::Z => "z",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for Axis {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "x" | "0" => Ok(Axis::X),
            "y" | "1" => Ok(Axis::Y),
            "z" | "2" => Ok(Axis::Z),
            other => Err(format!("Invalid axis '{}'. Must be one of: x, y, z", other)),
        }
    }
}

/// Handler for one stage axis.
///
/// Positions are microns. Moves are checked against the soft limits, which
/// start out equal to the hardware limits and may only narrow them.
pub struct StagePositionerHandler {
    core: HandlerCore,
    axis: Axis,
    mover: Arc<dyn Movable>,
    soft_limits: RwLock<(f64, f64)>,
}

impl StagePositionerHandler {
    /// Create a handler; stage axes start out enabled.
    pub fn new(
        name: impl Into<String>,
        group_name: impl Into<String>,
        axis: Axis,
        mover: Arc<dyn Movable>,
        bus: EventBus,
    ) -> Self {
        let limits = mover.limits();
        Self {
            core: HandlerCore::new(name, group_name, true, HandlerState::Enabled, bus),
            axis,
            mover,
            soft_limits: RwLock::new(limits),
        }
    }

    /// Axis this handler moves
    pub fn axis(&self) -> Axis {
        self.axis
    }

    /// Hardware travel limits
    pub fn hard_limits(&self) -> (f64, f64) {
        self.mover.limits()
    }

    /// Current soft limits
    pub fn soft_limits(&self) -> (f64, f64) {
        *self.soft_limits.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Narrow the soft limits. They must lie within the hardware limits.
    pub fn set_soft_limits(&self, min: f64, max: f64) -> AppResult<()> {
        let (hard_min, hard_max) = self.hard_limits();
        if min > max || min < hard_min || max > hard_max {
            return Err(CockpitError::device(
                self.name(),
                format!(
                    "soft limits [{}, {}] outside hardware limits [{}, {}]",
                    min, max, hard_min, hard_max
                ),
            ));
        }
        *self
            .soft_limits
            .write()
            .unwrap_or_else(PoisonError::into_inner) = (min, max);
        Ok(())
    }

    /// Current position in microns
    pub async fn position(&self) -> AppResult<f64> {
        self.mover
            .position()
            .await
            .map_err(|e| CockpitError::device(self.name(), e))
    }

    /// Move to an absolute position and wait until the axis settles.
    pub async fn move_absolute(&self, target: f64) -> AppResult<f64> {
        let (min, max) = self.soft_limits();
        if !(min..=max).contains(&target) {
            return Err(CockpitError::device(
                self.name(),
                format!("target {} outside soft limits [{}, {}]", target, min, max),
            ));
        }

        tracing::debug!(handler = self.name(), axis = %self.axis, target, "moving");
        self.core.set_state(HandlerState::Busy);
        let result: anyhow::Result<f64> = async {
            self.mover.move_abs(target).await?;
            self.mover.wait_settled().await?;
            self.mover.position().await
        }
        .await;

        match result {
            Ok(position) => {
                self.core.set_state(HandlerState::Enabled);
                self.core.bus().publish(Event::StagePositionChanged {
                    handler: self.name().to_string(),
                    axis: self.axis,
                    position,
                });
                Ok(position)
            }
            Err(e) => {
                self.core.set_state(HandlerState::Error);
                Err(CockpitError::device(self.name(), e))
            }
        }
    }

    /// Move by `delta` microns from the current position.
    pub async fn move_relative(&self, delta: f64) -> AppResult<f64> {
        let current = self.position().await?;
        self.move_absolute(current + delta).await
    }
}

#[async_trait]
impl Handler for StagePositionerHandler {
    fn core(&self) -> &HandlerCore {
        &self.core
    }

    fn kind(&self) -> HandlerKind {
        HandlerKind::StagePositioner
    }

    async fn set_enabled(&self, enabled: bool) -> AppResult<HandlerState> {
        // Axes have no power switch; the flag only gates GUI use.
        self.core.apply_enable(enabled, async move { Ok(enabled) }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::simulated::SimulatedAxis;

    fn handler() -> StagePositionerHandler {
        StagePositionerHandler::new(
            "stage x",
            "stage",
            Axis::X,
            Arc::new(SimulatedAxis::new(-100.0, 100.0, 0.0, 0.0)),
            EventBus::default(),
        )
    }

    #[test]
    fn axis_parsing() {
        assert_eq!("X".parse::<Axis>().unwrap(), Axis::X);
        assert_eq!("2".parse::<Axis>().unwrap(), Axis::Z);
        assert!("w".parse::<Axis>().is_err());
    }

    #[tokio::test]
    async fn moves_publish_position() {
        let h = handler();
        let mut rx = h.core().bus().subscribe();
        assert_eq!(h.move_absolute(10.0).await.unwrap(), 10.0);
        assert_eq!(h.move_relative(-5.0).await.unwrap(), 5.0);

        let mut positions = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let Event::StagePositionChanged { position, .. } = event {
                positions.push(position);
            }
        }
        assert_eq!(positions, vec![10.0, 5.0]);
        assert_eq!(h.state(), HandlerState::Enabled);
    }

    #[tokio::test]
    async fn soft_limits_gate_moves() {
        let h = handler();
        h.set_soft_limits(-10.0, 10.0).unwrap();
        assert!(h.move_absolute(20.0).await.is_err());
        assert!(h.set_soft_limits(-200.0, 0.0).is_err());
        assert_eq!(h.soft_limits(), (-10.0, 10.0));
    }
}

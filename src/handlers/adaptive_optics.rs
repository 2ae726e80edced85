//! Adaptive optics handler (deformable mirrors, SLMs).

use super::{Handler, HandlerCore, HandlerKind, HandlerState};
use crate::devices::capabilities::PhaseControl;
use crate::error::{AppResult, CockpitError};
use crate::events::EventBus;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Handler applying modal phase corrections.
pub struct AdaptiveOpticsHandler {
    core: HandlerCore,
    driver: Arc<dyn PhaseControl>,
}

impl AdaptiveOpticsHandler {
    /// Create an enabled AO handler.
    pub fn new(
        name: impl Into<String>,
        group_name: impl Into<String>,
        driver: Arc<dyn PhaseControl>,
        bus: EventBus,
    ) -> Self {
        Self {
            core: HandlerCore::new(name, group_name, true, HandlerState::Enabled, bus),
            driver,
        }
    }

    /// Number of modes accepted
    pub fn n_modes(&self) -> usize {
        self.driver.n_modes()
    }

    /// Settling time after a change
    pub fn movement_time(&self) -> Duration {
        self.driver.movement_time()
    }

    /// Apply a phase. Shorter vectors are zero-padded; longer ones are rejected.
    pub async fn set_phase(&self, modes: &[f64]) -> AppResult<()> {
        let padded = self.pad(modes)?;
        self.driver
            .set_phase(&padded)
            .await
            .map_err(|e| CockpitError::device(self.name(), e))
    }

    /// Queue patterns to step through with [`next_pattern`](Self::next_pattern).
    pub async fn queue_patterns(&self, patterns: Vec<Vec<f64>>) -> AppResult<()> {
        let padded = patterns
            .iter()
            .map(|p| self.pad(p))
            .collect::<AppResult<Vec<_>>>()?;
        self.driver
            .queue_patterns(padded)
            .await
            .map_err(|e| CockpitError::device(self.name(), e))
    }

    /// Advance to the next queued pattern; false once the queue is exhausted.
    pub async fn next_pattern(&self) -> AppResult<bool> {
        self.driver
            .next_pattern()
            .await
            .map_err(|e| CockpitError::device(self.name(), e))
    }

    fn pad(&self, modes: &[f64]) -> AppResult<Vec<f64>> {
        let n = self.n_modes();
        if modes.len() > n {
            return Err(CockpitError::device(
                self.name(),
                format!("{} modes given, device accepts {}", modes.len(), n),
            ));
        }
        let mut padded = modes.to_vec();
        padded.resize(n, 0.0);
        Ok(padded)
    }
}

#[async_trait]
impl Handler for AdaptiveOpticsHandler {
    fn core(&self) -> &HandlerCore {
        &self.core
    }

    fn kind(&self) -> HandlerKind {
        HandlerKind::AdaptiveOptics
    }

    async fn set_enabled(&self, enabled: bool) -> AppResult<HandlerState> {
        self.core.apply_enable(enabled, async move { Ok(enabled) }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::simulated::SimulatedMirror;

    #[tokio::test]
    async fn phase_is_padded() {
        let mirror = Arc::new(SimulatedMirror::new(5, Duration::ZERO));
        let ao = AdaptiveOpticsHandler::new("dm", "ao", mirror.clone(), EventBus::default());

        ao.set_phase(&[1.0, 2.0]).await.unwrap();
        assert_eq!(mirror.current_phase().await, vec![1.0, 2.0, 0.0, 0.0, 0.0]);
        assert!(ao.set_phase(&[0.0; 6]).await.is_err());
    }

    #[tokio::test]
    async fn queued_patterns_step_in_order() {
        let mirror = Arc::new(SimulatedMirror::new(2, Duration::ZERO));
        let ao = AdaptiveOpticsHandler::new("dm", "ao", mirror.clone(), EventBus::default());

        ao.queue_patterns(vec![vec![1.0], vec![2.0, 3.0]]).await.unwrap();
        assert!(ao.next_pattern().await.unwrap());
        assert_eq!(mirror.current_phase().await, vec![1.0, 0.0]);
        assert!(ao.next_pattern().await.unwrap());
        assert_eq!(mirror.current_phase().await, vec![2.0, 3.0]);
        assert!(!ao.next_pattern().await.unwrap());
    }
}

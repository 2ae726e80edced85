//! Deformable mirror device, exposed as an adaptive optics handler.

use crate::config::DeviceDefinition;
use crate::devices::capabilities::PhaseControl;
use crate::devices::simulated::SimulatedMirror;
use crate::devices::{Device, DeviceContext};
use crate::error::{AppResult, CockpitError};
use crate::events::EventBus;
use crate::handlers::{AdaptiveOpticsHandler, HandlerRef};
use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// Configuration type string
pub const TYPE_NAME: &str = "deformable_mirror";

/// Mirror configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MirrorConfig {
    /// Number of correctable modes
    pub n_modes: usize,
    /// Settling time after a change (ms)
    pub movement_time_ms: u64,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            n_modes: 20,
            movement_time_ms: 1,
        }
    }
}

/// Build a simulated mirror from its configuration.
pub fn from_definition(
    definition: &DeviceDefinition,
    context: &DeviceContext,
) -> AppResult<Arc<dyn Device>> {
    let config: MirrorConfig = definition.parse_config()?;
    if config.n_modes == 0 {
        return Err(CockpitError::Configuration(format!(
            "deformable mirror '{}' needs at least one mode",
            definition.name
        )));
    }
    Ok(Arc::new(MirrorDevice {
        name: definition.name.clone(),
        driver: Arc::new(SimulatedMirror::new(
            config.n_modes,
            Duration::from_millis(config.movement_time_ms),
        )),
        bus: context.bus.clone(),
        handler: OnceLock::new(),
    }))
}

/// A deformable mirror.
pub struct MirrorDevice {
    name: String,
    driver: Arc<dyn PhaseControl>,
    bus: EventBus,
    handler: OnceLock<Arc<AdaptiveOpticsHandler>>,
}

#[async_trait]
impl Device for MirrorDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn type_name(&self) -> &'static str {
        TYPE_NAME
    }

    async fn initialize(&self) -> Result<()> {
        // Start flat.
        self.driver
            .set_phase(&vec![0.0; self.driver.n_modes()])
            .await
    }

    fn create_handlers(&self) -> Result<Vec<HandlerRef>> {
        let handler = self.handler.get_or_init(|| {
            Arc::new(AdaptiveOpticsHandler::new(
                self.name.clone(),
                "adaptive optics",
                Arc::clone(&self.driver),
                self.bus.clone(),
            ))
        });
        Ok(vec![HandlerRef::AdaptiveOptics(Arc::clone(handler))])
    }

    async fn shutdown(&self) -> Result<()> {
        self.driver
            .set_phase(&vec![0.0; self.driver.n_modes()])
            .await
    }
}

//! Light source device.

use crate::config::DeviceDefinition;
use crate::devices::capabilities::LightDriver;
use crate::devices::simulated::SimulatedLight;
use crate::devices::{Device, DeviceContext};
use crate::error::{AppResult, CockpitError};
use crate::events::EventBus;
use crate::handlers::{Handler, HandlerRef, LightSourceHandler};
use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::{Arc, OnceLock};

/// Configuration type string
pub const TYPE_NAME: &str = "simulated_light";

/// Light configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LightConfig {
    /// Emission wavelength (nm)
    pub wavelength: f64,
    /// Minimum power (mW)
    pub min_power: f64,
    /// Maximum power (mW)
    pub max_power: f64,
    /// Initial illumination time (ms)
    pub exposure_ms: f64,
}

impl Default for LightConfig {
    fn default() -> Self {
        Self {
            wavelength: 488.0,
            min_power: 0.0,
            max_power: 100.0,
            exposure_ms: 100.0,
        }
    }
}

/// Build a simulated light source from its configuration.
pub fn from_definition(
    definition: &DeviceDefinition,
    context: &DeviceContext,
) -> AppResult<Arc<dyn Device>> {
    let config: LightConfig = definition.parse_config()?;
    if config.min_power > config.max_power || config.wavelength <= 0.0 {
        return Err(CockpitError::Configuration(format!(
            "light '{}': invalid wavelength or power range",
            definition.name
        )));
    }
    let driver = Arc::new(SimulatedLight::new(
        config.wavelength,
        (config.min_power, config.max_power),
    ));
    Ok(Arc::new(LightDevice {
        name: definition.name.clone(),
        config,
        driver,
        bus: context.bus.clone(),
        handler: OnceLock::new(),
    }))
}

/// A laser or LED.
pub struct LightDevice {
    name: String,
    config: LightConfig,
    driver: Arc<dyn LightDriver>,
    bus: EventBus,
    handler: OnceLock<Arc<LightSourceHandler>>,
}

#[async_trait]
impl Device for LightDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn type_name(&self) -> &'static str {
        TYPE_NAME
    }

    async fn initialize(&self) -> Result<()> {
        self.driver.disable().await
    }

    fn create_handlers(&self) -> Result<Vec<HandlerRef>> {
        let handler = self.handler.get_or_init(|| {
            Arc::new(LightSourceHandler::new(
                self.name.clone(),
                "light source",
                Arc::clone(&self.driver),
                self.config.exposure_ms,
                self.bus.clone(),
            ))
        });
        Ok(vec![HandlerRef::LightSource(Arc::clone(handler))])
    }

    async fn shutdown(&self) -> Result<()> {
        if let Some(handler) = self.handler.get() {
            handler.set_enabled(false).await?;
        }
        Ok(())
    }
}

//! Multi-axis stage device: one positioner handler per configured axis.

use crate::config::DeviceDefinition;
use crate::devices::capabilities::Movable;
use crate::devices::simulated::SimulatedAxis;
use crate::devices::{Device, DeviceContext};
use crate::error::{AppResult, CockpitError};
use crate::events::EventBus;
use crate::handlers::stage::{Axis, StagePositionerHandler};
use crate::handlers::HandlerRef;
use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::{Arc, OnceLock};

/// Configuration type string
pub const TYPE_NAME: &str = "simulated_stage";

/// One axis of the stage.
#[derive(Debug, Clone, Deserialize)]
pub struct AxisConfig {
    /// Which axis
    pub axis: Axis,
    /// Lower travel limit (µm)
    pub min: f64,
    /// Upper travel limit (µm)
    pub max: f64,
    /// Start position (µm)
    #[serde(default)]
    pub initial: f64,
    /// Travel speed (µm/s); zero moves instantly
    #[serde(default)]
    pub speed: f64,
}

/// Stage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StageConfig {
    /// Axes in handler order
    pub axes: Vec<AxisConfig>,
}

impl Default for StageConfig {
    fn default() -> Self {
        let axis = |axis, min, max| AxisConfig {
            axis,
            min,
            max,
            initial: 0.0,
            speed: 0.0,
        };
        Self {
            axes: vec![
                axis(Axis::X, -25_000.0, 25_000.0),
                axis(Axis::Y, -25_000.0, 25_000.0),
                axis(Axis::Z, -5_000.0, 5_000.0),
            ],
        }
    }
}

/// Build a simulated stage from its configuration.
pub fn from_definition(
    definition: &DeviceDefinition,
    context: &DeviceContext,
) -> AppResult<Arc<dyn Device>> {
    let config: StageConfig = if definition.config.get("axes").is_some() {
        definition.parse_config()?
    } else {
        StageConfig::default()
    };
    let mut seen = Vec::new();
    for axis in &config.axes {
        if axis.min > axis.max {
            return Err(CockpitError::Configuration(format!(
                "stage '{}' axis {}: min {} > max {}",
                definition.name, axis.axis, axis.min, axis.max
            )));
        }
        if seen.contains(&axis.axis) {
            return Err(CockpitError::Configuration(format!(
                "stage '{}' defines axis {} twice",
                definition.name, axis.axis
            )));
        }
        seen.push(axis.axis);
    }
    let movers = config
        .axes
        .iter()
        .map(|a| {
            let mover: Arc<dyn Movable> =
                Arc::new(SimulatedAxis::new(a.min, a.max, a.initial, a.speed));
            (a.axis, mover)
        })
        .collect();
    Ok(Arc::new(StageDevice::new(
        definition.name.clone(),
        movers,
        context.bus.clone(),
    )))
}

/// A stage made of independent axes.
pub struct StageDevice {
    name: String,
    movers: Vec<(Axis, Arc<dyn Movable>)>,
    bus: EventBus,
    handlers: OnceLock<Vec<Arc<StagePositionerHandler>>>,
}

impl StageDevice {
    /// Stage called `name` driving `movers`.
    pub fn new(name: String, movers: Vec<(Axis, Arc<dyn Movable>)>, bus: EventBus) -> Self {
        Self {
            name,
            movers,
            bus,
            handlers: OnceLock::new(),
        }
    }
}

#[async_trait]
impl Device for StageDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn type_name(&self) -> &'static str {
        TYPE_NAME
    }

    async fn initialize(&self) -> Result<()> {
        for (axis, mover) in &self.movers {
            let position = mover.position().await?;
            tracing::debug!(stage = %self.name, %axis, position, "axis ready");
        }
        Ok(())
    }

    fn create_handlers(&self) -> Result<Vec<HandlerRef>> {
        let handlers = self.handlers.get_or_init(|| {
            self.movers
                .iter()
                .map(|(axis, mover)| {
                    Arc::new(StagePositionerHandler::new(
                        format!("{} {}", self.name, axis),
                        "stage",
                        *axis,
                        Arc::clone(mover),
                        self.bus.clone(),
                    ))
                })
                .collect()
        });
        Ok(handlers
            .iter()
            .map(|h| HandlerRef::StagePositioner(Arc::clone(h)))
            .collect())
    }

    async fn shutdown(&self) -> Result<()> {
        for (axis, mover) in &self.movers {
            if let Err(e) = mover.stop().await {
                tracing::debug!(stage = %self.name, %axis, error = %e, "stop on shutdown");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::user_config::UserConfig;

    fn context() -> DeviceContext {
        DeviceContext::new(EventBus::default(), UserConfig::in_memory())
    }

    #[test]
    fn default_config_has_three_axes() {
        let device =
            from_definition(&DeviceDefinition::new("stage", TYPE_NAME), &context()).unwrap();
        let names: Vec<String> = device
            .create_handlers()
            .unwrap()
            .iter()
            .map(|h| h.name().to_string())
            .collect();
        assert_eq!(names, vec!["stage x", "stage y", "stage z"]);
    }

    #[test]
    fn duplicate_axis_is_rejected() {
        let config: toml::Value = toml::from_str(
            r#"
            axes = [
                { axis = "x", min = 0.0, max = 10.0 },
                { axis = "x", min = 0.0, max = 10.0 },
            ]
            "#,
        )
        .unwrap();
        let def = DeviceDefinition::new("stage", TYPE_NAME).with_config(config);
        assert!(matches!(
            from_definition(&def, &context()),
            Err(CockpitError::Configuration(_))
        ));
    }

    #[test]
    fn handlers_are_created_once() {
        let device =
            from_definition(&DeviceDefinition::new("stage", TYPE_NAME), &context()).unwrap();
        let first = device.create_handlers().unwrap();
        let second = device.create_handlers().unwrap();
        let a = first[0].as_stage_positioner().unwrap();
        let b = second[0].as_stage_positioner().unwrap();
        assert!(Arc::ptr_eq(a, b));
    }
}

//! Objective turret device.
//!
//! ```toml
//! [[devices]]
//! name = "objectives"
//! type = "objectives"
//! [devices.config]
//! initial = "60x oil"
//! objectives = [
//!     { name = "10x air", pixel_size = 0.65 },
//!     { name = "60x oil", pixel_size = 0.108, transform = { flip_lr = true } },
//! ]
//! ```

use crate::config::DeviceDefinition;
use crate::devices::{Device, DeviceContext};
use crate::error::AppResult;
use crate::events::EventBus;
use crate::gui::model::{Control, Widget};
use crate::handlers::objective::{ObjectiveHandler, ObjectiveSpec};
use crate::handlers::HandlerRef;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::{Arc, OnceLock};

/// Configuration type string
pub const TYPE_NAME: &str = "objectives";

/// Objective turret configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ObjectivesConfig {
    /// Objectives in turret order
    pub objectives: Vec<ObjectiveSpec>,
    /// Objective in use at startup
    #[serde(default)]
    pub initial: Option<String>,
}

/// Build the objective turret from its configuration.
pub fn from_definition(
    definition: &DeviceDefinition,
    context: &DeviceContext,
) -> AppResult<Arc<dyn Device>> {
    let config: ObjectivesConfig = definition.parse_config()?;
    let handler = ObjectiveHandler::new(
        definition.name.clone(),
        "objective",
        config.objectives,
        config.initial.as_deref(),
        context.bus.clone(),
    )?;
    Ok(Arc::new(ObjectiveDevice {
        name: definition.name.clone(),
        pending: std::sync::Mutex::new(Some(handler)),
        handler: OnceLock::new(),
        bus: context.bus.clone(),
    }))
}

/// Turret holding the objectives.
pub struct ObjectiveDevice {
    name: String,
    pending: std::sync::Mutex<Option<ObjectiveHandler>>,
    handler: OnceLock<Arc<ObjectiveHandler>>,
    bus: EventBus,
}

impl ObjectiveDevice {
    fn handler(&self) -> Result<&Arc<ObjectiveHandler>> {
        self.handler
            .get()
            .ok_or_else(|| anyhow!("objective handler not created yet"))
    }
}

#[async_trait]
impl Device for ObjectiveDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn type_name(&self) -> &'static str {
        TYPE_NAME
    }

    fn create_handlers(&self) -> Result<Vec<HandlerRef>> {
        if self.handler.get().is_none() {
            let built = self
                .pending
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .take()
                .ok_or_else(|| anyhow!("objective handler already consumed"))?;
            let _ = self.handler.set(Arc::new(built));
        }
        Ok(vec![HandlerRef::Objective(Arc::clone(self.handler()?))])
    }

    async fn finalize_initialization(
        &self,
        _handlers: &crate::handlers::HandlerDirectory,
    ) -> Result<()> {
        // Cameras read the starting transform from the handler directory;
        // this is for listeners that subscribed before startup.
        let handler = self.handler()?;
        self.bus.publish(crate::events::Event::ObjectiveChange {
            objective: handler.current().name.clone(),
            transform: handler.transform(),
        });
        Ok(())
    }

    async fn controls(&self) -> Vec<Control> {
        let Ok(handler) = self.handler() else {
            return Vec::new();
        };
        let options: Vec<String> = handler.names().iter().map(|s| s.to_string()).collect();
        let selected = options
            .iter()
            .position(|n| *n == handler.current().name)
            .unwrap_or(0);
        vec![Control::new(
            self.name.clone(),
            "objective",
            "Objective",
            Widget::Choice { options, selected },
        )]
    }

    async fn invoke(&self, action: &str, value: Option<&str>) -> Result<String> {
        match (action, value) {
            ("objective", Some(name)) => {
                let handler = self.handler()?;
                let name = handler
                    .names()
                    .iter()
                    .enumerate()
                    .find(|(i, n)| **n == name || i.to_string() == name)
                    .map(|(_, n)| n.to_string())
                    .ok_or_else(|| anyhow!("no objective '{}'", name))?;
                handler.change_objective(&name)?;
                Ok(format!("objective set to {}", name))
            }
            _ => anyhow::bail!("objectives have no action '{}'", action),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Event;
    use crate::user_config::UserConfig;

    fn device(bus: &EventBus) -> Arc<dyn Device> {
        let config: toml::Value = toml::from_str(
            r#"
            initial = "60x"
            objectives = [
                { name = "10x", pixel_size = 0.65 },
                { name = "60x", pixel_size = 0.108, transform = { rot90 = true } },
            ]
            "#,
        )
        .unwrap();
        let def = DeviceDefinition::new("objectives", TYPE_NAME).with_config(config);
        from_definition(&def, &DeviceContext::new(bus.clone(), UserConfig::in_memory())).unwrap()
    }

    #[tokio::test]
    async fn finalize_announces_initial_objective() {
        let bus = EventBus::default();
        let device = device(&bus);
        device.create_handlers().unwrap();
        let mut rx = bus.subscribe();
        device
            .finalize_initialization(&crate::handlers::HandlerDirectory::new())
            .await
            .unwrap();
        match rx.recv().await.unwrap() {
            Event::ObjectiveChange {
                objective,
                transform,
            } => {
                assert_eq!(objective, "60x");
                assert!(transform.rot90);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn objective_action_accepts_name_or_index() {
        let bus = EventBus::default();
        let device = device(&bus);
        let handlers = device.create_handlers().unwrap();
        let handler = handlers[0].as_objective().unwrap();

        device.invoke("objective", Some("0")).await.unwrap();
        assert_eq!(handler.current().name, "10x");
        device.invoke("objective", Some("60x")).await.unwrap();
        assert_eq!(handler.current().name, "60x");
        assert!(device.invoke("objective", Some("100x")).await.is_err());
    }
}

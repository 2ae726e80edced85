//! Device registry.
//!
//! The depot is populated once during startup: it builds every enabled device
//! from the configuration, initializes them, collects the handlers each one
//! creates and finally lets devices look each other's handlers up. After that
//! it is shared read-only behind an `Arc` and forwards bus events to the
//! devices.
//!
//! A device that fails to initialize does not abort startup. It is logged,
//! recorded in [`Depot::failed_devices`] and contributes no handlers.

use crate::config::CockpitConfig;
use crate::devices::{Device, DeviceContext, DeviceFactory};
use crate::error::{AppResult, CockpitError};
use crate::events::{Event, EventBus};
use crate::handlers::{
    AdaptiveOpticsHandler, CameraHandler, Handler, HandlerDirectory, HandlerKind, HandlerRef,
    LightSourceHandler, ObjectiveHandler, StagePositionerHandler,
};
use crate::user_config::UserConfig;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::Instrument;

/// Registry of all devices and their handlers.
pub struct Depot {
    devices: Vec<Arc<dyn Device>>,
    by_name: BTreeMap<String, usize>,
    handlers: HandlerDirectory,
    failed: Vec<(String, String)>,
    bus: EventBus,
}

impl Depot {
    /// Build every enabled device of `config` with the built-in factory.
    pub fn from_config(
        config: &CockpitConfig,
        bus: &EventBus,
        user_config: &UserConfig,
    ) -> AppResult<Self> {
        Self::with_factory(config, bus, user_config, &DeviceFactory::with_builtin())
    }

    /// Build every enabled device of `config` with `factory`.
    pub fn with_factory(
        config: &CockpitConfig,
        bus: &EventBus,
        user_config: &UserConfig,
        factory: &DeviceFactory,
    ) -> AppResult<Self> {
        let context = DeviceContext::new(bus.clone(), user_config.clone());
        let devices = config
            .enabled_devices()
            .into_iter()
            .map(|definition| factory.create(definition, &context))
            .collect::<AppResult<Vec<_>>>()?;
        Self::from_devices(devices, bus.clone())
    }

    /// Depot over already constructed devices.
    pub fn from_devices(devices: Vec<Arc<dyn Device>>, bus: EventBus) -> AppResult<Self> {
        let mut by_name = BTreeMap::new();
        for (index, device) in devices.iter().enumerate() {
            if by_name.insert(device.name().to_string(), index).is_some() {
                return Err(CockpitError::DuplicateDevice(device.name().to_string()));
            }
        }
        Ok(Self {
            devices,
            by_name,
            handlers: HandlerDirectory::new(),
            failed: Vec::new(),
            bus,
        })
    }

    fn is_failed(&self, name: &str) -> bool {
        self.failed.iter().any(|(n, _)| n == name)
    }

    fn record_failure(&mut self, name: &str, stage: &str, error: &anyhow::Error) {
        tracing::error!(device = %name, stage, error = %error, "device failed");
        self.failed.push((name.to_string(), format!("{}: {:#}", stage, error)));
    }

    /// Initialize every device and collect the handlers of those that came up.
    ///
    /// Device failures are recorded, not returned. Two handlers with the same
    /// name are a configuration error and abort.
    pub async fn initialize_all(&mut self) -> AppResult<()> {
        let devices = self.devices.clone();
        for device in &devices {
            let name = device.name();
            let span = tracing::info_span!("device", device = %name, r#type = device.type_name());
            let created = async {
                device.initialize().await?;
                device.create_handlers()
            }
            .instrument(span)
            .await;
            match created {
                Ok(handlers) => {
                    for handler in handlers {
                        tracing::debug!(device = %name, handler = %handler.name(), kind = ?handler.kind(), "handler registered");
                        self.handlers.insert(handler)?;
                    }
                }
                Err(e) => self.record_failure(name, "initialize", &e),
            }
        }
        tracing::info!(
            devices = self.devices.len(),
            failed = self.failed.len(),
            handlers = self.handlers.len(),
            "devices initialized"
        );
        Ok(())
    }

    /// Let every working device resolve its references to other handlers.
    pub async fn finalize_all(&mut self) -> AppResult<()> {
        let devices = self.devices.clone();
        for device in &devices {
            if self.is_failed(device.name()) {
                continue;
            }
            if let Err(e) = device.finalize_initialization(&self.handlers).await {
                self.record_failure(device.name(), "finalize", &e);
            }
        }
        Ok(())
    }

    /// Devices that failed during startup, with the reason
    pub fn failed_devices(&self) -> &[(String, String)] {
        &self.failed
    }

    /// Device by name
    pub fn device(&self, name: &str) -> AppResult<Arc<dyn Device>> {
        self.by_name
            .get(name)
            .map(|&i| Arc::clone(&self.devices[i]))
            .ok_or_else(|| CockpitError::DeviceNotFound(name.to_string()))
    }

    /// All devices in declaration order
    pub fn devices(&self) -> &[Arc<dyn Device>] {
        &self.devices
    }

    /// All collected handlers
    pub fn handlers(&self) -> &HandlerDirectory {
        &self.handlers
    }

    /// Handler by name
    pub fn handler(&self, name: &str) -> AppResult<&HandlerRef> {
        self.handlers
            .get(name)
            .ok_or_else(|| CockpitError::HandlerNotFound(name.to_string()))
    }

    /// Handlers of one kind, in registration order
    pub fn handlers_of_kind(&self, kind: HandlerKind) -> Vec<HandlerRef> {
        self.handlers.of_kind(kind)
    }

    /// All camera handlers
    pub fn cameras(&self) -> Vec<Arc<CameraHandler>> {
        self.handlers
            .iter()
            .filter_map(|h| h.as_camera().cloned())
            .collect()
    }

    /// Camera handlers that are currently enabled
    pub fn active_cameras(&self) -> Vec<Arc<CameraHandler>> {
        self.cameras()
            .into_iter()
            .filter(|c| c.is_enabled())
            .collect()
    }

    /// All stage positioners
    pub fn stage_positioners(&self) -> Vec<Arc<StagePositionerHandler>> {
        self.handlers
            .iter()
            .filter_map(|h| h.as_stage_positioner().cloned())
            .collect()
    }

    /// All light sources
    pub fn light_sources(&self) -> Vec<Arc<LightSourceHandler>> {
        self.handlers
            .iter()
            .filter_map(|h| h.as_light_source().cloned())
            .collect()
    }

    /// The objective handler, if one is configured
    pub fn objective(&self) -> Option<Arc<ObjectiveHandler>> {
        self.handlers.iter().find_map(|h| h.as_objective().cloned())
    }

    /// Adaptive optics handler by name
    pub fn adaptive_optics(&self, name: &str) -> AppResult<Arc<AdaptiveOpticsHandler>> {
        self.handlers
            .get_with_kind(name, HandlerKind::AdaptiveOptics)
            .and_then(HandlerRef::as_adaptive_optics)
            .cloned()
            .ok_or_else(|| CockpitError::HandlerNotFound(name.to_string()))
    }

    /// Application event bus
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Forward `event` to every working device. Device errors are logged.
    pub async fn dispatch(&self, event: &Event) {
        for device in &self.devices {
            if self.is_failed(device.name()) {
                continue;
            }
            if let Err(e) = device.on_event(event).await {
                tracing::warn!(
                    device = %device.name(),
                    event = event.kind_name(),
                    error = %e,
                    "event handler failed"
                );
            }
        }
    }

    /// Forward bus events to the devices from a background task.
    pub fn spawn_event_dispatch(self: &Arc<Self>) -> JoinHandle<()> {
        let depot = Arc::clone(self);
        let mut rx = self.bus.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => depot.dispatch(&event).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "device event dispatch lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Shut every device down, last declared first.
    pub async fn shutdown(&self) -> AppResult<()> {
        let mut errors = Vec::new();
        for device in self.devices.iter().rev() {
            if let Err(e) = device.shutdown().await {
                tracing::error!(device = %device.name(), error = %e, "shutdown failed");
                errors.push(CockpitError::device(device.name(), e));
            }
        }
        if errors.is_empty() {
            tracing::info!("all devices shut down");
            Ok(())
        } else {
            Err(CockpitError::ShutdownFailed(errors))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceDefinition;
    use tracing_test::traced_test;

    fn config(devices: Vec<DeviceDefinition>) -> CockpitConfig {
        CockpitConfig {
            devices,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn handlers_follow_declaration_order() {
        let bus = EventBus::default();
        let mut depot = Depot::from_config(
            &config(vec![
                DeviceDefinition::new("camera", "simulated_camera"),
                DeviceDefinition::new("stage", "simulated_stage"),
            ]),
            &bus,
            &UserConfig::in_memory(),
        )
        .unwrap();
        depot.initialize_all().await.unwrap();
        depot.finalize_all().await.unwrap();

        let names: Vec<&str> = depot.handlers().iter().map(HandlerRef::name).collect();
        assert_eq!(names, vec!["camera", "stage x", "stage y", "stage z"]);
        assert_eq!(depot.cameras().len(), 1);
        assert!(depot.active_cameras().is_empty());
        assert_eq!(depot.stage_positioners().len(), 3);
        assert!(depot.objective().is_none());
    }

    #[tokio::test]
    async fn disabled_definitions_are_skipped() {
        let mut light = DeviceDefinition::new("laser", "simulated_light");
        light.enabled = false;
        let depot = Depot::from_config(
            &config(vec![light]),
            &EventBus::default(),
            &UserConfig::in_memory(),
        )
        .unwrap();
        assert!(depot.devices().is_empty());
        assert!(matches!(
            depot.device("laser"),
            Err(CockpitError::DeviceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn unknown_handler_lookup_is_an_error() {
        let depot = Depot::from_devices(Vec::new(), EventBus::default()).unwrap();
        assert!(matches!(
            depot.handler("nothing"),
            Err(CockpitError::HandlerNotFound(_))
        ));
        assert!(depot.adaptive_optics("dm").is_err());
        depot.shutdown().await.unwrap();
    }

    #[tokio::test]
    #[traced_test]
    async fn finalize_failure_is_recorded_and_startup_continues() {
        let clarity = DeviceDefinition::new("clarity", "clarity").with_config(toml::Value::Table(toml::toml! {
            camera = "missing"
            "filter cubes" = ["DAPI", "GFP", "mCherry", "Cy5"]
        }));
        let mut depot = Depot::from_config(
            &config(vec![clarity, DeviceDefinition::new("stage", "simulated_stage")]),
            &EventBus::default(),
            &UserConfig::in_memory(),
        )
        .unwrap();
        depot.initialize_all().await.unwrap();
        depot.finalize_all().await.unwrap();

        let failed = depot.failed_devices();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].0, "clarity");
        assert!(failed[0].1.starts_with("finalize"));
        assert!(depot.handler("stage x").is_ok());
        assert!(logs_contain("device failed"));
    }
}

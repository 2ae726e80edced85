//! Plain on/off handler for devices with no richer capability.

use super::{Handler, HandlerCore, HandlerKind, HandlerState};
use crate::error::AppResult;
use crate::events::EventBus;
use async_trait::async_trait;
use std::sync::Arc;

/// Device-side callbacks for a [`GenericHandler`].
#[async_trait]
pub trait EnableControl: Send + Sync {
    /// Switch on or off; returns the resulting enabled state.
    async fn set_enabled(&self, enabled: bool) -> anyhow::Result<bool>;

    /// Query the enabled state.
    async fn is_enabled(&self) -> anyhow::Result<bool>;
}

/// Handler that only knows how to switch its device on and off.
pub struct GenericHandler {
    core: HandlerCore,
    control: Arc<dyn EnableControl>,
}

impl GenericHandler {
    /// Create a handler in the `Disabled` state.
    pub fn new(
        name: impl Into<String>,
        group_name: impl Into<String>,
        control: Arc<dyn EnableControl>,
        bus: EventBus,
    ) -> Self {
        Self {
            core: HandlerCore::new(name, group_name, false, HandlerState::Disabled, bus),
            control,
        }
    }

    /// Re-read the device state and publish it.
    pub async fn refresh(&self) -> AppResult<HandlerState> {
        let control = self.control.clone();
        self.core
            .apply_enable(false, async move { control.is_enabled().await })
            .await
    }
}

#[async_trait]
impl Handler for GenericHandler {
    fn core(&self) -> &HandlerCore {
        &self.core
    }

    fn kind(&self) -> HandlerKind {
        HandlerKind::Generic
    }

    async fn set_enabled(&self, enabled: bool) -> AppResult<HandlerState> {
        let control = self.control.clone();
        self.core
            .apply_enable(enabled, async move { control.set_enabled(enabled).await })
            .await
    }
}

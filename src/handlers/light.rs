//! Light source handler.

use super::{Handler, HandlerCore, HandlerKind, HandlerState};
use crate::devices::capabilities::LightDriver;
use crate::error::{AppResult, CockpitError};
use crate::events::{Event, EventBus};
use async_trait::async_trait;
use std::sync::{Arc, PoisonError, RwLock};

/// Handler for a laser or LED.
pub struct LightSourceHandler {
    core: HandlerCore,
    driver: Arc<dyn LightDriver>,
    exposure_ms: RwLock<f64>,
}

impl LightSourceHandler {
    /// Create a disabled light handler with an initial illumination time.
    pub fn new(
        name: impl Into<String>,
        group_name: impl Into<String>,
        driver: Arc<dyn LightDriver>,
        exposure_ms: f64,
        bus: EventBus,
    ) -> Self {
        Self {
            core: HandlerCore::new(name, group_name, true, HandlerState::Disabled, bus),
            driver,
            exposure_ms: RwLock::new(exposure_ms),
        }
    }

    /// Emission wavelength (nm)
    pub fn wavelength_nm(&self) -> f64 {
        self.driver.wavelength_nm()
    }

    /// Allowed power range (mW)
    pub fn power_range(&self) -> (f64, f64) {
        self.driver.power_range()
    }

    /// Current power setpoint (mW)
    pub async fn power_mw(&self) -> AppResult<f64> {
        self.driver
            .power_mw()
            .await
            .map_err(|e| CockpitError::device(self.name(), e))
    }

    /// Change the power setpoint; must lie within `power_range()`.
    pub async fn set_power_mw(&self, power: f64) -> AppResult<()> {
        let (min, max) = self.power_range();
        if !(min..=max).contains(&power) {
            return Err(CockpitError::device(
                self.name(),
                format!("power {} mW outside [{}, {}]", power, min, max),
            ));
        }
        self.driver
            .set_power_mw(power)
            .await
            .map_err(|e| CockpitError::device(self.name(), e))?;
        self.core.bus().publish(Event::LightPowerChanged {
            light: self.name().to_string(),
            power_mw: power,
        });
        Ok(())
    }

    /// Illumination time used when imaging with this light (ms)
    pub fn exposure_time_ms(&self) -> f64 {
        *self
            .exposure_ms
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Change the illumination time (ms)
    pub fn set_exposure_time_ms(&self, ms: f64) -> AppResult<()> {
        if !ms.is_finite() || ms < 0.0 {
            return Err(CockpitError::device(
                self.name(),
                format!("invalid exposure time {} ms", ms),
            ));
        }
        *self
            .exposure_ms
            .write()
            .unwrap_or_else(PoisonError::into_inner) = ms;
        Ok(())
    }
}

#[async_trait]
impl Handler for LightSourceHandler {
    fn core(&self) -> &HandlerCore {
        &self.core
    }

    fn kind(&self) -> HandlerKind {
        HandlerKind::LightSource
    }

    async fn set_enabled(&self, enabled: bool) -> AppResult<HandlerState> {
        let driver = self.driver.clone();
        self.core
            .apply_enable(enabled, async move {
                if enabled {
                    driver.enable().await?;
                } else {
                    driver.disable().await?;
                }
                driver.is_enabled().await
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::simulated::SimulatedLight;

    #[tokio::test]
    async fn power_is_range_checked_and_published() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let light = LightSourceHandler::new(
            "488",
            "lights",
            Arc::new(SimulatedLight::new(488.0, (0.0, 100.0))),
            50.0,
            bus,
        );

        assert!(light.set_power_mw(150.0).await.is_err());
        light.set_power_mw(20.0).await.unwrap();
        assert_eq!(light.power_mw().await.unwrap(), 20.0);
        assert!(matches!(
            rx.try_recv(),
            Ok(Event::LightPowerChanged { power_mw, .. }) if power_mw == 20.0
        ));
    }

    #[tokio::test]
    async fn enable_round_trip() {
        let light = LightSourceHandler::new(
            "561",
            "lights",
            Arc::new(SimulatedLight::new(561.0, (0.0, 50.0))),
            50.0,
            EventBus::default(),
        );
        assert_eq!(light.set_enabled(true).await.unwrap(), HandlerState::Enabled);
        assert_eq!(light.set_enabled(false).await.unwrap(), HandlerState::Disabled);
        assert!(light.set_exposure_time_ms(-1.0).is_err());
    }
}

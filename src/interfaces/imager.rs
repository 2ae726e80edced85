//! Image acquisition across all active cameras.
//!
//! `take_image` soft-triggers every enabled camera at once; the images arrive
//! on the bus as `NewImage` events. Video mode repeats this on a timer until
//! stopped.

use crate::depot::Depot;
use crate::error::{AppResult, CockpitError};
use crate::events::{Event, EventBus};
use futures::future::join_all;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Trigger every active camera once. Returns how many were triggered.
async fn trigger_active_cameras(depot: &Depot) -> AppResult<usize> {
    let cameras = depot.active_cameras();
    if cameras.is_empty() {
        return Err(CockpitError::device("imager", "no active cameras"));
    }
    let results = join_all(cameras.iter().map(|camera| camera.soft_trigger())).await;
    for result in results {
        result?;
    }
    Ok(cameras.len())
}

/// Acquisition interface.
pub struct Imager {
    depot: Arc<Depot>,
    bus: EventBus,
    interval: Duration,
    video: Mutex<Option<JoinHandle<()>>>,
}

impl Imager {
    /// Imager over the depot's cameras; video frames are `interval` apart.
    pub fn new(depot: Arc<Depot>, interval: Duration) -> Self {
        let bus = depot.bus().clone();
        Self {
            depot,
            bus,
            interval,
            video: Mutex::new(None),
        }
    }

    /// Take one image with every active camera.
    pub async fn take_image(&self) -> AppResult<usize> {
        trigger_active_cameras(&self.depot).await
    }

    /// Whether video mode is running
    pub async fn is_video_running(&self) -> bool {
        self.video
            .lock()
            .await
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Start video mode. Starting twice is a no-op.
    pub async fn start_video(&self) -> AppResult<()> {
        let mut video = self.video.lock().await;
        if video.as_ref().is_some_and(|task| !task.is_finished()) {
            return Ok(());
        }
        if self.depot.active_cameras().is_empty() {
            return Err(CockpitError::device("imager", "no active cameras"));
        }

        let depot = Arc::clone(&self.depot);
        let bus = self.bus.clone();
        let period = self.interval;
        *video = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = trigger_active_cameras(&depot).await {
                    tracing::warn!(error = %e, "video mode stopped");
                    bus.publish(Event::VideoModeToggled { running: false });
                    break;
                }
            }
        }));
        tracing::info!(interval_ms = period.as_millis() as u64, "video mode started");
        self.bus.publish(Event::VideoModeToggled { running: true });
        Ok(())
    }

    /// Stop video mode. Returns whether it was running.
    pub async fn stop_video(&self) -> bool {
        let Some(task) = self.video.lock().await.take() else {
            return false;
        };
        let was_running = !task.is_finished();
        task.abort();
        if was_running {
            tracing::info!("video mode stopped");
            self.bus.publish(Event::VideoModeToggled { running: false });
        }
        was_running
    }

    /// Toggle video mode; returns the new state.
    pub async fn toggle_video(&self) -> AppResult<bool> {
        if self.stop_video().await {
            Ok(false)
        } else {
            self.start_video().await?;
            Ok(true)
        }
    }

    /// Run `action` with video mode suspended, restarting it afterwards.
    pub async fn pause_video<F, Fut, T>(&self, action: F) -> AppResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let was_running = self.stop_video().await;
        let output = action().await;
        if was_running {
            self.start_video().await?;
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CockpitConfig, DeviceDefinition};
    use crate::handlers::Handler;
    use crate::user_config::UserConfig;

    async fn depot(bus: &EventBus) -> Arc<Depot> {
        let config = CockpitConfig {
            devices: vec![DeviceDefinition::new("camera", "simulated_camera")],
            ..Default::default()
        };
        let mut depot = Depot::from_config(&config, bus, &UserConfig::in_memory()).unwrap();
        depot.initialize_all().await.unwrap();
        depot.finalize_all().await.unwrap();
        Arc::new(depot)
    }

    #[tokio::test]
    async fn take_image_needs_an_active_camera() {
        let bus = EventBus::default();
        let imager = Imager::new(depot(&bus).await, Duration::from_millis(10));
        assert!(imager.take_image().await.is_err());
        assert!(imager.start_video().await.is_err());
    }

    #[tokio::test]
    async fn take_image_publishes_new_image() {
        let bus = EventBus::default();
        let depot = depot(&bus).await;
        depot.cameras()[0].set_enabled(true).await.unwrap();
        let imager = Imager::new(depot, Duration::from_millis(10));

        let event = bus
            .execute_and_wait_for(
                |e| e.is_image_from("camera"),
                || imager.take_image(),
                Duration::from_secs(2),
                "image",
            )
            .await
            .unwrap();
        assert!(matches!(event, Event::NewImage { .. }));
    }

    #[tokio::test]
    async fn pause_video_restarts_video() {
        let bus = EventBus::default();
        let depot = depot(&bus).await;
        depot.cameras()[0].set_enabled(true).await.unwrap();
        let imager = Imager::new(depot, Duration::from_millis(20));

        assert!(imager.toggle_video().await.unwrap());
        let during = imager
            .pause_video(|| async { imager.is_video_running().await })
            .await
            .unwrap();
        assert!(!during);
        assert!(imager.is_video_running().await);
        assert!(imager.stop_video().await);
        assert!(!imager.is_video_running().await);
    }
}

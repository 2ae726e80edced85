//! Application-wide publish/subscribe event bus.
//!
//! Devices, handlers, interfaces and the GUI communicate state changes through
//! a single broadcast channel. Publishing never blocks and never fails when
//! nobody is listening; slow subscribers see `Lagged` and skip ahead.
//!
//! `execute_and_wait_for_or_timeout` is the building block for "do something,
//! then wait for the device to report back" interactions such as taking an
//! image and waiting for the camera's `NewImage`.

use crate::devices::frame::{Frame, Transform};
use crate::error::{AppResult, CockpitError};
use crate::handlers::stage::Axis;
use crate::handlers::HandlerState;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Default number of events buffered per subscriber.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Everything that can be published on the bus.
#[derive(Debug, Clone)]
pub enum Event {
    /// A handler changed state.
    DeviceStatus {
        /// Handler name
        handler: String,
        /// New state
        state: HandlerState,
    },
    /// A camera delivered an image (after post-processing).
    NewImage {
        /// Camera handler name
        camera: String,
        /// Image data
        frame: Arc<Frame>,
        /// Acquisition time
        timestamp: DateTime<Utc>,
    },
    /// A device's settings changed.
    SettingsChanged {
        /// Device name
        device: String,
    },
    /// The active objective changed.
    ObjectiveChange {
        /// Objective name
        objective: String,
        /// Image transform of the objective's light path
        transform: Transform,
    },
    /// A stage axis finished moving.
    StagePositionChanged {
        /// Handler name
        handler: String,
        /// Axis moved
        axis: Axis,
        /// New position in microns
        position: f64,
    },
    /// A light source power level changed.
    LightPowerChanged {
        /// Handler name
        light: String,
        /// New power in mW
        power_mw: f64,
    },
    /// An experiment is about to start.
    PrepareForExperiment,
    /// An experiment finished or was aborted; devices restore their state.
    CleanupAfterExperiment,
    /// An experiment ran to completion.
    ExperimentComplete {
        /// Experiment name
        name: String,
    },
    /// Video mode started or stopped.
    VideoModeToggled {
        /// Whether video mode is now running
        running: bool,
    },
    /// The user asked to abort whatever is running.
    UserAbort,
}

impl Event {
    /// Short name of the event type, used in log lines.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Event::DeviceStatus { .. } => "device status",
            Event::NewImage { .. } => "new image",
            Event::SettingsChanged { .. } => "settings changed",
            Event::ObjectiveChange { .. } => "objective change",
            Event::StagePositionChanged { .. } => "stage position",
            Event::LightPowerChanged { .. } => "light power",
            Event::PrepareForExperiment => "prepare for experiment",
            Event::CleanupAfterExperiment => "cleanup after experiment",
            Event::ExperimentComplete { .. } => "experiment complete",
            Event::VideoModeToggled { .. } => "video mode toggled",
            Event::UserAbort => "user abort",
        }
    }

    /// Whether this is a `NewImage` from the named camera.
    pub fn is_image_from(&self, camera_name: &str) -> bool {
        matches!(self, Event::NewImage { camera, .. } if camera == camera_name)
    }
}

/// Cloneable handle to the application event bus.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a bus buffering `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event. Returns the number of subscribers that received it.
    pub fn publish(&self, event: Event) -> usize {
        tracing::trace!(event = event.kind_name(), "publish");
        // No subscribers is not an error.
        self.tx.send(event).unwrap_or(0)
    }

    /// Subscribe to all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Run `action`, then wait for the first event matching `predicate`.
    ///
    /// The subscription is created before the action runs, so an event
    /// published by the action itself is never missed. Returns `Ok(None)` if
    /// no matching event arrived within `timeout`; errors from the action are
    /// returned as-is.
    ///
    /// ```
    /// use rust_cockpit::events::{Event, EventBus};
    /// use std::time::Duration;
    ///
    /// # tokio_test::block_on(async {
    /// let bus = EventBus::default();
    /// let publisher = bus.clone();
    /// let event = bus
    ///     .execute_and_wait_for_or_timeout(
    ///         |e| matches!(e, Event::UserAbort),
    ///         || async move {
    ///             publisher.publish(Event::UserAbort);
    ///             Ok::<_, rust_cockpit::error::CockpitError>(())
    ///         },
    ///         Duration::from_millis(100),
    ///     )
    ///     .await
    ///     .unwrap();
    /// assert!(matches!(event, Some(Event::UserAbort)));
    /// # });
    /// ```
    pub async fn execute_and_wait_for_or_timeout<P, F, Fut, T>(
        &self,
        predicate: P,
        action: F,
        timeout: Duration,
    ) -> AppResult<Option<Event>>
    where
        P: Fn(&Event) -> bool,
        F: FnOnce() -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        let mut rx = self.subscribe();
        action().await?;

        let wait = async {
            loop {
                match rx.recv().await {
                    Ok(event) if predicate(&event) => return Some(event),
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "event wait lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        };

        Ok(tokio::time::timeout(timeout, wait).await.unwrap_or(None))
    }

    /// Like [`execute_and_wait_for_or_timeout`](Self::execute_and_wait_for_or_timeout)
    /// but a timeout is an error.
    pub async fn execute_and_wait_for<P, F, Fut, T>(
        &self,
        predicate: P,
        action: F,
        timeout: Duration,
        waiting_for: &str,
    ) -> AppResult<Event>
    where
        P: Fn(&Event) -> bool,
        F: FnOnce() -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        self.execute_and_wait_for_or_timeout(predicate, action, timeout)
            .await?
            .ok_or_else(|| CockpitError::Timeout(timeout, waiting_for.to_string()))
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_without_subscribers_is_ok() {
        let bus = EventBus::default();
        assert_eq!(bus.publish(Event::UserAbort), 0);
    }

    #[tokio::test]
    async fn subscribers_receive_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        assert_eq!(
            bus.publish(Event::SettingsChanged {
                device: "camera".into()
            }),
            1
        );
        match rx.recv().await.unwrap() {
            Event::SettingsChanged { device } => assert_eq!(device, "camera"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn wait_sees_event_published_by_action() {
        let bus = EventBus::default();
        let publisher = bus.clone();
        let event = bus
            .execute_and_wait_for_or_timeout(
                |e| e.is_image_from("cam"),
                || async move {
                    publisher.publish(Event::UserAbort);
                    publisher.publish(Event::NewImage {
                        camera: "cam".into(),
                        frame: Arc::new(Frame::zeros(2, 2)),
                        timestamp: Utc::now(),
                    });
                    Ok::<_, CockpitError>(())
                },
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert!(matches!(event, Some(Event::NewImage { .. })));
    }

    #[tokio::test]
    async fn wait_times_out() {
        let bus = EventBus::default();
        let result = bus
            .execute_and_wait_for_or_timeout(
                |e| matches!(e, Event::UserAbort),
                || async { Ok::<_, CockpitError>(()) },
                Duration::from_millis(20),
            )
            .await
            .unwrap();
        assert!(result.is_none());

        let err = bus
            .execute_and_wait_for(
                |e| matches!(e, Event::UserAbort),
                || async { Ok::<_, CockpitError>(()) },
                Duration::from_millis(20),
                "abort",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CockpitError::Timeout(_, _)));
    }

    #[tokio::test]
    async fn action_errors_propagate() {
        let bus = EventBus::default();
        let result = bus
            .execute_and_wait_for_or_timeout(
                |_| true,
                || async { Err::<(), _>(CockpitError::DeviceDisabled("cam".into())) },
                Duration::from_millis(20),
            )
            .await;
        assert!(matches!(result, Err(CockpitError::DeviceDisabled(_))));
    }
}

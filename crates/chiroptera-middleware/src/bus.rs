//! Typed, topic-based publish/subscribe event bus.
//!
//! Uses [`tokio::sync::broadcast`] channels so every subscriber receives
//! every message and a slow subscriber never blocks the publisher; it lags
//! instead.
//!
//! # Topics
//!
//! | Topic | Typical traffic |
//! |---|---|
//! | [`Topic::Ranging`] | Echo detections and fused distances |
//! | [`Topic::Pose`] | Orientation and position estimates |
//! | [`Topic::Scan`] | Sweep phase changes and finalised room models |
//! | [`Topic::Alerts`] | Driver faults and dropped work |

use chiroptera_types::{ChiropteraError, Event, EventPayload};
use tokio::sync::broadcast;
use tracing::warn;

/// Events buffered per topic before slow subscribers start lagging.
pub const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Ranging,
    Pose,
    Scan,
    Alerts,
}

impl Topic {
    /// The lane a payload travels on.
    pub fn of(payload: &EventPayload) -> Self {
        match payload {
            EventPayload::FusedDistance(_) | EventPayload::Echo { .. } => Topic::Ranging,
            EventPayload::Orientation(_) | EventPayload::Position(_) => Topic::Pose,
            EventPayload::ScanPhaseChanged { .. } | EventPayload::RoomFinalized(_) => Topic::Scan,
            EventPayload::Fault { .. } => Topic::Alerts,
        }
    }
}

/// Shared event bus. Clones share the same channels.
#[derive(Clone, Debug)]
pub struct EventBus {
    ranging: broadcast::Sender<Event>,
    pose: broadcast::Sender<Event>,
    scan: broadcast::Sender<Event>,
    alerts: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a bus whose every topic buffers `capacity` events.
    ///
    /// # Errors
    ///
    /// [`ChiropteraError::Config`] when `capacity` is zero.
    pub fn new(capacity: usize) -> Result<Self, ChiropteraError> {
        if capacity == 0 {
            return Err(ChiropteraError::Config("event bus capacity must be positive".into()));
        }
        Ok(Self {
            ranging: broadcast::channel(capacity).0,
            pose: broadcast::channel(capacity).0,
            scan: broadcast::channel(capacity).0,
            alerts: broadcast::channel(capacity).0,
        })
    }

    /// Publish `event` on `topic`.
    ///
    /// Returns how many subscribers were handed the event. Nobody listening
    /// is a normal condition and yields `Ok(0)`.
    pub fn publish_to(&self, topic: Topic, event: Event) -> Result<usize, ChiropteraError> {
        let sender = self.topic_sender(topic);
        if sender.receiver_count() == 0 {
            return Ok(0);
        }
        match sender.send(event) {
            Ok(n) => Ok(n),
            // Every receiver dropped between the count and the send.
            Err(broadcast::error::SendError(_)) => Ok(0),
        }
    }

    /// Publish on the topic implied by the event's payload.
    pub fn publish(&self, event: Event) -> Result<usize, ChiropteraError> {
        let topic = Topic::of(&event.payload);
        self.publish_to(topic, event)
    }

    pub fn subscribe_to(&self, topic: Topic) -> TopicReceiver {
        TopicReceiver {
            topic,
            receiver: self.topic_sender(topic).subscribe(),
        }
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.topic_sender(topic).receiver_count()
    }

    fn topic_sender(&self, topic: Topic) -> &broadcast::Sender<Event> {
        match topic {
            Topic::Ranging => &self.ranging,
            Topic::Pose => &self.pose,
            Topic::Scan => &self.scan,
            Topic::Alerts => &self.alerts,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        let channel = || broadcast::channel(DEFAULT_CAPACITY).0;
        Self {
            ranging: channel(),
            pose: channel(),
            scan: channel(),
            alerts: channel(),
        }
    }
}

// ---------------------------------------------------------------------------
// Receiver
// ---------------------------------------------------------------------------

/// An async receiver bound to one [`Topic`].
pub struct TopicReceiver {
    topic: Topic,
    receiver: broadcast::Receiver<Event>,
}

impl TopicReceiver {
    /// Wait for the next event.
    ///
    /// `Err(Lagged(n))` means `n` events were overwritten before this
    /// subscriber read them; `Err(Closed)` means the bus is gone.
    pub async fn recv(&mut self) -> Result<Event, broadcast::error::RecvError> {
        self.receiver.recv().await
    }

    /// Wait for the next event, logging and skipping over lag.
    ///
    /// Returns `None` once the bus has shut down.
    pub async fn next(&mut self) -> Option<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(topic = ?self.topic, lagged_by = n, "subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chiroptera_types::{DistanceMeasurement, ScanPhase, SensorType, Vec3};
    use chrono::Utc;

    fn ranging_event() -> Event {
        Event::new(
            "chiroptera-middleware::test",
            EventPayload::FusedDistance(DistanceMeasurement::new(
                Some(2.0),
                SensorType::Fused,
                0.9,
                Vec3::new(1.0, 0.0, 0.0),
                Utc::now(),
            )),
        )
    }

    fn alert_event() -> Event {
        Event::new(
            "chiroptera-middleware::test",
            EventPayload::Fault {
                component: "tof".into(),
                message: "bus timeout".into(),
            },
        )
    }

    #[test]
    fn publish_without_subscribers_is_ok_zero() {
        let bus = EventBus::default();
        assert_eq!(bus.publish_to(Topic::Ranging, ranging_event()), Ok(0));
        assert_eq!(bus.publish(alert_event()), Ok(0));
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(matches!(EventBus::new(0), Err(ChiropteraError::Config(_))));
    }

    #[test]
    fn payloads_route_to_their_topic() {
        assert_eq!(Topic::of(&ranging_event().payload), Topic::Ranging);
        assert_eq!(Topic::of(&alert_event().payload), Topic::Alerts);
        let phase = EventPayload::ScanPhaseChanged {
            scan_id: None,
            phase: ScanPhase::Sweeping,
        };
        assert_eq!(Topic::of(&phase), Topic::Scan);
    }

    #[tokio::test]
    async fn multiple_subscribers_receive_same_event() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let mut a = bus.subscribe_to(Topic::Ranging);
        let mut b = bus.subscribe_to(Topic::Ranging);

        let event = ranging_event();
        assert_eq!(bus.publish(event.clone())?, 2);

        assert_eq!(a.recv().await?.id, event.id);
        assert_eq!(b.recv().await?.id, event.id);
        Ok(())
    }

    #[tokio::test]
    async fn other_topics_stay_silent() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let mut alerts = bus.subscribe_to(Topic::Alerts);
        let _ranging = bus.subscribe_to(Topic::Ranging);

        bus.publish(ranging_event())?;

        let result = tokio::time::timeout(std::time::Duration::from_millis(50), alerts.recv()).await;
        assert!(result.is_err(), "alerts subscriber must not see ranging traffic");
        Ok(())
    }

    #[tokio::test]
    async fn slow_subscriber_lags_then_resumes() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::new(8)?;
        let mut slow = bus.subscribe_to(Topic::Ranging);
        for _ in 0..100 {
            bus.publish(ranging_event())?;
        }

        assert!(matches!(slow.recv().await, Err(broadcast::error::RecvError::Lagged(_))));
        assert!(slow.next().await.is_some());
        assert_eq!(slow.topic(), Topic::Ranging);
        Ok(())
    }

    #[tokio::test]
    async fn next_returns_none_when_bus_dropped() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe_to(Topic::Pose);
        drop(bus);
        assert!(rx.next().await.is_none());
    }
}

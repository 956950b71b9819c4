//! Headless, typed, topic-based publish/subscribe event bus.
//!
//! Uses [`tokio::sync::broadcast`] channels under the hood so that every
//! subscriber receives every message without any single subscriber blocking
//! the others.
//!
//! # Topics
//!
//! Traffic is partitioned into two [`Topic`] lanes:
//!
//! | Topic | Typical traffic |
//! |---|---|
//! | [`Topic::Sensors`] | Calibration metadata, range images, point-cloud headers, poses |
//! | [`Topic::FilteredPoints`] | Extracted arm point sets |
//!
//! All inbound sensor streams share one lane so a single consumer observes
//! them in exactly the order they were published.

use armscan_types::{ArmScanError, Event, EventPayload};
use tokio::sync::broadcast;

/// Default channel capacity (number of buffered events before old ones are
/// dropped for slow subscribers).
pub const DEFAULT_CAPACITY: usize = 256;

/// Enumeration of all routing topics on the event bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Inbound collaborator data consumed by the fusion node.
    Sensors,
    /// Arm point sets produced by the fusion node.
    FilteredPoints,
}

impl Topic {
    /// The lane an event with `payload` belongs on.
    pub fn for_payload(payload: &EventPayload) -> Self {
        match payload {
            EventPayload::FilteredPoints(_) => Topic::FilteredPoints,
            EventPayload::Metadata(_)
            | EventPayload::RangeImage(_)
            | EventPayload::PointCloud(_)
            | EventPayload::Pose(_) => Topic::Sensors,
        }
    }
}

/// Shared event bus. Clone it cheaply – all clones share the same underlying
/// broadcast channels.
#[derive(Clone, Debug)]
pub struct EventBus {
    sensors: broadcast::Sender<Event>,
    filtered_points: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a new bus with the given channel capacity.
    ///
    /// The `capacity` is applied to every topic channel independently and
    /// must be non-zero.
    pub fn new(capacity: usize) -> Self {
        let (sensors, _) = broadcast::channel(capacity);
        let (filtered_points, _) = broadcast::channel(capacity);
        Self {
            sensors,
            filtered_points,
        }
    }

    /// Publish `event` to the given [`Topic`] channel.
    ///
    /// Returns the number of active receivers that were handed the event, or
    /// [`ArmScanError::Channel`] when nobody is subscribed to the topic.
    pub fn publish_to(&self, topic: Topic, event: Event) -> Result<usize, ArmScanError> {
        self.topic_sender(topic)
            .send(event)
            .map_err(|_| ArmScanError::Channel(format!("no subscribers for topic {topic:?}")))
    }

    /// Publish `event` on the lane matching its payload.
    pub fn publish(&self, event: Event) -> Result<usize, ArmScanError> {
        let topic = Topic::for_payload(&event.payload);
        self.publish_to(topic, event)
    }

    /// Subscribe to a specific [`Topic`] channel.
    ///
    /// Only events published after this call are delivered.
    pub fn subscribe_to(&self, topic: Topic) -> TopicReceiver {
        TopicReceiver {
            receiver: self.topic_sender(topic).subscribe(),
        }
    }

    /// Number of live receivers on `topic`.
    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.topic_sender(topic).receiver_count()
    }

    fn topic_sender(&self, topic: Topic) -> &broadcast::Sender<Event> {
        match topic {
            Topic::Sensors => &self.sensors,
            Topic::FilteredPoints => &self.filtered_points,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Topic-based receiver
// ---------------------------------------------------------------------------

/// An async receiver bound to a single [`Topic`] channel.
///
/// Obtained via [`EventBus::subscribe_to`].
#[derive(Debug)]
pub struct TopicReceiver {
    receiver: broadcast::Receiver<Event>,
}

impl TopicReceiver {
    /// Wait for the next event on this topic.
    ///
    /// Returns:
    /// * `Ok(event)` – a successfully received event.
    /// * `Err(broadcast::error::RecvError::Lagged(n))` – the subscriber fell
    ///   behind and `n` messages were dropped.  The caller decides whether to
    ///   continue or abort.
    /// * `Err(broadcast::error::RecvError::Closed)` – the bus has shut down.
    pub async fn recv(&mut self) -> Result<Event, broadcast::error::RecvError> {
        self.receiver.recv().await
    }

    /// Take the next buffered event without waiting.
    pub fn try_recv(&mut self) -> Result<Event, broadcast::error::TryRecvError> {
        self.receiver.try_recv()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use armscan_types::{FilteredPointSet, PointCloudHeader};
    use chrono::Utc;

    fn header_event(source: &str) -> Event {
        Event::new(
            source,
            EventPayload::PointCloud(PointCloudHeader {
                timestamp: Utc::now(),
                frame_id: "os_lidar".to_string(),
            }),
        )
    }

    fn points_event() -> Event {
        Event::new(
            "fusion",
            EventPayload::FilteredPoints(FilteredPointSet {
                timestamp: Utc::now(),
                frame_id: "os_sensor".to_string(),
                points: Vec::new(),
            }),
        )
    }

    #[tokio::test]
    async fn publish_routes_by_payload() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let mut sensors = bus.subscribe_to(Topic::Sensors);
        let mut outputs = bus.subscribe_to(Topic::FilteredPoints);

        let input = header_event("lidar");
        let output = points_event();
        bus.publish(input.clone())?;
        bus.publish(output.clone())?;

        assert_eq!(sensors.recv().await?.id, input.id);
        assert_eq!(outputs.recv().await?.id, output.id);
        assert!(sensors.try_recv().is_err());
        Ok(())
    }

    #[tokio::test]
    async fn sensor_lane_preserves_arrival_order() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let mut rx = bus.subscribe_to(Topic::Sensors);

        let sent: Vec<Event> = (0..5).map(|i| header_event(&format!("lidar/{i}"))).collect();
        for event in &sent {
            bus.publish(event.clone())?;
        }
        for event in &sent {
            assert_eq!(rx.recv().await?.id, event.id);
        }
        Ok(())
    }

    /// Two independent subscribers on the same topic both receive the event.
    #[tokio::test]
    async fn topic_multiple_subscribers_receive_same_event() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let mut subscriber1 = bus.subscribe_to(Topic::FilteredPoints);
        let mut subscriber2 = bus.subscribe_to(Topic::FilteredPoints);
        assert_eq!(bus.subscriber_count(Topic::FilteredPoints), 2);

        let event = points_event();
        bus.publish_to(Topic::FilteredPoints, event.clone())?;

        assert_eq!(subscriber1.recv().await?.id, event.id);
        assert_eq!(subscriber2.recv().await?.id, event.id);
        Ok(())
    }

    #[tokio::test]
    async fn topic_subscriber_does_not_receive_other_topic_events() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let mut outputs = bus.subscribe_to(Topic::FilteredPoints);
        let _sensors = bus.subscribe_to(Topic::Sensors);

        bus.publish_to(Topic::Sensors, header_event("lidar"))?;

        let result = tokio::time::timeout(std::time::Duration::from_millis(50), outputs.recv()).await;
        assert!(result.is_err(), "FilteredPoints subscriber must not see sensor traffic");
        Ok(())
    }

    #[test]
    fn publish_without_subscribers_returns_error() {
        let bus = EventBus::default();
        let err = bus.publish(header_event("lidar")).unwrap_err();
        assert!(matches!(err, ArmScanError::Channel(_)));
    }

    /// Flooding a low-capacity channel while a subscriber sleeps must produce
    /// a `Lagged` error rather than panicking or blocking.
    #[tokio::test]
    async fn topic_channel_lag_on_slow_subscriber() {
        const CAPACITY: usize = 64;
        let bus = EventBus::new(CAPACITY);
        let mut slow_sub = bus.subscribe_to(Topic::Sensors);

        for _ in 0..1_000 {
            let _ = bus.publish_to(Topic::Sensors, header_event("flood::lidar"));
        }

        let result = slow_sub.recv().await;
        assert!(
            matches!(result, Err(broadcast::error::RecvError::Lagged(_))),
            "expected Lagged error, got: {result:?}"
        );
    }
}

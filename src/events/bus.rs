use super::types::{DetectionEvent, EventKind};
use crate::error::NotifyError;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Receives events synchronously as the aggregator emits them.
///
/// Implementations must return quickly; anything slow belongs behind an
/// [`EventBus`] subscription.
pub trait EventSink: Send + Sync {
    fn on_event(&self, event: &DetectionEvent) -> Result<(), NotifyError>;
}

/// Fan-out of detection events to async subscribers over a broadcast channel
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<DetectionEvent>,
}

impl EventBus {
    /// Create a new event bus with the specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DetectionEvent> {
        self.sender.subscribe()
    }

    /// Subscriber that only sees the given kinds
    pub fn subscribe_filtered(&self, name: &str, kinds: Vec<EventKind>) -> EventReceiver {
        EventReceiver::new(self.sender.subscribe(), kinds, name.to_string())
    }

    /// Publish an event to all subscribers, returning how many received it
    pub fn publish(&self, event: DetectionEvent) -> Result<usize, NotifyError> {
        debug!("Publishing {}", event.description());
        self.sender
            .send(event)
            .map_err(|e| NotifyError::Delivery {
                details: e.to_string(),
            })
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn has_subscribers(&self) -> bool {
        self.sender.receiver_count() > 0
    }
}

impl EventSink for EventBus {
    fn on_event(&self, event: &DetectionEvent) -> Result<(), NotifyError> {
        // Nobody listening is not a delivery failure
        if !self.has_subscribers() {
            debug!("No subscribers for {} event", event.kind);
            return Ok(());
        }
        self.publish(event.clone()).map(|_| ())
    }
}

/// Broadcast receiver restricted to a set of event kinds
pub struct EventReceiver {
    receiver: broadcast::Receiver<DetectionEvent>,
    kinds: Vec<EventKind>,
    name: String,
}

impl EventReceiver {
    /// An empty `kinds` list accepts everything
    pub fn new(
        receiver: broadcast::Receiver<DetectionEvent>,
        kinds: Vec<EventKind>,
        name: String,
    ) -> Self {
        Self {
            receiver,
            kinds,
            name,
        }
    }

    fn accepts(&self, event: &DetectionEvent) -> bool {
        self.kinds.is_empty() || self.kinds.contains(&event.kind)
    }

    /// Receive the next matching event
    pub async fn recv(&mut self) -> Result<DetectionEvent, NotifyError> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if self.accepts(&event) {
                        debug!("Receiver '{}' received {}", self.name, event.kind);
                        return Ok(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Receiver '{}' lagged behind by {} events", self.name, skipped);
                    return Err(NotifyError::Lagged { skipped });
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Event bus closed for receiver '{}'", self.name);
                    return Err(NotifyError::Closed);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn event(kind: EventKind) -> DetectionEvent {
        DetectionEvent::new(kind, Utc::now(), 1, vec![], 0)
    }

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();

        assert_eq!(bus.publish(event(EventKind::MotionStarted)).unwrap(), 1);
        let received = rx.recv().await.unwrap();
        assert_eq!(received.kind, EventKind::MotionStarted);
    }

    #[test]
    fn test_sink_without_subscribers_is_ok() {
        let bus = EventBus::new(8);
        assert!(bus.publish(event(EventKind::Face)).is_err());
        assert!(bus.on_event(&event(EventKind::Face)).is_ok());
    }

    #[tokio::test]
    async fn test_filtered_receiver_skips_other_kinds() {
        let bus = EventBus::new(8);
        let mut faces = bus.subscribe_filtered("faces", vec![EventKind::Face]);

        bus.on_event(&event(EventKind::MotionStarted)).unwrap();
        bus.on_event(&event(EventKind::Face)).unwrap();

        assert_eq!(faces.recv().await.unwrap().kind, EventKind::Face);
    }

    #[tokio::test]
    async fn test_lagging_receiver_reports_skipped() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe_filtered("slow", vec![]);

        for _ in 0..5 {
            bus.on_event(&event(EventKind::MotionStopped)).unwrap();
        }

        assert!(matches!(rx.recv().await, Err(NotifyError::Lagged { skipped: 3 })));
        assert!(rx.recv().await.is_ok());
    }
}

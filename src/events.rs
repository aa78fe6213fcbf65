//! Domain mutation events and the in-process bus that carries them.
//!
//! Topics are `<entity>.<action>`, e.g. `order.update`. Subscribers filter
//! with `*` patterns such as `order.*`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::error::CacheError;
use crate::pattern::KeyPattern;
use crate::utils::now_ms;

/// Metadata key carrying the owning user's id.
pub const USER_ID_KEY: &str = "userId";

/// Default buffer of the event bus, in events.
pub const DEFAULT_BUS_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventAction {
    Create,
    Update,
    Delete,
}

impl EventAction {
    pub fn as_str(self) -> &'static str {
        match self {
            EventAction::Create => "create",
            EventAction::Update => "update",
            EventAction::Delete => "delete",
        }
    }
}

impl fmt::Display for EventAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A domain mutation that may make cached data stale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidationEvent {
    pub entity: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub action: EventAction,
    /// Unix milliseconds.
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl InvalidationEvent {
    pub fn new(entity: impl Into<String>, id: Option<String>, action: EventAction) -> Self {
        InvalidationEvent {
            entity: entity.into(),
            id,
            action,
            timestamp: now_ms(),
            actor_id: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_actor(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = Some(actor_id.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Tag the event with the user owning the mutated aggregate.
    pub fn with_user(self, user_id: impl Into<String>) -> Self {
        self.with_metadata(USER_ID_KEY, user_id.into())
    }

    /// `<entity>.<action>`
    pub fn topic(&self) -> String {
        format!("{}.{}", self.entity, self.action)
    }

    /// The `userId` metadata value, when it is a string or a number.
    pub fn user_id(&self) -> Option<String> {
        match self.metadata.get(USER_ID_KEY)? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

/// Broadcast bus for [`InvalidationEvent`]s.
///
/// Every subscription sees every event published after it was created.
/// Slow subscribers lose the oldest events once `capacity` is exceeded.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<InvalidationEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        EventBus { sender }
    }

    /// Publish to all current subscribers. Returns how many received it.
    pub fn publish(&self, event: InvalidationEvent) -> usize {
        match self.sender.send(event) {
            Ok(receivers) => receivers,
            Err(broadcast::error::SendError(event)) => {
                tracing::debug!(topic = %event.topic(), "event published with no subscribers");
                0
            }
        }
    }

    /// Subscribe to topics matching `topic_pattern`, e.g. `order.*`.
    pub fn subscribe(&self, topic_pattern: &str) -> Result<Subscription, CacheError> {
        Ok(Subscription {
            pattern: KeyPattern::parse(topic_pattern)?,
            receiver: self.sender.subscribe(),
        })
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        EventBus::new(DEFAULT_BUS_CAPACITY)
    }
}

/// A filtered view of the bus.
pub struct Subscription {
    pattern: KeyPattern,
    receiver: broadcast::Receiver<InvalidationEvent>,
}

impl Subscription {
    pub fn pattern(&self) -> &KeyPattern {
        &self.pattern
    }

    /// Next event whose topic matches, or `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<InvalidationEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if self.pattern.matches(&event.topic()) => return Some(event),
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        pattern = %self.pattern,
                        skipped,
                        "subscriber lagged, events dropped"
                    );
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_and_user_id() {
        let event = InvalidationEvent::new("order", Some("o1".into()), EventAction::Update)
            .with_user("u1")
            .with_actor("admin");

        assert_eq!(event.topic(), "order.update");
        assert_eq!(event.user_id().as_deref(), Some("u1"));
        assert_eq!(event.actor_id.as_deref(), Some("admin"));

        let numeric = InvalidationEvent::new("order", None, EventAction::Create)
            .with_metadata(USER_ID_KEY, 42);
        assert_eq!(numeric.user_id().as_deref(), Some("42"));
    }

    #[test]
    fn test_event_json_shape() {
        let json = r#"{"entity":"order","id":"o1","action":"delete","timestamp":5,"metadata":{"userId":"u1"}}"#;
        let event: InvalidationEvent = serde_json::from_str(json).unwrap();

        assert_eq!(event.action, EventAction::Delete);
        assert_eq!(event.id.as_deref(), Some("o1"));
        assert_eq!(event.user_id().as_deref(), Some("u1"));
        assert!(event.actor_id.is_none());
    }

    #[tokio::test]
    async fn test_subscription_filters_by_topic() {
        let bus = EventBus::default();
        let mut orders = bus.subscribe("order.*").unwrap();

        bus.publish(InvalidationEvent::new("user", Some("1".into()), EventAction::Update));
        bus.publish(InvalidationEvent::new("order", Some("o1".into()), EventAction::Create));

        let event = orders.recv().await.unwrap();
        assert_eq!(event.entity, "order");
        assert_eq!(event.id.as_deref(), Some("o1"));
    }

    #[tokio::test]
    async fn test_recv_returns_none_when_bus_dropped() {
        let bus = EventBus::new(4);
        let mut sub = bus.subscribe("*").unwrap();
        assert_eq!(bus.subscriber_count(), 1);

        drop(bus);
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_lagged_subscriber_keeps_receiving() {
        let bus = EventBus::new(2);
        let mut sub = bus.subscribe("order.*").unwrap();

        for i in 0..5 {
            bus.publish(InvalidationEvent::new("order", Some(i.to_string()), EventAction::Update));
        }

        // The two newest survive.
        assert_eq!(sub.recv().await.unwrap().id.as_deref(), Some("3"));
        assert_eq!(sub.recv().await.unwrap().id.as_deref(), Some("4"));
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::default();
        assert_eq!(bus.publish(InvalidationEvent::new("x", None, EventAction::Delete)), 0);
    }
}

//! Topic-based publish/subscribe transport.
//!
//! Execution and trigger-instance lifecycle events are published on fixed
//! topics with routing keys encoding resource type and operation; consumers
//! bind with AMQP-style routing-key patterns (`*` matches one segment, `#`
//! matches the rest). The in-process bus is the embedded implementation;
//! external brokers live behind the same trait.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use serde::{Deserialize, Serialize};

use crate::error::{BackendError, CascadeError, CascadeResult};

/// Topic carrying execution lifecycle events.
pub const TOPIC_EXECUTION: &str = "cascade.execution";

/// Topic carrying trigger instance lifecycle events.
pub const TOPIC_TRIGGER_INSTANCE: &str = "cascade.trigger_instance";

/// Operation half of a routing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOp {
    /// Resource created.
    Create,
    /// Resource updated.
    Update,
    /// Resource deleted.
    Delete,
}

impl std::fmt::Display for EventOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        };
        write!(f, "{s}")
    }
}

/// Builds a `<resource>.<op>` routing key.
#[must_use]
pub fn routing_key(resource: &str, op: EventOp) -> String {
    format!("{resource}.{op}")
}

/// A message published on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Topic the message was published on.
    pub topic: String,

    /// Routing key, e.g. `execution.update`.
    pub routing_key: String,

    /// JSON body.
    pub body: serde_json::Value,

    /// Publish timestamp.
    pub published_at: DateTime<Utc>,
}

/// Topic-exchange publish/subscribe primitive.
pub trait MessageBus: Send + Sync {
    /// Publishes a message. Never blocks on slow subscribers.
    fn publish(
        &self,
        topic: &str,
        routing_key: &str,
        body: serde_json::Value,
    ) -> CascadeResult<()>;

    /// Subscribes to messages on `topic` whose routing key matches
    /// `pattern`.
    fn subscribe(&self, topic: &str, pattern: &str) -> CascadeResult<Subscription>;
}

/// A bounded stream of matched messages.
#[derive(Debug)]
pub struct Subscription {
    rx: Receiver<Message>,
}

impl Subscription {
    /// Receives the next message (blocking).
    pub fn recv(&self) -> CascadeResult<Message> {
        self.rx.recv().map_err(|_| {
            CascadeError::Backend(BackendError::Disconnected {
                queue: "subscription".to_string(),
            })
        })
    }

    /// Receives the next message with a timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> CascadeResult<Message> {
        self.rx.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => CascadeError::Backend(BackendError::Timeout {
                duration_ms: timeout.as_millis().min(u128::from(u64::MAX)) as u64,
            }),
            RecvTimeoutError::Disconnected => CascadeError::Backend(BackendError::Disconnected {
                queue: "subscription".to_string(),
            }),
        })
    }

    /// Receives without blocking, `None` when no message is waiting.
    #[must_use]
    pub fn try_recv(&self) -> Option<Message> {
        self.rx.try_recv().ok()
    }
}

/// Returns true if `key` matches the binding `pattern`.
///
/// Both are `.`-separated. `*` matches exactly one segment; `#` matches zero
/// or more trailing segments.
#[must_use]
pub fn pattern_matches(pattern: &str, key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                // `#` absorbs any number of segments, including none.
                matches(&pattern[1..], key)
                    || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => matches(&pattern[1..], &key[1..]),
            (Some(p), Some(k)) if p == k => matches(&pattern[1..], &key[1..]),
            _ => false,
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    matches(&pattern, &key)
}

#[derive(Debug)]
struct Binding {
    topic: String,
    pattern: String,
    tx: Sender<Message>,
}

/// In-process message bus.
///
/// Publishing walks the matching bindings and uses non-blocking `try_send`;
/// messages to slow subscribers are dropped and counted rather than
/// stalling publishers.
#[derive(Debug)]
pub struct InProcessBus {
    bindings: RwLock<Vec<Binding>>,
    queue_capacity: usize,
    dropped_messages: AtomicU64,
}

impl InProcessBus {
    /// Creates a bus with the given per-subscription buffer capacity.
    #[must_use]
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            bindings: RwLock::new(Vec::new()),
            queue_capacity: queue_capacity.max(1),
            dropped_messages: AtomicU64::new(0),
        }
    }

    /// Messages dropped because a subscriber's buffer was full.
    #[must_use]
    pub fn dropped_messages(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }
}

impl Default for InProcessBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl MessageBus for InProcessBus {
    fn publish(
        &self,
        topic: &str,
        routing_key: &str,
        body: serde_json::Value,
    ) -> CascadeResult<()> {
        let message = Message {
            topic: topic.to_string(),
            routing_key: routing_key.to_string(),
            body,
            published_at: Utc::now(),
        };

        let mut bindings = self
            .bindings
            .write()
            .map_err(|_| CascadeError::internal("bus bindings lock poisoned"))?;

        // Prune bindings whose subscribers are gone while delivering.
        bindings.retain(|b| {
            if b.topic != topic || !pattern_matches(&b.pattern, routing_key) {
                return true;
            }
            match b.tx.try_send(message.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    self.dropped_messages.fetch_add(1, Ordering::Relaxed);
                    true
                }
                Err(TrySendError::Disconnected(_)) => false,
            }
        });

        Ok(())
    }

    fn subscribe(&self, topic: &str, pattern: &str) -> CascadeResult<Subscription> {
        let (tx, rx) = bounded(self.queue_capacity);
        let mut bindings = self
            .bindings
            .write()
            .map_err(|_| CascadeError::internal("bus bindings lock poisoned"))?;
        bindings.push(Binding {
            topic: topic.to_string(),
            pattern: pattern.to_string(),
            tx,
        });
        Ok(Subscription { rx })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn pattern_matching_table() {
        let cases = [
            ("execution.update", "execution.update", true),
            ("execution.update", "execution.create", false),
            ("execution.*", "execution.update", true),
            ("execution.*", "execution.update.extra", false),
            ("*.update", "execution.update", true),
            ("#", "execution.update", true),
            ("#", "a.b.c.d", true),
            ("execution.#", "execution.update", true),
            ("execution.#", "execution", true),
            ("execution.#", "trigger.update", false),
            ("*.#", "execution.update.extra", true),
        ];
        for (pattern, key, expected) in cases {
            assert_eq!(
                pattern_matches(pattern, key),
                expected,
                "pattern={pattern} key={key}"
            );
        }
    }

    #[test]
    fn publish_reaches_matching_subscribers() {
        let bus = InProcessBus::new(16);
        let all = bus.subscribe(TOPIC_EXECUTION, "#").unwrap();
        let updates = bus.subscribe(TOPIC_EXECUTION, "execution.update").unwrap();
        let other_topic = bus.subscribe(TOPIC_TRIGGER_INSTANCE, "#").unwrap();

        bus.publish(
            TOPIC_EXECUTION,
            &routing_key("execution", EventOp::Update),
            json!({"status": "running"}),
        )
        .unwrap();

        let m = all.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(m.routing_key, "execution.update");
        assert_eq!(m.body["status"], "running");

        let m = updates.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(m.topic, TOPIC_EXECUTION);

        assert!(other_topic.try_recv().is_none());
    }

    #[test]
    fn non_matching_key_is_not_delivered() {
        let bus = InProcessBus::new(16);
        let creates = bus.subscribe(TOPIC_EXECUTION, "execution.create").unwrap();

        bus.publish(TOPIC_EXECUTION, "execution.update", json!({}))
            .unwrap();
        assert!(creates.try_recv().is_none());
    }

    #[test]
    fn slow_subscriber_drops_are_counted() {
        let bus = InProcessBus::new(1);
        let _sub = bus.subscribe(TOPIC_EXECUTION, "#").unwrap();

        bus.publish(TOPIC_EXECUTION, "execution.create", json!({"n": 1}))
            .unwrap();
        bus.publish(TOPIC_EXECUTION, "execution.create", json!({"n": 2}))
            .unwrap();

        assert_eq!(bus.dropped_messages(), 1);
    }

    #[test]
    fn dropped_subscription_is_pruned() {
        let bus = InProcessBus::new(4);
        let sub = bus.subscribe(TOPIC_EXECUTION, "#").unwrap();
        drop(sub);

        bus.publish(TOPIC_EXECUTION, "execution.create", json!({}))
            .unwrap();
        // The publish after the drop prunes the dead binding rather than
        // counting a drop.
        assert_eq!(bus.dropped_messages(), 0);
    }
}

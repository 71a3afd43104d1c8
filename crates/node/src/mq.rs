//! In-process topic exchanges.
//!
//! The broker itself is an external collaborator; the pipeline only relies
//! on the small surface modeled here: topic exchanges with AMQP-style
//! binding patterns for fan-out, and one shared work queue for the message
//! workers where each payload is delivered to exactly one consumer.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, Mutex};

pub const PENDING_MESSAGES_QUEUE: &str = "aleph.pending_messages";

/// Routing key of a pending TX announcement.
pub fn pending_tx_routing_key(chain: &str, publisher: &str, tx_hash: &str) -> String {
    format!("{chain}.{publisher}.{tx_hash}")
}

/// Routing key of a processing result.
pub fn result_routing_key(status: &str, item_hash: &str, sender: &str) -> String {
    format!("{status}.{item_hash}.{sender}")
}

#[derive(Debug, Clone)]
pub struct MqMessage {
    pub routing_key: String,
    pub body: Vec<u8>,
}

/// Matches a routing key against an AMQP topic binding pattern: `*`
/// matches exactly one dot-separated word, `#` matches zero or more.
pub fn matches_binding(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                matches(&pattern[1..], key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => matches(&pattern[1..], &key[1..]),
            (Some(&word), Some(&first)) => word == first && matches(&pattern[1..], &key[1..]),
            _ => false,
        }
    }
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches(&pattern, &key)
}

/// A topic exchange. Every bound queue receives the messages whose routing
/// key matches its binding pattern; slow consumers drop the oldest
/// messages, which mirrors the transient auto-delete queues the push APIs
/// bind to.
#[derive(Clone)]
pub struct Exchange {
    tx: broadcast::Sender<MqMessage>,
}

impl Exchange {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Exchange { tx }
    }

    pub fn publish(&self, routing_key: &str, body: impl Into<Vec<u8>>) {
        // No subscriber bound is not an error, matching broker semantics.
        let _ = self.tx.send(MqMessage {
            routing_key: routing_key.to_string(),
            body: body.into(),
        });
    }

    pub fn subscribe(&self, pattern: &str) -> Subscription {
        Subscription {
            pattern: pattern.to_string(),
            rx: self.tx.subscribe(),
        }
    }
}

pub struct Subscription {
    pattern: String,
    rx: broadcast::Receiver<MqMessage>,
}

impl Subscription {
    /// Next message matching the binding pattern. Returns `None` once the
    /// exchange is dropped. Lagged intervals are skipped.
    pub async fn recv(&mut self) -> Option<MqMessage> {
        loop {
            match self.rx.recv().await {
                Ok(message) => {
                    if matches_binding(&self.pattern, &message.routing_key) {
                        return Some(message);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, pattern = %self.pattern, "subscription lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// The durable work queue behind the `message_processing` exchange: each
/// payload is consumed by exactly one worker.
#[derive(Clone)]
pub struct WorkQueue {
    tx: mpsc::UnboundedSender<MqMessage>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<MqMessage>>>,
}

impl WorkQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        WorkQueue {
            tx,
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    pub fn publish(&self, routing_key: &str, body: impl Into<Vec<u8>>) {
        let _ = self.tx.send(MqMessage {
            routing_key: routing_key.to_string(),
            body: body.into(),
        });
    }

    pub async fn recv(&self) -> Option<MqMessage> {
        self.rx.lock().await.recv().await
    }
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// The exchanges the pipeline stages communicate through.
#[derive(Clone)]
pub struct MqTopology {
    /// Topic exchange `pending_tx`, routing key `<chain>.<publisher>.<hash>`.
    pub pending_tx: Exchange,
    /// Direct exchange `message_processing` feeding `aleph.pending_messages`.
    pub message_processing: WorkQueue,
    /// Topic exchange `message_result`, routing key `<status>.<hash>.<sender>`.
    pub message_result: Exchange,
}

impl MqTopology {
    pub fn new() -> Self {
        MqTopology {
            pending_tx: Exchange::new(1024),
            message_processing: WorkQueue::new(),
            message_result: Exchange::new(1024),
        }
    }
}

impl Default for MqTopology {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn binding_patterns_follow_topic_semantics() {
        assert!(matches_binding("processed.*.*", "processed.abc.0xdef"));
        assert!(!matches_binding("processed.*.*", "rejected.abc.0xdef"));
        assert!(matches_binding("#", "a.b.c"));
        assert!(matches_binding("processed.#", "processed"));
        assert!(matches_binding("processed.#", "processed.abc.0xdef"));
        assert!(matches_binding("*.abc.#", "processed.abc"));
        assert!(!matches_binding("*.abc", "processed.abc.tail"));
        assert!(matches_binding(
            "ETH.*.*",
            &pending_tx_routing_key("ETH", "0xpub", "0xtx")
        ));
        assert!(matches_binding(
            "processed.#",
            &result_routing_key("processed", "cafebabe", "0xsender")
        ));
    }

    #[tokio::test]
    async fn exchange_routes_by_pattern() {
        let exchange = Exchange::new(16);
        let mut processed = exchange.subscribe("processed.#");
        let mut all = exchange.subscribe("#");

        exchange.publish("processed.abc.0xdef", b"one".to_vec());
        exchange.publish("rejected.abc.0xdef", b"two".to_vec());

        let message = processed.recv().await.unwrap();
        assert_eq!(message.routing_key, "processed.abc.0xdef");

        assert_eq!(all.recv().await.unwrap().routing_key, "processed.abc.0xdef");
        assert_eq!(all.recv().await.unwrap().routing_key, "rejected.abc.0xdef");
    }

    #[tokio::test]
    async fn work_queue_delivers_each_payload_once() {
        let queue = WorkQueue::new();
        queue.publish("pending", b"a".to_vec());
        queue.publish("pending", b"b".to_vec());

        let first = queue.recv().await.unwrap();
        let second = queue.recv().await.unwrap();
        assert_eq!(first.body, b"a");
        assert_eq!(second.body, b"b");
    }
}

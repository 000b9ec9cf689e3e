//! Topic-pattern message router.
//!
//! The router keeps a table of `(pattern, listener)` subscriptions and a map
//! of listener inboxes. Publishing wraps the payload in a
//! `TimestampedMessage` stamped with the current wall clock and enqueues it
//! on every matching inbox. Delivery is asynchronous and at-least-once; the
//! listener actor enforces idempotency, so the router never filters.
//!
//! Subscriptions are meant to be registered while the application wires its
//! components and left untouched afterwards.

use mf_protocol::{topic_matches, TimestampedMessage};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// One message as seen by a listener: the payload plus the concrete topic
/// that selected the subscription match.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub topic: String,
    pub message: TimestampedMessage,
}

struct BusInner {
    /// `(pattern, listener name)` pairs, in registration order.
    subscriptions: RwLock<Vec<(String, String)>>,
    /// Listener name -> inbox.
    inboxes: RwLock<HashMap<String, mpsc::UnboundedSender<Delivery>>>,
}

/// Cheaply clonable handle to the shared router.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBus {
    pub fn new() -> Self {
        MessageBus {
            inner: Arc::new(BusInner {
                subscriptions: RwLock::new(Vec::new()),
                inboxes: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Create the inbox for `listener_name`, returning its receiving end.
    ///
    /// Re-registering a name replaces the previous inbox; the old receiver
    /// simply stops seeing traffic.
    pub fn register_listener(&self, listener_name: &str) -> mpsc::UnboundedReceiver<Delivery> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inboxes = self.inner.inboxes.write().expect("bus inbox lock");
        inboxes.insert(listener_name.to_owned(), tx);
        rx
    }

    /// Subscribe `listener_name` to every topic matching `pattern`.
    pub fn subscribe(&self, pattern: &str, listener_name: &str) {
        let mut subs = self.inner.subscriptions.write().expect("bus subscription lock");
        subs.push((pattern.to_owned(), listener_name.to_owned()));
    }

    /// Publish `payload` on `topic`, stamped with the current wall clock.
    pub fn publish(&self, topic: &str, payload: impl Into<String>) {
        self.publish_message(topic, TimestampedMessage::now(payload));
    }

    /// Publish a pre-built message (tests use this to control timestamps).
    pub fn publish_message(&self, topic: &str, message: TimestampedMessage) {
        let subs = self.inner.subscriptions.read().expect("bus subscription lock");
        let inboxes = self.inner.inboxes.read().expect("bus inbox lock");

        let mut delivered = 0usize;
        for (pattern, listener) in subs.iter() {
            if !topic_matches(pattern, topic) {
                continue;
            }
            match inboxes.get(listener) {
                Some(tx) => {
                    let delivery = Delivery {
                        topic: topic.to_owned(),
                        message: message.clone(),
                    };
                    if tx.send(delivery).is_err() {
                        warn!(listener = %listener, topic = %topic, "listener inbox closed, dropping delivery");
                    } else {
                        delivered += 1;
                    }
                }
                None => {
                    warn!(listener = %listener, pattern = %pattern, "subscription names an unregistered listener");
                }
            }
        }

        if delivered == 0 {
            debug!(topic = %topic, "published message had no live subscribers");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_matching_listener_with_concrete_topic() {
        let bus = MessageBus::new();
        let mut rx = bus.register_listener("controller");
        bus.subscribe("dropbot/requests/#", "controller");

        bus.publish("dropbot/requests/halt", "");

        let delivery = rx.recv().await.unwrap();
        assert_eq!(delivery.topic, "dropbot/requests/halt");
        assert_eq!(delivery.message.payload(), "");
        assert!(delivery.message.timestamp_ms().is_some());
    }

    #[tokio::test]
    async fn non_matching_topics_are_not_delivered() {
        let bus = MessageBus::new();
        let mut rx = bus.register_listener("controller");
        bus.subscribe("dropbot/requests/#", "controller");

        bus.publish("dropbot/signals/halted", "x");
        bus.publish("dropbot/requests/set_voltage", "100");

        let delivery = rx.recv().await.unwrap();
        assert_eq!(delivery.topic, "dropbot/requests/set_voltage");
    }

    #[tokio::test]
    async fn multiple_subscribers_each_get_a_copy() {
        let bus = MessageBus::new();
        let mut rx_a = bus.register_listener("a");
        let mut rx_b = bus.register_listener("b");
        bus.subscribe("dropbot/signals/connected", "a");
        bus.subscribe("dropbot/signals/#", "b");

        bus.publish("dropbot/signals/connected", "");

        assert_eq!(rx_a.recv().await.unwrap().topic, "dropbot/signals/connected");
        assert_eq!(rx_b.recv().await.unwrap().topic, "dropbot/signals/connected");
    }

    #[tokio::test]
    async fn per_topic_send_order_is_preserved() {
        let bus = MessageBus::new();
        let mut rx = bus.register_listener("l");
        bus.subscribe("dropbot/requests/set_voltage", "l");

        for v in ["30", "80", "150"] {
            bus.publish("dropbot/requests/set_voltage", v);
        }

        for expected in ["30", "80", "150"] {
            assert_eq!(rx.recv().await.unwrap().message.payload(), expected);
        }
    }
}

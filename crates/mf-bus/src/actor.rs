//! Listener actor: per-component inbox dispatch.
//!
//! Each subscribing component is wrapped in an actor task that owns it.
//! Incoming deliveries resolve to a handler through a static table keyed by
//! `on_<specific>_<suffix>`, where `<specific>` is the topic's last segment
//! and `<suffix>` is `request` for `.../requests/...` topics and `signal`
//! otherwise. A missing handler is not an error. Handler failures are
//! logged and never retried; the actor keeps running.
//!
//! Handlers run to completion one at a time -- execution is serialized per
//! listener. The actor also enforces idempotent delivery: per topic, a
//! message whose timestamp is not strictly newer than the last processed
//! one is dropped.

use crate::router::Delivery;
use mf_protocol::message::TimestampedMessage;
use mf_protocol::topics::{primary_segment, specific_segment};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failure of a single handler invocation. Reported, never retried.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// The payload did not parse as the shape the handler expects.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    /// The operation itself failed.
    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    pub fn invalid(err: impl std::fmt::Display) -> Self {
        HandlerError::InvalidPayload(err.to_string())
    }

    pub fn failed(err: impl std::fmt::Display) -> Self {
        HandlerError::Failed(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Handler table
// ---------------------------------------------------------------------------

pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'a>>;

/// A handler borrows its component for the duration of one invocation.
pub type Handler<C> = for<'a> fn(&'a mut C, &'a TimestampedMessage) -> HandlerFuture<'a>;

/// Static mapping from handler name to method, built at construction time.
pub struct HandlerTable<C> {
    entries: HashMap<&'static str, Handler<C>>,
}

impl<C> Default for HandlerTable<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> HandlerTable<C> {
    pub fn new() -> Self {
        HandlerTable {
            entries: HashMap::new(),
        }
    }

    /// Register a handler under its `on_<specific>_<suffix>` name.
    pub fn on(mut self, name: &'static str, handler: Handler<C>) -> Self {
        self.entries.insert(name, handler);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Handler<C>> {
        self.entries.get(name)
    }
}

/// Handler name for a topic: `on_<specific>_<request|signal>`.
pub fn handler_key(topic: &str) -> String {
    let suffix = match primary_segment(topic) {
        Some("requests") => "request",
        _ => "signal",
    };
    format!("on_{}_{}", specific_segment(topic), suffix)
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

pub struct ListenerActor;

impl ListenerActor {
    /// Spawn the actor task for `component`, consuming deliveries from `rx`.
    ///
    /// The task ends when the inbox closes (bus dropped or listener
    /// re-registered).
    pub fn spawn<C: Send + 'static>(
        listener_name: &str,
        component: C,
        table: HandlerTable<C>,
        rx: mpsc::UnboundedReceiver<Delivery>,
    ) -> JoinHandle<()> {
        let name = listener_name.to_owned();
        tokio::spawn(run_actor(name, component, table, rx))
    }
}

async fn run_actor<C>(
    name: String,
    mut component: C,
    table: HandlerTable<C>,
    mut rx: mpsc::UnboundedReceiver<Delivery>,
) {
    let mut last_seen: HashMap<String, u64> = HashMap::new();

    while let Some(delivery) = rx.recv().await {
        let ts = delivery.message.effective_timestamp();
        if let Some(&seen) = last_seen.get(&delivery.topic) {
            if ts <= seen {
                trace!(
                    listener = %name,
                    topic = %delivery.topic,
                    ts,
                    seen,
                    "dropping stale duplicate"
                );
                continue;
            }
        }
        last_seen.insert(delivery.topic.clone(), ts);

        let key = handler_key(&delivery.topic);
        match table.get(&key) {
            Some(handler) => {
                if let Err(err) = handler(&mut component, &delivery.message).await {
                    error!(
                        listener = %name,
                        topic = %delivery.topic,
                        %err,
                        "handler failed"
                    );
                }
            }
            None => {
                debug!(listener = %name, topic = %delivery.topic, handler = %key, "no handler registered");
            }
        }
    }

    debug!(listener = %name, "listener inbox closed, actor exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::MessageBus;
    use std::sync::{Arc, Mutex};
    use tokio::time::{sleep, Duration};

    #[derive(Default)]
    struct Recorder {
        calls: Arc<Mutex<Vec<String>>>,
    }

    fn on_set_voltage_request<'a>(
        c: &'a mut Recorder,
        msg: &'a TimestampedMessage,
    ) -> HandlerFuture<'a> {
        Box::pin(async move {
            c.calls
                .lock()
                .unwrap()
                .push(format!("voltage:{}", msg.payload()));
            Ok(())
        })
    }

    fn on_halted_signal<'a>(c: &'a mut Recorder, _msg: &'a TimestampedMessage) -> HandlerFuture<'a> {
        Box::pin(async move {
            c.calls.lock().unwrap().push("halted".to_owned());
            Err(HandlerError::failed("hardware fault"))
        })
    }

    fn table() -> HandlerTable<Recorder> {
        HandlerTable::new()
            .on("on_set_voltage_request", on_set_voltage_request)
            .on("on_halted_signal", on_halted_signal)
    }

    #[test]
    fn handler_key_uses_request_and_signal_suffixes() {
        assert_eq!(handler_key("dropbot/requests/set_voltage"), "on_set_voltage_request");
        assert_eq!(handler_key("dropbot/signals/halted"), "on_halted_signal");
        assert_eq!(
            handler_key("dropbot/signals/warnings/no_power"),
            "on_no_power_signal"
        );
        assert_eq!(
            handler_key("device_viewer/state_changed"),
            "on_state_changed_signal"
        );
    }

    #[tokio::test]
    async fn dispatches_by_topic_suffix() {
        let bus = MessageBus::new();
        let rx = bus.register_listener("rec");
        bus.subscribe("dropbot/#", "rec");

        let recorder = Recorder::default();
        let calls = recorder.calls.clone();
        ListenerActor::spawn("rec", recorder, table(), rx);

        bus.publish("dropbot/requests/set_voltage", "120");
        sleep(Duration::from_millis(20)).await;

        assert_eq!(calls.lock().unwrap().as_slice(), ["voltage:120"]);
    }

    #[tokio::test]
    async fn stale_duplicates_are_dropped_per_topic() {
        let bus = MessageBus::new();
        let rx = bus.register_listener("rec");
        bus.subscribe("dropbot/#", "rec");

        let recorder = Recorder::default();
        let calls = recorder.calls.clone();
        ListenerActor::spawn("rec", recorder, table(), rx);

        let topic = "dropbot/requests/set_voltage";
        bus.publish_message(topic, TimestampedMessage::new("100", Some(50)));
        bus.publish_message(topic, TimestampedMessage::new("110", Some(50)));
        bus.publish_message(topic, TimestampedMessage::new("120", Some(40)));
        bus.publish_message(topic, TimestampedMessage::new("130", Some(60)));
        sleep(Duration::from_millis(20)).await;

        assert_eq!(
            calls.lock().unwrap().as_slice(),
            ["voltage:100", "voltage:130"]
        );
    }

    #[tokio::test]
    async fn handler_error_does_not_kill_the_actor() {
        let bus = MessageBus::new();
        let rx = bus.register_listener("rec");
        bus.subscribe("dropbot/#", "rec");

        let recorder = Recorder::default();
        let calls = recorder.calls.clone();
        ListenerActor::spawn("rec", recorder, table(), rx);

        bus.publish_message("dropbot/signals/halted", TimestampedMessage::new("", Some(1)));
        bus.publish_message(
            "dropbot/requests/set_voltage",
            TimestampedMessage::new("90", Some(2)),
        );
        sleep(Duration::from_millis(20)).await;

        assert_eq!(calls.lock().unwrap().as_slice(), ["halted", "voltage:90"]);
    }

    #[tokio::test]
    async fn missing_handler_is_not_an_error() {
        let bus = MessageBus::new();
        let rx = bus.register_listener("rec");
        bus.subscribe("dropbot/#", "rec");

        let recorder = Recorder::default();
        let calls = recorder.calls.clone();
        ListenerActor::spawn("rec", recorder, table(), rx);

        bus.publish_message("dropbot/requests/unknown_op", TimestampedMessage::new("", Some(1)));
        bus.publish_message(
            "dropbot/requests/set_voltage",
            TimestampedMessage::new("95", Some(2)),
        );
        sleep(Duration::from_millis(20)).await;

        assert_eq!(calls.lock().unwrap().as_slice(), ["voltage:95"]);
    }
}

//! Bus listener feeding the runner's mailbox.
//!
//! The runner itself is a plain actor with its own event loop, so this thin
//! listener translates the bus signals it cares about -- capacitance
//! updates and droplet detection responses -- into `RunnerEvent`s.

use crate::runner::RunnerEvent;
use mf_bus::{HandlerError, HandlerFuture, HandlerTable, MessageBus};
use mf_protocol::{topics, CapacitanceSignal, DropletResponse, TimestampedMessage};
use tokio::sync::mpsc;
use tracing::debug;

pub const LISTENER_NAME: &str = "protocol_runner_listener";

pub struct RunnerListener {
    runner_tx: mpsc::UnboundedSender<RunnerEvent>,
}

impl RunnerListener {
    pub fn new(runner_tx: mpsc::UnboundedSender<RunnerEvent>) -> Self {
        RunnerListener { runner_tx }
    }

    pub fn subscriptions() -> Vec<&'static str> {
        vec![topics::CAPACITANCE_UPDATED, topics::DROPLETS_DETECTED]
    }

    pub fn handler_table() -> HandlerTable<RunnerListener> {
        HandlerTable::new()
            .on("on_capacitance_updated_signal", on_capacitance_updated_signal)
            .on("on_drops_detected_signal", on_drops_detected_signal)
    }

    /// Register the listener on `bus` and spawn its actor.
    pub fn attach(bus: &MessageBus, runner_tx: mpsc::UnboundedSender<RunnerEvent>) {
        let rx = bus.register_listener(LISTENER_NAME);
        for pattern in Self::subscriptions() {
            bus.subscribe(pattern, LISTENER_NAME);
        }
        mf_bus::ListenerActor::spawn(
            LISTENER_NAME,
            RunnerListener::new(runner_tx),
            Self::handler_table(),
            rx,
        );
    }
}

fn on_capacitance_updated_signal<'a>(
    l: &'a mut RunnerListener,
    msg: &'a TimestampedMessage,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let signal: CapacitanceSignal =
            serde_json::from_str(msg.payload()).map_err(HandlerError::invalid)?;
        let (Some(picofarads), Some(volts)) = (signal.picofarads(), signal.volts()) else {
            return Err(HandlerError::invalid(format!(
                "capacitance payload missing units: {}",
                msg.payload()
            )));
        };
        let _ = l
            .runner_tx
            .send(RunnerEvent::CapacitanceSample { picofarads, volts });
        Ok(())
    })
}

fn on_drops_detected_signal<'a>(
    l: &'a mut RunnerListener,
    msg: &'a TimestampedMessage,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let response: DropletResponse =
            serde_json::from_str(msg.payload()).map_err(HandlerError::invalid)?;
        debug!(success = response.success, "droplet response received");
        let _ = l.runner_tx.send(RunnerEvent::DropletResponse(response));
        Ok(())
    })
}

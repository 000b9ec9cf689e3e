//! State-setting request handlers: voltage, frequency, realtime mode, and
//! direct electrode writes.
//!
//! All writes go through the guard's scoped access. Outside realtime mode
//! the HV output stays disabled while setpoints change; enabling realtime
//! mode turns the output on and announces the change.

use crate::driver::StateUpdate;
use crate::supervisor::{bool_payload, DropbotController};
use mf_bus::{HandlerError, HandlerFuture};
use mf_protocol::{topics, TimestampedMessage};
use std::collections::BTreeMap;
use tracing::info;

pub(crate) fn on_set_voltage_request<'a>(
    c: &'a mut DropbotController,
    msg: &'a TimestampedMessage,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        if !c.require_connection("set_voltage") {
            return Ok(());
        }
        let voltage: f64 = msg.payload().trim().parse().map_err(HandlerError::invalid)?;
        if !(30.0..=150.0).contains(&voltage) {
            return Err(HandlerError::invalid(format!(
                "voltage must be between 30 and 150 V, got {voltage}"
            )));
        }

        let realtime = c.realtime_mode;
        c.guard
            .with_proxy("set_voltage", c.config.detection_timeout, move |driver| {
                let update = if realtime {
                    StateUpdate {
                        voltage: Some(voltage),
                        ..StateUpdate::default()
                    }
                } else {
                    StateUpdate {
                        hv_output_enabled: Some(false),
                        voltage: Some(voltage),
                        ..StateUpdate::default()
                    }
                };
                driver.update_state(&update)
            })
            .await
            .map_err(HandlerError::failed)?;
        info!(voltage, "voltage set");
        Ok(())
    })
}

pub(crate) fn on_set_frequency_request<'a>(
    c: &'a mut DropbotController,
    msg: &'a TimestampedMessage,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        if !c.require_connection("set_frequency") {
            return Ok(());
        }
        let frequency: f64 = msg.payload().trim().parse().map_err(HandlerError::invalid)?;
        if !(100.0..=20_000.0).contains(&frequency) {
            return Err(HandlerError::invalid(format!(
                "frequency must be between 100 and 20000 Hz, got {frequency}"
            )));
        }

        let realtime = c.realtime_mode;
        c.guard
            .with_proxy("set_frequency", c.config.detection_timeout, move |driver| {
                let update = if realtime {
                    StateUpdate {
                        frequency: Some(frequency),
                        ..StateUpdate::default()
                    }
                } else {
                    StateUpdate {
                        hv_output_enabled: Some(false),
                        frequency: Some(frequency),
                        ..StateUpdate::default()
                    }
                };
                driver.update_state(&update)
            })
            .await
            .map_err(HandlerError::failed)?;
        info!(frequency, "frequency set");
        Ok(())
    })
}

pub(crate) fn on_set_realtime_mode_request<'a>(
    c: &'a mut DropbotController,
    msg: &'a TimestampedMessage,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        if !c.require_connection("set_realtime_mode") {
            return Ok(());
        }
        let enable = msg.payload() == "True";
        let update = if enable {
            StateUpdate {
                hv_output_selected: Some(true),
                hv_output_enabled: Some(true),
                ..StateUpdate::default()
            }
        } else {
            StateUpdate {
                hv_output_enabled: Some(false),
                ..StateUpdate::default()
            }
        };
        c.guard
            .with_proxy("set_realtime_mode", c.config.detection_timeout, move |driver| {
                driver.update_state(&update)
            })
            .await
            .map_err(HandlerError::failed)?;
        c.realtime_mode = enable;
        c.bus
            .publish(topics::REALTIME_MODE_UPDATED, bool_payload(enable));
        info!(enable, "realtime mode set");
        Ok(())
    })
}

pub(crate) fn on_electrodes_state_change_request<'a>(
    c: &'a mut DropbotController,
    msg: &'a TimestampedMessage,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        if !c.require_connection("electrodes_state_change") {
            return Ok(());
        }
        // Payload: `{"<channel>": bool, ...}`; unnamed channels go low.
        let requested: BTreeMap<String, bool> =
            serde_json::from_str(msg.payload()).map_err(HandlerError::invalid)?;

        let channel_count = c.guard.expected_channels() as usize;
        let mut state = vec![false; channel_count];
        for (channel, on) in requested {
            let index: usize = channel.trim().parse().map_err(|_| {
                HandlerError::invalid(format!("channel key '{channel}' is not a number"))
            })?;
            if index >= channel_count {
                return Err(HandlerError::invalid(format!(
                    "channel {index} out of range (count {channel_count})"
                )));
            }
            state[index] = on;
        }

        c.guard
            .with_proxy("electrodes_state_change", c.config.detection_timeout, move |driver| {
                driver.set_state_of_channels(&state)
            })
            .await
            .map_err(HandlerError::failed)?;
        Ok(())
    })
}

//! Droplet detection on the hardware side.
//!
//! Answers `detect_droplets` requests: an empty payload scans the whole
//! chip, a JSON array restricts the scan to those channels (invalid entries
//! are dropped). The scan runs under the transaction lock with the device's
//! settings saved and restored around it -- channels off, detection
//! frequency applied, short settle delays -- and retries once per the
//! configured policy before answering with a failure response.

use crate::driver::{DriverError, DropbotDriver, StateUpdate};
use crate::guard::ProxyAccessError;
use crate::supervisor::DropbotController;
use mf_bus::{HandlerError, HandlerFuture};
use mf_protocol::{topics, DropletResponse, TimestampedMessage};
use std::time::Duration;
use tracing::{debug, info, warn};

const SETTLE: Duration = Duration::from_millis(50);

pub(crate) fn on_detect_droplets_request<'a>(
    c: &'a mut DropbotController,
    msg: &'a TimestampedMessage,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        if !c.require_connection("detect_droplets") {
            return Ok(());
        }

        let target = parse_detection_message(msg.payload(), c.guard.expected_channels());
        match target {
            Some(ref channels) => info!(?channels, "targeted droplet detection"),
            None => info!("droplet detection on all channels"),
        }

        let response = run_detection(c, target.as_deref()).await;
        let payload = serde_json::to_string(&response).map_err(HandlerError::failed)?;
        c.bus.publish(topics::DROPLETS_DETECTED, payload);
        Ok(())
    })
}

/// Empty payload -> all channels. A JSON array keeps the in-range entries;
/// anything unparsable falls back to a full scan.
fn parse_detection_message(payload: &str, channel_count: u32) -> Option<Vec<u32>> {
    if payload.trim().is_empty() {
        return None;
    }
    let values: Vec<serde_json::Value> = match serde_json::from_str(payload) {
        Ok(values) => values,
        Err(err) => {
            info!(%err, "invalid detection payload, falling back to full scan");
            return None;
        }
    };

    let mut channels = Vec::new();
    for value in values {
        match value.as_u64() {
            Some(ch) if (ch as u32) < channel_count => channels.push(ch as u32),
            _ => info!(?value, "invalid channel value, skipping"),
        }
    }
    if channels.is_empty() {
        None
    } else {
        Some(channels)
    }
}

async fn run_detection(c: &DropbotController, target: Option<&[u32]>) -> DropletResponse {
    let retries = c.config.detection_retries;
    let mut last_error = String::new();

    for attempt in 0..=retries {
        match detection_attempt(c, target).await {
            Ok(channels) => {
                info!(?channels, "droplets detected");
                return DropletResponse::ok(channels);
            }
            Err(err) => {
                warn!(attempt = attempt + 1, %err, "droplet detection attempt failed");
                last_error = err.to_string();
                if attempt < retries {
                    tokio::time::sleep(c.config.detection_retry_delay).await;
                }
            }
        }
    }

    DropletResponse::failed(format!(
        "all detection attempts failed; last error: {last_error}"
    ))
}

async fn detection_attempt(
    c: &DropbotController,
    target: Option<&[u32]>,
) -> Result<Vec<u32>, ProxyAccessError> {
    let mut slot = c
        .guard
        .lock_proxy("droplet_detection", c.config.detection_timeout)
        .await?;
    let driver = slot.as_mut().ok_or(ProxyAccessError::Unavailable)?;

    validate_detection_preconditions(driver.as_ref(), c.config.expected_channels)?;

    let original = OriginalSettings::capture(driver.as_ref())?;

    let scan = async {
        driver.turn_off_all_channels()?;
        tokio::time::sleep(SETTLE).await;
        driver.update_state(&StateUpdate {
            frequency: Some(c.config.detection_frequency_hz),
            ..StateUpdate::default()
        })?;
        tokio::time::sleep(SETTLE).await;

        let mut detected = driver.detect_droplets(target)?;
        detected.retain(|ch| *ch < c.config.expected_channels);
        detected.sort_unstable();
        detected.dedup();
        Ok::<Vec<u32>, DriverError>(detected)
    }
    .await;

    // Restore device settings whether or not the scan succeeded.
    original.restore(driver.as_mut());

    drop(slot);
    c.guard.validate_proxy_state().await;

    scan.map_err(ProxyAccessError::from)
}

fn validate_detection_preconditions(
    driver: &dyn DropbotDriver,
    expected: u32,
) -> Result<(), ProxyAccessError> {
    let channels = driver.number_of_channels()?;
    if channels != expected {
        return Err(ProxyAccessError::Driver(DriverError::Fault(format!(
            "invalid channel count for detection: {channels}"
        ))));
    }
    let state = driver.state_of_channels()?;
    if state.len() != channels as usize {
        return Err(ProxyAccessError::Driver(DriverError::Fault(format!(
            "state inconsistency: {} != {channels}",
            state.len()
        ))));
    }
    Ok(())
}

struct OriginalSettings {
    state: Vec<bool>,
    voltage: f64,
    frequency: f64,
}

impl OriginalSettings {
    fn capture(driver: &dyn DropbotDriver) -> Result<Self, ProxyAccessError> {
        Ok(OriginalSettings {
            state: driver.state_of_channels()?,
            voltage: driver.voltage()?,
            frequency: driver.frequency()?,
        })
    }

    fn restore(&self, driver: &mut dyn DropbotDriver) {
        if let Err(err) = driver.update_state(&StateUpdate {
            voltage: Some(self.voltage),
            frequency: Some(self.frequency),
            ..StateUpdate::default()
        }) {
            warn!(%err, "failed to restore voltage/frequency after detection");
        }
        match driver.set_state_of_channels(&self.state) {
            Ok(()) => debug!("electrode state restored after detection"),
            Err(err) => warn!(%err, "failed to restore electrode state after detection"),
        }
    }
}

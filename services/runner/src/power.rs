//! Voltage/frequency publishing for protocol steps.
//!
//! Setpoints are validated against the hardware's safe ranges before they
//! go out; out-of-range or unparseable values fall back to the defaults
//! (100 V, 10 kHz). Preview runs publish nothing.

use mf_bus::MessageBus;
use mf_protocol::topics;
use protocol_core::params;
use protocol_core::ProtocolStep;
use tracing::info;

pub const VOLTAGE_MIN: f64 = 30.0;
pub const VOLTAGE_MAX: f64 = 150.0;
pub const FREQUENCY_MIN: f64 = 100.0;
pub const FREQUENCY_MAX: f64 = 20_000.0;

/// Voltage within `[30, 150]` V, defaulting to 100 V.
pub fn validate_voltage(raw: Option<&str>) -> f64 {
    match raw.and_then(|v| v.trim().parse::<f64>().ok()) {
        Some(v) if (VOLTAGE_MIN..=VOLTAGE_MAX).contains(&v) => v,
        Some(v) => {
            info!(voltage = v, "voltage out of range, using default 100 V");
            params::DEFAULT_VOLTAGE
        }
        None => params::DEFAULT_VOLTAGE,
    }
}

/// Frequency within `[100, 20000]` Hz, defaulting to 10 kHz.
pub fn validate_frequency(raw: Option<&str>) -> f64 {
    match raw.and_then(|v| v.trim().parse::<f64>().ok()) {
        Some(f) if (FREQUENCY_MIN..=FREQUENCY_MAX).contains(&f) => f,
        Some(f) => {
            info!(frequency = f, "frequency out of range, using default 10 kHz");
            params::DEFAULT_FREQUENCY
        }
        None => params::DEFAULT_FREQUENCY,
    }
}

/// Publish a step's setpoints on entry. No-op in preview mode.
pub fn publish_step_voltage_frequency(bus: &MessageBus, step: &ProtocolStep, preview_mode: bool) {
    if preview_mode {
        return;
    }
    let voltage = validate_voltage(step.parameter(params::VOLTAGE));
    let frequency = validate_frequency(step.parameter(params::FREQUENCY));
    bus.publish(topics::SET_VOLTAGE, voltage.to_string());
    bus.publish(topics::SET_FREQUENCY, frequency.to_string());
    info!(voltage, frequency, "published step setpoints");
}

/// Publish setpoints immediately, for advanced-mode edits of the running
/// step. No-op in preview mode.
pub fn publish_immediate_voltage_frequency(
    bus: &MessageBus,
    voltage_raw: &str,
    frequency_raw: &str,
    preview_mode: bool,
) {
    if preview_mode {
        return;
    }
    let voltage = validate_voltage(Some(voltage_raw));
    let frequency = validate_frequency(Some(frequency_raw));
    bus.publish(topics::SET_VOLTAGE, voltage.to_string());
    bus.publish(topics::SET_FREQUENCY, frequency.to_string());
}

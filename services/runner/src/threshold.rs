//! Volume-threshold monitoring.
//!
//! When a step sets `Volume Threshold`, a phase may finish early: the
//! target capacitance is the threshold fraction of the actuated area times
//! the calibrated capacitance per unit area, and the monitor fires once the
//! live capacitance reading reaches it. Incomplete calibration or a
//! non-positive target disables the monitor for the phase.

use protocol_core::calibration::CalibrationData;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Target capacitance for one phase, in pF.
///
/// `threshold × Σ area(actuated) × C/A`, or `None` when calibration is
/// incomplete or nothing with a known area is actuated.
pub fn target_capacitance(
    volume_threshold: f64,
    actuated_electrodes: &BTreeMap<String, bool>,
    calibration: &CalibrationData,
) -> Option<f64> {
    if volume_threshold <= 0.0 {
        return None;
    }
    if !calibration.is_complete() {
        info!("incomplete calibration data, volume threshold disabled");
        return None;
    }
    let c_unit_area = calibration.capacitance_per_unit_area()?;
    let actuated_area = calibration.actuated_area(actuated_electrodes);
    if actuated_area <= 0.0 {
        info!("no actuated area known, volume threshold disabled");
        return None;
    }
    let target = volume_threshold * actuated_area * c_unit_area;
    debug!(volume_threshold, actuated_area, c_unit_area, target, "volume threshold target");
    Some(target)
}

/// Live monitor state for the current phase.
#[derive(Debug, Default)]
pub struct ThresholdMonitor {
    target: Option<f64>,
    latest: Option<f64>,
}

impl ThresholdMonitor {
    /// Arm for a phase. Returns whether monitoring is actually on.
    pub fn arm(&mut self, target: Option<f64>) -> bool {
        self.target = target.filter(|t| *t > 0.0);
        self.target.is_some()
    }

    pub fn disarm(&mut self) {
        self.target = None;
    }

    pub fn is_armed(&self) -> bool {
        self.target.is_some()
    }

    pub fn target(&self) -> Option<f64> {
        self.target
    }

    /// Feed the newest capacitance reading (pF).
    pub fn update(&mut self, picofarads: f64) {
        self.latest = Some(picofarads);
    }

    /// True when the armed target has been reached by the latest reading.
    pub fn reached(&self) -> bool {
        match (self.target, self.latest) {
            (Some(target), Some(latest)) => latest >= target,
            _ => false,
        }
    }
}

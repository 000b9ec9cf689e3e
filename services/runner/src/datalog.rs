//! Run-scoped capacitance data log.
//!
//! During a run every capacitance sample is recorded together with the
//! protocol context it was taken under. The log is an in-memory JSON array
//! flushed to `data.json` in the experiment directory when the run ends.
//! Preview runs log nothing.

use mf_protocol::CapacitanceSignal;
use protocol_core::calibration;
use serde::Serialize;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Execution context attached to each sample.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LogContext {
    pub step_id: String,
    pub actuated_channels: Vec<u32>,
    /// Summed area of the actuated electrodes, mm².
    pub actuated_area: f64,
}

#[derive(Debug, Serialize)]
struct LogEntry {
    timestamp: String,
    capacitance: String,
    voltage: String,
    #[serde(rename = "force per unit area")]
    force_per_unit_area: Option<f64>,
    step_id: String,
    actuated_channels: Vec<u32>,
    #[serde(rename = "actuated_area in mm^2")]
    actuated_area: f64,
}

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("write {path}: {source}")]
    Write {
        path: String,
        source: std::io::Error,
    },
}

#[derive(Default)]
pub struct DataLogger {
    entries: Vec<LogEntry>,
    active: bool,
    directory: Option<PathBuf>,
    context: Option<LogContext>,
    capacitance_per_unit_area: Option<f64>,
}

impl DataLogger {
    pub fn new() -> Self {
        DataLogger::default()
    }

    /// Begin collecting for a run. A preview run deactivates the logger.
    pub fn start(&mut self, directory: PathBuf, preview_mode: bool) {
        if preview_mode {
            debug!("preview mode: data logging disabled");
            self.active = false;
            return;
        }
        self.entries.clear();
        self.directory = Some(directory.clone());
        self.active = true;
        info!(directory = %directory.display(), "protocol data logging started");
    }

    pub fn stop(&mut self) {
        self.active = false;
    }

    pub fn set_context(&mut self, context: LogContext) {
        self.context = Some(context);
    }

    pub fn set_capacitance_per_unit_area(&mut self, value: Option<f64>) {
        self.capacitance_per_unit_area = value;
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Record one capacitance sample under the current context.
    ///
    /// Samples without parseable values or without context are skipped.
    pub fn log_sample(&mut self, signal: &CapacitanceSignal) {
        if !self.active {
            return;
        }
        let Some(context) = &self.context else {
            debug!("no protocol context, skipping log entry");
            return;
        };
        let (Some(_), Some(volts)) = (signal.picofarads(), signal.volts()) else {
            debug!(capacitance = %signal.capacitance, voltage = %signal.voltage, "unparseable sample, skipping");
            return;
        };

        let force = self
            .capacitance_per_unit_area
            .and_then(|ca| calibration::force_per_unit_area(volts, ca));

        self.entries.push(LogEntry {
            timestamp: chrono::Local::now()
                .format("%Y-%m-%d %H:%M:%S%.3f")
                .to_string(),
            capacitance: signal.capacitance.clone(),
            voltage: signal.voltage.clone(),
            force_per_unit_area: force,
            step_id: context.step_id.clone(),
            actuated_channels: context.actuated_channels.clone(),
            actuated_area: context.actuated_area,
        });
    }

    /// Flush the collected entries to `data.json`; returns the path, or
    /// `None` when there is nothing to save.
    pub fn save(&mut self) -> Result<Option<PathBuf>, LogError> {
        let Some(directory) = &self.directory else {
            return Ok(None);
        };
        if self.entries.is_empty() {
            return Ok(None);
        }
        let path = directory.join("data.json");
        let json = serde_json::to_string_pretty(&self.entries)
            .expect("log entries serialize infallibly");
        std::fs::write(&path, json).map_err(|source| LogError::Write {
            path: path.display().to_string(),
            source,
        })?;
        info!(entries = self.entries.len(), path = %path.display(), "data log saved");
        Ok(Some(path))
    }
}

impl Drop for DataLogger {
    fn drop(&mut self) {
        if self.active && !self.entries.is_empty() {
            if let Err(err) = self.save() {
                warn!(%err, "failed to flush data log on drop");
            }
        }
    }
}

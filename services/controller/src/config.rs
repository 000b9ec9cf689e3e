//! Controller configuration loading.
//!
//! TOML is the sole config source. Every field has a default matching the
//! DB3-120 deployment, so a missing file or empty table still yields a
//! usable config.
//!
//! ```toml
//! schema_version = 1
//!
//! [hardware]
//! hwids = ["VID:PID=16C0:0483"]
//! expected_channels = 120
//!
//! [monitor]
//! probe_interval_ms = 2000
//!
//! [recovery]
//! max_corruption_retries = 3
//! ```

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Hardware id filter for the stock DB3-120 board.
pub const DEFAULT_HWID: &str = "VID:PID=16C0:0483";

// ---------------------------------------------------------------------------
// Validated config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub schema_version: u32,
    /// Substrings matched against enumerated port hardware ids.
    pub hwids: Vec<String>,
    pub expected_channels: u32,
    /// Period of the port discovery probe.
    pub probe_interval: Duration,
    /// Switching-board initialization attempts on connect.
    pub connect_retries: u32,
    pub connect_retry_delay: Duration,
    /// Minimum spacing between proxy state validations.
    pub validation_interval: Duration,
    pub max_corruption_retries: u32,
    /// Port settle time before a full reconnect.
    pub reconnect_settle: Duration,
    /// Droplet detection: measurement frequency and retry policy.
    pub detection_frequency_hz: f64,
    pub detection_retries: u32,
    pub detection_retry_delay: Duration,
    pub detection_timeout: Duration,
    /// Debounce window for chip-check requests.
    pub chip_check_debounce: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            schema_version: 1,
            hwids: vec![DEFAULT_HWID.to_owned()],
            expected_channels: 120,
            probe_interval: Duration::from_secs(2),
            connect_retries: 3,
            connect_retry_delay: Duration::from_millis(500),
            validation_interval: Duration::from_secs(2),
            max_corruption_retries: 3,
            reconnect_settle: Duration::from_millis(500),
            detection_frequency_hz: 1_000.0,
            detection_retries: 2,
            detection_retry_delay: Duration::from_secs(1),
            detection_timeout: Duration::from_secs(5),
            chip_check_debounce: Duration::from_secs(1),
        }
    }
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    hardware: Option<RawHardware>,
    monitor: Option<RawMonitor>,
    recovery: Option<RawRecovery>,
    detection: Option<RawDetection>,
}

#[derive(Debug, Default, Deserialize)]
struct RawHardware {
    hwids: Option<Vec<String>>,
    expected_channels: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct RawMonitor {
    probe_interval_ms: Option<u64>,
    connect_retries: Option<u32>,
    connect_retry_delay_ms: Option<u64>,
    chip_check_debounce_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawRecovery {
    validation_interval_ms: Option<u64>,
    max_corruption_retries: Option<u32>,
    reconnect_settle_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawDetection {
    frequency_hz: Option<f64>,
    retries: Option<u32>,
    retry_delay_ms: Option<u64>,
    timeout_ms: Option<u64>,
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("parse {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("unsupported schema_version {0} (expected 1)")]
    SchemaVersion(u32),
    #[error("hardware.hwids must not be empty")]
    EmptyHwids,
    #[error("hardware.expected_channels must be positive")]
    ZeroChannels,
}

impl ControllerConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let raw: RawConfig = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        Self::validate(raw)
    }

    fn validate(raw: RawConfig) -> Result<Self, ConfigError> {
        let defaults = ControllerConfig::default();

        let schema_version = raw.schema_version.unwrap_or(1);
        if schema_version != 1 {
            return Err(ConfigError::SchemaVersion(schema_version));
        }

        let hardware = raw.hardware.unwrap_or_default();
        let monitor = raw.monitor.unwrap_or_default();
        let recovery = raw.recovery.unwrap_or_default();
        let detection = raw.detection.unwrap_or_default();

        let hwids = hardware.hwids.unwrap_or(defaults.hwids);
        if hwids.is_empty() {
            return Err(ConfigError::EmptyHwids);
        }
        let expected_channels = hardware.expected_channels.unwrap_or(defaults.expected_channels);
        if expected_channels == 0 {
            return Err(ConfigError::ZeroChannels);
        }

        let ms = Duration::from_millis;
        Ok(ControllerConfig {
            schema_version,
            hwids,
            expected_channels,
            probe_interval: monitor
                .probe_interval_ms
                .map_or(defaults.probe_interval, ms),
            connect_retries: monitor.connect_retries.unwrap_or(defaults.connect_retries),
            connect_retry_delay: monitor
                .connect_retry_delay_ms
                .map_or(defaults.connect_retry_delay, ms),
            chip_check_debounce: monitor
                .chip_check_debounce_ms
                .map_or(defaults.chip_check_debounce, ms),
            validation_interval: recovery
                .validation_interval_ms
                .map_or(defaults.validation_interval, ms),
            max_corruption_retries: recovery
                .max_corruption_retries
                .unwrap_or(defaults.max_corruption_retries),
            reconnect_settle: recovery
                .reconnect_settle_ms
                .map_or(defaults.reconnect_settle, ms),
            detection_frequency_hz: detection
                .frequency_hz
                .unwrap_or(defaults.detection_frequency_hz),
            detection_retries: detection.retries.unwrap_or(defaults.detection_retries),
            detection_retry_delay: detection
                .retry_delay_ms
                .map_or(defaults.detection_retry_delay, ms),
            detection_timeout: detection.timeout_ms.map_or(defaults.detection_timeout, ms),
        })
    }
}

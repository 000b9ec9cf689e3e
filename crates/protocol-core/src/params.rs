//! Step and group parameter keys, defaults, and tolerant parsing.
//!
//! Parameters live as string maps so the grid, the flat file, and the wire
//! all share one representation. Parsing never fails: out-of-shape values
//! fall back to the documented default for the key.

pub const DESCRIPTION: &str = "Description";
pub const ID: &str = "ID";
pub const UID: &str = "UID";
pub const REPETITIONS: &str = "Repetitions";
pub const DURATION: &str = "Duration";
pub const VOLTAGE: &str = "Voltage";
pub const FREQUENCY: &str = "Frequency";
pub const TRAIL_LENGTH: &str = "Trail Length";
pub const TRAIL_OVERLAY: &str = "Trail Overlay";
pub const REPEAT_DURATION: &str = "Repeat Duration";
pub const VOLUME_THRESHOLD: &str = "Volume Threshold";
pub const MESSAGE: &str = "Message";
pub const VIDEO: &str = "Video";
pub const MAGNET: &str = "Magnet";

pub const DEFAULT_DESCRIPTION: &str = "Step";
pub const DEFAULT_REPETITIONS: u32 = 1;
pub const DEFAULT_DURATION: f64 = 1.0;
pub const DEFAULT_VOLTAGE: f64 = 100.0;
pub const DEFAULT_FREQUENCY: f64 = 10_000.0;
pub const DEFAULT_TRAIL_LENGTH: usize = 1;
pub const DEFAULT_TRAIL_OVERLAY: usize = 0;

/// Grid column order, also the `fields` array of the flat protocol file.
pub fn protocol_fields() -> Vec<String> {
    [
        DESCRIPTION,
        ID,
        REPETITIONS,
        DURATION,
        VOLTAGE,
        FREQUENCY,
        MESSAGE,
        REPEAT_DURATION,
        TRAIL_LENGTH,
        TRAIL_OVERLAY,
        VIDEO,
        MAGNET,
        VOLUME_THRESHOLD,
    ]
    .into_iter()
    .map(str::to_owned)
    .collect()
}

/// Parse a positive float, else the default.
pub fn parse_duration(raw: Option<&str>) -> f64 {
    raw.and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| *v > 0.0)
        .unwrap_or(DEFAULT_DURATION)
}

/// Parse a repetition count of at least one, else the default.
pub fn parse_repetitions(raw: Option<&str>) -> u32 {
    raw.and_then(|v| v.trim().parse::<u32>().ok())
        .filter(|v| *v >= 1)
        .unwrap_or(DEFAULT_REPETITIONS)
}

/// Parse a trail length of at least one, else the default.
pub fn parse_trail_length(raw: Option<&str>) -> usize {
    raw.and_then(|v| v.trim().parse::<usize>().ok())
        .filter(|v| *v >= 1)
        .unwrap_or(DEFAULT_TRAIL_LENGTH)
}

/// Parse a trail overlay; the result is clamped to `[0, trail_length - 1]`.
pub fn parse_trail_overlay(raw: Option<&str>, trail_length: usize) -> usize {
    let overlay = raw
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(DEFAULT_TRAIL_OVERLAY);
    overlay.min(trail_length.saturating_sub(1))
}

/// Parse a non-negative repeat-duration floor in seconds, default zero.
pub fn parse_repeat_duration(raw: Option<&str>) -> f64 {
    raw.and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| *v >= 0.0)
        .unwrap_or(0.0)
}

/// Parse a volume threshold in `[0, 1]`, default zero (disabled).
pub fn parse_volume_threshold(raw: Option<&str>) -> f64 {
    raw.and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| (0.0..=1.0).contains(v))
        .unwrap_or(0.0)
}

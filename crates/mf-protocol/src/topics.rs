//! Topic namespace and subscription pattern matching.
//!
//! Topics are `/`-separated hierarchies. The second segment distinguishes
//! `requests` (commands into a component) from `signals` (events out of a
//! component); the final segment names the operation and selects the
//! handler. Subscription patterns are literal topics with an optional
//! trailing `#` matching zero or more additional segments.

// ---------------------------------------------------------------------------
// Hardware controller topics
// ---------------------------------------------------------------------------

pub const START_DEVICE_MONITORING: &str = "dropbot/requests/start_device_monitoring";
pub const RETRY_CONNECTION: &str = "dropbot/requests/retry_connection";
pub const HALT: &str = "dropbot/requests/halt";
pub const SET_VOLTAGE: &str = "dropbot/requests/set_voltage";
pub const SET_FREQUENCY: &str = "dropbot/requests/set_frequency";
pub const SET_REALTIME_MODE: &str = "dropbot/requests/set_realtime_mode";
pub const ELECTRODES_STATE_CHANGE: &str = "dropbot/requests/electrodes_state_change";
pub const DETECT_DROPLETS: &str = "dropbot/requests/detect_droplets";
pub const DETECT_SHORTS: &str = "dropbot/requests/detect_shorts";
pub const CHIP_CHECK: &str = "dropbot/requests/chip_check";

pub const DROPBOT_CONNECTED: &str = "dropbot/signals/connected";
pub const DROPBOT_DISCONNECTED: &str = "dropbot/signals/disconnected";
pub const HALTED: &str = "dropbot/signals/halted";
pub const CHIP_INSERTED: &str = "dropbot/signals/chip_inserted";
pub const SHORTS_DETECTED: &str = "dropbot/signals/shorts_detected";
pub const CAPACITANCE_UPDATED: &str = "dropbot/signals/capacitance_updated";
pub const REALTIME_MODE_UPDATED: &str = "dropbot/signals/realtime_mode_updated";
pub const DROPLETS_DETECTED: &str = "dropbot/signals/drops_detected";
pub const SELF_TESTS_PROGRESS: &str = "dropbot/signals/self_tests_progress";
pub const NO_DROPBOT_AVAILABLE: &str = "dropbot/signals/warnings/no_dropbot_available";
pub const NO_POWER: &str = "dropbot/signals/warnings/no_power";
pub const DROPBOT_ERROR: &str = "dropbot/error";

// ---------------------------------------------------------------------------
// Device viewer / protocol grid topics
// ---------------------------------------------------------------------------

pub const DEVICE_VIEWER_STATE_CHANGED: &str = "device_viewer/state_changed";
pub const PROTOCOL_GRID_DISPLAY_STATE: &str = "protocol_grid/display_state";

// ---------------------------------------------------------------------------
// Pattern matching
// ---------------------------------------------------------------------------

/// Match `topic` against a subscription `pattern`.
///
/// A pattern is a literal topic, optionally ending in a `#` segment that
/// matches zero or more further segments: `dropbot/requests/#` matches
/// `dropbot/requests/halt` and `dropbot/requests` itself, but not
/// `dropbot/signals/halted`.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let mut pat = pattern.split('/').peekable();
    let mut top = topic.split('/');

    loop {
        match (pat.next(), top.next()) {
            (Some("#"), _) => return true,
            (Some(p), Some(t)) => {
                if p != t {
                    return false;
                }
            }
            (Some(_), None) => {
                // Only a bare trailing `#` may outlive the topic.
                return false;
            }
            (None, Some(_)) => return false,
            (None, None) => return true,
        }
    }
}

/// The last segment of a topic -- the operation name.
pub fn specific_segment(topic: &str) -> &str {
    topic.rsplit('/').next().unwrap_or(topic)
}

/// The second segment of a topic (`requests` or `signals`), if present.
pub fn primary_segment(topic: &str) -> Option<&str> {
    topic.split('/').nth(1)
}

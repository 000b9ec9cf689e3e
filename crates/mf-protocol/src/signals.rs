//! Payload structs for hardware signal topics.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Capacitance updates
// ---------------------------------------------------------------------------

/// Payload of `dropbot/signals/capacitance_updated`.
///
/// Values are formatted strings with units -- the `pF` suffix is mandatory on
/// the wire (`{"capacitance": "12.3pF", "voltage": "105V"}`); a space before
/// the unit is tolerated on parse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacitanceSignal {
    pub capacitance: String,
    pub voltage: String,
}

impl CapacitanceSignal {
    pub fn format(picofarads: f64, volts: f64) -> Self {
        CapacitanceSignal {
            capacitance: format!("{picofarads:.4}pF"),
            voltage: format!("{volts:.3}V"),
        }
    }

    /// Numeric capacitance in pF, or `None` when the payload is malformed.
    pub fn picofarads(&self) -> Option<f64> {
        parse_unit_value(&self.capacitance, "pF")
    }

    /// Numeric voltage in V, or `None` when the payload is malformed.
    pub fn volts(&self) -> Option<f64> {
        parse_unit_value(&self.voltage, "V")
    }
}

fn parse_unit_value(raw: &str, unit: &str) -> Option<f64> {
    raw.strip_suffix(unit)
        .map(str::trim)
        .and_then(|v| v.parse().ok())
}

// ---------------------------------------------------------------------------
// Shorts
// ---------------------------------------------------------------------------

/// Payload of `dropbot/signals/shorts_detected`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShortsSignal {
    #[serde(rename = "Shorts_detected")]
    pub shorts_detected: Vec<u32>,
}

// ---------------------------------------------------------------------------
// Droplet detection
// ---------------------------------------------------------------------------

/// Payload of `dropbot/signals/drops_detected`, answering a
/// `detect_droplets` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DropletResponse {
    pub success: bool,
    pub detected_channels: Vec<u32>,
    pub error: Option<String>,
}

impl DropletResponse {
    pub fn ok(detected_channels: Vec<u32>) -> Self {
        DropletResponse {
            success: true,
            detected_channels,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        DropletResponse {
            success: false,
            detected_channels: Vec::new(),
            error: Some(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacitance_parses_with_and_without_space() {
        let sig = CapacitanceSignal {
            capacitance: "12.1pF".to_owned(),
            voltage: "105 V".to_owned(),
        };
        assert_eq!(sig.picofarads(), Some(12.1));
        assert_eq!(sig.volts(), Some(105.0));
    }

    #[test]
    fn capacitance_without_unit_is_rejected() {
        let sig = CapacitanceSignal {
            capacitance: "12.1".to_owned(),
            voltage: "bogus".to_owned(),
        };
        assert_eq!(sig.picofarads(), None);
        assert_eq!(sig.volts(), None);
    }

    #[test]
    fn shorts_wire_field_name() {
        let raw = r#"{"Shorts_detected":[3,11]}"#;
        let sig: ShortsSignal = serde_json::from_str(raw).unwrap();
        assert_eq!(sig.shorts_detected, vec![3, 11]);
        assert_eq!(serde_json::to_string(&sig).unwrap(), raw);
    }

    #[test]
    fn droplet_response_round_trip() {
        let resp = DropletResponse::ok(vec![3, 7]);
        let raw = serde_json::to_string(&resp).unwrap();
        assert_eq!(serde_json::from_str::<DropletResponse>(&raw).unwrap(), resp);
    }
}

//! Device viewer message model.
//!
//! A minimal projection of a protocol step's device state, carrying just
//! enough to render routes and electrode activations and to round-trip
//! edits back into the protocol:
//! - `channels_activated`: channel number -> actuated (individual
//!   activations only, never route members)
//! - `routes`: in-order `(electrode-id path, color)` pairs
//! - `id_to_channel`: electrode id -> hardware channel
//! - `step_info`: the owning step's UID and display label
//! - `editable`: whether the viewer may send edits back

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Identity of the step a viewer message belongs to.
///
/// `step_id` carries the step *UID* (stable across edits), not the
/// positional ID. Both fields are null in an empty/cleared message.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StepInfo {
    pub step_id: Option<String>,
    pub step_label: Option<String>,
    /// Set while the paused runner hands the electrode set to the operator
    /// for direct editing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub free_mode: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewerMessage {
    /// Channel number (as a string key) -> actuated.
    pub channels_activated: BTreeMap<String, bool>,
    /// `(route, color)` pairs; a route is an ordered list of electrode ids.
    pub routes: Vec<(Vec<String>, String)>,
    /// Electrode id -> hardware channel.
    pub id_to_channel: BTreeMap<String, u32>,
    #[serde(default)]
    pub step_info: StepInfo,
    #[serde(default)]
    pub editable: bool,
}

impl ViewerMessage {
    /// An empty message: nothing activated, no routes, no step identity.
    pub fn empty() -> Self {
        ViewerMessage {
            channels_activated: BTreeMap::new(),
            routes: Vec::new(),
            id_to_channel: BTreeMap::new(),
            step_info: StepInfo::default(),
            editable: false,
        }
    }

    /// Just the electrode-id part of each route.
    pub fn routes_with_ids(&self) -> Vec<Vec<String>> {
        self.routes.iter().map(|(route, _)| route.clone()).collect()
    }

    /// Routes with electrode ids mapped to channels; ids missing from the
    /// mapping are skipped.
    pub fn routes_with_channels(&self) -> Vec<Vec<u32>> {
        self.routes
            .iter()
            .map(|(route, _)| {
                route
                    .iter()
                    .filter_map(|eid| self.id_to_channel.get(eid).copied())
                    .collect()
            })
            .collect()
    }

    pub fn serialize(&self) -> String {
        serde_json::to_string(self).expect("viewer message serialization is infallible")
    }

    pub fn deserialize(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ViewerMessage {
        ViewerMessage {
            channels_activated: BTreeMap::from([("1".to_owned(), true), ("4".to_owned(), false)]),
            routes: vec![(
                vec!["a".to_owned(), "b".to_owned(), "c".to_owned()],
                "#ff0000".to_owned(),
            )],
            id_to_channel: BTreeMap::from([
                ("a".to_owned(), 1),
                ("b".to_owned(), 2),
                ("c".to_owned(), 3),
            ]),
            step_info: StepInfo {
                step_id: Some("uid-1".to_owned()),
                step_label: Some("Step, ID: 1".to_owned()),
                free_mode: None,
            },
            editable: true,
        }
    }

    #[test]
    fn round_trip() {
        let msg = sample();
        let back = ViewerMessage::deserialize(&msg.serialize()).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn routes_map_to_channels() {
        assert_eq!(sample().routes_with_channels(), vec![vec![1, 2, 3]]);
        assert_eq!(
            sample().routes_with_ids(),
            vec![vec!["a".to_owned(), "b".to_owned(), "c".to_owned()]]
        );
    }

    #[test]
    fn free_mode_is_omitted_when_unset() {
        let raw = sample().serialize();
        assert!(!raw.contains("free_mode"));
    }

    #[test]
    fn deserialize_accepts_missing_step_info_and_editable() {
        let raw = r#"{"channels_activated":{},"routes":[],"id_to_channel":{}}"#;
        let msg = ViewerMessage::deserialize(raw).unwrap();
        assert_eq!(msg.step_info.step_id, None);
        assert!(!msg.editable);
    }
}

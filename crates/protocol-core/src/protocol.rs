//! Protocol tree: steps, groups, and the editable protocol state.
//!
//! Steps carry their parameters as a string map (the grid's native
//! representation) plus a device state. Groups nest steps and subgroups.
//! A step's `UID` is its stable identity across edits and reorders; the
//! positional `ID` is re-derived after every structural change.

use crate::device_state::DeviceState;
use crate::params;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolStep {
    pub name: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    #[serde(default)]
    pub device_state: DeviceState,
}

impl ProtocolStep {
    pub fn new(name: impl Into<String>) -> Self {
        ProtocolStep {
            name: name.into(),
            parameters: BTreeMap::new(),
            device_state: DeviceState::default(),
        }
    }

    pub fn parameter(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).map(String::as_str)
    }

    pub fn set_parameter(&mut self, key: &str, value: impl Into<String>) {
        self.parameters.insert(key.to_owned(), value.into());
    }

    pub fn uid(&self) -> Option<&str> {
        self.parameter(params::UID).filter(|u| !u.is_empty())
    }

    /// Return the step's UID, minting one when absent.
    pub fn ensure_uid(&mut self) -> String {
        if let Some(uid) = self.uid() {
            return uid.to_owned();
        }
        let uid = Uuid::new_v4().to_string();
        self.set_parameter(params::UID, uid.clone());
        uid
    }

    pub fn id(&self) -> &str {
        self.parameter(params::ID).unwrap_or("")
    }

    pub fn description(&self) -> &str {
        self.parameter(params::DESCRIPTION)
            .filter(|d| !d.is_empty())
            .unwrap_or(params::DEFAULT_DESCRIPTION)
    }

    pub fn duration(&self) -> f64 {
        params::parse_duration(self.parameter(params::DURATION))
    }

    pub fn repetitions(&self) -> u32 {
        params::parse_repetitions(self.parameter(params::REPETITIONS))
    }

    pub fn trail_length(&self) -> usize {
        params::parse_trail_length(self.parameter(params::TRAIL_LENGTH))
    }

    pub fn trail_overlay(&self) -> usize {
        params::parse_trail_overlay(self.parameter(params::TRAIL_OVERLAY), self.trail_length())
    }

    pub fn repeat_duration(&self) -> f64 {
        params::parse_repeat_duration(self.parameter(params::REPEAT_DURATION))
    }

    pub fn volume_threshold(&self) -> f64 {
        params::parse_volume_threshold(self.parameter(params::VOLUME_THRESHOLD))
    }

    /// Operator prompt; `None` when empty or whitespace.
    pub fn message(&self) -> Option<&str> {
        self.parameter(params::MESSAGE)
            .map(str::trim)
            .filter(|m| !m.is_empty())
    }

    /// Display label used in viewer messages.
    pub fn step_label(&self) -> String {
        let description = self.description();
        if description == params::DEFAULT_DESCRIPTION {
            format!("Step, ID: {}", self.id())
        } else {
            format!("Step: {}, ID: {}", description, self.id())
        }
    }
}

// ---------------------------------------------------------------------------
// Group
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolGroup {
    pub name: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    #[serde(default)]
    pub elements: Vec<ProtocolElement>,
}

impl ProtocolGroup {
    pub fn new(name: impl Into<String>) -> Self {
        ProtocolGroup {
            name: name.into(),
            parameters: BTreeMap::new(),
            elements: Vec::new(),
        }
    }

    pub fn repetitions(&self) -> u32 {
        params::parse_repetitions(self.parameters.get(params::REPETITIONS).map(String::as_str))
    }
}

/// One entry of a protocol sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProtocolElement {
    Step(ProtocolStep),
    Group(ProtocolGroup),
}

impl ProtocolElement {
    pub fn as_step(&self) -> Option<&ProtocolStep> {
        match self {
            ProtocolElement::Step(step) => Some(step),
            ProtocolElement::Group(_) => None,
        }
    }

    pub fn as_group(&self) -> Option<&ProtocolGroup> {
        match self {
            ProtocolElement::Group(group) => Some(group),
            ProtocolElement::Step(_) => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Protocol state & undo
// ---------------------------------------------------------------------------

const UNDO_STACK_LIMIT: usize = 20;

type Snapshot = (Vec<ProtocolElement>, Vec<String>);

/// The whole editable protocol: the step/group sequence, the grid field
/// list, and bounded undo/redo history.
#[derive(Debug, Clone, Default)]
pub struct ProtocolState {
    pub sequence: Vec<ProtocolElement>,
    pub fields: Vec<String>,
    undo_stack: Vec<Snapshot>,
    redo_stack: Vec<Snapshot>,
}

impl ProtocolState {
    pub fn new() -> Self {
        ProtocolState {
            sequence: Vec::new(),
            fields: params::protocol_fields(),
            undo_stack: Vec::new(),
            redo_stack: Vec::new(),
        }
    }

    pub fn with_sequence(sequence: Vec<ProtocolElement>) -> Self {
        ProtocolState {
            sequence,
            ..ProtocolState::new()
        }
    }

    /// Capture the current `(sequence, fields)` for undo.
    ///
    /// Programmatic snapshots (internal rewrites) keep the redo stack; any
    /// user-driven edit clears it. The stack holds at most 20 snapshots.
    pub fn snapshot_for_undo(&mut self, programmatic: bool) {
        let snap = (self.sequence.clone(), self.fields.clone());
        self.undo_stack.push(snap);
        if self.undo_stack.len() > UNDO_STACK_LIMIT {
            let excess = self.undo_stack.len() - UNDO_STACK_LIMIT;
            self.undo_stack.drain(..excess);
        }
        if !programmatic {
            self.redo_stack.clear();
        }
    }

    pub fn undo(&mut self) {
        let Some(snapshot) = self.undo_stack.pop() else {
            return;
        };
        self.redo_stack.push((self.sequence.clone(), self.fields.clone()));
        self.sequence = snapshot.0;
        self.fields = snapshot.1;
    }

    pub fn redo(&mut self) {
        let Some(snapshot) = self.redo_stack.pop() else {
            return;
        };
        self.undo_stack.push((self.sequence.clone(), self.fields.clone()));
        self.sequence = snapshot.0;
        self.fields = snapshot.1;
    }

    pub fn undo_depth(&self) -> usize {
        self.undo_stack.len()
    }

    pub fn redo_depth(&self) -> usize {
        self.redo_stack.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(desc: &str) -> ProtocolElement {
        let mut s = ProtocolStep::new(desc);
        s.set_parameter(params::DESCRIPTION, desc);
        ProtocolElement::Step(s)
    }

    #[test]
    fn ensure_uid_is_stable() {
        let mut s = ProtocolStep::new("Step");
        let minted = s.ensure_uid();
        assert!(!minted.is_empty());
        assert_eq!(s.ensure_uid(), minted);
    }

    #[test]
    fn message_blank_is_none() {
        let mut s = ProtocolStep::new("Step");
        assert_eq!(s.message(), None);
        s.set_parameter(params::MESSAGE, "   ");
        assert_eq!(s.message(), None);
        s.set_parameter(params::MESSAGE, "Pipette 5 uL");
        assert_eq!(s.message(), Some("Pipette 5 uL"));
    }

    #[test]
    fn step_label_formats() {
        let mut s = ProtocolStep::new("Step");
        s.set_parameter(params::ID, "2");
        assert_eq!(s.step_label(), "Step, ID: 2");
        s.set_parameter(params::DESCRIPTION, "Mix");
        assert_eq!(s.step_label(), "Step: Mix, ID: 2");
    }

    #[test]
    fn undo_restores_previous_sequence() {
        let mut state = ProtocolState::new();
        state.sequence.push(step("one"));
        state.snapshot_for_undo(false);
        state.sequence.push(step("two"));

        state.undo();
        assert_eq!(state.sequence.len(), 1);
        state.redo();
        assert_eq!(state.sequence.len(), 2);
    }

    #[test]
    fn user_edit_clears_redo() {
        let mut state = ProtocolState::new();
        state.snapshot_for_undo(false);
        state.sequence.push(step("one"));
        state.undo();
        assert_eq!(state.redo_depth(), 1);

        state.snapshot_for_undo(false);
        assert_eq!(state.redo_depth(), 0);

        // Programmatic snapshots keep redo history.
        state.undo();
        state.snapshot_for_undo(true);
        assert_eq!(state.redo_depth(), 1);
    }

    #[test]
    fn undo_stack_is_capped_at_twenty() {
        let mut state = ProtocolState::new();
        for i in 0..30 {
            state.sequence.push(step(&format!("s{i}")));
            state.snapshot_for_undo(false);
        }
        assert_eq!(state.undo_depth(), 20);
    }

    #[test]
    fn element_serde_is_tagged() {
        let el = step("one");
        let raw = serde_json::to_string(&el).unwrap();
        assert!(raw.contains(r#""type":"step""#));
        let back: ProtocolElement = serde_json::from_str(&raw).unwrap();
        assert_eq!(back, el);
    }
}

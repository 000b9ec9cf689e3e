//! Flat protocol file: the on-disk JSON shape.
//!
//! The file carries two arrays, `steps` and `groups`, each entry holding an
//! `ID`. Tree containment is encoded in the ID prefixes with `_` as the
//! separator -- letters denote groups, digits denote steps, so `B_A_2` lives
//! inside subgroup `B_A` of group `B`. Step parameters are flattened into
//! the entry as strings; the device state is a nested object.

use crate::device_state::DeviceState;
use crate::params;
use crate::protocol::{ProtocolElement, ProtocolGroup, ProtocolState, ProtocolStep};
use crate::tree::{assign_uids, int_to_letters, reassign_ids};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// File shape
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlatStep {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(default)]
    pub device_state: DeviceState,
    /// Every other step parameter (Description, UID, numeric fields as
    /// strings).
    #[serde(flatten)]
    pub parameters: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlatGroup {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(flatten)]
    pub parameters: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlatProtocol {
    pub steps: Vec<FlatStep>,
    pub groups: Vec<FlatGroup>,
    pub fields: Vec<String>,
}

impl FlatProtocol {
    pub fn to_json_pretty(&self) -> String {
        serde_json::to_string_pretty(self).expect("flat protocol serialization is infallible")
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

// ---------------------------------------------------------------------------
// Export
// ---------------------------------------------------------------------------

/// Flatten `state` into the file shape, deriving fresh positional IDs.
pub fn to_flat_export(state: &ProtocolState) -> FlatProtocol {
    fn walk(elements: &[ProtocolElement], prefix: &str, steps: &mut Vec<FlatStep>, groups: &mut Vec<FlatGroup>) {
        let mut group_count = 0usize;
        let mut step_count = 0usize;
        for element in elements {
            match element {
                ProtocolElement::Group(group) => {
                    group_count += 1;
                    let id = join_id(prefix, &int_to_letters(group_count));
                    let mut parameters = group.parameters.clone();
                    parameters.remove(params::ID);
                    parameters
                        .entry(params::DESCRIPTION.to_owned())
                        .or_insert_with(|| group.name.clone());
                    groups.push(FlatGroup {
                        id: id.clone(),
                        parameters,
                    });
                    walk(&group.elements, &id, steps, groups);
                }
                ProtocolElement::Step(step) => {
                    step_count += 1;
                    let id = join_id(prefix, &step_count.to_string());
                    let mut parameters = step.parameters.clone();
                    parameters.remove(params::ID);
                    parameters
                        .entry(params::DESCRIPTION.to_owned())
                        .or_insert_with(|| step.name.clone());
                    steps.push(FlatStep {
                        id,
                        device_state: step.device_state.clone(),
                        parameters,
                    });
                }
            }
        }
    }

    let mut steps = Vec::new();
    let mut groups = Vec::new();
    walk(&state.sequence, "", &mut steps, &mut groups);
    FlatProtocol {
        steps,
        groups,
        fields: state.fields.clone(),
    }
}

fn join_id(prefix: &str, local: &str) -> String {
    if prefix.is_empty() {
        local.to_owned()
    } else {
        format!("{prefix}_{local}")
    }
}

// ---------------------------------------------------------------------------
// Import
// ---------------------------------------------------------------------------

fn parent_group_id(id: &str) -> Option<&str> {
    id.rfind('_').map(|pos| &id[..pos])
}

/// Rebuild the protocol tree from a flat file.
///
/// Steps attach to their parent group chain, creating groups on demand from
/// the `groups` metadata (a group referenced only by its children still
/// materialises, named after its ID). Top-level order follows first
/// appearance in the `steps` array; groups with no steps at all are
/// appended afterwards. Steps that carry a UID keep it; the rest are
/// minted fresh. Positional IDs are re-derived after the rebuild.
pub fn from_flat_export(flat: &FlatProtocol) -> ProtocolState {
    let groups_meta: BTreeMap<&str, &FlatGroup> =
        flat.groups.iter().map(|g| (g.id.as_str(), g)).collect();

    // Build every group object up front, chained to its parent.
    let mut group_objs: BTreeMap<String, ProtocolGroup> = BTreeMap::new();
    let ensure_group_chain = |id: &str, group_objs: &mut BTreeMap<String, ProtocolGroup>| {
        let mut chain: Vec<&str> = Vec::new();
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            chain.push(current);
            cursor = parent_group_id(current);
        }
        for gid in chain.into_iter().rev() {
            group_objs.entry(gid.to_owned()).or_insert_with(|| {
                let meta = groups_meta.get(gid);
                let name = meta
                    .and_then(|g| g.parameters.get(params::DESCRIPTION))
                    .cloned()
                    .unwrap_or_else(|| gid.to_owned());
                let mut group = ProtocolGroup::new(name);
                if let Some(meta) = meta {
                    group.parameters = meta.parameters.clone();
                }
                group.parameters.insert(params::ID.to_owned(), gid.to_owned());
                group
            });
        }
    };

    // Membership lists: group id -> ordered children (step index or group id).
    #[derive(Clone)]
    enum Child {
        Step(usize),
        Group(String),
    }
    let mut root_children: Vec<Child> = Vec::new();
    let mut group_children: BTreeMap<String, Vec<Child>> = BTreeMap::new();
    let mut attached_groups: std::collections::BTreeSet<String> = std::collections::BTreeSet::new();

    let attach_group_chain = |id: &str,
                                  root_children: &mut Vec<Child>,
                                  group_children: &mut BTreeMap<String, Vec<Child>>,
                                  attached: &mut std::collections::BTreeSet<String>| {
        let mut chain: Vec<&str> = Vec::new();
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            chain.push(current);
            cursor = parent_group_id(current);
        }
        for gid in chain.into_iter().rev() {
            if attached.insert(gid.to_owned()) {
                match parent_group_id(gid) {
                    Some(parent) => group_children
                        .entry(parent.to_owned())
                        .or_default()
                        .push(Child::Group(gid.to_owned())),
                    None => root_children.push(Child::Group(gid.to_owned())),
                }
            }
        }
    };

    for (index, step) in flat.steps.iter().enumerate() {
        match parent_group_id(&step.id) {
            Some(parent) => {
                ensure_group_chain(parent, &mut group_objs);
                attach_group_chain(
                    parent,
                    &mut root_children,
                    &mut group_children,
                    &mut attached_groups,
                );
                group_children
                    .entry(parent.to_owned())
                    .or_default()
                    .push(Child::Step(index));
            }
            None => root_children.push(Child::Step(index)),
        }
    }

    // Groups that never appeared through a step (possibly empty).
    for group in &flat.groups {
        ensure_group_chain(&group.id, &mut group_objs);
        attach_group_chain(
            &group.id,
            &mut root_children,
            &mut group_children,
            &mut attached_groups,
        );
    }

    fn build_step(flat_step: &FlatStep) -> ProtocolStep {
        let name = flat_step
            .parameters
            .get(params::DESCRIPTION)
            .cloned()
            .unwrap_or_else(|| params::DEFAULT_DESCRIPTION.to_owned());
        let mut step = ProtocolStep::new(name);
        step.parameters = flat_step.parameters.clone();
        step.set_parameter(params::ID, flat_step.id.clone());
        step.device_state = flat_step.device_state.clone();
        step.device_state.normalize_route_colors();
        step
    }

    fn build_children(
        children: &[Child],
        flat: &FlatProtocol,
        group_objs: &BTreeMap<String, ProtocolGroup>,
        group_children: &BTreeMap<String, Vec<Child>>,
    ) -> Vec<ProtocolElement> {
        children
            .iter()
            .map(|child| match child {
                Child::Step(index) => ProtocolElement::Step(build_step(&flat.steps[*index])),
                Child::Group(id) => {
                    let mut group = group_objs[id].clone();
                    group.elements = build_children(
                        group_children.get(id).map_or(&[][..], Vec::as_slice),
                        flat,
                        group_objs,
                        group_children,
                    );
                    ProtocolElement::Group(group)
                }
            })
            .collect()
    }

    let sequence = build_children(&root_children, flat, &group_objs, &group_children);

    let mut state = ProtocolState::with_sequence(sequence);
    state.fields = if flat.fields.is_empty() {
        params::protocol_fields()
    } else {
        flat.fields.clone()
    };
    assign_uids(&mut state);
    reassign_ids(&mut state);
    state
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(desc: &str, uid: &str) -> ProtocolStep {
        let mut s = ProtocolStep::new(desc);
        s.set_parameter(params::DESCRIPTION, desc);
        s.set_parameter(params::UID, uid);
        s.set_parameter(params::DURATION, "1.50");
        s
    }

    fn sample_state() -> ProtocolState {
        let mut inner = ProtocolGroup::new("inner");
        inner
            .parameters
            .insert(params::DESCRIPTION.to_owned(), "inner".to_owned());
        inner.elements = vec![ProtocolElement::Step(step("deep", "uid-deep"))];

        let mut outer = ProtocolGroup::new("outer");
        outer
            .parameters
            .insert(params::DESCRIPTION.to_owned(), "outer".to_owned());
        outer
            .parameters
            .insert(params::REPETITIONS.to_owned(), "2".to_owned());
        outer.elements = vec![
            ProtocolElement::Step(step("inside", "uid-inside")),
            ProtocolElement::Group(inner),
        ];

        let mut with_device = step("wet", "uid-wet");
        with_device.device_state = DeviceState {
            activated_electrodes: BTreeMap::from([("e05".to_owned(), true)]),
            paths: vec![vec!["e01".to_owned(), "e02".to_owned(), "e01".to_owned()]],
            route_colors: vec!["#00ff00".to_owned()],
            id_to_channel: BTreeMap::from([
                ("e01".to_owned(), 1),
                ("e02".to_owned(), 2),
                ("e05".to_owned(), 5),
            ]),
        };

        let mut state = ProtocolState::with_sequence(vec![
            ProtocolElement::Step(with_device),
            ProtocolElement::Group(outer),
            ProtocolElement::Step(step("tail", "uid-tail")),
        ]);
        reassign_ids(&mut state);
        state
    }

    #[test]
    fn export_encodes_containment_in_ids() {
        let flat = to_flat_export(&sample_state());
        let ids: Vec<&str> = flat.steps.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, ["1", "A_1", "A_A_1", "2"]);
        let gids: Vec<&str> = flat.groups.iter().map(|g| g.id.as_str()).collect();
        assert_eq!(gids, ["A", "A_A"]);
    }

    #[test]
    fn round_trip_preserves_tree_and_parameters() {
        let state = sample_state();
        let flat = to_flat_export(&state);
        let rebuilt = from_flat_export(&flat);

        assert_eq!(rebuilt.sequence, state.sequence);
        assert_eq!(rebuilt.fields, state.fields);
    }

    #[test]
    fn round_trip_survives_json() {
        let state = sample_state();
        let json = to_flat_export(&state).to_json_pretty();
        let flat = FlatProtocol::from_json(&json).unwrap();
        let rebuilt = from_flat_export(&flat);
        assert_eq!(rebuilt.sequence, state.sequence);
    }

    #[test]
    fn device_state_survives_round_trip() {
        let state = sample_state();
        let rebuilt = from_flat_export(&to_flat_export(&state));
        let original = state.sequence[0].as_step().unwrap();
        let back = rebuilt.sequence[0].as_step().unwrap();
        assert_eq!(back.device_state, original.device_state);
    }

    #[test]
    fn import_mints_uids_only_when_missing() {
        let flat = FlatProtocol {
            steps: vec![
                FlatStep {
                    id: "1".to_owned(),
                    device_state: DeviceState::default(),
                    parameters: BTreeMap::from([(params::UID.to_owned(), "keep-me".to_owned())]),
                },
                FlatStep {
                    id: "2".to_owned(),
                    device_state: DeviceState::default(),
                    parameters: BTreeMap::new(),
                },
            ],
            groups: vec![],
            fields: vec![],
        };
        let state = from_flat_export(&flat);
        assert_eq!(state.sequence[0].as_step().unwrap().uid(), Some("keep-me"));
        assert!(state.sequence[1].as_step().unwrap().uid().is_some());
    }

    #[test]
    fn group_without_steps_still_imports() {
        let flat = FlatProtocol {
            steps: vec![],
            groups: vec![FlatGroup {
                id: "A".to_owned(),
                parameters: BTreeMap::from([(params::DESCRIPTION.to_owned(), "empty".to_owned())]),
            }],
            fields: vec![],
        };
        let state = from_flat_export(&flat);
        assert_eq!(state.sequence.len(), 1);
        let group = state.sequence[0].as_group().unwrap();
        assert_eq!(group.name, "empty");
        assert!(group.elements.is_empty());
    }

    #[test]
    fn orphan_parent_ids_materialise_placeholder_groups() {
        let flat = FlatProtocol {
            steps: vec![FlatStep {
                id: "A_1".to_owned(),
                device_state: DeviceState::default(),
                parameters: BTreeMap::new(),
            }],
            groups: vec![],
            fields: vec![],
        };
        let state = from_flat_export(&flat);
        let group = state.sequence[0].as_group().unwrap();
        assert_eq!(group.elements.len(), 1);
    }
}

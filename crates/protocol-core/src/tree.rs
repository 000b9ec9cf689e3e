//! Tree operations over the protocol sequence: identity, numbering,
//! flattening into run order, group aggregates, and downward propagation.

use crate::device_state::DeviceState;
use crate::params;
use crate::plan;
use crate::protocol::{ProtocolElement, ProtocolGroup, ProtocolState, ProtocolStep};
use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// UIDs and positional IDs
// ---------------------------------------------------------------------------

/// Mint a UID for every step that lacks one.
pub fn assign_uids(state: &mut ProtocolState) {
    for_each_step_mut(&mut state.sequence, &mut |step| {
        step.ensure_uid();
    });
}

/// Spreadsheet-style letters for group numbering: 1 -> A, 2 -> B, 27 -> AA.
pub fn int_to_letters(mut n: usize) -> String {
    let mut out = String::new();
    while n > 0 {
        n -= 1;
        out.insert(0, (b'A' + (n % 26) as u8) as char);
        n /= 26;
    }
    out
}

/// Re-derive every positional ID depth-first.
///
/// Top-level steps count `1, 2, ...` and groups `A, B, ...`; children carry
/// their group's ID as a `_`-joined prefix, with fresh counters per level
/// (`B_A_2` is the second step of the first subgroup of the second
/// top-level group). UIDs are untouched.
pub fn reassign_ids(state: &mut ProtocolState) {
    fn assign(elements: &mut [ProtocolElement], prefix: &str) {
        let mut group_count = 0usize;
        let mut step_count = 0usize;
        for element in elements {
            match element {
                ProtocolElement::Group(group) => {
                    group_count += 1;
                    let id = join_id(prefix, &int_to_letters(group_count));
                    group.parameters.insert(params::ID.to_owned(), id.clone());
                    assign(&mut group.elements, &id);
                }
                ProtocolElement::Step(step) => {
                    step_count += 1;
                    let id = join_id(prefix, &step_count.to_string());
                    step.set_parameter(params::ID, id);
                }
            }
        }
    }
    assign(&mut state.sequence, "");
}

fn join_id(prefix: &str, local: &str) -> String {
    if prefix.is_empty() {
        local.to_owned()
    } else {
        format!("{prefix}_{local}")
    }
}

// ---------------------------------------------------------------------------
// Traversal helpers
// ---------------------------------------------------------------------------

pub fn for_each_step_mut(elements: &mut [ProtocolElement], f: &mut impl FnMut(&mut ProtocolStep)) {
    for element in elements {
        match element {
            ProtocolElement::Step(step) => f(step),
            ProtocolElement::Group(group) => for_each_step_mut(&mut group.elements, f),
        }
    }
}

pub fn for_each_step(elements: &[ProtocolElement], f: &mut impl FnMut(&ProtocolStep)) {
    for element in elements {
        match element {
            ProtocolElement::Step(step) => f(step),
            ProtocolElement::Group(group) => for_each_step(&group.elements, f),
        }
    }
}

/// Find a step by UID anywhere in the tree.
pub fn find_step_by_uid<'a>(elements: &'a [ProtocolElement], uid: &str) -> Option<&'a ProtocolStep> {
    for element in elements {
        match element {
            ProtocolElement::Step(step) => {
                if step.uid() == Some(uid) {
                    return Some(step);
                }
            }
            ProtocolElement::Group(group) => {
                if let Some(found) = find_step_by_uid(&group.elements, uid) {
                    return Some(found);
                }
            }
        }
    }
    None
}

pub fn find_step_by_uid_mut<'a>(
    elements: &'a mut [ProtocolElement],
    uid: &str,
) -> Option<&'a mut ProtocolStep> {
    for element in elements {
        match element {
            ProtocolElement::Step(step) => {
                if step.uid() == Some(uid) {
                    return Some(step);
                }
            }
            ProtocolElement::Group(group) => {
                if let Some(found) = find_step_by_uid_mut(&mut group.elements, uid) {
                    return Some(found);
                }
            }
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Run order
// ---------------------------------------------------------------------------

/// One executable entry of the flattened protocol.
#[derive(Debug, Clone, PartialEq)]
pub struct RunEntry {
    pub step: ProtocolStep,
    /// Child indices from the sequence root to the step.
    pub path: Vec<usize>,
    /// 1-based iteration of the nearest enclosing group (1/1 outside
    /// groups).
    pub rep_idx: u32,
    pub rep_total: u32,
}

/// Flatten the sequence into execution order, yielding each step of a group
/// once per `Repetitions` iteration of that group, recursively.
pub fn flatten_run_order(state: &ProtocolState) -> Vec<RunEntry> {
    fn walk(
        elements: &[ProtocolElement],
        path: &mut Vec<usize>,
        rep_idx: u32,
        rep_total: u32,
        out: &mut Vec<RunEntry>,
    ) {
        for (index, element) in elements.iter().enumerate() {
            path.push(index);
            match element {
                ProtocolElement::Step(step) => {
                    out.push(RunEntry {
                        step: step.clone(),
                        path: path.clone(),
                        rep_idx,
                        rep_total,
                    });
                }
                ProtocolElement::Group(group) => {
                    let total = group.repetitions();
                    for rep in 1..=total {
                        walk(&group.elements, path, rep, total, out);
                    }
                }
            }
            path.pop();
        }
    }

    let mut out = Vec::new();
    walk(&state.sequence, &mut Vec::new(), 1, 1, &mut out);
    out
}

/// Number of distinct steps in a run order (first-iteration entries).
pub fn unique_step_count(run_order: &[RunEntry]) -> usize {
    run_order.iter().filter(|e| e.rep_idx == 1).count()
}

// ---------------------------------------------------------------------------
// Group aggregates & propagation
// ---------------------------------------------------------------------------

/// Derived totals shown on a group row, summed over descendant steps only.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct GroupAggregates {
    pub repetitions: u64,
    pub duration: f64,
    pub run_time: f64,
}

pub fn group_aggregates(group: &ProtocolGroup) -> GroupAggregates {
    let mut totals = GroupAggregates::default();
    for_each_step(&group.elements, &mut |step| {
        totals.repetitions += u64::from(step.repetitions());
        totals.duration += step.duration();
        totals.run_time += plan::step_execution_time(step, &step.device_state);
    });
    totals
}

/// Set `key` to `value` on every descendant step of `group`.
///
/// Used for Voltage, Frequency and Trail Length, which cascade from group
/// rows to all contained steps, through subgroups.
pub fn propagate_parameter(group: &mut ProtocolGroup, key: &str, value: &str) {
    for_each_step_mut(&mut group.elements, &mut |step| {
        step.set_parameter(key, value);
    });
}

/// Force every step's `id_to_channel` to `mapping` (all steps of a protocol
/// share one chip layout).
pub fn propagate_id_to_channel(state: &mut ProtocolState, mapping: &BTreeMap<String, u32>) {
    for_each_step_mut(&mut state.sequence, &mut |step| {
        step.device_state.id_to_channel = mapping.clone();
    });
}

/// Clamp every step's Trail Overlay to `Trail Length - 1`.
pub fn clamp_trail_overlay(state: &mut ProtocolState) {
    for_each_step_mut(&mut state.sequence, &mut |step| {
        let trail_length = step.trail_length();
        let raw = step
            .parameter(params::TRAIL_OVERLAY)
            .and_then(|v| v.trim().parse::<usize>().ok());
        if let Some(overlay) = raw {
            let max = trail_length.saturating_sub(1);
            if overlay > max {
                step.set_parameter(params::TRAIL_OVERLAY, max.to_string());
            }
        }
    });
}

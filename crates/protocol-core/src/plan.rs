//! Path-execution planner.
//!
//! Expands one protocol step into an ordered list of phases. A phase is one
//! electrode-activation snapshot held for the step's `Duration`.
//!
//! Window mechanics, with `TL = Trail Length`, `TO = Trail Overlay`,
//! `stride = TL - TO`:
//! - Open path: slide a `TL`-wide window from position 0 at `stride`,
//!   stopping once a window contains the last electrode. A short tail
//!   window is re-aligned to end at the last electrode; if the aligned
//!   window duplicates its predecessor it is dropped instead.
//! - Loop path: the effective ring is the path without its duplicated tail
//!   electrode. Windows wrap around the ring and one cycle covers it once.
//!   The duplicate tail electrode never appears in any phase.
//! - `stride <= 0` degrades to one-electrode windows, one per position.
//!
//! Cross-path timing: loops cycle for all `Repetitions` and then emit one
//! extra "return phase" equal to their cycle's first window, parking the
//! droplet at the ring start for measurement. Open paths run exactly once
//! and then hold their final window static while loops keep cycling.
//! Individual electrode activations are on in every phase.

use crate::device_state::DeviceState;
use crate::params;
use crate::protocol::ProtocolStep;
use serde::Serialize;
use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// Plan types
// ---------------------------------------------------------------------------

/// One activation snapshot of a step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Phase {
    /// Seconds from step start.
    pub t_offset: f64,
    /// Seconds this phase is held.
    pub duration: f64,
    /// Electrode id -> active, the union of path windows and individual
    /// activations.
    pub activated: BTreeMap<String, bool>,
    pub step_uid: String,
    pub step_id: String,
    pub step_description: String,
}

/// The full ordered plan for one step.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ExecutionPlan {
    pub phases: Vec<Phase>,
}

impl ExecutionPlan {
    pub fn len(&self) -> usize {
        self.phases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }
}

/// Repetition bookkeeping used by the runner's status line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RepetitionInfo {
    /// Longest loop cycle across the step's routes (0 without loops).
    pub max_cycle_length: usize,
    /// `Repetitions` when the step has loops, 1 otherwise.
    pub effective_repetitions: u32,
}

impl RepetitionInfo {
    /// Map a phase index to its `(repetition, total)` pair, 1-based.
    pub fn repetition_for_phase(&self, phase_index: usize) -> (u32, u32) {
        if self.max_cycle_length == 0 || self.effective_repetitions <= 1 {
            return (1, 1);
        }
        let total = self.effective_repetitions;
        let last_rep_start = (total as usize - 1) * self.max_cycle_length;
        let rep = if phase_index < last_rep_start {
            (phase_index / self.max_cycle_length) as u32 + 1
        } else {
            total
        };
        (rep, total)
    }
}

// ---------------------------------------------------------------------------
// Window generation
// ---------------------------------------------------------------------------

/// Index windows for an open path of `path_len` electrodes.
pub fn open_path_windows(path_len: usize, trail_length: usize, trail_overlay: usize) -> Vec<Vec<usize>> {
    if path_len == 0 {
        return Vec::new();
    }
    let stride = trail_length as isize - trail_overlay as isize;
    if stride <= 0 {
        return (0..path_len).map(|i| vec![i]).collect();
    }
    let stride = stride as usize;

    let mut windows: Vec<Vec<usize>> = Vec::new();
    let mut position = 0;
    loop {
        let end = (position + trail_length).min(path_len);
        let window: Vec<usize> = (position..end).collect();
        let covers_last = window.last() == Some(&(path_len - 1));
        windows.push(window);
        if covers_last {
            break;
        }
        position += stride;
    }

    // Tail adjustment: align a short final window to end on the last
    // electrode, dropping it when the aligned window repeats its
    // predecessor. A path shorter than the trail keeps its single short
    // window.
    if let Some(last) = windows.last() {
        if last.len() < trail_length && path_len >= trail_length {
            let aligned: Vec<usize> = (path_len - trail_length..path_len).collect();
            let duplicate = windows.len() > 1 && windows[windows.len() - 2] == aligned;
            if duplicate {
                windows.pop();
            } else if let Some(slot) = windows.last_mut() {
                *slot = aligned;
            }
        }
    }
    windows
}

/// Index windows for one cycle of a loop route (`path` includes the
/// duplicated tail electrode). Indices address the effective ring
/// `path[..len-1]`.
pub fn loop_cycle_windows(path_len: usize, trail_length: usize, trail_overlay: usize) -> Vec<Vec<usize>> {
    let ring_len = path_len.saturating_sub(1);
    if ring_len == 0 {
        return Vec::new();
    }
    let stride = trail_length as isize - trail_overlay as isize;
    if stride <= 0 {
        return (0..ring_len).map(|i| vec![i]).collect();
    }
    let stride = stride as usize;

    let mut windows = Vec::new();
    let mut position = 0;
    while position < ring_len {
        let window: Vec<usize> = (0..trail_length).map(|i| (position + i) % ring_len).collect();
        windows.push(window);
        position += stride;
    }
    windows
}

fn path_windows(path: &[String], trail_length: usize, trail_overlay: usize) -> Vec<Vec<usize>> {
    if DeviceState::is_loop_path(path) {
        loop_cycle_windows(path.len(), trail_length, trail_overlay)
    } else {
        open_path_windows(path.len(), trail_length, trail_overlay)
    }
}

// ---------------------------------------------------------------------------
// Phase totals
// ---------------------------------------------------------------------------

struct PathCycles {
    max_loop_cycle: usize,
    max_open_len: usize,
}

fn survey_paths(paths: &[Vec<String>], trail_length: usize, trail_overlay: usize) -> PathCycles {
    let mut max_loop_cycle = 0;
    let mut max_open_len = 0;
    for path in paths {
        let len = path_windows(path, trail_length, trail_overlay).len();
        if DeviceState::is_loop_path(path) {
            max_loop_cycle = max_loop_cycle.max(len);
        } else {
            max_open_len = max_open_len.max(len);
        }
    }
    PathCycles {
        max_loop_cycle,
        max_open_len,
    }
}

/// Number of phases the planner emits for a step with `paths`.
///
/// Loops contribute `(R_eff - 1)·L + L + 1` phases (the `+1` is the return
/// phase); open paths contribute their window count once. The larger wins.
pub fn total_phase_count(
    paths: &[Vec<String>],
    repetitions: u32,
    trail_length: usize,
    trail_overlay: usize,
) -> usize {
    let cycles = survey_paths(paths, trail_length, trail_overlay);
    let effective_reps = if cycles.max_loop_cycle > 0 { repetitions.max(1) } else { 1 };
    let loop_total = if cycles.max_loop_cycle > 0 {
        (effective_reps as usize - 1) * cycles.max_loop_cycle + cycles.max_loop_cycle + 1
    } else {
        0
    };
    loop_total.max(cycles.max_open_len)
}

// ---------------------------------------------------------------------------
// Plan construction
// ---------------------------------------------------------------------------

/// Expand `step` into its ordered phase plan.
///
/// Deterministic: equal inputs produce an identical plan.
pub fn build_execution_plan(step: &ProtocolStep, device_state: &DeviceState) -> ExecutionPlan {
    let duration = step.duration();
    let repetitions = step.repetitions();
    let trail_length = step.trail_length();
    let trail_overlay = step.trail_overlay();

    let step_uid = step.uid().unwrap_or_default().to_owned();
    let step_id = step.id().to_owned();
    let step_description = step.description().to_owned();

    let make_phase = |index: usize, activated: BTreeMap<String, bool>| Phase {
        t_offset: index as f64 * duration,
        duration,
        activated,
        step_uid: step_uid.clone(),
        step_id: step_id.clone(),
        step_description: step_description.clone(),
    };

    let total = if device_state.has_paths() {
        total_phase_count(&device_state.paths, repetitions, trail_length, trail_overlay)
    } else {
        0
    };

    if total == 0 {
        // No paths (or only empty ones): a single phase of the individual
        // activations.
        return ExecutionPlan {
            phases: vec![make_phase(0, device_state.activated_electrodes.clone())],
        };
    }

    let cycles = survey_paths(&device_state.paths, trail_length, trail_overlay);
    let effective_reps = if cycles.max_loop_cycle > 0 { repetitions.max(1) } else { 1 };
    // Phases in which loops still cycle; everything after is the return
    // phase (or open-path tail time) where loops rest at their start.
    let loop_region = effective_reps as usize * cycles.max_loop_cycle;

    let per_path: Vec<(bool, Vec<Vec<usize>>)> = device_state
        .paths
        .iter()
        .map(|p| {
            (
                DeviceState::is_loop_path(p),
                path_windows(p, trail_length, trail_overlay),
            )
        })
        .collect();

    let mut phases = Vec::with_capacity(total);
    for phase_idx in 0..total {
        let mut activated = device_state.activated_electrodes.clone();

        for (path, (is_loop, windows)) in device_state.paths.iter().zip(&per_path) {
            if windows.is_empty() {
                continue;
            }
            let window = if *is_loop {
                if phase_idx < loop_region {
                    // Shorter loops restart their cycle inside each beat of
                    // the longest one.
                    let beat = phase_idx % cycles.max_loop_cycle;
                    &windows[beat % windows.len()]
                } else {
                    &windows[0]
                }
            } else {
                &windows[phase_idx.min(windows.len() - 1)]
            };

            let ring_len = if *is_loop { path.len() - 1 } else { path.len() };
            for &electrode_idx in window {
                if electrode_idx < ring_len {
                    activated.insert(path[electrode_idx].clone(), true);
                }
            }
        }

        phases.push(make_phase(phase_idx, activated));
    }

    ExecutionPlan { phases }
}

/// Total wall-clock seconds the plan for `step` runs, honouring the
/// `Repeat Duration` floor.
pub fn step_execution_time(step: &ProtocolStep, device_state: &DeviceState) -> f64 {
    device_state.calculated_duration(
        step.duration(),
        step.repetitions(),
        step.repeat_duration(),
        step.trail_length(),
        step.trail_overlay(),
    )
}

/// Repetition bookkeeping for `step` (status display).
pub fn repetition_info(step: &ProtocolStep, device_state: &DeviceState) -> RepetitionInfo {
    let cycles = survey_paths(
        &device_state.paths,
        step.trail_length(),
        step.trail_overlay(),
    );
    let effective_repetitions = if cycles.max_loop_cycle > 0 {
        step.repetitions().max(1)
    } else {
        1
    };
    RepetitionInfo {
        max_cycle_length: cycles.max_loop_cycle.max(cycles.max_open_len),
        effective_repetitions,
    }
}

/// Electrode ids active in the final window of each route: where droplets
/// should rest when the step completes.
pub fn final_window_electrodes(
    device_state: &DeviceState,
    trail_length: usize,
    trail_overlay: usize,
) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for path in &device_state.paths {
        let windows = path_windows(path, trail_length, trail_overlay);
        let Some(window) = (if DeviceState::is_loop_path(path) {
            // A loop ends where it started.
            windows.first()
        } else {
            windows.last()
        }) else {
            continue;
        };
        let ring_len = if DeviceState::is_loop_path(path) {
            path.len() - 1
        } else {
            path.len()
        };
        for &idx in window {
            if idx < ring_len && !out.contains(&path[idx]) {
                out.push(path[idx].clone());
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_windows_no_overlap() {
        assert_eq!(open_path_windows(4, 2, 0), vec![vec![0, 1], vec![2, 3]]);
    }

    #[test]
    fn open_windows_with_overlap_stop_at_last_electrode() {
        // Stride 2 over 5 electrodes: {0,1,2}, {2,3,4}.
        assert_eq!(open_path_windows(5, 3, 1), vec![vec![0, 1, 2], vec![2, 3, 4]]);
    }

    #[test]
    fn open_windows_align_short_tail() {
        // {0,1,2} then bare {3} -> aligned to {1,2,3}.
        assert_eq!(open_path_windows(4, 3, 0), vec![vec![0, 1, 2], vec![1, 2, 3]]);
    }

    #[test]
    fn open_windows_tail_alignment_cases() {
        // Path 6, TL=4, TO=1 (stride 3): {0,1,2,3}, {3,4,5} short ->
        // aligned {2,3,4,5}; distinct from its predecessor, kept.
        assert_eq!(
            open_path_windows(6, 4, 1),
            vec![vec![0, 1, 2, 3], vec![2, 3, 4, 5]]
        );
        // path 5, TL=4, TO=3 (stride 1): {0,1,2,3}, {1,2,3,4}; second covers
        // last at full width, no adjustment.
        assert_eq!(
            open_path_windows(5, 4, 3),
            vec![vec![0, 1, 2, 3], vec![1, 2, 3, 4]]
        );
        // path 4, TL=3, TO=1 (stride 2): {0,1,2}, {2,3} short -> aligned
        // {1,2,3}, distinct from {0,1,2}.
        assert_eq!(open_path_windows(4, 3, 1), vec![vec![0, 1, 2], vec![1, 2, 3]]);
    }

    #[test]
    fn open_window_union_covers_whole_path() {
        for (len, tl, to) in [(7, 3, 1), (9, 4, 2), (5, 2, 0), (6, 1, 0), (8, 5, 4)] {
            let mut seen = vec![false; len];
            for w in open_path_windows(len, tl, to) {
                for i in w {
                    seen[i] = true;
                }
            }
            assert!(seen.iter().all(|s| *s), "uncovered electrode for len={len} tl={tl} to={to}");
        }
    }

    #[test]
    fn path_shorter_than_trail_keeps_single_window() {
        assert_eq!(open_path_windows(2, 4, 0), vec![vec![0, 1]]);
    }

    #[test]
    fn zero_stride_falls_back_to_single_electrode_windows() {
        assert_eq!(open_path_windows(3, 2, 2), vec![vec![0], vec![1], vec![2]]);
        assert_eq!(loop_cycle_windows(4, 1, 1), vec![vec![0], vec![1], vec![2]]);
    }

    #[test]
    fn loop_windows_wrap_and_cover_ring_once() {
        // Ring of 3 ({a,b,c} from [a,b,c,a]) with TL=2, stride 2:
        // {0,1}, {2,0}.
        assert_eq!(loop_cycle_windows(4, 2, 0), vec![vec![0, 1], vec![2, 0]]);
        // TL=1: one window per ring position.
        assert_eq!(loop_cycle_windows(4, 1, 0), vec![vec![0], vec![1], vec![2]]);
    }

    fn step_with(
        paths: Vec<Vec<String>>,
        activated: &[&str],
        reps: u32,
        duration: f64,
        tl: usize,
        to: usize,
    ) -> (ProtocolStep, DeviceState) {
        let mut step = ProtocolStep::new("Step");
        step.parameters
            .insert(crate::params::REPETITIONS.to_owned(), reps.to_string());
        step.parameters
            .insert(crate::params::DURATION.to_owned(), duration.to_string());
        step.parameters
            .insert(crate::params::TRAIL_LENGTH.to_owned(), tl.to_string());
        step.parameters
            .insert(crate::params::TRAIL_OVERLAY.to_owned(), to.to_string());
        let state = DeviceState {
            activated_electrodes: activated.iter().map(|e| ((*e).to_owned(), true)).collect(),
            paths,
            ..DeviceState::default()
        };
        step.device_state = state.clone();
        (step, state)
    }

    fn active_ids(phase: &Phase) -> Vec<&str> {
        phase
            .activated
            .iter()
            .filter(|(_, on)| **on)
            .map(|(id, _)| id.as_str())
            .collect()
    }

    #[test]
    fn plan_without_paths_is_one_phase_of_individual_electrodes() {
        let (step, state) = step_with(vec![], &["12"], 3, 2.0, 1, 0);
        let plan = build_execution_plan(&step, &state);
        assert_eq!(plan.len(), 1);
        assert_eq!(active_ids(&plan.phases[0]), vec!["12"]);
        assert_eq!(plan.phases[0].duration, 2.0);
    }

    #[test]
    fn plan_open_path_scenario() {
        // paths=[[a,b,c,d]], TL=2, TO=0, D=1.0, R=1 -> phases {a,b}, {c,d}.
        let path: Vec<String> = ["a", "b", "c", "d"].iter().map(|s| (*s).to_owned()).collect();
        let (step, state) = step_with(vec![path], &[], 1, 1.0, 2, 0);
        let plan = build_execution_plan(&step, &state);
        assert_eq!(plan.len(), 2);
        assert_eq!(active_ids(&plan.phases[0]), vec!["a", "b"]);
        assert_eq!(active_ids(&plan.phases[1]), vec!["c", "d"]);
        assert_eq!(step_execution_time(&step, &state), 2.0);
    }

    #[test]
    fn plan_open_path_overlap_scenario() {
        // paths=[[a..e]], TL=3, TO=1 -> {a,b,c}, {c,d,e}; 2 phases.
        let path: Vec<String> = ["a", "b", "c", "d", "e"].iter().map(|s| (*s).to_owned()).collect();
        let (step, state) = step_with(vec![path], &[], 1, 1.0, 3, 1);
        let plan = build_execution_plan(&step, &state);
        assert_eq!(plan.len(), 2);
        assert_eq!(active_ids(&plan.phases[0]), vec!["a", "b", "c"]);
        assert_eq!(active_ids(&plan.phases[1]), vec!["c", "d", "e"]);
    }

    #[test]
    fn plan_loop_with_repetitions_scenario() {
        // Ring {a,b,c}, TL=1, D=0.5, R=3 -> 10 phases ending on the return
        // phase at the ring start.
        let path: Vec<String> = ["a", "b", "c", "a"].iter().map(|s| (*s).to_owned()).collect();
        let (step, state) = step_with(vec![path], &[], 3, 0.5, 1, 0);
        let plan = build_execution_plan(&step, &state);
        assert_eq!(plan.len(), 10);
        let sequence: Vec<Vec<&str>> = plan.phases.iter().map(active_ids).collect();
        assert_eq!(
            sequence,
            vec![
                vec!["a"], vec!["b"], vec!["c"],
                vec!["a"], vec!["b"], vec!["c"],
                vec!["a"], vec!["b"], vec!["c"],
                vec!["a"],
            ]
        );
        assert_eq!(step_execution_time(&step, &state), 5.0);
    }

    #[test]
    fn loop_phases_never_contain_duplicate_tail() {
        let raw = ["a", "b", "c", "d", "a"];
        let path: Vec<String> = raw.iter().map(|s| (*s).to_owned()).collect();
        let (step, state) = step_with(vec![path.clone()], &[], 2, 1.0, 2, 1);
        let plan = build_execution_plan(&step, &state);
        // Union over one cycle covers the ring exactly.
        let windows = loop_cycle_windows(path.len(), 2, 1);
        let mut seen = vec![false; 4];
        for w in &windows {
            for &i in w {
                seen[i] = true;
            }
        }
        assert!(seen.iter().all(|s| *s));
        // Every emitted phase only names ring electrodes.
        for phase in &plan.phases {
            assert!(phase.activated.keys().all(|id| raw[..4].contains(&id.as_str())));
        }
    }

    #[test]
    fn open_path_holds_last_window_while_loop_cycles() {
        // Loop ring {a,b,c} (cycle 3) plus open path [x,y] (2 windows with
        // TL=1). R=2 -> loop region 6 phases + return = 7 total. The open
        // path advances twice then rests on "y".
        let lp: Vec<String> = ["a", "b", "c", "a"].iter().map(|s| (*s).to_owned()).collect();
        let op: Vec<String> = ["x", "y"].iter().map(|s| (*s).to_owned()).collect();
        let (step, state) = step_with(vec![lp, op], &[], 2, 1.0, 1, 0);
        let plan = build_execution_plan(&step, &state);
        assert_eq!(plan.len(), 7);
        assert_eq!(active_ids(&plan.phases[0]), vec!["a", "x"]);
        assert_eq!(active_ids(&plan.phases[1]), vec!["b", "y"]);
        for phase in &plan.phases[2..] {
            assert!(phase.activated.get("y").copied().unwrap_or(false));
            assert!(!phase.activated.contains_key("x") || !phase.activated["x"]);
        }
        // Return phase parks the loop at its start.
        assert_eq!(active_ids(&plan.phases[6]), vec!["a", "y"]);
    }

    #[test]
    fn individual_electrodes_are_active_in_every_phase() {
        let path: Vec<String> = ["a", "b", "c", "d"].iter().map(|s| (*s).to_owned()).collect();
        let (step, state) = step_with(vec![path], &["77"], 1, 1.0, 2, 0);
        let plan = build_execution_plan(&step, &state);
        for phase in &plan.phases {
            assert_eq!(phase.activated.get("77"), Some(&true));
        }
    }

    #[test]
    fn plan_is_deterministic() {
        let path: Vec<String> = ["a", "b", "c", "a"].iter().map(|s| (*s).to_owned()).collect();
        let (step, state) = step_with(vec![path], &["9"], 4, 0.25, 2, 1);
        let a = build_execution_plan(&step, &state);
        let b = build_execution_plan(&step, &state);
        assert_eq!(a, b);
        assert_eq!(
            serde_json::to_string(&a.phases).unwrap(),
            serde_json::to_string(&b.phases).unwrap()
        );
    }

    #[test]
    fn repetition_info_maps_phase_to_rep() {
        let path: Vec<String> = ["a", "b", "c", "a"].iter().map(|s| (*s).to_owned()).collect();
        let (step, state) = step_with(vec![path], &[], 3, 1.0, 1, 0);
        let info = repetition_info(&step, &state);
        assert_eq!(info.max_cycle_length, 3);
        assert_eq!(info.effective_repetitions, 3);
        assert_eq!(info.repetition_for_phase(0), (1, 3));
        assert_eq!(info.repetition_for_phase(3), (2, 3));
        assert_eq!(info.repetition_for_phase(9), (3, 3));
    }

    #[test]
    fn final_window_electrodes_rest_positions() {
        let lp: Vec<String> = ["a", "b", "c", "a"].iter().map(|s| (*s).to_owned()).collect();
        let op: Vec<String> = ["x", "y", "z"].iter().map(|s| (*s).to_owned()).collect();
        let state = DeviceState {
            paths: vec![lp, op],
            ..DeviceState::default()
        };
        let rest = final_window_electrodes(&state, 1, 0);
        assert_eq!(rest, vec!["a".to_owned(), "z".to_owned()]);
    }

}

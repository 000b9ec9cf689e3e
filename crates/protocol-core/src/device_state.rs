//! Per-step device state: individual electrode activations plus routed
//! droplet paths.

use crate::plan;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const DEFAULT_ROUTE_COLOR: &str = "#000000";

/// The electrode configuration a single protocol step drives.
///
/// `activated_electrodes` are individual (non-path) activations. `paths` are
/// ordered electrode-id routes; a route whose first and last ids coincide
/// (length ≥ 2) is a loop and is advanced repeatedly. `route_colors` runs
/// parallel to `paths` and is a presentation hint only. `id_to_channel`
/// maps electrode ids to hardware channel numbers and must be identical
/// across all steps of a protocol.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeviceState {
    #[serde(default)]
    pub activated_electrodes: BTreeMap<String, bool>,
    #[serde(default)]
    pub paths: Vec<Vec<String>>,
    #[serde(default)]
    pub route_colors: Vec<String>,
    #[serde(default)]
    pub id_to_channel: BTreeMap<String, u32>,
}

impl DeviceState {
    pub fn has_paths(&self) -> bool {
        !self.paths.is_empty()
    }

    pub fn has_individual_electrodes(&self) -> bool {
        self.activated_electrodes.values().any(|on| *on)
    }

    pub fn longest_path_length(&self) -> usize {
        self.paths.iter().map(Vec::len).max().unwrap_or(0)
    }

    /// Electrode ids whose individual activation is on.
    pub fn activated_electrode_ids(&self) -> Vec<String> {
        self.activated_electrodes
            .iter()
            .filter(|(_, on)| **on)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Pad or truncate `route_colors` to run parallel to `paths`.
    pub fn normalize_route_colors(&mut self) {
        self.route_colors.truncate(self.paths.len());
        while self.route_colors.len() < self.paths.len() {
            self.route_colors.push(DEFAULT_ROUTE_COLOR.to_owned());
        }
    }

    /// Color for the route at `index`, defaulting when the parallel list is
    /// short.
    pub fn route_color(&self, index: usize) -> &str {
        self.route_colors
            .get(index)
            .map_or(DEFAULT_ROUTE_COLOR, String::as_str)
    }

    /// True when `path` is a loop route (first == last, length ≥ 2).
    pub fn is_loop_path(path: &[String]) -> bool {
        path.len() >= 2 && path.first() == path.last()
    }

    pub fn has_any_loops(&self) -> bool {
        self.paths.iter().any(|p| Self::is_loop_path(p))
    }

    /// Total wall-clock seconds a step with this state runs for.
    ///
    /// Without paths this is `duration × repetitions`. With paths it is the
    /// planner's phase count times the phase duration, where loops honour
    /// `repetitions` (plus the trailing return phase) and open paths run
    /// once. The operator's `repeat_duration` floor wins when larger.
    pub fn calculated_duration(
        &self,
        step_duration: f64,
        repetitions: u32,
        repeat_duration: f64,
        trail_length: usize,
        trail_overlay: usize,
    ) -> f64 {
        let calculated = if !self.has_paths() {
            step_duration * f64::from(repetitions)
        } else {
            let total =
                plan::total_phase_count(&self.paths, repetitions, trail_length, trail_overlay);
            total as f64 * step_duration
        };
        calculated.max(repeat_duration)
    }
}

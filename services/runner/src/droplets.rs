//! Runner-side droplet verification.
//!
//! At the end of a step the runner can ask the hardware whether droplets
//! actually sit where the plan left them: on the individually activated
//! electrodes plus the final window of every route. The check is attempted
//! once per step -- a repeat only happens after phase navigation rearms it.

use mf_protocol::DropletResponse;
use protocol_core::plan;
use protocol_core::{DeviceState, ProtocolStep};
use std::collections::BTreeSet;

/// Channels where droplets are expected after `step` completes.
pub fn expected_droplet_channels(step: &ProtocolStep, device_state: &DeviceState) -> Vec<u32> {
    let mut channels: BTreeSet<u32> = BTreeSet::new();

    for (electrode_id, active) in &device_state.activated_electrodes {
        if *active {
            if let Some(channel) = device_state.id_to_channel.get(electrode_id) {
                channels.insert(*channel);
            }
        }
    }

    for electrode_id in
        plan::final_window_electrodes(device_state, step.trail_length(), step.trail_overlay())
    {
        if let Some(channel) = device_state.id_to_channel.get(&electrode_id) {
            channels.insert(*channel);
        }
    }

    channels.into_iter().collect()
}

/// Verdict from a detection response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropletCheckOutcome {
    /// Every expected channel holds a droplet.
    AllPresent,
    /// Some expected channels are dry.
    Missing {
        expected: Vec<u32>,
        detected: Vec<u32>,
        missing: Vec<u32>,
    },
    /// The detection itself failed; the run continues rather than blocking
    /// on broken instrumentation.
    DetectionFailed(String),
}

pub fn evaluate_response(expected: &[u32], response: &DropletResponse) -> DropletCheckOutcome {
    if !response.success {
        return DropletCheckOutcome::DetectionFailed(
            response
                .error
                .clone()
                .unwrap_or_else(|| "unknown detection error".to_owned()),
        );
    }
    let detected: BTreeSet<u32> = response.detected_channels.iter().copied().collect();
    let missing: Vec<u32> = expected
        .iter()
        .copied()
        .filter(|ch| !detected.contains(ch))
        .collect();
    if missing.is_empty() {
        DropletCheckOutcome::AllPresent
    } else {
        DropletCheckOutcome::Missing {
            expected: expected.to_vec(),
            detected: response.detected_channels.clone(),
            missing,
        }
    }
}

/// Per-step attempt memo: a step is checked once until phase navigation
/// re-enables it.
#[derive(Debug, Default)]
pub struct DropletCheckMemo {
    attempted: std::collections::HashMap<usize, bool>,
    skip_until_phase_nav: bool,
}

impl DropletCheckMemo {
    pub fn should_check(&self, step_index: usize) -> bool {
        if self.attempted.get(&step_index).copied().unwrap_or(false) {
            !self.skip_until_phase_nav
        } else {
            true
        }
    }

    pub fn mark_attempted(&mut self, step_index: usize) {
        self.attempted.insert(step_index, true);
    }

    /// Operator chose to stay paused; no re-check until navigation.
    pub fn skip_until_navigation(&mut self) {
        self.skip_until_phase_nav = true;
    }

    /// Phase navigation re-enables checking.
    pub fn navigation_occurred(&mut self) {
        self.skip_until_phase_nav = false;
    }

    pub fn reset(&mut self) {
        self.attempted.clear();
        self.skip_until_phase_nav = false;
    }
}

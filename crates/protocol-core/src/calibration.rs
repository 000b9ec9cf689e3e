//! Calibration data and the force estimates derived from it.
//!
//! Calibration captures two reference capacitance readings (chip covered by
//! liquid vs. filler medium) over a known set of electrodes. From those the
//! capacitance per unit area follows, and with it the actuation force for
//! any electrode set at a given voltage. All outputs are informational and
//! `None` whenever an input is missing or out of range.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Reference readings from the calibration routine.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CalibrationData {
    /// Total capacitance with liquid covering the calibration electrodes, pF.
    pub liquid_capacitance: Option<f64>,
    /// Total capacitance with filler medium only, pF.
    pub filler_capacitance: Option<f64>,
    /// Electrode id -> area in mm².
    #[serde(default)]
    pub electrode_areas: BTreeMap<String, f64>,
    /// Electrode ids that were active during calibration.
    #[serde(default)]
    pub active_electrodes: Vec<String>,
}

impl CalibrationData {
    /// True when both readings and the calibration electrode set are known.
    pub fn is_complete(&self) -> bool {
        self.liquid_capacitance.is_some()
            && self.filler_capacitance.is_some()
            && !self.active_electrodes.is_empty()
            && !self.electrode_areas.is_empty()
    }

    /// Capacitance per unit area from this calibration, pF/mm².
    pub fn capacitance_per_unit_area(&self) -> Option<f64> {
        capacitance_per_unit_area(
            self.liquid_capacitance?,
            self.filler_capacitance?,
            &self.active_electrodes,
            &self.electrode_areas,
        )
    }

    /// Summed area of the electrodes active in `activated`, mm².
    ///
    /// Electrodes with no recorded area contribute nothing.
    pub fn actuated_area(&self, activated: &BTreeMap<String, bool>) -> f64 {
        activated
            .iter()
            .filter(|(_, on)| **on)
            .filter_map(|(id, _)| self.electrode_areas.get(id))
            .sum()
    }
}

/// `C/A = (C_liquid − C_filler) / Σ area(active)`.
///
/// Defined only when `C_liquid > C_filler > 0`, every calibration electrode
/// has a known area, and the total area is positive.
pub fn capacitance_per_unit_area(
    liquid_capacitance: f64,
    filler_capacitance: f64,
    active_electrodes: &[String],
    electrode_areas: &BTreeMap<String, f64>,
) -> Option<f64> {
    if filler_capacitance <= 0.0 || liquid_capacitance <= filler_capacitance {
        return None;
    }
    if active_electrodes.is_empty() {
        return None;
    }

    let mut total_area = 0.0;
    for electrode_id in active_electrodes {
        total_area += electrode_areas.get(electrode_id)?;
    }
    if total_area <= 0.0 {
        return None;
    }

    Some((liquid_capacitance - filler_capacitance) / total_area)
}

/// Per-step actuation force estimate: `Σ (C/A) · area · V² / 2` over the
/// active electrodes with known areas.
pub fn force_for_step(
    voltage: f64,
    capacitance_per_unit_area: f64,
    activated_electrodes: &BTreeMap<String, bool>,
    electrode_areas: &BTreeMap<String, f64>,
) -> Option<f64> {
    if voltage <= 0.0 || capacitance_per_unit_area <= 0.0 {
        return None;
    }

    let mut total = 0.0;
    for (electrode_id, active) in activated_electrodes {
        if !active {
            continue;
        }
        if let Some(area) = electrode_areas.get(electrode_id) {
            total += capacitance_per_unit_area * area * voltage * voltage / 2.0;
        }
    }

    if total > 0.0 {
        Some(total)
    } else {
        None
    }
}

/// Force per unit area at `voltage`: `(C/A) · V² / 2`. Used by the data
/// logger alongside each capacitance sample.
pub fn force_per_unit_area(voltage: f64, capacitance_per_unit_area: f64) -> Option<f64> {
    if voltage <= 0.0 || capacitance_per_unit_area <= 0.0 {
        return None;
    }
    Some(0.5 * capacitance_per_unit_area * voltage * voltage)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn areas() -> BTreeMap<String, f64> {
        BTreeMap::from([
            ("a".to_owned(), 2.0),
            ("b".to_owned(), 2.0),
            ("c".to_owned(), 1.0),
        ])
    }

    fn calibration() -> CalibrationData {
        CalibrationData {
            liquid_capacitance: Some(10.0),
            filler_capacitance: Some(2.0),
            electrode_areas: areas(),
            active_electrodes: vec!["a".to_owned(), "b".to_owned()],
        }
    }

    #[test]
    fn c_per_area_from_reference_readings() {
        // (10 - 2) / (2 + 2) = 2 pF/mm^2
        assert_eq!(calibration().capacitance_per_unit_area(), Some(2.0));
    }

    #[test]
    fn c_per_area_undefined_without_contrast() {
        let mut cal = calibration();
        cal.liquid_capacitance = Some(2.0);
        assert_eq!(cal.capacitance_per_unit_area(), None);
        cal.liquid_capacitance = Some(10.0);
        cal.filler_capacitance = Some(0.0);
        assert_eq!(cal.capacitance_per_unit_area(), None);
    }

    #[test]
    fn c_per_area_undefined_when_an_area_is_unknown() {
        let mut cal = calibration();
        cal.active_electrodes.push("ghost".to_owned());
        assert_eq!(cal.capacitance_per_unit_area(), None);
    }

    #[test]
    fn force_sums_area_weighted_contributions() {
        let activated = BTreeMap::from([
            ("a".to_owned(), true),
            ("c".to_owned(), true),
            ("b".to_owned(), false),
        ]);
        // C/A = 2, V = 10: a contributes 2*2*100/2 = 200, c 2*1*100/2 = 100.
        let force = force_for_step(10.0, 2.0, &activated, &areas());
        assert_eq!(force, Some(300.0));
    }

    #[test]
    fn force_none_when_nothing_is_active() {
        let activated = BTreeMap::from([("a".to_owned(), false)]);
        assert_eq!(force_for_step(10.0, 2.0, &activated, &areas()), None);
        assert_eq!(force_for_step(0.0, 2.0, &activated, &areas()), None);
    }

    #[test]
    fn force_per_unit_area_formula() {
        assert_eq!(force_per_unit_area(10.0, 2.0), Some(100.0));
        assert_eq!(force_per_unit_area(-1.0, 2.0), None);
    }

    #[test]
    fn actuated_area_ignores_unknown_electrodes() {
        let activated = BTreeMap::from([
            ("a".to_owned(), true),
            ("ghost".to_owned(), true),
        ]);
        assert_eq!(calibration().actuated_area(&activated), 2.0);
    }
}

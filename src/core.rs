//! Core data types for the calibration module.
//!
//! These are the values that flow between the host collaborators and the
//! calibration steps: toolhead positions, per-round measurements and the
//! running accumulator that folds rounds into one calibrated offset.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::AveragingPolicy;

// =============================================================================
// Basic Data Types
// =============================================================================

/// Absolute machine coordinates of the toolhead.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    /// X in mm
    pub x: f64,
    /// Y in mm
    pub y: f64,
    /// Z in mm; the axis under calibration
    pub z: f64,
    /// Extruder position in mm
    pub e: f64,
}

impl Position {
    /// Create a position from its four coordinates.
    pub fn new(x: f64, y: f64, z: f64, e: f64) -> Self {
        Self { x, y, z, e }
    }

    /// Same position with a different XY.
    pub fn with_xy(self, x: f64, y: f64) -> Self {
        Self { x, y, ..self }
    }

    /// Same position with a different Z.
    pub fn with_z(self, z: f64) -> Self {
        Self { z, ..self }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "x={:.3} y={:.3} z={:.6} e={:.3}",
            self.x, self.y, self.z, self.e
        )
    }
}

/// Output of one zeroing-and-measurement round.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MeasurementRoundResult {
    /// Z correction implied by the bed sensor.
    pub bed_sensor_offset: f64,
    /// Nozzle probe trigger height after zeroing.
    pub probe_offset: f64,
    /// `bed_sensor_offset + probe_offset`
    pub derived_diff: f64,
}

impl MeasurementRoundResult {
    /// Combine the two sensor readings of one round.
    pub fn new(bed_sensor_offset: f64, probe_offset: f64) -> Self {
        Self {
            bed_sensor_offset,
            probe_offset,
            derived_diff: bed_sensor_offset + probe_offset,
        }
    }
}

/// Running sums over completed rounds.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RoundAccumulator {
    bed_sum: f64,
    probe_sum: f64,
    diff_sum: f64,
    rounds: u32,
}

impl RoundAccumulator {
    /// Add one round.
    pub fn push(&mut self, result: &MeasurementRoundResult) {
        self.bed_sum += result.bed_sensor_offset;
        self.probe_sum += result.probe_offset;
        self.diff_sum += result.derived_diff;
        self.rounds += 1;
    }

    /// Completed rounds so far.
    pub fn rounds(&self) -> u32 {
        self.rounds
    }

    /// Fold the rounds with `policy`; `None` before the first round.
    pub fn average(&self, policy: AveragingPolicy) -> Option<f64> {
        if self.rounds == 0 {
            return None;
        }
        let n = f64::from(self.rounds);
        let value = match policy {
            AveragingPolicy::Diff => self.diff_sum / n,
            AveragingPolicy::Component => (self.bed_sum + self.probe_sum) / (2.0 * n),
            AveragingPolicy::Probe => self.probe_sum / n,
        };
        Some(value)
    }
}

impl Extend<MeasurementRoundResult> for RoundAccumulator {
    fn extend<I: IntoIterator<Item = MeasurementRoundResult>>(&mut self, iter: I) {
        for result in iter {
            self.push(&result);
        }
    }
}

//! End-to-end calibration run.
//!
//! ```text
//! Idle -> Zeroing -> Probing -> RoundComplete -> (Zeroing | Averaging)
//!      -> Applying -> Persisting -> Idle
//! ```
//!
//! Any failure before the offset is applied returns to `Idle` with nothing
//! applied or persisted. A store failure after the offset was applied is
//! surfaced as `Persistence` and the live offset is kept.

use tracing::{info, warn};

use crate::calibration::probe::SessionFlag;
use crate::calibration::round::OffsetMeasurementRound;
use crate::calibration::{CalibrationState, StateTracker};
use crate::config::{AutoZConfig, AveragingPolicy, CalibrationSteps};
use crate::core::{MeasurementRoundResult, RoundAccumulator};
use crate::error::{AppResult, AutoZError};
use crate::gcode;
use crate::hardware::capabilities::Collaborators;

/// Config key the calibrated value is stored under.
pub const CALIBRATED_KEY: &str = "calibrated_z_offset";

/// Outcome of a successful calibration run.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationReport {
    /// Calibrated offset, a physical separation
    pub value: f64,
    /// Per-round components in run order
    pub rounds: Vec<MeasurementRoundResult>,
    /// Whether the value was written to the store
    pub persisted: bool,
    /// Tolerance warnings collected across all rounds
    pub warnings: Vec<String>,
}

/// Runs N measurement rounds and applies their average.
#[derive(Debug, Clone)]
pub struct CalibrationOrchestrator {
    round: OffsetMeasurementRound,
    rounds: u32,
    averaging: AveragingPolicy,
    steps: CalibrationSteps,
    section: String,
}

impl CalibrationOrchestrator {
    /// Orchestrator for the given module configuration.
    pub fn new(config: &AutoZConfig) -> Self {
        Self {
            round: OffsetMeasurementRound::new(config),
            rounds: config.offset_samples.max(1),
            averaging: config.averaging,
            steps: config.steps(),
            section: config.name.clone(),
        }
    }

    /// The round run `offset_samples` times.
    pub fn round(&self) -> &OffsetMeasurementRound {
        &self.round
    }

    /// Run the full calibration.
    ///
    /// # Errors
    ///
    /// - `SessionAlreadyActive` before anything moves
    /// - any round failure, with the live offset untouched
    /// - `Persistence` after the offset was applied
    pub async fn run(
        &self,
        hw: &Collaborators,
        session: &SessionFlag,
        state: &StateTracker,
    ) -> AppResult<CalibrationReport> {
        if session.is_pending() {
            return Err(AutoZError::SessionAlreadyActive);
        }
        let result = self.run_inner(hw, session, state).await;
        state.set(CalibrationState::Idle);
        result
    }

    async fn run_inner(
        &self,
        hw: &Collaborators,
        session: &SessionFlag,
        state: &StateTracker,
    ) -> AppResult<CalibrationReport> {
        let mut acc = RoundAccumulator::default();
        let mut rounds = Vec::new();
        let mut warnings = Vec::new();

        for index in 0..self.rounds {
            if index > 0 && self.steps.rehome_between_rounds {
                info!(round = index + 1, "re-homing Z between rounds");
                hw.motion.home_z().await?;
            }
            let report = self.round.run(hw, session, state).await?;
            info!(
                round = index + 1,
                of = self.rounds,
                bed_sensor_offset = report.result.bed_sensor_offset,
                probe_offset = report.result.probe_offset,
                derived_diff = report.result.derived_diff,
                "round complete"
            );
            acc.push(&report.result);
            rounds.push(report.result);
            warnings.extend(report.warnings);
        }

        state.set(CalibrationState::Averaging);
        let value = acc
            .average(self.averaging)
            .ok_or_else(|| AutoZError::Configuration("offset_samples must be >= 1".into()))?;
        info!(value, policy = ?self.averaging, "calibrated offset");

        state.set(CalibrationState::Applying);
        hw.gcode.run_script(&gcode::set_gcode_offset(-value)?).await?;

        let mut persisted = false;
        if self.steps.persist {
            state.set(CalibrationState::Persisting);
            persist(hw, &self.section, value)?;
            persisted = true;
        }

        Ok(CalibrationReport {
            value,
            rounds,
            persisted,
            warnings,
        })
    }
}

/// Write `value` under `calibrated_z_offset` of `section`.
///
/// # Errors
///
/// Any store failure, reported as `Persistence`.
pub fn persist(hw: &Collaborators, section: &str, value: f64) -> AppResult<()> {
    hw.store
        .set(section, CALIBRATED_KEY, &format!("{:.6}", value))
        .map_err(|err| {
            warn!(section, value, error = %err, "failed to persist calibrated offset");
            AutoZError::Persistence {
                key: CALIBRATED_KEY.to_string(),
                value,
                reason: err.to_string(),
            }
        })?;
    info!(section, key = CALIBRATED_KEY, value, "persisted calibrated offset");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::capabilities::ConfigStore;
    use crate::hardware::mock::{SimulatedPrinter, DEFAULT_PROBE_TRIGGER};
    use crate::storage::MemoryConfigStore;
    use std::sync::Arc;

    fn config(rounds: u32) -> AutoZConfig {
        AutoZConfig {
            offset_samples: rounds,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn applies_negated_value_and_persists() {
        let printer = SimulatedPrinter::new();
        let store = Arc::new(MemoryConfigStore::new());
        let hw = printer.collaborators(store.clone());
        let orchestrator = CalibrationOrchestrator::new(&config(3));
        let state = StateTracker::new();

        let report = orchestrator
            .run(&hw, &SessionFlag::default(), &state)
            .await
            .unwrap();

        assert_eq!(report.rounds.len(), 3);
        assert!((report.value - DEFAULT_PROBE_TRIGGER).abs() < 1e-9);
        assert!((printer.gcode_z_offset().await + DEFAULT_PROBE_TRIGGER).abs() < 1e-6);
        assert_eq!(
            store.get("auto_z_offset", CALIBRATED_KEY).unwrap().as_deref(),
            Some("1.250000")
        );
        assert_eq!(state.get(), CalibrationState::Idle);
    }

    #[tokio::test]
    async fn persistence_can_be_disabled() {
        let printer = SimulatedPrinter::new();
        let store = Arc::new(MemoryConfigStore::new());
        let hw = printer.collaborators(store.clone());
        let orchestrator = CalibrationOrchestrator::new(&AutoZConfig {
            persist: false,
            ..config(1)
        });

        let report = orchestrator
            .run(&hw, &SessionFlag::default(), &StateTracker::new())
            .await
            .unwrap();

        assert!(!report.persisted);
        assert_eq!(store.get("auto_z_offset", CALIBRATED_KEY).unwrap(), None);
    }

    #[tokio::test]
    async fn rehomes_between_rounds() {
        let printer = SimulatedPrinter::new();
        let hw = printer.collaborators(Arc::new(MemoryConfigStore::new()));
        let orchestrator = CalibrationOrchestrator::new(&AutoZConfig {
            rehome_between_rounds: true,
            ..config(3)
        });

        orchestrator
            .run(&hw, &SessionFlag::default(), &StateTracker::new())
            .await
            .unwrap();

        assert_eq!(printer.home_count().await, 2);
    }
}

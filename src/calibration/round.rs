//! One offset measurement round.
//!
//! Zero against the bed sensor at the reference point, move so that the
//! nozzle probe tip sits over that same point, probe, and combine the two
//! readings into a [`MeasurementRoundResult`].

use tracing::info;

use crate::calibration::probe::{ProbeOutcome, SessionFlag, SingleProbe};
use crate::calibration::zeroing::ReferenceZeroing;
use crate::calibration::{CalibrationState, StateTracker};
use crate::config::{AutoZConfig, CalibrationSteps};
use crate::core::MeasurementRoundResult;
use crate::error::AppResult;
use crate::hardware::capabilities::Collaborators;

/// Result of one round plus any tolerance warnings raised while probing.
#[derive(Debug, Clone, PartialEq)]
pub struct RoundReport {
    /// The three round components
    pub result: MeasurementRoundResult,
    /// One line per probing pass that was accepted outside tolerance
    pub warnings: Vec<String>,
}

/// Zero-then-probe measurement round.
#[derive(Debug, Clone, Copy)]
pub struct OffsetMeasurementRound {
    zeroing: ReferenceZeroing,
    probe: SingleProbe,
    steps: CalibrationSteps,
}

impl OffsetMeasurementRound {
    /// Round for the given module configuration.
    pub fn new(config: &AutoZConfig) -> Self {
        Self {
            zeroing: ReferenceZeroing::new(config),
            probe: SingleProbe::new(config.probe_parameters(), config.z_min)
                .with_tolerance_policy(config.tolerance_policy),
            steps: config.steps(),
        }
    }

    /// The zeroing step used at the start of each round.
    pub fn zeroing(&self) -> &ReferenceZeroing {
        &self.zeroing
    }

    /// Run one round.
    ///
    /// With zeroing disabled the current frame is trusted and
    /// `bed_sensor_offset` is reported as zero.
    pub async fn run(
        &self,
        hw: &Collaborators,
        session: &SessionFlag,
        state: &StateTracker,
    ) -> AppResult<RoundReport> {
        let mut warnings = Vec::new();

        state.set(CalibrationState::Zeroing);
        let bed_sensor_offset = if self.steps.zeroing {
            let measurement = self.zeroing.home(hw, session).await?;
            note_warning(&mut warnings, hw.bed_sensor.name(), &measurement.outcome);
            info!(
                offset = measurement.correction,
                "bed sensor measured offset"
            );
            measurement.correction
        } else {
            self.zeroing.move_to_reference(&*hw.motion).await?;
            0.0
        };

        state.set(CalibrationState::Probing);
        let (ref_x, ref_y) = self.zeroing.reference_xy();
        let (off_x, off_y) = if self.steps.xy_compensation {
            hw.probe.xy_offset()
        } else {
            (0.0, 0.0)
        };
        let current = hw.motion.position().await?;
        hw.motion
            .move_to(
                current.with_xy(ref_x - off_x, ref_y - off_y),
                self.zeroing.lift_speed(),
            )
            .await?;

        let outcome = self.probe.run(&*hw.probe, &*hw.motion, session).await?;
        note_warning(&mut warnings, hw.probe.name(), &outcome);
        info!(offset = outcome.z(), "probe measured offset");
        self.zeroing.lift(&*hw.motion).await?;

        let result = MeasurementRoundResult::new(bed_sensor_offset, outcome.z());
        state.set(CalibrationState::RoundComplete);
        Ok(RoundReport { result, warnings })
    }
}

fn note_warning(warnings: &mut Vec<String>, sensor: &str, outcome: &ProbeOutcome) {
    if let Some(spread) = outcome.tolerance_warning {
        warnings.push(format!(
            "{}: samples spread {:.6} exceeds tolerance, using z={:.6}",
            sensor,
            spread,
            outcome.z()
        ));
    }
}

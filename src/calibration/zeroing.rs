//! Reference zeroing against the bed sensor.
//!
//! The bed sensor acts as a temporary virtual Z endstop: the toolhead is
//! brought to the reference point, the sensor is probed, and the current Z is
//! rewritten so that the touch point reads as the configured `z_offset`.
//! Nothing here is persisted.

use tracing::{debug, info};

use crate::calibration::probe::{ProbeOutcome, SessionFlag, SingleProbe};
use crate::config::AutoZConfig;
use crate::core::Position;
use crate::error::AppResult;
use crate::hardware::capabilities::{Collaborators, MotionControl};

/// One bed sensor measurement at the reference point.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceMeasurement {
    /// Raw probing result
    pub outcome: ProbeOutcome,
    /// `-touch_z + z_offset`
    pub correction: f64,
}

/// Zeroes Z with the bed sensor at a fixed reference point.
#[derive(Debug, Clone, Copy)]
pub struct ReferenceZeroing {
    probe: SingleProbe,
    reference_xy: [f64; 2],
    probe_hop: f64,
    hop_threshold: f64,
    z_offset: f64,
}

impl ReferenceZeroing {
    /// Zeroing step for the given module configuration.
    pub fn new(config: &AutoZConfig) -> Self {
        Self {
            probe: SingleProbe::new(config.probe_parameters(), config.z_min)
                .with_tolerance_policy(config.tolerance_policy),
            reference_xy: config.reference_xy,
            probe_hop: config.probe_hop,
            hop_threshold: config.hop_threshold,
            z_offset: config.z_offset,
        }
    }

    /// Reference point XY.
    pub fn reference_xy(&self) -> (f64, f64) {
        (self.reference_xy[0], self.reference_xy[1])
    }

    /// Travel speed between probing points.
    pub fn lift_speed(&self) -> f64 {
        self.probe.params().lift_speed
    }

    /// Move to the reference XY, first raising Z to `probe_hop` when the
    /// nozzle is closer to the bed than the hop threshold.
    pub async fn move_to_reference(&self, motion: &dyn MotionControl) -> AppResult<Position> {
        let current = motion.position().await?;
        let mut target = current.with_xy(self.reference_xy[0], self.reference_xy[1]);
        if current.z < self.hop_threshold {
            target.z = self.probe_hop;
        }
        motion.move_to(target, self.lift_speed()).await?;
        Ok(target)
    }

    /// Raise Z by `probe_hop` from wherever the toolhead is.
    pub async fn lift(&self, motion: &dyn MotionControl) -> AppResult<()> {
        let current = motion.position().await?;
        motion
            .move_to(current.with_z(current.z + self.probe_hop), self.lift_speed())
            .await
    }

    /// Probe the bed sensor at the reference point and return the Z
    /// correction it implies. The coordinate frame is left unchanged.
    pub async fn probe(
        &self,
        hw: &Collaborators,
        session: &SessionFlag,
    ) -> AppResult<ReferenceMeasurement> {
        self.move_to_reference(&*hw.motion).await?;
        self.measure(hw, session).await
    }

    /// Zero Z at the reference point.
    ///
    /// After this call the toolhead reports the bed sensor touch point as
    /// `z_offset` and sits `probe_hop` above it.
    pub async fn home(
        &self,
        hw: &Collaborators,
        session: &SessionFlag,
    ) -> AppResult<ReferenceMeasurement> {
        self.move_to_reference(&*hw.motion).await?;
        self.lift(&*hw.motion).await?;
        let measurement = self.measure(hw, session).await?;

        let current = hw.motion.position().await?;
        let zeroed = current.with_z(current.z + measurement.correction);
        hw.motion.set_position(zeroed).await?;
        info!(
            correction = measurement.correction,
            z = zeroed.z,
            "Z zeroed against bed sensor"
        );

        self.lift(&*hw.motion).await?;
        Ok(measurement)
    }

    async fn measure(
        &self,
        hw: &Collaborators,
        session: &SessionFlag,
    ) -> AppResult<ReferenceMeasurement> {
        let outcome = self
            .probe
            .run(&*hw.bed_sensor, &*hw.motion, session)
            .await?;
        let correction = -outcome.z() + self.z_offset;
        debug!(touch = outcome.z(), correction, "bed sensor measurement");
        Ok(ReferenceMeasurement {
            outcome,
            correction,
        })
    }
}

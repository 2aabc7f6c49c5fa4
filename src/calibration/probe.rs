//! Single probing pass and the pending-session flag.
//!
//! A [`SingleProbe`] drives one probing pass at the toolhead's current XY:
//! open a sensor session, take `samples` contacts with a lift between them,
//! aggregate, close the session. Only one session may be pending at a time;
//! [`SessionFlag`] enforces that across every step sharing it.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::calibration::aggregate::{SampleAggregator, SampleSource};
use crate::config::{ProbeParameters, TolerancePolicy};
use crate::core::Position;
use crate::error::{AppResult, AutoZError};
use crate::hardware::capabilities::{MotionControl, ProbeEndstop};

/// Shared "probing session pending" flag.
#[derive(Debug, Clone, Default)]
pub struct SessionFlag(Arc<AtomicBool>);

impl SessionFlag {
    /// Whether a session is currently pending.
    pub fn is_pending(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Mark a session pending.
    ///
    /// # Errors
    ///
    /// `SessionAlreadyActive` if one already is; the flag is left untouched.
    pub fn try_begin(&self) -> AppResult<()> {
        self.0
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(|_| AutoZError::SessionAlreadyActive)
    }

    /// Clear the pending flag.
    pub fn end(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Outcome of one probing pass.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeOutcome {
    /// Trigger position with the aggregated Z
    pub position: Position,
    /// Accepted samples
    pub samples: Vec<f64>,
    /// Recollections performed
    pub retries: u32,
    /// Spread of the last set when it was accepted despite exceeding tolerance
    pub tolerance_warning: Option<f64>,
}

impl ProbeOutcome {
    /// Aggregated Z.
    pub fn z(&self) -> f64 {
        self.position.z
    }
}

/// Contacts one sensor straight down from the current XY.
struct ContactSampler<'a> {
    sensor: &'a dyn ProbeEndstop,
    motion: &'a dyn MotionControl,
    params: &'a ProbeParameters,
    z_min: f64,
    last: Position,
}

#[async_trait]
impl<'a> SampleSource for ContactSampler<'a> {
    async fn sample(&mut self) -> AppResult<f64> {
        let target = self.last.with_z(self.z_min);
        self.last = self.sensor.probe_once(target, self.params.speed).await?;
        debug!(sensor = self.sensor.name(), touch = %self.last, "probe triggered");
        Ok(self.last.z)
    }

    async fn retract(&mut self) -> AppResult<()> {
        let lift = self
            .last
            .with_z(self.last.z + self.params.sample_retract_distance);
        self.motion.move_to(lift, self.params.lift_speed).await?;
        self.last = lift;
        Ok(())
    }
}

/// One probing pass with a given sensor.
#[derive(Debug, Clone, Copy)]
pub struct SingleProbe {
    params: ProbeParameters,
    z_min: f64,
    tolerance_policy: TolerancePolicy,
}

impl SingleProbe {
    /// Probing pass that travels no lower than `z_min`.
    pub fn new(params: ProbeParameters, z_min: f64) -> Self {
        Self {
            params,
            z_min,
            tolerance_policy: TolerancePolicy::Abort,
        }
    }

    /// Accept non-converging sample sets with a warning instead of failing.
    pub fn with_tolerance_policy(mut self, policy: TolerancePolicy) -> Self {
        self.tolerance_policy = policy;
        self
    }

    /// Parameters used for every pass.
    pub fn params(&self) -> &ProbeParameters {
        &self.params
    }

    /// Probe with `sensor` at the current XY.
    ///
    /// # Errors
    ///
    /// - `SessionAlreadyActive` if `session` is pending; nothing moves
    /// - `ProbeTriggerFailure` from the sensor
    /// - `ToleranceExceeded` under the abort policy
    pub async fn run(
        &self,
        sensor: &dyn ProbeEndstop,
        motion: &dyn MotionControl,
        session: &SessionFlag,
    ) -> AppResult<ProbeOutcome> {
        session.try_begin()?;
        let result = self.run_session(sensor, motion).await;
        session.end();
        result
    }

    async fn run_session(
        &self,
        sensor: &dyn ProbeEndstop,
        motion: &dyn MotionControl,
    ) -> AppResult<ProbeOutcome> {
        sensor.begin_session().await?;
        let start = match motion.position().await {
            Ok(pos) => pos,
            Err(err) => {
                close_session(sensor).await;
                return Err(err);
            }
        };
        let mut sampler = ContactSampler {
            sensor,
            motion,
            params: &self.params,
            z_min: self.z_min,
            last: start,
        };
        let collected = SampleAggregator::new(&self.params)
            .collect(&mut sampler)
            .await;
        let last = sampler.last;

        let outcome = match collected {
            Ok(agg) => ProbeOutcome {
                position: last.with_z(agg.value),
                samples: agg.samples,
                retries: agg.retries,
                tolerance_warning: None,
            },
            Err(AutoZError::ToleranceExceeded {
                spread,
                value,
                retries,
                samples,
                ..
            }) if self.tolerance_policy == TolerancePolicy::Warn => {
                warn!(
                    sensor = sensor.name(),
                    spread,
                    tolerance = self.params.tolerance,
                    "Probe samples exceed tolerance; using best estimate"
                );
                ProbeOutcome {
                    position: last.with_z(value),
                    samples,
                    retries,
                    tolerance_warning: Some(spread),
                }
            }
            Err(err) => {
                close_session(sensor).await;
                return Err(err);
            }
        };

        sensor.end_session().await?;
        Ok(outcome)
    }
}

async fn close_session(sensor: &dyn ProbeEndstop) {
    if let Err(err) = sensor.end_session().await {
        warn!(sensor = sensor.name(), error = %err, "failed to end probing session");
    }
}

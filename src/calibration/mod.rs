//! The dual-sensor calibration protocol.
//!
//! Control flows top-down:
//!
//! ```text
//! CalibrationOrchestrator
//!   -> OffsetMeasurementRound (x offset_samples)
//!        -> ReferenceZeroing + SingleProbe
//!             -> SampleAggregator
//! ```
//!
//! Every step receives its collaborators explicitly and shares one
//! [`SessionFlag`] so that at most one probing session is pending at a time.
//! Progress is published through a [`StateTracker`].

pub mod aggregate;
pub mod orchestrator;
pub mod probe;
pub mod round;
pub mod zeroing;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

pub use aggregate::{AggregatedSample, SampleAggregator, SampleSource};
pub use orchestrator::{CalibrationOrchestrator, CalibrationReport};
pub use probe::{ProbeOutcome, SessionFlag, SingleProbe};
pub use round::{OffsetMeasurementRound, RoundReport};
pub use zeroing::{ReferenceMeasurement, ReferenceZeroing};

/// Where a calibration run currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationState {
    /// No command running
    #[default]
    Idle,
    /// Zeroing against the bed sensor
    Zeroing,
    /// Probing with the nozzle probe
    Probing,
    /// A round finished
    RoundComplete,
    /// Folding the rounds into one value
    Averaging,
    /// Applying the runtime offset
    Applying,
    /// Writing the calibrated value to the config store
    Persisting,
}

impl fmt::Display for CalibrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Zeroing => "zeroing",
            Self::Probing => "probing",
            Self::RoundComplete => "round_complete",
            Self::Averaging => "averaging",
            Self::Applying => "applying",
            Self::Persisting => "persisting",
        };
        f.write_str(name)
    }
}

/// Shared, observable calibration state.
#[derive(Debug, Clone)]
pub struct StateTracker {
    tx: Arc<watch::Sender<CalibrationState>>,
}

impl StateTracker {
    /// Tracker starting in [`CalibrationState::Idle`].
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(CalibrationState::Idle);
        Self { tx: Arc::new(tx) }
    }

    /// Move to `state`.
    pub fn set(&self, state: CalibrationState) {
        let previous = self.tx.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "calibration state");
        }
    }

    /// Current state.
    pub fn get(&self) -> CalibrationState {
        *self.tx.borrow()
    }

    /// Receiver notified on every transition.
    pub fn subscribe(&self) -> watch::Receiver<CalibrationState> {
        self.tx.subscribe()
    }
}

impl Default for StateTracker {
    fn default() -> Self {
        Self::new()
    }
}

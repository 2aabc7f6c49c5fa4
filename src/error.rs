//! Custom error types for the calibration module.
//!
//! This module defines the primary error type, `AutoZError`, shared by every
//! calibration step and every collaborator trait. Using the `thiserror` crate,
//! it gives one consistent way to report what went wrong, from a probe that
//! never triggered to an out-of-range configuration key.
//!
//! ## Error Hierarchy
//!
//! - **`ProbeTriggerFailure`**: a sensor never made contact within its travel
//!   limit. Fatal to the current round and to the calibration run.
//! - **`ToleranceExceeded`**: sample dispersion never converged within the
//!   retry budget. Carries the last spread and the best estimate so the caller
//!   can decide whether to proceed.
//! - **`SessionAlreadyActive`**: a probing session was requested while another
//!   one is still pending. Rejected before any state is touched.
//! - **`Configuration`** / **`Config`**: semantic validation failures and figment
//!   load failures, both raised at startup before commands are available.
//! - **`Motion`** / **`Gcode`**: failures reported by the host motion layer.
//! - **`Persistence`**: the durable store refused the calibrated value. The live
//!   offset has already been applied when this is returned.

use thiserror::Error;

/// Convenience alias for results using the module error type.
pub type AppResult<T> = std::result::Result<T, AutoZError>;

/// Error type for every calibration step and collaborator call.
#[derive(Error, Debug)]
pub enum AutoZError {
    #[error("{sensor}: probe never triggered ({reason})")]
    ProbeTriggerFailure { sensor: String, reason: String },

    #[error(
        "Probe samples exceed samples_tolerance: spread {spread:.6} > {tolerance:.6} after {retries} retries (best estimate z={value:.6})"
    )]
    ToleranceExceeded {
        spread: f64,
        tolerance: f64,
        value: f64,
        retries: u32,
        /// The last complete sample set
        samples: Vec<f64>,
    },

    #[error("A probing session is already active")]
    SessionAlreadyActive,

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("Motion error: {0}")]
    Motion(String),

    #[error("G-code error: {0}")]
    Gcode(String),

    #[error("Failed to persist {key}={value:.6}: {reason}")]
    Persistence {
        key: String,
        value: f64,
        reason: String,
    },

    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AutoZError {
    /// Whether this error aborts an in-progress calibration run.
    ///
    /// Persistence failures are reported after the live offset was applied, so
    /// they do not invalidate the run itself.
    pub fn is_session_fatal(&self) -> bool {
        !matches!(self, AutoZError::Persistence { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AutoZError::ProbeTriggerFailure {
            sensor: "bed_sensor".to_string(),
            reason: "no trigger before z_min".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "bed_sensor: probe never triggered (no trigger before z_min)"
        );
    }

    #[test]
    fn test_tolerance_error_carries_estimate() {
        let err = AutoZError::ToleranceExceeded {
            spread: 0.2,
            tolerance: 0.1,
            value: 10.083333,
            retries: 2,
            samples: vec![10.0, 10.05, 10.2],
        };
        let msg = err.to_string();
        assert!(msg.contains("spread 0.200000 > 0.100000"));
        assert!(msg.contains("after 2 retries"));
    }

    #[test]
    fn test_persistence_is_not_session_fatal() {
        let err = AutoZError::Persistence {
            key: "calibrated_z_offset".into(),
            value: 1.5,
            reason: "read-only".into(),
        };
        assert!(!err.is_session_fatal());
        assert!(AutoZError::SessionAlreadyActive.is_session_fatal());
    }
}

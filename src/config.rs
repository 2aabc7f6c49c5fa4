//! Configuration System using Figment
//!
//! Strongly-typed configuration for one `auto_z_offset` module instance.
//! Values are merged from, in increasing precedence:
//! 1. The printer configuration TOML, section named after the instance
//! 2. The autosave state TOML written by the config store (same section)
//! 3. Environment variables prefixed with `AUTO_Z_`
//!
//! ```toml
//! [auto_z_offset]
//! z_offset = -0.1
//! probe_hop = 5.0
//! offset_samples = 3
//! speed = 5.0
//! samples = 3
//! samples_result = "median"
//! samples_tolerance = 0.05
//! samples_tolerance_retries = 2
//! probe_accel = 50.0
//! ```
//!
//! # Environment Variable Overrides
//!
//! ```text
//! AUTO_Z_OFFSET_SAMPLES=5
//! AUTO_Z_SAMPLES_RESULT=median
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

use crate::error::{AppResult, AutoZError};

/// Default section name, also used as the persistence section.
pub const DEFAULT_SECTION: &str = "auto_z_offset";

/// Minimum clearance height accepted for `probe_hop`.
pub const MIN_PROBE_HOP: f64 = 4.0;

/// Statistic used to collapse a sample set into one value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationMethod {
    /// Arithmetic average.
    #[default]
    #[serde(rename = "average", alias = "mean")]
    Mean,
    /// Middle element of the ascending sort; lower-middle for even counts.
    Median,
}

impl fmt::Display for AggregationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mean => write!(f, "average"),
            Self::Median => write!(f, "median"),
        }
    }
}

/// How the per-round measurements are folded into the calibrated value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AveragingPolicy {
    /// Mean of `derived_diff` across rounds.
    #[default]
    Diff,
    /// `(Σ bed_sensor_offset + Σ probe_offset) / (2 × rounds)`.
    Component,
    /// Mean of `probe_offset` across rounds.
    Probe,
}

/// What to do when sample dispersion never converges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TolerancePolicy {
    /// Fail the probing pass with `ToleranceExceeded`.
    #[default]
    Abort,
    /// Log a warning and continue with the best estimate.
    Warn,
}

/// Per-probe motion and sampling parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeParameters {
    /// Probing speed in mm/s.
    pub speed: f64,
    /// Lift speed in mm/s.
    pub lift_speed: f64,
    /// Samples per probing pass.
    pub sample_count: u32,
    /// Lift between consecutive samples in mm.
    pub sample_retract_distance: f64,
    /// Statistic applied to a converged sample set.
    pub aggregation_method: AggregationMethod,
    /// Maximum allowed `max - min` over one sample set.
    pub tolerance: f64,
    /// Number of full recollections allowed when tolerance is exceeded.
    pub max_retries: u32,
}

impl Default for ProbeParameters {
    fn default() -> Self {
        Self {
            speed: default_speed(),
            lift_speed: default_speed(),
            sample_count: 1,
            sample_retract_distance: default_sample_retract_dist(),
            aggregation_method: AggregationMethod::Mean,
            tolerance: default_samples_tolerance(),
            max_retries: 0,
        }
    }
}

/// Which calibration steps a run performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalibrationSteps {
    /// Zero Z against the bed sensor at the start of each round.
    pub zeroing: bool,
    /// Shift the nozzle probe target by its XY offset.
    pub xy_compensation: bool,
    /// Home Z through the host between rounds.
    pub rehome_between_rounds: bool,
    /// Write the result to the config store.
    pub persist: bool,
}

impl Default for CalibrationSteps {
    fn default() -> Self {
        Self {
            zeroing: true,
            xy_compensation: true,
            rehome_between_rounds: false,
            persist: true,
        }
    }
}

/// Module configuration as read from the printer config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoZConfig {
    /// Instance name; section used for persistence.
    pub name: String,
    /// Static offset of the bed sensor trigger point.
    #[serde(alias = "endstop_position")]
    pub z_offset: f64,
    /// Clearance lift in mm.
    pub probe_hop: f64,
    /// Calibration rounds.
    pub offset_samples: u32,
    /// Probing speed in mm/s.
    pub speed: f64,
    /// Lift speed in mm/s; falls back to `speed`.
    pub lift_speed: Option<f64>,
    /// Samples per probing pass.
    pub samples: u32,
    /// Lift between consecutive samples in mm.
    pub sample_retract_dist: f64,
    /// `median` or `average`.
    pub samples_result: AggregationMethod,
    /// Maximum sample spread.
    pub samples_tolerance: f64,
    /// Recollections allowed when the spread is too large.
    pub samples_tolerance_retries: u32,
    /// Acceleration override while probing; 0 disables it.
    pub probe_accel: f64,
    /// Persisted calibration result.
    pub calibrated_z_offset: f64,
    /// Bed point used for zeroing and measurement.
    pub reference_xy: [f64; 2],
    /// Below this Z the toolhead lifts to `probe_hop` before travelling.
    pub hop_threshold: f64,
    /// Lowest Z a probing move travels to.
    pub z_min: f64,
    /// Script run before each probing session.
    pub prepare_gcode: Option<String>,
    /// Round averaging policy.
    pub averaging: AveragingPolicy,
    /// Reaction to non-converging samples.
    pub tolerance_policy: TolerancePolicy,
    /// Home Z between calibration rounds.
    pub rehome_between_rounds: bool,
    /// Zero against the bed sensor in each round.
    pub zeroing: bool,
    /// Apply the nozzle probe XY offset.
    pub xy_compensation: bool,
    /// Persist the calibrated value.
    pub persist: bool,
}

impl Default for AutoZConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_SECTION.to_string(),
            z_offset: -0.1,
            probe_hop: 5.0,
            offset_samples: 3,
            speed: default_speed(),
            lift_speed: None,
            samples: 1,
            sample_retract_dist: default_sample_retract_dist(),
            samples_result: AggregationMethod::Mean,
            samples_tolerance: default_samples_tolerance(),
            samples_tolerance_retries: 0,
            probe_accel: 0.0,
            calibrated_z_offset: 0.0,
            reference_xy: [120.0, 120.0],
            hop_threshold: 1.0,
            z_min: -2.0,
            prepare_gcode: None,
            averaging: AveragingPolicy::Diff,
            tolerance_policy: TolerancePolicy::Abort,
            rehome_between_rounds: false,
            zeroing: true,
            xy_compensation: true,
            persist: true,
        }
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_speed() -> f64 {
    5.0
}

fn default_sample_retract_dist() -> f64 {
    2.0
}

fn default_samples_tolerance() -> f64 {
    0.100
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl AutoZConfig {
    /// Load the `section` of a printer config file, with no autosave state.
    pub fn load_from<P: AsRef<Path>>(path: P, section: &str) -> AppResult<Self> {
        Self::extract(Self::figment(path.as_ref(), None, section), section)
    }

    /// Load the `section` of a printer config file and overlay the autosave
    /// state written by [`crate::storage::TomlConfigStore`].
    pub fn load_with_state<P: AsRef<Path>, S: AsRef<Path>>(
        path: P,
        state: S,
        section: &str,
    ) -> AppResult<Self> {
        Self::extract(Self::figment(path.as_ref(), Some(state.as_ref()), section), section)
    }

    fn figment(path: &Path, state: Option<&Path>, section: &str) -> Figment {
        let mut figment = Figment::new().merge(Toml::file(path).nested());
        if let Some(state) = state {
            figment = figment.merge(Toml::file(state).nested());
        }
        figment
            .merge(Env::prefixed("AUTO_Z_").profile(section))
            .select(section)
    }

    fn extract(figment: Figment, section: &str) -> AppResult<Self> {
        let mut config: Self = figment.extract()?;
        if config.name == DEFAULT_SECTION {
            config.name = section.to_string();
        }
        config.validate()?;
        Ok(config)
    }

    /// Check every bound before the module is assembled.
    ///
    /// # Errors
    ///
    /// Returns `AutoZError::Configuration` naming the first offending key.
    // Negated comparisons also reject NaN.
    #[allow(clippy::neg_cmp_op_on_partial_ord)]
    pub fn validate(&self) -> AppResult<()> {
        fn invalid(msg: String) -> AppResult<()> {
            Err(AutoZError::Configuration(msg))
        }

        if self.name.trim().is_empty() {
            return invalid("'name' cannot be empty".to_string());
        }
        if !(self.probe_hop >= MIN_PROBE_HOP) {
            return invalid(format!(
                "probe_hop {} must be >= {}",
                self.probe_hop, MIN_PROBE_HOP
            ));
        }
        if self.offset_samples < 1 {
            return invalid("offset_samples must be >= 1".to_string());
        }
        if !(self.speed > 0.0) {
            return invalid(format!("speed {} must be > 0", self.speed));
        }
        if let Some(lift_speed) = self.lift_speed {
            if !(lift_speed > 0.0) {
                return invalid(format!("lift_speed {} must be > 0", lift_speed));
            }
        }
        if self.samples < 1 {
            return invalid("samples must be >= 1".to_string());
        }
        if !(self.sample_retract_dist > 0.0) {
            return invalid(format!(
                "sample_retract_dist {} must be > 0",
                self.sample_retract_dist
            ));
        }
        if !(self.samples_tolerance >= 0.0) {
            return invalid(format!(
                "samples_tolerance {} must be >= 0",
                self.samples_tolerance
            ));
        }
        if !(self.probe_accel >= 0.0) {
            return invalid(format!("probe_accel {} must be >= 0", self.probe_accel));
        }
        if !(self.hop_threshold >= 0.0) {
            return invalid(format!(
                "hop_threshold {} must be >= 0",
                self.hop_threshold
            ));
        }
        if !self.calibrated_z_offset.is_finite() || !self.z_offset.is_finite() {
            return invalid("z_offset and calibrated_z_offset must be finite".to_string());
        }
        Ok(())
    }

    /// Sampling parameters shared by both sensors.
    pub fn probe_parameters(&self) -> ProbeParameters {
        ProbeParameters {
            speed: self.speed,
            lift_speed: self.lift_speed.unwrap_or(self.speed),
            sample_count: self.samples,
            sample_retract_distance: self.sample_retract_dist,
            aggregation_method: self.samples_result,
            tolerance: self.samples_tolerance,
            max_retries: self.samples_tolerance_retries,
        }
    }

    /// Step switches for the calibration run.
    pub fn steps(&self) -> CalibrationSteps {
        CalibrationSteps {
            zeroing: self.zeroing,
            xy_compensation: self.xy_compensation,
            rehome_between_rounds: self.rehome_between_rounds,
            persist: self.persist,
        }
    }
}

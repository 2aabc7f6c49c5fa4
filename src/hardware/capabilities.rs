//! Capability traits for the host collaborators.
//!
//! The calibration steps never look anything up by name. Each step receives
//! the specific capabilities it needs, established once when the module is
//! assembled:
//!
//! - [`MotionControl`] - toolhead position, moves, homing, coordinate rewrites
//! - [`ProbeEndstop`] - one probing session of a contact sensor
//! - [`GcodeHost`] - script execution and the active G-code Z offset
//! - [`ConfigStore`] - durable key/value configuration
//!
//! All physical operations are async and resolve when the host reports the
//! operation complete.

use async_trait::async_trait;
use std::sync::Arc;

use crate::core::Position;
use crate::error::AppResult;

/// Toolhead motion as seen by the calibration steps.
#[async_trait]
pub trait MotionControl: Send + Sync {
    /// Current commanded position.
    async fn position(&self) -> AppResult<Position>;

    /// Move to `target` at `speed` mm/s and wait for completion.
    async fn move_to(&self, target: Position, speed: f64) -> AppResult<()>;

    /// Redefine the current position without moving.
    ///
    /// After this call the toolhead reports `position` at its current
    /// physical location, and the Z axis is considered homed.
    async fn set_position(&self, position: Position) -> AppResult<()>;

    /// Run the host's standard Z homing routine.
    async fn home_z(&self) -> AppResult<()>;

    /// Currently configured maximum acceleration in mm/s².
    async fn max_accel(&self) -> AppResult<f64>;
}

/// A contact sensor usable as a probe or virtual endstop.
#[async_trait]
pub trait ProbeEndstop: Send + Sync {
    /// Human-readable sensor name for logs and errors.
    fn name(&self) -> &str;

    /// XY displacement of the sensor tip relative to the nozzle.
    fn xy_offset(&self) -> (f64, f64) {
        (0.0, 0.0)
    }

    /// Prepare the sensor for one or more probing moves.
    async fn begin_session(&self) -> AppResult<()>;

    /// Move toward `target` at `speed` until the sensor triggers.
    ///
    /// Returns the toolhead position at the trigger point; fails with
    /// `ProbeTriggerFailure` if `target` is reached without contact.
    async fn probe_once(&self, target: Position, speed: f64) -> AppResult<Position>;

    /// Release the sensor after the last probing move.
    async fn end_session(&self) -> AppResult<()>;
}

/// G-code execution on the host.
#[async_trait]
pub trait GcodeHost: Send + Sync {
    /// Run one or more newline-separated G-code commands.
    async fn run_script(&self, script: &str) -> AppResult<()>;

    /// Z component of the active G-code offset.
    async fn gcode_z_offset(&self) -> AppResult<f64>;
}

/// Durable key/value configuration storage.
pub trait ConfigStore: Send + Sync {
    /// Stage `value` for `key` in `section`.
    fn set(&self, section: &str, key: &str, value: &str) -> AppResult<()>;

    /// Last value stored for `key` in `section`.
    fn get(&self, section: &str, key: &str) -> AppResult<Option<String>>;
}

/// Every collaborator the module needs, injected at assembly time.
#[derive(Clone)]
pub struct Collaborators {
    /// Toolhead motion
    pub motion: Arc<dyn MotionControl>,
    /// G-code execution
    pub gcode: Arc<dyn GcodeHost>,
    /// Bed-mounted auxiliary sensor
    pub bed_sensor: Arc<dyn ProbeEndstop>,
    /// Nozzle-mounted probe
    pub probe: Arc<dyn ProbeEndstop>,
    /// Durable configuration
    pub store: Arc<dyn ConfigStore>,
}

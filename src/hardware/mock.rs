//! Simulated Printer
//!
//! Provides a simulated toolhead, bed sensor and nozzle probe for testing the
//! calibration protocol without physical hardware.
//!
//! # Physical Model
//!
//! The simulator tracks the *physical* nozzle height above a fixed datum and a
//! `z_shift` between physical and machine Z. Homing and `set_position` only
//! change the shift; moves change the physical position.
//!
//! - The bed surface is a plane: `height + tilt_x * x + tilt_y * y`.
//! - The bed sensor triggers when the nozzle is `trigger_height` above the bed
//!   under the nozzle (negative values model a sensor that needs compression).
//! - The nozzle probe tip sits at `nozzle + xy_offset` and triggers when the
//!   nozzle is `trigger_height` above the bed under the tip.
//!
//! Per-sample noise can be scripted with [`SimulatedPrinter::queue_bed_noise`]
//! and [`SimulatedPrinter::queue_probe_noise`], or drawn from a seeded RNG via
//! [`SimulatedPrinter::with_jitter`]. Sensors can be told to never trigger.
//!
//! # Example
//!
//! ```rust,ignore
//! let printer = SimulatedPrinter::new();
//! let motion = printer.motion();
//! motion.move_to(Position::new(120.0, 120.0, 5.0, 0.0), 5.0).await?;
//! let touch = printer.bed_sensor().probe_once(Position::new(120.0, 120.0, -2.0, 0.0), 5.0).await?;
//! ```

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::core::Position;
use crate::error::{AppResult, AutoZError};
use crate::gcode::CommandLine;
use crate::hardware::capabilities::{
    Collaborators, ConfigStore, GcodeHost, MotionControl, ProbeEndstop,
};

/// Default bed sensor trigger height; matches the default `z_offset`.
pub const DEFAULT_BED_TRIGGER: f64 = -0.1;
/// Default nozzle probe trigger height.
pub const DEFAULT_PROBE_TRIGGER: f64 = 1.25;
/// Default nozzle probe XY offset.
pub const DEFAULT_PROBE_XY_OFFSET: (f64, f64) = (25.0, 10.0);

// =============================================================================
// Shared State
// =============================================================================

/// Planar bed surface.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BedModel {
    /// Surface height at x=0, y=0
    pub height: f64,
    /// mm of rise per mm of X
    pub tilt_x: f64,
    /// mm of rise per mm of Y
    pub tilt_y: f64,
}

impl BedModel {
    /// Surface height under `(x, y)`.
    pub fn surface(&self, x: f64, y: f64) -> f64 {
        self.height + self.tilt_x * x + self.tilt_y * y
    }
}

#[derive(Debug)]
struct PrinterState {
    /// Physical nozzle position; z is height above the datum
    physical: Position,
    /// machine z - physical z
    z_shift: f64,
    /// Physical height at which the Z homing switch triggers
    home_trigger: f64,
    gcode_z_offset: f64,
    max_accel: f64,
    bed: BedModel,
    moves: u32,
    homes: u32,
    scripts: Vec<String>,
    reject_scripts: bool,
}

impl PrinterState {
    fn machine_position(&self) -> Position {
        self.physical.with_z(self.physical.z + self.z_shift)
    }
}

#[derive(Debug)]
struct SensorState {
    trigger_height: f64,
    noise: VecDeque<f64>,
    jitter: f64,
    fail: bool,
    session_active: bool,
    probes: u32,
}

impl SensorState {
    fn new(trigger_height: f64) -> Self {
        Self {
            trigger_height,
            noise: VecDeque::new(),
            jitter: 0.0,
            fail: false,
            session_active: false,
            probes: 0,
        }
    }
}

// =============================================================================
// SimulatedToolhead - MotionControl + GcodeHost
// =============================================================================

/// Simulated toolhead and G-code host sharing one printer state.
pub struct SimulatedToolhead {
    state: Arc<RwLock<PrinterState>>,
}

#[async_trait]
impl MotionControl for SimulatedToolhead {
    async fn position(&self) -> AppResult<Position> {
        Ok(self.state.read().await.machine_position())
    }

    async fn move_to(&self, target: Position, speed: f64) -> AppResult<()> {
        if speed.is_nan() || speed <= 0.0 {
            return Err(AutoZError::Motion(format!("invalid move speed {}", speed)));
        }
        let mut state = self.state.write().await;
        state.physical = target.with_z(target.z - state.z_shift);
        state.moves += 1;
        debug!(%target, speed, "simulated move");
        Ok(())
    }

    async fn set_position(&self, position: Position) -> AppResult<()> {
        let mut state = self.state.write().await;
        state.physical.x = position.x;
        state.physical.y = position.y;
        state.physical.e = position.e;
        state.z_shift = position.z - state.physical.z;
        debug!(%position, "simulated set_position");
        Ok(())
    }

    async fn home_z(&self) -> AppResult<()> {
        let mut state = self.state.write().await;
        state.physical.z = state.home_trigger;
        state.z_shift = -state.home_trigger;
        state.homes += 1;
        state.moves += 1;
        Ok(())
    }

    async fn max_accel(&self) -> AppResult<f64> {
        Ok(self.state.read().await.max_accel)
    }
}

#[async_trait]
impl GcodeHost for SimulatedToolhead {
    async fn run_script(&self, script: &str) -> AppResult<()> {
        if self.state.read().await.reject_scripts {
            return Err(AutoZError::Gcode(format!("host rejected script: {}", script.trim())));
        }
        for line in script.lines() {
            let Some(cmd) = CommandLine::parse(line) else {
                continue;
            };
            match cmd.name.as_str() {
                "SET_GCODE_OFFSET" => {
                    let z = cmd.float("Z")?;
                    self.state.write().await.gcode_z_offset = z;
                }
                "M204" => {
                    let accel = cmd.float("S")?;
                    if accel.is_nan() || accel <= 0.0 {
                        return Err(AutoZError::Gcode(format!("M204: invalid S{}", accel)));
                    }
                    self.state.write().await.max_accel = accel;
                }
                "G28" => self.home_z().await?,
                _ => {}
            }
            self.state.write().await.scripts.push(line.trim().to_string());
        }
        Ok(())
    }

    async fn gcode_z_offset(&self) -> AppResult<f64> {
        Ok(self.state.read().await.gcode_z_offset)
    }
}

// =============================================================================
// SimulatedSensor - ProbeEndstop
// =============================================================================

/// Simulated contact sensor attached to the printer state.
pub struct SimulatedSensor {
    name: String,
    xy_offset: (f64, f64),
    printer: Arc<RwLock<PrinterState>>,
    state: RwLock<SensorState>,
    rng: std::sync::Mutex<StdRng>,
}

impl SimulatedSensor {
    fn new(
        name: &str,
        xy_offset: (f64, f64),
        trigger_height: f64,
        printer: Arc<RwLock<PrinterState>>,
    ) -> Self {
        Self {
            name: name.to_string(),
            xy_offset,
            printer,
            state: RwLock::new(SensorState::new(trigger_height)),
            rng: std::sync::Mutex::new(StdRng::seed_from_u64(0)),
        }
    }

    fn draw_jitter(&self, amplitude: f64) -> f64 {
        if amplitude <= 0.0 {
            return 0.0;
        }
        match self.rng.lock() {
            Ok(mut rng) => rng.gen_range(-amplitude..=amplitude),
            Err(_) => 0.0,
        }
    }

    fn trigger_failure(&self, reason: String) -> AutoZError {
        AutoZError::ProbeTriggerFailure {
            sensor: self.name.clone(),
            reason,
        }
    }
}

#[async_trait]
impl ProbeEndstop for SimulatedSensor {
    fn name(&self) -> &str {
        &self.name
    }

    fn xy_offset(&self) -> (f64, f64) {
        self.xy_offset
    }

    async fn begin_session(&self) -> AppResult<()> {
        self.state.write().await.session_active = true;
        Ok(())
    }

    async fn probe_once(&self, target: Position, speed: f64) -> AppResult<Position> {
        let (trigger_height, noise, jitter, fail) = {
            let mut sensor = self.state.write().await;
            sensor.probes += 1;
            let noise = sensor.noise.pop_front().unwrap_or(0.0);
            (sensor.trigger_height, noise, sensor.jitter, sensor.fail)
        };
        let jitter = self.draw_jitter(jitter);

        let mut printer = self.printer.write().await;
        printer.moves += 1;
        let target_physical = target.z - printer.z_shift;
        if fail {
            printer.physical.z = target_physical;
            return Err(self.trigger_failure(format!(
                "no trigger before z={:.3}",
                target.z
            )));
        }

        let tip_x = printer.physical.x + self.xy_offset.0;
        let tip_y = printer.physical.y + self.xy_offset.1;
        let trigger = printer.bed.surface(tip_x, tip_y) + trigger_height + noise + jitter;

        if trigger > printer.physical.z {
            return Err(self.trigger_failure("triggered prior to movement".to_string()));
        }
        if trigger < target_physical {
            printer.physical.z = target_physical;
            return Err(self.trigger_failure(format!(
                "no trigger before z={:.3}",
                target.z
            )));
        }

        printer.physical.z = trigger;
        let touch = printer.machine_position();
        debug!(sensor = %self.name, %touch, speed, "simulated probe trigger");
        Ok(touch)
    }

    async fn end_session(&self) -> AppResult<()> {
        self.state.write().await.session_active = false;
        Ok(())
    }
}

// =============================================================================
// SimulatedPrinter - handle bundling the collaborators
// =============================================================================

/// Simulated printer: one toolhead, one bed sensor, one nozzle probe.
///
/// Starts homed with the nozzle 10mm above a flat bed at (120, 120).
pub struct SimulatedPrinter {
    state: Arc<RwLock<PrinterState>>,
    toolhead: Arc<SimulatedToolhead>,
    bed_sensor: Arc<SimulatedSensor>,
    probe: Arc<SimulatedSensor>,
}

impl SimulatedPrinter {
    /// Create a printer with default sensor geometry.
    pub fn new() -> Self {
        Self::with_geometry(
            DEFAULT_BED_TRIGGER,
            DEFAULT_PROBE_TRIGGER,
            DEFAULT_PROBE_XY_OFFSET,
        )
    }

    /// Create a printer with custom sensor trigger heights and probe offset.
    pub fn with_geometry(bed_trigger: f64, probe_trigger: f64, probe_xy: (f64, f64)) -> Self {
        let state = Arc::new(RwLock::new(PrinterState {
            physical: Position::new(120.0, 120.0, 10.0, 0.0),
            z_shift: 0.0,
            home_trigger: 0.0,
            gcode_z_offset: 0.0,
            max_accel: 3000.0,
            bed: BedModel::default(),
            moves: 0,
            homes: 0,
            scripts: Vec::new(),
            reject_scripts: false,
        }));
        Self {
            toolhead: Arc::new(SimulatedToolhead {
                state: state.clone(),
            }),
            bed_sensor: Arc::new(SimulatedSensor::new(
                "bed_sensor",
                (0.0, 0.0),
                bed_trigger,
                state.clone(),
            )),
            probe: Arc::new(SimulatedSensor::new(
                "probe",
                probe_xy,
                probe_trigger,
                state.clone(),
            )),
            state,
        }
    }

    /// Seed random per-sample jitter of up to `amplitude` mm on both sensors.
    pub async fn with_jitter(self, seed: u64, amplitude: f64) -> Self {
        for (i, sensor) in [&self.bed_sensor, &self.probe].into_iter().enumerate() {
            sensor.state.write().await.jitter = amplitude;
            if let Ok(mut rng) = sensor.rng.lock() {
                *rng = StdRng::seed_from_u64(seed.wrapping_add(i as u64));
            }
        }
        self
    }

    /// Toolhead as a motion collaborator.
    pub fn motion(&self) -> Arc<dyn MotionControl> {
        self.toolhead.clone()
    }

    /// Toolhead as a G-code collaborator.
    pub fn gcode(&self) -> Arc<dyn GcodeHost> {
        self.toolhead.clone()
    }

    /// Bed-mounted sensor.
    pub fn bed_sensor(&self) -> Arc<dyn ProbeEndstop> {
        self.bed_sensor.clone()
    }

    /// Nozzle probe.
    pub fn probe(&self) -> Arc<dyn ProbeEndstop> {
        self.probe.clone()
    }

    /// Bundle every collaborator around `store`.
    pub fn collaborators(&self, store: Arc<dyn ConfigStore>) -> Collaborators {
        Collaborators {
            motion: self.motion(),
            gcode: self.gcode(),
            bed_sensor: self.bed_sensor(),
            probe: self.probe(),
            store,
        }
    }

    /// Replace the bed surface.
    pub async fn set_bed(&self, bed: BedModel) {
        self.state.write().await.bed = bed;
    }

    /// Physical height at which the Z homing switch triggers.
    pub async fn set_home_trigger(&self, height: f64) {
        self.state.write().await.home_trigger = height;
    }

    /// Operator-set G-code Z offset, as after a manual baby-step.
    pub async fn set_gcode_z_offset(&self, z: f64) {
        self.state.write().await.gcode_z_offset = z;
    }

    /// Queue additive noise for the next bed sensor samples.
    pub async fn queue_bed_noise(&self, noise: impl IntoIterator<Item = f64>) {
        self.bed_sensor.state.write().await.noise.extend(noise);
    }

    /// Queue additive noise for the next nozzle probe samples.
    pub async fn queue_probe_noise(&self, noise: impl IntoIterator<Item = f64>) {
        self.probe.state.write().await.noise.extend(noise);
    }

    /// Make the bed sensor never trigger.
    pub async fn fail_bed_sensor(&self, fail: bool) {
        self.bed_sensor.state.write().await.fail = fail;
    }

    /// Make the nozzle probe never trigger.
    pub async fn fail_probe(&self, fail: bool) {
        self.probe.state.write().await.fail = fail;
    }

    /// Make the G-code host reject every script.
    pub async fn reject_scripts(&self, reject: bool) {
        self.state.write().await.reject_scripts = reject;
    }

    /// Total moves, including probing and homing moves.
    pub async fn move_count(&self) -> u32 {
        self.state.read().await.moves
    }

    /// Number of Z homing runs.
    pub async fn home_count(&self) -> u32 {
        self.state.read().await.homes
    }

    /// Number of bed sensor and nozzle probe samples taken.
    pub async fn probe_counts(&self) -> (u32, u32) {
        (
            self.bed_sensor.state.read().await.probes,
            self.probe.state.read().await.probes,
        )
    }

    /// Whether either sensor has a session open.
    pub async fn sensor_session_active(&self) -> bool {
        self.bed_sensor.state.read().await.session_active
            || self.probe.state.read().await.session_active
    }

    /// Physical nozzle height above the datum.
    pub async fn physical_z(&self) -> f64 {
        self.state.read().await.physical.z
    }

    /// Active G-code Z offset.
    pub async fn gcode_z_offset(&self) -> f64 {
        self.state.read().await.gcode_z_offset
    }

    /// Every script line run so far.
    pub async fn scripts(&self) -> Vec<String> {
        self.state.read().await.scripts.clone()
    }
}

impl Default for SimulatedPrinter {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_move_and_set_position() {
        let printer = SimulatedPrinter::new();
        let motion = printer.motion();

        motion
            .move_to(Position::new(50.0, 60.0, 3.0, 0.0), 10.0)
            .await
            .unwrap();
        assert_eq!(
            motion.position().await.unwrap(),
            Position::new(50.0, 60.0, 3.0, 0.0)
        );

        motion
            .set_position(Position::new(50.0, 60.0, 0.5, 0.0))
            .await
            .unwrap();
        assert_eq!(motion.position().await.unwrap().z, 0.5);
        // Bookkeeping only
        assert_eq!(printer.physical_z().await, 3.0);
        assert_eq!(printer.move_count().await, 1);
    }

    #[tokio::test]
    async fn test_bed_sensor_touch() {
        let printer = SimulatedPrinter::new();
        let start = printer.motion().position().await.unwrap();

        let touch = printer
            .bed_sensor()
            .probe_once(start.with_z(-2.0), 5.0)
            .await
            .unwrap();
        assert!((touch.z - DEFAULT_BED_TRIGGER).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_probe_uses_tip_position() {
        let printer = SimulatedPrinter::new();
        printer
            .set_bed(BedModel {
                height: 0.0,
                tilt_x: 0.01,
                tilt_y: 0.0,
            })
            .await;
        let start = printer.motion().position().await.unwrap();

        let touch = printer
            .probe()
            .probe_once(start.with_z(-2.0), 5.0)
            .await
            .unwrap();
        // Tip at x = 120 + 25
        let expected = 145.0 * 0.01 + DEFAULT_PROBE_TRIGGER;
        assert!((touch.z - expected).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_probe_failure_reports_trigger_failure() {
        let printer = SimulatedPrinter::new();
        printer.fail_probe(true).await;
        let start = printer.motion().position().await.unwrap();

        let err = printer
            .probe()
            .probe_once(start.with_z(-2.0), 5.0)
            .await
            .unwrap_err();
        assert!(matches!(err, AutoZError::ProbeTriggerFailure { .. }));
    }

    #[tokio::test]
    async fn test_travel_limit_reached() {
        let printer = SimulatedPrinter::new();
        let start = printer.motion().position().await.unwrap();

        // Bed sensor triggers at -0.1, below a 0.0 travel limit
        let err = printer
            .bed_sensor()
            .probe_once(start.with_z(0.0), 5.0)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no trigger before"));
        assert_eq!(printer.physical_z().await, 0.0);
    }

    #[tokio::test]
    async fn test_scripted_noise_and_jitter() {
        let printer = SimulatedPrinter::new().with_jitter(7, 0.01).await;
        printer.queue_bed_noise([0.5]).await;
        let start = printer.motion().position().await.unwrap();

        let touch = printer
            .bed_sensor()
            .probe_once(start.with_z(-2.0), 5.0)
            .await
            .unwrap();
        assert!((touch.z - (DEFAULT_BED_TRIGGER + 0.5)).abs() <= 0.01 + 1e-12);
    }

    #[tokio::test]
    async fn test_gcode_host_tracks_offset_and_accel() {
        let printer = SimulatedPrinter::new();
        let gcode = printer.gcode();

        gcode
            .run_script("SET_GCODE_OFFSET Z=-1.250000 MOVE=0\nM204 S500")
            .await
            .unwrap();
        assert_eq!(gcode.gcode_z_offset().await.unwrap(), -1.25);
        assert_eq!(printer.motion().max_accel().await.unwrap(), 500.0);
        assert_eq!(printer.scripts().await.len(), 2);
    }

    #[tokio::test]
    async fn test_home_z_resets_shift() {
        let printer = SimulatedPrinter::new();
        printer.set_home_trigger(0.3).await;
        printer.motion().home_z().await.unwrap();

        assert_eq!(printer.motion().position().await.unwrap().z, 0.0);
        assert_eq!(printer.physical_z().await, 0.3);
        assert_eq!(printer.home_count().await, 1);
    }
}

//! Command surface of one `auto_z_offset` module instance.
//!
//! [`AutoZOffset`] is assembled once from a validated [`AutoZConfig`] and the
//! host [`Collaborators`]. It owns the pending-session flag, the calibration
//! state and the calibrated value, and exposes:
//!
//! - [`AutoZOffset::dispatch`] for the six `AUTO_Z_*` commands
//! - [`AutoZOffset::handle_event`] for host homing and error events
//! - [`AutoZOffset::status`] for a serializable snapshot
//!
//! Any command error is routed through the top-level error handler, which
//! clears the pending flag and restores an active acceleration override.

use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

use crate::calibration::orchestrator::{self, CalibrationOrchestrator};
use crate::calibration::{CalibrationState, SessionFlag, StateTracker};
use crate::config::AutoZConfig;
use crate::error::{AppResult, AutoZError};
use crate::gcode::{self, CommandLine};
use crate::hardware::capabilities::{Collaborators, ProbeEndstop};
use crate::hardware::endstop::AutoZEndstop;

// =============================================================================
// Commands and events
// =============================================================================

/// The commands registered by the module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AutoZCommand {
    /// `AUTO_Z_PROBE`
    Probe,
    /// `AUTO_Z_HOME_Z`
    HomeZ,
    /// `AUTO_Z_MEASURE_OFFSET`
    MeasureOffset,
    /// `AUTO_Z_CALIBRATE`
    Calibrate,
    /// `AUTO_Z_LOAD_OFFSET`
    LoadOffset,
    /// `AUTO_Z_SAVE_GCODE_OFFSET`
    SaveGcodeOffset,
}

impl AutoZCommand {
    /// Every command, in registration order.
    pub const ALL: [AutoZCommand; 6] = [
        Self::Probe,
        Self::HomeZ,
        Self::MeasureOffset,
        Self::Calibrate,
        Self::LoadOffset,
        Self::SaveGcodeOffset,
    ];

    /// G-code name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Probe => "AUTO_Z_PROBE",
            Self::HomeZ => "AUTO_Z_HOME_Z",
            Self::MeasureOffset => "AUTO_Z_MEASURE_OFFSET",
            Self::Calibrate => "AUTO_Z_CALIBRATE",
            Self::LoadOffset => "AUTO_Z_LOAD_OFFSET",
            Self::SaveGcodeOffset => "AUTO_Z_SAVE_GCODE_OFFSET",
        }
    }

    /// One-line help text.
    pub fn help(self) -> &'static str {
        match self {
            Self::Probe => "Probe Z-height at the reference point using the bed sensor",
            Self::HomeZ => "Home Z using the bed sensor as an endstop",
            Self::MeasureOffset => {
                "Z-Offset measured by the nozzle probe after zeroing with the bed sensor"
            }
            Self::Calibrate => {
                "Set the Z-Offset by averaging multiple runs of AUTO_Z_MEASURE_OFFSET"
            }
            Self::LoadOffset => "Apply the calibrated_z_offset set in the config file",
            Self::SaveGcodeOffset => {
                "Save the current gcode offset for z as the new calibrated_z_offset"
            }
        }
    }

    /// Whether the command opens a probing session.
    pub fn probes(self) -> bool {
        matches!(
            self,
            Self::Probe | Self::HomeZ | Self::MeasureOffset | Self::Calibrate
        )
    }
}

impl fmt::Display for AutoZCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AutoZCommand {
    type Err = AutoZError;

    /// Parse a command line; only the command word is considered.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let line = CommandLine::parse(s)
            .ok_or_else(|| AutoZError::UnknownCommand(s.trim().to_string()))?;
        Self::ALL
            .into_iter()
            .find(|cmd| cmd.name() == line.name)
            .ok_or(AutoZError::UnknownCommand(line.name))
    }
}

/// Host events the module reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostEvent {
    /// A homing move is starting.
    HomingMoveBegin {
        /// Whether the move homes against the bed sensor virtual endstop
        uses_virtual_endstop: bool,
    },
    /// A homing move finished.
    HomingMoveEnd {
        /// Whether the move homed against the bed sensor virtual endstop
        uses_virtual_endstop: bool,
    },
    /// A G-code command failed somewhere on the host.
    CommandError,
}

// =============================================================================
// Responses and status
// =============================================================================

/// Outcome of one command.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CommandResponse {
    /// Lines reported to the operator
    pub lines: Vec<String>,
    /// The command's numeric result, when it has one
    pub value: Option<f64>,
}

impl CommandResponse {
    fn push(&mut self, line: impl Into<String>) {
        self.lines.push(line.into());
    }
}

/// Serializable snapshot of the module.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AutoZStatus {
    /// Module instance name
    pub name: String,
    /// Last bed sensor result from `AUTO_Z_PROBE` or `AUTO_Z_HOME_Z`
    pub last_z_result: Option<f64>,
    /// Calibrated offset held in memory
    pub calibrated_z_offset: f64,
    /// Whether a probing session is pending
    pub session_pending: bool,
    /// Whether the probing acceleration override is in effect
    pub accel_override_active: bool,
    /// Calibration state
    pub state: CalibrationState,
}

// =============================================================================
// Module
// =============================================================================

/// One assembled `auto_z_offset` module.
pub struct AutoZOffset {
    config: AutoZConfig,
    hw: Collaborators,
    endstop: Arc<AutoZEndstop>,
    session: SessionFlag,
    state: StateTracker,
    orchestrator: CalibrationOrchestrator,
    last_z_result: Option<f64>,
    calibrated_z_offset: f64,
}

impl AutoZOffset {
    /// Assemble the module.
    ///
    /// The bed sensor is wrapped in an [`AutoZEndstop`] so every probing
    /// session runs `prepare_gcode` and honours `probe_accel`.
    ///
    /// # Errors
    ///
    /// `Configuration` if `config` fails validation.
    pub fn new(config: AutoZConfig, collaborators: Collaborators) -> AppResult<Self> {
        config.validate()?;

        let endstop = Arc::new(
            AutoZEndstop::new(
                collaborators.bed_sensor.clone(),
                collaborators.motion.clone(),
                collaborators.gcode.clone(),
                config.name.clone(),
            )
            .with_prepare_gcode(config.prepare_gcode.clone())
            .with_probe_accel(config.probe_accel),
        );
        let bed_sensor: Arc<dyn ProbeEndstop> = endstop.clone();
        let hw = Collaborators {
            bed_sensor,
            ..collaborators
        };

        info!(
            name = %config.name,
            calibrated_z_offset = config.calibrated_z_offset,
            "auto_z_offset ready"
        );
        Ok(Self {
            orchestrator: CalibrationOrchestrator::new(&config),
            calibrated_z_offset: config.calibrated_z_offset,
            config,
            hw,
            endstop,
            session: SessionFlag::default(),
            state: StateTracker::new(),
            last_z_result: None,
        })
    }

    /// Module configuration.
    pub fn config(&self) -> &AutoZConfig {
        &self.config
    }

    /// Calibrated offset held in memory.
    pub fn calibrated_z_offset(&self) -> f64 {
        self.calibrated_z_offset
    }

    /// Pending-session flag shared by every step.
    pub fn session(&self) -> &SessionFlag {
        &self.session
    }

    /// Calibration state tracker.
    pub fn state(&self) -> &StateTracker {
        &self.state
    }

    /// Snapshot of the module.
    pub async fn status(&self) -> AutoZStatus {
        AutoZStatus {
            name: self.config.name.clone(),
            last_z_result: self.last_z_result,
            calibrated_z_offset: self.calibrated_z_offset,
            session_pending: self.session.is_pending(),
            accel_override_active: self.endstop.accel_override_active().await,
            state: self.state.get(),
        }
    }

    /// Parse and run one command line.
    pub async fn dispatch_line(&mut self, line: &str) -> AppResult<CommandResponse> {
        let cmd = line.parse::<AutoZCommand>()?;
        self.dispatch(cmd).await
    }

    /// Run one command.
    ///
    /// On error the top-level error handler runs before the error is
    /// returned, except for `SessionAlreadyActive`, which leaves the
    /// pending session untouched.
    pub async fn dispatch(&mut self, cmd: AutoZCommand) -> AppResult<CommandResponse> {
        info!(command = %cmd, "running command");
        if cmd.probes() && self.session.is_pending() {
            warn!(command = %cmd, "rejected: a probing session is already active");
            return Err(AutoZError::SessionAlreadyActive);
        }
        let result = match cmd {
            AutoZCommand::Probe => self.cmd_probe().await,
            AutoZCommand::HomeZ => self.cmd_home_z().await,
            AutoZCommand::MeasureOffset => self.cmd_measure_offset().await,
            AutoZCommand::Calibrate => self.cmd_calibrate().await,
            AutoZCommand::LoadOffset => self.cmd_load_offset().await,
            AutoZCommand::SaveGcodeOffset => self.cmd_save_gcode_offset().await,
        };
        match &result {
            // Lost the race for the session; the holder keeps it
            Err(AutoZError::SessionAlreadyActive) => {}
            Err(err) => {
                warn!(command = %cmd, error = %err, "command failed");
                self.handle_command_error().await;
            }
            Ok(_) => {}
        }
        result
    }

    /// React to a host event.
    pub async fn handle_event(&mut self, event: HostEvent) -> AppResult<()> {
        match event {
            HostEvent::HomingMoveBegin {
                uses_virtual_endstop: true,
            } => {
                self.session.try_begin()?;
                if let Err(err) = self.endstop.begin_session().await {
                    self.session.end();
                    return Err(err);
                }
                if let Err(err) = self.endstop.prepare_move().await {
                    if let Err(end_err) = self.endstop.end_session().await {
                        warn!(error = %end_err, "failed to end probing session");
                    }
                    self.session.end();
                    return Err(err);
                }
                Ok(())
            }
            HostEvent::HomingMoveEnd {
                uses_virtual_endstop: true,
            } => {
                let restored = self.endstop.finish_move().await;
                let ended = self.endstop.end_session().await;
                self.session.end();
                restored.and(ended)
            }
            HostEvent::HomingMoveBegin { .. } | HostEvent::HomingMoveEnd { .. } => Ok(()),
            HostEvent::CommandError => {
                self.handle_command_error().await;
                Ok(())
            }
        }
    }

    /// Clear every piece of session-scoped state after a failed command.
    async fn handle_command_error(&self) {
        if self.session.is_pending() {
            self.session.end();
            if let Err(err) = self.endstop.end_session().await {
                warn!(error = %err, "failed to end pending probing session");
            }
        }
        if let Err(err) = self.endstop.reset().await {
            warn!(error = %err, "failed to restore acceleration");
        }
        self.state.set(CalibrationState::Idle);
    }

    // -------------------------------------------------------------------------
    // Command handlers
    // -------------------------------------------------------------------------

    async fn cmd_probe(&mut self) -> AppResult<CommandResponse> {
        let zeroing = *self.orchestrator.round().zeroing();
        let measurement = zeroing.probe(&self.hw, &self.session).await?;
        Ok(self.bed_sensor_response(measurement.correction, measurement.outcome.tolerance_warning))
    }

    async fn cmd_home_z(&mut self) -> AppResult<CommandResponse> {
        let zeroing = *self.orchestrator.round().zeroing();
        let measurement = zeroing.home(&self.hw, &self.session).await?;
        Ok(self.bed_sensor_response(measurement.correction, measurement.outcome.tolerance_warning))
    }

    fn bed_sensor_response(&mut self, z: f64, spread: Option<f64>) -> CommandResponse {
        self.last_z_result = Some(z);
        let mut response = CommandResponse {
            value: Some(z),
            ..Default::default()
        };
        if let Some(spread) = spread {
            response.push(format!(
                "{}: samples spread {:.6} exceeds tolerance",
                self.hw.bed_sensor.name(),
                spread
            ));
        }
        response.push(format!("Result is z={:.6}", z));
        response
    }

    async fn cmd_measure_offset(&mut self) -> AppResult<CommandResponse> {
        let result = self
            .orchestrator
            .round()
            .run(&self.hw, &self.session, &self.state)
            .await;
        self.state.set(CalibrationState::Idle);
        let report = result?;

        let name = &self.config.name;
        let mut response = CommandResponse {
            value: Some(report.result.derived_diff),
            lines: report.warnings,
        };
        response.push(format!(
            "{}: bed sensor measured offset: z={:.6}",
            name, report.result.bed_sensor_offset
        ));
        response.push(format!(
            "{}: probe measured offset: z={:.6}",
            name, report.result.probe_offset
        ));
        response.push(format!(
            "{}: derived offset: z={:.6}",
            name, report.result.derived_diff
        ));
        Ok(response)
    }

    async fn cmd_calibrate(&mut self) -> AppResult<CommandResponse> {
        let report = match self
            .orchestrator
            .run(&self.hw, &self.session, &self.state)
            .await
        {
            Ok(report) => report,
            Err(err) => {
                // The offset is live even though the store refused it
                if let AutoZError::Persistence { value, .. } = &err {
                    self.calibrated_z_offset = *value;
                }
                return Err(err);
            }
        };
        self.calibrated_z_offset = report.value;

        let name = &self.config.name;
        let mut response = CommandResponse {
            value: Some(report.value),
            lines: report.warnings,
        };
        for (i, round) in report.rounds.iter().enumerate() {
            response.push(format!(
                "{}: round {}: bed={:.6} probe={:.6} diff={:.6}",
                name,
                i + 1,
                round.bed_sensor_offset,
                round.probe_offset,
                round.derived_diff
            ));
        }
        response.push(format!("{}: calibrated_z_offset: {:.6}", name, report.value));
        if report.persisted {
            response.push(format!(
                "Saved calibrated_z_offset to section [{}]",
                name
            ));
        }
        Ok(response)
    }

    async fn cmd_load_offset(&mut self) -> AppResult<CommandResponse> {
        let value = self.calibrated_z_offset;
        self.hw
            .gcode
            .run_script(&gcode::set_gcode_offset(-value)?)
            .await?;
        Ok(CommandResponse {
            lines: vec![format!(
                "{}: calibrated_z_offset: {:.6}",
                self.config.name, value
            )],
            value: Some(value),
        })
    }

    async fn cmd_save_gcode_offset(&mut self) -> AppResult<CommandResponse> {
        let value = -self.hw.gcode.gcode_z_offset().await?;
        self.calibrated_z_offset = value;
        orchestrator::persist(&self.hw, &self.config.name, value)?;
        Ok(CommandResponse {
            lines: vec![
                format!("{}: calibrated_z_offset: {:.6}", self.config.name, value),
                format!("Saved calibrated_z_offset to section [{}]", self.config.name),
            ],
            value: Some(value),
        })
    }
}

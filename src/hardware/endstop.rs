//! Bed sensor endstop wrapper.
//!
//! `AutoZEndstop` implements [`ProbeEndstop`] by delegating to the raw bed
//! sensor and adds the session-scoped behaviour the sensor needs:
//!
//! - the configured `prepare_gcode` is rendered and run before each session
//! - when `probe_accel > 0`, the host acceleration is lowered for the probing
//!   move and restored afterwards, including after a failed move
//!
//! The saved acceleration is also restored by [`AutoZEndstop::reset`], which
//! the command-error handler calls so an aborted command never leaves the
//! override in place.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::core::Position;
use crate::error::AppResult;
use crate::gcode;
use crate::hardware::capabilities::{GcodeHost, MotionControl, ProbeEndstop};

/// Bed sensor with prepare script and acceleration override.
pub struct AutoZEndstop {
    inner: Arc<dyn ProbeEndstop>,
    motion: Arc<dyn MotionControl>,
    gcode: Arc<dyn GcodeHost>,
    /// Module instance name, available to the prepare template as `{name}`
    instance: String,
    prepare_gcode: Option<String>,
    probe_accel: f64,
    /// Acceleration in effect before the override, while it is active
    saved_accel: Mutex<Option<f64>>,
}

impl AutoZEndstop {
    /// Wrap `inner` with the module's session behaviour.
    pub fn new(
        inner: Arc<dyn ProbeEndstop>,
        motion: Arc<dyn MotionControl>,
        gcode: Arc<dyn GcodeHost>,
        instance: impl Into<String>,
    ) -> Self {
        Self {
            inner,
            motion,
            gcode,
            instance: instance.into(),
            prepare_gcode: None,
            probe_accel: 0.0,
            saved_accel: Mutex::new(None),
        }
    }

    /// Script run at the start of every probing session.
    pub fn with_prepare_gcode(mut self, template: Option<String>) -> Self {
        self.prepare_gcode = template.filter(|t| !t.trim().is_empty());
        self
    }

    /// Acceleration used during probing moves; 0 disables the override.
    pub fn with_probe_accel(mut self, probe_accel: f64) -> Self {
        self.probe_accel = probe_accel;
        self
    }

    /// Whether an acceleration override is currently in effect.
    pub async fn accel_override_active(&self) -> bool {
        self.saved_accel.lock().await.is_some()
    }

    /// Undo any session-scoped state left behind by an aborted command.
    pub async fn reset(&self) -> AppResult<()> {
        self.finish_move().await
    }

    /// Apply the acceleration override ahead of a probing or homing move.
    pub async fn prepare_move(&self) -> AppResult<()> {
        if self.probe_accel <= 0.0 {
            return Ok(());
        }
        let mut saved = self.saved_accel.lock().await;
        let first = saved.is_none();
        if first {
            *saved = Some(self.motion.max_accel().await?);
        }
        let applied = self.gcode.run_script(&gcode::set_accel(self.probe_accel)?).await;
        if applied.is_err() && first {
            // Nothing was overridden
            *saved = None;
        }
        applied
    }

    /// Restore the acceleration saved by [`AutoZEndstop::prepare_move`].
    pub async fn finish_move(&self) -> AppResult<()> {
        let Some(old) = self.saved_accel.lock().await.take() else {
            return Ok(());
        };
        debug!(accel = old, "restoring acceleration after probing move");
        self.gcode.run_script(&gcode::set_accel(old)?).await
    }
}

#[async_trait]
impl ProbeEndstop for AutoZEndstop {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn xy_offset(&self) -> (f64, f64) {
        self.inner.xy_offset()
    }

    async fn begin_session(&self) -> AppResult<()> {
        if let Some(template) = &self.prepare_gcode {
            let script = gcode::render(
                template,
                &[
                    ("name", self.instance.clone()),
                    ("sensor", self.inner.name().to_string()),
                ],
            )?;
            self.gcode.run_script(&script).await?;
        }
        self.inner.begin_session().await
    }

    async fn probe_once(&self, target: Position, speed: f64) -> AppResult<Position> {
        self.prepare_move().await?;
        let result = self.inner.probe_once(target, speed).await;
        match (result, self.finish_move().await) {
            (Ok(pos), Ok(())) => Ok(pos),
            (Ok(_), Err(err)) => Err(err),
            (Err(err), restore) => {
                if let Err(restore_err) = restore {
                    warn!(error = %restore_err, "failed to restore acceleration");
                }
                Err(err)
            }
        }
    }

    async fn end_session(&self) -> AppResult<()> {
        self.inner.end_session().await
    }
}

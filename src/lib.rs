//! Core library for the auto_z_offset calibration module.
//!
//! Computes the Z offset between a printer's nozzle and its bed by combining
//! two sensors: a bed-mounted sensor used as a temporary Z reference, and the
//! nozzle-mounted probe. The library contains the calibration protocol, the
//! capability traits it runs against, a simulated printer implementing them,
//! and the command surface used by the `auto_z_offset` binary.

pub mod calibration;
pub mod commands;
pub mod config;
pub mod core;
pub mod error;
pub mod gcode;
pub mod hardware;
pub mod storage;

pub use commands::{AutoZCommand, AutoZOffset, AutoZStatus, CommandResponse, HostEvent};
pub use config::AutoZConfig;
pub use error::{AppResult, AutoZError};

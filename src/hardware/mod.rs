//! Host collaborators.
//!
//! - `capabilities` - the traits every calibration step is written against
//! - `endstop` - the bed sensor wrapper used as a virtual Z endstop
//! - `mock` - a simulated printer implementing every capability

pub mod capabilities;
pub mod endstop;
pub mod mock;

pub use capabilities::{Collaborators, ConfigStore, GcodeHost, MotionControl, ProbeEndstop};
pub use endstop::AutoZEndstop;
pub use mock::SimulatedPrinter;

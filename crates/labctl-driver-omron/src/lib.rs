//! Omron G9SP safety controller support.
//!
//! [`g9sp_frame`] is the fixed-length binary frame codec; [`g9sp`] polls the
//! controller and maps its safety inputs onto logical interlocks.

pub mod g9sp;
pub mod g9sp_frame;

pub use g9sp::{validate_settings, ControllerSettings, Interlock, InterlockController};
pub use g9sp_frame::{SafetyFrame, UnitStatus};

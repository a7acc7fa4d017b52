//! BK Precision 9100-series power supply support.
//!
//! - [`ascii`]: command construction, 4-digit hundredths fields, response tokenizing
//! - [`bk9104`]: the [`PowerSupply`] driver with preset and protection checks

pub mod ascii;
pub mod bk9104;

pub use ascii::{Command, Hundredths, RegulationMode};
pub use bk9104::{LiveReading, PowerSupply, SupplySettings};

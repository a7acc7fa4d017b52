//! Omega process monitor driver for labctl.
//!
//! - [`modbus_rtu`]: request/response framing, CRC-16/MODBUS, float reconstruction
//! - [`dp16pt`]: the multi-unit [`TemperatureMonitor`]

pub mod dp16pt;
pub mod modbus_rtu;

pub use dp16pt::{MonitorSettings, RunMode, TemperatureMonitor, UnitChannel};
pub use modbus_rtu::WordOrder;

//! # labctl
//!
//! Polling core for a small bench of serial instruments: a Modbus RTU
//! temperature monitor, a safety controller read through fixed-length
//! checksummed frames, and an ASCII-command programmable power supply.
//!
//! ## Crate Structure
//!
//! - **`config`**: Figment-based configuration (TOML file plus `LABCTL_`
//!   environment overrides) and its validation.
//! - **`logging`**: `tracing-subscriber` setup.
//! - **`driver`**: the closed set of instrument drivers.
//! - **`scheduler`**: one polling task per device with adaptive backoff,
//!   health publication and operator requests.
//! - **`snapshot`**: read-only query surface over the state cache.
//! - **`subsystem`**: start, reassign and shut down the whole device set.
//!
//! Protocol drivers live in `labctl-driver-omega`, `labctl-driver-omron` and
//! `labctl-driver-bk`; shared types, the serial transport and the state cache
//! live in `labctl-core`.

pub mod config;
pub mod driver;
pub mod logging;
pub mod scheduler;
pub mod snapshot;
pub mod subsystem;

pub use config::Config;
pub use driver::{InstrumentDriver, ProtocolKind};
pub use scheduler::{ConnectionState, DeviceHandle, DeviceHealth, PowerSupplyHandle};
pub use snapshot::{DeviceSnapshot, Snapshot, SystemSnapshot};
pub use subsystem::Subsystem;

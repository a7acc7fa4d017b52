//! Core building blocks for labctl instrument drivers.
//!
//! This crate holds everything the three protocol drivers share:
//!
//! - [`error`]: the [`InstrumentError`] type and its [`ErrorClass`] taxonomy
//! - [`serial`] / [`transport`]: serial line settings, port opening and the
//!   per-device [`Transport`] with bounded reconnect and timed reads
//! - [`error_recovery`]: the constant-delay [`RetryPolicy`]
//! - [`reading`]: device and channel identifiers, observations and readings
//! - [`polling`]: the per-device adaptive [`PollingState`]
//! - [`cache`]: the shared [`StateCache`]
//! - `mock_serial` (tests and the `testing` feature): scripted serial ports

pub mod cache;
pub mod error;
pub mod error_recovery;
#[cfg(any(test, feature = "testing"))]
pub mod mock_serial;
pub mod polling;
pub mod reading;
pub mod serial;
pub mod transport;

pub use cache::StateCache;
pub use error::{ErrorClass, InstrumentError, InstrumentResult};
pub use error_recovery::RetryPolicy;
pub use polling::{BackoffBounds, PollingState};
pub use reading::{ChannelId, DeviceId, Observation, PresetQuantity, Quality, Reading, Sample};
pub use serial::{DynSerial, PortOpener, SerialSettings};
pub use transport::Transport;

//! Error types shared by the transport, the codecs and the drivers.
//!
//! Every failure a driver can produce is an [`InstrumentError`]. The polling
//! scheduler never inspects the error text; it asks for the error's
//! [`ErrorClass`] and lets the class decide how the failure is recovered and
//! how it eventually surfaces to consumers:
//!
//! - `LinkClosed`, `Timeout`, `ChecksumError`, `MalformedFrame` are recovered by
//!   reconnect-and-retry plus polling backoff, and only reach consumers as a
//!   channel quality once the persistence threshold is crossed.
//! - `OutOfRange` is bridged with the channel's last good value until the
//!   error-count threshold is exceeded, then surfaces as `SensorError`.
//! - `SensorError` is a device-reported abnormal state and surfaces immediately.
//! - `Command` errors come from operator commands (invalid setpoints, unsafe
//!   writes) and never occur during a poll.

use std::time::Duration;
use thiserror::Error;

/// Classification of an [`InstrumentError`] onto the polling error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Transport not open and could not be reopened.
    LinkClosed,
    /// No response within the response budget.
    Timeout,
    /// Frame integrity check failed.
    ChecksumError,
    /// Unexpected length, function/service code or framing.
    MalformedFrame,
    /// Value decoded but outside physical validity.
    OutOfRange,
    /// Device-reported abnormal state.
    SensorError,
    /// Sustained failure past the backoff threshold.
    Disconnected,
    /// Operator command refused before or by the device.
    Command,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ErrorClass::LinkClosed => "link_closed",
            ErrorClass::Timeout => "timeout",
            ErrorClass::ChecksumError => "checksum_error",
            ErrorClass::MalformedFrame => "malformed_frame",
            ErrorClass::OutOfRange => "out_of_range",
            ErrorClass::SensorError => "sensor_error",
            ErrorClass::Disconnected => "disconnected",
            ErrorClass::Command => "command",
        };
        write!(f, "{}", label)
    }
}

/// Primary error type for instrument communication.
#[derive(Error, Debug)]
pub enum InstrumentError {
    /// The serial link is closed and a bounded reconnect did not reopen it.
    #[error("serial link '{0}' is not open")]
    LinkClosed(String),

    /// The device did not answer within the response budget.
    #[error("no response within {0:?}")]
    Timeout(Duration),

    /// The transmitted checksum does not match the computed one.
    #[error("checksum mismatch: computed {computed:#06x}, received {received:#06x}")]
    Checksum {
        /// Checksum computed over the received bytes.
        computed: u16,
        /// Checksum carried by the frame.
        received: u16,
    },

    /// The frame has an unexpected shape (length, address, function or service code).
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// A value was decoded but lies outside its physical validity range.
    #[error("value {value} outside valid range [{min}, {max}]")]
    OutOfRange {
        /// Decoded value.
        value: f64,
        /// Lower bound (inclusive).
        min: f64,
        /// Upper bound (inclusive).
        max: f64,
    },

    /// The device reports an abnormal operating state.
    #[error("device reports abnormal state: {0}")]
    SensorError(String),

    /// The device has been declared disconnected.
    #[error("device disconnected: {0}")]
    Disconnected(String),

    /// The device answered with an explicit rejection (exception or error response).
    #[error("device rejected request: {0}")]
    Rejected(String),

    /// A command argument failed validation before anything was transmitted.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// A command was refused because applying it in the current state is unsafe.
    #[error("unsafe operation refused: {0}")]
    Unsafe(String),

    /// Underlying I/O failure on the serial port.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl InstrumentError {
    /// Map this error onto the polling error taxonomy.
    pub fn class(&self) -> ErrorClass {
        match self {
            InstrumentError::LinkClosed(_) | InstrumentError::Io(_) => ErrorClass::LinkClosed,
            InstrumentError::Timeout(_) => ErrorClass::Timeout,
            InstrumentError::Checksum { .. } => ErrorClass::ChecksumError,
            InstrumentError::MalformedFrame(_) | InstrumentError::Rejected(_) => {
                ErrorClass::MalformedFrame
            }
            InstrumentError::OutOfRange { .. } => ErrorClass::OutOfRange,
            InstrumentError::SensorError(_) => ErrorClass::SensorError,
            InstrumentError::Disconnected(_) => ErrorClass::Disconnected,
            InstrumentError::InvalidParameter(_) | InstrumentError::Unsafe(_) => {
                ErrorClass::Command
            }
        }
    }

    /// Whether the transport should be torn down after this error.
    pub fn is_link_fatal(&self) -> bool {
        matches!(self, InstrumentError::Io(_) | InstrumentError::LinkClosed(_))
    }
}

/// Convenience alias for results carrying an [`InstrumentError`].
pub type InstrumentResult<T> = std::result::Result<T, InstrumentError>;

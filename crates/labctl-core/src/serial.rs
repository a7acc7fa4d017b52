//! Serial port abstractions shared by every driver crate.
//!
//! # Types
//!
//! - [`SerialPortIO`]: Trait alias combining AsyncRead + AsyncWrite for serial ports
//! - [`DynSerial`]: Type-erased boxed serial port
//! - [`SerialSettings`]: Line settings for one device (port, baud, framing, timeouts)
//! - [`PortOpener`]: Seam for opening ports, so tests can hand out mock ports
//!
//! # Utilities
//!
//! - [`open_serial_async`]: Open a serial port with spawn_blocking
//! - [`drain_serial_buffer`]: Drain stale data from a serial port
//!
//! # Example
//!
//! ```rust,ignore
//! use labctl_core::serial::{open_serial_async, SerialSettings};
//!
//! let settings = SerialSettings::new("/dev/ttyUSB0", 9600);
//! let port = open_serial_async(&settings, "DP16PT").await?;
//! ```

use crate::error::{InstrumentError, InstrumentResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};

// =============================================================================
// Serial Port Trait
// =============================================================================

/// Trait alias for async serial port I/O.
///
/// Any type implementing `AsyncRead + AsyncWrite + Unpin + Send` can be used
/// as a serial port. This includes:
/// - `tokio_serial::SerialStream` (real hardware)
/// - `tokio::io::DuplexStream` (testing)
/// - [`crate::mock_serial::MockSerialPort`] (scripted testing)
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

// Blanket implementation for all types meeting the requirements
impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Type-erased boxed serial port.
pub type DynSerial = Box<dyn SerialPortIO>;

// =============================================================================
// Line Settings
// =============================================================================

/// Parity setting for a serial line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    /// No parity bit (8-N-1 instruments).
    #[default]
    None,
    /// Even parity (the safety controller uses 8-E-1).
    Even,
    /// Odd parity.
    Odd,
}

impl From<Parity> for tokio_serial::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Even => tokio_serial::Parity::Even,
            Parity::Odd => tokio_serial::Parity::Odd,
        }
    }
}

/// Line settings and I/O budgets for one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialSettings {
    /// Serial port path (e.g., "/dev/ttyUSB0", "COM3")
    pub port: String,
    /// Baud rate (e.g., 9600, 115200)
    pub baud_rate: u32,
    /// Parity bit setting
    #[serde(default)]
    pub parity: Parity,
    /// Number of data bits (7 or 8)
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    /// Number of stop bits (1 or 2)
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    /// Response budget for one request/response exchange
    #[serde(default = "default_timeout", with = "millis")]
    pub timeout: Duration,
    /// How long to listen for stale bytes before each transaction
    #[serde(default = "default_drain_window", with = "millis")]
    pub drain_window: Duration,
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

fn default_timeout() -> Duration {
    Duration::from_millis(500)
}

fn default_drain_window() -> Duration {
    Duration::from_millis(20)
}

impl SerialSettings {
    /// 8-N-1 settings with default budgets.
    pub fn new(port: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port: port.into(),
            baud_rate,
            parity: Parity::None,
            data_bits: default_data_bits(),
            stop_bits: default_stop_bits(),
            timeout: default_timeout(),
            drain_window: default_drain_window(),
        }
    }

    /// Override the parity bit.
    pub fn with_parity(mut self, parity: Parity) -> Self {
        self.parity = parity;
        self
    }

    /// Override the response budget.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Override the stale-byte drain window.
    pub fn with_drain_window(mut self, window: Duration) -> Self {
        self.drain_window = window;
        self
    }

    fn tokio_data_bits(&self) -> tokio_serial::DataBits {
        match self.data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        }
    }

    fn tokio_stop_bits(&self) -> tokio_serial::StopBits {
        if self.stop_bits == 2 {
            tokio_serial::StopBits::Two
        } else {
            tokio_serial::StopBits::One
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

// =============================================================================
// Port Opening
// =============================================================================

/// Open a serial port asynchronously using spawn_blocking.
///
/// This function wraps the serial port opening in `spawn_blocking` to avoid
/// blocking the async runtime during port initialization. Framing comes from
/// `settings`; flow control is always off.
///
/// # Errors
///
/// Returns [`InstrumentError::LinkClosed`] if the port cannot be opened or
/// spawn_blocking fails.
pub async fn open_serial_async(
    settings: &SerialSettings,
    device_name: &str,
) -> InstrumentResult<tokio_serial::SerialStream> {
    use tokio::task::spawn_blocking;
    use tokio_serial::SerialPortBuilderExt;

    let settings = settings.clone();
    let device_name = device_name.to_string();

    spawn_blocking(move || {
        tokio_serial::new(&settings.port, settings.baud_rate)
            .data_bits(settings.tokio_data_bits())
            .parity(settings.parity.into())
            .stop_bits(settings.tokio_stop_bits())
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| {
                InstrumentError::LinkClosed(format!(
                    "failed to open {} serial port {}: {}",
                    device_name, settings.port, e
                ))
            })
    })
    .await
    .map_err(|e| InstrumentError::LinkClosed(format!("spawn_blocking for port open failed: {}", e)))?
}

/// Opens serial ports for a transport.
///
/// Production code uses [`SerialPortOpener`]; tests hand out scripted mock
/// ports so reconnect paths can be exercised without hardware.
#[async_trait]
pub trait PortOpener: Send + Sync {
    /// Open the port described by `settings`.
    async fn open(&self, settings: &SerialSettings, device_name: &str) -> InstrumentResult<DynSerial>;
}

/// Opens real serial ports through `tokio-serial`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialPortOpener;

#[async_trait]
impl PortOpener for SerialPortOpener {
    async fn open(&self, settings: &SerialSettings, device_name: &str) -> InstrumentResult<DynSerial> {
        let port = open_serial_async(settings, device_name).await?;
        Ok(Box::new(port))
    }
}

// =============================================================================
// Serial Port Utilities
// =============================================================================

/// Drain stale data from a serial port buffer.
///
/// Reads and discards data until no more is immediately available or the
/// window elapses. Returns the number of bytes discarded.
pub async fn drain_serial_buffer<R: AsyncRead + Unpin + ?Sized>(
    port: &mut R,
    window: Duration,
) -> usize {
    let mut discard = [0u8; 256];
    let deadline = tokio::time::Instant::now() + window;
    let mut total_discarded = 0usize;

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }

        match tokio::time::timeout(remaining, port.read(&mut discard)).await {
            Ok(Ok(0)) => break, // EOF or no more data
            Ok(Ok(n)) => {
                total_discarded += n;
            }
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::WouldBlock => break,
            Ok(Err(_)) => break, // Real I/O error, abort drain
            Err(_) => break,     // Timeout, no more immediate data
        }
    }

    total_discarded
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_drain_serial_buffer() {
        let (mut host, mut device) = tokio::io::duplex(64);

        host.write_all(b"stale data 12345").await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let discarded = drain_serial_buffer(&mut device, Duration::from_millis(50)).await;
        assert_eq!(discarded, 16);
    }

    #[tokio::test]
    async fn zero_window_drains_nothing() {
        let (mut host, mut device) = tokio::io::duplex(64);
        host.write_all(b"pending").await.unwrap();

        let discarded = drain_serial_buffer(&mut device, Duration::ZERO).await;
        assert_eq!(discarded, 0);
    }

    #[test]
    fn settings_deserialize_with_defaults() {
        let settings: SerialSettings = serde_json::from_str(
            r#"{ "port": "/dev/ttyUSB1", "baud_rate": 115200, "parity": "even", "timeout": 300 }"#,
        )
        .unwrap();
        assert_eq!(settings.parity, Parity::Even);
        assert_eq!(settings.data_bits, 8);
        assert_eq!(settings.stop_bits, 1);
        assert_eq!(settings.timeout, Duration::from_millis(300));
        assert_eq!(settings.drain_window, Duration::from_millis(20));
    }
}

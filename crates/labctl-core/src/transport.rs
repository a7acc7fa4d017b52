//! One exclusively owned serial connection per device.
//!
//! [`Transport`] wraps the port in a `BufReader` and gives drivers the handful
//! of primitives their protocols need: drain stale input, write a request,
//! read a fixed number of bytes or read up to a delimiter. Every read is bounded
//! by the configured response budget.
//!
//! Each primitive first checks that the port is open; if it is not, a bounded
//! reconnect runs under the transport's [`RetryPolicy`] and the operation fails
//! with `LinkClosed` when the reconnect fails. Any hard I/O error closes the
//! port so the next operation reconnects.

use crate::error::{InstrumentError, InstrumentResult};
use crate::error_recovery::{handle_recoverable_error, Recoverable, RetryPolicy};
use crate::serial::{drain_serial_buffer, DynSerial, PortOpener, SerialPortOpener, SerialSettings};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

/// Serial connection owned by one device task.
pub struct Transport {
    name: String,
    settings: SerialSettings,
    opener: Arc<dyn PortOpener>,
    retry: RetryPolicy,
    port: Option<BufReader<DynSerial>>,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("name", &self.name)
            .field("port", &self.settings.port)
            .field("open", &self.port.is_some())
            .finish()
    }
}

impl Transport {
    /// Create a closed transport. Nothing is opened until [`Transport::open`]
    /// or the first I/O operation.
    pub fn new(
        name: impl Into<String>,
        settings: SerialSettings,
        opener: Arc<dyn PortOpener>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            name: name.into(),
            settings,
            opener,
            retry,
            port: None,
        }
    }

    /// Create a transport for real hardware using [`SerialPortOpener`].
    pub fn serial(name: impl Into<String>, settings: SerialSettings, retry: RetryPolicy) -> Self {
        Self::new(name, settings, Arc::new(SerialPortOpener), retry)
    }

    /// Create an already-open transport around `port` that never reconnects.
    ///
    /// Used by tests to drive a driver through a mock port.
    pub fn with_port(name: impl Into<String>, settings: SerialSettings, port: DynSerial) -> Self {
        Self {
            name: name.into(),
            settings,
            opener: Arc::new(SerialPortOpener),
            retry: RetryPolicy {
                max_attempts: 0,
                backoff_delay: Duration::ZERO,
            },
            port: Some(BufReader::new(port)),
        }
    }

    /// Device name used in log events and errors.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current line settings.
    pub fn settings(&self) -> &SerialSettings {
        &self.settings
    }

    /// Response budget for one exchange.
    pub fn timeout(&self) -> Duration {
        self.settings.timeout
    }

    /// Whether a port is currently held.
    pub fn is_open(&self) -> bool {
        self.port.is_some()
    }

    /// Open the port once, replacing any port already held.
    pub async fn open(&mut self) -> InstrumentResult<()> {
        self.close().await;
        let port = self.opener.open(&self.settings, &self.name).await?;
        info!(device = %self.name, port = %self.settings.port, baud = self.settings.baud_rate, "serial port opened");
        self.port = Some(BufReader::new(port));
        Ok(())
    }

    /// Open the port with the bounded reconnect policy.
    pub async fn connect(&mut self) -> InstrumentResult<()> {
        let policy = self.retry.clone();
        handle_recoverable_error(self, &policy).await
    }

    /// Ensure the port is open, reconnecting if needed.
    pub async fn ensure_open(&mut self) -> InstrumentResult<()> {
        if self.is_open() {
            return Ok(());
        }
        debug!(device = %self.name, "transport closed, reconnecting");
        self.connect().await.map_err(|e| {
            warn!(device = %self.name, error = %e, "reconnect failed");
            InstrumentError::LinkClosed(self.name.clone())
        })
    }

    /// Close the port. Closing a closed transport is a no-op.
    pub async fn close(&mut self) {
        if let Some(mut port) = self.port.take() {
            if let Err(e) = port.get_mut().shutdown().await {
                debug!(device = %self.name, error = %e, "error while closing port");
            }
            debug!(device = %self.name, "serial port closed");
        }
    }

    /// Move the transport to a different port path and open it there.
    pub async fn reassign(&mut self, port: impl Into<String>) -> InstrumentResult<()> {
        let port = port.into();
        info!(device = %self.name, from = %self.settings.port, to = %port, "reassigning serial port");
        self.close().await;
        self.settings.port = port;
        self.connect().await
    }

    fn port_mut(&mut self) -> InstrumentResult<&mut BufReader<DynSerial>> {
        let name = &self.name;
        self.port
            .as_mut()
            .ok_or_else(|| InstrumentError::LinkClosed(name.clone()))
    }

    fn fail_link(&mut self, error: std::io::Error) -> InstrumentError {
        warn!(device = %self.name, error = %error, "serial I/O error, closing port");
        self.port = None;
        InstrumentError::Io(error)
    }

    /// Discard stale input: whatever the reader has buffered, then anything
    /// arriving within the drain window. Returns the number of bytes dropped.
    pub async fn drain(&mut self) -> InstrumentResult<usize> {
        self.ensure_open().await?;
        let window = self.settings.drain_window;
        let reader = self.port_mut()?;

        let buffered = reader.buffer().len();
        reader.consume(buffered);
        let drained = drain_serial_buffer(reader.get_mut(), window).await;

        let total = buffered + drained;
        if total > 0 {
            debug!(device = %self.name, bytes = total, "discarded stale input");
        }
        Ok(total)
    }

    /// Write `bytes` and flush.
    pub async fn write_all(&mut self, bytes: &[u8]) -> InstrumentResult<()> {
        self.ensure_open().await?;
        let reader = self.port_mut()?;
        let result = async {
            reader.get_mut().write_all(bytes).await?;
            reader.get_mut().flush().await
        }
        .await;
        result.map_err(|e| self.fail_link(e))
    }

    /// Read exactly `len` bytes within the response budget.
    pub async fn read_exact(&mut self, len: usize) -> InstrumentResult<Vec<u8>> {
        let budget = self.settings.timeout;
        self.read_exact_within(len, budget).await
    }

    /// Read exactly `len` bytes within `budget`.
    pub async fn read_exact_within(
        &mut self,
        len: usize,
        budget: Duration,
    ) -> InstrumentResult<Vec<u8>> {
        self.ensure_open().await?;
        let reader = self.port_mut()?;
        let mut buf = vec![0u8; len];
        match tokio::time::timeout(budget, reader.read_exact(&mut buf)).await {
            Ok(Ok(_)) => Ok(buf),
            Ok(Err(e)) => Err(self.fail_link(e)),
            Err(_) => Err(InstrumentError::Timeout(budget)),
        }
    }

    /// Read up to and including `delimiter` within the response budget.
    ///
    /// End-of-file before the delimiter is a link failure.
    pub async fn read_line(&mut self, delimiter: u8) -> InstrumentResult<Vec<u8>> {
        let budget = self.settings.timeout;
        self.read_line_within(delimiter, budget).await
    }

    /// Read up to and including `delimiter` within `budget`.
    pub async fn read_line_within(
        &mut self,
        delimiter: u8,
        budget: Duration,
    ) -> InstrumentResult<Vec<u8>> {
        self.ensure_open().await?;
        let reader = self.port_mut()?;
        let mut buf = Vec::new();
        match tokio::time::timeout(budget, reader.read_until(delimiter, &mut buf)).await {
            Ok(Ok(_)) if buf.last() == Some(&delimiter) => Ok(buf),
            Ok(Ok(_)) => Err(self.fail_link(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "port closed mid-response",
            ))),
            Ok(Err(e)) => Err(self.fail_link(e)),
            Err(_) => Err(InstrumentError::Timeout(budget)),
        }
    }
}

#[async_trait]
impl Recoverable<InstrumentError> for Transport {
    async fn recover(&mut self) -> Result<(), InstrumentError> {
        self.open().await
    }
}

//! Scripted serial port for driver tests.
//!
//! [`MockSerialPort`] implements `AsyncRead` and `AsyncWrite` and is handed to
//! the code under test; the paired [`MockDeviceHarness`] stays in the test and
//! plays the instrument: it asserts on what the driver wrote and feeds back
//! response bytes. [`MockPortOpener`] hands out pre-built ports (or open
//! failures) in order, so reconnect paths run without hardware.
//!
//! # Architecture
//!
//! A pair of unbounded channels carries bytes in each direction. Dropping the
//! harness makes writes fail with `BrokenPipe` and reads hit end-of-file,
//! which is how tests simulate a cable being pulled.
//!
//! # Example
//!
//! ```rust,ignore
//! let (port, mut harness) = mock_serial::new();
//! let mut transport = Transport::with_port("psu", settings, Box::new(port));
//!
//! let task = tokio::spawn(async move {
//!     transport.write_all(b"GOUT\r").await?;
//!     transport.read_line(b'\r').await
//! });
//!
//! harness.expect_and_respond(b"GOUT\r", b"0\rOK\r").await;
//! ```

#![allow(clippy::panic, clippy::expect_used)]

use crate::error::{InstrumentError, InstrumentResult};
use crate::serial::{DynSerial, PortOpener, SerialSettings};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// The client-facing side of the mock serial port.
#[derive(Debug)]
pub struct MockSerialPort {
    writes_tx: UnboundedSender<Vec<u8>>,
    reads_rx: UnboundedReceiver<Vec<u8>>,
    read_buffer: VecDeque<u8>,
}

/// The test-facing side for controlling the mock serial port.
#[derive(Debug)]
pub struct MockDeviceHarness {
    writes_rx: UnboundedReceiver<Vec<u8>>,
    reads_tx: UnboundedSender<Vec<u8>>,
    write_buffer: Vec<u8>,
}

/// Creates a new connected pair of `MockSerialPort` and `MockDeviceHarness`.
pub fn new() -> (MockSerialPort, MockDeviceHarness) {
    let (client_to_harness_tx, client_to_harness_rx) = mpsc::unbounded_channel();
    let (harness_to_client_tx, harness_to_client_rx) = mpsc::unbounded_channel();

    let port = MockSerialPort {
        writes_tx: client_to_harness_tx,
        reads_rx: harness_to_client_rx,
        read_buffer: VecDeque::new(),
    };

    let harness = MockDeviceHarness {
        writes_rx: client_to_harness_rx,
        reads_tx: harness_to_client_tx,
        write_buffer: Vec::new(),
    };

    (port, harness)
}

// =============================================================================
// MockSerialPort Implementations
// =============================================================================

impl MockSerialPort {
    fn fill(&mut self, buf: &mut ReadBuf<'_>) {
        let to_read = std::cmp::min(buf.remaining(), self.read_buffer.len());
        let chunk: Vec<u8> = self.read_buffer.drain(..to_read).collect();
        buf.put_slice(&chunk);
    }
}

impl AsyncRead for MockSerialPort {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.read_buffer.is_empty() {
            self.fill(buf);
            return Poll::Ready(Ok(()));
        }

        match self.reads_rx.poll_recv(cx) {
            Poll::Ready(Some(chunk)) => {
                self.read_buffer.extend(chunk);
                self.fill(buf);
                Poll::Ready(Ok(()))
            }
            // Channel closed: end-of-file
            Poll::Ready(None) => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for MockSerialPort {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.writes_tx.send(buf.to_vec()) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(_) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "mock device harness disconnected",
            ))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

// =============================================================================
// MockDeviceHarness Implementations
// =============================================================================

impl MockDeviceHarness {
    /// Sends bytes to the client as if the device had transmitted them.
    ///
    /// # Errors
    /// Returns error if the client port has been dropped.
    pub fn send_response(&self, data: &[u8]) -> Result<(), &'static str> {
        self.reads_tx
            .send(data.to_vec())
            .map_err(|_| "Failed to send response: client port disconnected")
    }

    /// Waits for the client to write `expected` and asserts it byte for byte.
    ///
    /// # Panics
    /// Panics if the data does not arrive within 2 seconds or does not match.
    pub async fn expect_write(&mut self, expected: &[u8]) {
        let actual = self.next_write(expected.len()).await;
        assert_eq!(
            actual,
            expected,
            "Mismatch in expected write. Expected `{:?}`, got `{:?}`.",
            String::from_utf8_lossy(expected),
            String::from_utf8_lossy(&actual)
        );
    }

    /// Waits for the next `len` written bytes and returns them without asserting.
    ///
    /// # Panics
    /// Panics if the data does not arrive within 2 seconds.
    pub async fn next_write(&mut self, len: usize) -> Vec<u8> {
        use tokio::time::{timeout, Duration};

        let timeout_duration = Duration::from_secs(2);

        while self.write_buffer.len() < len {
            match timeout(timeout_duration, self.writes_rx.recv()).await {
                Ok(Some(chunk)) => self.write_buffer.extend_from_slice(&chunk),
                Ok(None) => panic!("Client-side port closed while expecting a write."),
                Err(_) => panic!(
                    "Timeout waiting for write of {} bytes, only received `{:?}` ({} bytes).",
                    len,
                    String::from_utf8_lossy(&self.write_buffer),
                    self.write_buffer.len()
                ),
            }
        }

        self.write_buffer.drain(..len).collect()
    }

    /// Expects a write and sends a response in one operation.
    pub async fn expect_and_respond(&mut self, expected: &[u8], response: &[u8]) {
        self.expect_write(expected).await;
        self.send_response(response)
            .expect("Failed to send response");
    }

    /// Drains any pending writes without asserting their content.
    pub async fn drain_writes(&mut self) {
        use tokio::time::{timeout, Duration};
        let short_timeout = Duration::from_millis(50);

        while let Ok(Some(chunk)) = timeout(short_timeout, self.writes_rx.recv()).await {
            self.write_buffer.extend_from_slice(&chunk);
        }
        self.write_buffer.clear();
    }
}

// =============================================================================
// MockPortOpener
// =============================================================================

/// Hands out scripted ports in order; an exhausted queue fails to open.
#[derive(Debug, Default)]
pub struct MockPortOpener {
    queue: Mutex<VecDeque<Option<MockSerialPort>>>,
    opens: AtomicUsize,
}

impl MockPortOpener {
    /// Create an opener with an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a port for the next successful open.
    pub fn push_port(&self, port: MockSerialPort) {
        self.queue.lock().push_back(Some(port));
    }

    /// Queue one failed open.
    pub fn push_failure(&self) {
        self.queue.lock().push_back(None);
    }

    /// Queue a fresh port and return its harness.
    pub fn push_connected(&self) -> MockDeviceHarness {
        let (port, harness) = new();
        self.push_port(port);
        harness
    }

    /// Number of open attempts so far.
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PortOpener for MockPortOpener {
    async fn open(&self, settings: &SerialSettings, device_name: &str) -> InstrumentResult<DynSerial> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        match self.queue.lock().pop_front() {
            Some(Some(port)) => Ok(Box::new(port)),
            _ => Err(InstrumentError::LinkClosed(format!(
                "failed to open {} serial port {}: no such device",
                device_name, settings.port
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    #[tokio::test]
    async fn command_response_round_trip() {
        let (port, mut harness) = new();
        let mut reader = BufReader::new(port);

        let app_task = tokio::spawn(async move {
            reader.write_all(b"GETD\r").await.unwrap();
            let mut response = Vec::new();
            reader.read_until(b'\r', &mut response).await.unwrap();
            response
        });

        harness.expect_and_respond(b"GETD\r", b"050001000\r").await;

        assert_eq!(app_task.await.unwrap(), b"050001000\r");
    }

    #[tokio::test]
    async fn dropped_harness_breaks_writes() {
        let (mut port, harness) = new();
        drop(harness);

        let err = port.write_all(b"GOUT\r").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn opener_serves_queue_in_order() {
        let opener = MockPortOpener::new();
        let settings = SerialSettings::new("/dev/ttyUSB0", 9600);
        opener.push_failure();
        let _harness = opener.push_connected();

        assert!(opener.open(&settings, "psu").await.is_err());
        assert!(opener.open(&settings, "psu").await.is_ok());
        assert!(opener.open(&settings, "psu").await.is_err());
        assert_eq!(opener.opens(), 3);
    }
}

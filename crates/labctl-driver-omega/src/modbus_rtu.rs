//! Modbus RTU framing for the handful of functions the process monitor uses.
//!
//! Frames are `address | function | payload | crc16`, with the CRC-16/MODBUS
//! appended low byte first. Register values are big-endian on the wire.
//!
//! Supported functions:
//! - `0x03` read holding registers
//! - `0x04` read input registers
//! - `0x10` write (multiple) registers, used here for single-register writes
//!
//! The `encode_*_response` builders produce slave-side frames; tests use them to
//! script a device.

use crc::{Crc, CRC_16_MODBUS};
use labctl_core::error::{InstrumentError, InstrumentResult};
use labctl_core::transport::Transport;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Read holding registers.
pub const READ_HOLDING_REGISTERS: u8 = 0x03;
/// Read input registers.
pub const READ_INPUT_REGISTERS: u8 = 0x04;
/// Write multiple registers.
pub const WRITE_MULTIPLE_REGISTERS: u8 = 0x10;

const EXCEPTION_FLAG: u8 = 0x80;
const MODBUS_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// CRC-16/MODBUS of `data`.
pub fn crc16(data: &[u8]) -> u16 {
    MODBUS_CRC.checksum(data)
}

fn append_crc(frame: &mut Vec<u8>) {
    let crc = crc16(frame);
    frame.extend_from_slice(&crc.to_le_bytes());
}

/// Verify the trailing CRC of a complete frame.
pub fn check_crc(frame: &[u8]) -> InstrumentResult<()> {
    if frame.len() < 4 {
        return Err(InstrumentError::MalformedFrame(format!(
            "modbus frame of {} bytes is too short",
            frame.len()
        )));
    }
    let (body, tail) = frame.split_at(frame.len() - 2);
    let received = u16::from_le_bytes([tail[0], tail[1]]);
    let computed = crc16(body);
    if computed != received {
        return Err(InstrumentError::Checksum { computed, received });
    }
    Ok(())
}

// =============================================================================
// Requests
// =============================================================================

/// A master request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Function 0x03.
    ReadHolding {
        /// Slave address.
        unit: u8,
        /// First register.
        start: u16,
        /// Number of registers.
        count: u16,
    },
    /// Function 0x04.
    ReadInput {
        /// Slave address.
        unit: u8,
        /// First register.
        start: u16,
        /// Number of registers.
        count: u16,
    },
    /// Function 0x10.
    WriteRegisters {
        /// Slave address.
        unit: u8,
        /// First register.
        start: u16,
        /// Values to write, one per register.
        values: Vec<u16>,
    },
}

impl Request {
    /// Read `count` holding registers from `start`.
    pub fn read_holding(unit: u8, start: u16, count: u16) -> Self {
        Request::ReadHolding { unit, start, count }
    }

    /// Read `count` input registers from `start`.
    pub fn read_input(unit: u8, start: u16, count: u16) -> Self {
        Request::ReadInput { unit, start, count }
    }

    /// Write a single register through function 0x10.
    pub fn write_register(unit: u8, register: u16, value: u16) -> Self {
        Request::WriteRegisters {
            unit,
            start: register,
            values: vec![value],
        }
    }

    /// Slave address.
    pub fn unit(&self) -> u8 {
        match self {
            Request::ReadHolding { unit, .. }
            | Request::ReadInput { unit, .. }
            | Request::WriteRegisters { unit, .. } => *unit,
        }
    }

    /// Function code.
    pub fn function(&self) -> u8 {
        match self {
            Request::ReadHolding { .. } => READ_HOLDING_REGISTERS,
            Request::ReadInput { .. } => READ_INPUT_REGISTERS,
            Request::WriteRegisters { .. } => WRITE_MULTIPLE_REGISTERS,
        }
    }

    /// Serialize the request, CRC included.
    pub fn encode(&self) -> Vec<u8> {
        let mut frame = vec![self.unit(), self.function()];
        match self {
            Request::ReadHolding { start, count, .. } | Request::ReadInput { start, count, .. } => {
                frame.extend_from_slice(&start.to_be_bytes());
                frame.extend_from_slice(&count.to_be_bytes());
            }
            Request::WriteRegisters { start, values, .. } => {
                frame.extend_from_slice(&start.to_be_bytes());
                frame.extend_from_slice(&(values.len() as u16).to_be_bytes());
                frame.push((values.len() * 2) as u8);
                for value in values {
                    frame.extend_from_slice(&value.to_be_bytes());
                }
            }
        }
        append_crc(&mut frame);
        frame
    }
}

// =============================================================================
// Responses
// =============================================================================

/// A decoded slave response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Register contents from a read.
    Registers(Vec<u16>),
    /// Acknowledged write.
    Written {
        /// First register written.
        start: u16,
        /// Number of registers written.
        count: u16,
    },
}

fn exception_name(code: u8) -> &'static str {
    match code {
        0x01 => "illegal function",
        0x02 => "illegal data address",
        0x03 => "illegal data value",
        0x04 => "slave device failure",
        0x05 => "acknowledge",
        0x06 => "slave device busy",
        _ => "unknown exception",
    }
}

/// Decode a complete response frame against the request that produced it.
pub fn decode_response(request: &Request, frame: &[u8]) -> InstrumentResult<Response> {
    check_crc(frame)?;
    let body = &frame[..frame.len() - 2];

    if body[0] != request.unit() {
        return Err(InstrumentError::MalformedFrame(format!(
            "response from unit {} to a request for unit {}",
            body[0],
            request.unit()
        )));
    }

    let function = body[1];
    if function == request.function() | EXCEPTION_FLAG {
        let code = body.get(2).copied().unwrap_or(0);
        return Err(InstrumentError::Rejected(format!(
            "unit {} modbus exception {:#04x} ({})",
            request.unit(),
            code,
            exception_name(code)
        )));
    }
    if function != request.function() {
        return Err(InstrumentError::MalformedFrame(format!(
            "function {:#04x} in response to {:#04x}",
            function,
            request.function()
        )));
    }

    match request {
        Request::ReadHolding { count, .. } | Request::ReadInput { count, .. } => {
            let byte_count = usize::from(body.get(2).copied().unwrap_or(0));
            let data = body.get(3..).unwrap_or_default();
            if byte_count != usize::from(*count) * 2 || data.len() != byte_count {
                return Err(InstrumentError::MalformedFrame(format!(
                    "expected {} register bytes, got {}",
                    usize::from(*count) * 2,
                    data.len()
                )));
            }
            Ok(Response::Registers(
                data.chunks_exact(2)
                    .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                    .collect(),
            ))
        }
        Request::WriteRegisters { start, values, .. } => {
            if body.len() != 6 {
                return Err(InstrumentError::MalformedFrame(format!(
                    "write acknowledgement of {} bytes",
                    frame.len()
                )));
            }
            let echoed_start = u16::from_be_bytes([body[2], body[3]]);
            let echoed_count = u16::from_be_bytes([body[4], body[5]]);
            if echoed_start != *start || usize::from(echoed_count) != values.len() {
                return Err(InstrumentError::MalformedFrame(format!(
                    "write acknowledged {}x{:#06x}, requested {}x{:#06x}",
                    echoed_count,
                    echoed_start,
                    values.len(),
                    start
                )));
            }
            Ok(Response::Written {
                start: echoed_start,
                count: echoed_count,
            })
        }
    }
}

/// Send `request` and read its response within the transport's budget.
///
/// Stale input is drained first. The response length is derived from the
/// header as it arrives: exception frames are 5 bytes, reads carry a byte
/// count, write acknowledgements are 8 bytes.
pub async fn execute(transport: &mut Transport, request: &Request) -> InstrumentResult<Response> {
    transport.drain().await?;
    transport.write_all(&request.encode()).await?;

    let deadline = Instant::now() + transport.timeout();
    let remaining = || deadline.saturating_duration_since(Instant::now());

    let mut frame = transport.read_exact_within(2, remaining()).await?;
    let function = frame[1];

    let rest = if function == request.function() | EXCEPTION_FLAG {
        3
    } else if function != request.function() {
        return Err(InstrumentError::MalformedFrame(format!(
            "function {:#04x} in response to {:#04x}",
            function,
            request.function()
        )));
    } else {
        match request {
            Request::ReadHolding { .. } | Request::ReadInput { .. } => {
                let count = transport.read_exact_within(1, remaining()).await?;
                frame.extend_from_slice(&count);
                usize::from(count[0]) + 2
            }
            Request::WriteRegisters { .. } => 6,
        }
    };

    let tail = transport.read_exact_within(rest, remaining()).await?;
    frame.extend_from_slice(&tail);
    decode_response(request, &frame)
}

// =============================================================================
// Slave-side frames
// =============================================================================

/// Build a read response carrying `registers`.
pub fn encode_read_response(unit: u8, function: u8, registers: &[u16]) -> Vec<u8> {
    let mut frame = vec![unit, function, (registers.len() * 2) as u8];
    for register in registers {
        frame.extend_from_slice(&register.to_be_bytes());
    }
    append_crc(&mut frame);
    frame
}

/// Build a write acknowledgement.
pub fn encode_write_response(unit: u8, start: u16, count: u16) -> Vec<u8> {
    let mut frame = vec![unit, WRITE_MULTIPLE_REGISTERS];
    frame.extend_from_slice(&start.to_be_bytes());
    frame.extend_from_slice(&count.to_be_bytes());
    append_crc(&mut frame);
    frame
}

/// Build an exception response.
pub fn encode_exception(unit: u8, function: u8, code: u8) -> Vec<u8> {
    let mut frame = vec![unit, function | EXCEPTION_FLAG, code];
    append_crc(&mut frame);
    frame
}

// =============================================================================
// Float reconstruction
// =============================================================================

/// Order of the two 16-bit halves of a 32-bit value.
///
/// Bytes within each register are always big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WordOrder {
    /// Low half-word in the first register.
    #[default]
    LowFirst,
    /// High half-word in the first register.
    HighFirst,
}

/// Reconstruct an IEEE-754 single from two consecutive registers.
pub fn decode_f32(registers: [u16; 2], order: WordOrder) -> f32 {
    let (high, low) = match order {
        WordOrder::HighFirst => (registers[0], registers[1]),
        WordOrder::LowFirst => (registers[1], registers[0]),
    };
    f32::from_bits((u32::from(high) << 16) | u32::from(low))
}

/// Split an IEEE-754 single into two registers.
pub fn encode_f32(value: f32, order: WordOrder) -> [u16; 2] {
    let bits = value.to_bits();
    let high = (bits >> 16) as u16;
    let low = (bits & 0xFFFF) as u16;
    match order {
        WordOrder::HighFirst => [high, low],
        WordOrder::LowFirst => [low, high],
    }
}

//! Fixed-format frames of the G9SP safety controller's serial protocol.
//!
//! ## Request (19 bytes)
//!
//! ```text
//! 0      1..=3     4..=8           9..=12   13..=14   15..=16    17..=18
//! 0x40   00 00 0F  4B 03 4D 00 01  data(4)  rsvd(2)   sum(be)    2A 0D
//! ```
//!
//! The checksum is the 16-bit sum of bytes 0..=14. With an all-zero payload it
//! is always [`REQUEST_CHECKSUM_ZERO_PAYLOAD`].
//!
//! ## Response
//!
//! `0x40`, a 3-byte length field, the end code, then kind-specific content,
//! a big-endian 16-bit sum of every preceding byte and the `2A 0D` footer. The
//! length field selects the kind:
//!
//! | length     | kind               | total |
//! |------------|--------------------|-------|
//! | `00 00 C3` | normal             | 199   |
//! | `00 00 07` | error (service)    | 11    |
//! | `00 00 06` | malformed command  | 10    |
//!
//! A normal response carries service code `0xCB` at byte 6 and 188 data bytes
//! from byte 7; field offsets below are absolute frame offsets.

use labctl_core::error::{InstrumentError, InstrumentResult};

/// Frame start byte, both directions.
pub const START_BYTE: u8 = 0x40;
/// Frame footer, both directions.
pub const FOOTER: [u8; 2] = [0x2A, 0x0D];
/// Request length.
pub const REQUEST_LEN: usize = 19;
/// Constant request header (start byte, length, command).
pub const REQUEST_HEADER: [u8; 9] = [0x40, 0x00, 0x00, 0x0F, 0x4B, 0x03, 0x4D, 0x00, 0x01];
/// Request checksum when the 6-byte payload is all zero.
pub const REQUEST_CHECKSUM_ZERO_PAYLOAD: u16 = 0x00EB;
/// Service code of a normal response.
pub const SERVICE_CODE: u8 = 0xCB;
/// Bytes preceding the length-counted part of a response (start byte + length field).
pub const RESPONSE_PREFIX_LEN: usize = 4;

/// Total length of a normal response.
pub const NORMAL_RESPONSE_LEN: usize = 199;
const NORMAL_LENGTH_FIELD: u32 = 0xC3;
const ERROR_LENGTH_FIELD: u32 = 0x07;
const MALFORMED_LENGTH_FIELD: u32 = 0x06;

/// Most safety input terminals a controller can report.
pub const MAX_INPUTS: usize = 20;
/// Most safety output terminals a controller can report.
pub const MAX_OUTPUTS: usize = 16;

/// Absolute offsets of normal-response fields.
pub mod offsets {
    /// End code (2 bytes).
    pub const END_CODE: usize = 4;
    /// Service code (1 byte).
    pub const SERVICE_CODE: usize = 6;
    /// Optional communications transmission data (4 bytes).
    pub const OPTIONAL_COMM_DATA: usize = 7;
    /// Safety input terminal data flags (6 bytes).
    pub const INPUT_DATA_FLAGS: usize = 11;
    /// Safety output terminal data flags (4 bytes).
    pub const OUTPUT_DATA_FLAGS: usize = 17;
    /// Safety input terminal status flags (6 bytes).
    pub const INPUT_STATUS_FLAGS: usize = 21;
    /// Safety output terminal status flags (4 bytes).
    pub const OUTPUT_STATUS_FLAGS: usize = 27;
    /// Safety input terminal error causes (24 bytes, one nibble per terminal).
    pub const INPUT_ERROR_CAUSES: usize = 31;
    /// Safety output terminal error causes (16 bytes, one nibble per terminal).
    pub const OUTPUT_ERROR_CAUSES: usize = 55;
    /// Unit status (2 bytes, big-endian).
    pub const UNIT_STATUS: usize = 73;
    /// Configuration id (2 bytes).
    pub const CONFIGURATION_ID: usize = 75;
    /// Unit conduction time in hours (4 bytes, big-endian).
    pub const CONDUCTION_TIME: usize = 77;
    /// Error log, ten 5-byte records.
    pub const ERROR_LOG: usize = 95;
    /// Operation log, ten 5-byte records.
    pub const OPERATION_LOG: usize = 145;
    /// Response checksum (2 bytes, big-endian).
    pub const CHECKSUM: usize = 195;
}

const LOG_RECORD_LEN: usize = 5;
const LOG_RECORDS: usize = 10;

/// 16-bit wrapping sum of `bytes`.
pub const fn additive_checksum(bytes: &[u8]) -> u16 {
    let mut sum: u16 = 0;
    let mut i = 0;
    while i < bytes.len() {
        sum = sum.wrapping_add(bytes[i] as u16);
        i += 1;
    }
    sum
}

// =============================================================================
// Request
// =============================================================================

/// Build the 19-byte request carrying `payload` (4 data + 2 reserved bytes).
pub const fn build_request(payload: [u8; 6]) -> [u8; REQUEST_LEN] {
    let mut frame = [0u8; REQUEST_LEN];
    let mut i = 0;
    while i < REQUEST_HEADER.len() {
        frame[i] = REQUEST_HEADER[i];
        i += 1;
    }
    let mut j = 0;
    while j < payload.len() {
        frame[REQUEST_HEADER.len() + j] = payload[j];
        j += 1;
    }
    let sum = request_checksum(&frame);
    let sum = sum.to_be_bytes();
    frame[15] = sum[0];
    frame[16] = sum[1];
    frame[17] = FOOTER[0];
    frame[18] = FOOTER[1];
    frame
}

/// Checksum of a request: sum of bytes 0..=14.
pub const fn request_checksum(frame: &[u8; REQUEST_LEN]) -> u16 {
    let mut sum: u16 = 0;
    let mut i = 0;
    while i <= 14 {
        sum = sum.wrapping_add(frame[i] as u16);
        i += 1;
    }
    sum
}

/// The poll request used in this deployment: all-zero payload.
pub const POLL_REQUEST: [u8; REQUEST_LEN] = build_request([0; 6]);

// A zero-payload request with any other checksum is a build error, not a runtime condition.
const _: () = assert!(request_checksum(&POLL_REQUEST) == REQUEST_CHECKSUM_ZERO_PAYLOAD);

// =============================================================================
// Response
// =============================================================================

/// Response kind selected by the length field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    /// Full status frame.
    Normal,
    /// Controller reported a service error.
    Error,
    /// Controller could not parse the request.
    MalformedCommand,
}

impl ResponseKind {
    /// Kind for a length field value, if recognized.
    pub fn from_length_field(length: u32) -> Option<Self> {
        match length {
            NORMAL_LENGTH_FIELD => Some(ResponseKind::Normal),
            ERROR_LENGTH_FIELD => Some(ResponseKind::Error),
            MALFORMED_LENGTH_FIELD => Some(ResponseKind::MalformedCommand),
            _ => None,
        }
    }

    /// Total frame length for this kind.
    pub fn frame_len(self) -> usize {
        let field = match self {
            ResponseKind::Normal => NORMAL_LENGTH_FIELD,
            ResponseKind::Error => ERROR_LENGTH_FIELD,
            ResponseKind::MalformedCommand => MALFORMED_LENGTH_FIELD,
        };
        RESPONSE_PREFIX_LEN + field as usize
    }
}

/// Read the length field of a response prefix (start byte + 3 length bytes).
pub fn parse_prefix(prefix: &[u8]) -> InstrumentResult<ResponseKind> {
    if prefix.len() < RESPONSE_PREFIX_LEN {
        return Err(InstrumentError::MalformedFrame(format!(
            "response prefix of {} bytes",
            prefix.len()
        )));
    }
    if prefix[0] != START_BYTE {
        return Err(InstrumentError::MalformedFrame(format!(
            "invalid start byte {:#04x}",
            prefix[0]
        )));
    }
    let length = u32::from_be_bytes([0, prefix[1], prefix[2], prefix[3]]);
    ResponseKind::from_length_field(length).ok_or_else(|| {
        InstrumentError::MalformedFrame(format!("unrecognized response length {:#08x}", length))
    })
}

/// Validate a complete response and return its status frame.
///
/// Error and malformed-command responses are returned as
/// [`InstrumentError::Rejected`] carrying the end code.
pub fn parse_response(frame: &[u8]) -> InstrumentResult<SafetyFrame> {
    let kind = parse_prefix(frame)?;
    if frame.len() != kind.frame_len() {
        return Err(InstrumentError::MalformedFrame(format!(
            "{:?} response declared {} bytes, received {}",
            kind,
            kind.frame_len(),
            frame.len()
        )));
    }
    if frame[frame.len() - 2..] != FOOTER {
        return Err(InstrumentError::MalformedFrame(format!(
            "invalid footer {:02x?}",
            &frame[frame.len() - 2..]
        )));
    }

    let checksum_at = frame.len() - 4;
    let received = u16::from_be_bytes([frame[checksum_at], frame[checksum_at + 1]]);
    let computed = additive_checksum(&frame[..checksum_at]);
    if computed != received {
        return Err(InstrumentError::Checksum { computed, received });
    }

    let end_code = u16::from_be_bytes([frame[offsets::END_CODE], frame[offsets::END_CODE + 1]]);
    match kind {
        ResponseKind::Error => Err(InstrumentError::Rejected(format!(
            "controller error response, end code {:#06x}, service code {:#04x}",
            end_code, frame[offsets::SERVICE_CODE]
        ))),
        ResponseKind::MalformedCommand => Err(InstrumentError::Rejected(format!(
            "controller rejected command, end code {:#06x}",
            end_code
        ))),
        ResponseKind::Normal => {
            if end_code != 0 {
                return Err(InstrumentError::MalformedFrame(format!(
                    "normal response with end code {:#06x}",
                    end_code
                )));
            }
            if frame[offsets::SERVICE_CODE] != SERVICE_CODE {
                return Err(InstrumentError::MalformedFrame(format!(
                    "service code {:#04x}",
                    frame[offsets::SERVICE_CODE]
                )));
            }
            let mut bytes = [0u8; NORMAL_RESPONSE_LEN];
            bytes.copy_from_slice(frame);
            Ok(SafetyFrame { bytes })
        }
    }
}

/// Flag `n` of a little-endian bit field: bit `n % 8` of byte `n / 8`.
pub fn flag(bytes: &[u8], n: usize) -> Option<bool> {
    bytes.get(n / 8).map(|byte| (byte >> (n % 8)) & 1 == 1)
}

/// Error-cause nibble of terminal `n`: low nibble for even `n`, high for odd.
pub fn cause_nibble(bytes: &[u8], n: usize) -> Option<u8> {
    bytes.get(n / 2).map(|byte| if n % 2 == 0 { byte & 0x0F } else { byte >> 4 })
}

/// Validated normal response.
#[derive(Clone, PartialEq, Eq)]
pub struct SafetyFrame {
    bytes: [u8; NORMAL_RESPONSE_LEN],
}

impl std::fmt::Debug for SafetyFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SafetyFrame")
            .field("unit_status", &self.unit_status())
            .field("input_data", &self.input_data_flags())
            .field("input_status", &self.input_status_flags())
            .finish()
    }
}

impl SafetyFrame {
    fn field(&self, offset: usize, len: usize) -> &[u8] {
        &self.bytes[offset..offset + len]
    }

    /// Raw frame bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Optional communications transmission data.
    pub fn optional_comm_data(&self) -> &[u8] {
        self.field(offsets::OPTIONAL_COMM_DATA, 4)
    }

    /// Safety input terminal data flags.
    pub fn input_data_flags(&self) -> &[u8] {
        self.field(offsets::INPUT_DATA_FLAGS, 6)
    }

    /// Safety output terminal data flags.
    pub fn output_data_flags(&self) -> &[u8] {
        self.field(offsets::OUTPUT_DATA_FLAGS, 4)
    }

    /// Safety input terminal status flags.
    pub fn input_status_flags(&self) -> &[u8] {
        self.field(offsets::INPUT_STATUS_FLAGS, 6)
    }

    /// Safety output terminal status flags.
    pub fn output_status_flags(&self) -> &[u8] {
        self.field(offsets::OUTPUT_STATUS_FLAGS, 4)
    }

    /// Input terminal `n` is ON. `None` beyond [`MAX_INPUTS`].
    pub fn input_data(&self, n: usize) -> Option<bool> {
        (n < MAX_INPUTS).then(|| flag(self.input_data_flags(), n)).flatten()
    }

    /// Input terminal `n` reports normal (no error). `None` beyond [`MAX_INPUTS`].
    pub fn input_status(&self, n: usize) -> Option<bool> {
        (n < MAX_INPUTS).then(|| flag(self.input_status_flags(), n)).flatten()
    }

    /// Output terminal `n` is ON. `None` beyond [`MAX_OUTPUTS`].
    pub fn output_data(&self, n: usize) -> Option<bool> {
        (n < MAX_OUTPUTS).then(|| flag(self.output_data_flags(), n)).flatten()
    }

    /// Output terminal `n` reports normal. `None` beyond [`MAX_OUTPUTS`].
    pub fn output_status(&self, n: usize) -> Option<bool> {
        (n < MAX_OUTPUTS).then(|| flag(self.output_status_flags(), n)).flatten()
    }

    /// Error cause of input terminal `n`.
    pub fn input_error_cause(&self, n: usize) -> Option<InputErrorCause> {
        if n >= MAX_INPUTS {
            return None;
        }
        cause_nibble(self.field(offsets::INPUT_ERROR_CAUSES, 24), n).map(InputErrorCause::from_code)
    }

    /// Error cause of output terminal `n`.
    pub fn output_error_cause(&self, n: usize) -> Option<OutputErrorCause> {
        if n >= MAX_OUTPUTS {
            return None;
        }
        cause_nibble(self.field(offsets::OUTPUT_ERROR_CAUSES, 16), n)
            .map(OutputErrorCause::from_code)
    }

    /// Unit status word.
    pub fn unit_status(&self) -> UnitStatus {
        let raw = self.field(offsets::UNIT_STATUS, 2);
        UnitStatus(u16::from_be_bytes([raw[0], raw[1]]))
    }

    /// Configuration id.
    pub fn configuration_id(&self) -> u16 {
        let raw = self.field(offsets::CONFIGURATION_ID, 2);
        u16::from_be_bytes([raw[0], raw[1]])
    }

    /// Unit conduction time in hours.
    pub fn conduction_time_hours(&self) -> u32 {
        let raw = self.field(offsets::CONDUCTION_TIME, 4);
        u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]])
    }

    /// Raw 5-byte error log records.
    pub fn error_log(&self) -> impl Iterator<Item = &[u8]> {
        self.field(offsets::ERROR_LOG, LOG_RECORD_LEN * LOG_RECORDS)
            .chunks_exact(LOG_RECORD_LEN)
    }

    /// Raw 5-byte operation log records.
    pub fn operation_log(&self) -> impl Iterator<Item = &[u8]> {
        self.field(offsets::OPERATION_LOG, LOG_RECORD_LEN * LOG_RECORDS)
            .chunks_exact(LOG_RECORD_LEN)
    }
}

// =============================================================================
// Decoded fields
// =============================================================================

/// Cause of a safety input terminal error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputErrorCause {
    /// 0
    None,
    /// 1
    InvalidConfiguration,
    /// 2
    ExternalTestSignalFailure,
    /// 3
    InternalCircuitError,
    /// 4
    DiscrepancyError,
    /// 5
    DualChannelPartnerFailure,
    /// Undocumented code.
    Unknown(u8),
}

impl InputErrorCause {
    /// Decode a cause nibble.
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => InputErrorCause::None,
            1 => InputErrorCause::InvalidConfiguration,
            2 => InputErrorCause::ExternalTestSignalFailure,
            3 => InputErrorCause::InternalCircuitError,
            4 => InputErrorCause::DiscrepancyError,
            5 => InputErrorCause::DualChannelPartnerFailure,
            other => InputErrorCause::Unknown(other),
        }
    }
}

impl std::fmt::Display for InputErrorCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InputErrorCause::None => write!(f, "no error"),
            InputErrorCause::InvalidConfiguration => write!(f, "invalid configuration"),
            InputErrorCause::ExternalTestSignalFailure => write!(f, "external test signal failure"),
            InputErrorCause::InternalCircuitError => write!(f, "internal circuit error"),
            InputErrorCause::DiscrepancyError => write!(f, "discrepancy error"),
            InputErrorCause::DualChannelPartnerFailure => {
                write!(f, "failure of the associated dual-channel input")
            }
            InputErrorCause::Unknown(code) => write!(f, "unknown cause {}", code),
        }
    }
}

/// Cause of a safety output terminal error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputErrorCause {
    /// 0
    None,
    /// 1
    InvalidConfiguration,
    /// 2
    Overcurrent,
    /// 3
    ShortCircuit,
    /// 4
    StuckAtHigh,
    /// 5
    DualChannelPartnerFailure,
    /// 6
    InternalCircuitError,
    /// 8
    DualChannelViolation,
    /// Undocumented code.
    Unknown(u8),
}

impl OutputErrorCause {
    /// Decode a cause nibble.
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => OutputErrorCause::None,
            1 => OutputErrorCause::InvalidConfiguration,
            2 => OutputErrorCause::Overcurrent,
            3 => OutputErrorCause::ShortCircuit,
            4 => OutputErrorCause::StuckAtHigh,
            5 => OutputErrorCause::DualChannelPartnerFailure,
            6 => OutputErrorCause::InternalCircuitError,
            8 => OutputErrorCause::DualChannelViolation,
            other => OutputErrorCause::Unknown(other),
        }
    }
}

/// Unit status word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitStatus(pub u16);

impl UnitStatus {
    fn bit(self, n: u16) -> bool {
        (self.0 >> n) & 1 == 1
    }

    /// Bit 0: overall normal operation.
    pub fn normal_operation(self) -> bool {
        self.bit(0)
    }

    /// Bit 9: output power supply error.
    pub fn output_power_supply_error(self) -> bool {
        self.bit(9)
    }

    /// Bit 10: safety I/O terminal error.
    pub fn safety_io_terminal_error(self) -> bool {
        self.bit(10)
    }

    /// Bit 13: function block error.
    pub fn function_block_error(self) -> bool {
        self.bit(13)
    }

    /// Normal operation with none of the error flags set.
    pub fn is_healthy(self) -> bool {
        self.normal_operation()
            && !self.output_power_supply_error()
            && !self.safety_io_terminal_error()
            && !self.function_block_error()
    }

    /// Names of the error flags currently set.
    pub fn active_errors(self) -> Vec<&'static str> {
        let mut errors = Vec::new();
        if self.output_power_supply_error() {
            errors.push("output power supply error");
        }
        if self.safety_io_terminal_error() {
            errors.push("safety I/O terminal error");
        }
        if self.function_block_error() {
            errors.push("function block error");
        }
        errors
    }
}

// =============================================================================
// Device-side frames
// =============================================================================

/// Field contents for building a normal response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseFields {
    /// Input data flags (6 bytes).
    pub input_data: [u8; 6],
    /// Output data flags (4 bytes).
    pub output_data: [u8; 4],
    /// Input status flags (6 bytes).
    pub input_status: [u8; 6],
    /// Output status flags (4 bytes).
    pub output_status: [u8; 4],
    /// Input error causes (24 bytes).
    pub input_causes: Vec<u8>,
    /// Output error causes (16 bytes).
    pub output_causes: Vec<u8>,
    /// Unit status word.
    pub unit_status: u16,
}

fn seal(frame: &mut Vec<u8>) {
    let sum = additive_checksum(frame);
    frame.extend_from_slice(&sum.to_be_bytes());
    frame.extend_from_slice(&FOOTER);
}

/// Build a normal 199-byte response as the controller would send it.
pub fn encode_normal_response(fields: &ResponseFields) -> Vec<u8> {
    let mut frame = vec![0u8; offsets::CHECKSUM];
    frame[..4].copy_from_slice(&[START_BYTE, 0x00, 0x00, 0xC3]);
    frame[offsets::SERVICE_CODE] = SERVICE_CODE;

    let mut put = |offset: usize, bytes: &[u8], max: usize| {
        let len = bytes.len().min(max);
        frame[offset..offset + len].copy_from_slice(&bytes[..len]);
    };
    put(offsets::INPUT_DATA_FLAGS, &fields.input_data, 6);
    put(offsets::OUTPUT_DATA_FLAGS, &fields.output_data, 4);
    put(offsets::INPUT_STATUS_FLAGS, &fields.input_status, 6);
    put(offsets::OUTPUT_STATUS_FLAGS, &fields.output_status, 4);
    put(offsets::INPUT_ERROR_CAUSES, &fields.input_causes, 24);
    put(offsets::OUTPUT_ERROR_CAUSES, &fields.output_causes, 16);
    put(offsets::UNIT_STATUS, &fields.unit_status.to_be_bytes(), 2);

    seal(&mut frame);
    frame
}

/// Build an error response carrying `end_code`.
pub fn encode_error_response(end_code: u16) -> Vec<u8> {
    let mut frame = vec![START_BYTE, 0x00, 0x00, 0x07];
    frame.extend_from_slice(&end_code.to_be_bytes());
    frame.push(SERVICE_CODE);
    seal(&mut frame);
    frame
}

/// Build a malformed-command response carrying `end_code`.
pub fn encode_malformed_response(end_code: u16) -> Vec<u8> {
    let mut frame = vec![START_BYTE, 0x00, 0x00, 0x06];
    frame.extend_from_slice(&end_code.to_be_bytes());
    seal(&mut frame);
    frame
}

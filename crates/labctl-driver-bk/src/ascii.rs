//! ASCII command codec for the BK Precision 9100 series.
//!
//! Commands are short uppercase mnemonics followed by fixed-width decimal
//! fields and a carriage return. Voltages and currents travel as 4-digit
//! integers in hundredths (`1.00 A` is `0100`). The supply answers with zero
//! or more data lines followed by `OK`, or with a line starting `ERROR`.
//!
//! ```text
//! -> GETD\r
//! <- 050001000\r
//! <- OK\r
//! ```

use labctl_core::error::{InstrumentError, InstrumentResult};
use labctl_core::transport::Transport;
use std::fmt;
use tokio::time::Instant;
use tracing::debug;

/// Line terminator for commands and responses.
pub const TERMINATOR: u8 = b'\r';

/// Largest value a 4-digit hundredths field can carry.
pub const MAX_FIELD_VALUE: f64 = 99.99;

/// Data lines accepted before the `OK` acknowledgement.
const MAX_DATA_LINES: usize = 3;

// =============================================================================
// Numeric fields
// =============================================================================

/// A non-negative quantity in hundredths, as carried by a 4-digit field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Hundredths(u16);

impl Hundredths {
    /// Encode `value` (volts or amps), rounded to the nearest hundredth.
    ///
    /// Negative, non-finite and values that overflow four digits are rejected.
    pub fn from_units(value: f64) -> InstrumentResult<Self> {
        if !value.is_finite() || value < 0.0 {
            return Err(InstrumentError::InvalidParameter(format!(
                "{} cannot be encoded as a 4-digit field",
                value
            )));
        }
        let scaled = (value * 100.0).round();
        if scaled > 9999.0 {
            return Err(InstrumentError::InvalidParameter(format!(
                "{:.2} overflows the 4-digit field (max {:.2})",
                value, MAX_FIELD_VALUE
            )));
        }
        Ok(Self(scaled as u16))
    }

    /// Encode `value`, also rejecting anything above `max`.
    pub fn bounded(value: f64, max: f64, what: &str) -> InstrumentResult<Self> {
        let field = Self::from_units(value)?;
        if field.as_units() > max {
            return Err(InstrumentError::InvalidParameter(format!(
                "{} {:.2} exceeds the configured maximum {:.2}",
                what, value, max
            )));
        }
        Ok(field)
    }

    /// Parse a 4-digit field.
    pub fn parse(field: &str) -> InstrumentResult<Self> {
        if field.len() != 4 || !field.bytes().all(|b| b.is_ascii_digit()) {
            return Err(InstrumentError::MalformedFrame(format!(
                "expected a 4-digit field, got {:?}",
                field
            )));
        }
        field
            .parse::<u16>()
            .map(Self)
            .map_err(|e| InstrumentError::MalformedFrame(format!("field {:?}: {}", field, e)))
    }

    /// Raw scaled integer.
    pub fn raw(self) -> u16 {
        self.0
    }

    /// Value in volts or amps.
    pub fn as_units(self) -> f64 {
        f64::from(self.0) / 100.0
    }
}

impl fmt::Display for Hundredths {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}", self.0)
    }
}

// =============================================================================
// Commands
// =============================================================================

/// A command understood by the supply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// `SOUTx`: enable (1) or disable (0) the output.
    SetOutput(bool),
    /// `GOUT`: output state.
    GetOutput,
    /// `SABCn`: select preset `n`.
    SelectPreset(u8),
    /// `GABC`: selected preset.
    GetPreset,
    /// `VOLTn####`: voltage setting of preset `n`.
    SetVoltage(u8, Hundredths),
    /// `CURRn####`: current setting of preset `n`.
    SetCurrent(u8, Hundredths),
    /// `GETSn`: voltage and current settings of preset `n`.
    GetSettings(u8),
    /// `GETD`: displayed voltage, current and regulation mode.
    GetDisplay,
    /// `SOVP####`: over-voltage protection limit.
    SetOvp(Hundredths),
    /// `GOVP`
    GetOvp,
    /// `SOCP####`: over-current protection limit.
    SetOcp(Hundredths),
    /// `GOCP`
    GetOcp,
}

impl Command {
    /// Command text without the terminator.
    pub fn text(&self) -> String {
        match self {
            Command::SetOutput(on) => format!("SOUT{}", u8::from(*on)),
            Command::GetOutput => "GOUT".to_string(),
            Command::SelectPreset(n) => format!("SABC{}", n),
            Command::GetPreset => "GABC".to_string(),
            Command::SetVoltage(n, v) => format!("VOLT{}{}", n, v),
            Command::SetCurrent(n, a) => format!("CURR{}{}", n, a),
            Command::GetSettings(n) => format!("GETS{}", n),
            Command::GetDisplay => "GETD".to_string(),
            Command::SetOvp(v) => format!("SOVP{}", v),
            Command::GetOvp => "GOVP".to_string(),
            Command::SetOcp(a) => format!("SOCP{}", a),
            Command::GetOcp => "GOCP".to_string(),
        }
    }

    /// Bytes to transmit, terminator included.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut wire = self.text().into_bytes();
        wire.push(TERMINATOR);
        wire
    }
}

// =============================================================================
// Responses
// =============================================================================

/// One response line, classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line {
    /// Acknowledgement closing a response.
    Ok,
    /// Rejection; carries the full line.
    Error(String),
    /// A data line preceding the acknowledgement.
    Data(String),
    /// Whitespace only.
    Empty,
}

/// Classify one raw line (terminator optional).
pub fn classify_line(raw: &[u8]) -> Line {
    let text = String::from_utf8_lossy(raw);
    let text = text.trim();
    if text.is_empty() {
        Line::Empty
    } else if text == "OK" {
        Line::Ok
    } else if text.starts_with("ERROR") {
        Line::Error(text.to_string())
    } else {
        Line::Data(text.to_string())
    }
}

/// Send `command` and collect the data lines of its response.
///
/// The whole response, up to `OK`, must arrive within the transport's budget.
pub async fn exchange(transport: &mut Transport, command: &Command) -> InstrumentResult<Vec<String>> {
    transport.drain().await?;
    transport.write_all(&command.to_wire()).await?;
    debug!(device = %transport.name(), command = %command.text(), "command sent");

    let deadline = Instant::now() + transport.timeout();
    let mut data = Vec::new();
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let raw = transport.read_line_within(TERMINATOR, remaining).await?;
        match classify_line(&raw) {
            Line::Ok => return Ok(data),
            Line::Error(message) => {
                return Err(InstrumentError::Rejected(format!(
                    "{} answered {:?}",
                    command.text(),
                    message
                )))
            }
            Line::Data(line) => {
                data.push(line);
                if data.len() > MAX_DATA_LINES {
                    return Err(InstrumentError::MalformedFrame(format!(
                        "{} produced {} lines without an acknowledgement",
                        command.text(),
                        data.len()
                    )));
                }
            }
            Line::Empty => {}
        }
    }
}

/// The single data line of a query response.
pub fn single_line<'a>(command: &Command, data: &'a [String]) -> InstrumentResult<&'a str> {
    match data {
        [line] => Ok(line.as_str()),
        _ => Err(InstrumentError::MalformedFrame(format!(
            "{} expected one data line, got {}",
            command.text(),
            data.len()
        ))),
    }
}

/// Acknowledgement of a setting command, which carries no data.
pub fn expect_no_data(command: &Command, data: &[String]) -> InstrumentResult<()> {
    if data.is_empty() {
        Ok(())
    } else {
        Err(InstrumentError::MalformedFrame(format!(
            "{} acknowledged with unexpected data {:?}",
            command.text(),
            data
        )))
    }
}

/// Output regulation mode reported by `GETD`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegulationMode {
    /// Constant voltage.
    ConstantVoltage,
    /// Constant current.
    ConstantCurrent,
}

impl RegulationMode {
    /// Channel value: 0.0 CV, 1.0 CC.
    pub fn as_f64(self) -> f64 {
        match self {
            RegulationMode::ConstantVoltage => 0.0,
            RegulationMode::ConstantCurrent => 1.0,
        }
    }
}

/// Parse a `GETD` line: `VVVVIIIIM`.
pub fn parse_display(line: &str) -> InstrumentResult<(f64, f64, RegulationMode)> {
    if line.len() != 9 || !line.is_ascii() {
        return Err(InstrumentError::MalformedFrame(format!(
            "GETD line {:?} is not 9 characters",
            line
        )));
    }
    let volts = Hundredths::parse(&line[..4])?.as_units();
    let amps = Hundredths::parse(&line[4..8])?.as_units();
    let mode = match &line[8..] {
        "0" => RegulationMode::ConstantVoltage,
        "1" => RegulationMode::ConstantCurrent,
        other => {
            return Err(InstrumentError::MalformedFrame(format!(
                "GETD mode flag {:?}",
                other
            )))
        }
    };
    Ok((volts, amps, mode))
}

/// Parse a `GETSn` line: `VVVVIIII`.
pub fn parse_settings(line: &str) -> InstrumentResult<(f64, f64)> {
    if line.len() != 8 || !line.is_ascii() {
        return Err(InstrumentError::MalformedFrame(format!(
            "GETS line {:?} is not 8 characters",
            line
        )));
    }
    Ok((
        Hundredths::parse(&line[..4])?.as_units(),
        Hundredths::parse(&line[4..])?.as_units(),
    ))
}

/// Parse a single-digit flag or preset number.
pub fn parse_digit(line: &str) -> InstrumentResult<u8> {
    match line.as_bytes() {
        [digit] if digit.is_ascii_digit() => Ok(digit - b'0'),
        _ => Err(InstrumentError::MalformedFrame(format!(
            "expected a single digit, got {:?}",
            line
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use labctl_core::error::ErrorClass;
    use labctl_core::mock_serial;
    use labctl_core::serial::SerialSettings;
    use std::time::Duration;

    #[test]
    fn one_amp_is_0100() {
        let field = Hundredths::from_units(1.00).unwrap();
        assert_eq!(field.to_string(), "0100");
        assert_eq!(Hundredths::parse("0100").unwrap().as_units(), 1.00);
    }

    #[test]
    fn encoding_rounds_to_the_nearest_hundredth() {
        assert_eq!(Hundredths::from_units(0.29).unwrap().raw(), 29);
        assert_eq!(Hundredths::from_units(42.2).unwrap().to_string(), "4220");
        assert_eq!(Hundredths::from_units(99.99).unwrap().raw(), 9999);
    }

    #[test]
    fn overflow_and_negative_values_are_rejected() {
        for value in [100.0, 99.996, -0.01, f64::NAN, f64::INFINITY] {
            let err = Hundredths::from_units(value).unwrap_err();
            assert_eq!(err.class(), ErrorClass::Command, "{}", value);
        }
    }

    #[test]
    fn configured_maximum_is_enforced() {
        assert!(Hundredths::bounded(5.0, 5.0, "current").is_ok());
        assert!(matches!(
            Hundredths::bounded(5.01, 5.0, "current"),
            Err(InstrumentError::InvalidParameter(msg)) if msg.contains("current")
        ));
    }

    #[test]
    fn command_text() {
        let v = Hundredths::from_units(5.0).unwrap();
        let a = Hundredths::from_units(1.0).unwrap();
        assert_eq!(Command::SetOutput(true).to_wire(), b"SOUT1\r");
        assert_eq!(Command::SetOutput(false).text(), "SOUT0");
        assert_eq!(Command::SelectPreset(3).text(), "SABC3");
        assert_eq!(Command::SetVoltage(3, v).text(), "VOLT30500");
        assert_eq!(Command::SetCurrent(3, a).text(), "CURR30100");
        assert_eq!(Command::GetSettings(3).text(), "GETS3");
        assert_eq!(Command::SetOvp(Hundredths::from_units(42.2).unwrap()).text(), "SOVP4220");
        assert_eq!(Command::SetOcp(a).text(), "SOCP0100");
        assert_eq!(Command::GetDisplay.to_wire(), b"GETD\r");
    }

    #[test]
    fn line_classification() {
        assert_eq!(classify_line(b"OK\r"), Line::Ok);
        assert_eq!(classify_line(b"\nOK\r"), Line::Ok);
        assert_eq!(classify_line(b"ERROR 2\r"), Line::Error("ERROR 2".into()));
        assert_eq!(classify_line(b"4220\r"), Line::Data("4220".into()));
        assert_eq!(classify_line(b"\r"), Line::Empty);
    }

    #[test]
    fn display_and_settings_parsing() {
        assert_eq!(
            parse_display("050001000").unwrap(),
            (5.0, 1.0, RegulationMode::ConstantVoltage)
        );
        assert_eq!(
            parse_display("120002501").unwrap().2,
            RegulationMode::ConstantCurrent
        );
        assert!(parse_display("05000100").is_err());
        assert!(parse_display("05000100X").is_err());
        assert_eq!(parse_settings("05000100").unwrap(), (5.0, 1.0));
        assert!(parse_settings("0500010").is_err());
        assert_eq!(parse_digit("3").unwrap(), 3);
        assert!(parse_digit("12").is_err());
    }

    fn transport() -> (Transport, mock_serial::MockDeviceHarness) {
        let (port, harness) = mock_serial::new();
        let settings = SerialSettings::new("/dev/ttyUSB2", 9600)
            .with_timeout(Duration::from_millis(200))
            .with_drain_window(Duration::from_millis(1));
        (Transport::with_port("psu", settings, Box::new(port)), harness)
    }

    #[tokio::test]
    async fn exchange_collects_data_until_ok() {
        let (mut transport, mut harness) = transport();
        let task = tokio::spawn(async move { exchange(&mut transport, &Command::GetOvp).await });
        harness.expect_and_respond(b"GOVP\r", b"4220\rOK\r").await;
        assert_eq!(task.await.unwrap().unwrap(), vec!["4220".to_string()]);
    }

    #[tokio::test]
    async fn error_line_is_rejected() {
        let (mut transport, mut harness) = transport();
        let command = Command::SelectPreset(3);
        let task = tokio::spawn(async move { exchange(&mut transport, &command).await });
        harness.expect_and_respond(b"SABC3\r", b"ERROR\r").await;
        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, InstrumentError::Rejected(_)));
    }

    #[tokio::test]
    async fn missing_acknowledgement_times_out() {
        let (mut transport, mut harness) = transport();
        let task = tokio::spawn(async move { exchange(&mut transport, &Command::GetDisplay).await });
        harness.expect_and_respond(b"GETD\r", b"050001000\r").await;
        let err = task.await.unwrap().unwrap_err();
        assert_eq!(err.class(), ErrorClass::Timeout);
    }
}

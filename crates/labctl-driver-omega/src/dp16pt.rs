//! Omega DP16PT (Platinum series) process monitor over Modbus RTU.
//!
//! One RS-485 bus carries several monitor units, each addressed by its slave
//! number. Every poll reads each unit's run mode and, for units in `Run`, the
//! process value as a 32-bit float spread over two holding registers.
//!
//! ## Protocol
//!
//! - 9600-8-N-1, 500 ms response budget
//! - STATUS (0x0240): run mode, 6 = Run, 10 = Fault
//! - PROCESS_VALUE (0x0210): two registers, IEEE-754 float
//! - READING_CONFIG (0x0248): display/decimal format word written at startup

use crate::modbus_rtu::{self, decode_f32, Request, Response, WordOrder};
use labctl_core::error::{InstrumentError, InstrumentResult};
use labctl_core::reading::{ChannelId, Observation, Sample};
use labctl_core::transport::Transport;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

/// Register map used by this driver.
pub mod registers {
    /// Process value, two registers holding an IEEE-754 float.
    pub const PROCESS_VALUE: u16 = 0x0210;
    /// Run mode / status register.
    pub const STATUS: u16 = 0x0240;
    /// Reading configuration (decimal point format).
    pub const READING_CONFIG: u16 = 0x0248;
}

/// Decoded content of the STATUS register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// 0
    Load,
    /// 1
    Idle,
    /// 2
    InputAdjust,
    /// 3
    ControlAdjust,
    /// 4
    Modify,
    /// 5
    Wait,
    /// 6, normal operation.
    Run,
    /// 7
    Standby,
    /// 8
    Stop,
    /// 9
    Pause,
    /// 10, sensor or input fault.
    Fault,
    /// 11
    Shutdown,
    /// 12
    Autotune,
    /// Any other code.
    Other(u16),
}

impl RunMode {
    /// Register value written to put a unit into `Run`.
    pub const RUN_CODE: u16 = 6;

    /// Decode a STATUS register value.
    pub fn from_code(code: u16) -> Self {
        match code {
            0 => RunMode::Load,
            1 => RunMode::Idle,
            2 => RunMode::InputAdjust,
            3 => RunMode::ControlAdjust,
            4 => RunMode::Modify,
            5 => RunMode::Wait,
            6 => RunMode::Run,
            7 => RunMode::Standby,
            8 => RunMode::Stop,
            9 => RunMode::Pause,
            10 => RunMode::Fault,
            11 => RunMode::Shutdown,
            12 => RunMode::Autotune,
            other => RunMode::Other(other),
        }
    }

    /// Only `Run` is a normal operating state.
    pub fn is_running(self) -> bool {
        self == RunMode::Run
    }
}

/// One monitored unit on the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitChannel {
    /// Modbus slave address.
    pub unit: u8,
    /// Display label, e.g. "Chamber Top".
    pub label: String,
}

/// Driver settings.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorSettings {
    /// Units polled, in order.
    pub units: Vec<UnitChannel>,
    /// Half-word order of the process value.
    pub word_order: WordOrder,
    /// Word written to READING_CONFIG at startup.
    pub reading_config: u16,
    /// Lowest physically valid temperature (°C).
    pub min_celsius: f64,
    /// Highest physically valid temperature (°C).
    pub max_celsius: f64,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        let labels = [
            "Solenoid 1",
            "Solenoid 2",
            "Chamber Top",
            "Chamber Bot",
            "Air temp",
            "Unassigned",
        ];
        Self {
            units: labels
                .iter()
                .zip(1u8..)
                .map(|(label, unit)| UnitChannel {
                    unit,
                    label: (*label).to_string(),
                })
                .collect(),
            word_order: WordOrder::LowFirst,
            reading_config: 0x0001,
            min_celsius: -90.0,
            max_celsius: 500.0,
        }
    }
}

/// Multi-unit temperature monitor on one Modbus bus.
#[derive(Debug)]
pub struct TemperatureMonitor {
    transport: Transport,
    settings: MonitorSettings,
}

impl TemperatureMonitor {
    /// Wrap a transport. Nothing is sent until [`TemperatureMonitor::initialize`]
    /// or the first poll.
    pub fn new(transport: Transport, settings: MonitorSettings) -> Self {
        Self {
            transport,
            settings,
        }
    }

    /// Driver settings.
    pub fn settings(&self) -> &MonitorSettings {
        &self.settings
    }

    /// Underlying transport.
    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Mutable access to the transport (open, close, reassign).
    pub fn transport_mut(&mut self) -> &mut Transport {
        &mut self.transport
    }

    // =========================================================================
    // Register access
    // =========================================================================

    async fn read_holding(&mut self, unit: u8, start: u16, count: u16) -> InstrumentResult<Vec<u16>> {
        let request = Request::read_holding(unit, start, count);
        match modbus_rtu::execute(&mut self.transport, &request).await? {
            Response::Registers(registers) => Ok(registers),
            Response::Written { .. } => Err(InstrumentError::MalformedFrame(
                "write acknowledgement in response to a read".to_string(),
            )),
        }
    }

    /// Read the raw STATUS register of `unit`.
    #[instrument(skip(self), fields(device = %self.transport.name()), err)]
    pub async fn read_status(&mut self, unit: u8) -> InstrumentResult<u16> {
        let registers = self.read_holding(unit, registers::STATUS, 1).await?;
        registers
            .first()
            .copied()
            .ok_or_else(|| InstrumentError::MalformedFrame("empty status read".to_string()))
    }

    /// Read the process value of `unit` in °C.
    #[instrument(skip(self), fields(device = %self.transport.name()), err)]
    pub async fn read_process_value(&mut self, unit: u8) -> InstrumentResult<f32> {
        let registers = self.read_holding(unit, registers::PROCESS_VALUE, 2).await?;
        match registers.as_slice() {
            [first, second] => Ok(decode_f32([*first, *second], self.settings.word_order)),
            _ => Err(InstrumentError::MalformedFrame(format!(
                "process value read returned {} registers",
                registers.len()
            ))),
        }
    }

    /// Write one register and report whether the unit acknowledged it.
    ///
    /// Failures are logged, not returned.
    pub async fn write_config(&mut self, unit: u8, register: u16, value: u16) -> bool {
        let request = Request::write_register(unit, register, value);
        match modbus_rtu::execute(&mut self.transport, &request).await {
            Ok(Response::Written { .. }) => {
                debug!(device = %self.transport.name(), unit, register, value, "register written");
                true
            }
            Ok(Response::Registers(_)) => {
                warn!(device = %self.transport.name(), unit, register, "unexpected read response to write");
                false
            }
            Err(e) => {
                warn!(device = %self.transport.name(), unit, register, value, error = %e, "register write failed");
                false
            }
        }
    }

    /// Write the reading configuration and run mode to every unit.
    ///
    /// A unit that does not confirm is still polled; misconfiguration then
    /// surfaces as status or value errors.
    pub async fn initialize(&mut self) {
        let units: Vec<u8> = self.settings.units.iter().map(|u| u.unit).collect();
        let reading_config = self.settings.reading_config;
        let mut configured = 0usize;
        for unit in &units {
            let config_ok = self
                .write_config(*unit, registers::READING_CONFIG, reading_config)
                .await;
            let run_ok = self
                .write_config(*unit, registers::STATUS, RunMode::RUN_CODE)
                .await;
            if config_ok && run_ok {
                configured += 1;
            }
        }
        info!(device = %self.transport.name(), configured, total = units.len(), "process monitor initialized");
    }

    // =========================================================================
    // Polling
    // =========================================================================

    /// Classify a unit's status and process value.
    ///
    /// A unit not in `Run` is a sensor error whatever its process value.
    pub fn classify(&self, status: u16, value: f32) -> Observation {
        let mode = RunMode::from_code(status);
        if !mode.is_running() {
            return Observation::SensorError(format!("run mode {:?} (status {})", mode, status));
        }
        let value = f64::from(value);
        if value.is_finite() && (self.settings.min_celsius..=self.settings.max_celsius).contains(&value) {
            Observation::Value(value)
        } else {
            Observation::OutOfRange(value)
        }
    }

    async fn poll_unit(&mut self, unit: u8) -> InstrumentResult<Observation> {
        let status = self.read_status(unit).await?;
        if !RunMode::from_code(status).is_running() {
            return Ok(self.classify(status, f32::NAN));
        }
        let value = self.read_process_value(unit).await?;
        Ok(self.classify(status, value))
    }

    /// Poll every configured unit.
    ///
    /// A unit that fails to answer yields `Observation::Fault` for its channel
    /// only. The poll as a whole fails when the link itself breaks or no unit
    /// answers at all.
    pub async fn poll(&mut self) -> InstrumentResult<Vec<Sample>> {
        let units: Vec<u8> = self.settings.units.iter().map(|u| u.unit).collect();
        let mut samples = Vec::with_capacity(units.len());
        let mut last_error = None;

        for unit in units {
            match self.poll_unit(unit).await {
                Ok(observation) => samples.push(Sample::new(ChannelId::Unit(unit), observation)),
                Err(e) if e.is_link_fatal() => return Err(e),
                Err(e) => {
                    debug!(device = %self.transport.name(), unit, error = %e, "unit poll failed");
                    samples.push(Sample::new(ChannelId::Unit(unit), Observation::Fault(e.class())));
                    last_error = Some(e);
                }
            }
        }

        let all_failed = samples
            .iter()
            .all(|s| matches!(s.observation, Observation::Fault(_)));
        match last_error {
            Some(e) if all_failed => Err(e),
            _ => Ok(samples),
        }
    }

    /// Channels this driver reports, with their labels.
    pub fn channels(&self) -> Vec<(ChannelId, String)> {
        self.settings
            .units
            .iter()
            .map(|u| (ChannelId::Unit(u.unit), u.label.clone()))
            .collect()
    }

    /// Close the transport.
    pub async fn close(&mut self) {
        self.transport.close().await;
    }
}

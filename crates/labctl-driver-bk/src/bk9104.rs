//! BK Precision 9104 programmable power supply.
//!
//! The supply keeps three presets; this deployment drives a single working
//! preset (3 by default). Setpoint and protection writes are only sent while
//! that preset is selected and the output is off. Turning the output on first
//! checks the working preset's voltage against the OVP limit.
//!
//! ## Protocol
//!
//! - 9600-8-N-1, CR-terminated ASCII, 500 ms response budget
//! - see [`crate::ascii`] for the command set and field encoding

use crate::ascii::{self, Command, Hundredths, RegulationMode};
use labctl_core::error::{ErrorClass, InstrumentError, InstrumentResult};
use labctl_core::reading::{ChannelId, Observation, PresetQuantity, Sample};
use labctl_core::transport::Transport;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Presets the supply exposes.
pub const PRESET_SLOTS: std::ops::RangeInclusive<u8> = 1..=3;

/// `GETD` reads attempted before an unreadable display fails the poll.
pub const DISPLAY_READ_ATTEMPTS: u32 = 3;

const DISPLAY_RETRY_PAUSE: Duration = Duration::from_millis(50);

/// Displayed voltages below this read as zero.
const ZERO_VOLTS: f64 = 0.001;

/// Supply limits and deployment choices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupplySettings {
    /// Preset every setpoint write goes to.
    pub working_preset: u8,
    /// Largest voltage accepted for setpoints and OVP, in volts.
    pub max_voltage: f64,
    /// Largest current accepted for setpoints and OCP, in amps.
    pub max_current: f64,
    /// Load resistance used to clamp the reported current, if known.
    pub load_resistance_ohms: Option<f64>,
}

impl Default for SupplySettings {
    fn default() -> Self {
        Self {
            working_preset: 3,
            max_voltage: 84.0,
            max_current: 5.0,
            load_resistance_ohms: None,
        }
    }
}

/// Output measurement from `GETD`, after clamping.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LiveReading {
    /// Output voltage in volts.
    pub volts: f64,
    /// Output current in amps.
    pub amps: f64,
    /// Regulation mode.
    pub mode: RegulationMode,
}

/// Driver for one 9104 supply.
#[derive(Debug)]
pub struct PowerSupply {
    transport: Transport,
    settings: SupplySettings,
    selected_preset: Option<u8>,
    output_enabled: Option<bool>,
    current_limit: Option<f64>,
}

impl PowerSupply {
    /// Wrap a transport. State is unknown until [`PowerSupply::initialize`].
    pub fn new(transport: Transport, settings: SupplySettings) -> Self {
        Self {
            transport,
            settings,
            selected_preset: None,
            output_enabled: None,
            current_limit: None,
        }
    }

    /// Driver settings.
    pub fn settings(&self) -> &SupplySettings {
        &self.settings
    }

    /// Underlying transport.
    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Mutable access to the transport.
    pub fn transport_mut(&mut self) -> &mut Transport {
        &mut self.transport
    }

    /// Last known preset selection.
    pub fn selected_preset(&self) -> Option<u8> {
        self.selected_preset
    }

    /// Last known output state.
    pub fn output_enabled(&self) -> Option<bool> {
        self.output_enabled
    }

    async fn send(&mut self, command: Command) -> InstrumentResult<Vec<String>> {
        ascii::exchange(&mut self.transport, &command).await
    }

    async fn set(&mut self, command: Command) -> InstrumentResult<()> {
        let data = self.send(command).await?;
        ascii::expect_no_data(&command, &data)
    }

    async fn query(&mut self, command: Command) -> InstrumentResult<String> {
        let data = self.send(command).await?;
        ascii::single_line(&command, &data).map(str::to_string)
    }

    // =========================================================================
    // State synchronization
    // =========================================================================

    /// Read back output state and preset selection.
    #[instrument(skip(self), fields(device = %self.transport.name()), err)]
    pub async fn initialize(&mut self) -> InstrumentResult<()> {
        let output = self.get_output().await?;
        let preset = self.get_preset().await?;
        if preset != self.settings.working_preset {
            warn!(
                device = %self.transport.name(),
                preset,
                working = self.settings.working_preset,
                "working preset not selected, setpoint writes refused until it is"
            );
        }
        info!(device = %self.transport.name(), output, preset, "power supply initialized");
        Ok(())
    }

    /// `GOUT`
    pub async fn get_output(&mut self) -> InstrumentResult<bool> {
        let line = self.query(Command::GetOutput).await?;
        let on = match ascii::parse_digit(&line)? {
            0 => false,
            1 => true,
            other => {
                return Err(InstrumentError::MalformedFrame(format!(
                    "GOUT returned {}",
                    other
                )))
            }
        };
        self.output_enabled = Some(on);
        Ok(on)
    }

    /// `GABC`
    pub async fn get_preset(&mut self) -> InstrumentResult<u8> {
        let line = self.query(Command::GetPreset).await?;
        let preset = ascii::parse_digit(&line)?;
        if !PRESET_SLOTS.contains(&preset) {
            return Err(InstrumentError::MalformedFrame(format!(
                "GABC returned preset {}",
                preset
            )));
        }
        self.selected_preset = Some(preset);
        Ok(preset)
    }

    // =========================================================================
    // Operator commands
    // =========================================================================

    /// Select preset `n` (`SABCn`).
    #[instrument(skip(self), fields(device = %self.transport.name()), err)]
    pub async fn set_preset(&mut self, n: u8) -> InstrumentResult<()> {
        if !PRESET_SLOTS.contains(&n) {
            return Err(InstrumentError::InvalidParameter(format!(
                "preset {} outside 1..=3",
                n
            )));
        }
        self.set(Command::SelectPreset(n)).await?;
        self.selected_preset = Some(n);
        Ok(())
    }

    /// Setpoint writes need the working preset selected and the output off.
    fn check_writable(&self, preset: u8) -> InstrumentResult<()> {
        let working = self.settings.working_preset;
        if preset != working {
            return Err(InstrumentError::InvalidParameter(format!(
                "preset {} is not the working preset {}",
                preset, working
            )));
        }
        if self.selected_preset != Some(working) {
            return Err(InstrumentError::InvalidParameter(format!(
                "working preset {} is not selected (selected: {:?})",
                working, self.selected_preset
            )));
        }
        if self.output_enabled != Some(false) {
            warn!(device = %self.transport.name(), "setpoint write refused, output enabled or unknown");
            return Err(InstrumentError::Unsafe(
                "output must be off to change setpoints".to_string(),
            ));
        }
        Ok(())
    }

    /// `VOLTn####`. The voltage must not exceed the OVP limit.
    #[instrument(skip(self), fields(device = %self.transport.name()), err)]
    pub async fn set_voltage(&mut self, preset: u8, volts: f64) -> InstrumentResult<()> {
        let field = Hundredths::bounded(volts, self.settings.max_voltage, "voltage")?;
        self.check_writable(preset)?;
        let ovp = self.get_ovp().await?;
        if field.as_units() > ovp {
            return Err(InstrumentError::InvalidParameter(format!(
                "voltage {:.2} V above OVP {:.2} V",
                field.as_units(),
                ovp
            )));
        }
        self.set(Command::SetVoltage(preset, field)).await?;
        info!(device = %self.transport.name(), preset, volts = field.as_units(), "voltage set");
        Ok(())
    }

    /// `CURRn####`
    #[instrument(skip(self), fields(device = %self.transport.name()), err)]
    pub async fn set_current(&mut self, preset: u8, amps: f64) -> InstrumentResult<()> {
        let field = Hundredths::bounded(amps, self.settings.max_current, "current")?;
        self.check_writable(preset)?;
        self.set(Command::SetCurrent(preset, field)).await?;
        self.current_limit = Some(field.as_units());
        info!(device = %self.transport.name(), preset, amps = field.as_units(), "current set");
        Ok(())
    }

    /// `SOVP####`
    #[instrument(skip(self), fields(device = %self.transport.name()), err)]
    pub async fn set_ovp(&mut self, volts: f64) -> InstrumentResult<()> {
        let field = Hundredths::bounded(volts, self.settings.max_voltage, "OVP")?;
        self.check_writable(self.settings.working_preset)?;
        self.set(Command::SetOvp(field)).await
    }

    /// `SOCP####`
    #[instrument(skip(self), fields(device = %self.transport.name()), err)]
    pub async fn set_ocp(&mut self, amps: f64) -> InstrumentResult<()> {
        let field = Hundredths::bounded(amps, self.settings.max_current, "OCP")?;
        self.check_writable(self.settings.working_preset)?;
        self.set(Command::SetOcp(field)).await
    }

    /// `GOVP`, in volts.
    pub async fn get_ovp(&mut self) -> InstrumentResult<f64> {
        let line = self.query(Command::GetOvp).await?;
        Ok(Hundredths::parse(&line)?.as_units())
    }

    /// `GOCP`, in amps.
    pub async fn get_ocp(&mut self) -> InstrumentResult<f64> {
        let line = self.query(Command::GetOcp).await?;
        Ok(Hundredths::parse(&line)?.as_units())
    }

    /// `GETSn`: (volts, amps) settings of a preset.
    pub async fn get_settings(&mut self, preset: u8) -> InstrumentResult<(f64, f64)> {
        if !PRESET_SLOTS.contains(&preset) {
            return Err(InstrumentError::InvalidParameter(format!(
                "preset {} outside 1..=3",
                preset
            )));
        }
        let line = self.query(Command::GetSettings(preset)).await?;
        let (volts, amps) = ascii::parse_settings(&line)?;
        if preset == self.settings.working_preset {
            self.current_limit = Some(amps);
        }
        debug!(device = %self.transport.name(), preset, volts, amps, "preset settings");
        Ok((volts, amps))
    }

    /// `SOUTx`. Enabling refuses when the working preset's voltage exceeds OVP.
    #[instrument(skip(self), fields(device = %self.transport.name()), err)]
    pub async fn set_output(&mut self, on: bool) -> InstrumentResult<()> {
        if on {
            let (volts, _) = self.get_settings(self.settings.working_preset).await?;
            let ovp = self.get_ovp().await?;
            if volts > ovp {
                warn!(device = %self.transport.name(), volts, ovp, "output enable refused, voltage above OVP");
                return Err(InstrumentError::Unsafe(format!(
                    "preset voltage {:.2} V above OVP {:.2} V",
                    volts, ovp
                )));
            }
        }
        self.set(Command::SetOutput(on)).await?;
        self.output_enabled = Some(on);
        info!(device = %self.transport.name(), on, "output switched");
        Ok(())
    }

    // =========================================================================
    // Polling
    // =========================================================================

    /// `GETD`, clamped to what the output can actually deliver.
    ///
    /// An unreadable display line is retried up to [`DISPLAY_READ_ATTEMPTS`]
    /// times; a missing response fails at once. The supply occasionally shows
    /// 0 V with the output on, so such a reading is taken a second time and
    /// the second read wins when it is non-zero.
    ///
    /// With the output off both values read zero. With it on, the current is
    /// limited by the commanded current and, when a load resistance is
    /// configured, by V/R.
    #[instrument(skip(self), fields(device = %self.transport.name()), err)]
    pub async fn get_live_reading(&mut self) -> InstrumentResult<LiveReading> {
        let mut attempt = 1;
        let (mut volts, mut amps, mut mode) = loop {
            match self.read_display().await {
                Ok(display) => break display,
                Err(e)
                    if e.class() == ErrorClass::MalformedFrame
                        && attempt < DISPLAY_READ_ATTEMPTS =>
                {
                    warn!(device = %self.transport.name(), attempt, error = %e, "unreadable display, retrying");
                    attempt += 1;
                    tokio::time::sleep(DISPLAY_RETRY_PAUSE).await;
                }
                Err(e) => return Err(e),
            }
        };

        if volts.abs() < ZERO_VOLTS && self.output_enabled == Some(true) {
            match self.read_display().await {
                Ok((v, a, m)) if v.abs() >= ZERO_VOLTS => {
                    debug!(device = %self.transport.name(), volts = v, "zero-volt display replaced by second read");
                    (volts, amps, mode) = (v, a, m);
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(device = %self.transport.name(), error = %e, "second display read failed, keeping the first");
                }
            }
        }
        Ok(self.clamp(volts, amps, mode))
    }

    async fn read_display(&mut self) -> InstrumentResult<(f64, f64, RegulationMode)> {
        let line = self.query(Command::GetDisplay).await?;
        ascii::parse_display(&line)
    }

    fn clamp(&self, volts: f64, amps: f64, mode: RegulationMode) -> LiveReading {
        if self.output_enabled != Some(true) {
            return LiveReading {
                volts: 0.0,
                amps: 0.0,
                mode,
            };
        }
        let mut amps = amps;
        if let Some(limit) = self.current_limit {
            amps = amps.min(limit);
        }
        if let Some(ohms) = self.settings.load_resistance_ohms.filter(|r| *r > 0.0) {
            amps = amps.min(volts / ohms);
        }
        LiveReading { volts, amps, mode }
    }

    /// Classify a live reading onto the working preset's channels.
    pub fn classify(&self, reading: &LiveReading) -> Vec<Sample> {
        let slot = self.settings.working_preset;
        let bounded = |value: f64, max: f64| {
            if (0.0..=max).contains(&value) {
                Observation::Value(value)
            } else {
                Observation::OutOfRange(value)
            }
        };
        vec![
            Sample::new(
                ChannelId::Preset {
                    slot,
                    quantity: PresetQuantity::Voltage,
                },
                bounded(reading.volts, self.settings.max_voltage),
            ),
            Sample::new(
                ChannelId::Preset {
                    slot,
                    quantity: PresetQuantity::Current,
                },
                bounded(reading.amps, self.settings.max_current),
            ),
            Sample::new(
                ChannelId::Preset {
                    slot,
                    quantity: PresetQuantity::RegulationMode,
                },
                Observation::Value(reading.mode.as_f64()),
            ),
        ]
    }

    /// Refresh the output state and read the display.
    pub async fn poll(&mut self) -> InstrumentResult<Vec<Sample>> {
        self.get_output().await?;
        let reading = self.get_live_reading().await?;
        Ok(self.classify(&reading))
    }

    /// Channels this driver reports, with their labels.
    pub fn channels(&self) -> Vec<(ChannelId, String)> {
        let slot = self.settings.working_preset;
        [
            (PresetQuantity::Voltage, "Voltage"),
            (PresetQuantity::Current, "Current"),
            (PresetQuantity::RegulationMode, "Mode"),
        ]
        .into_iter()
        .map(|(quantity, label)| (ChannelId::Preset { slot, quantity }, label.to_string()))
        .collect()
    }

    /// Close the transport.
    pub async fn close(&mut self) {
        self.transport.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use labctl_core::mock_serial::{self, MockDeviceHarness};
    use labctl_core::serial::SerialSettings;
    use std::time::Duration;

    fn supply(settings: SupplySettings) -> (PowerSupply, MockDeviceHarness) {
        let (port, harness) = mock_serial::new();
        let serial = SerialSettings::new("/dev/ttyUSB2", 9600)
            .with_timeout(Duration::from_millis(200))
            .with_drain_window(Duration::from_millis(1));
        let transport = Transport::with_port("psu", serial, Box::new(port));
        (PowerSupply::new(transport, settings), harness)
    }

    async fn initialized(
        settings: SupplySettings,
        output: &[u8],
        preset: &[u8],
    ) -> (PowerSupply, MockDeviceHarness) {
        let (mut psu, mut harness) = supply(settings);
        let init = tokio::spawn(async move {
            psu.initialize().await.unwrap();
            psu
        });
        harness.expect_and_respond(b"GOUT\r", output).await;
        harness.expect_and_respond(b"GABC\r", preset).await;
        (init.await.unwrap(), harness)
    }

    #[tokio::test]
    async fn initialize_syncs_output_and_preset() {
        let (psu, _harness) =
            initialized(SupplySettings::default(), b"0\rOK\r", b"3\rOK\r").await;
        assert_eq!(psu.output_enabled(), Some(false));
        assert_eq!(psu.selected_preset(), Some(3));
    }

    #[tokio::test]
    async fn set_current_sends_hundredths() {
        let (mut psu, mut harness) =
            initialized(SupplySettings::default(), b"0\rOK\r", b"3\rOK\r").await;
        let task = tokio::spawn(async move { psu.set_current(3, 1.0).await });
        harness.expect_and_respond(b"CURR30100\r", b"OK\r").await;
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn set_voltage_checks_ovp_first() {
        let (mut psu, mut harness) =
            initialized(SupplySettings::default(), b"0\rOK\r", b"3\rOK\r").await;
        let task = tokio::spawn(async move {
            let first = psu.set_voltage(3, 5.0).await;
            let second = psu.set_voltage(3, 50.0).await;
            (first, second)
        });
        harness.expect_and_respond(b"GOVP\r", b"4220\rOK\r").await;
        harness.expect_and_respond(b"VOLT30500\r", b"OK\r").await;
        harness.expect_and_respond(b"GOVP\r", b"4220\rOK\r").await;
        let (first, second) = task.await.unwrap();
        assert!(first.is_ok());
        assert!(matches!(second, Err(InstrumentError::InvalidParameter(msg)) if msg.contains("OVP")));
    }

    #[tokio::test]
    async fn values_beyond_configured_max_never_reach_the_wire() {
        let (mut psu, mut harness) =
            initialized(SupplySettings::default(), b"0\rOK\r", b"3\rOK\r").await;
        let err = psu.set_current(3, 5.5).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Command);
        let err = psu.set_ovp(120.0).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Command);
        harness.drain_writes().await;
    }

    #[tokio::test]
    async fn writes_refused_with_output_enabled() {
        let (mut psu, _harness) =
            initialized(SupplySettings::default(), b"1\rOK\r", b"3\rOK\r").await;
        let err = psu.set_current(3, 1.0).await.unwrap_err();
        assert!(matches!(err, InstrumentError::Unsafe(_)));
    }

    #[tokio::test]
    async fn writes_refused_off_the_working_preset() {
        let (mut psu, _harness) =
            initialized(SupplySettings::default(), b"0\rOK\r", b"1\rOK\r").await;
        assert!(psu.set_current(3, 1.0).await.is_err());
        assert!(psu.set_current(1, 1.0).await.is_err());
    }

    #[tokio::test]
    async fn set_preset_selects_and_unlocks_writes() {
        let (mut psu, mut harness) =
            initialized(SupplySettings::default(), b"0\rOK\r", b"1\rOK\r").await;
        let task = tokio::spawn(async move {
            psu.set_preset(3).await.unwrap();
            psu.set_ocp(2.5).await
        });
        harness.expect_and_respond(b"SABC3\r", b"OK\r").await;
        harness.expect_and_respond(b"SOCP0250\r", b"OK\r").await;
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn output_enable_refused_above_ovp() {
        let (mut psu, mut harness) =
            initialized(SupplySettings::default(), b"0\rOK\r", b"3\rOK\r").await;
        let task = tokio::spawn(async move {
            let result = psu.set_output(true).await;
            (result, psu.output_enabled())
        });
        harness.expect_and_respond(b"GETS3\r", b"45000100\rOK\r").await;
        harness.expect_and_respond(b"GOVP\r", b"4220\rOK\r").await;
        let (result, output) = task.await.unwrap();
        assert!(matches!(result, Err(InstrumentError::Unsafe(_))));
        assert_eq!(output, Some(false));
    }

    #[tokio::test]
    async fn output_enable_then_live_reading_clamped() {
        let settings = SupplySettings {
            load_resistance_ohms: Some(10.0),
            ..SupplySettings::default()
        };
        let (mut psu, mut harness) = initialized(settings, b"0\rOK\r", b"3\rOK\r").await;
        let task = tokio::spawn(async move {
            psu.set_output(true).await.unwrap();
            psu.poll().await
        });
        harness.expect_and_respond(b"GETS3\r", b"05000100\rOK\r").await;
        harness.expect_and_respond(b"GOVP\r", b"4220\rOK\r").await;
        harness.expect_and_respond(b"SOUT1\r", b"OK\r").await;
        harness.expect_and_respond(b"GOUT\r", b"1\rOK\r").await;
        // 5 V across 10 ohms caps the 2 A display at 0.5 A
        harness.expect_and_respond(b"GETD\r", b"050002001\rOK\r").await;

        let samples = task.await.unwrap().unwrap();
        assert_eq!(samples[0].observation, Observation::Value(5.0));
        assert_eq!(samples[1].observation, Observation::Value(0.5));
        assert_eq!(samples[2].observation, Observation::Value(1.0));
    }

    #[tokio::test]
    async fn output_off_reads_zero() {
        let (mut psu, mut harness) =
            initialized(SupplySettings::default(), b"0\rOK\r", b"3\rOK\r").await;
        let task = tokio::spawn(async move { psu.poll().await });
        harness.expect_and_respond(b"GOUT\r", b"0\rOK\r").await;
        harness.expect_and_respond(b"GETD\r", b"050001000\rOK\r").await;
        let samples = task.await.unwrap().unwrap();
        assert_eq!(samples[0].observation, Observation::Value(0.0));
        assert_eq!(samples[1].observation, Observation::Value(0.0));
        assert_eq!(samples[2].observation, Observation::Value(0.0));
    }

    #[tokio::test]
    async fn unreadable_display_is_retried() {
        let (mut psu, mut harness) =
            initialized(SupplySettings::default(), b"1\rOK\r", b"3\rOK\r").await;
        let task = tokio::spawn(async move { psu.get_live_reading().await });
        harness.expect_and_respond(b"GETD\r", b"05#0\rOK\r").await;
        harness.expect_and_respond(b"GETD\r", b"ERROR\r").await;
        harness.expect_and_respond(b"GETD\r", b"120001500\rOK\r").await;

        let reading = task.await.unwrap().unwrap();
        assert_eq!(reading.volts, 12.0);
        assert_eq!(reading.amps, 1.5);
        assert_eq!(reading.mode, RegulationMode::ConstantVoltage);
    }

    #[tokio::test]
    async fn display_gives_up_after_three_attempts() {
        let (mut psu, mut harness) =
            initialized(SupplySettings::default(), b"1\rOK\r", b"3\rOK\r").await;
        let task = tokio::spawn(async move { psu.get_live_reading().await });
        for _ in 0..DISPLAY_READ_ATTEMPTS {
            harness.expect_and_respond(b"GETD\r", b"garbage\rOK\r").await;
        }

        let err = task.await.unwrap().unwrap_err();
        assert_eq!(err.class(), ErrorClass::MalformedFrame);
        harness.drain_writes().await;
    }

    #[tokio::test]
    async fn silent_display_is_not_retried() {
        let (mut psu, mut harness) =
            initialized(SupplySettings::default(), b"1\rOK\r", b"3\rOK\r").await;
        let task = tokio::spawn(async move { psu.get_live_reading().await });
        harness.expect_write(b"GETD\r").await;

        let err = task.await.unwrap().unwrap_err();
        assert_eq!(err.class(), ErrorClass::Timeout);
        harness.drain_writes().await;
    }

    #[tokio::test]
    async fn zero_volt_display_is_read_again() {
        let (mut psu, mut harness) =
            initialized(SupplySettings::default(), b"1\rOK\r", b"3\rOK\r").await;
        let task = tokio::spawn(async move {
            let replaced = psu.get_live_reading().await.unwrap();
            let kept = psu.get_live_reading().await.unwrap();
            (replaced, kept)
        });
        harness.expect_and_respond(b"GETD\r", b"000000000\rOK\r").await;
        harness.expect_and_respond(b"GETD\r", b"240002001\rOK\r").await;
        harness.expect_and_respond(b"GETD\r", b"000000000\rOK\r").await;
        harness.expect_and_respond(b"GETD\r", b"000000000\rOK\r").await;

        let (replaced, kept) = task.await.unwrap();
        assert_eq!(replaced.volts, 24.0);
        assert_eq!(replaced.amps, 2.0);
        assert_eq!(replaced.mode, RegulationMode::ConstantCurrent);
        assert_eq!(kept.volts, 0.0);
    }

    #[test]
    fn readings_above_max_are_out_of_range() {
        let (psu, _harness) = supply(SupplySettings::default());
        let samples = psu.classify(&LiveReading {
            volts: 90.0,
            amps: 1.0,
            mode: RegulationMode::ConstantVoltage,
        });
        assert_eq!(samples[0].observation, Observation::OutOfRange(90.0));
        assert_eq!(samples[1].observation, Observation::Value(1.0));
        assert_eq!(
            samples[0].channel,
            ChannelId::Preset {
                slot: 3,
                quantity: PresetQuantity::Voltage
            }
        );
    }
}

//! Omron G9SP safety controller as an interlock source.
//!
//! Each poll sends the fixed request and reads one status frame. The frame is
//! interpreted against the configured interlock map: every logical interlock
//! is one safety input or a dual-channel pair of inputs, and its status is the
//! AND of its inputs' status bits.

use crate::g9sp_frame::{self, SafetyFrame, POLL_REQUEST, RESPONSE_PREFIX_LEN};
use labctl_core::error::{InstrumentError, InstrumentResult};
use labctl_core::reading::{ChannelId, Observation, Sample};
use labctl_core::transport::Transport;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, instrument};

/// A logical interlock backed by one or two safety inputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interlock {
    /// Display name.
    pub name: String,
    /// Safety input terminal indices (one, or two for dual-channel).
    pub inputs: Vec<u8>,
}

impl Interlock {
    /// Single-input interlock.
    pub fn single(name: impl Into<String>, input: u8) -> Self {
        Self {
            name: name.into(),
            inputs: vec![input],
        }
    }

    /// Dual-channel interlock.
    pub fn dual(name: impl Into<String>, a: u8, b: u8) -> Self {
        Self {
            name: name.into(),
            inputs: vec![a, b],
        }
    }
}

/// Controller layout and interlock map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerSettings {
    /// Configured safety input terminals.
    pub input_count: u8,
    /// Configured safety output terminals.
    pub output_count: u8,
    /// Output terminal whose data AND status means the controller is active.
    pub active_output: u8,
    /// Logical interlocks, in display order.
    pub interlocks: Vec<Interlock>,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            input_count: 13,
            output_count: 7,
            active_output: 4,
            interlocks: vec![
                Interlock::dual("Vacuum", 0, 1),
                Interlock::dual("Water", 2, 3),
                Interlock::dual("Door", 4, 5),
                Interlock::single("Timer", 6),
                Interlock::single("Oil High", 7),
                Interlock::single("Oil Low", 8),
                Interlock::dual("E-stop Ext", 9, 10),
                Interlock::dual("E-stop Int", 11, 12),
            ],
        }
    }
}

/// Interlock source backed by a G9SP controller.
#[derive(Debug)]
pub struct InterlockController {
    transport: Transport,
    settings: ControllerSettings,
    last_frame: Option<SafetyFrame>,
}

impl InterlockController {
    /// Wrap a transport configured for 8-E-1.
    pub fn new(transport: Transport, settings: ControllerSettings) -> Self {
        Self {
            transport,
            settings,
            last_frame: None,
        }
    }

    /// Controller layout and interlock map.
    pub fn settings(&self) -> &ControllerSettings {
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

    /// Most recent valid frame.
    pub fn last_frame(&self) -> Option<&SafetyFrame> {
        self.last_frame.as_ref()
    }

    /// Exchange one request/response pair.
    ///
    /// The whole response must arrive within the transport's budget (300 ms
    /// for this controller); otherwise the poll fails with a timeout.
    #[instrument(skip(self), fields(device = %self.transport.name()), err)]
    pub async fn poll(&mut self) -> InstrumentResult<SafetyFrame> {
        self.transport.drain().await?;
        self.transport.write_all(&POLL_REQUEST).await?;

        let deadline = Instant::now() + self.transport.timeout();
        let remaining = || deadline.saturating_duration_since(Instant::now());

        let mut bytes = self
            .transport
            .read_exact_within(RESPONSE_PREFIX_LEN, remaining())
            .await?;
        let kind = g9sp_frame::parse_prefix(&bytes)?;
        let rest = self
            .transport
            .read_exact_within(kind.frame_len() - RESPONSE_PREFIX_LEN, remaining())
            .await?;
        bytes.extend_from_slice(&rest);

        let frame = g9sp_frame::parse_response(&bytes)?;
        self.last_frame = Some(frame.clone());
        Ok(frame)
    }

    /// Poll and interpret in one step.
    pub async fn poll_samples(&mut self) -> InstrumentResult<Vec<Sample>> {
        let frame = self.poll().await?;
        Ok(self.interpret(&frame))
    }

    /// Turn a frame into per-channel observations.
    ///
    /// Interlocks read 1.0 when every input is ON and 0.0 otherwise; an
    /// interlock with any input status bit in error is a sensor error.
    pub fn interpret(&self, frame: &SafetyFrame) -> Vec<Sample> {
        let mut samples = Vec::with_capacity(self.settings.interlocks.len() + 2);

        for (index, interlock) in self.settings.interlocks.iter().enumerate() {
            let channel = ChannelId::Interlock(index as u8);
            let inputs = self.readable_inputs(interlock);
            if inputs.is_empty() {
                continue;
            }

            let closed = inputs
                .iter()
                .all(|&n| frame.input_data(n).unwrap_or(false));
            let faults: Vec<String> = inputs
                .iter()
                .filter(|&&n| !frame.input_status(n).unwrap_or(false))
                .map(|&n| match frame.input_error_cause(n) {
                    Some(cause) => format!("input {}: {}", n, cause),
                    None => format!("input {}", n),
                })
                .collect();

            let observation = if faults.is_empty() {
                Observation::Value(if closed { 1.0 } else { 0.0 })
            } else {
                debug!(interlock = %interlock.name, faults = ?faults, "interlock input error");
                Observation::SensorError(format!("{}: {}", interlock.name, faults.join(", ")))
            };
            samples.push(Sample::new(channel, observation));
        }

        let active_output = usize::from(self.settings.active_output);
        if active_output < usize::from(self.settings.output_count) {
            let active = frame.output_data(active_output).unwrap_or(false)
                && frame.output_status(active_output).unwrap_or(false);
            samples.push(Sample::new(
                ChannelId::ControllerActive,
                Observation::Value(if active { 1.0 } else { 0.0 }),
            ));
        }

        let status = frame.unit_status();
        let observation = if status.is_healthy() {
            Observation::Value(f64::from(status.0))
        } else if !status.normal_operation() && status.active_errors().is_empty() {
            Observation::SensorError("unit not in normal operation".to_string())
        } else {
            Observation::SensorError(status.active_errors().join(", "))
        };
        samples.push(Sample::new(ChannelId::UnitStatus, observation));

        samples
    }

    /// Inputs of `interlock` inside the configured terminal range. Bits past
    /// it are reserved and never read.
    fn readable_inputs(&self, interlock: &Interlock) -> Vec<usize> {
        let input_count = usize::from(self.settings.input_count);
        interlock
            .inputs
            .iter()
            .map(|&n| usize::from(n))
            .filter(|&n| n < input_count)
            .collect()
    }

    /// Channels this driver reports, with their labels. Interlocks with no
    /// readable input are left out, as [`InterlockController::interpret`]
    /// never samples them.
    pub fn channels(&self) -> Vec<(ChannelId, String)> {
        let mut channels: Vec<(ChannelId, String)> = self
            .settings
            .interlocks
            .iter()
            .enumerate()
            .filter(|(_, interlock)| !self.readable_inputs(interlock).is_empty())
            .map(|(index, interlock)| (ChannelId::Interlock(index as u8), interlock.name.clone()))
            .collect();
        if self.settings.active_output < self.settings.output_count {
            channels.push((ChannelId::ControllerActive, "G9SP Active".to_string()));
        }
        channels.push((ChannelId::UnitStatus, "Unit Status".to_string()));
        channels
    }

    /// Close the transport.
    pub async fn close(&mut self) {
        self.transport.close().await;
    }
}

/// Check that the interlock map fits the controller layout.
pub fn validate_settings(settings: &ControllerSettings) -> InstrumentResult<()> {
    if usize::from(settings.input_count) > g9sp_frame::MAX_INPUTS {
        return Err(InstrumentError::InvalidParameter(format!(
            "{} safety inputs configured, controller reports at most {}",
            settings.input_count,
            g9sp_frame::MAX_INPUTS
        )));
    }
    if usize::from(settings.output_count) > g9sp_frame::MAX_OUTPUTS {
        return Err(InstrumentError::InvalidParameter(format!(
            "{} safety outputs configured, controller reports at most {}",
            settings.output_count,
            g9sp_frame::MAX_OUTPUTS
        )));
    }
    for interlock in &settings.interlocks {
        if interlock.inputs.is_empty() || interlock.inputs.len() > 2 {
            return Err(InstrumentError::InvalidParameter(format!(
                "interlock '{}' needs one or two inputs, has {}",
                interlock.name,
                interlock.inputs.len()
            )));
        }
        if let Some(input) = interlock
            .inputs
            .iter()
            .find(|&&n| n >= settings.input_count)
        {
            return Err(InstrumentError::InvalidParameter(format!(
                "interlock '{}' uses input {} but only {} inputs are configured",
                interlock.name, input, settings.input_count
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::g9sp_frame::{encode_normal_response, ResponseFields};
    use labctl_core::error::ErrorClass;
    use labctl_core::mock_serial::{self, MockDeviceHarness};
    use labctl_core::serial::{Parity, SerialSettings};
    use std::time::Duration;

    fn controller(settings: ControllerSettings) -> (InterlockController, MockDeviceHarness) {
        let (port, harness) = mock_serial::new();
        let serial = SerialSettings::new("/dev/ttyUSB1", 115_200)
            .with_parity(Parity::Even)
            .with_timeout(Duration::from_millis(300))
            .with_drain_window(Duration::from_millis(1));
        let transport = Transport::with_port("g9sp", serial, Box::new(port));
        (InterlockController::new(transport, settings), harness)
    }

    fn frame_with(input_data: u8, input_status: u8) -> SafetyFrame {
        let bytes = encode_normal_response(&ResponseFields {
            input_data: [input_data, 0, 0, 0, 0, 0],
            input_status: [input_status, 0, 0, 0, 0, 0],
            output_data: [0x10, 0, 0, 0],
            output_status: [0x10, 0, 0, 0],
            unit_status: 0x0001,
            ..ResponseFields::default()
        });
        g9sp_frame::parse_response(&bytes).unwrap()
    }

    fn one_dual() -> ControllerSettings {
        ControllerSettings {
            input_count: 2,
            output_count: 7,
            active_output: 4,
            interlocks: vec![Interlock::dual("Door", 0, 1)],
        }
    }

    #[test]
    fn dual_channel_status_is_and_of_both_bits() {
        let (controller, _harness) = controller(one_dual());
        let cases = [
            (0b11, true),
            (0b01, false),
            (0b10, false),
            (0b00, false),
        ];
        for (status_bits, normal) in cases {
            let samples = controller.interpret(&frame_with(0b11, status_bits));
            let door = &samples[0];
            assert_eq!(door.channel, ChannelId::Interlock(0));
            if normal {
                assert_eq!(door.observation, Observation::Value(1.0));
            } else {
                assert!(
                    matches!(door.observation, Observation::SensorError(_)),
                    "status bits {:#04b}",
                    status_bits
                );
            }
        }
    }

    #[test]
    fn open_interlock_reads_zero() {
        let (controller, _harness) = controller(one_dual());
        let samples = controller.interpret(&frame_with(0b01, 0b11));
        assert_eq!(samples[0].observation, Observation::Value(0.0));
    }

    #[test]
    fn controller_active_and_unit_status_channels() {
        let (controller, _harness) = controller(one_dual());
        let samples = controller.interpret(&frame_with(0b11, 0b11));
        assert_eq!(samples.len(), 3);
        assert_eq!(
            samples[1],
            Sample::new(ChannelId::ControllerActive, Observation::Value(1.0))
        );
        assert_eq!(
            samples[2],
            Sample::new(ChannelId::UnitStatus, Observation::Value(1.0))
        );
    }

    #[test]
    fn unhealthy_unit_status_is_sensor_error() {
        let (controller, _harness) = controller(one_dual());
        let bytes = encode_normal_response(&ResponseFields {
            unit_status: 0x0001 | (1 << 9),
            ..ResponseFields::default()
        });
        let frame = g9sp_frame::parse_response(&bytes).unwrap();
        let samples = controller.interpret(&frame);
        assert!(matches!(
            samples.last().map(|s| &s.observation),
            Some(Observation::SensorError(msg)) if msg.contains("output power supply")
        ));
    }

    #[test]
    fn reserved_inputs_are_ignored() {
        let mut settings = one_dual();
        settings.interlocks.push(Interlock::single("Ghost", 15));
        let (controller, _harness) = controller(settings);
        let samples = controller.interpret(&frame_with(0b11, 0b11));
        assert!(samples
            .iter()
            .all(|s| s.channel != ChannelId::Interlock(1)));
    }

    #[test]
    fn registered_channels_match_sampled_channels() {
        let mut settings = one_dual();
        settings.interlocks.push(Interlock::single("Ghost", 15));
        let (controller, _harness) = controller(settings);

        let registered: Vec<ChannelId> = controller
            .channels()
            .into_iter()
            .map(|(channel, _)| channel)
            .collect();
        let sampled: Vec<ChannelId> = controller
            .interpret(&frame_with(0b11, 0b11))
            .into_iter()
            .map(|s| s.channel)
            .collect();
        assert_eq!(registered, sampled);
        assert!(!registered.contains(&ChannelId::Interlock(1)));
    }

    #[tokio::test]
    async fn poll_exchanges_fixed_frames() {
        let (mut controller, mut harness) = controller(ControllerSettings::default());
        let poll = tokio::spawn(async move { controller.poll_samples().await });

        let response = encode_normal_response(&ResponseFields {
            input_data: [0xFF, 0x1F, 0, 0, 0, 0],
            input_status: [0xFF, 0x1F, 0, 0, 0, 0],
            output_data: [0x10, 0, 0, 0],
            output_status: [0x10, 0, 0, 0],
            unit_status: 0x0001,
            ..ResponseFields::default()
        });
        harness.expect_and_respond(&POLL_REQUEST, &response).await;

        let samples = poll.await.unwrap().unwrap();
        // eight interlocks, controller active, unit status
        assert_eq!(samples.len(), 10);
        assert!(samples
            .iter()
            .all(|s| matches!(s.observation, Observation::Value(v) if v >= 1.0)));
    }

    #[tokio::test]
    async fn split_response_is_reassembled() {
        let (mut controller, mut harness) = controller(one_dual());
        let poll = tokio::spawn(async move { controller.poll().await });

        let response = encode_normal_response(&ResponseFields::default());
        harness.expect_write(&POLL_REQUEST).await;
        harness.send_response(&response[..60]).unwrap();
        harness.send_response(&response[60..]).unwrap();

        assert!(poll.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn corrupted_checksum_fails_the_poll() {
        let (mut controller, mut harness) = controller(one_dual());
        let poll = tokio::spawn(async move { controller.poll().await });

        let mut response = encode_normal_response(&ResponseFields::default());
        response[196] ^= 0xFF;
        harness.expect_and_respond(&POLL_REQUEST, &response).await;

        let err = poll.await.unwrap().unwrap_err();
        assert_eq!(err.class(), ErrorClass::ChecksumError);
    }

    #[tokio::test]
    async fn silent_controller_times_out() {
        let (mut controller, mut harness) = controller(one_dual());
        let poll = tokio::spawn(async move { controller.poll().await });

        harness.expect_write(&POLL_REQUEST).await;

        let err = poll.await.unwrap().unwrap_err();
        assert_eq!(err.class(), ErrorClass::Timeout);
    }

    #[test]
    fn settings_validation() {
        assert!(validate_settings(&ControllerSettings::default()).is_ok());

        let mut too_many = ControllerSettings::default();
        too_many.input_count = 21;
        assert!(validate_settings(&too_many).is_err());

        let mut triple = ControllerSettings::default();
        triple.interlocks.push(Interlock {
            name: "Triple".into(),
            inputs: vec![0, 1, 2],
        });
        assert!(validate_settings(&triple).is_err());

        let mut out_of_layout = ControllerSettings::default();
        out_of_layout.interlocks.push(Interlock::single("Spare", 13));
        assert!(validate_settings(&out_of_layout).is_err());
    }
}

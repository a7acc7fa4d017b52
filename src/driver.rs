//! The closed set of instrument drivers the scheduler knows how to run.

use labctl_core::error::InstrumentResult;
use labctl_core::reading::{ChannelId, Sample};
use labctl_core::transport::Transport;
use labctl_driver_bk::PowerSupply;
use labctl_driver_omega::TemperatureMonitor;
use labctl_driver_omron::InterlockController;
use serde::Serialize;

/// Wire protocol family of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolKind {
    /// Modbus RTU.
    Modbus,
    /// Fixed-length checksummed binary frames.
    SafetyFrame,
    /// CR-terminated ASCII commands.
    AsciiCommand,
}

/// One instrument, whatever its protocol.
#[derive(Debug)]
pub enum InstrumentDriver {
    /// DP16PT-class temperature monitor.
    TemperatureMonitor(TemperatureMonitor),
    /// G9SP-class safety controller.
    Interlocks(InterlockController),
    /// 9104-class power supply.
    PowerSupply(PowerSupply),
}

impl InstrumentDriver {
    /// Protocol family.
    pub fn protocol(&self) -> ProtocolKind {
        match self {
            InstrumentDriver::TemperatureMonitor(_) => ProtocolKind::Modbus,
            InstrumentDriver::Interlocks(_) => ProtocolKind::SafetyFrame,
            InstrumentDriver::PowerSupply(_) => ProtocolKind::AsciiCommand,
        }
    }

    /// Channels reported by every successful poll, with labels.
    pub fn channels(&self) -> Vec<(ChannelId, String)> {
        match self {
            InstrumentDriver::TemperatureMonitor(d) => d.channels(),
            InstrumentDriver::Interlocks(d) => d.channels(),
            InstrumentDriver::PowerSupply(d) => d.channels(),
        }
    }

    /// The device's transport.
    pub fn transport(&self) -> &Transport {
        match self {
            InstrumentDriver::TemperatureMonitor(d) => d.transport(),
            InstrumentDriver::Interlocks(d) => d.transport(),
            InstrumentDriver::PowerSupply(d) => d.transport(),
        }
    }

    /// Mutable access to the device's transport.
    pub fn transport_mut(&mut self) -> &mut Transport {
        match self {
            InstrumentDriver::TemperatureMonitor(d) => d.transport_mut(),
            InstrumentDriver::Interlocks(d) => d.transport_mut(),
            InstrumentDriver::PowerSupply(d) => d.transport_mut(),
        }
    }

    /// One-time setup after the port opens.
    ///
    /// Failures are reported but never stop the device from being polled.
    pub async fn initialize(&mut self) -> InstrumentResult<()> {
        match self {
            InstrumentDriver::TemperatureMonitor(d) => {
                d.initialize().await;
                Ok(())
            }
            InstrumentDriver::Interlocks(_) => Ok(()),
            InstrumentDriver::PowerSupply(d) => d.initialize().await,
        }
    }

    /// Poll once and classify the results.
    pub async fn poll(&mut self) -> InstrumentResult<Vec<Sample>> {
        match self {
            InstrumentDriver::TemperatureMonitor(d) => d.poll().await,
            InstrumentDriver::Interlocks(d) => d.poll_samples().await,
            InstrumentDriver::PowerSupply(d) => d.poll().await,
        }
    }

    /// Close the transport.
    pub async fn close(&mut self) {
        self.transport_mut().close().await;
    }
}

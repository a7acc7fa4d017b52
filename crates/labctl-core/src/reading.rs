//! Data model shared by drivers, the state cache and the snapshot surface.
//!
//! A driver turns one poll into a list of [`Sample`]s: a channel plus the raw
//! [`Observation`] for it. The [`crate::cache::StateCache`] classifies each
//! observation into an immutable [`Reading`], applying last-good bridging and
//! error-count thresholds.

use crate::error::ErrorClass;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identifier of one configured device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Create an identifier from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Quantity reported by a power-supply preset channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresetQuantity {
    /// Output voltage in volts.
    Voltage,
    /// Output current in amps.
    Current,
    /// Regulation mode: 0.0 constant voltage, 1.0 constant current.
    RegulationMode,
}

/// Logical measurement point owned by a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelId {
    /// Modbus slave unit number on a temperature monitor bus.
    Unit(u8),
    /// Index of a configured logical interlock.
    Interlock(u8),
    /// Safety controller active flag (output terminal data AND status).
    ControllerActive,
    /// Safety controller unit status word.
    UnitStatus,
    /// One quantity of a power-supply preset slot.
    Preset {
        /// Preset slot number (1..=3).
        slot: u8,
        /// Quantity measured on that slot.
        quantity: PresetQuantity,
    },
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelId::Unit(unit) => write!(f, "unit{}", unit),
            ChannelId::Interlock(index) => write!(f, "interlock{}", index),
            ChannelId::ControllerActive => f.write_str("controller_active"),
            ChannelId::UnitStatus => f.write_str("unit_status"),
            ChannelId::Preset { slot, quantity } => {
                let q = match quantity {
                    PresetQuantity::Voltage => "voltage",
                    PresetQuantity::Current => "current",
                    PresetQuantity::RegulationMode => "mode",
                };
                write!(f, "preset{}.{}", slot, q)
            }
        }
    }
}

/// Fully qualified channel address: (device, channel).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelKey {
    /// Owning device.
    pub device: DeviceId,
    /// Channel within the device.
    pub channel: ChannelId,
}

impl ChannelKey {
    /// Build a key from its parts.
    pub fn new(device: DeviceId, channel: ChannelId) -> Self {
        Self { device, channel }
    }
}

/// Classification attached to every [`Reading`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quality {
    /// Value is valid.
    Good,
    /// Value decoded but outside physical validity (bridged with last good).
    OutOfRange,
    /// Device reports an abnormal state.
    SensorError,
    /// Device is not answering.
    Disconnected,
    /// Device answers with corrupted frames.
    ChecksumError,
}

impl Quality {
    /// Quality surfaced once a failure of `class` has persisted past its threshold.
    pub fn for_failure(class: ErrorClass) -> Self {
        match class {
            ErrorClass::ChecksumError | ErrorClass::MalformedFrame => Quality::ChecksumError,
            ErrorClass::OutOfRange | ErrorClass::SensorError => Quality::SensorError,
            _ => Quality::Disconnected,
        }
    }
}

/// Quality-tagged value of one channel at one instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Channel this reading belongs to.
    pub channel: ChannelId,
    /// Measured value, absent when the quality carries no usable value.
    pub value: Option<f64>,
    /// Classification.
    pub quality: Quality,
    /// When the reading was produced.
    pub timestamp: DateTime<Utc>,
}

impl Reading {
    /// Create a reading stamped with the current time.
    pub fn now(channel: ChannelId, value: Option<f64>, quality: Quality) -> Self {
        Self {
            channel,
            value,
            quality,
            timestamp: Utc::now(),
        }
    }

    /// Whether this reading carries a valid value.
    pub fn is_good(&self) -> bool {
        self.quality == Quality::Good
    }
}

/// What a driver observed for one channel during one poll.
#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
    /// Valid value.
    Value(f64),
    /// Value decoded but outside the physical validity range.
    OutOfRange(f64),
    /// Device reports an abnormal state for this channel.
    SensorError(String),
    /// The channel could not be read this poll.
    Fault(ErrorClass),
}

/// One channel's observation from a poll.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Channel observed.
    pub channel: ChannelId,
    /// Raw outcome.
    pub observation: Observation,
}

impl Sample {
    /// Pair a channel with its observation.
    pub fn new(channel: ChannelId, observation: Observation) -> Self {
        Self {
            channel,
            observation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_quality_follows_class() {
        assert_eq!(
            Quality::for_failure(ErrorClass::ChecksumError),
            Quality::ChecksumError
        );
        assert_eq!(
            Quality::for_failure(ErrorClass::MalformedFrame),
            Quality::ChecksumError
        );
        assert_eq!(Quality::for_failure(ErrorClass::Timeout), Quality::Disconnected);
        assert_eq!(
            Quality::for_failure(ErrorClass::LinkClosed),
            Quality::Disconnected
        );
    }

    #[test]
    fn channel_labels() {
        assert_eq!(ChannelId::Unit(3).to_string(), "unit3");
        let ch = ChannelId::Preset {
            slot: 3,
            quantity: PresetQuantity::RegulationMode,
        };
        assert_eq!(ch.to_string(), "preset3.mode");
    }

    #[test]
    fn reading_serializes_for_consumers() {
        let reading = Reading::now(ChannelId::Unit(1), Some(23.5), Quality::Good);
        let json = serde_json::to_value(&reading).unwrap();
        assert_eq!(json["channel"]["unit"], 1);
        assert_eq!(json["quality"], "good");
        assert_eq!(json["value"], 23.5);
    }
}

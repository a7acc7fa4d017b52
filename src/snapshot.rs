//! Read-only query surface for consumers.
//!
//! Every query reads the state cache and the health board directly; nothing
//! here waits on a device task or on serial I/O.

use crate::scheduler::{DeviceHealth, HealthBoard};
use chrono::{DateTime, Utc};
use labctl_core::cache::{ChannelEntry, StateCache};
use labctl_core::reading::{ChannelId, DeviceId, Reading};
use serde::Serialize;
use std::sync::Arc;

/// One device: health plus every channel's latest reading.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceSnapshot {
    /// Device id.
    pub device: DeviceId,
    /// Health, once the device has been started.
    pub health: Option<DeviceHealth>,
    /// Channels in registration order.
    pub channels: Vec<ChannelEntry>,
}

/// Every device at one instant.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemSnapshot {
    /// When the snapshot was assembled.
    pub taken_at: DateTime<Utc>,
    /// Devices, sorted by id.
    pub devices: Vec<DeviceSnapshot>,
}

/// Cheap, cloneable handle to the latest known state.
#[derive(Debug, Clone)]
pub struct Snapshot {
    cache: Arc<StateCache>,
    board: HealthBoard,
}

impl Snapshot {
    /// Query handle over a cache and health board.
    pub fn new(cache: Arc<StateCache>, board: HealthBoard) -> Self {
        Self { cache, board }
    }

    /// Latest reading of one channel.
    pub fn latest(&self, device: &DeviceId, channel: ChannelId) -> Option<Reading> {
        self.cache.latest(device, channel)
    }

    /// Last good value still retained for a channel.
    pub fn last_good(&self, device: &DeviceId, channel: ChannelId) -> Option<f64> {
        self.cache.last_good(device, channel)
    }

    /// Health of one device.
    pub fn health(&self, device: &DeviceId) -> Option<DeviceHealth> {
        self.board.get(device).map(|entry| entry.value().clone())
    }

    /// One device, or `None` if it is not part of the deployment.
    pub fn device(&self, device: &DeviceId) -> Option<DeviceSnapshot> {
        let channels = self.cache.device_readings(device);
        let health = self.health(device);
        if channels.is_empty() && health.is_none() {
            return None;
        }
        Some(DeviceSnapshot {
            device: device.clone(),
            health,
            channels,
        })
    }

    /// Every device.
    pub fn snapshot(&self) -> SystemSnapshot {
        SystemSnapshot {
            taken_at: Utc::now(),
            devices: self
                .cache
                .devices()
                .iter()
                .filter_map(|device| self.device(device))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dashmap::DashMap;
    use labctl_core::reading::{Observation, Quality, Sample};

    fn fixture() -> Snapshot {
        let cache = Arc::new(StateCache::default());
        let psu = DeviceId::new("power_supply");
        let pmon = DeviceId::new("temperature_monitor");
        cache.register(&pmon, ChannelId::Unit(1), "Solenoid 1");
        cache.register(&pmon, ChannelId::Unit(2), "Solenoid 2");
        cache.register(&psu, ChannelId::UnitStatus, "status");
        cache.record(&pmon, Sample::new(ChannelId::Unit(1), Observation::Value(21.0)));
        Snapshot::new(cache, Arc::new(DashMap::new()))
    }

    #[test]
    fn queries_return_latest_readings() {
        let snapshot = fixture();
        let pmon = DeviceId::new("temperature_monitor");

        let reading = snapshot.latest(&pmon, ChannelId::Unit(1)).unwrap();
        assert_eq!(reading.quality, Quality::Good);
        assert_eq!(snapshot.last_good(&pmon, ChannelId::Unit(1)), Some(21.0));
        assert_eq!(
            snapshot.latest(&pmon, ChannelId::Unit(2)).unwrap().quality,
            Quality::Disconnected
        );
        assert!(snapshot.latest(&pmon, ChannelId::Unit(3)).is_none());

        let device = snapshot.device(&pmon).unwrap();
        assert_eq!(device.channels.len(), 2);
        assert_eq!(device.channels[0].label, "Solenoid 1");
        assert!(snapshot.device(&DeviceId::new("missing")).is_none());
    }

    #[test]
    fn full_snapshot_serializes() {
        let snapshot = fixture().snapshot();
        assert_eq!(snapshot.devices.len(), 2);
        assert_eq!(snapshot.devices[0].device, DeviceId::new("power_supply"));

        let json = serde_json::to_value(&snapshot).unwrap();
        let channel = &json["devices"][1]["channels"][0];
        assert_eq!(channel["label"], "Solenoid 1");
        assert_eq!(channel["reading"]["quality"], "good");
        assert_eq!(channel["reading"]["value"], 21.0);
    }
}

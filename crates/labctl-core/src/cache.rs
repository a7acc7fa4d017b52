//! Thread-safe store of the latest classified reading per channel.
//!
//! The map itself is a [`DashMap`] from [`ChannelKey`] to a per-channel slot
//! behind its own `RwLock`. A writer only holds the map shard long enough to
//! clone the slot's `Arc`, so polls on different devices never contend with
//! each other; a reader and a writer of the same channel serialize on that
//! channel's lock and a reader always sees a whole [`Reading`].

use crate::error::ErrorClass;
use crate::reading::{ChannelId, ChannelKey, DeviceId, Observation, Quality, Reading, Sample};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;

/// Default number of consecutive bad observations bridged before escalating.
pub const DEFAULT_ERROR_THRESHOLD: u32 = 3;

#[derive(Debug)]
struct ChannelSlot {
    label: String,
    latest: Reading,
    last_good: Option<f64>,
    error_count: u32,
}

impl ChannelSlot {
    fn new(channel: ChannelId, label: String) -> Self {
        Self {
            label,
            latest: Reading::now(channel, None, Quality::Disconnected),
            last_good: None,
            error_count: 0,
        }
    }
}

/// Entry returned by [`StateCache::device_readings`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelEntry {
    /// Human-readable channel label from configuration.
    pub label: String,
    /// Latest reading for the channel.
    pub reading: Reading,
    /// Value of the most recent good reading, if still retained.
    pub last_good: Option<f64>,
}

/// Latest reading per channel with last-good bridging.
#[derive(Debug)]
pub struct StateCache {
    slots: DashMap<ChannelKey, Arc<RwLock<ChannelSlot>>>,
    devices: DashMap<DeviceId, Vec<ChannelId>>,
    error_threshold: u32,
}

impl Default for StateCache {
    fn default() -> Self {
        Self::new(DEFAULT_ERROR_THRESHOLD)
    }
}

impl StateCache {
    /// Create an empty cache escalating after `error_threshold` bad observations.
    pub fn new(error_threshold: u32) -> Self {
        Self {
            slots: DashMap::new(),
            devices: DashMap::new(),
            error_threshold: error_threshold.max(1),
        }
    }

    /// Bad observations bridged before a channel escalates.
    pub fn error_threshold(&self) -> u32 {
        self.error_threshold
    }

    /// Register a channel. Its initial reading is `Disconnected` with no value.
    ///
    /// Registering an existing channel only updates its label.
    pub fn register(&self, device: &DeviceId, channel: ChannelId, label: impl Into<String>) {
        self.insert_slot(device, channel, Some(label.into()));
    }

    fn insert_slot(
        &self,
        device: &DeviceId,
        channel: ChannelId,
        label: Option<String>,
    ) -> Arc<RwLock<ChannelSlot>> {
        let key = ChannelKey::new(device.clone(), channel);
        let mut inserted = false;
        let slot = self
            .slots
            .entry(key)
            .and_modify(|slot| {
                if let Some(label) = &label {
                    slot.write().label = label.clone();
                }
            })
            .or_insert_with(|| {
                inserted = true;
                let label = label.clone().unwrap_or_else(|| channel.to_string());
                Arc::new(RwLock::new(ChannelSlot::new(channel, label)))
            })
            .clone();

        if inserted {
            let mut channels = self.devices.entry(device.clone()).or_default();
            if !channels.contains(&channel) {
                channels.push(channel);
            }
        }
        slot
    }

    fn slot(&self, device: &DeviceId, channel: ChannelId) -> Arc<RwLock<ChannelSlot>> {
        let key = ChannelKey::new(device.clone(), channel);
        if let Some(slot) = self.slots.get(&key).map(|slot| Arc::clone(slot.value())) {
            return slot;
        }
        self.insert_slot(device, channel, None)
    }

    /// Classify one observation and store the resulting reading.
    ///
    /// - `Value` is `Good`, becomes the channel's last good value and resets
    ///   its error count.
    /// - `OutOfRange` reports `OutOfRange` carrying the last good value until
    ///   the error count reaches the threshold, then `SensorError` with no value.
    /// - `SensorError` surfaces immediately with no value.
    /// - `Fault` leaves the channel untouched until the threshold, then reports
    ///   the failure quality and clears the last good value.
    ///
    /// Returns the channel's reading after the update.
    pub fn record(&self, device: &DeviceId, sample: Sample) -> Reading {
        let slot = self.slot(device, sample.channel);
        let mut slot = slot.write();
        let channel = sample.channel;

        match sample.observation {
            Observation::Value(value) => {
                slot.error_count = 0;
                slot.last_good = Some(value);
                slot.latest = Reading::now(channel, Some(value), Quality::Good);
            }
            Observation::OutOfRange(value) => {
                slot.error_count = slot.error_count.saturating_add(1);
                if slot.error_count >= self.error_threshold {
                    tracing::warn!(%device, %channel, value, "value out of range past threshold");
                    slot.latest = Reading::now(channel, None, Quality::SensorError);
                } else {
                    tracing::debug!(%device, %channel, value, "bridging out-of-range value with last good");
                    let bridged = slot.last_good;
                    slot.latest = Reading::now(channel, bridged, Quality::OutOfRange);
                }
            }
            Observation::SensorError(reason) => {
                slot.error_count = slot.error_count.saturating_add(1);
                tracing::debug!(%device, %channel, %reason, "sensor error");
                slot.latest = Reading::now(channel, None, Quality::SensorError);
            }
            Observation::Fault(class) => {
                slot.error_count = slot.error_count.saturating_add(1);
                if slot.error_count >= self.error_threshold {
                    slot.last_good = None;
                    slot.latest = Reading::now(channel, None, Quality::for_failure(class));
                }
            }
        }

        slot.latest.clone()
    }

    /// Reclassify every channel of `device` after a declared device failure.
    ///
    /// Each channel reports the failure quality with no value and loses its
    /// last good value.
    pub fn declare_failure(&self, device: &DeviceId, class: ErrorClass) {
        let quality = Quality::for_failure(class);
        for channel in self.channels(device) {
            let slot = self.slot(device, channel);
            let mut slot = slot.write();
            slot.error_count = slot.error_count.max(self.error_threshold);
            slot.last_good = None;
            slot.latest = Reading::now(channel, None, quality);
        }
    }

    /// Latest reading of one channel.
    pub fn latest(&self, device: &DeviceId, channel: ChannelId) -> Option<Reading> {
        let key = ChannelKey::new(device.clone(), channel);
        let slot = self.slots.get(&key).map(|slot| Arc::clone(slot.value()))?;
        let reading = slot.read().latest.clone();
        Some(reading)
    }

    /// Last good value retained for one channel.
    pub fn last_good(&self, device: &DeviceId, channel: ChannelId) -> Option<f64> {
        let key = ChannelKey::new(device.clone(), channel);
        let slot = self.slots.get(&key).map(|slot| Arc::clone(slot.value()))?;
        let value = slot.read().last_good;
        value
    }

    /// Channels registered for `device`, in registration order.
    pub fn channels(&self, device: &DeviceId) -> Vec<ChannelId> {
        self.devices
            .get(device)
            .map(|channels| channels.clone())
            .unwrap_or_default()
    }

    /// Registered devices, sorted by id.
    pub fn devices(&self) -> Vec<DeviceId> {
        let mut devices: Vec<DeviceId> = self.devices.iter().map(|e| e.key().clone()).collect();
        devices.sort();
        devices
    }

    /// Every channel of `device` with its label and latest reading.
    pub fn device_readings(&self, device: &DeviceId) -> Vec<ChannelEntry> {
        self.channels(device)
            .into_iter()
            .filter_map(|channel| {
                let key = ChannelKey::new(device.clone(), channel);
                let slot = self.slots.get(&key).map(|slot| Arc::clone(slot.value()))?;
                let slot = slot.read();
                Some(ChannelEntry {
                    label: slot.label.clone(),
                    reading: slot.latest.clone(),
                    last_good: slot.last_good,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dev() -> DeviceId {
        DeviceId::new("pmon")
    }

    fn record(cache: &StateCache, observation: Observation) -> Reading {
        cache.record(&dev(), Sample::new(ChannelId::Unit(1), observation))
    }

    #[test]
    fn registered_channel_starts_disconnected() {
        let cache = StateCache::default();
        cache.register(&dev(), ChannelId::Unit(1), "Solenoid 1");

        let reading = cache.latest(&dev(), ChannelId::Unit(1)).unwrap();
        assert_eq!(reading.quality, Quality::Disconnected);
        assert_eq!(reading.value, None);
        assert_eq!(cache.device_readings(&dev())[0].label, "Solenoid 1");
    }

    #[test]
    fn good_value_becomes_last_good() {
        let cache = StateCache::default();
        let reading = record(&cache, Observation::Value(23.5));

        assert_eq!(reading.quality, Quality::Good);
        assert_eq!(reading.value, Some(23.5));
        assert_eq!(cache.last_good(&dev(), ChannelId::Unit(1)), Some(23.5));
    }

    #[test]
    fn out_of_range_bridges_until_threshold() {
        let cache = StateCache::new(3);
        record(&cache, Observation::Value(21.0));

        let first = record(&cache, Observation::OutOfRange(612.0));
        assert_eq!(first.quality, Quality::OutOfRange);
        assert_eq!(first.value, Some(21.0));

        let second = record(&cache, Observation::OutOfRange(-150.0));
        assert_eq!(second.quality, Quality::OutOfRange);
        assert_eq!(second.value, Some(21.0));

        let third = record(&cache, Observation::OutOfRange(999.0));
        assert_eq!(third.quality, Quality::SensorError);
        assert_eq!(third.value, None);
    }

    #[test]
    fn good_value_resets_error_count() {
        let cache = StateCache::new(2);
        record(&cache, Observation::OutOfRange(700.0));
        record(&cache, Observation::Value(20.0));

        let reading = record(&cache, Observation::OutOfRange(700.0));
        assert_eq!(reading.quality, Quality::OutOfRange);
        assert_eq!(reading.value, Some(20.0));
    }

    #[test]
    fn sensor_error_surfaces_immediately() {
        let cache = StateCache::new(3);
        record(&cache, Observation::Value(20.0));

        let reading = record(&cache, Observation::SensorError("status 10".into()));
        assert_eq!(reading.quality, Quality::SensorError);
        assert_eq!(reading.value, None);
        // Last good is kept; only a disconnect clears it.
        assert_eq!(cache.last_good(&dev(), ChannelId::Unit(1)), Some(20.0));
    }

    #[test]
    fn faults_leave_channel_untouched_until_threshold() {
        let cache = StateCache::new(3);
        let good = record(&cache, Observation::Value(22.0));

        let after_one = record(&cache, Observation::Fault(ErrorClass::ChecksumError));
        assert_eq!(after_one, good);
        let after_two = record(&cache, Observation::Fault(ErrorClass::ChecksumError));
        assert_eq!(after_two, good);

        let after_three = record(&cache, Observation::Fault(ErrorClass::ChecksumError));
        assert_eq!(after_three.quality, Quality::ChecksumError);
        assert_eq!(after_three.value, None);
        assert_eq!(cache.last_good(&dev(), ChannelId::Unit(1)), None);
    }

    #[test]
    fn declared_failure_clears_every_channel_of_the_device() {
        let cache = StateCache::default();
        let other = DeviceId::new("psu");
        cache.record(&dev(), Sample::new(ChannelId::Unit(1), Observation::Value(1.0)));
        cache.record(&dev(), Sample::new(ChannelId::Unit(2), Observation::Value(2.0)));
        cache.record(&other, Sample::new(ChannelId::Unit(1), Observation::Value(3.0)));

        cache.declare_failure(&dev(), ErrorClass::Timeout);

        for entry in cache.device_readings(&dev()) {
            assert_eq!(entry.reading.quality, Quality::Disconnected);
            assert_eq!(entry.reading.value, None);
            assert_eq!(entry.last_good, None);
        }
        assert!(cache.latest(&other, ChannelId::Unit(1)).unwrap().is_good());
    }

    #[test]
    fn unknown_channel_has_no_reading() {
        let cache = StateCache::default();
        assert!(cache.latest(&dev(), ChannelId::UnitStatus).is_none());
        assert!(cache.devices().is_empty());
    }

    #[test]
    fn concurrent_writers_on_different_devices() {
        let cache = Arc::new(StateCache::default());
        let handles: Vec<_> = (0..4u8)
            .map(|n| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    let device = DeviceId::new(format!("dev{}", n));
                    for i in 0..200 {
                        cache.record(
                            &device,
                            Sample::new(ChannelId::Unit(n), Observation::Value(f64::from(i))),
                        );
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(cache.devices().len(), 4);
        for n in 0..4u8 {
            let device = DeviceId::new(format!("dev{}", n));
            let reading = cache.latest(&device, ChannelId::Unit(n)).unwrap();
            assert_eq!(reading.value, Some(199.0));
        }
    }
}

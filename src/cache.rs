//! Realtime last-reading cache
//!
//! Thread-safe map from device id to its most recent [`Reading`]. One
//! writer per device (the poller) and any number of readers; a put
//! replaces the previous reading atomically, so readers always observe a
//! complete snapshot. Entries have no TTL and survive until overwritten
//! or explicitly removed when a device is deleted.

use dashmap::DashMap;

use crate::model::{DeviceId, Reading};

/// In-memory store of the latest reading per device.
#[derive(Debug, Default)]
pub struct RealtimeCache {
    readings: DashMap<DeviceId, Reading>,
}

impl RealtimeCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest reading for a device, successful or errored.
    pub fn get(&self, device_id: &str) -> Option<Reading> {
        self.readings.get(device_id).map(|r| r.clone())
    }

    /// Store a reading, replacing any previous one.
    pub fn put(&self, reading: Reading) {
        self.readings.insert(reading.device_id.clone(), reading);
    }

    /// Drop a device's entry, e.g. when the device is deleted.
    pub fn remove(&self, device_id: &str) -> Option<Reading> {
        self.readings.remove(device_id).map(|(_, r)| r)
    }

    /// Devices currently cached.
    pub fn device_ids(&self) -> Vec<DeviceId> {
        self.readings.iter().map(|e| e.key().clone()).collect()
    }

    /// Number of cached devices.
    pub fn len(&self) -> usize {
        self.readings.len()
    }

    /// True when nothing has been cached yet.
    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    /// Clear everything; used on shutdown.
    pub fn clear(&self) {
        self.readings.clear();
    }
}

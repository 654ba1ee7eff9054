//! Device poller
//!
//! One poll cycle loads the device definition, walks its data points in
//! order, reads each range through the shared session and decodes every
//! parameter into a reading entry. Parameter-level failures stay on their
//! entry; the cycle keeps going. Readings land in the realtime cache and
//! fan out to the history sink and push channel.
//!
//! Scheduling is a re-arming one-shot timer per device whose delay adapts
//! to failures: after three consecutive errors the interval stretches to
//! one minute per error (capped at five), a single recent error floors it
//! at two minutes, and repository faults stretch the next delay without
//! charging the device's counter. Any success snaps back to the configured
//! interval.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{GatewayError, GatewayResult};
use crate::model::{DataPoint, Device, DeviceId, Reading, ReadingEntry};
use crate::repository::{
    DevicePatch, DeviceRepository, HistoricalEntry, HistorySink, PushChannel,
    EVENT_COIL_UPDATE, EVENT_CRITICAL_VALUE_CHANGED, EVENT_DEVICE_COIL_UPDATE,
    EVENT_DEVICE_DATA_UPDATE, EVENT_REALTIME_DATA_UPDATE,
};
use crate::state::CoreState;
use crate::value::{DataType, PointValue};

/// Floor for any polling interval.
pub const MIN_POLL_INTERVAL_MS: u64 = 10_000;

/// Consecutive errors before the adaptive backoff kicks in.
const BACKOFF_THRESHOLD: u32 = 3;

/// Ceiling for the adaptive backoff delay.
const BACKOFF_CAP: Duration = Duration::from_secs(300);

/// Window in which a past error still counts as "recent".
const RECENT_ERROR_WINDOW: Duration = Duration::from_secs(300);

/// Floor applied while a recent error is on record.
const RECENT_ERROR_FLOOR: Duration = Duration::from_secs(120);

/// Floor applied after a repository-layer failure.
const REPOSITORY_ERROR_FLOOR: Duration = Duration::from_secs(120);

#[derive(Debug, Default, Clone)]
struct BackoffState {
    consecutive_errors: u32,
    last_error_at: Option<Instant>,
}

/// Per-device polling driver.
pub struct Poller {
    state: Arc<CoreState>,
    devices: Arc<dyn DeviceRepository>,
    history: Arc<dyn HistorySink>,
    push: Arc<dyn PushChannel>,
    connect_timeout: Duration,
    backoff: DashMap<DeviceId, BackoffState>,
    timers: DashMap<DeviceId, JoinHandle<()>>,
    configured_intervals: DashMap<DeviceId, Duration>,
    last_polled: DashMap<DeviceId, DateTime<Utc>>,
    successful_polls: AtomicU64,
    failed_polls: AtomicU64,
}

impl Poller {
    /// Create a poller over the shared state and collaborators.
    pub fn new(
        state: Arc<CoreState>,
        devices: Arc<dyn DeviceRepository>,
        history: Arc<dyn HistorySink>,
        push: Arc<dyn PushChannel>,
    ) -> Arc<Self> {
        Arc::new(Self {
            state,
            devices,
            history,
            push,
            connect_timeout: Duration::from_millis(crate::constants::DEFAULT_CONNECT_TIMEOUT_MS),
            backoff: DashMap::new(),
            timers: DashMap::new(),
            configured_intervals: DashMap::new(),
            last_polled: DashMap::new(),
            successful_polls: AtomicU64::new(0),
            failed_polls: AtomicU64::new(0),
        })
    }

    // ------------------------------------------------------------------
    // One poll cycle
    // ------------------------------------------------------------------

    /// Run one read cycle for a device.
    ///
    /// Fails fast when the device is missing, disabled or has nothing to
    /// poll. The produced reading carries one entry per configured
    /// parameter; entries whose decode failed have `error` set and a null
    /// value. With at least one successful range read the reading is
    /// published; with none, it is still cached as the device's last
    /// (errored) state and the cycle counts as failed.
    pub async fn poll_device(&self, device_id: &str) -> GatewayResult<Reading> {
        let device = self
            .devices
            .find_by_id(device_id)
            .await?
            .ok_or_else(|| GatewayError::config(format!("Unknown device: {device_id}")))?;
        if !device.enabled {
            return Err(GatewayError::config(format!("Device disabled: {device_id}")));
        }
        if device.data_points.is_empty() {
            return Err(GatewayError::config(format!(
                "Device has no data points: {device_id}"
            )));
        }

        let session = self.state.sessions.get_or_create(
            &device,
            Arc::clone(&self.state.ports),
            self.connect_timeout,
        )?;

        let mut entries: Vec<ReadingEntry> = Vec::new();
        let mut successful_reads = 0usize;
        let mut last_error: Option<GatewayError> = None;

        {
            let mut session = session.lock().await;
            for point in &device.data_points {
                match self.read_point(&mut session, &device, point).await {
                    Ok(words) => {
                        successful_reads += 1;
                        decode_point(&device, point, &words, &mut entries);
                    }
                    Err(e) => {
                        debug!("Range read failed for {device_id}: {e}");
                        for parameter in &point.parser.parameters {
                            entries.push(ReadingEntry {
                                name: parameter.name.clone(),
                                address: parameter.register_index,
                                value: None,
                                unit: parameter.unit.clone(),
                                data_type: parameter.data_type,
                                error: Some(e.to_string()),
                            });
                        }
                        last_error = Some(e);
                    }
                }
            }
        }

        let reading = Reading {
            device_id: device.id.clone(),
            timestamp: Utc::now(),
            entries,
        };
        self.last_polled.insert(device.id.clone(), reading.timestamp);
        self.state.cache.put(reading.clone());

        if successful_reads == 0 {
            self.failed_polls.fetch_add(1, Ordering::Relaxed);
            self.record_failure(&device.id);
            return Err(
                last_error.unwrap_or_else(|| GatewayError::transport("Every range read failed"))
            );
        }

        self.successful_polls.fetch_add(1, Ordering::Relaxed);
        self.record_success(&device.id);

        if let Err(e) = self
            .devices
            .update_partial(&device.id, DevicePatch::seen_now())
            .await
        {
            warn!("Could not update last_seen for {}: {e}", device.id);
        }
        self.archive(&reading).await;
        self.publish(&device, &reading).await;

        Ok(reading)
    }

    async fn read_point(
        &self,
        session: &mut crate::session::ModbusSession,
        device: &Device,
        point: &DataPoint,
    ) -> GatewayResult<Vec<u16>> {
        // Devices documented with 1-based register numbers shift down one.
        let start = point.range.start_address.saturating_sub(device.address_base());
        session
            .read_range_batch(
                point.range.function_code,
                start,
                point.range.count,
                &device.limits(),
            )
            .await
    }

    /// Ship non-errored entries to the historical sink; sink trouble is
    /// logged and forgotten.
    async fn archive(&self, reading: &Reading) {
        let entries: Vec<HistoricalEntry> = reading
            .entries
            .iter()
            .filter(|e| e.error.is_none())
            .filter_map(|e| {
                e.value.as_ref().map(|value| HistoricalEntry {
                    device_id: reading.device_id.clone(),
                    parameter: e.name.clone(),
                    value: value.clone(),
                    unit: e.unit.clone(),
                    timestamp: reading.timestamp,
                })
            })
            .collect();
        if entries.is_empty() {
            return;
        }
        if let Err(e) = self.history.write_many(entries).await {
            warn!("History write failed for {}: {e}", reading.device_id);
        }
    }

    /// Best-effort push notifications for a fresh reading.
    async fn publish(&self, device: &Device, reading: &Reading) {
        let timestamp = reading.timestamp.to_rfc3339();
        let payload = json!({
            "device_id": reading.device_id,
            "timestamp": timestamp,
            "entries": reading.entries,
        });

        for event in [EVENT_REALTIME_DATA_UPDATE, EVENT_DEVICE_DATA_UPDATE] {
            if let Err(e) = self.push.emit(event, payload.clone()).await {
                debug!("Push {event} failed for {}: {e}", reading.device_id);
            }
        }

        let coil_entries: Vec<&ReadingEntry> = reading
            .entries
            .iter()
            .filter(|e| e.data_type == DataType::Bool && e.error.is_none())
            .collect();
        if !coil_entries.is_empty() {
            let coil_payload = json!({
                "device_id": reading.device_id,
                "timestamp": timestamp,
                "coils": coil_entries,
            });
            for event in [EVENT_COIL_UPDATE, EVENT_DEVICE_COIL_UPDATE] {
                if let Err(e) = self.push.emit(event, coil_payload.clone()).await {
                    debug!("Push {event} failed for {}: {e}", reading.device_id);
                }
            }
        }

        for entry in &reading.entries {
            if let Some(limit) = at_critical_limit(device, entry) {
                let payload = json!({
                    "device_id": reading.device_id,
                    "timestamp": timestamp,
                    "parameter": entry.name,
                    "value": entry.value,
                    "limit": limit,
                });
                if let Err(e) = self.push.emit(EVENT_CRITICAL_VALUE_CHANGED, payload).await {
                    debug!("Push critical event failed for {}: {e}", reading.device_id);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Scheduling and adaptive backoff
    // ------------------------------------------------------------------

    /// Install a re-arming poll timer for a device. Replaces any previous
    /// timer. Intervals below ten seconds are clamped up.
    pub fn schedule_device(self: &Arc<Self>, device_id: &str, name: &str, interval_ms: u64) {
        let configured = Duration::from_millis(interval_ms.max(MIN_POLL_INTERVAL_MS));
        self.configured_intervals
            .insert(device_id.to_string(), configured);

        let poller = Arc::clone(self);
        let id = device_id.to_string();
        let label = name.to_string();
        let handle = tokio::spawn(async move {
            let mut delay = configured;
            loop {
                tokio::time::sleep(delay).await;
                let outcome = poller.poll_device(&id).await;
                if let Err(e @ GatewayError::Config { .. }) = &outcome {
                    // Gone or disabled; this timer has nothing left to do.
                    info!("Polling stopped for {label}: {e}");
                    poller.timers.remove(&id);
                    return;
                }
                delay = poller.next_delay(&id, configured, outcome.as_ref().err());
                debug!("Next poll of {label} in {delay:?}");
            }
        });

        if let Some(previous) = self.timers.insert(device_id.to_string(), handle) {
            previous.abort();
        }
        info!("Scheduled {name} every {configured:?}");
    }

    /// Cancel a device's poll timer. In-flight cycles run to completion.
    pub fn cancel_device(&self, device_id: &str) -> bool {
        self.configured_intervals.remove(device_id);
        match self.timers.remove(device_id) {
            Some((_, handle)) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Cancel every poll timer.
    pub fn cancel_all(&self) {
        let ids: Vec<DeviceId> = self.timers.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.cancel_device(&id);
        }
    }

    /// True while a poll timer is installed for the device.
    pub fn is_scheduled(&self, device_id: &str) -> bool {
        self.timers.contains_key(device_id)
    }

    /// Number of devices with installed timers.
    pub fn scheduled_count(&self) -> usize {
        self.timers.len()
    }

    /// Devices with installed timers.
    pub fn scheduled_ids(&self) -> Vec<DeviceId> {
        self.timers.iter().map(|e| e.key().clone()).collect()
    }

    fn record_success(&self, device_id: &str) {
        self.backoff.remove(device_id);
    }

    fn record_failure(&self, device_id: &str) {
        let mut entry = self.backoff.entry(device_id.to_string()).or_default();
        entry.consecutive_errors += 1;
        entry.last_error_at = Some(Instant::now());
    }

    /// Delay before the next poll, given the cycle's outcome.
    pub fn next_delay(
        &self,
        device_id: &str,
        configured: Duration,
        error: Option<&GatewayError>,
    ) -> Duration {
        match error {
            None => configured,
            Some(e) if e.is_repository() => configured.max(REPOSITORY_ERROR_FLOOR),
            Some(_) => {
                let snapshot = self
                    .backoff
                    .get(device_id)
                    .map(|s| s.clone())
                    .unwrap_or_default();
                if snapshot.consecutive_errors >= BACKOFF_THRESHOLD {
                    let minutes = u64::from(snapshot.consecutive_errors.min(10));
                    Duration::from_secs(minutes * 60).min(BACKOFF_CAP)
                } else if snapshot
                    .last_error_at
                    .is_some_and(|at| at.elapsed() < RECENT_ERROR_WINDOW)
                {
                    configured.max(RECENT_ERROR_FLOOR)
                } else {
                    configured
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Stats accessors
    // ------------------------------------------------------------------

    /// Cycles that produced at least one successful range read.
    pub fn successful_polls(&self) -> u64 {
        self.successful_polls.load(Ordering::Relaxed)
    }

    /// Cycles where every range read failed.
    pub fn failed_polls(&self) -> u64 {
        self.failed_polls.load(Ordering::Relaxed)
    }

    /// Last poll completion time per device.
    pub fn last_poll_times(&self) -> Vec<(DeviceId, DateTime<Utc>)> {
        self.last_polled
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect()
    }

    /// Consecutive-error count currently on record for a device.
    pub fn consecutive_errors(&self, device_id: &str) -> u32 {
        self.backoff
            .get(device_id)
            .map(|s| s.consecutive_errors)
            .unwrap_or(0)
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        for entry in self.timers.iter() {
            entry.value().abort();
        }
    }
}

/// Decode every parameter of a data point out of its freshly read words.
fn decode_point(device: &Device, point: &DataPoint, words: &[u16], out: &mut Vec<ReadingEntry>) {
    let default_order = device.default_byte_order();

    for parameter in &point.parser.parameters {
        let resolved = point.range.resolve_offset(parameter.register_index);
        let word_count = parameter.word_count();
        let address = point.range.start_address.saturating_add(resolved.offset);
        let end = u32::from(resolved.offset) + u32::from(word_count);

        let mut entry = ReadingEntry {
            name: parameter.name.clone(),
            address,
            value: None,
            unit: parameter.unit.clone(),
            data_type: parameter.data_type,
            error: None,
        };

        if end > u32::from(point.range.count) {
            entry.error = Some("index out of range".into());
            out.push(entry);
            continue;
        }

        let lo = resolved.offset as usize;
        let slice = &words[lo..lo + word_count as usize];
        let order = parameter.byte_order.unwrap_or(default_order);
        let bit = parameter.bit_position.unwrap_or(0);

        match crate::codec::decode_value(slice, parameter.data_type, order, bit) {
            Ok(PointValue::Number(raw)) => match crate::scaling::apply(raw, &parameter.scaling) {
                Some(scaled) => entry.value = Some(PointValue::Number(scaled)),
                None => entry.error = Some("value not finite".into()),
            },
            Ok(value) => entry.value = Some(value),
            Err(e) => entry.error = Some(e.to_string()),
        }

        out.push(entry);
    }
}

/// When an entry sits on one of its configured clamp bounds, return that
/// bound for the critical-value notification.
fn at_critical_limit(device: &Device, entry: &ReadingEntry) -> Option<f64> {
    let value = entry.value.as_ref()?.as_f64()?;
    let parameter = device
        .data_points
        .iter()
        .flat_map(|p| &p.parser.parameters)
        .find(|p| p.name == entry.name)?;
    if let Some(min) = parameter.scaling.min_value {
        if value <= min {
            return Some(min);
        }
    }
    if let Some(max) = parameter.scaling.max_value {
        if value >= max {
            return Some(max);
        }
    }
    None
}

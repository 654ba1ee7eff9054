//! Collaborator interfaces
//!
//! The core treats persistence and notification as external collaborators
//! behind traits: a device repository, a schedule repository, a historical
//! sink, a push channel and an event log. Which store backs them is the
//! outer layer's concern. In-memory implementations live here too; the
//! test suites and the demo binary run against them.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{GatewayError, GatewayResult};
use crate::model::{Device, DeviceId, DeviceSchedule, ScheduleTemplate};
use crate::value::PointValue;

// ============================================================================
// Push event names
// ============================================================================

/// Fresh reading for subscribers of one device.
pub const EVENT_REALTIME_DATA_UPDATE: &str = "realtime_data_update";
/// Fresh reading on the fleet-wide stream.
pub const EVENT_DEVICE_DATA_UPDATE: &str = "device_data_update";
/// Coil/discrete change for subscribers of one device.
pub const EVENT_COIL_UPDATE: &str = "coil_update";
/// Coil/discrete change on the fleet-wide stream.
pub const EVENT_DEVICE_COIL_UPDATE: &str = "device_coil_update";
/// A value crossed its configured limits.
pub const EVENT_CRITICAL_VALUE_CHANGED: &str = "critical_value_changed";

// ============================================================================
// Device repository
// ============================================================================

/// Partial update applied to a device record.
///
/// `None` fields are left untouched; unknown fields in the stored record
/// are preserved by the repository implementation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DevicePatch {
    /// Update the last successful contact timestamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
    /// Update the last setpoint write timestamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_controlled_at: Option<DateTime<Utc>>,
    /// Bind or rebind the active schedule
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_schedule_id: Option<String>,
}

impl DevicePatch {
    /// Patch that only touches `last_seen`.
    pub fn seen_now() -> Self {
        Self {
            last_seen: Some(Utc::now()),
            ..Default::default()
        }
    }

    /// Patch that only touches `last_controlled_at`.
    pub fn controlled_now() -> Self {
        Self {
            last_controlled_at: Some(Utc::now()),
            ..Default::default()
        }
    }
}

/// Persistent store of device definitions.
#[async_trait]
pub trait DeviceRepository: Send + Sync {
    /// Fetch one device by id.
    async fn find_by_id(&self, id: &str) -> GatewayResult<Option<Device>>;

    /// All devices with `enabled` set.
    async fn find_enabled(&self) -> GatewayResult<Vec<Device>>;

    /// Count of enabled devices, cheaper than fetching them.
    async fn count_enabled(&self) -> GatewayResult<usize>;

    /// Apply a partial update to a device record.
    async fn update_partial(&self, id: &str, patch: DevicePatch) -> GatewayResult<()>;
}

// ============================================================================
// Schedule repository
// ============================================================================

/// State written back after a schedule event is applied.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchedulePatch {
    /// Rule now holding the device; `Some(None)` clears it
    pub current_active_rule: Option<Option<String>>,
    /// Timestamp of the applied write
    pub last_applied: Option<DateTime<Utc>>,
}

/// Persistent store of schedule templates and device bindings.
#[async_trait]
pub trait ScheduleRepository: Send + Sync {
    /// Fetch one template by id.
    async fn find_template(&self, id: &str) -> GatewayResult<Option<ScheduleTemplate>>;

    /// Store a template.
    async fn save_template(&self, template: ScheduleTemplate) -> GatewayResult<()>;

    /// Fetch one device binding by id.
    async fn find_schedule(&self, id: &str) -> GatewayResult<Option<DeviceSchedule>>;

    /// Store a device binding.
    async fn save_schedule(&self, schedule: DeviceSchedule) -> GatewayResult<()>;

    /// All bindings with `active` set, regardless of date window.
    async fn find_active_schedules(&self) -> GatewayResult<Vec<DeviceSchedule>>;

    /// Apply a partial state update to a binding.
    async fn update_schedule(&self, id: &str, patch: SchedulePatch) -> GatewayResult<()>;
}

// ============================================================================
// Historical sink, push channel, event log
// ============================================================================

/// One archived sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricalEntry {
    /// Source device
    pub device_id: DeviceId,
    /// Parameter name
    pub parameter: String,
    /// Sampled value; errored entries are never archived
    pub value: PointValue,
    /// Engineering unit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    /// Sample time
    pub timestamp: DateTime<Utc>,
}

/// Batch writer for archived samples. Failures are logged by callers but
/// never propagate into the poll cycle.
#[async_trait]
pub trait HistorySink: Send + Sync {
    /// Persist a batch of samples.
    async fn write_many(&self, entries: Vec<HistoricalEntry>) -> GatewayResult<()>;
}

/// Best-effort outbound notification channel.
#[async_trait]
pub trait PushChannel: Send + Sync {
    /// Emit a named event; payloads always carry `device_id` and an
    /// ISO-8601 `timestamp`.
    async fn emit(&self, event: &str, payload: serde_json::Value) -> GatewayResult<()>;
}

/// Severity of an event-log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// Informational
    Info,
    /// Something degraded
    Warn,
    /// Something failed
    Error,
}

/// One operator-visible log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventLogEntry {
    /// Severity
    pub kind: EventKind,
    /// Human-readable message
    pub message: String,
    /// Related device, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<DeviceId>,
    /// Acting user, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Event time
    pub timestamp: DateTime<Utc>,
}

/// Operator-visible event journal.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Append one entry.
    async fn append(&self, entry: EventLogEntry) -> GatewayResult<()>;
}

// ============================================================================
// In-memory implementations
// ============================================================================

/// Device repository backed by a concurrent map.
#[derive(Debug, Default)]
pub struct MemoryDeviceRepository {
    devices: DashMap<DeviceId, Device>,
}

impl MemoryDeviceRepository {
    /// Empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a device after validating it.
    pub fn upsert(&self, device: Device) -> GatewayResult<()> {
        device.validate()?;
        self.devices.insert(device.id.clone(), device);
        Ok(())
    }

    /// Remove a device.
    pub fn remove(&self, id: &str) -> Option<Device> {
        self.devices.remove(id).map(|(_, d)| d)
    }
}

#[async_trait]
impl DeviceRepository for MemoryDeviceRepository {
    async fn find_by_id(&self, id: &str) -> GatewayResult<Option<Device>> {
        Ok(self.devices.get(id).map(|d| d.clone()))
    }

    async fn find_enabled(&self) -> GatewayResult<Vec<Device>> {
        Ok(self
            .devices
            .iter()
            .filter(|d| d.enabled)
            .map(|d| d.clone())
            .collect())
    }

    async fn count_enabled(&self) -> GatewayResult<usize> {
        Ok(self.devices.iter().filter(|d| d.enabled).count())
    }

    async fn update_partial(&self, id: &str, patch: DevicePatch) -> GatewayResult<()> {
        let mut device = self
            .devices
            .get_mut(id)
            .ok_or_else(|| GatewayError::repository(format!("No such device: {id}")))?;
        if let Some(ts) = patch.last_seen {
            device.last_seen = Some(ts);
        }
        if let Some(ts) = patch.last_controlled_at {
            device.last_controlled_at = Some(ts);
        }
        if let Some(schedule_id) = patch.active_schedule_id {
            device.active_schedule_id = Some(schedule_id);
        }
        Ok(())
    }
}

/// Schedule repository backed by concurrent maps.
#[derive(Debug, Default)]
pub struct MemoryScheduleRepository {
    templates: DashMap<String, ScheduleTemplate>,
    schedules: DashMap<String, DeviceSchedule>,
}

impl MemoryScheduleRepository {
    /// Empty repository.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ScheduleRepository for MemoryScheduleRepository {
    async fn find_template(&self, id: &str) -> GatewayResult<Option<ScheduleTemplate>> {
        Ok(self.templates.get(id).map(|t| t.clone()))
    }

    async fn save_template(&self, template: ScheduleTemplate) -> GatewayResult<()> {
        self.templates.insert(template.id.clone(), template);
        Ok(())
    }

    async fn find_schedule(&self, id: &str) -> GatewayResult<Option<DeviceSchedule>> {
        Ok(self.schedules.get(id).map(|s| s.clone()))
    }

    async fn save_schedule(&self, schedule: DeviceSchedule) -> GatewayResult<()> {
        self.schedules.insert(schedule.id.clone(), schedule);
        Ok(())
    }

    async fn find_active_schedules(&self) -> GatewayResult<Vec<DeviceSchedule>> {
        Ok(self
            .schedules
            .iter()
            .filter(|s| s.active)
            .map(|s| s.clone())
            .collect())
    }

    async fn update_schedule(&self, id: &str, patch: SchedulePatch) -> GatewayResult<()> {
        let mut schedule = self
            .schedules
            .get_mut(id)
            .ok_or_else(|| GatewayError::repository(format!("No such schedule: {id}")))?;
        if let Some(rule) = patch.current_active_rule {
            schedule.current_active_rule = rule;
        }
        if let Some(ts) = patch.last_applied {
            schedule.last_applied = Some(ts);
        }
        Ok(())
    }
}

/// Historical sink that buffers entries in memory.
#[derive(Debug, Default)]
pub struct MemoryHistorySink {
    entries: Mutex<Vec<HistoricalEntry>>,
}

impl MemoryHistorySink {
    /// Empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything written so far.
    pub fn entries(&self) -> Vec<HistoricalEntry> {
        self.entries.lock().expect("history lock poisoned").clone()
    }
}

#[async_trait]
impl HistorySink for MemoryHistorySink {
    async fn write_many(&self, mut entries: Vec<HistoricalEntry>) -> GatewayResult<()> {
        debug!("Buffering {} historical entries", entries.len());
        self.entries
            .lock()
            .expect("history lock poisoned")
            .append(&mut entries);
        Ok(())
    }
}

/// Push channel that records emitted events in memory.
#[derive(Debug, Default)]
pub struct MemoryPushChannel {
    events: Mutex<Vec<(String, serde_json::Value)>>,
}

impl MemoryPushChannel {
    /// Empty channel.
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything emitted so far.
    pub fn events(&self) -> Vec<(String, serde_json::Value)> {
        self.events.lock().expect("push lock poisoned").clone()
    }
}

#[async_trait]
impl PushChannel for MemoryPushChannel {
    async fn emit(&self, event: &str, payload: serde_json::Value) -> GatewayResult<()> {
        self.events
            .lock()
            .expect("push lock poisoned")
            .push((event.to_string(), payload));
        Ok(())
    }
}

/// Event log that appends to a vector.
#[derive(Debug, Default)]
pub struct MemoryEventLog {
    entries: Mutex<Vec<EventLogEntry>>,
}

impl MemoryEventLog {
    /// Empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything appended so far.
    pub fn entries(&self) -> Vec<EventLogEntry> {
        self.entries.lock().expect("event log lock poisoned").clone()
    }
}

#[async_trait]
impl EventLog for MemoryEventLog {
    async fn append(&self, entry: EventLogEntry) -> GatewayResult<()> {
        self.entries
            .lock()
            .expect("event log lock poisoned")
            .push(entry);
        Ok(())
    }
}

//! Device, schedule and reading model
//!
//! Persistent records exchanged with the device and schedule repositories.
//! The loosely-typed maps of legacy definitions become closed sum types
//! here; validation happens once at the repository boundary so the rest of
//! the core can trust what it is handed. Unknown fields in persisted records
//! are captured in a `extra` map and written back verbatim on update.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::bytes::ByteOrder;
use crate::constants::{
    read_quantity_limit, DEFAULT_RTU_TIMEOUT_MS, DEFAULT_TCP_TIMEOUT_MS,
};
use crate::error::{GatewayError, GatewayResult};
use crate::scaling::Scaling;
use crate::value::{DataType, PointValue};

/// Opaque device identifier.
pub type DeviceId = String;

// ============================================================================
// Transport configuration
// ============================================================================

/// Serial parity setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    /// No parity bit
    None,
    /// Even parity
    Even,
    /// Odd parity
    Odd,
}

/// How to reach a device: TCP endpoint or serial line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    /// Modbus TCP behind an Ethernet endpoint or gateway
    Tcp {
        /// Host name or IP address
        host: String,
        /// TCP port, normally 502
        port: u16,
        /// Unit id of the addressed device
        unit_id: u8,
        /// Connect/request timeout override (milliseconds)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout: Option<u64>,
    },
    /// Modbus RTU on a serial line
    Rtu {
        /// Device node, e.g. `/dev/ttyUSB0`
        path: String,
        /// Baud rate
        baud: u32,
        /// Data bits: 5, 6, 7 or 8
        data_bits: u8,
        /// Stop bits: 1 or 2
        stop_bits: u8,
        /// Parity
        parity: Parity,
        /// Unit id on the bus
        unit_id: u8,
    },
}

impl TransportConfig {
    /// Unit id the session addresses.
    pub fn unit_id(&self) -> u8 {
        match self {
            Self::Tcp { unit_id, .. } | Self::Rtu { unit_id, .. } => *unit_id,
        }
    }

    /// Default request timeout for the transport kind.
    pub fn default_timeout_ms(&self) -> u64 {
        match self {
            Self::Tcp { timeout, .. } => timeout.unwrap_or(DEFAULT_TCP_TIMEOUT_MS),
            Self::Rtu { .. } => DEFAULT_RTU_TIMEOUT_MS,
        }
    }

    fn validate(&self) -> GatewayResult<()> {
        match self {
            Self::Tcp { host, port, .. } => {
                if host.is_empty() {
                    return Err(GatewayError::config("TCP transport host is empty"));
                }
                if *port == 0 {
                    return Err(GatewayError::config("TCP transport port is zero"));
                }
            }
            Self::Rtu {
                path,
                baud,
                data_bits,
                stop_bits,
                ..
            } => {
                if path.is_empty() {
                    return Err(GatewayError::config("RTU transport path is empty"));
                }
                if *baud == 0 {
                    return Err(GatewayError::config("RTU baud rate is zero"));
                }
                if !(5..=8).contains(data_bits) {
                    return Err(GatewayError::config(format!(
                        "RTU data bits must be 5-8, got {data_bits}"
                    )));
                }
                if !(1..=2).contains(stop_bits) {
                    return Err(GatewayError::config(format!(
                        "RTU stop bits must be 1 or 2, got {stop_bits}"
                    )));
                }
            }
        }
        Ok(())
    }
}

// ============================================================================
// Data points and parameters
// ============================================================================

/// One contiguous Modbus read range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterRange {
    /// Read function code: 1, 2, 3 or 4
    pub function_code: u8,
    /// First register/coil address
    pub start_address: u16,
    /// Number of registers/coils to read
    pub count: u16,
}

/// How a parameter's `register_index` mapped onto its range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedOffset {
    /// Offset of the parameter's first word within the range
    pub offset: u16,
    /// True when neither interpretation fit and relative was assumed
    pub fallback: bool,
}

impl RegisterRange {
    /// Resolve a parameter's `register_index`, which historically holds
    /// either an absolute register address or an offset into the range.
    ///
    /// Absolute wins when the index lies inside `[start, start + count)`;
    /// a small index is treated as relative; anything else falls back to
    /// relative with a warning, which surfaces as an out-of-range entry.
    pub fn resolve_offset(&self, register_index: u16) -> ResolvedOffset {
        let start = self.start_address;
        let end = u32::from(start) + u32::from(self.count);

        if u32::from(register_index) >= u32::from(start) && u32::from(register_index) < end {
            return ResolvedOffset {
                offset: register_index - start,
                fallback: false,
            };
        }
        if register_index < self.count {
            return ResolvedOffset {
                offset: register_index,
                fallback: false,
            };
        }

        warn!(
            "register_index {} fits range {}+{} neither as address nor as offset",
            register_index, start, self.count
        );
        ResolvedOffset {
            offset: register_index,
            fallback: true,
        }
    }

    fn validate(&self) -> GatewayResult<()> {
        let limit = read_quantity_limit(self.function_code).ok_or_else(|| {
            GatewayError::config(format!(
                "Unknown read function code {} in data point",
                self.function_code
            ))
        })?;
        if self.count == 0 || self.count > limit {
            return Err(GatewayError::config(format!(
                "Range count {} out of 1..={} for FC{:02X}",
                self.count, limit, self.function_code
            )));
        }
        if u32::from(self.start_address) + u32::from(self.count) > 65_536 {
            return Err(GatewayError::config(format!(
                "Range {}+{} exceeds the 16-bit address space",
                self.start_address, self.count
            )));
        }
        Ok(())
    }
}

/// One named scalar decoded out of a range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    /// Parameter name, unique within the device
    pub name: String,
    /// Engineering unit label
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    /// Free-text description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Register interpretation
    pub data_type: DataType,
    /// Address or offset; see [`RegisterRange::resolve_offset`]
    pub register_index: u16,
    /// Explicit register width, defaulting from the data type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub word_count: Option<u16>,
    /// Word/byte order, defaulting from the device make
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub byte_order: Option<ByteOrder>,
    /// Scaling pipeline configuration
    #[serde(flatten)]
    pub scaling: Scaling,
    /// Value applied when a schedule ends without a rule default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<f64>,
    /// Bit selector for BOOL parameters inside a register
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bit_position: Option<u8>,
    /// Write function-code override: FC5 targets a coil, FC6 a register bit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_code: Option<u8>,
}

impl Parameter {
    /// Registers this parameter occupies.
    pub fn word_count(&self) -> u16 {
        crate::codec::effective_word_count(self.data_type, self.word_count)
    }
}

/// Parser section of a data point.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Parser {
    /// Parameters decoded from the owning range
    #[serde(default)]
    pub parameters: Vec<Parameter>,
}

/// A read range plus the parameters decoded from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    /// Contiguous read range
    pub range: RegisterRange,
    /// Decoding instructions
    #[serde(default)]
    pub parser: Parser,
}

/// A register the outside world may write to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WritableRegister {
    /// Name matched against setpoint targets
    pub name: String,
    /// Register address
    pub address: u16,
    /// Value interpretation
    pub data_type: DataType,
    /// Word/byte order override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub byte_order: Option<ByteOrder>,
}

// ============================================================================
// Device
// ============================================================================

/// Retry and timing knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdvancedSettings {
    /// Per-request timeout override (milliseconds)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Additional request attempts after the first
    #[serde(default)]
    pub retries: u32,
    /// Sleep between attempts (milliseconds)
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
    /// Poll interval when the device does not override it (milliseconds)
    #[serde(default = "default_poll_interval_ms")]
    pub default_poll_interval_ms: u64,
    /// Cap on registers per read request for devices below the spec limit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_read_registers: Option<u16>,
    /// Breather between consecutive requests (milliseconds)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inter_request_delay_ms: Option<u64>,
    /// Explicit register numbering base: 0 (protocol) or 1 (documentation)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address_base: Option<u8>,
    /// Honour the legacy convention where `retries == 0` marked a device as
    /// 1-based. Only consulted while `address_base` is unset.
    #[serde(default)]
    pub legacy_retries_address_flag: bool,
}

fn default_retry_interval_ms() -> u64 {
    1000
}

fn default_poll_interval_ms() -> u64 {
    60_000
}

impl Default for AdvancedSettings {
    fn default() -> Self {
        Self {
            timeout_ms: None,
            retries: 0,
            retry_interval_ms: default_retry_interval_ms(),
            default_poll_interval_ms: default_poll_interval_ms(),
            max_read_registers: None,
            inter_request_delay_ms: None,
            address_base: None,
            legacy_retries_address_flag: false,
        }
    }
}

/// Persistent description of one field device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    /// Opaque identifier
    pub id: DeviceId,
    /// Display name
    pub name: String,
    /// Manufacturer string, drives byte-order defaults
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub make: Option<String>,
    /// Disabled devices are never polled or written
    #[serde(default)]
    pub enabled: bool,
    /// How to reach the device
    pub transport: TransportConfig,
    /// Read ranges; presence enrols the device in polling
    #[serde(default)]
    pub data_points: Vec<DataPoint>,
    /// Legal write targets
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub writable_registers: Option<Vec<WritableRegister>>,
    /// Control-mode related write targets
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_parameters: Option<Vec<WritableRegister>>,
    /// Retry and timing knobs
    #[serde(default)]
    pub advanced: AdvancedSettings,
    /// Device-level poll interval override (milliseconds)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub polling_interval_ms: Option<u64>,
    /// Last successful contact
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
    /// Last setpoint write
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_controlled_at: Option<DateTime<Utc>>,
    /// Schedule currently bound to the device
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_schedule_id: Option<String>,
    /// Fields this crate does not interpret, preserved verbatim on update
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Device {
    /// Per-request timeout: advanced override first, then the transport's
    /// own setting, then the transport-kind default.
    pub fn timeout_ms(&self) -> u64 {
        self.advanced
            .timeout_ms
            .unwrap_or_else(|| self.transport.default_timeout_ms())
    }

    /// Effective poll interval for this device.
    pub fn poll_interval_ms(&self) -> u64 {
        self.polling_interval_ms
            .unwrap_or(self.advanced.default_poll_interval_ms)
    }

    /// Register numbering base. The explicit field wins; the legacy
    /// `retries == 0` marker applies only when the compatibility flag is on.
    pub fn address_base(&self) -> u16 {
        match self.advanced.address_base {
            Some(base) => u16::from(base.min(1)),
            None if self.advanced.legacy_retries_address_flag && self.advanced.retries == 0 => 1,
            None => 0,
        }
    }

    /// Protocol limits for this device: the specification defaults,
    /// narrowed by any advanced overrides.
    pub fn limits(&self) -> crate::device_limits::DeviceLimits {
        let mut limits = crate::device_limits::DeviceLimits::default();
        if let Some(cap) = self.advanced.max_read_registers {
            limits = limits.with_max_read_registers(cap);
        }
        if let Some(delay) = self.advanced.inter_request_delay_ms {
            limits = limits.with_inter_request_delay_ms(delay);
        }
        limits
    }

    /// Byte order used when a parameter does not declare one, chosen from
    /// the manufacturer string.
    pub fn default_byte_order(&self) -> ByteOrder {
        let make = self
            .make
            .as_deref()
            .unwrap_or_default()
            .to_ascii_lowercase();
        if make.contains("china") || make.contains("energy analyzer") {
            ByteOrder::Cdab
        } else if make.contains("siemens") {
            ByteOrder::Badc
        } else {
            // Schneider and everything else use network order.
            ByteOrder::Abcd
        }
    }

    /// Validate the definition at the repository boundary.
    ///
    /// Enforced here: transport fields, known function codes, range counts
    /// within the per-function limit, and ranges inside the address space.
    /// Parameter offsets that fall outside their range are a per-entry
    /// condition at poll time, not a rejection.
    pub fn validate(&self) -> GatewayResult<()> {
        if self.id.is_empty() {
            return Err(GatewayError::config("Device id is empty"));
        }
        self.transport.validate()?;
        for point in &self.data_points {
            point.range.validate()?;
            for parameter in &point.parser.parameters {
                if parameter.name.is_empty() {
                    return Err(GatewayError::config(format!(
                        "Device {}: parameter without a name",
                        self.id
                    )));
                }
                if parameter.data_type == DataType::Bool {
                    if let Some(bit) = parameter.bit_position {
                        if bit > 15 {
                            return Err(GatewayError::config(format!(
                                "Device {}: bit position {bit} out of 0-15 for {}",
                                self.id, parameter.name
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

// ============================================================================
// Schedules
// ============================================================================

/// Day selector for schedule rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DaySpec {
    /// Monday
    Mon,
    /// Tuesday
    Tue,
    /// Wednesday
    Wed,
    /// Thursday
    Thu,
    /// Friday
    Fri,
    /// Saturday
    Sat,
    /// Sunday
    Sun,
    /// Monday through Friday
    Weekday,
    /// Saturday and Sunday
    Weekend,
    /// Every day
    All,
}

impl DaySpec {
    /// Whether this selector covers the given weekday.
    pub fn matches(&self, weekday: chrono::Weekday) -> bool {
        use chrono::Weekday::*;
        match self {
            Self::Mon => weekday == Mon,
            Self::Tue => weekday == Tue,
            Self::Wed => weekday == Wed,
            Self::Thu => weekday == Thu,
            Self::Fri => weekday == Fri,
            Self::Sat => weekday == Sat,
            Self::Sun => weekday == Sun,
            Self::Weekday => !matches!(weekday, Sat | Sun),
            Self::Weekend => matches!(weekday, Sat | Sun),
            Self::All => true,
        }
    }
}

/// Wall-clock time of day, serialised as `"HH:MM"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClockTime {
    /// Hour 0-23
    pub hour: u8,
    /// Minute 0-59
    pub minute: u8,
}

impl ClockTime {
    /// Build a time of day; fails outside 23:59.
    pub fn new(hour: u8, minute: u8) -> GatewayResult<Self> {
        if hour > 23 || minute > 59 {
            return Err(GatewayError::config(format!(
                "Invalid clock time {hour:02}:{minute:02}"
            )));
        }
        Ok(Self { hour, minute })
    }

    /// Minutes since midnight.
    #[inline]
    pub fn minutes(&self) -> u16 {
        u16::from(self.hour) * 60 + u16::from(self.minute)
    }
}

impl std::str::FromStr for ClockTime {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (h, m) = s
            .split_once(':')
            .ok_or_else(|| GatewayError::config(format!("Invalid clock time: {s:?}")))?;
        let hour: u8 = h
            .trim()
            .parse()
            .map_err(|_| GatewayError::config(format!("Invalid clock time: {s:?}")))?;
        let minute: u8 = m
            .trim()
            .parse()
            .map_err(|_| GatewayError::config(format!("Invalid clock time: {s:?}")))?;
        Self::new(hour, minute)
    }
}

impl std::fmt::Display for ClockTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

impl Serialize for ClockTime {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ClockTime {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A time-of-day window plus the setpoint it applies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleRule {
    /// Rule identifier, unique within its template/schedule
    pub id: String,
    /// Disabled rules never fire
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Days the rule applies
    #[serde(default)]
    pub days: Vec<DaySpec>,
    /// Window start
    pub start_time: ClockTime,
    /// Window end
    pub end_time: ClockTime,
    /// Value written at the window start
    pub setpoint: f64,
    /// Value written at the window end when `return_to_default` is set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_setpoint: Option<f64>,
    /// Whether the end of the window writes a value back
    #[serde(default)]
    pub return_to_default: bool,
    /// Parameter name to match on the device
    pub parameter: String,
    /// Explicit register address override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub register_address: Option<u16>,
}

fn default_true() -> bool {
    true
}

impl ScheduleRule {
    /// True when the rule applies on the given weekday.
    pub fn applies_on(&self, weekday: chrono::Weekday) -> bool {
        self.days.iter().any(|d| d.matches(weekday))
    }

    /// True when `minute` (minutes since midnight) lies inside the window.
    /// Windows crossing midnight cover `start..=1439` plus `0..=end`.
    pub fn contains_minute(&self, minute: u16) -> bool {
        let start = self.start_time.minutes();
        let end = self.end_time.minutes();
        if start <= end {
            (start..=end).contains(&minute)
        } else {
            minute >= start || minute <= end
        }
    }
}

/// Named group of schedule rules, public or owned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleTemplate {
    /// Template identifier
    pub id: String,
    /// Display name
    pub name: String,
    /// Visible to everyone when true
    #[serde(default)]
    pub public: bool,
    /// Owning user when not public
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    /// The rules
    #[serde(default)]
    pub rules: Vec<ScheduleRule>,
    /// Preserved unknown fields
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Binding of one template to one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSchedule {
    /// Schedule identifier
    pub id: String,
    /// Bound device
    pub device_id: DeviceId,
    /// Bound template
    pub template_id: String,
    /// Device-specific additions to the template rules
    #[serde(default)]
    pub custom_rules: Vec<ScheduleRule>,
    /// Inactive schedules are skipped by the engine
    #[serde(default)]
    pub active: bool,
    /// First calendar day the binding applies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<NaiveDate>,
    /// Last calendar day the binding applies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<NaiveDate>,
    /// Rule currently holding the device, at most one per parameter
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_active_rule: Option<String>,
    /// Timestamp of the last applied write
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_applied: Option<DateTime<Utc>>,
    /// Preserved unknown fields
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl DeviceSchedule {
    /// True when `date` falls inside the binding's calendar window.
    pub fn covers_date(&self, date: NaiveDate) -> bool {
        if let Some(start) = self.start_date {
            if date < start {
                return false;
            }
        }
        if let Some(end) = self.end_date {
            if date > end {
                return false;
            }
        }
        true
    }
}

// ============================================================================
// Readings
// ============================================================================

/// One decoded parameter within a reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadingEntry {
    /// Parameter name
    pub name: String,
    /// Resolved register address
    pub address: u16,
    /// Decoded value, null when `error` is set
    pub value: Option<PointValue>,
    /// Engineering unit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    /// Declared data type
    pub data_type: DataType,
    /// Per-parameter failure description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Snapshot of one poll cycle for one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Polled device
    pub device_id: DeviceId,
    /// When the poll completed
    pub timestamp: DateTime<Utc>,
    /// One entry per configured parameter, errored entries included
    pub entries: Vec<ReadingEntry>,
}

impl Reading {
    /// Look up an entry by parameter name, case-insensitively.
    pub fn entry(&self, name: &str) -> Option<&ReadingEntry> {
        self.entries
            .iter()
            .find(|e| e.name.eq_ignore_ascii_case(name))
    }

    /// Look up the first entry whose name contains `needle` (ASCII
    /// case-insensitive). Used for control/schedule mode bits.
    pub fn entry_containing(&self, needle: &str) -> Option<&ReadingEntry> {
        let needle = needle.to_ascii_lowercase();
        self.entries
            .iter()
            .find(|e| e.name.to_ascii_lowercase().contains(&needle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tcp_device(id: &str) -> Device {
        Device {
            id: id.into(),
            name: format!("device {id}"),
            make: None,
            enabled: true,
            transport: TransportConfig::Tcp {
                host: "10.0.0.5".into(),
                port: 502,
                unit_id: 1,
                timeout: None,
            },
            data_points: Vec::new(),
            writable_registers: None,
            control_parameters: None,
            advanced: AdvancedSettings::default(),
            polling_interval_ms: None,
            last_seen: None,
            last_controlled_at: None,
            active_schedule_id: None,
            extra: serde_json::Map::new(),
        }
    }

    #[test]
    fn test_resolve_offset_absolute() {
        let range = RegisterRange {
            function_code: 3,
            start_address: 100,
            count: 10,
        };
        for k in 0..10u16 {
            let r = range.resolve_offset(100 + k);
            assert_eq!(r.offset, k);
            assert!(!r.fallback);
        }
    }

    #[test]
    fn test_resolve_offset_relative() {
        let range = RegisterRange {
            function_code: 3,
            start_address: 200,
            count: 10,
        };
        let r = range.resolve_offset(4);
        assert_eq!(r.offset, 4);
        assert!(!r.fallback);
    }

    #[test]
    fn test_resolve_offset_absolute_wins_over_relative() {
        // Index 3 is both a valid offset and a valid address here; absolute
        // interpretation takes precedence.
        let range = RegisterRange {
            function_code: 3,
            start_address: 0,
            count: 10,
        };
        let r = range.resolve_offset(3);
        assert_eq!(r.offset, 3);
        assert!(!r.fallback);
    }

    #[test]
    fn test_resolve_offset_fallback() {
        let range = RegisterRange {
            function_code: 3,
            start_address: 100,
            count: 10,
        };
        let r = range.resolve_offset(50);
        assert_eq!(r.offset, 50);
        assert!(r.fallback);
    }

    #[test]
    fn test_range_validation() {
        let ok = RegisterRange {
            function_code: 3,
            start_address: 0,
            count: 125,
        };
        assert!(ok.validate().is_ok());

        let bad_fc = RegisterRange {
            function_code: 7,
            start_address: 0,
            count: 1,
        };
        assert!(bad_fc.validate().is_err());

        let too_many = RegisterRange {
            function_code: 3,
            start_address: 0,
            count: 126,
        };
        assert!(too_many.validate().is_err());

        let coils_ok = RegisterRange {
            function_code: 1,
            start_address: 0,
            count: 2000,
        };
        assert!(coils_ok.validate().is_ok());

        let overflow = RegisterRange {
            function_code: 3,
            start_address: 65_500,
            count: 40,
        };
        assert!(overflow.validate().is_err());
    }

    #[test]
    fn test_device_defaults() {
        let device = tcp_device("d1");
        assert_eq!(device.timeout_ms(), DEFAULT_TCP_TIMEOUT_MS);
        assert_eq!(device.poll_interval_ms(), 60_000);
        assert_eq!(device.address_base(), 0);
        assert_eq!(device.default_byte_order(), ByteOrder::Abcd);
    }

    #[test]
    fn test_device_limits_overrides() {
        let mut device = tcp_device("d1");
        assert_eq!(device.limits().max_read_registers, 125);

        device.advanced.max_read_registers = Some(40);
        device.advanced.inter_request_delay_ms = Some(15);
        let limits = device.limits();
        assert_eq!(limits.max_read_registers, 40);
        assert_eq!(limits.inter_request_delay_ms, 15);
    }

    #[test]
    fn test_byte_order_make_table() {
        let mut device = tcp_device("d1");
        device.make = Some("Acme Energy Analyzer 3000".into());
        assert_eq!(device.default_byte_order(), ByteOrder::Cdab);
        device.make = Some("Made in China PLC".into());
        assert_eq!(device.default_byte_order(), ByteOrder::Cdab);
        device.make = Some("Siemens S7".into());
        assert_eq!(device.default_byte_order(), ByteOrder::Badc);
        device.make = Some("Schneider Electric".into());
        assert_eq!(device.default_byte_order(), ByteOrder::Abcd);
        device.make = None;
        assert_eq!(device.default_byte_order(), ByteOrder::Abcd);
    }

    #[test]
    fn test_address_base() {
        let mut device = tcp_device("d1");
        assert_eq!(device.address_base(), 0);

        // Legacy marker only applies behind the compatibility flag.
        device.advanced.retries = 0;
        assert_eq!(device.address_base(), 0);
        device.advanced.legacy_retries_address_flag = true;
        assert_eq!(device.address_base(), 1);
        device.advanced.retries = 3;
        assert_eq!(device.address_base(), 0);

        // Explicit base always wins.
        device.advanced.address_base = Some(1);
        assert_eq!(device.address_base(), 1);
        device.advanced.address_base = Some(0);
        device.advanced.retries = 0;
        assert_eq!(device.address_base(), 0);
    }

    #[test]
    fn test_transport_validation() {
        let mut device = tcp_device("d1");
        assert!(device.validate().is_ok());

        device.transport = TransportConfig::Rtu {
            path: "/dev/ttyUSB0".into(),
            baud: 9600,
            data_bits: 8,
            stop_bits: 1,
            parity: Parity::None,
            unit_id: 3,
        };
        assert!(device.validate().is_ok());

        device.transport = TransportConfig::Rtu {
            path: "/dev/ttyUSB0".into(),
            baud: 9600,
            data_bits: 9,
            stop_bits: 1,
            parity: Parity::None,
            unit_id: 3,
        };
        assert!(device.validate().is_err());
    }

    #[test]
    fn test_unknown_fields_preserved() {
        let json = serde_json::json!({
            "id": "d9",
            "name": "meter",
            "enabled": true,
            "transport": {"type": "tcp", "host": "h", "port": 502, "unit_id": 1},
            "vendor_blob": {"color": "blue"},
        });
        let device: Device = serde_json::from_value(json).unwrap();
        assert!(device.extra.contains_key("vendor_blob"));

        let back = serde_json::to_value(&device).unwrap();
        assert_eq!(back["vendor_blob"]["color"], "blue");
    }

    #[test]
    fn test_clock_time_parse() {
        let t: ClockTime = "08:30".parse().unwrap();
        assert_eq!(t, ClockTime { hour: 8, minute: 30 });
        assert_eq!(t.minutes(), 510);
        assert_eq!(t.to_string(), "08:30");

        assert!("24:00".parse::<ClockTime>().is_err());
        assert!("08:60".parse::<ClockTime>().is_err());
        assert!("0830".parse::<ClockTime>().is_err());
    }

    #[test]
    fn test_day_spec_matching() {
        use chrono::Weekday;
        assert!(DaySpec::Weekday.matches(Weekday::Tue));
        assert!(!DaySpec::Weekday.matches(Weekday::Sat));
        assert!(DaySpec::Weekend.matches(Weekday::Sun));
        assert!(DaySpec::All.matches(Weekday::Wed));
        assert!(DaySpec::Fri.matches(Weekday::Fri));
        assert!(!DaySpec::Fri.matches(Weekday::Mon));
    }

    fn rule(start: &str, end: &str) -> ScheduleRule {
        ScheduleRule {
            id: "r1".into(),
            enabled: true,
            days: vec![DaySpec::All],
            start_time: start.parse().unwrap(),
            end_time: end.parse().unwrap(),
            setpoint: 22.0,
            default_setpoint: Some(28.0),
            return_to_default: true,
            parameter: "setpoint".into(),
            register_address: None,
        }
    }

    #[test]
    fn test_rule_window() {
        let r = rule("08:00", "18:00");
        assert!(!r.contains_minute(479));
        assert!(r.contains_minute(480));
        assert!(r.contains_minute(720));
        assert!(r.contains_minute(1080));
        assert!(!r.contains_minute(1081));
    }

    #[test]
    fn test_rule_window_across_midnight() {
        let r = rule("22:00", "06:00");
        assert!(r.contains_minute(22 * 60));
        assert!(r.contains_minute(23 * 60 + 59));
        assert!(r.contains_minute(0));
        assert!(r.contains_minute(6 * 60));
        assert!(!r.contains_minute(6 * 60 + 1));
        assert!(!r.contains_minute(12 * 60));
    }

    #[test]
    fn test_schedule_date_window() {
        let mut schedule = DeviceSchedule {
            id: "s1".into(),
            device_id: "d1".into(),
            template_id: "t1".into(),
            custom_rules: Vec::new(),
            active: true,
            start_date: Some(NaiveDate::from_ymd_opt(2025, 6, 1).unwrap()),
            end_date: Some(NaiveDate::from_ymd_opt(2025, 6, 30).unwrap()),
            current_active_rule: None,
            last_applied: None,
            extra: serde_json::Map::new(),
        };

        assert!(schedule.covers_date(NaiveDate::from_ymd_opt(2025, 6, 15).unwrap()));
        assert!(!schedule.covers_date(NaiveDate::from_ymd_opt(2025, 5, 31).unwrap()));
        assert!(!schedule.covers_date(NaiveDate::from_ymd_opt(2025, 7, 1).unwrap()));

        schedule.start_date = None;
        schedule.end_date = None;
        assert!(schedule.covers_date(NaiveDate::from_ymd_opt(2030, 1, 1).unwrap()));
    }

    #[test]
    fn test_reading_lookup() {
        let reading = Reading {
            device_id: "d1".into(),
            timestamp: Utc::now(),
            entries: vec![
                ReadingEntry {
                    name: "Room Temp".into(),
                    address: 0,
                    value: Some(PointValue::Number(21.5)),
                    unit: Some("C".into()),
                    data_type: DataType::Float32,
                    error: None,
                },
                ReadingEntry {
                    name: "CentralControl".into(),
                    address: 2,
                    value: Some(PointValue::Bool(true)),
                    unit: None,
                    data_type: DataType::Bool,
                    error: None,
                },
            ],
        };

        assert!(reading.entry("room temp").is_some());
        assert!(reading.entry("missing").is_none());
        assert!(reading.entry_containing("control").is_some());
        assert!(reading.entry_containing("schedule").is_none());
    }
}

//! Setpoint manager
//!
//! Consumes schedule events and turns them into register writes. Every
//! event resolves its target parameter on the device (by name, falling
//! back to a parameter literally called "setpoint"), checks the device's
//! central-control and schedule bits from the latest cached reading, picks
//! the value (rule setpoint on Start, rule or parameter default on End)
//! and writes it with the function code the target's width demands: FC16
//! for multi-register types, FC6 for single registers, FC5 for coils.
//!
//! Large steps ramp instead of jumping: when the previous written value
//! differs from the target by more than a hair, a linear transition is
//! installed and a five-second tick re-writes the interpolated value until
//! the ramp completes. Writes that fall in the same tick are coalesced per
//! device, merging strictly consecutive registers into a single request.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::bytes::ByteOrder;
use crate::constants::{FC_READ_HOLDING_REGISTERS, FC_WRITE_MULTIPLE_REGISTERS,
    FC_WRITE_SINGLE_COIL, FC_WRITE_SINGLE_REGISTER};
use crate::error::{GatewayError, GatewayResult};
use crate::model::{Device, DeviceId, ScheduleRule};
use crate::repository::{DevicePatch, DeviceRepository, EventKind, EventLog, EventLogEntry,
    SchedulePatch, ScheduleRepository};
use crate::scaling::Scaling;
use crate::schedule::{ScheduleAction, ScheduleEvent};
use crate::state::{CoreState, SetpointTransition};
use crate::value::DataType;

/// Ramp length when a transition is installed.
pub const DEFAULT_TRANSITION_DURATION_MS: u64 = 60_000;

/// Period of the transition re-write tick.
pub const TRANSITION_TICK: Duration = Duration::from_secs(5);

/// Steps smaller than this write directly instead of ramping.
const TRANSITION_THRESHOLD: f64 = 0.01;

/// Setpoint manager policy.
#[derive(Debug, Clone)]
pub struct SetpointConfig {
    /// Skip the central-control/schedule bit gate
    pub bypass_schedule_bit_check: bool,
    /// Ramp large steps instead of writing them at once
    pub gradual_transition: bool,
    /// Ramp length
    pub transition_duration: Duration,
}

impl Default for SetpointConfig {
    fn default() -> Self {
        Self {
            bypass_schedule_bit_check: false,
            gradual_transition: false,
            transition_duration: Duration::from_millis(DEFAULT_TRANSITION_DURATION_MS),
        }
    }
}

/// A resolved write destination on a device.
#[derive(Debug, Clone)]
struct WriteTarget {
    address: u16,
    data_type: DataType,
    byte_order: ByteOrder,
    scaling: Scaling,
    bit_position: Option<u8>,
    function_code: Option<u8>,
    default_value: Option<f64>,
}

/// One encoded write ready for the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PendingWrite {
    pub device_id: DeviceId,
    pub function_code: u8,
    pub address: u16,
    pub registers: Vec<u16>,
}

/// Merge strictly consecutive single-register writes per device into one
/// FC16 request. Coil writes and multi-register writes pass through.
pub(crate) fn coalesce_writes(mut writes: Vec<PendingWrite>) -> Vec<PendingWrite> {
    writes.sort_by(|a, b| {
        (&a.device_id, a.function_code, a.address).cmp(&(&b.device_id, b.function_code, b.address))
    });

    let mut out: Vec<PendingWrite> = Vec::with_capacity(writes.len());
    for write in writes {
        if write.function_code == FC_WRITE_SINGLE_REGISTER
            || write.function_code == FC_WRITE_MULTIPLE_REGISTERS
        {
            if let Some(last) = out.last_mut() {
                let mergeable = last.device_id == write.device_id
                    && matches!(
                        last.function_code,
                        FC_WRITE_SINGLE_REGISTER | FC_WRITE_MULTIPLE_REGISTERS
                    )
                    && u32::from(last.address) + last.registers.len() as u32
                        == u32::from(write.address);
                if mergeable {
                    last.registers.extend_from_slice(&write.registers);
                    last.function_code = FC_WRITE_MULTIPLE_REGISTERS;
                    continue;
                }
            }
        }
        out.push(write);
    }
    out
}

/// Applies schedule events and drives setpoint transitions.
pub struct SetpointManager {
    state: Arc<CoreState>,
    devices: Arc<dyn DeviceRepository>,
    schedules: Arc<dyn ScheduleRepository>,
    event_log: Arc<dyn EventLog>,
    config: SetpointConfig,
    connect_timeout: Duration,
}

impl SetpointManager {
    /// Create a manager over the shared state and collaborators.
    pub fn new(
        state: Arc<CoreState>,
        devices: Arc<dyn DeviceRepository>,
        schedules: Arc<dyn ScheduleRepository>,
        event_log: Arc<dyn EventLog>,
        config: SetpointConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            state,
            devices,
            schedules,
            event_log,
            config,
            connect_timeout: Duration::from_millis(crate::constants::DEFAULT_CONNECT_TIMEOUT_MS),
        })
    }

    /// Consume schedule events and run the transition tick until the event
    /// stream closes.
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<ScheduleEvent>) {
        let mut ticker = tokio::time::interval(TRANSITION_TICK);
        loop {
            tokio::select! {
                maybe_event = events.recv() => match maybe_event {
                    Some(event) => {
                        if let Err(e) = self.handle_event(&event).await {
                            warn!(
                                "Schedule event for {} not applied: {e}",
                                event.schedule.device_id
                            );
                        }
                    }
                    None => break,
                },
                _ = ticker.tick() => self.advance_transitions().await,
            }
        }
        info!("Setpoint manager stopped: event stream closed");
    }

    /// Apply one schedule event.
    pub async fn handle_event(&self, event: &ScheduleEvent) -> GatewayResult<()> {
        let device_id = &event.schedule.device_id;
        let device = self
            .devices
            .find_by_id(device_id)
            .await?
            .ok_or_else(|| GatewayError::config(format!("Unknown device: {device_id}")))?;

        let target = resolve_target(&device, &event.rule).ok_or_else(|| {
            GatewayError::config(format!(
                "No parameter named {:?} (or \"setpoint\") on {device_id}",
                event.rule.parameter
            ))
        })?;

        self.check_control_bits(&device)?;

        let value = match event.action {
            ScheduleAction::Start => event.rule.setpoint,
            ScheduleAction::End => event
                .rule
                .default_setpoint
                .or(target.default_value)
                .ok_or_else(|| {
                    GatewayError::config(format!(
                        "Rule {} has no default to return {device_id} to",
                        event.rule.id
                    ))
                })?,
        };

        let key = (device.id.clone(), target.address);
        let previous = self.state.setpoints.get(&key).map(|v| *v);

        if self.config.gradual_transition {
            if let Some(previous) = previous {
                if (previous - value).abs() > TRANSITION_THRESHOLD {
                    // The five-second tick walks the value over; nothing is
                    // written right now.
                    self.state.transitions.insert(
                        key,
                        SetpointTransition {
                            start_value: previous,
                            target_value: value,
                            started_at: Instant::now(),
                            duration: self.config.transition_duration,
                        },
                    );
                    debug!(
                        "Transition installed on {device_id}@{}: {previous} -> {value}",
                        target.address
                    );
                    self.record_applied(event, value).await;
                    return Ok(());
                }
            }
        }

        self.write_target(&device, &target, value).await?;
        self.record_applied(event, value).await;
        Ok(())
    }

    /// Invariant gate: a device whose central-control or schedule bit is
    /// off stays under local control.
    fn check_control_bits(&self, device: &Device) -> GatewayResult<()> {
        if self.config.bypass_schedule_bit_check {
            return Ok(());
        }
        let Some(reading) = self.state.cache.get(&device.id) else {
            // Nothing cached to veto with.
            return Ok(());
        };

        let control_ok = reading
            .entry_containing("control")
            .and_then(|e| e.value.as_ref())
            .and_then(|v| v.as_bool())
            .unwrap_or(true);
        if !control_ok {
            return Err(GatewayError::ControlInhibited {
                device_id: device.id.clone(),
                message: "central-control bit is off".into(),
            });
        }

        let schedule_ok = reading
            .entry_containing("schedule")
            .and_then(|e| e.value.as_ref())
            .and_then(|v| v.as_bool())
            .unwrap_or(true);
        if !schedule_ok {
            return Err(GatewayError::ControlInhibited {
                device_id: device.id.clone(),
                message: "schedule bit is off".into(),
            });
        }

        Ok(())
    }

    /// Encode and push one value to one target, remembering it in the
    /// setpoint cache.
    async fn write_target(
        &self,
        device: &Device,
        target: &WriteTarget,
        value: f64,
    ) -> GatewayResult<()> {
        // Register-bit targets need the surrounding register bits kept.
        if target.data_type == DataType::Bool
            && target.function_code == Some(FC_WRITE_SINGLE_REGISTER)
        {
            self.write_register_bit(device, target, value != 0.0).await?;
        } else {
            let write = encode_target_write(device, target, value)?;
            self.issue_writes(device, vec![write]).await?;
        }

        self.state
            .setpoints
            .insert((device.id.clone(), target.address), value);

        if let Err(e) = self
            .devices
            .update_partial(&device.id, DevicePatch::controlled_now())
            .await
        {
            warn!("Could not update last_controlled_at for {}: {e}", device.id);
        }
        Ok(())
    }

    /// Set or clear one bit of a holding register, preserving the rest.
    async fn write_register_bit(
        &self,
        device: &Device,
        target: &WriteTarget,
        on: bool,
    ) -> GatewayResult<()> {
        let bit = target.bit_position.unwrap_or(0);
        let session = self.state.sessions.get_or_create(
            device,
            Arc::clone(&self.state.ports),
            self.connect_timeout,
        )?;
        let mut session = session.lock().await;

        let current = session
            .read_range(FC_READ_HOLDING_REGISTERS, target.address, 1)
            .await?[0];
        let updated = if on {
            current | (1 << bit)
        } else {
            current & !(1 << bit)
        };
        session
            .write_single(FC_WRITE_SINGLE_REGISTER, target.address, updated)
            .await
    }

    /// Push a batch of encoded writes through the device's session.
    async fn issue_writes(&self, device: &Device, writes: Vec<PendingWrite>) -> GatewayResult<()> {
        let session = self.state.sessions.get_or_create(
            device,
            Arc::clone(&self.state.ports),
            self.connect_timeout,
        )?;
        let mut session = session.lock().await;

        for write in coalesce_writes(writes) {
            match write.function_code {
                FC_WRITE_SINGLE_COIL => {
                    session
                        .write_single(FC_WRITE_SINGLE_COIL, write.address, write.registers[0])
                        .await?
                }
                FC_WRITE_SINGLE_REGISTER => {
                    session
                        .write_single(FC_WRITE_SINGLE_REGISTER, write.address, write.registers[0])
                        .await?
                }
                _ => {
                    session
                        .write_multiple(
                            FC_WRITE_MULTIPLE_REGISTERS,
                            write.address,
                            &write.registers,
                        )
                        .await?
                }
            }
        }
        Ok(())
    }

    /// Walk every in-flight transition one tick forward, re-writing the
    /// interpolated value and retiring completed ramps.
    pub async fn advance_transitions(&self) {
        let now = Instant::now();
        let keys: Vec<(DeviceId, u16)> = self
            .state
            .transitions
            .iter()
            .map(|e| e.key().clone())
            .collect();

        // Collect the writes due this tick, then flush them per device so
        // consecutive registers can merge.
        let mut due: Vec<(Device, WriteTarget, f64, bool)> = Vec::new();
        for key in keys {
            let Some(transition) = self.state.transitions.get(&key).map(|t| t.clone()) else {
                continue;
            };
            let value = transition.value_at(now);
            let complete = transition.is_complete(now);

            let device = match self.devices.find_by_id(&key.0).await {
                Ok(Some(device)) => device,
                Ok(None) => {
                    debug!("Transition target {} vanished; dropping ramp", key.0);
                    self.state.transitions.remove(&key);
                    continue;
                }
                Err(e) => {
                    debug!("Transition tick could not load {}: {e}", key.0);
                    continue;
                }
            };
            let Some(target) = resolve_target_by_address(&device, key.1) else {
                self.state.transitions.remove(&key);
                continue;
            };
            due.push((device, target, value, complete));
        }

        let mut writes: Vec<PendingWrite> = Vec::new();
        let mut devices: Vec<Device> = Vec::new();
        for (device, target, value, complete) in &due {
            match encode_target_write(device, target, *value) {
                Ok(write) => {
                    if !devices.iter().any(|d| d.id == device.id) {
                        devices.push(device.clone());
                    }
                    writes.push(write);
                    self.state
                        .setpoints
                        .insert((device.id.clone(), target.address), *value);
                    if *complete {
                        self.state
                            .transitions
                            .remove(&(device.id.clone(), target.address));
                    }
                }
                Err(e) => {
                    warn!("Transition encode failed for {}: {e}", device.id);
                    self.state
                        .transitions
                        .remove(&(device.id.clone(), target.address));
                }
            }
        }

        for device in devices {
            let device_writes: Vec<PendingWrite> = writes
                .iter()
                .filter(|w| w.device_id == device.id)
                .cloned()
                .collect();
            if let Err(e) = self.issue_writes(&device, device_writes).await {
                warn!("Transition write failed for {}: {e}", device.id);
            }
        }
    }

    /// Persist the applied state and journal the action. Logging trouble
    /// never surfaces.
    async fn record_applied(&self, event: &ScheduleEvent, value: f64) {
        let patch = SchedulePatch {
            current_active_rule: Some(match event.action {
                ScheduleAction::Start => Some(event.rule.id.clone()),
                ScheduleAction::End => None,
            }),
            last_applied: Some(Utc::now()),
        };
        if let Err(e) = self.schedules.update_schedule(&event.schedule.id, patch).await {
            warn!("Could not update schedule {}: {e}", event.schedule.id);
        }

        let entry = EventLogEntry {
            kind: EventKind::Info,
            message: format!(
                "Schedule rule {} {} {:.3} on {}",
                event.rule.id,
                match event.action {
                    ScheduleAction::Start => "applied",
                    ScheduleAction::End => "restored",
                },
                value,
                event.schedule.device_id
            ),
            device_id: Some(event.schedule.device_id.clone()),
            user_id: None,
            timestamp: Utc::now(),
        };
        if let Err(e) = self.event_log.append(entry).await {
            debug!("Event log append failed: {e}");
        }
    }
}

/// Find the write destination a rule names on a device.
///
/// Search order: explicit register address on the rule, then writable
/// registers by name, then data-point parameters by name, then the same
/// two lookups for a parameter literally named "setpoint".
fn resolve_target(device: &Device, rule: &ScheduleRule) -> Option<WriteTarget> {
    if let Some(address) = rule.register_address {
        if let Some(target) = resolve_target_by_address(device, address) {
            return Some(target);
        }
    }
    resolve_target_by_name(device, &rule.parameter)
        .or_else(|| resolve_target_by_name(device, "setpoint"))
}

fn resolve_target_by_name(device: &Device, name: &str) -> Option<WriteTarget> {
    if let Some(writable) = device
        .writable_registers
        .iter()
        .flatten()
        .chain(device.control_parameters.iter().flatten())
        .find(|w| w.name.eq_ignore_ascii_case(name))
    {
        return Some(WriteTarget {
            address: writable.address,
            data_type: writable.data_type,
            byte_order: writable.byte_order.unwrap_or_else(|| device.default_byte_order()),
            scaling: Scaling::default(),
            bit_position: None,
            function_code: None,
            default_value: None,
        });
    }

    for point in &device.data_points {
        for parameter in &point.parser.parameters {
            if parameter.name.eq_ignore_ascii_case(name) {
                let resolved = point.range.resolve_offset(parameter.register_index);
                let address = point
                    .range
                    .start_address
                    .saturating_add(resolved.offset)
                    .saturating_sub(device.address_base());
                return Some(WriteTarget {
                    address,
                    data_type: parameter.data_type,
                    byte_order: parameter
                        .byte_order
                        .unwrap_or_else(|| device.default_byte_order()),
                    scaling: parameter.scaling.clone(),
                    bit_position: parameter.bit_position,
                    function_code: parameter.function_code,
                    default_value: parameter.default_value,
                });
            }
        }
    }
    None
}

/// Find a write destination by absolute register address.
fn resolve_target_by_address(device: &Device, address: u16) -> Option<WriteTarget> {
    if let Some(writable) = device
        .writable_registers
        .iter()
        .flatten()
        .chain(device.control_parameters.iter().flatten())
        .find(|w| w.address == address)
    {
        return Some(WriteTarget {
            address,
            data_type: writable.data_type,
            byte_order: writable.byte_order.unwrap_or_else(|| device.default_byte_order()),
            scaling: Scaling::default(),
            bit_position: None,
            function_code: None,
            default_value: None,
        });
    }

    for point in &device.data_points {
        for parameter in &point.parser.parameters {
            let resolved = point.range.resolve_offset(parameter.register_index);
            let absolute = point
                .range
                .start_address
                .saturating_add(resolved.offset)
                .saturating_sub(device.address_base());
            if absolute == address {
                return Some(WriteTarget {
                    address,
                    data_type: parameter.data_type,
                    byte_order: parameter
                        .byte_order
                        .unwrap_or_else(|| device.default_byte_order()),
                    scaling: parameter.scaling.clone(),
                    bit_position: parameter.bit_position,
                    function_code: parameter.function_code,
                    default_value: parameter.default_value,
                });
            }
        }
    }
    None
}

/// Undo the target's scaling factor, encode the raw value and pick the
/// function code its width demands.
fn encode_target_write(
    device: &Device,
    target: &WriteTarget,
    value: f64,
) -> GatewayResult<PendingWrite> {
    if target.data_type == DataType::Bool && target.function_code != Some(FC_WRITE_SINGLE_REGISTER)
    {
        return Ok(PendingWrite {
            device_id: device.id.clone(),
            function_code: FC_WRITE_SINGLE_COIL,
            address: target.address,
            registers: vec![u16::from(value != 0.0)],
        });
    }

    let raw = crate::scaling::unapply_factor(value, &target.scaling);
    let registers = crate::codec::encode_value(raw, target.data_type, target.byte_order)?;
    let function_code = if registers.len() == 1 {
        FC_WRITE_SINGLE_REGISTER
    } else {
        FC_WRITE_MULTIPLE_REGISTERS
    };

    Ok(PendingWrite {
        device_id: device.id.clone(),
        function_code,
        address: target.address,
        registers,
    })
}

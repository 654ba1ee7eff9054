//! Connection diagnostics
//!
//! `test_connection` probes one device end to end and reports a structured
//! verdict the outer layers can show an operator: status, a classified
//! error type, a human message and concrete troubleshooting hints. Error
//! classification is the one place in the crate that matches on error
//! text, because serial and socket stacks only expose some distinctions
//! that way.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::error::{ExceptionCode, GatewayError};
use crate::model::{Device, TransportConfig};
use crate::repository::DeviceRepository;
use crate::session::session_for_device;
use crate::state::CoreState;

/// Outcome classification for a connection test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TestErrorType {
    /// TCP endpoint actively refused
    ConnectionRefused,
    /// Connect attempt hit its deadline
    ConnectionTimeout,
    /// Serial port is owned by another session
    PortBusy,
    /// Serial device node does not exist
    PortNotFound,
    /// Link is up but the unit never answered
    DeviceNoResponse,
    /// Device rejected the probe function code
    IllegalFunction,
    /// Device rejected the probe address
    IllegalAddress,
    /// Serial port was closed mid-probe
    PortNotOpen,
    /// Anything else on the wire
    ConnectionError,
    /// No such device id
    NotFound,
    /// Device exists but is disabled
    DeviceDisabled,
}

/// Structured result of a connection test.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionReport {
    /// "ok" or "failed"
    pub status: String,
    /// Classified failure, absent on success
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<TestErrorType>,
    /// Human-readable summary
    pub message: String,
    /// Concrete next steps for the operator
    pub troubleshooting: Vec<String>,
    /// Identity and endpoint of the tested device
    pub device_info: serde_json::Value,
    /// When the test ran
    pub timestamp: DateTime<Utc>,
}

impl ConnectionReport {
    fn ok(device: &Device, message: String) -> Self {
        Self {
            status: "ok".into(),
            error_type: None,
            message,
            troubleshooting: Vec::new(),
            device_info: device_info(device),
            timestamp: Utc::now(),
        }
    }

    fn failed(device_info: serde_json::Value, error_type: TestErrorType, message: String) -> Self {
        Self {
            status: "failed".into(),
            error_type: Some(error_type),
            message,
            troubleshooting: troubleshooting(error_type),
            device_info,
            timestamp: Utc::now(),
        }
    }
}

fn device_info(device: &Device) -> serde_json::Value {
    let endpoint = match &device.transport {
        TransportConfig::Tcp { host, port, unit_id, .. } => {
            json!({"kind": "tcp", "endpoint": format!("{host}:{port}"), "unit_id": unit_id})
        }
        TransportConfig::Rtu { path, baud, unit_id, .. } => {
            json!({"kind": "rtu", "endpoint": path, "baud": baud, "unit_id": unit_id})
        }
    };
    json!({
        "id": device.id,
        "name": device.name,
        "transport": endpoint,
    })
}

fn troubleshooting(error_type: TestErrorType) -> Vec<String> {
    let hints: &[&str] = match error_type {
        TestErrorType::ConnectionRefused => &[
            "Verify the device IP address and TCP port",
            "Check that the device or gateway has Modbus TCP enabled",
            "Look for a firewall between the gateway and the device",
        ],
        TestErrorType::ConnectionTimeout => &[
            "Verify the device is powered and on the network",
            "Check cabling and switch ports along the path",
            "Raise the connect timeout for slow links",
        ],
        TestErrorType::PortBusy => &[
            "Another session currently owns this serial port",
            "Stop polling for devices sharing the port before testing",
        ],
        TestErrorType::PortNotFound => &[
            "Verify the serial device path exists on this host",
            "Check that the USB-serial adapter is plugged in",
            "Confirm the gateway user may access the device node",
        ],
        TestErrorType::DeviceNoResponse => &[
            "Verify the unit id matches the device's address switch",
            "Check RS-485 A/B wiring polarity and termination",
            "Confirm baud rate, parity and stop bits match the device",
        ],
        TestErrorType::IllegalFunction => &[
            "The device answered but rejects this function code",
            "Pick a function code the device documents as supported",
        ],
        TestErrorType::IllegalAddress => &[
            "The device answered but the probe address is outside its map",
            "Adjust the data point start address or the register base",
        ],
        TestErrorType::PortNotOpen => &[
            "The serial port closed during the test; check the adapter",
        ],
        TestErrorType::ConnectionError => &[
            "Inspect gateway logs for the underlying transport error",
        ],
        TestErrorType::NotFound => &["No device with this id exists"],
        TestErrorType::DeviceDisabled => &["Enable the device before testing"],
    };
    hints.iter().map(|s| (*s).to_string()).collect()
}

/// Map a transport/session failure onto the operator-facing taxonomy.
fn classify(error: &GatewayError, connected: bool) -> TestErrorType {
    match error {
        GatewayError::BusyInProgress { .. } => TestErrorType::PortBusy,
        GatewayError::Timeout { .. } => {
            if connected {
                TestErrorType::DeviceNoResponse
            } else {
                TestErrorType::ConnectionTimeout
            }
        }
        GatewayError::ModbusException { code, .. } => match code {
            ExceptionCode::IllegalFunction => TestErrorType::IllegalFunction,
            ExceptionCode::IllegalDataAddress => TestErrorType::IllegalAddress,
            _ => TestErrorType::ConnectionError,
        },
        GatewayError::Transport { message } => {
            let lower = message.to_ascii_lowercase();
            if lower.contains("refused") {
                TestErrorType::ConnectionRefused
            } else if lower.contains("no such file") || lower.contains("not found") {
                TestErrorType::PortNotFound
            } else if lower.contains("not open") || lower.contains("closed") {
                TestErrorType::PortNotOpen
            } else {
                TestErrorType::ConnectionError
            }
        }
        _ => TestErrorType::ConnectionError,
    }
}

/// Probe one device: connect, issue a small read, classify the outcome.
///
/// Uses a throwaway session so a failed probe cannot poison the pooled
/// one. On a shared serial port the probe may legitimately report
/// `PORT_BUSY` while polling is active.
pub async fn test_connection(
    state: &Arc<CoreState>,
    devices: &Arc<dyn DeviceRepository>,
    device_id: &str,
) -> ConnectionReport {
    let device = match devices.find_by_id(device_id).await {
        Ok(Some(device)) => device,
        Ok(None) => {
            return ConnectionReport::failed(
                json!({ "id": device_id }),
                TestErrorType::NotFound,
                format!("Device {device_id} not found"),
            );
        }
        Err(e) => {
            return ConnectionReport::failed(
                json!({ "id": device_id }),
                TestErrorType::ConnectionError,
                format!("Device lookup failed: {e}"),
            );
        }
    };

    if !device.enabled {
        return ConnectionReport::failed(
            device_info(&device),
            TestErrorType::DeviceDisabled,
            format!("Device {device_id} is disabled"),
        );
    }

    let connect_timeout = Duration::from_millis(device.timeout_ms().max(1000));
    let mut session =
        match session_for_device(&device, Arc::clone(&state.ports), connect_timeout) {
            Ok(session) => session,
            Err(e) => {
                return ConnectionReport::failed(
                    device_info(&device),
                    TestErrorType::ConnectionError,
                    e.to_string(),
                );
            }
        };

    if let Err(e) = session.connect().await {
        debug!("Connection test connect failed for {device_id}: {e}");
        return ConnectionReport::failed(device_info(&device), classify(&e, false), e.to_string());
    }

    // Probe with the first configured range, or a one-register read when
    // the device defines none.
    let (fc, address, count) = device
        .data_points
        .first()
        .map(|p| {
            (
                p.range.function_code,
                p.range.start_address.saturating_sub(device.address_base()),
                p.range.count.min(4),
            )
        })
        .unwrap_or((crate::constants::FC_READ_HOLDING_REGISTERS, 0, 1));

    let result = session.read_range(fc, address, count).await;
    let _ = session.close().await;

    match result {
        Ok(words) => ConnectionReport::ok(
            &device,
            format!("Read {} value(s) from FC{fc:02} @ {address}", words.len()),
        ),
        Err(e) => {
            debug!("Connection test probe failed for {device_id}: {e}");
            ConnectionReport::failed(device_info(&device), classify(&e, true), e.to_string())
        }
    }
}

//! Per-device Modbus session
//!
//! A session wraps one transport and a unit id and layers policy on top of
//! the raw exchange: a connect state machine, bounded retries with sleeps
//! between attempts, and reconnect-before-retry when the link has dropped.
//! Exception responses are never retried; the device answered, and asking
//! the same question again will not change its mind. One request is in
//! flight per session at any time, enforced by `&mut self` on every
//! operation.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::constants::{FC_READ_COILS, FC_READ_DISCRETE_INPUTS, FC_WRITE_MULTIPLE_COILS,
    FC_WRITE_MULTIPLE_REGISTERS, FC_WRITE_SINGLE_COIL, FC_WRITE_SINGLE_REGISTER};
use crate::device_limits::DeviceLimits;
use crate::error::{GatewayError, GatewayResult};
use crate::model::Device;
use crate::pdu::{parse_read_response, parse_write_response, unpack_bits, ModbusPdu, PduBuilder};
use crate::transport::Transport;

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No connection
    Disconnected,
    /// Connect in progress
    Connecting,
    /// Link established, requests accepted
    Connected,
    /// Orderly teardown in progress
    Disconnecting,
    /// Unexpected close or send failure
    Error,
}

/// Session policy knobs, usually derived from a device definition.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Unit id addressed by every request
    pub unit_id: u8,
    /// Per-request deadline
    pub timeout: Duration,
    /// Additional attempts after the first failure
    pub retries: u32,
    /// Sleep between attempts
    pub retry_interval: Duration,
    /// Reconnect before an attempt when the link is down
    pub auto_reconnect: bool,
    /// Ceiling on consecutive failed reconnects before giving up
    pub max_reconnect_attempts: u32,
}

impl SessionConfig {
    /// Derive session policy from a device definition.
    pub fn from_device(device: &Device) -> Self {
        Self {
            unit_id: device.transport.unit_id(),
            timeout: Duration::from_millis(device.timeout_ms()),
            retries: device.advanced.retries,
            retry_interval: Duration::from_millis(device.advanced.retry_interval_ms),
            auto_reconnect: true,
            max_reconnect_attempts: 10,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            unit_id: 1,
            timeout: Duration::from_millis(crate::constants::DEFAULT_TCP_TIMEOUT_MS),
            retries: 0,
            retry_interval: Duration::from_millis(1000),
            auto_reconnect: true,
            max_reconnect_attempts: 10,
        }
    }
}

/// One Modbus conversation with one device.
pub struct ModbusSession {
    transport: Box<dyn Transport>,
    config: SessionConfig,
    state_tx: watch::Sender<SessionState>,
    consecutive_reconnect_failures: u32,
}

impl ModbusSession {
    /// Wrap a transport with session policy.
    pub fn new(transport: Box<dyn Transport>, config: SessionConfig) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Disconnected);
        Self {
            transport,
            config,
            state_tx,
            consecutive_reconnect_failures: 0,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    /// Observe lifecycle transitions.
    pub fn state_watch(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// Session policy in effect.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Transport counters.
    pub fn transport_stats(&self) -> crate::transport::TransportStats {
        self.transport.stats()
    }

    fn set_state(&self, state: SessionState) {
        if *self.state_tx.borrow() != state {
            debug!("Session unit {} -> {:?}", self.config.unit_id, state);
            let _ = self.state_tx.send(state);
        }
    }

    /// Establish the connection.
    pub async fn connect(&mut self) -> GatewayResult<()> {
        if self.transport.is_connected() {
            self.set_state(SessionState::Connected);
            return Ok(());
        }
        self.set_state(SessionState::Connecting);
        match self.transport.connect().await {
            Ok(()) => {
                self.consecutive_reconnect_failures = 0;
                self.set_state(SessionState::Connected);
                Ok(())
            }
            Err(e) => {
                self.consecutive_reconnect_failures += 1;
                self.set_state(SessionState::Error);
                Err(e)
            }
        }
    }

    /// Tear the connection down.
    pub async fn close(&mut self) -> GatewayResult<()> {
        self.set_state(SessionState::Disconnecting);
        let result = self.transport.disconnect().await;
        self.set_state(SessionState::Disconnected);
        result
    }

    /// True while the link is usable.
    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Run one PDU exchange with the session's retry policy.
    ///
    /// Transport faults and timeouts are retried up to `retries` extra
    /// times with `retry_interval` sleeps in between; a Modbus exception
    /// response ends the request immediately.
    async fn execute(&mut self, pdu: &ModbusPdu) -> GatewayResult<ModbusPdu> {
        let attempts = self.config.retries.saturating_add(1);
        let mut last_error: Option<GatewayError> = None;

        for attempt in 0..attempts {
            if attempt > 0 {
                tokio::time::sleep(self.config.retry_interval).await;
            }

            if !self.transport.is_connected() {
                if !self.config.auto_reconnect {
                    return Err(last_error
                        .unwrap_or_else(|| GatewayError::transport("Session not connected")));
                }
                if self.consecutive_reconnect_failures >= self.config.max_reconnect_attempts {
                    return Err(GatewayError::transport(format!(
                        "Gave up after {} reconnect attempts",
                        self.consecutive_reconnect_failures
                    )));
                }
                if let Err(e) = self.connect().await {
                    warn!(
                        "Reconnect before attempt {} failed for unit {}: {e}",
                        attempt + 1,
                        self.config.unit_id
                    );
                    last_error = Some(e);
                    continue;
                }
            }

            match self
                .transport
                .request(self.config.unit_id, pdu, self.config.timeout)
                .await
            {
                // An exception response ends the request here; the remote
                // answered, retrying is pointless.
                Ok(response) => return response.reject_exception(),
                Err(e) if e.is_retryable() => {
                    if matches!(e, GatewayError::Transport { .. }) {
                        self.set_state(SessionState::Error);
                    }
                    debug!(
                        "Attempt {}/{} failed for unit {}: {e}",
                        attempt + 1,
                        attempts,
                        self.config.unit_id
                    );
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| GatewayError::transport("Request failed")))
    }

    // ------------------------------------------------------------------
    // Read operations
    // ------------------------------------------------------------------

    /// Read a range with FC 01-04.
    ///
    /// Register reads (FC 03/04) return one word per register; bit reads
    /// (FC 01/02) return one 0/1 word per coil so downstream decoding is
    /// uniform.
    pub async fn read_range(&mut self, fc: u8, address: u16, count: u16) -> GatewayResult<Vec<u16>> {
        let pdu = PduBuilder::read_request(fc, address, count)?;
        let response = self.execute(&pdu).await?;
        let raw = parse_read_response(&response, fc)?;

        if matches!(fc, FC_READ_COILS | FC_READ_DISCRETE_INPUTS) {
            Ok(unpack_bits(&raw, count)
                .into_iter()
                .map(u16::from)
                .collect())
        } else {
            if raw.len() < count as usize {
                return Err(GatewayError::frame(format!(
                    "Short read: asked {count} registers, got {}",
                    raw.len()
                )));
            }
            Ok(raw)
        }
    }

    /// Read a range wider than one request allows, split per device limits.
    pub async fn read_range_batch(
        &mut self,
        fc: u8,
        address: u16,
        count: u16,
        limits: &DeviceLimits,
    ) -> GatewayResult<Vec<u16>> {
        let chunks = limits.read_chunks(fc, address, count);
        let mut out = Vec::with_capacity(count as usize);
        let mut first = true;
        for (chunk_address, chunk_count) in chunks {
            if !first && limits.inter_request_delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(limits.inter_request_delay_ms)).await;
            }
            first = false;
            out.extend(self.read_range(fc, chunk_address, chunk_count).await?);
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Write operations
    // ------------------------------------------------------------------

    /// Write a single coil (FC05, value != 0 means ON) or register (FC06).
    pub async fn write_single(&mut self, fc: u8, address: u16, value: u16) -> GatewayResult<()> {
        let pdu = match fc {
            FC_WRITE_SINGLE_COIL => PduBuilder::write_single_coil(address, value != 0)?,
            FC_WRITE_SINGLE_REGISTER => PduBuilder::write_single_register(address, value)?,
            other => {
                return Err(GatewayError::config(format!(
                    "Not a single-write function code: {other:#04X}"
                )))
            }
        };
        let response = self.execute(&pdu).await?;
        parse_write_response(&response, fc)
    }

    /// Write multiple coils (FC15, value != 0 means ON) or registers (FC16).
    pub async fn write_multiple(&mut self, fc: u8, address: u16, values: &[u16]) -> GatewayResult<()> {
        let pdu = match fc {
            FC_WRITE_MULTIPLE_COILS => {
                let coils: Vec<bool> = values.iter().map(|&v| v != 0).collect();
                PduBuilder::write_multiple_coils(address, &coils)?
            }
            FC_WRITE_MULTIPLE_REGISTERS => PduBuilder::write_multiple_registers(address, values)?,
            other => {
                return Err(GatewayError::config(format!(
                    "Not a multi-write function code: {other:#04X}"
                )))
            }
        };
        let response = self.execute(&pdu).await?;
        parse_write_response(&response, fc)
    }

    /// Send a raw PDU with an arbitrary function code and return the raw
    /// response PDU bytes (exception responses already rejected).
    pub async fn execute_custom(&mut self, fc: u8, data: &[u8]) -> GatewayResult<Vec<u8>> {
        let mut pdu = ModbusPdu::new();
        pdu.push(fc)?;
        pdu.extend(data)?;
        let response = self.execute(&pdu).await?;
        Ok(response.as_slice().to_vec())
    }
}

/// Build a session for a device definition.
///
/// The transport variant follows the device's transport configuration; RTU
/// devices need the serial feature and a port registry to claim their
/// device node from.
pub fn session_for_device(
    device: &Device,
    registry: std::sync::Arc<crate::transport::PortRegistry>,
    connect_timeout: Duration,
) -> GatewayResult<ModbusSession> {
    let config = SessionConfig::from_device(device);
    match &device.transport {
        crate::model::TransportConfig::Tcp { host, port, .. } => {
            let transport =
                crate::transport::TcpTransport::new(format!("{host}:{port}"), connect_timeout);
            let _ = &registry;
            Ok(ModbusSession::new(Box::new(transport), config))
        }
        #[cfg(feature = "rtu")]
        crate::model::TransportConfig::Rtu { .. } => {
            let serial = crate::transport::SerialConfig::from_transport(&device.transport)
                .ok_or_else(|| GatewayError::config("Not an RTU transport"))?;
            let transport = crate::transport::RtuTransport::new(serial, registry);
            Ok(ModbusSession::new(Box::new(transport), config))
        }
        #[cfg(not(feature = "rtu"))]
        crate::model::TransportConfig::Rtu { .. } => Err(GatewayError::config(
            "RTU transport requires the `rtu` feature",
        )),
    }
}

/// Shared, per-device session pool.
///
/// The poller and the setpoint manager talk to the same device through the
/// same session, so a serial port has exactly one owner and the
/// one-request-in-flight rule holds across subsystems: every caller locks
/// the device's session for the duration of its exchange.
#[derive(Default)]
pub struct SessionPool {
    sessions: dashmap::DashMap<crate::model::DeviceId, std::sync::Arc<tokio::sync::Mutex<ModbusSession>>>,
}

impl SessionPool {
    /// Empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the device's session, creating it on first use.
    pub fn get_or_create(
        &self,
        device: &Device,
        registry: std::sync::Arc<crate::transport::PortRegistry>,
        connect_timeout: Duration,
    ) -> GatewayResult<std::sync::Arc<tokio::sync::Mutex<ModbusSession>>> {
        if let Some(existing) = self.sessions.get(&device.id) {
            return Ok(std::sync::Arc::clone(&existing));
        }
        let session = session_for_device(device, registry, connect_timeout)?;
        let entry = self
            .sessions
            .entry(device.id.clone())
            .or_insert_with(|| std::sync::Arc::new(tokio::sync::Mutex::new(session)));
        Ok(std::sync::Arc::clone(&entry))
    }

    /// Close and drop a device's session, e.g. on device deletion.
    pub async fn evict(&self, device_id: &str) {
        if let Some((_, session)) = self.sessions.remove(device_id) {
            let mut session = session.lock().await;
            if let Err(e) = session.close().await {
                warn!("Closing session for {device_id} failed: {e}");
            }
        }
    }

    /// Close every session; used on shutdown.
    pub async fn close_all(&self) {
        let ids: Vec<_> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.evict(&id).await;
        }
    }

    /// Number of pooled sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// True when no session has been created yet.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl std::fmt::Debug for SessionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionPool")
            .field("sessions", &self.sessions.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::sync::broadcast;

    /// Scripted transport: pops one canned result per request and records
    /// every call in shared cells the test keeps a handle to.
    struct ScriptedTransport {
        responses: Arc<Mutex<VecDeque<GatewayResult<ModbusPdu>>>>,
        requests: Arc<Mutex<Vec<Vec<u8>>>>,
        connected: Arc<AtomicBool>,
        connect_calls: Arc<AtomicU32>,
        fail_connect: Arc<AtomicBool>,
        events: broadcast::Sender<crate::transport::TransportEvent>,
    }

    /// Handles a test keeps after the transport moves into the session.
    struct ScriptHandles {
        requests: Arc<Mutex<Vec<Vec<u8>>>>,
        connect_calls: Arc<AtomicU32>,
        fail_connect: Arc<AtomicBool>,
    }

    impl ScriptedTransport {
        fn new(connected: bool) -> (Self, ScriptHandles) {
            let (events, _) = broadcast::channel(8);
            let transport = Self {
                responses: Arc::new(Mutex::new(VecDeque::new())),
                requests: Arc::new(Mutex::new(Vec::new())),
                connected: Arc::new(AtomicBool::new(connected)),
                connect_calls: Arc::new(AtomicU32::new(0)),
                fail_connect: Arc::new(AtomicBool::new(false)),
                events,
            };
            let handles = ScriptHandles {
                requests: Arc::clone(&transport.requests),
                connect_calls: Arc::clone(&transport.connect_calls),
                fail_connect: Arc::clone(&transport.fail_connect),
            };
            (transport, handles)
        }

        fn push(&self, result: GatewayResult<ModbusPdu>) {
            self.responses.lock().unwrap().push_back(result);
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn connect(&mut self) -> GatewayResult<()> {
            self.connect_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_connect.load(Ordering::SeqCst) {
                return Err(GatewayError::transport("scripted connect failure"));
            }
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn disconnect(&mut self) -> GatewayResult<()> {
            self.connected.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn request(
            &mut self,
            _unit_id: u8,
            pdu: &ModbusPdu,
            _timeout: Duration,
        ) -> GatewayResult<ModbusPdu> {
            self.requests.lock().unwrap().push(pdu.as_slice().to_vec());
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(GatewayError::transport("no scripted response")))
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        fn stats(&self) -> crate::transport::TransportStats {
            crate::transport::TransportStats::default()
        }

        fn subscribe(&self) -> broadcast::Receiver<crate::transport::TransportEvent> {
            self.events.subscribe()
        }

        fn kind(&self) -> &'static str {
            "scripted"
        }
    }

    fn register_response(values: &[u16]) -> ModbusPdu {
        let mut bytes = vec![0x03, (values.len() * 2) as u8];
        for v in values {
            bytes.extend_from_slice(&v.to_be_bytes());
        }
        ModbusPdu::from_slice(&bytes).unwrap()
    }

    fn fast_config(retries: u32) -> SessionConfig {
        SessionConfig {
            retries,
            retry_interval: Duration::from_millis(1),
            ..SessionConfig::default()
        }
    }

    fn session_with(transport: ScriptedTransport, config: SessionConfig) -> ModbusSession {
        ModbusSession::new(Box::new(transport), config)
    }

    #[tokio::test]
    async fn test_read_registers() {
        let (transport, _handles) = ScriptedTransport::new(true);
        transport.push(Ok(register_response(&[0x0102, 0x0304])));
        let mut session = session_with(transport, fast_config(0));

        let regs = session.read_range(0x03, 0, 2).await.unwrap();
        assert_eq!(regs, vec![0x0102, 0x0304]);
    }

    #[tokio::test]
    async fn test_read_coils_unpacked() {
        let (transport, _handles) = ScriptedTransport::new(true);
        let pdu = ModbusPdu::from_slice(&[0x01, 0x01, 0b0000_0101]).unwrap();
        transport.push(Ok(pdu));
        let mut session = session_with(transport, fast_config(0));

        let bits = session.read_range(0x01, 0, 3).await.unwrap();
        assert_eq!(bits, vec![1, 0, 1]);
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let (transport, handles) = ScriptedTransport::new(true);
        transport.push(Err(GatewayError::timeout("t", 100)));
        transport.push(Err(GatewayError::timeout("t", 100)));
        transport.push(Ok(register_response(&[7])));

        let mut session = session_with(transport, fast_config(2));
        let regs = session.read_range(0x03, 0, 1).await.unwrap();
        assert_eq!(regs, vec![7]);
        assert_eq!(handles.requests.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let (transport, handles) = ScriptedTransport::new(true);
        for _ in 0..3 {
            transport.push(Err(GatewayError::timeout("t", 100)));
        }

        let mut session = session_with(transport, fast_config(2));
        let err = session.read_range(0x03, 0, 1).await.unwrap_err();
        assert!(matches!(err, GatewayError::Timeout { .. }));
        assert_eq!(handles.requests.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_exception_not_retried() {
        let (transport, handles) = ScriptedTransport::new(true);
        // FC 0x83 = exception for FC03, code 2 (illegal data address)
        transport.push(Ok(ModbusPdu::from_slice(&[0x83, 0x02]).unwrap()));
        // A second canned success must never be consumed.
        transport.push(Ok(register_response(&[1])));

        let mut session = session_with(transport, fast_config(5));
        let err = session.read_range(0x03, 0, 1).await.unwrap_err();
        assert!(matches!(
            err,
            GatewayError::ModbusException {
                code: crate::error::ExceptionCode::IllegalDataAddress,
                fc: 3
            }
        ));

        // Exactly one wire exchange happened.
        assert_eq!(handles.requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_reconnect_before_attempt() {
        let (transport, handles) = ScriptedTransport::new(false);
        transport.push(Ok(register_response(&[9])));

        let mut session = session_with(transport, fast_config(0));
        assert!(!session.is_connected());
        let regs = session.read_range(0x03, 0, 1).await.unwrap();
        assert_eq!(regs, vec![9]);
        assert_eq!(session.state(), SessionState::Connected);
        assert_eq!(handles.connect_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_no_reconnect_when_disabled() {
        let (transport, handles) = ScriptedTransport::new(false);
        let mut config = fast_config(0);
        config.auto_reconnect = false;

        let mut session = session_with(transport, config);
        let err = session.read_range(0x03, 0, 1).await.unwrap_err();
        assert!(matches!(err, GatewayError::Transport { .. }));
        assert_eq!(handles.connect_calls.load(Ordering::SeqCst), 0);
        assert!(handles.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_state_machine_transitions() {
        let (transport, _handles) = ScriptedTransport::new(false);
        let mut session = session_with(transport, fast_config(0));
        let watch = session.state_watch();

        assert_eq!(session.state(), SessionState::Disconnected);
        session.connect().await.unwrap();
        assert_eq!(session.state(), SessionState::Connected);
        session.close().await.unwrap();
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(*watch.borrow(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_failure_enters_error_state() {
        let (transport, handles) = ScriptedTransport::new(false);
        handles.fail_connect.store(true, Ordering::SeqCst);
        let mut session = session_with(transport, fast_config(0));

        assert!(session.connect().await.is_err());
        assert_eq!(session.state(), SessionState::Error);
    }

    #[tokio::test]
    async fn test_write_single_register() {
        let (transport, _handles) = ScriptedTransport::new(true);
        transport.push(Ok(ModbusPdu::from_slice(&[0x06, 0x00, 0x64, 0x12, 0x34]).unwrap()));
        let mut session = session_with(transport, fast_config(0));
        session.write_single(0x06, 100, 0x1234).await.unwrap();
    }

    #[tokio::test]
    async fn test_write_multiple_registers() {
        let (transport, _handles) = ScriptedTransport::new(true);
        transport.push(Ok(ModbusPdu::from_slice(&[0x10, 0x00, 0x64, 0x00, 0x02]).unwrap()));
        let mut session = session_with(transport, fast_config(0));
        session
            .write_multiple(0x10, 100, &[0x0001, 0x0002])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_write_rejects_read_fc() {
        let (transport, _handles) = ScriptedTransport::new(true);
        let mut session = session_with(transport, fast_config(0));
        assert!(session.write_single(0x03, 0, 1).await.is_err());
        assert!(session.write_multiple(0x04, 0, &[1]).await.is_err());
    }

    #[tokio::test]
    async fn test_execute_custom() {
        let (transport, _handles) = ScriptedTransport::new(true);
        transport.push(Ok(ModbusPdu::from_slice(&[0x2B, 0x0E, 0x01]).unwrap()));
        let mut session = session_with(transport, fast_config(0));
        let bytes = session.execute_custom(0x2B, &[0x0E, 0x01]).await.unwrap();
        assert_eq!(bytes, vec![0x2B, 0x0E, 0x01]);
    }

    #[tokio::test]
    async fn test_short_register_read_is_frame_error() {
        let (transport, _handles) = ScriptedTransport::new(true);
        transport.push(Ok(register_response(&[1])));
        let mut session = session_with(transport, fast_config(0));
        let err = session.read_range(0x03, 0, 2).await.unwrap_err();
        assert!(matches!(err, GatewayError::Frame { .. }));
    }

    #[tokio::test]
    async fn test_session_for_tcp_device() {
        let device = crate::model::Device {
            id: "d1".into(),
            name: "n".into(),
            make: None,
            enabled: true,
            transport: crate::model::TransportConfig::Tcp {
                host: "127.0.0.1".into(),
                port: 1502,
                unit_id: 9,
                timeout: Some(750),
            },
            data_points: Vec::new(),
            writable_registers: None,
            control_parameters: None,
            advanced: crate::model::AdvancedSettings {
                retries: 2,
                ..Default::default()
            },
            polling_interval_ms: None,
            last_seen: None,
            last_controlled_at: None,
            active_schedule_id: None,
            extra: serde_json::Map::new(),
        };

        let registry = Arc::new(crate::transport::PortRegistry::new());
        let session = session_for_device(&device, registry, Duration::from_secs(1)).unwrap();
        assert_eq!(session.config().unit_id, 9);
        assert_eq!(session.config().retries, 2);
        assert_eq!(session.config().timeout, Duration::from_millis(750));
    }
}

//! Modbus RTU transport
//!
//! Serial lines are single-threaded resources. The transport enforces one
//! request in flight per port, claims the device node in the process-wide
//! [`PortRegistry`](super::PortRegistry) on connect, and assembles response
//! frames by predicting their length from the function code. Frames that
//! fail the CRC check or answer for the wrong unit are dropped without
//! comment so the pending request runs into its timeout, which is the only
//! recovery the medium offers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_serial::{SerialPort, SerialPortBuilderExt, SerialStream};
use tracing::{debug, info, warn};

use super::{emit, SharedStats, StatsCell, Transport, TransportEvent, TransportStats,
    EVENT_CHANNEL_CAPACITY};
use crate::constants::RESPONSE_BUFFER_SIZE;
use crate::error::{GatewayError, GatewayResult};
use crate::frame::{decode_rtu_frame, encode_rtu_frame, predict_rtu_frame_len};
use crate::model::{Parity, TransportConfig};
use crate::pdu::ModbusPdu;
use crate::transport::PortRegistry;

/// Serial line parameters for one RTU device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialConfig {
    /// Device node, e.g. `/dev/ttyUSB0`
    pub path: String,
    /// Baud rate
    pub baud: u32,
    /// Data bits: 5-8
    pub data_bits: u8,
    /// Stop bits: 1 or 2
    pub stop_bits: u8,
    /// Parity
    pub parity: Parity,
}

impl SerialConfig {
    /// Extract serial parameters from a device transport definition.
    pub fn from_transport(transport: &TransportConfig) -> Option<Self> {
        match transport {
            TransportConfig::Rtu {
                path,
                baud,
                data_bits,
                stop_bits,
                parity,
                ..
            } => Some(Self {
                path: path.clone(),
                baud: *baud,
                data_bits: *data_bits,
                stop_bits: *stop_bits,
                parity: *parity,
            }),
            TransportConfig::Tcp { .. } => None,
        }
    }

    fn data_bits(&self) -> tokio_serial::DataBits {
        match self.data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        }
    }

    fn stop_bits(&self) -> tokio_serial::StopBits {
        match self.stop_bits {
            2 => tokio_serial::StopBits::Two,
            _ => tokio_serial::StopBits::One,
        }
    }

    fn parity(&self) -> tokio_serial::Parity {
        match self.parity {
            Parity::Even => tokio_serial::Parity::Even,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::None => tokio_serial::Parity::None,
        }
    }
}

/// Modbus RTU transport over a serial line.
pub struct RtuTransport {
    config: SerialConfig,
    port: Option<SerialStream>,
    registry: Arc<PortRegistry>,
    request_in_progress: Arc<AtomicBool>,
    stats: SharedStats,
    events: broadcast::Sender<TransportEvent>,
}

impl RtuTransport {
    /// Create a transport; the port is opened by [`Transport::connect`].
    pub fn new(config: SerialConfig, registry: Arc<PortRegistry>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            port: None,
            registry,
            request_in_progress: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(StatsCell::default()),
            events,
        }
    }

    /// Device node this transport owns while connected.
    pub fn path(&self) -> &str {
        &self.config.path
    }

    async fn exchange(
        &mut self,
        unit_id: u8,
        pdu: &ModbusPdu,
        timeout: Duration,
    ) -> GatewayResult<ModbusPdu> {
        let path = self.config.path.clone();
        let port = self
            .port
            .as_mut()
            .ok_or_else(|| GatewayError::transport(format!("Serial port {path} not open")))?;

        // Stale bytes from an aborted exchange would corrupt correlation.
        if let Err(e) = port.clear(tokio_serial::ClearBuffer::Input) {
            debug!("Could not flush {path} input buffer: {e}");
        }

        let frame = encode_rtu_frame(unit_id, pdu);
        port.write_all(&frame).await?;
        port.flush().await?;
        self.stats.record_request(frame.len());

        let deadline = Instant::now() + timeout;
        let mut buf: Vec<u8> = Vec::with_capacity(RESPONSE_BUFFER_SIZE);

        loop {
            if let Some(expected) = predict_rtu_frame_len(&buf) {
                if buf.len() >= expected {
                    match decode_rtu_frame(&buf[..expected]) {
                        Ok((unit, response)) if unit == unit_id => {
                            self.stats.record_response();
                            return Ok(response);
                        }
                        Ok((unit, _)) => {
                            self.stats.record_frame_error();
                            debug!("Frame for unit {unit} while awaiting {unit_id}; dropped");
                            buf.clear();
                        }
                        Err(e) => {
                            // Bad CRC: silent drop, caller sees the timeout.
                            self.stats.record_frame_error();
                            debug!("RTU frame dropped on {path}: {e}");
                            buf.clear();
                        }
                    }
                }
            }

            let now = Instant::now();
            if now >= deadline {
                self.stats.record_timeout();
                return Err(GatewayError::timeout(
                    format!("No response from unit {unit_id} on {path}"),
                    timeout.as_millis() as u64,
                ));
            }

            let mut chunk = [0u8; 64];
            match tokio::time::timeout(deadline - now, port.read(&mut chunk)).await {
                Ok(Ok(0)) => {
                    return Err(GatewayError::transport(format!("Serial port {path} closed")));
                }
                Ok(Ok(n)) => {
                    self.stats.record_bytes_received(n);
                    buf.extend_from_slice(&chunk[..n]);
                }
                Ok(Err(e)) => {
                    emit(&self.events, TransportEvent::Error(e.to_string()));
                    return Err(GatewayError::transport(format!(
                        "Serial read on {path} failed: {e}"
                    )));
                }
                Err(_) => {
                    self.stats.record_timeout();
                    return Err(GatewayError::timeout(
                        format!("No response from unit {unit_id} on {path}"),
                        timeout.as_millis() as u64,
                    ));
                }
            }
        }
    }
}

#[async_trait]
impl Transport for RtuTransport {
    async fn connect(&mut self) -> GatewayResult<()> {
        if self.is_connected() {
            return Ok(());
        }

        emit(&self.events, TransportEvent::Connecting);
        self.stats.record_connection_attempt();

        // Exclusivity first: losing the race must not touch the device node.
        self.registry.acquire(&self.config.path)?;

        let opened = tokio_serial::new(&self.config.path, self.config.baud)
            .data_bits(self.config.data_bits())
            .stop_bits(self.config.stop_bits())
            .parity(self.config.parity())
            .timeout(Duration::from_millis(100))
            .open_native_async();

        match opened {
            Ok(mut port) => {
                #[cfg(unix)]
                if let Err(e) = port.set_exclusive(false) {
                    debug!("set_exclusive({}) failed: {e}", self.config.path);
                }

                self.port = Some(port);
                self.stats.record_connection_established();
                emit(&self.events, TransportEvent::Connected);
                info!(
                    "Opened serial port {} at {} baud",
                    self.config.path, self.config.baud
                );
                Ok(())
            }
            Err(e) => {
                // Failed connects release the port slot immediately.
                self.registry.release(&self.config.path);
                let message = format!("Failed to open {}: {e}", self.config.path);
                warn!("{message}");
                emit(&self.events, TransportEvent::Error(message.clone()));
                Err(GatewayError::transport(message))
            }
        }
    }

    async fn disconnect(&mut self) -> GatewayResult<()> {
        if self.port.take().is_some() {
            self.registry.release(&self.config.path);
            emit(&self.events, TransportEvent::Disconnected { had_error: false });
            info!("Closed serial port {}", self.config.path);
        }
        Ok(())
    }

    async fn request(
        &mut self,
        unit_id: u8,
        pdu: &ModbusPdu,
        timeout: Duration,
    ) -> GatewayResult<ModbusPdu> {
        if self.request_in_progress.swap(true, Ordering::SeqCst) {
            return Err(GatewayError::BusyInProgress {
                resource: self.config.path.clone(),
            });
        }

        let had_port = self.port.is_some();
        let result = self.exchange(unit_id, pdu, timeout).await;
        self.request_in_progress.store(false, Ordering::SeqCst);

        // A partial frame may be stuck in the driver after an I/O fault;
        // dropping the port resets the line state.
        if had_port && matches!(result, Err(GatewayError::Transport { .. })) {
            self.port = None;
            self.registry.release(&self.config.path);
            emit(&self.events, TransportEvent::Disconnected { had_error: true });
        }

        result
    }

    fn is_connected(&self) -> bool {
        self.port.is_some()
    }

    fn stats(&self) -> TransportStats {
        self.stats.snapshot()
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    fn kind(&self) -> &'static str {
        "rtu"
    }
}

impl Drop for RtuTransport {
    fn drop(&mut self) {
        if self.port.is_some() {
            self.registry.release(&self.config.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(path: &str) -> SerialConfig {
        SerialConfig {
            path: path.into(),
            baud: 9600,
            data_bits: 8,
            stop_bits: 1,
            parity: Parity::None,
        }
    }

    #[test]
    fn test_serial_config_from_transport() {
        let rtu = TransportConfig::Rtu {
            path: "/dev/ttyUSB0".into(),
            baud: 19_200,
            data_bits: 7,
            stop_bits: 2,
            parity: Parity::Even,
            unit_id: 5,
        };
        let cfg = SerialConfig::from_transport(&rtu).unwrap();
        assert_eq!(cfg.path, "/dev/ttyUSB0");
        assert_eq!(cfg.baud, 19_200);
        assert_eq!(cfg.data_bits(), tokio_serial::DataBits::Seven);
        assert_eq!(cfg.stop_bits(), tokio_serial::StopBits::Two);
        assert_eq!(cfg.parity(), tokio_serial::Parity::Even);

        let tcp = TransportConfig::Tcp {
            host: "h".into(),
            port: 502,
            unit_id: 1,
            timeout: None,
        };
        assert!(SerialConfig::from_transport(&tcp).is_none());
    }

    #[tokio::test]
    async fn test_failed_open_releases_registry_slot() {
        let registry = Arc::new(PortRegistry::new());
        let mut transport = RtuTransport::new(config("/dev/does-not-exist-9f"), registry.clone());

        assert!(transport.connect().await.is_err());
        assert!(!transport.is_connected());
        assert!(!registry.is_busy("/dev/does-not-exist-9f"));
    }

    #[tokio::test]
    async fn test_registry_conflict() {
        let registry = Arc::new(PortRegistry::new());
        registry.acquire("/dev/ttyUSB9").unwrap();

        let mut transport = RtuTransport::new(config("/dev/ttyUSB9"), registry.clone());
        let err = transport.connect().await.unwrap_err();
        assert!(matches!(err, GatewayError::BusyInProgress { .. }));

        // The original owner keeps the slot.
        assert!(registry.is_busy("/dev/ttyUSB9"));
    }

    #[tokio::test]
    async fn test_request_without_port() {
        let registry = Arc::new(PortRegistry::new());
        let mut transport = RtuTransport::new(config("/dev/ttyUSB8"), registry);
        let pdu = crate::pdu::PduBuilder::read_request(0x03, 0, 1).unwrap();
        let err = transport
            .request(1, &pdu, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Transport { .. }));
        // The in-progress flag was reset even on the error path.
        assert!(!transport.request_in_progress.load(Ordering::SeqCst));
    }
}

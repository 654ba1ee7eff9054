//! Modbus TCP transport
//!
//! One socket per transport, half-duplex multiplexed by MBAP transaction
//! id. A background reader task feeds the receive buffer incrementally and
//! parses a frame as soon as `length + 6` bytes are available; completed
//! frames are dispatched to their waiting request through a map of
//! `transaction_id -> one-shot channel`. Responses with an unknown
//! transaction id or the wrong unit id are logged and discarded, leaving
//! the original request to time out.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{emit, SharedStats, StatsCell, Transport, TransportEvent, TransportStats,
    EVENT_CHANNEL_CAPACITY};
use crate::constants::RESPONSE_BUFFER_SIZE;
use crate::error::{GatewayError, GatewayResult};
use crate::frame::{encode_tcp_frame, extract_tcp_frame, TransactionCounter};
use crate::pdu::ModbusPdu;

/// A request awaiting its correlated response.
struct PendingRequest {
    unit_id: u8,
    reply: oneshot::Sender<GatewayResult<ModbusPdu>>,
}

type PendingMap = Arc<DashMap<u16, PendingRequest>>;

/// Modbus TCP transport.
pub struct TcpTransport {
    /// `host:port` endpoint
    addr: String,
    connect_timeout: Duration,
    writer: Option<OwnedWriteHalf>,
    reader_task: Option<JoinHandle<()>>,
    pending: PendingMap,
    transactions: TransactionCounter,
    connected: Arc<AtomicBool>,
    stats: SharedStats,
    events: broadcast::Sender<TransportEvent>,
}

impl TcpTransport {
    /// Create a transport for `host:port` with the given connect timeout.
    /// No connection is made until [`Transport::connect`].
    pub fn new(addr: impl Into<String>, connect_timeout: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            addr: addr.into(),
            connect_timeout,
            writer: None,
            reader_task: None,
            pending: Arc::new(DashMap::new()),
            transactions: TransactionCounter::new(),
            connected: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(StatsCell::default()),
            events,
        }
    }

    /// Endpoint this transport talks to.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Fail every waiter with a connection-closed error.
    fn drain_pending(pending: &PendingMap) {
        let ids: Vec<u16> = pending.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, waiter)) = pending.remove(&id) {
                let _ = waiter
                    .reply
                    .send(Err(GatewayError::transport("Connection closed")));
            }
        }
    }

    /// Background task: pump the socket into the frame extractor and
    /// dispatch completed frames to their waiters.
    async fn reader_loop(
        mut reader: OwnedReadHalf,
        pending: PendingMap,
        connected: Arc<AtomicBool>,
        stats: SharedStats,
        events: broadcast::Sender<TransportEvent>,
        addr: String,
    ) {
        let mut buf = BytesMut::with_capacity(RESPONSE_BUFFER_SIZE);
        let had_error = loop {
            match reader.read_buf(&mut buf).await {
                Ok(0) => {
                    info!("TCP peer closed connection: {addr}");
                    break false;
                }
                Ok(n) => {
                    stats.record_bytes_received(n);
                    loop {
                        match extract_tcp_frame(&mut buf) {
                            Ok(Some((header, pdu))) => {
                                Self::dispatch(&pending, &stats, header.transaction_id, header.unit_id, pdu);
                            }
                            Ok(None) => break,
                            Err(e) => {
                                stats.record_frame_error();
                                warn!("Dropping malformed TCP frame from {addr}: {e}");
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!("TCP read error on {addr}: {e}");
                    emit(&events, TransportEvent::Error(e.to_string()));
                    break true;
                }
            }
        };

        connected.store(false, Ordering::SeqCst);
        Self::drain_pending(&pending);
        emit(&events, TransportEvent::Disconnected { had_error });
    }

    fn dispatch(
        pending: &PendingMap,
        stats: &SharedStats,
        transaction_id: u16,
        unit_id: u8,
        pdu: ModbusPdu,
    ) {
        match pending.remove(&transaction_id) {
            Some((_, waiter)) => {
                if waiter.unit_id != unit_id {
                    stats.record_frame_error();
                    warn!(
                        "Unit id mismatch on txid {}: expected {}, got {}; frame discarded",
                        transaction_id, waiter.unit_id, unit_id
                    );
                    // Leave the request pending; it will time out.
                    pending.insert(transaction_id, waiter);
                    return;
                }
                stats.record_response();
                let _ = waiter.reply.send(Ok(pdu));
            }
            None => {
                stats.record_frame_error();
                warn!("Unmatched transaction id {transaction_id}; frame discarded");
            }
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&mut self) -> GatewayResult<()> {
        if self.is_connected() {
            return Ok(());
        }

        emit(&self.events, TransportEvent::Connecting);
        self.stats.record_connection_attempt();
        debug!("Connecting to {}", self.addr);

        // A reader task from a previous life has nothing useful left to do.
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }

        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| {
                GatewayError::timeout(
                    format!("Connect to {} timed out", self.addr),
                    self.connect_timeout.as_millis() as u64,
                )
            })?
            .map_err(|e| {
                emit(&self.events, TransportEvent::Error(e.to_string()));
                GatewayError::transport(format!("Connect to {} failed: {e}", self.addr))
            })?;

        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();

        self.connected.store(true, Ordering::SeqCst);
        self.writer = Some(writer);
        self.reader_task = Some(tokio::spawn(Self::reader_loop(
            reader,
            Arc::clone(&self.pending),
            Arc::clone(&self.connected),
            Arc::clone(&self.stats),
            self.events.clone(),
            self.addr.clone(),
        )));

        self.stats.record_connection_established();
        emit(&self.events, TransportEvent::Connected);
        info!("Connected to {}", self.addr);
        Ok(())
    }

    async fn disconnect(&mut self) -> GatewayResult<()> {
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        let was_connected = self.connected.swap(false, Ordering::SeqCst);
        self.writer = None;
        Self::drain_pending(&self.pending);
        if was_connected {
            emit(&self.events, TransportEvent::Disconnected { had_error: false });
            info!("Disconnected from {}", self.addr);
        }
        Ok(())
    }

    async fn request(
        &mut self,
        unit_id: u8,
        pdu: &ModbusPdu,
        timeout: Duration,
    ) -> GatewayResult<ModbusPdu> {
        if !self.is_connected() {
            return Err(GatewayError::transport(format!(
                "Not connected to {}",
                self.addr
            )));
        }
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| GatewayError::transport("Transport has no writer"))?;

        let transaction_id = self.transactions.next_id();
        let (reply, rx) = oneshot::channel();
        self.pending
            .insert(transaction_id, PendingRequest { unit_id, reply });

        let frame = encode_tcp_frame(transaction_id, unit_id, pdu);
        if let Err(e) = writer.write_all(&frame).await {
            self.pending.remove(&transaction_id);
            self.connected.store(false, Ordering::SeqCst);
            emit(&self.events, TransportEvent::Error(e.to_string()));
            return Err(GatewayError::transport(format!(
                "Write to {} failed: {e}",
                self.addr
            )));
        }
        self.stats.record_request(frame.len());

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            // The reader task dropped the waiter without answering.
            Ok(Err(_)) => Err(GatewayError::transport("Connection closed")),
            Err(_) => {
                self.pending.remove(&transaction_id);
                self.stats.record_timeout();
                Err(GatewayError::timeout(
                    format!("No response from {} for txid {}", self.addr, transaction_id),
                    timeout.as_millis() as u64,
                ))
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn stats(&self) -> TransportStats {
        self.stats.snapshot()
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    fn kind(&self) -> &'static str {
        "tcp"
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Minimal server: answers each FC03 request for `quantity` registers
    /// with incrementing values, echoing the request's transaction id.
    async fn spawn_register_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 260];
            loop {
                let Ok(n) = socket.read(&mut buf).await else { return };
                if n == 0 {
                    return;
                }
                let txid = [buf[0], buf[1]];
                let unit = buf[6];
                let quantity = u16::from_be_bytes([buf[10], buf[11]]);

                let mut response = Vec::new();
                response.extend_from_slice(&txid);
                response.extend_from_slice(&[0, 0]);
                let pdu_len = 2 + quantity as usize * 2;
                response.extend_from_slice(&((pdu_len + 1) as u16).to_be_bytes());
                response.push(unit);
                response.push(0x03);
                response.push((quantity * 2) as u8);
                for i in 0..quantity {
                    response.extend_from_slice(&i.to_be_bytes());
                }
                socket.write_all(&response).await.unwrap();
            }
        });

        addr
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let mut transport = TcpTransport::new("127.0.0.1:1", Duration::from_millis(500));
        let err = transport.connect().await.unwrap_err();
        assert!(matches!(
            err,
            GatewayError::Transport { .. } | GatewayError::Timeout { .. }
        ));
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_request_roundtrip() {
        let addr = spawn_register_server().await;
        let mut transport = TcpTransport::new(addr, Duration::from_secs(1));
        let mut events = transport.subscribe();

        transport.connect().await.unwrap();
        assert!(transport.is_connected());
        assert_eq!(events.recv().await.unwrap(), TransportEvent::Connecting);
        assert_eq!(events.recv().await.unwrap(), TransportEvent::Connected);

        let pdu = crate::pdu::PduBuilder::read_request(0x03, 0, 3).unwrap();
        let response = transport
            .request(1, &pdu, Duration::from_secs(1))
            .await
            .unwrap();
        let regs = crate::pdu::parse_read_response(&response, 0x03).unwrap();
        assert_eq!(regs, vec![0, 1, 2]);

        let stats = transport.stats();
        assert_eq!(stats.requests_sent, 1);
        assert_eq!(stats.responses_received, 1);
        assert_eq!(stats.timeouts, 0);

        transport.disconnect().await.unwrap();
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_transaction_ids_are_monotonic() {
        let addr = spawn_register_server().await;
        let mut transport = TcpTransport::new(addr, Duration::from_secs(1));
        transport.connect().await.unwrap();

        let pdu = crate::pdu::PduBuilder::read_request(0x03, 0, 1).unwrap();
        for _ in 0..3 {
            transport
                .request(1, &pdu, Duration::from_secs(1))
                .await
                .unwrap();
        }
        // Counter advanced once per request.
        assert_eq!(transport.transactions.next_id(), 3);
    }

    #[tokio::test]
    async fn test_mismatched_txid_discarded_then_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        // Server answers with a wrong transaction id.
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 260];
            let n = socket.read(&mut buf).await.unwrap();
            assert!(n >= 12);
            let response = [
                0xAB, 0xCD, // wrong txid
                0x00, 0x00, 0x00, 0x05, buf[6], 0x03, 0x02, 0x00, 0x2A,
            ];
            socket.write_all(&response).await.unwrap();
            // Keep the socket open so the client times out instead of failing fast.
            tokio::time::sleep(Duration::from_secs(2)).await;
        });

        let mut transport = TcpTransport::new(addr, Duration::from_secs(1));
        transport.connect().await.unwrap();

        let pdu = crate::pdu::PduBuilder::read_request(0x03, 0, 1).unwrap();
        let err = transport
            .request(1, &pdu, Duration::from_millis(300))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Timeout { .. }));
        assert_eq!(transport.stats().frame_errors, 1);
        assert_eq!(transport.stats().timeouts, 1);
    }

    #[tokio::test]
    async fn test_server_close_fails_pending_and_emits_event() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let _ = socket.read(&mut buf).await;
            // Close without answering.
        });

        let mut transport = TcpTransport::new(addr, Duration::from_secs(1));
        let mut events = transport.subscribe();
        transport.connect().await.unwrap();

        let pdu = crate::pdu::PduBuilder::read_request(0x03, 0, 1).unwrap();
        let err = transport
            .request(1, &pdu, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Transport { .. }));
        assert!(!transport.is_connected());

        // Connecting, Connected, then Disconnected from the reader task.
        assert_eq!(events.recv().await.unwrap(), TransportEvent::Connecting);
        assert_eq!(events.recv().await.unwrap(), TransportEvent::Connected);
        loop {
            match events.recv().await.unwrap() {
                TransportEvent::Disconnected { .. } => break,
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn test_request_while_disconnected() {
        let mut transport = TcpTransport::new("127.0.0.1:1", Duration::from_secs(1));
        let pdu = crate::pdu::PduBuilder::read_request(0x03, 0, 1).unwrap();
        let err = transport
            .request(1, &pdu, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Transport { .. }));
    }
}

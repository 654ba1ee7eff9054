//! Network transport layer for TCP and RTU communication
//!
//! A [`Transport`] owns one connection to one endpoint and implements the
//! write-then-await-reply exchange for Modbus PDUs. Lifecycle changes are
//! published on a broadcast event stream so sessions and diagnostics can
//! observe connects, disconnects and faults without polling.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::GatewayResult;
use crate::pdu::ModbusPdu;

pub mod registry;
pub mod tcp;

#[cfg(feature = "rtu")]
pub mod rtu;

pub use registry::PortRegistry;
pub use tcp::TcpTransport;

#[cfg(feature = "rtu")]
pub use rtu::{RtuTransport, SerialConfig};

/// Lifecycle events emitted by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A connection attempt has started
    Connecting,
    /// The connection is established and usable
    Connected,
    /// The connection is gone
    Disconnected {
        /// True when the loss was caused by an error rather than a
        /// deliberate disconnect
        had_error: bool,
    },
    /// A fault occurred without necessarily dropping the connection
    Error(String),
}

/// Point-in-time snapshot of a transport's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// Requests handed to the wire
    pub requests_sent: u64,
    /// Correlated responses delivered to callers
    pub responses_received: u64,
    /// Requests abandoned on deadline
    pub timeouts: u64,
    /// Frames dropped for CRC/correlation/protocol faults
    pub frame_errors: u64,
    /// Payload bytes written
    pub bytes_sent: u64,
    /// Payload bytes read
    pub bytes_received: u64,
    /// Connection attempts, successful or not
    pub connection_attempts: u64,
    /// Attempts that produced a usable connection
    pub connections_established: u64,
}

/// Shared atomic counters behind [`TransportStats`].
#[derive(Debug, Default)]
pub(crate) struct StatsCell {
    requests_sent: AtomicU64,
    responses_received: AtomicU64,
    timeouts: AtomicU64,
    frame_errors: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    connection_attempts: AtomicU64,
    connections_established: AtomicU64,
}

impl StatsCell {
    pub(crate) fn record_request(&self, bytes: usize) {
        self.requests_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_response(&self) {
        self.responses_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_bytes_received(&self, bytes: usize) {
        self.bytes_received
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_frame_error(&self) {
        self.frame_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> TransportStats {
        TransportStats {
            requests_sent: self.requests_sent.load(Ordering::Relaxed),
            responses_received: self.responses_received.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            frame_errors: self.frame_errors.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
            connections_established: self.connections_established.load(Ordering::Relaxed),
        }
    }
}

/// Capacity of the lifecycle event channel; slow listeners lose oldest
/// events rather than stalling the transport.
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 32;

/// One connection to one Modbus endpoint.
///
/// Implementations serialise access internally where the medium demands it
/// (RTU) or correlate concurrent exchanges (TCP). An idle transport stays
/// connected; only [`disconnect`](Transport::disconnect) tears down.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish the connection. Idempotent when already connected.
    async fn connect(&mut self) -> GatewayResult<()>;

    /// Close the connection and release any exclusive resources.
    async fn disconnect(&mut self) -> GatewayResult<()>;

    /// Send a request PDU to `unit_id` and await the matching reply PDU.
    ///
    /// The returned PDU may still be an exception response; classification
    /// is the caller's job. Transport-level faults (I/O, correlation,
    /// deadline) surface as errors.
    async fn request(
        &mut self,
        unit_id: u8,
        pdu: &ModbusPdu,
        timeout: Duration,
    ) -> GatewayResult<ModbusPdu>;

    /// True while the connection is usable.
    fn is_connected(&self) -> bool;

    /// Counter snapshot.
    fn stats(&self) -> TransportStats;

    /// Subscribe to lifecycle events.
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;

    /// Short transport kind label for logs ("tcp", "rtu").
    fn kind(&self) -> &'static str;
}

/// Emit an event, ignoring the no-receivers case.
pub(crate) fn emit(events: &broadcast::Sender<TransportEvent>, event: TransportEvent) {
    let _ = events.send(event);
}

/// Shared handle to transport internals used by reader tasks.
pub(crate) type SharedStats = Arc<StatsCell>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_cell_snapshot() {
        let cell = StatsCell::default();
        cell.record_request(12);
        cell.record_request(8);
        cell.record_response();
        cell.record_bytes_received(9);
        cell.record_timeout();
        cell.record_frame_error();
        cell.record_connection_attempt();
        cell.record_connection_established();

        let stats = cell.snapshot();
        assert_eq!(stats.requests_sent, 2);
        assert_eq!(stats.bytes_sent, 20);
        assert_eq!(stats.responses_received, 1);
        assert_eq!(stats.bytes_received, 9);
        assert_eq!(stats.timeouts, 1);
        assert_eq!(stats.frame_errors, 1);
        assert_eq!(stats.connection_attempts, 1);
        assert_eq!(stats.connections_established, 1);
    }

    #[test]
    fn test_emit_without_receivers() {
        let (tx, rx) = broadcast::channel(4);
        drop(rx);
        emit(&tx, TransportEvent::Connecting);
    }
}

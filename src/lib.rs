//! # Modgate - Industrial Modbus Device Gateway
//!
//! A gateway core that talks Modbus TCP and RTU to field devices (PLCs,
//! meters, HVAC controllers) on behalf of higher-level applications:
//! it polls enabled devices on per-device schedules, decodes raw registers
//! into typed, scaled engineering values, caches the latest reading,
//! writes setpoints back (including time-of-day schedule rules) and backs
//! off adaptively when devices misbehave.
//!
//! ## Subsystems
//!
//! | Module | Responsibility |
//! |--------|----------------|
//! | [`pdu`], [`frame`] | PDU builders/parsers, MBAP + RTU/CRC-16 framing |
//! | [`transport`] | TCP and serial I/O, frame delimitation, correlation |
//! | [`session`] | Per-device client: state machine, retry, reconnect |
//! | [`codec`], [`bytes`], [`scaling`] | registers <-> typed scaled values |
//! | [`cache`] | In-memory last-reading store |
//! | [`poller`] | Cyclic reads, adaptive backoff |
//! | [`supervisor`] | Fleet bring-up strategies and admin surface |
//! | [`schedule`] | Minute-tick rule matcher |
//! | [`setpoint`] | Schedule/manual writes, gradual transitions |
//!
//! ## Supported Function Codes
//!
//! | Code | Function |
//! |------|----------|
//! | 0x01 | Read Coils |
//! | 0x02 | Read Discrete Inputs |
//! | 0x03 | Read Holding Registers |
//! | 0x04 | Read Input Registers |
//! | 0x05 | Write Single Coil |
//! | 0x06 | Write Single Register |
//! | 0x0F | Write Multiple Coils |
//! | 0x10 | Write Multiple Registers |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use modgate::{
//!     AutoPollSupervisor, CoreState, MemoryDeviceRepository, MemoryHistorySink,
//!     MemoryPushChannel, Poller,
//! };
//!
//! # async fn run() -> modgate::GatewayResult<()> {
//! let state = CoreState::init();
//! let devices = Arc::new(MemoryDeviceRepository::new());
//! let poller = Poller::new(
//!     Arc::clone(&state),
//!     devices.clone(),
//!     Arc::new(MemoryHistorySink::new()),
//!     Arc::new(MemoryPushChannel::new()),
//! );
//! let supervisor = AutoPollSupervisor::new(poller, devices);
//!
//! // Poll every 30 seconds; give startup a 10 second budget.
//! let report = supervisor.start(30, 10_000).await?;
//! println!("started with {:?}", report.strategy);
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Core modules
// ============================================================================

/// Closed error taxonomy and result alias
pub mod error;

/// Modbus protocol constants based on the official specification
pub mod constants;

/// PDU construction and inspection
pub mod pdu;

/// MBAP and RTU framing, CRC-16, transaction ids
pub mod frame;

/// Byte/word order handling for multi-register values
pub mod bytes;

/// Typed parameter values
pub mod value;

/// Register/value codec
pub mod codec;

/// Engineering-value scaling pipeline
pub mod scaling;

/// Device, schedule and reading model
pub mod model;

/// Per-device protocol limits
pub mod device_limits;

/// Network transport layer for TCP and RTU communication
pub mod transport;

/// Per-device Modbus session
pub mod session;

// ============================================================================
// Gateway modules
// ============================================================================

/// Realtime last-reading cache
pub mod cache;

/// Collaborator interfaces and in-memory implementations
pub mod repository;

/// Core shared state
pub mod state;

/// Device poller with adaptive backoff
pub mod poller;

/// Auto-polling supervisor
pub mod supervisor;

/// Time-driven schedule engine
pub mod schedule;

/// Setpoint manager
pub mod setpoint;

/// Connection diagnostics
pub mod diagnostics;

#[cfg(test)]
mod testutil;

// ============================================================================
// Re-exports for convenience
// ============================================================================

pub use bytes::ByteOrder;
pub use cache::RealtimeCache;
pub use codec::{decode_value, encode_value};
pub use device_limits::DeviceLimits;
pub use diagnostics::{test_connection, ConnectionReport, TestErrorType};
pub use error::{ExceptionCode, GatewayError, GatewayResult};
pub use frame::{append_crc, crc16, verify_crc, TransactionCounter};
pub use model::{
    Device, DeviceSchedule, Parameter, Reading, ReadingEntry, ScheduleRule, ScheduleTemplate,
    TransportConfig,
};
pub use pdu::{ModbusPdu, PduBuilder};
pub use poller::{Poller, MIN_POLL_INTERVAL_MS};
pub use repository::{
    DeviceRepository, EventLog, HistorySink, MemoryDeviceRepository, MemoryEventLog,
    MemoryHistorySink, MemoryPushChannel, MemoryScheduleRepository, PushChannel,
    ScheduleRepository,
};
pub use scaling::Scaling;
pub use schedule::{ScheduleAction, ScheduleEngine, ScheduleEvent};
pub use session::{ModbusSession, SessionConfig, SessionState};
pub use setpoint::{SetpointConfig, SetpointManager};
pub use state::CoreState;
pub use supervisor::{AutoPollSupervisor, StartupStrategy, SupervisorStats};
pub use transport::{TcpTransport, Transport, TransportEvent, TransportStats};
pub use value::{DataType, PointValue};

#[cfg(feature = "rtu")]
pub use transport::RtuTransport;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

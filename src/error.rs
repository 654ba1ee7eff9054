//! Gateway error types and result handling.
//!
//! The error taxonomy is a closed sum: every failure in the crate is one of
//! the variants below, surfaced at the smallest scope where it is actionable
//! (per-parameter for decode, per-request for transport, per-device for
//! repository access). String matching on error text happens only at the
//! external boundary that produces user-facing messages.

use std::fmt;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Canonical Modbus exception codes (response function code with high bit set,
/// followed by one of these in the next byte).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExceptionCode {
    /// 0x01 - function code not supported by the device
    IllegalFunction,
    /// 0x02 - address not within the device's register map
    IllegalDataAddress,
    /// 0x03 - value not acceptable for the register
    IllegalDataValue,
    /// 0x04 - unrecoverable device-side failure
    ServerDeviceFailure,
    /// 0x05 - request accepted, long-running processing started
    Acknowledge,
    /// 0x06 - device busy, retry later
    ServerDeviceBusy,
    /// 0x07 - program function negative acknowledge
    NegativeAcknowledge,
    /// 0x08 - extended memory parity error
    MemoryParityError,
    /// 0x0A - gateway misconfigured or overloaded
    GatewayPathUnavailable,
    /// 0x0B - no response from the target behind a gateway
    GatewayTargetDeviceFailedToRespond,
    /// Any other code observed on the wire
    Unknown(u8),
}

impl ExceptionCode {
    /// Map a wire exception byte to its canonical name.
    pub fn from_code(code: u8) -> Self {
        match code {
            0x01 => Self::IllegalFunction,
            0x02 => Self::IllegalDataAddress,
            0x03 => Self::IllegalDataValue,
            0x04 => Self::ServerDeviceFailure,
            0x05 => Self::Acknowledge,
            0x06 => Self::ServerDeviceBusy,
            0x07 => Self::NegativeAcknowledge,
            0x08 => Self::MemoryParityError,
            0x0A => Self::GatewayPathUnavailable,
            0x0B => Self::GatewayTargetDeviceFailedToRespond,
            other => Self::Unknown(other),
        }
    }

    /// Wire representation of this exception code.
    pub fn to_code(self) -> u8 {
        match self {
            Self::IllegalFunction => 0x01,
            Self::IllegalDataAddress => 0x02,
            Self::IllegalDataValue => 0x03,
            Self::ServerDeviceFailure => 0x04,
            Self::Acknowledge => 0x05,
            Self::ServerDeviceBusy => 0x06,
            Self::NegativeAcknowledge => 0x07,
            Self::MemoryParityError => 0x08,
            Self::GatewayPathUnavailable => 0x0A,
            Self::GatewayTargetDeviceFailedToRespond => 0x0B,
            Self::Unknown(code) => code,
        }
    }
}

impl fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IllegalFunction => write!(f, "Illegal Function"),
            Self::IllegalDataAddress => write!(f, "Illegal Data Address"),
            Self::IllegalDataValue => write!(f, "Illegal Data Value"),
            Self::ServerDeviceFailure => write!(f, "Server Device Failure"),
            Self::Acknowledge => write!(f, "Acknowledge"),
            Self::ServerDeviceBusy => write!(f, "Server Device Busy"),
            Self::NegativeAcknowledge => write!(f, "Negative Acknowledge"),
            Self::MemoryParityError => write!(f, "Memory Parity Error"),
            Self::GatewayPathUnavailable => write!(f, "Gateway Path Unavailable"),
            Self::GatewayTargetDeviceFailedToRespond => {
                write!(f, "Gateway Target Device Failed to Respond")
            }
            Self::Unknown(code) => write!(f, "Unknown Exception {code:#04X}"),
        }
    }
}

/// Closed error taxonomy for the gateway core.
#[derive(Error, Debug, Clone)]
pub enum GatewayError {
    /// Invalid device definition: unknown function code, out-of-range count,
    /// missing transport fields. Not recovered; surfaced to the caller.
    #[error("Configuration error: {message}")]
    Config {
        /// Human-readable description
        message: String,
    },

    /// Connect refused, I/O failure or connection loss. Retried per the
    /// session policy, ultimately surfaced with context.
    #[error("Transport error: {message}")]
    Transport {
        /// Human-readable description
        message: String,
    },

    /// A pending request exceeded its deadline.
    #[error("Timeout after {timeout_ms}ms: {message}")]
    Timeout {
        /// Human-readable description
        message: String,
        /// Deadline that was exceeded
        timeout_ms: u64,
    },

    /// The device answered with a Modbus exception response. Never retried:
    /// the remote end is alive and has given its verdict.
    #[error("Modbus exception for FC {fc:#04X}: {code}")]
    ModbusException {
        /// Canonical exception code
        code: ExceptionCode,
        /// Function code of the failed request
        fc: u8,
    },

    /// CRC mismatch, unexpected function code or mismatched transaction id.
    /// Dropped at transport level; callers observe a timeout.
    #[error("Frame error: {message}")]
    Frame {
        /// Human-readable description
        message: String,
    },

    /// Scaling/arithmetic or range violation while decoding one parameter.
    /// Stored on the parameter entry only; the overall poll succeeds.
    #[error("Decode error: {message}")]
    Decode {
        /// Human-readable description
        message: String,
    },

    /// Backing store unavailable or timing out. The poller uses extended
    /// backoff without charging the device's adaptive counter.
    #[error("Repository error: {message}")]
    Repository {
        /// Human-readable description
        message: String,
    },

    /// Central/schedule control bit is off; the setpoint write was skipped.
    #[error("Control inhibited for device {device_id}: {message}")]
    ControlInhibited {
        /// Device that refused central control
        device_id: String,
        /// Which gate was closed
        message: String,
    },

    /// Another request is already in flight on an exclusive transport.
    #[error("Request already in progress on {resource}")]
    BusyInProgress {
        /// Port path or endpoint that is busy
        resource: String,
    },
}

impl GatewayError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(message: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            message: message.into(),
            timeout_ms,
        }
    }

    /// Create a Modbus exception error from the wire bytes.
    pub fn exception(fc: u8, code: u8) -> Self {
        Self::ModbusException {
            code: ExceptionCode::from_code(code),
            fc: fc & 0x7F,
        }
    }

    /// Create a frame error.
    pub fn frame(message: impl Into<String>) -> Self {
        Self::Frame {
            message: message.into(),
        }
    }

    /// Create a decode error.
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    /// Create a repository error.
    pub fn repository(message: impl Into<String>) -> Self {
        Self::Repository {
            message: message.into(),
        }
    }

    /// True for failures the session layer may retry: transport faults and
    /// timeouts. Exception responses and configuration problems are final.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Timeout { .. })
    }

    /// True when the error originated in the backing store rather than on
    /// the field bus.
    pub fn is_repository(&self) -> bool {
        matches!(self, Self::Repository { .. })
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport {
            message: err.to_string(),
        }
    }
}

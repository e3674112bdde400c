//! # Protocol Error Handling
//!
//! Typed failure taxonomy for the Modbus TCP engine. Every failure mode of
//! the codec, session and dispatcher is expressed as a [`ProtocolError`]
//! variant and returned as an ordinary value; nothing in this crate throws
//! or swallows errors, and nothing retries automatically. Retry and backoff
//! policy belongs to the calling test orchestrator.
//!
//! ## Error categories
//!
//! ### Transport failures
//! - [`ProtocolError::Timeout`]: a bounded operation did not complete in time
//! - [`ProtocolError::ConnectionLost`]: refusal, broken pipe, or peer close
//! - [`ProtocolError::NotConnected`]: operation on a closed session
//!
//! ### Frame failures
//! - [`ProtocolError::MalformedFrame`]: short buffer, bad protocol ID,
//!   length mismatch, unexpected function code, or a write echo that does
//!   not match what was sent
//! - [`ProtocolError::TransactionMismatch`]: reply correlates to a
//!   transaction other than the one in flight; the stream is treated as
//!   desynchronized and the dispatcher forces a disconnect
//!
//! ### Device and caller failures
//! - [`ProtocolError::DeviceException`]: a well-formed reply in which the
//!   device rejected the operation (illegal address, illegal value, ...).
//!   This is *not* a transport failure and callers may pass/fail tests on it
//!   independently.
//! - [`ProtocolError::InvalidArgument`]: bad parameters rejected before any
//!   bytes are sent
//!
//! ## Usage
//!
//! ```rust
//! use modbus_probe::{ProtocolError, ModbusResult};
//!
//! fn classify(result: ModbusResult<Vec<u16>>) {
//!     match result {
//!         Ok(values) => println!("read {} registers", values.len()),
//!         Err(ProtocolError::DeviceException { function, code }) => {
//!             println!("device rejected 0x{function:02X} with code 0x{code:02X}");
//!         }
//!         Err(err) if err.is_transport_error() => println!("link problem: {err}"),
//!         Err(err) => println!("protocol problem: {err}"),
//!     }
//! }
//! ```

use thiserror::Error;

/// Result type alias for all engine operations.
pub type ModbusResult<T> = Result<T, ProtocolError>;

/// Tagged failure variants for Modbus TCP communication.
///
/// Errors are created at the point of failure and carry enough context
/// (operation attempted, expected/actual values, underlying cause) to
/// produce an actionable diagnostic without consulting logs.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// A bounded operation (connect, send, receive) did not complete within
    /// its timeout. The session remains usable unless the dispatcher's
    /// policy forces a disconnect.
    #[error("timeout after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    /// The stream connection was refused, reset, or closed by the peer.
    #[error("connection lost: {message}")]
    ConnectionLost { message: String },

    /// Operation attempted on a session that is not connected.
    #[error("session not connected")]
    NotConnected,

    /// The received buffer is not a valid Modbus TCP frame: too short,
    /// non-zero protocol ID, declared length disagreeing with available
    /// bytes, unexpected function code, or a write echo mismatch.
    #[error("malformed frame: {reason}")]
    MalformedFrame { reason: String },

    /// Reply transaction ID differs from the one just sent. Only one
    /// request is ever in flight per session, so this means the stream is
    /// desynchronized and unsafe to reuse.
    #[error("transaction mismatch: expected {expected}, got {actual}")]
    TransactionMismatch { expected: u16, actual: u16 },

    /// The device answered with a Modbus exception frame
    /// (`function | 0x80`). A valid protocol response, not a transport
    /// failure.
    #[error("device exception: function=0x{function:02X}, code=0x{code:02X}")]
    DeviceException { function: u8, code: u8 },

    /// Caller-side bad parameters, rejected before any I/O.
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },
}

/// Human-readable text for the standard Modbus exception codes.
pub fn exception_description(code: u8) -> &'static str {
    match code {
        0x01 => "Illegal Function",
        0x02 => "Illegal Data Address",
        0x03 => "Illegal Data Value",
        0x04 => "Server Device Failure",
        0x05 => "Acknowledge",
        0x06 => "Server Device Busy",
        0x08 => "Memory Parity Error",
        0x0A => "Gateway Path Unavailable",
        0x0B => "Gateway Target Device Failed to Respond",
        _ => "Unknown Exception",
    }
}

impl ProtocolError {
    /// Create a timeout error for a named operation.
    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create a connection-lost error.
    pub fn connection_lost<S: Into<String>>(message: S) -> Self {
        Self::ConnectionLost {
            message: message.into(),
        }
    }

    /// Create a malformed-frame error.
    pub fn malformed<S: Into<String>>(reason: S) -> Self {
        Self::MalformedFrame {
            reason: reason.into(),
        }
    }

    /// Create a transaction-mismatch error.
    pub fn transaction_mismatch(expected: u16, actual: u16) -> Self {
        Self::TransactionMismatch { expected, actual }
    }

    /// Create a device-exception error from the request function code and
    /// the exception code byte.
    pub fn device_exception(function: u8, code: u8) -> Self {
        Self::DeviceException { function, code }
    }

    /// Create an invalid-argument error.
    pub fn invalid_argument<S: Into<String>>(message: S) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// `true` for failures of the underlying stream rather than the Modbus
    /// protocol layer.
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::ConnectionLost { .. } | Self::NotConnected
        )
    }

    /// `true` for protocol-layer failures: framing, correlation, device
    /// exceptions.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Self::MalformedFrame { .. }
                | Self::TransactionMismatch { .. }
                | Self::DeviceException { .. }
        )
    }

    /// `true` when the stream may be desynchronized and the dispatcher
    /// should force a disconnect before the session is reused.
    pub fn requires_disconnect(&self) -> bool {
        matches!(
            self,
            Self::MalformedFrame { .. } | Self::TransactionMismatch { .. }
        )
    }
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                Self::timeout(err.to_string(), 0)
            }
            _ => Self::connection_lost(err.to_string()),
        }
    }
}

impl From<tokio::time::error::Elapsed> for ProtocolError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::timeout("operation", 0)
    }
}

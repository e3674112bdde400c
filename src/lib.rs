//! # Modbus Probe
//!
//! A Modbus TCP protocol engine for driving real industrial devices from a
//! test harness: byte-exact framing, strict response validation, transaction
//! correlation, a typed error taxonomy and deterministic fault injection.
//!
//! ## Features
//!
//! - **Frame codec**: pure encode/decode of the Modbus TCP ADU for the
//!   read/write, diagnostic, file record and device identification function
//!   codes, with quantity bounds enforced before any byte is sent
//! - **Transport session**: one socket, one in-flight request, two-phase
//!   length-prefixed receive, per-operation timeouts
//! - **Request dispatcher**: typed operations returning decoded values or a
//!   [`ProtocolError`]; desynchronizing errors force a disconnect
//! - **Fault hooks**: one-shot switches for connection loss, frame
//!   corruption and address substitution, inert unless armed
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use modbus_probe::{Endpoint, ModbusDispatch, ModbusResult, TcpDispatcher};
//!
//! #[tokio::main]
//! async fn main() -> ModbusResult<()> {
//!     let endpoint = Endpoint::new("192.168.1.100", 502)?;
//!     let mut dispatcher = TcpDispatcher::connect(endpoint).await?;
//!
//!     let values = dispatcher.read_holding_registers(1, 0, 10).await?;
//!     println!("registers: {values:?}");
//!
//!     dispatcher.write_single_register(1, 5, 42).await?;
//!     dispatcher.disconnect().await;
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod dispatcher;
pub mod error;
pub mod fault;
pub mod logging;
pub mod protocol;
pub mod session;
pub mod utils;

pub use codec::{decode_response, encode_request};
pub use dispatcher::{ModbusDispatch, Phase, TcpDispatcher};
pub use error::{exception_description, ModbusResult, ProtocolError};
pub use fault::FaultInjector;
pub use logging::{CallbackLogger, LogLevel, OperationOutcome};
pub use protocol::{
    CommEventCounter, CommEventLog, DeviceIdCode, DeviceIdentification, ExceptionCode,
    FileRecordRef, FileRecordWrite, FunctionCode, ModbusAddress, ModbusValue, Request, RequestPdu,
    Response, ResponseData, ServerId, UnitId,
};
pub use session::{DisconnectHandle, Endpoint, SessionStats, TcpSession};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Standard Modbus TCP port.
pub const DEFAULT_TCP_PORT: u16 = 502;

/// Default per-operation timeout in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

/// MBAP header size in bytes (transaction ID through unit ID).
pub const MBAP_HEADER_SIZE: usize = 7;

/// Largest legal Modbus TCP frame: MBAP header plus a 253-byte PDU.
pub const MAX_TCP_FRAME_SIZE: usize = 260;

/// Protocol maximum register quantity for a single read.
pub const MAX_READ_REGISTERS: u16 = 125;

/// Protocol maximum register quantity for a multi-register write.
pub const MAX_WRITE_REGISTERS: u16 = 123;

/// Protocol maximum coil quantity for a single read.
pub const MAX_READ_COILS: u16 = 2000;

/// Protocol maximum coil quantity for a multi-coil write.
pub const MAX_WRITE_COILS: u16 = 1968;

/// Protocol maximum write quantity for Read/Write Multiple Registers.
pub const MAX_RW_WRITE_REGISTERS: u16 = 121;

/// Protocol maximum FIFO queue depth per response.
pub const MAX_FIFO_COUNT: u16 = 31;

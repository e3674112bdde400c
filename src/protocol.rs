//! Modbus protocol definitions and data structures.
//!
//! This module contains the typed vocabulary of the engine: function codes,
//! exception codes, per-function request payloads ([`RequestPdu`]), decoded
//! response data ([`ResponseData`]) and the bit/register packing helpers the
//! codec is built on. Everything here is pure data; framing lives in
//! [`crate::codec`].

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{exception_description, ModbusResult, ProtocolError};
use crate::{
    MAX_READ_COILS, MAX_READ_REGISTERS, MAX_RW_WRITE_REGISTERS, MAX_WRITE_COILS,
    MAX_WRITE_REGISTERS,
};

/// Modbus address type (0-65535).
pub type ModbusAddress = u16;

/// Modbus register value type.
pub type ModbusValue = u16;

/// Modbus unit identifier addressed through the TCP gateway.
pub type UnitId = u8;

/// Modbus function codes supported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum FunctionCode {
    /// Read Coils (0x01)
    ReadCoils = 0x01,
    /// Read Discrete Inputs (0x02)
    ReadDiscreteInputs = 0x02,
    /// Read Holding Registers (0x03)
    ReadHoldingRegisters = 0x03,
    /// Read Input Registers (0x04)
    ReadInputRegisters = 0x04,
    /// Write Single Coil (0x05)
    WriteSingleCoil = 0x05,
    /// Write Single Register (0x06)
    WriteSingleRegister = 0x06,
    /// Read Exception Status (0x07)
    ReadExceptionStatus = 0x07,
    /// Get Comm Event Counter (0x0B)
    GetCommEventCounter = 0x0B,
    /// Get Comm Event Log (0x0C)
    GetCommEventLog = 0x0C,
    /// Write Multiple Coils (0x0F)
    WriteMultipleCoils = 0x0F,
    /// Write Multiple Registers (0x10)
    WriteMultipleRegisters = 0x10,
    /// Report Server ID (0x11)
    ReportServerId = 0x11,
    /// Read File Record (0x14)
    ReadFileRecord = 0x14,
    /// Write File Record (0x15)
    WriteFileRecord = 0x15,
    /// Mask Write Register (0x16)
    MaskWriteRegister = 0x16,
    /// Read/Write Multiple Registers (0x17)
    ReadWriteMultipleRegisters = 0x17,
    /// Read FIFO Queue (0x18)
    ReadFifoQueue = 0x18,
    /// Read Device Identification (0x2B, MEI type 0x0E)
    ReadDeviceIdentification = 0x2B,
}

impl FunctionCode {
    /// Convert from the wire byte. `None` for codes the engine does not
    /// speak; at decode time that is a malformed frame, not a distinct
    /// error class.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::ReadCoils),
            0x02 => Some(Self::ReadDiscreteInputs),
            0x03 => Some(Self::ReadHoldingRegisters),
            0x04 => Some(Self::ReadInputRegisters),
            0x05 => Some(Self::WriteSingleCoil),
            0x06 => Some(Self::WriteSingleRegister),
            0x07 => Some(Self::ReadExceptionStatus),
            0x0B => Some(Self::GetCommEventCounter),
            0x0C => Some(Self::GetCommEventLog),
            0x0F => Some(Self::WriteMultipleCoils),
            0x10 => Some(Self::WriteMultipleRegisters),
            0x11 => Some(Self::ReportServerId),
            0x14 => Some(Self::ReadFileRecord),
            0x15 => Some(Self::WriteFileRecord),
            0x16 => Some(Self::MaskWriteRegister),
            0x17 => Some(Self::ReadWriteMultipleRegisters),
            0x18 => Some(Self::ReadFifoQueue),
            0x2B => Some(Self::ReadDeviceIdentification),
            _ => None,
        }
    }

    /// Convert to the wire byte.
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Human-readable function name for diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            Self::ReadCoils => "Read Coils",
            Self::ReadDiscreteInputs => "Read Discrete Inputs",
            Self::ReadHoldingRegisters => "Read Holding Registers",
            Self::ReadInputRegisters => "Read Input Registers",
            Self::WriteSingleCoil => "Write Single Coil",
            Self::WriteSingleRegister => "Write Single Register",
            Self::ReadExceptionStatus => "Read Exception Status",
            Self::GetCommEventCounter => "Get Comm Event Counter",
            Self::GetCommEventLog => "Get Comm Event Log",
            Self::WriteMultipleCoils => "Write Multiple Coils",
            Self::WriteMultipleRegisters => "Write Multiple Registers",
            Self::ReportServerId => "Report Server ID",
            Self::ReadFileRecord => "Read File Record",
            Self::WriteFileRecord => "Write File Record",
            Self::MaskWriteRegister => "Mask Write Register",
            Self::ReadWriteMultipleRegisters => "Read/Write Multiple Registers",
            Self::ReadFifoQueue => "Read FIFO Queue",
            Self::ReadDeviceIdentification => "Read Device Identification",
        }
    }
}

impl fmt::Display for FunctionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:02X})", self.name(), *self as u8)
    }
}

/// Standard Modbus exception codes returned by devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ExceptionCode {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
    ServerDeviceFailure = 0x04,
    Acknowledge = 0x05,
    ServerDeviceBusy = 0x06,
    MemoryParityError = 0x08,
    GatewayPathUnavailable = 0x0A,
    GatewayTargetDeviceFailedToRespond = 0x0B,
}

impl ExceptionCode {
    /// Convert from the wire byte; `None` for non-standard codes (which are
    /// still surfaced to callers as raw bytes).
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::IllegalFunction),
            0x02 => Some(Self::IllegalDataAddress),
            0x03 => Some(Self::IllegalDataValue),
            0x04 => Some(Self::ServerDeviceFailure),
            0x05 => Some(Self::Acknowledge),
            0x06 => Some(Self::ServerDeviceBusy),
            0x08 => Some(Self::MemoryParityError),
            0x0A => Some(Self::GatewayPathUnavailable),
            0x0B => Some(Self::GatewayTargetDeviceFailedToRespond),
            _ => None,
        }
    }

    /// Convert to the wire byte.
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "0x{:02X}: {}",
            self.to_u8(),
            exception_description(self.to_u8())
        )
    }
}

/// Device identification access level for function 0x2B / MEI 0x0E.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum DeviceIdCode {
    /// Basic identification objects (VendorName..MajorMinorRevision).
    Basic = 0x01,
    /// Regular identification objects.
    Regular = 0x02,
    /// Extended identification objects.
    Extended = 0x03,
    /// One specific object, named by `object_id`.
    Specific = 0x04,
}

/// One sub-request of Read File Record (0x14). Reference type is always 6,
/// the only type the protocol defines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileRecordRef {
    pub file_number: u16,
    pub record_number: u16,
    /// Record length in registers (1-124).
    pub record_length: u16,
}

/// One sub-request of Write File Record (0x15).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecordWrite {
    pub file_number: u16,
    pub record_number: u16,
    pub values: Vec<u16>,
}

/// Typed, per-function request payload. Construction is cheap; quantity
/// bounds are enforced by [`RequestPdu::validate`] before any encoding or
/// I/O happens.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestPdu {
    ReadCoils { address: u16, quantity: u16 },
    ReadDiscreteInputs { address: u16, quantity: u16 },
    ReadHoldingRegisters { address: u16, quantity: u16 },
    ReadInputRegisters { address: u16, quantity: u16 },
    WriteSingleCoil { address: u16, value: bool },
    WriteSingleRegister { address: u16, value: u16 },
    WriteMultipleCoils { address: u16, values: Vec<bool> },
    WriteMultipleRegisters { address: u16, values: Vec<u16> },
    ReadWriteMultipleRegisters {
        read_address: u16,
        read_quantity: u16,
        write_address: u16,
        values: Vec<u16>,
    },
    MaskWriteRegister { address: u16, and_mask: u16, or_mask: u16 },
    ReadFifoQueue { address: u16 },
    ReadFileRecord { subrequests: Vec<FileRecordRef> },
    WriteFileRecord { subrequests: Vec<FileRecordWrite> },
    ReadExceptionStatus,
    GetCommEventCounter,
    GetCommEventLog,
    ReportServerId,
    ReadDeviceIdentification { code: DeviceIdCode, object_id: u8 },
}

impl RequestPdu {
    /// Function code this payload belongs to.
    pub fn function(&self) -> FunctionCode {
        match self {
            Self::ReadCoils { .. } => FunctionCode::ReadCoils,
            Self::ReadDiscreteInputs { .. } => FunctionCode::ReadDiscreteInputs,
            Self::ReadHoldingRegisters { .. } => FunctionCode::ReadHoldingRegisters,
            Self::ReadInputRegisters { .. } => FunctionCode::ReadInputRegisters,
            Self::WriteSingleCoil { .. } => FunctionCode::WriteSingleCoil,
            Self::WriteSingleRegister { .. } => FunctionCode::WriteSingleRegister,
            Self::WriteMultipleCoils { .. } => FunctionCode::WriteMultipleCoils,
            Self::WriteMultipleRegisters { .. } => FunctionCode::WriteMultipleRegisters,
            Self::ReadWriteMultipleRegisters { .. } => FunctionCode::ReadWriteMultipleRegisters,
            Self::MaskWriteRegister { .. } => FunctionCode::MaskWriteRegister,
            Self::ReadFifoQueue { .. } => FunctionCode::ReadFifoQueue,
            Self::ReadFileRecord { .. } => FunctionCode::ReadFileRecord,
            Self::WriteFileRecord { .. } => FunctionCode::WriteFileRecord,
            Self::ReadExceptionStatus => FunctionCode::ReadExceptionStatus,
            Self::GetCommEventCounter => FunctionCode::GetCommEventCounter,
            Self::GetCommEventLog => FunctionCode::GetCommEventLog,
            Self::ReportServerId => FunctionCode::ReportServerId,
            Self::ReadDeviceIdentification { .. } => FunctionCode::ReadDeviceIdentification,
        }
    }

    /// Short address/quantity summary for log events.
    pub fn describe(&self) -> String {
        match self {
            Self::ReadCoils { address, quantity }
            | Self::ReadDiscreteInputs { address, quantity }
            | Self::ReadHoldingRegisters { address, quantity }
            | Self::ReadInputRegisters { address, quantity } => {
                format!("addr={address}, qty={quantity}")
            }
            Self::WriteSingleCoil { address, value } => {
                format!("addr={address}, value={}", if *value { "ON" } else { "OFF" })
            }
            Self::WriteSingleRegister { address, value } => {
                format!("addr={address}, value=0x{value:04X}")
            }
            Self::WriteMultipleCoils { address, values } => {
                format!("addr={address}, qty={}", values.len())
            }
            Self::WriteMultipleRegisters { address, values } => {
                format!("addr={address}, qty={}", values.len())
            }
            Self::ReadWriteMultipleRegisters {
                read_address,
                read_quantity,
                write_address,
                values,
            } => format!(
                "read addr={read_address} qty={read_quantity}, write addr={write_address} qty={}",
                values.len()
            ),
            Self::MaskWriteRegister {
                address,
                and_mask,
                or_mask,
            } => format!("addr={address}, and=0x{and_mask:04X}, or=0x{or_mask:04X}"),
            Self::ReadFifoQueue { address } => format!("pointer addr={address}"),
            Self::ReadFileRecord { subrequests } => {
                format!("{} subrequest(s)", subrequests.len())
            }
            Self::WriteFileRecord { subrequests } => {
                format!("{} subrequest(s)", subrequests.len())
            }
            Self::ReadExceptionStatus
            | Self::GetCommEventCounter
            | Self::GetCommEventLog
            | Self::ReportServerId => String::from("no parameters"),
            Self::ReadDeviceIdentification { code, object_id } => {
                format!("code={code:?}, object_id=0x{object_id:02X}")
            }
        }
    }

    /// Enforce the protocol quantity bounds before any bytes are produced.
    ///
    /// A quantity of zero or one beyond the per-function maximum would
    /// yield a frame a compliant device rejects outright, so these are
    /// caller errors (`InvalidArgument`), not wire errors.
    pub fn validate(&self) -> ModbusResult<()> {
        match self {
            Self::ReadCoils { address, quantity } | Self::ReadDiscreteInputs { address, quantity } => {
                check_quantity(*quantity, MAX_READ_COILS, "coil read")?;
                check_address_span(*address, *quantity)
            }
            Self::ReadHoldingRegisters { address, quantity }
            | Self::ReadInputRegisters { address, quantity } => {
                check_quantity(*quantity, MAX_READ_REGISTERS, "register read")?;
                check_address_span(*address, *quantity)
            }
            Self::WriteSingleCoil { .. }
            | Self::WriteSingleRegister { .. }
            | Self::MaskWriteRegister { .. }
            | Self::ReadFifoQueue { .. }
            | Self::ReadExceptionStatus
            | Self::GetCommEventCounter
            | Self::GetCommEventLog
            | Self::ReportServerId
            | Self::ReadDeviceIdentification { .. } => Ok(()),
            Self::WriteMultipleCoils { address, values } => {
                check_quantity(values.len() as u32, MAX_WRITE_COILS, "multi-coil write")?;
                check_address_span(*address, values.len() as u16)
            }
            Self::WriteMultipleRegisters { address, values } => {
                check_quantity(values.len() as u32, MAX_WRITE_REGISTERS, "multi-register write")?;
                check_address_span(*address, values.len() as u16)
            }
            Self::ReadWriteMultipleRegisters {
                read_address,
                read_quantity,
                write_address,
                values,
            } => {
                check_quantity(*read_quantity, MAX_READ_REGISTERS, "combined read")?;
                check_quantity(values.len() as u32, MAX_RW_WRITE_REGISTERS, "combined write")?;
                check_address_span(*read_address, *read_quantity)?;
                check_address_span(*write_address, values.len() as u16)
            }
            Self::ReadFileRecord { subrequests } => {
                if subrequests.is_empty() {
                    return Err(ProtocolError::invalid_argument(
                        "file record read needs at least one subrequest",
                    ));
                }
                // 1 byte count + 7 bytes per subrequest must fit the PDU.
                if subrequests.len() > 35 {
                    return Err(ProtocolError::invalid_argument(format!(
                        "too many file record subrequests: {}",
                        subrequests.len()
                    )));
                }
                for sub in subrequests {
                    if sub.record_length == 0 || sub.record_length > 124 {
                        return Err(ProtocolError::invalid_argument(format!(
                            "record length {} out of range 1-124",
                            sub.record_length
                        )));
                    }
                }
                Ok(())
            }
            Self::WriteFileRecord { subrequests } => {
                if subrequests.is_empty() {
                    return Err(ProtocolError::invalid_argument(
                        "file record write needs at least one subrequest",
                    ));
                }
                let total: usize = subrequests.iter().map(|s| 7 + s.values.len() * 2).sum();
                if total + 1 > 253 {
                    return Err(ProtocolError::invalid_argument(format!(
                        "file record write payload of {total} bytes exceeds the PDU limit"
                    )));
                }
                for sub in subrequests {
                    if sub.values.is_empty() || sub.values.len() > 122 {
                        return Err(ProtocolError::invalid_argument(format!(
                            "record write length {} out of range 1-122",
                            sub.values.len()
                        )));
                    }
                }
                Ok(())
            }
        }
    }
}

fn check_quantity<Q: Into<u32>>(quantity: Q, max: u16, what: &str) -> ModbusResult<()> {
    let quantity = quantity.into();
    if quantity == 0 || quantity > max as u32 {
        return Err(ProtocolError::invalid_argument(format!(
            "{what} quantity {quantity} out of range 1-{max}"
        )));
    }
    Ok(())
}

fn check_address_span(start: u16, count: u16) -> ModbusResult<()> {
    if start as u32 + count as u32 > 65536 {
        return Err(ProtocolError::invalid_argument(format!(
            "address span {start}+{count} exceeds the 16-bit address space"
        )));
    }
    Ok(())
}

/// A complete request as correlated on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub transaction_id: u16,
    pub unit_id: UnitId,
    pub pdu: RequestPdu,
}

/// Server identification returned by Report Server ID (0x11).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerId {
    pub server_id: Vec<u8>,
    pub run_indicator: bool,
}

/// Counters returned by Get Comm Event Counter (0x0B).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommEventCounter {
    pub status: u16,
    pub event_count: u16,
}

/// Event history returned by Get Comm Event Log (0x0C).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommEventLog {
    pub status: u16,
    pub event_count: u16,
    pub message_count: u16,
    pub events: Vec<u8>,
}

/// One identification object from Read Device Identification (0x2B).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdObject {
    pub object_id: u8,
    pub value: Vec<u8>,
}

/// Decoded Read Device Identification response. Stream continuation is
/// surfaced through `more_follows`/`next_object_id`; the dispatcher does
/// not auto-follow it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentification {
    pub conformity_level: u8,
    pub more_follows: bool,
    pub next_object_id: u8,
    pub objects: Vec<DeviceIdObject>,
}

/// Typed response data, one variant per function family.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseData {
    /// Coil or discrete input states, exactly as many as were requested.
    Bits(Vec<bool>),
    /// Holding/input register values, exactly as many as were requested.
    Registers(Vec<u16>),
    /// Echo of a single write: address and raw value field.
    WriteEcho { address: u16, value: u16 },
    /// Echo of a multi-write: start address and quantity written.
    WriteMultipleEcho { address: u16, quantity: u16 },
    /// Echo of Mask Write Register.
    MaskWriteEcho { address: u16, and_mask: u16, or_mask: u16 },
    /// FIFO queue contents, oldest first.
    FifoQueue(Vec<u16>),
    /// Register data per Read File Record subrequest, in request order.
    FileRecords(Vec<Vec<u16>>),
    /// Echo of a Write File Record request.
    FileWriteEcho(Vec<FileRecordWrite>),
    /// Output status byte from Read Exception Status.
    ExceptionStatus(u8),
    CommEventCounter(CommEventCounter),
    CommEventLog(CommEventLog),
    ServerId(ServerId),
    DeviceIdentification(DeviceIdentification),
}

/// Discriminated response union: either decoded data or a device-reported
/// exception (function byte with the high bit set).
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Success {
        function: FunctionCode,
        data: ResponseData,
    },
    Exception {
        function: FunctionCode,
        code: u8,
    },
}

/// Bit and register packing helpers shared by the codec and tests.
pub mod data_utils {
    /// Convert register values to bytes (big-endian).
    pub fn registers_to_bytes(registers: &[u16]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(registers.len() * 2);
        for &register in registers {
            bytes.extend_from_slice(&register.to_be_bytes());
        }
        bytes
    }

    /// Convert bytes to register values (big-endian). The caller guarantees
    /// an even length; the trailing odd byte, if any, is ignored.
    pub fn bytes_to_registers(bytes: &[u8]) -> Vec<u16> {
        bytes
            .chunks_exact(2)
            .map(|chunk| u16::from_be_bytes([chunk[0], chunk[1]]))
            .collect()
    }

    /// Pack booleans into `ceil(n/8)` bytes, LSB-first within each byte.
    pub fn pack_bits(bits: &[bool]) -> Vec<u8> {
        let mut bytes = vec![0u8; bits.len().div_ceil(8)];
        for (i, &bit) in bits.iter().enumerate() {
            if bit {
                bytes[i / 8] |= 1 << (i % 8);
            }
        }
        bytes
    }

    /// Unpack `bit_count` booleans from LSB-first packed bytes.
    pub fn unpack_bits(bytes: &[u8], bit_count: usize) -> Vec<bool> {
        (0..bit_count)
            .map(|i| {
                bytes
                    .get(i / 8)
                    .is_some_and(|byte| byte & (1 << (i % 8)) != 0)
            })
            .collect()
    }
}

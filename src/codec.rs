//! Modbus TCP frame codec.
//!
//! Pure, stateless translation between typed requests/responses and the
//! Modbus TCP Application Data Unit. No I/O happens here; the session moves
//! bytes and the dispatcher sequences calls.
//!
//! ## ADU layout (big-endian throughout)
//!
//! | Offset | Size | Field |
//! |--------|------|------------------------------------------------|
//! | 0      | 2    | Transaction ID                                 |
//! | 2      | 2    | Protocol ID, always 0                          |
//! | 4      | 2    | Length: unit ID through end of payload         |
//! | 6      | 1    | Unit ID                                        |
//! | 7      | 1    | Function code                                  |
//! | 8+     | var  | Function-specific payload                      |
//!
//! TCP provides integrity, so there is no checksum field (unlike the serial
//! RTU variant).

use bytes::{Buf, BufMut};

use crate::error::{ModbusResult, ProtocolError};
use crate::protocol::{
    data_utils, CommEventCounter, CommEventLog, DeviceIdObject, DeviceIdentification,
    FunctionCode, Request, RequestPdu, Response, ResponseData, ServerId,
};
use crate::{MAX_FIFO_COUNT, MBAP_HEADER_SIZE};

/// Bytes of the MBAP header plus the function code; the fixed prefix a
/// receiver reads before it knows the remaining frame length.
pub const RESPONSE_PREFIX_SIZE: usize = MBAP_HEADER_SIZE + 1;

/// File record reference type, the only one the protocol defines.
const FILE_RECORD_REF_TYPE: u8 = 0x06;

/// MEI type for Read Device Identification.
const MEI_DEVICE_IDENTIFICATION: u8 = 0x0E;

/// Serialize a request into a complete ADU.
///
/// Quantity bounds are enforced first (`InvalidArgument`), so an
/// out-of-range request never produces wire bytes.
pub fn encode_request(request: &Request) -> ModbusResult<Vec<u8>> {
    request.pdu.validate()?;

    let payload = encode_pdu_payload(&request.pdu);
    // Length counts unit ID + function code + payload.
    let length = (2 + payload.len()) as u16;

    let mut frame = Vec::with_capacity(MBAP_HEADER_SIZE + 1 + payload.len());
    frame.put_u16(request.transaction_id);
    frame.put_u16(0); // protocol ID
    frame.put_u16(length);
    frame.put_u8(request.unit_id);
    frame.put_u8(request.pdu.function().to_u8());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Function-specific request payload, everything after the function code.
pub(crate) fn encode_pdu_payload(pdu: &RequestPdu) -> Vec<u8> {
    let mut out = Vec::new();
    match pdu {
        RequestPdu::ReadCoils { address, quantity }
        | RequestPdu::ReadDiscreteInputs { address, quantity }
        | RequestPdu::ReadHoldingRegisters { address, quantity }
        | RequestPdu::ReadInputRegisters { address, quantity } => {
            out.put_u16(*address);
            out.put_u16(*quantity);
        }
        RequestPdu::WriteSingleCoil { address, value } => {
            out.put_u16(*address);
            out.put_u16(if *value { 0xFF00 } else { 0x0000 });
        }
        RequestPdu::WriteSingleRegister { address, value } => {
            out.put_u16(*address);
            out.put_u16(*value);
        }
        RequestPdu::WriteMultipleCoils { address, values } => {
            let packed = data_utils::pack_bits(values);
            out.put_u16(*address);
            out.put_u16(values.len() as u16);
            out.put_u8(packed.len() as u8);
            out.extend_from_slice(&packed);
        }
        RequestPdu::WriteMultipleRegisters { address, values } => {
            out.put_u16(*address);
            out.put_u16(values.len() as u16);
            out.put_u8((values.len() * 2) as u8);
            out.extend_from_slice(&data_utils::registers_to_bytes(values));
        }
        RequestPdu::ReadWriteMultipleRegisters {
            read_address,
            read_quantity,
            write_address,
            values,
        } => {
            out.put_u16(*read_address);
            out.put_u16(*read_quantity);
            out.put_u16(*write_address);
            out.put_u16(values.len() as u16);
            out.put_u8((values.len() * 2) as u8);
            out.extend_from_slice(&data_utils::registers_to_bytes(values));
        }
        RequestPdu::MaskWriteRegister {
            address,
            and_mask,
            or_mask,
        } => {
            out.put_u16(*address);
            out.put_u16(*and_mask);
            out.put_u16(*or_mask);
        }
        RequestPdu::ReadFifoQueue { address } => {
            out.put_u16(*address);
        }
        RequestPdu::ReadFileRecord { subrequests } => {
            out.put_u8((subrequests.len() * 7) as u8);
            for sub in subrequests {
                out.put_u8(FILE_RECORD_REF_TYPE);
                out.put_u16(sub.file_number);
                out.put_u16(sub.record_number);
                out.put_u16(sub.record_length);
            }
        }
        RequestPdu::WriteFileRecord { subrequests } => {
            let data_len: usize = subrequests.iter().map(|s| 7 + s.values.len() * 2).sum();
            out.put_u8(data_len as u8);
            for sub in subrequests {
                out.put_u8(FILE_RECORD_REF_TYPE);
                out.put_u16(sub.file_number);
                out.put_u16(sub.record_number);
                out.put_u16(sub.values.len() as u16);
                out.extend_from_slice(&data_utils::registers_to_bytes(&sub.values));
            }
        }
        RequestPdu::ReadExceptionStatus
        | RequestPdu::GetCommEventCounter
        | RequestPdu::GetCommEventLog
        | RequestPdu::ReportServerId => {}
        RequestPdu::ReadDeviceIdentification { code, object_id } => {
            out.put_u8(MEI_DEVICE_IDENTIFICATION);
            out.put_u8(*code as u8);
            out.put_u8(*object_id);
        }
    }
    out
}

/// Deserialize and validate a complete response ADU against the request it
/// answers.
///
/// Checks, in order: minimum length, protocol ID, declared length against
/// bytes actually present, transaction correlation, exception flag, function
/// echo, then the per-function payload shape including write-echo
/// verification.
pub fn decode_response(frame: &[u8], request: &Request) -> ModbusResult<Response> {
    if frame.len() < RESPONSE_PREFIX_SIZE {
        return Err(ProtocolError::malformed(format!(
            "frame of {} bytes is shorter than the {} byte MBAP prefix",
            frame.len(),
            RESPONSE_PREFIX_SIZE
        )));
    }

    let transaction_id = u16::from_be_bytes([frame[0], frame[1]]);
    let protocol_id = u16::from_be_bytes([frame[2], frame[3]]);
    let declared_length = u16::from_be_bytes([frame[4], frame[5]]) as usize;

    if protocol_id != 0 {
        return Err(ProtocolError::malformed(format!(
            "protocol ID {protocol_id} is not 0"
        )));
    }
    // Length covers unit ID through end of payload.
    if declared_length != frame.len() - (MBAP_HEADER_SIZE - 1) {
        return Err(ProtocolError::malformed(format!(
            "declared length {} does not match {} bytes after the header",
            declared_length,
            frame.len() - (MBAP_HEADER_SIZE - 1)
        )));
    }
    if transaction_id != request.transaction_id {
        return Err(ProtocolError::transaction_mismatch(
            request.transaction_id,
            transaction_id,
        ));
    }

    let expected = request.pdu.function();
    let function_byte = frame[7];

    if function_byte == expected.to_u8() | 0x80 {
        let code = *frame.get(8).ok_or_else(|| {
            ProtocolError::malformed("exception response missing the exception code byte")
        })?;
        return Ok(Response::Exception {
            function: expected,
            code,
        });
    }
    if function_byte != expected.to_u8() {
        return Err(ProtocolError::malformed(format!(
            "unexpected function code 0x{:02X}, expected 0x{:02X}",
            function_byte,
            expected.to_u8()
        )));
    }

    let data = parse_response_data(&frame[RESPONSE_PREFIX_SIZE..], request)?;
    Ok(Response::Success {
        function: expected,
        data,
    })
}

fn parse_response_data(data: &[u8], request: &Request) -> ModbusResult<ResponseData> {
    match &request.pdu {
        RequestPdu::ReadCoils { quantity, .. } | RequestPdu::ReadDiscreteInputs { quantity, .. } => {
            parse_bits(data, *quantity)
        }
        RequestPdu::ReadHoldingRegisters { quantity, .. }
        | RequestPdu::ReadInputRegisters { quantity, .. } => {
            parse_registers(data, *quantity).map(ResponseData::Registers)
        }
        RequestPdu::WriteSingleCoil { address, value } => {
            let expected_value = if *value { 0xFF00 } else { 0x0000 };
            parse_write_echo(data, *address, expected_value)
        }
        RequestPdu::WriteSingleRegister { address, value } => {
            parse_write_echo(data, *address, *value)
        }
        RequestPdu::WriteMultipleCoils { address, values } => {
            parse_write_multiple_echo(data, *address, values.len() as u16)
        }
        RequestPdu::WriteMultipleRegisters { address, values } => {
            parse_write_multiple_echo(data, *address, values.len() as u16)
        }
        RequestPdu::ReadWriteMultipleRegisters { read_quantity, .. } => {
            parse_registers(data, *read_quantity).map(ResponseData::Registers)
        }
        RequestPdu::MaskWriteRegister {
            address,
            and_mask,
            or_mask,
        } => parse_mask_write_echo(data, *address, *and_mask, *or_mask),
        RequestPdu::ReadFifoQueue { .. } => parse_fifo_queue(data),
        RequestPdu::ReadFileRecord { subrequests } => parse_file_records(data, subrequests.len()),
        RequestPdu::WriteFileRecord { subrequests } => {
            // The response is a byte-exact echo of the request payload.
            let expected = encode_pdu_payload(&request.pdu);
            if data != expected.as_slice() {
                return Err(ProtocolError::malformed(
                    "file record write echo does not match the request",
                ));
            }
            Ok(ResponseData::FileWriteEcho(subrequests.clone()))
        }
        RequestPdu::ReadExceptionStatus => {
            let [status] = data else {
                return Err(ProtocolError::malformed(format!(
                    "exception status response of {} bytes, expected 1",
                    data.len()
                )));
            };
            Ok(ResponseData::ExceptionStatus(*status))
        }
        RequestPdu::GetCommEventCounter => {
            if data.len() != 4 {
                return Err(ProtocolError::malformed(format!(
                    "comm event counter response of {} bytes, expected 4",
                    data.len()
                )));
            }
            let mut buf = data;
            Ok(ResponseData::CommEventCounter(CommEventCounter {
                status: buf.get_u16(),
                event_count: buf.get_u16(),
            }))
        }
        RequestPdu::GetCommEventLog => parse_comm_event_log(data),
        RequestPdu::ReportServerId => parse_server_id(data),
        RequestPdu::ReadDeviceIdentification { .. } => parse_device_identification(data),
    }
}

/// Validate the byte-count field and unpack exactly `quantity` bits.
fn parse_bits(data: &[u8], quantity: u16) -> ModbusResult<ResponseData> {
    let expected_bytes = (quantity as usize).div_ceil(8);
    let byte_count = check_byte_count(data, "bit")?;
    if byte_count != expected_bytes {
        return Err(ProtocolError::malformed(format!(
            "bit response byte count {byte_count} does not match {expected_bytes} for quantity {quantity}"
        )));
    }
    Ok(ResponseData::Bits(data_utils::unpack_bits(
        &data[1..],
        quantity as usize,
    )))
}

/// Validate the byte-count field and unpack exactly `quantity` registers.
fn parse_registers(data: &[u8], quantity: u16) -> ModbusResult<Vec<u16>> {
    let byte_count = check_byte_count(data, "register")?;
    if byte_count != quantity as usize * 2 {
        return Err(ProtocolError::malformed(format!(
            "register response byte count {} does not match {} for quantity {}",
            byte_count,
            quantity * 2,
            quantity
        )));
    }
    Ok(data_utils::bytes_to_registers(&data[1..]))
}

/// Leading byte-count field must describe exactly the remaining bytes.
fn check_byte_count(data: &[u8], what: &str) -> ModbusResult<usize> {
    let Some(&byte_count) = data.first() else {
        return Err(ProtocolError::malformed(format!("empty {what} response")));
    };
    if byte_count as usize != data.len() - 1 {
        return Err(ProtocolError::malformed(format!(
            "{} response declares {} data bytes but carries {}",
            what,
            byte_count,
            data.len() - 1
        )));
    }
    Ok(byte_count as usize)
}

fn parse_write_echo(data: &[u8], address: u16, value: u16) -> ModbusResult<ResponseData> {
    if data.len() != 4 {
        return Err(ProtocolError::malformed(format!(
            "write echo of {} bytes, expected 4",
            data.len()
        )));
    }
    let echo_address = u16::from_be_bytes([data[0], data[1]]);
    let echo_value = u16::from_be_bytes([data[2], data[3]]);
    if echo_address != address || echo_value != value {
        return Err(ProtocolError::malformed(format!(
            "write echo addr={echo_address} value=0x{echo_value:04X} does not match sent addr={address} value=0x{value:04X}"
        )));
    }
    Ok(ResponseData::WriteEcho {
        address: echo_address,
        value: echo_value,
    })
}

fn parse_write_multiple_echo(data: &[u8], address: u16, quantity: u16) -> ModbusResult<ResponseData> {
    if data.len() != 4 {
        return Err(ProtocolError::malformed(format!(
            "multi-write echo of {} bytes, expected 4",
            data.len()
        )));
    }
    let echo_address = u16::from_be_bytes([data[0], data[1]]);
    let echo_quantity = u16::from_be_bytes([data[2], data[3]]);
    if echo_address != address || echo_quantity != quantity {
        return Err(ProtocolError::malformed(format!(
            "multi-write echo addr={echo_address} qty={echo_quantity} does not match sent addr={address} qty={quantity}"
        )));
    }
    Ok(ResponseData::WriteMultipleEcho {
        address: echo_address,
        quantity: echo_quantity,
    })
}

fn parse_mask_write_echo(
    data: &[u8],
    address: u16,
    and_mask: u16,
    or_mask: u16,
) -> ModbusResult<ResponseData> {
    if data.len() != 6 {
        return Err(ProtocolError::malformed(format!(
            "mask write echo of {} bytes, expected 6",
            data.len()
        )));
    }
    let echo_address = u16::from_be_bytes([data[0], data[1]]);
    let echo_and = u16::from_be_bytes([data[2], data[3]]);
    let echo_or = u16::from_be_bytes([data[4], data[5]]);
    if echo_address != address || echo_and != and_mask || echo_or != or_mask {
        return Err(ProtocolError::malformed(
            "mask write echo does not match the request",
        ));
    }
    Ok(ResponseData::MaskWriteEcho {
        address: echo_address,
        and_mask: echo_and,
        or_mask: echo_or,
    })
}

fn parse_fifo_queue(data: &[u8]) -> ModbusResult<ResponseData> {
    if data.len() < 4 {
        return Err(ProtocolError::malformed(format!(
            "FIFO response of {} bytes is shorter than its fixed fields",
            data.len()
        )));
    }
    let mut buf = data;
    let byte_count = buf.get_u16() as usize;
    let fifo_count = buf.get_u16() as usize;
    if byte_count != data.len() - 2 || byte_count != fifo_count * 2 + 2 {
        return Err(ProtocolError::malformed(format!(
            "FIFO response byte count {byte_count} inconsistent with count {fifo_count}"
        )));
    }
    if fifo_count > MAX_FIFO_COUNT as usize {
        return Err(ProtocolError::malformed(format!(
            "FIFO count {fifo_count} exceeds the protocol maximum {MAX_FIFO_COUNT}"
        )));
    }
    Ok(ResponseData::FifoQueue(data_utils::bytes_to_registers(buf)))
}

fn parse_file_records(data: &[u8], expected_groups: usize) -> ModbusResult<ResponseData> {
    let total = check_byte_count(data, "file record")?;
    let mut rest = &data[1..1 + total];
    let mut records = Vec::with_capacity(expected_groups);
    while !rest.is_empty() {
        if rest.len() < 2 {
            return Err(ProtocolError::malformed("truncated file record group"));
        }
        let group_len = rest[0] as usize;
        let ref_type = rest[1];
        if ref_type != FILE_RECORD_REF_TYPE {
            return Err(ProtocolError::malformed(format!(
                "file record reference type {ref_type}, expected {FILE_RECORD_REF_TYPE}"
            )));
        }
        // group_len counts the reference type byte plus the record data.
        if group_len < 1 || group_len % 2 == 0 || rest.len() < 1 + group_len {
            return Err(ProtocolError::malformed(format!(
                "file record group length {group_len} inconsistent with remaining {} bytes",
                rest.len()
            )));
        }
        records.push(data_utils::bytes_to_registers(&rest[2..1 + group_len]));
        rest = &rest[1 + group_len..];
    }
    if records.len() != expected_groups {
        return Err(ProtocolError::malformed(format!(
            "file record response carries {} groups, request had {} subrequests",
            records.len(),
            expected_groups
        )));
    }
    Ok(ResponseData::FileRecords(records))
}

fn parse_comm_event_log(data: &[u8]) -> ModbusResult<ResponseData> {
    let byte_count = check_byte_count(data, "comm event log")?;
    if byte_count < 6 {
        return Err(ProtocolError::malformed(format!(
            "comm event log of {byte_count} bytes is shorter than its fixed fields"
        )));
    }
    let mut buf = &data[1..];
    let status = buf.get_u16();
    let event_count = buf.get_u16();
    let message_count = buf.get_u16();
    Ok(ResponseData::CommEventLog(CommEventLog {
        status,
        event_count,
        message_count,
        events: buf.to_vec(),
    }))
}

fn parse_server_id(data: &[u8]) -> ModbusResult<ResponseData> {
    let byte_count = check_byte_count(data, "server ID")?;
    if byte_count < 2 {
        return Err(ProtocolError::malformed(
            "server ID response needs at least an ID byte and the run indicator",
        ));
    }
    let body = &data[1..];
    // Run indicator is the final byte: 0xFF running, 0x00 stopped.
    let run_indicator = body[body.len() - 1] == 0xFF;
    Ok(ResponseData::ServerId(ServerId {
        server_id: body[..body.len() - 1].to_vec(),
        run_indicator,
    }))
}

fn parse_device_identification(data: &[u8]) -> ModbusResult<ResponseData> {
    if data.len() < 6 {
        return Err(ProtocolError::malformed(format!(
            "device identification response of {} bytes is shorter than its fixed fields",
            data.len()
        )));
    }
    if data[0] != MEI_DEVICE_IDENTIFICATION {
        return Err(ProtocolError::malformed(format!(
            "MEI type 0x{:02X}, expected 0x{MEI_DEVICE_IDENTIFICATION:02X}",
            data[0]
        )));
    }
    let conformity_level = data[2];
    let more_follows = data[3] == 0xFF;
    let next_object_id = data[4];
    let object_count = data[5] as usize;

    let mut rest = &data[6..];
    let mut objects = Vec::with_capacity(object_count);
    for _ in 0..object_count {
        if rest.len() < 2 {
            return Err(ProtocolError::malformed("truncated identification object"));
        }
        let object_id = rest[0];
        let value_len = rest[1] as usize;
        if rest.len() < 2 + value_len {
            return Err(ProtocolError::malformed(format!(
                "identification object 0x{object_id:02X} declares {value_len} bytes but fewer remain"
            )));
        }
        objects.push(DeviceIdObject {
            object_id,
            value: rest[2..2 + value_len].to_vec(),
        });
        rest = &rest[2 + value_len..];
    }
    if !rest.is_empty() {
        return Err(ProtocolError::malformed(
            "trailing bytes after the declared identification objects",
        ));
    }
    Ok(ResponseData::DeviceIdentification(DeviceIdentification {
        conformity_level,
        more_follows,
        next_object_id,
        objects,
    }))
}

/// Extract the remaining frame length from an 8-byte MBAP+function prefix.
///
/// The declared Length counts unit ID + function code + payload; the two
/// former are already part of the prefix, so the body still to read is
/// `Length - 2`.
pub fn remaining_from_prefix(prefix: &[u8; RESPONSE_PREFIX_SIZE]) -> ModbusResult<usize> {
    let length = u16::from_be_bytes([prefix[4], prefix[5]]) as usize;
    if length < 2 {
        return Err(ProtocolError::malformed(format!(
            "declared length {length} cannot cover unit ID and function code"
        )));
    }
    if MBAP_HEADER_SIZE - 1 + length > crate::MAX_TCP_FRAME_SIZE {
        return Err(ProtocolError::malformed(format!(
            "declared length {length} exceeds the maximum TCP frame size"
        )));
    }
    Ok(length - 2)
}

//! Request dispatcher: sequences one operation at a time over a session.
//!
//! Every operation walks the same path: encode the request, send it, read
//! the reply, decode and validate it, then hand back typed data. Errors
//! that leave the stream position unknowable (`MalformedFrame`,
//! `TransactionMismatch`) force a disconnect, because a desynchronized
//! byte stream cannot be trusted for the next frame boundary.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::codec;
use crate::error::{exception_description, ModbusResult, ProtocolError};
use crate::fault::FaultInjector;
use crate::logging::{CallbackLogger, FrameDirection, OperationOutcome};
use crate::protocol::{
    CommEventCounter, CommEventLog, DeviceIdCode, DeviceIdentification, FileRecordRef,
    FileRecordWrite, Request, RequestPdu, Response, ResponseData, ServerId, UnitId,
};
use crate::session::{DisconnectHandle, Endpoint, SessionStats, TcpSession};
use crate::utils::{OperationTimer, PerformanceMetrics};

/// Where an in-flight operation currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Idle,
    Encoding,
    Sending,
    Receiving,
    Decoding,
}

/// Typed Modbus operation surface.
///
/// Trait object-safe via `async_trait`, so a harness can swap the TCP
/// dispatcher for a canned-response double.
#[async_trait]
pub trait ModbusDispatch: Send {
    async fn read_coils(&mut self, unit_id: UnitId, address: u16, quantity: u16)
        -> ModbusResult<Vec<bool>>;
    async fn read_discrete_inputs(
        &mut self,
        unit_id: UnitId,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<bool>>;
    async fn read_holding_registers(
        &mut self,
        unit_id: UnitId,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<u16>>;
    async fn read_input_registers(
        &mut self,
        unit_id: UnitId,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<u16>>;
    async fn write_single_coil(
        &mut self,
        unit_id: UnitId,
        address: u16,
        value: bool,
    ) -> ModbusResult<()>;
    async fn write_single_register(
        &mut self,
        unit_id: UnitId,
        address: u16,
        value: u16,
    ) -> ModbusResult<()>;
    async fn write_multiple_coils(
        &mut self,
        unit_id: UnitId,
        address: u16,
        values: &[bool],
    ) -> ModbusResult<()>;
    async fn write_multiple_registers(
        &mut self,
        unit_id: UnitId,
        address: u16,
        values: &[u16],
    ) -> ModbusResult<()>;
    async fn read_write_multiple_registers(
        &mut self,
        unit_id: UnitId,
        read_address: u16,
        read_quantity: u16,
        write_address: u16,
        values: &[u16],
    ) -> ModbusResult<Vec<u16>>;
    async fn mask_write_register(
        &mut self,
        unit_id: UnitId,
        address: u16,
        and_mask: u16,
        or_mask: u16,
    ) -> ModbusResult<()>;
    async fn read_fifo_queue(&mut self, unit_id: UnitId, address: u16) -> ModbusResult<Vec<u16>>;
    async fn read_file_record(
        &mut self,
        unit_id: UnitId,
        subrequests: Vec<FileRecordRef>,
    ) -> ModbusResult<Vec<Vec<u16>>>;
    async fn write_file_record(
        &mut self,
        unit_id: UnitId,
        subrequests: Vec<FileRecordWrite>,
    ) -> ModbusResult<()>;
    async fn read_exception_status(&mut self, unit_id: UnitId) -> ModbusResult<u8>;
    async fn get_comm_event_counter(&mut self, unit_id: UnitId) -> ModbusResult<CommEventCounter>;
    async fn get_comm_event_log(&mut self, unit_id: UnitId) -> ModbusResult<CommEventLog>;
    async fn report_server_id(&mut self, unit_id: UnitId) -> ModbusResult<ServerId>;
    async fn read_device_identification(
        &mut self,
        unit_id: UnitId,
        code: DeviceIdCode,
        object_id: u8,
    ) -> ModbusResult<DeviceIdentification>;
}

/// Dispatcher over one TCP session.
pub struct TcpDispatcher {
    session: TcpSession,
    logger: CallbackLogger,
    metrics: PerformanceMetrics,
    phase: Phase,
}

impl TcpDispatcher {
    pub async fn connect(endpoint: Endpoint) -> ModbusResult<Self> {
        Ok(Self::from_session(TcpSession::connect(endpoint).await?))
    }

    pub async fn connect_with_timeout(endpoint: Endpoint, timeout: Duration) -> ModbusResult<Self> {
        Ok(Self::from_session(
            TcpSession::connect_with_timeout(endpoint, timeout).await?,
        ))
    }

    pub fn from_session(session: TcpSession) -> Self {
        Self {
            session,
            logger: CallbackLogger::disabled(),
            metrics: PerformanceMetrics::default(),
            phase: Phase::Idle,
        }
    }

    /// Replace the injected logger sink.
    pub fn with_logger(mut self, logger: CallbackLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn metrics(&self) -> PerformanceMetrics {
        self.metrics
    }

    pub fn session_stats(&self) -> SessionStats {
        self.session.stats()
    }

    pub fn faults(&self) -> Arc<FaultInjector> {
        self.session.faults()
    }

    pub fn disconnect_handle(&self) -> DisconnectHandle {
        self.session.disconnect_handle()
    }

    pub async fn disconnect(&mut self) {
        self.session.disconnect().await;
    }

    /// Run one request/response exchange.
    async fn execute(&mut self, unit_id: UnitId, pdu: RequestPdu) -> ModbusResult<ResponseData> {
        let description = format!(
            "{} ({}) unit={unit_id}",
            pdu.function().name(),
            pdu.describe()
        );
        let timer = OperationTimer::new(description.clone());

        let result = self.exchange(unit_id, pdu).await;
        self.phase = Phase::Idle;

        // Desynchronized stream: the next frame boundary is unknowable.
        if result
            .as_ref()
            .is_err_and(|e| e.requires_disconnect())
        {
            self.session.disconnect().await;
        }

        let elapsed = timer.finish();
        let outcome = match &result {
            Ok(_) => OperationOutcome::Success,
            Err(ProtocolError::DeviceException { code, .. }) => OperationOutcome::DeviceException(
                format!("0x{code:02X} {}", exception_description(*code)),
            ),
            Err(e) => OperationOutcome::Failure(e.to_string()),
        };
        self.logger.log_operation(&description, &outcome, elapsed);
        self.metrics.record(elapsed, result.is_ok());
        result
    }

    async fn exchange(&mut self, unit_id: UnitId, mut pdu: RequestPdu) -> ModbusResult<ResponseData> {
        self.phase = Phase::Encoding;
        if let Some(address) = self.session.faults().take_address_override() {
            override_address(&mut pdu, address);
        }
        let request = Request {
            transaction_id: self.session.next_transaction_id(),
            unit_id,
            pdu,
        };
        let frame = codec::encode_request(&request)?;
        self.logger.log_frame(FrameDirection::Tx, &frame);

        self.phase = Phase::Sending;
        self.session.send(&frame).await?;

        self.phase = Phase::Receiving;
        let reply = self.session.receive().await?;
        self.logger.log_frame(FrameDirection::Rx, &reply);

        self.phase = Phase::Decoding;
        match codec::decode_response(&reply, &request)? {
            Response::Success { data, .. } => Ok(data),
            Response::Exception { function, code } => {
                Err(ProtocolError::device_exception(function.to_u8(), code))
            }
        }
    }
}

/// Substitute a harness-chosen address into the request, for negative
/// testing against a live device.
fn override_address(pdu: &mut RequestPdu, new_address: u16) {
    match pdu {
        RequestPdu::ReadCoils { address, .. }
        | RequestPdu::ReadDiscreteInputs { address, .. }
        | RequestPdu::ReadHoldingRegisters { address, .. }
        | RequestPdu::ReadInputRegisters { address, .. }
        | RequestPdu::WriteSingleCoil { address, .. }
        | RequestPdu::WriteSingleRegister { address, .. }
        | RequestPdu::WriteMultipleCoils { address, .. }
        | RequestPdu::WriteMultipleRegisters { address, .. }
        | RequestPdu::MaskWriteRegister { address, .. }
        | RequestPdu::ReadFifoQueue { address } => *address = new_address,
        RequestPdu::ReadWriteMultipleRegisters { read_address, .. } => *read_address = new_address,
        // No register address to substitute.
        RequestPdu::ReadFileRecord { .. }
        | RequestPdu::WriteFileRecord { .. }
        | RequestPdu::ReadExceptionStatus
        | RequestPdu::GetCommEventCounter
        | RequestPdu::GetCommEventLog
        | RequestPdu::ReportServerId
        | RequestPdu::ReadDeviceIdentification { .. } => {}
    }
}

/// The codec already validated the payload against the request, so a
/// mismatched data kind here is an internal inconsistency, not wire noise.
fn unexpected_data(operation: &str) -> ProtocolError {
    ProtocolError::malformed(format!("{operation}: response data of unexpected kind"))
}

#[async_trait]
impl ModbusDispatch for TcpDispatcher {
    async fn read_coils(
        &mut self,
        unit_id: UnitId,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<bool>> {
        match self
            .execute(unit_id, RequestPdu::ReadCoils { address, quantity })
            .await?
        {
            ResponseData::Bits(bits) => Ok(bits),
            _ => Err(unexpected_data("read_coils")),
        }
    }

    async fn read_discrete_inputs(
        &mut self,
        unit_id: UnitId,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<bool>> {
        match self
            .execute(unit_id, RequestPdu::ReadDiscreteInputs { address, quantity })
            .await?
        {
            ResponseData::Bits(bits) => Ok(bits),
            _ => Err(unexpected_data("read_discrete_inputs")),
        }
    }

    async fn read_holding_registers(
        &mut self,
        unit_id: UnitId,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<u16>> {
        match self
            .execute(unit_id, RequestPdu::ReadHoldingRegisters { address, quantity })
            .await?
        {
            ResponseData::Registers(values) => Ok(values),
            _ => Err(unexpected_data("read_holding_registers")),
        }
    }

    async fn read_input_registers(
        &mut self,
        unit_id: UnitId,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<u16>> {
        match self
            .execute(unit_id, RequestPdu::ReadInputRegisters { address, quantity })
            .await?
        {
            ResponseData::Registers(values) => Ok(values),
            _ => Err(unexpected_data("read_input_registers")),
        }
    }

    async fn write_single_coil(
        &mut self,
        unit_id: UnitId,
        address: u16,
        value: bool,
    ) -> ModbusResult<()> {
        self.execute(unit_id, RequestPdu::WriteSingleCoil { address, value })
            .await
            .map(|_| ())
    }

    async fn write_single_register(
        &mut self,
        unit_id: UnitId,
        address: u16,
        value: u16,
    ) -> ModbusResult<()> {
        self.execute(unit_id, RequestPdu::WriteSingleRegister { address, value })
            .await
            .map(|_| ())
    }

    async fn write_multiple_coils(
        &mut self,
        unit_id: UnitId,
        address: u16,
        values: &[bool],
    ) -> ModbusResult<()> {
        self.execute(
            unit_id,
            RequestPdu::WriteMultipleCoils {
                address,
                values: values.to_vec(),
            },
        )
        .await
        .map(|_| ())
    }

    async fn write_multiple_registers(
        &mut self,
        unit_id: UnitId,
        address: u16,
        values: &[u16],
    ) -> ModbusResult<()> {
        self.execute(
            unit_id,
            RequestPdu::WriteMultipleRegisters {
                address,
                values: values.to_vec(),
            },
        )
        .await
        .map(|_| ())
    }

    async fn read_write_multiple_registers(
        &mut self,
        unit_id: UnitId,
        read_address: u16,
        read_quantity: u16,
        write_address: u16,
        values: &[u16],
    ) -> ModbusResult<Vec<u16>> {
        match self
            .execute(
                unit_id,
                RequestPdu::ReadWriteMultipleRegisters {
                    read_address,
                    read_quantity,
                    write_address,
                    values: values.to_vec(),
                },
            )
            .await?
        {
            ResponseData::Registers(values) => Ok(values),
            _ => Err(unexpected_data("read_write_multiple_registers")),
        }
    }

    async fn mask_write_register(
        &mut self,
        unit_id: UnitId,
        address: u16,
        and_mask: u16,
        or_mask: u16,
    ) -> ModbusResult<()> {
        self.execute(
            unit_id,
            RequestPdu::MaskWriteRegister {
                address,
                and_mask,
                or_mask,
            },
        )
        .await
        .map(|_| ())
    }

    async fn read_fifo_queue(&mut self, unit_id: UnitId, address: u16) -> ModbusResult<Vec<u16>> {
        match self
            .execute(unit_id, RequestPdu::ReadFifoQueue { address })
            .await?
        {
            ResponseData::FifoQueue(values) => Ok(values),
            _ => Err(unexpected_data("read_fifo_queue")),
        }
    }

    async fn read_file_record(
        &mut self,
        unit_id: UnitId,
        subrequests: Vec<FileRecordRef>,
    ) -> ModbusResult<Vec<Vec<u16>>> {
        match self
            .execute(unit_id, RequestPdu::ReadFileRecord { subrequests })
            .await?
        {
            ResponseData::FileRecords(records) => Ok(records),
            _ => Err(unexpected_data("read_file_record")),
        }
    }

    async fn write_file_record(
        &mut self,
        unit_id: UnitId,
        subrequests: Vec<FileRecordWrite>,
    ) -> ModbusResult<()> {
        self.execute(unit_id, RequestPdu::WriteFileRecord { subrequests })
            .await
            .map(|_| ())
    }

    async fn read_exception_status(&mut self, unit_id: UnitId) -> ModbusResult<u8> {
        match self.execute(unit_id, RequestPdu::ReadExceptionStatus).await? {
            ResponseData::ExceptionStatus(status) => Ok(status),
            _ => Err(unexpected_data("read_exception_status")),
        }
    }

    async fn get_comm_event_counter(&mut self, unit_id: UnitId) -> ModbusResult<CommEventCounter> {
        match self.execute(unit_id, RequestPdu::GetCommEventCounter).await? {
            ResponseData::CommEventCounter(counter) => Ok(counter),
            _ => Err(unexpected_data("get_comm_event_counter")),
        }
    }

    async fn get_comm_event_log(&mut self, unit_id: UnitId) -> ModbusResult<CommEventLog> {
        match self.execute(unit_id, RequestPdu::GetCommEventLog).await? {
            ResponseData::CommEventLog(log) => Ok(log),
            _ => Err(unexpected_data("get_comm_event_log")),
        }
    }

    async fn report_server_id(&mut self, unit_id: UnitId) -> ModbusResult<ServerId> {
        match self.execute(unit_id, RequestPdu::ReportServerId).await? {
            ResponseData::ServerId(id) => Ok(id),
            _ => Err(unexpected_data("report_server_id")),
        }
    }

    async fn read_device_identification(
        &mut self,
        unit_id: UnitId,
        code: DeviceIdCode,
        object_id: u8,
    ) -> ModbusResult<DeviceIdentification> {
        match self
            .execute(
                unit_id,
                RequestPdu::ReadDeviceIdentification { code, object_id },
            )
            .await?
        {
            ResponseData::DeviceIdentification(ident) => Ok(ident),
            _ => Err(unexpected_data("read_device_identification")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_override_rewrites_primary_address() {
        let mut pdu = RequestPdu::ReadHoldingRegisters { address: 5, quantity: 1 };
        override_address(&mut pdu, 0xFFFF);
        assert_eq!(pdu, RequestPdu::ReadHoldingRegisters { address: 0xFFFF, quantity: 1 });

        let mut pdu = RequestPdu::ReadWriteMultipleRegisters {
            read_address: 1,
            read_quantity: 1,
            write_address: 2,
            values: vec![7],
        };
        override_address(&mut pdu, 9);
        let RequestPdu::ReadWriteMultipleRegisters { read_address, write_address, .. } = pdu else {
            panic!("variant changed");
        };
        assert_eq!(read_address, 9);
        assert_eq!(write_address, 2);
    }

    #[test]
    fn test_override_skips_addressless_functions() {
        let mut pdu = RequestPdu::ReportServerId;
        override_address(&mut pdu, 0xFFFF);
        assert_eq!(pdu, RequestPdu::ReportServerId);
    }

    #[test]
    fn test_phase_starts_idle() {
        assert_eq!(Phase::default(), Phase::Idle);
    }
}

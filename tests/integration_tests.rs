//! End-to-end tests against a scripted mock device.
//!
//! Each test binds a loopback listener, scripts the device side with raw
//! frame bytes, and drives the dispatcher through its public API. The
//! dispatcher's transaction counter starts at zero, so the first request on
//! a session always carries transaction ID 1, the second ID 2, and the
//! canned responses hard-code those.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_test::assert_ok;

use modbus_probe::utils::init_test_logging;
use modbus_probe::{
    DeviceIdCode, Endpoint, FileRecordRef, ModbusDispatch, ProtocolError, TcpDispatcher,
};

/// Bind a loopback listener and run `script` on the first accepted
/// connection.
async fn spawn_device<F, Fut>(script: F) -> (u16, JoinHandle<()>)
where
    F: FnOnce(TcpStream) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        script(stream).await;
    });
    (port, handle)
}

async fn connect(port: u16) -> TcpDispatcher {
    let endpoint = Endpoint::new("127.0.0.1", port).unwrap();
    TcpDispatcher::connect_with_timeout(endpoint, Duration::from_millis(500))
        .await
        .unwrap()
}

/// Read one complete request ADU from the client side.
async fn read_request(stream: &mut TcpStream) -> Vec<u8> {
    let mut prefix = [0u8; 8];
    stream.read_exact(&mut prefix).await.unwrap();
    let length = u16::from_be_bytes([prefix[4], prefix[5]]) as usize;
    let mut frame = prefix.to_vec();
    frame.resize(6 + length, 0);
    if length > 2 {
        stream.read_exact(&mut frame[8..]).await.unwrap();
    }
    frame
}

#[tokio::test]
async fn test_read_holding_registers_success() {
    init_test_logging();
    let (port, device) = spawn_device(|mut stream| async move {
        let request = read_request(&mut stream).await;
        assert_eq!(
            request,
            vec![0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x00, 0x00, 0x01]
        );
        stream
            .write_all(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x05, 0x01, 0x03, 0x02, 0x00, 0x0A])
            .await
            .unwrap();
    })
    .await;

    let mut dispatcher = connect(port).await;
    let values = assert_ok!(dispatcher.read_holding_registers(1, 0, 1).await);
    assert_eq!(values, vec![10]);
    assert!(dispatcher.is_connected());
    assert_eq!(dispatcher.metrics().operations, 1);
    device.await.unwrap();
}

#[tokio::test]
async fn test_device_exception_is_typed() {
    init_test_logging();
    let (port, device) = spawn_device(|mut stream| async move {
        read_request(&mut stream).await;
        stream
            .write_all(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x03, 0x01, 0x83, 0x02])
            .await
            .unwrap();
    })
    .await;

    let mut dispatcher = connect(port).await;
    let result = dispatcher.read_holding_registers(1, 0x1000, 1).await;
    assert_eq!(
        result,
        Err(ProtocolError::device_exception(0x03, 0x02))
    );
    // A device exception is a protocol-level answer, not desynchronization.
    assert!(dispatcher.is_connected());
    device.await.unwrap();
}

#[tokio::test]
async fn test_out_of_range_quantity_fails_before_io() {
    init_test_logging();
    let (port, device) = spawn_device(|mut stream| async move {
        // Nothing may arrive on the wire for a rejected request.
        let mut byte = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_millis(200), stream.read(&mut byte)).await;
        match read {
            Err(_) => {}          // timed out with nothing received
            Ok(Ok(0)) => {}       // client closed without sending
            other => panic!("unexpected bytes on the wire: {other:?}"),
        }
    })
    .await;

    let mut dispatcher = connect(port).await;
    let result = dispatcher.read_coils(1, 0, 2001).await;
    assert!(matches!(result, Err(ProtocolError::InvalidArgument { .. })));
    dispatcher.disconnect().await;
    device.await.unwrap();
}

#[tokio::test]
async fn test_write_echo_mismatch_forces_disconnect() {
    init_test_logging();
    let (port, device) = spawn_device(|mut stream| async move {
        read_request(&mut stream).await;
        // Echo carries address 6 instead of the requested 5.
        stream
            .write_all(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x06, 0x00, 0x06, 0x00, 0x2A])
            .await
            .unwrap();
    })
    .await;

    let mut dispatcher = connect(port).await;
    let result = dispatcher.write_single_register(1, 5, 42).await;
    assert!(matches!(result, Err(ProtocolError::MalformedFrame { .. })));
    assert!(!dispatcher.is_connected());
    device.await.unwrap();
}

#[tokio::test]
async fn test_transaction_mismatch_forces_disconnect() {
    init_test_logging();
    let (port, device) = spawn_device(|mut stream| async move {
        read_request(&mut stream).await;
        // Response carries transaction ID 9 against request ID 1.
        stream
            .write_all(&[0x00, 0x09, 0x00, 0x00, 0x00, 0x05, 0x01, 0x03, 0x02, 0x00, 0x0A])
            .await
            .unwrap();
    })
    .await;

    let mut dispatcher = connect(port).await;
    let result = dispatcher.read_holding_registers(1, 0, 1).await;
    assert_eq!(
        result,
        Err(ProtocolError::transaction_mismatch(1, 9))
    );
    assert!(!dispatcher.is_connected());

    // Fail-fast once desynchronized.
    let next = dispatcher.read_holding_registers(1, 0, 1).await;
    assert_eq!(next, Err(ProtocolError::NotConnected));
    device.await.unwrap();
}

#[tokio::test]
async fn test_peer_close_midframe_is_connection_lost() {
    init_test_logging();
    let (port, device) = spawn_device(|mut stream| async move {
        read_request(&mut stream).await;
        // Three bytes of an eleven-byte frame, then close.
        stream.write_all(&[0x00, 0x01, 0x00]).await.unwrap();
    })
    .await;

    let mut dispatcher = connect(port).await;
    let result = dispatcher.read_holding_registers(1, 0, 1).await;
    assert!(matches!(result, Err(ProtocolError::ConnectionLost { .. })));
    assert!(!dispatcher.is_connected());
    device.await.unwrap();
}

#[tokio::test]
async fn test_timeout_leaves_session_usable() {
    init_test_logging();
    let (port, device) = spawn_device(|mut stream| async move {
        // Swallow the first request without answering.
        read_request(&mut stream).await;
        // Answer the retry, which carries transaction ID 2.
        let second = read_request(&mut stream).await;
        assert_eq!(&second[..2], &[0x00, 0x02]);
        stream
            .write_all(&[0x00, 0x02, 0x00, 0x00, 0x00, 0x05, 0x01, 0x03, 0x02, 0x00, 0x0A])
            .await
            .unwrap();
    })
    .await;

    let mut dispatcher = connect(port).await;
    let first = dispatcher.read_holding_registers(1, 0, 1).await;
    assert!(matches!(first, Err(ProtocolError::Timeout { .. })));
    assert!(dispatcher.is_connected());

    let second = dispatcher.read_holding_registers(1, 0, 1).await.unwrap();
    assert_eq!(second, vec![10]);
    device.await.unwrap();
}

#[tokio::test]
async fn test_read_coils_bit_unpacking() {
    init_test_logging();
    let (port, device) = spawn_device(|mut stream| async move {
        read_request(&mut stream).await;
        // 10 coils in two packed bytes, LSB first.
        stream
            .write_all(&[
                0x00, 0x01, 0x00, 0x00, 0x00, 0x05, 0x01, 0x01, 0x02, 0b1100_1101, 0b0000_0010,
            ])
            .await
            .unwrap();
    })
    .await;

    let mut dispatcher = connect(port).await;
    let coils = dispatcher.read_coils(1, 0, 10).await.unwrap();
    assert_eq!(
        coils,
        vec![true, false, true, true, false, false, true, true, false, true]
    );
    device.await.unwrap();
}

#[tokio::test]
async fn test_injected_connection_loss() {
    init_test_logging();
    let (port, device) = spawn_device(|mut stream| async move {
        // The client closes without sending anything.
        let mut byte = [0u8; 1];
        assert_eq!(stream.read(&mut byte).await.unwrap(), 0);
    })
    .await;

    let mut dispatcher = connect(port).await;
    dispatcher.faults().simulate_connection_loss();

    let result = dispatcher.read_holding_registers(1, 0, 1).await;
    assert!(matches!(result, Err(ProtocolError::ConnectionLost { .. })));
    assert!(!dispatcher.is_connected());
    device.await.unwrap();
}

#[tokio::test]
async fn test_injected_payload_corruption_reaches_the_wire() {
    init_test_logging();
    let (port, device) = spawn_device(|mut stream| async move {
        let mut frame = [0u8; 12];
        stream.read_exact(&mut frame).await.unwrap();
        // Length field was 6 before corruption.
        assert_eq!(frame[5], 0x07);
    })
    .await;

    let mut dispatcher = connect(port).await;
    dispatcher.faults().force_invalid_payload();

    // The device drops the broken frame without answering.
    let result = dispatcher.read_holding_registers(1, 0, 1).await;
    assert!(matches!(
        result,
        Err(ProtocolError::Timeout { .. }) | Err(ProtocolError::ConnectionLost { .. })
    ));
    device.await.unwrap();
}

#[tokio::test]
async fn test_injected_invalid_address_substitution() {
    init_test_logging();
    let (port, device) = spawn_device(|mut stream| async move {
        let request = read_request(&mut stream).await;
        // The caller asked for address 0; the hook substituted 0xFFFF.
        assert_eq!(&request[8..10], &[0xFF, 0xFF]);
        stream
            .write_all(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x03, 0x01, 0x83, 0x02])
            .await
            .unwrap();
    })
    .await;

    let mut dispatcher = connect(port).await;
    dispatcher.faults().set_invalid_register_address(0xFFFF);

    let result = dispatcher.read_holding_registers(1, 0, 1).await;
    assert_eq!(result, Err(ProtocolError::device_exception(0x03, 0x02)));
    device.await.unwrap();
}

#[tokio::test]
async fn test_concurrent_disconnect_unblocks_receive() {
    init_test_logging();
    let (port, device) = spawn_device(|mut stream| async move {
        // Accept the request, then go silent until the client is gone.
        read_request(&mut stream).await;
        let mut byte = [0u8; 1];
        let _ = stream.read(&mut byte).await;
    })
    .await;

    let endpoint = Endpoint::new("127.0.0.1", port).unwrap();
    let mut dispatcher =
        TcpDispatcher::connect_with_timeout(endpoint, Duration::from_secs(30))
            .await
            .unwrap();

    let handle = dispatcher.disconnect_handle();
    let aborter = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.disconnect();
    });

    let result = dispatcher.read_holding_registers(1, 0, 1).await;
    assert!(matches!(result, Err(ProtocolError::ConnectionLost { .. })));
    assert!(!dispatcher.is_connected());

    aborter.await.unwrap();
    device.await.unwrap();
}

#[tokio::test]
async fn test_diagnostic_and_identification_functions() {
    init_test_logging();
    let (port, device) = spawn_device(|mut stream| async move {
        let request = read_request(&mut stream).await;
        assert_eq!(request[7], 0x11);
        stream
            .write_all(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x11, 0x03, 0x42, 0x19, 0xFF])
            .await
            .unwrap();

        let request = read_request(&mut stream).await;
        assert_eq!(&request[7..], &[0x2B, 0x0E, 0x01, 0x00]);
        stream
            .write_all(&[
                0x00, 0x02, 0x00, 0x00, 0x00, 0x0C, 0x01, 0x2B, 0x0E, 0x01, 0x01, 0x00, 0x00,
                0x01, 0x00, 0x02, b'M', b'1',
            ])
            .await
            .unwrap();
    })
    .await;

    let mut dispatcher = connect(port).await;

    let id = dispatcher.report_server_id(1).await.unwrap();
    assert_eq!(id.server_id, vec![0x42, 0x19]);
    assert!(id.run_indicator);

    let ident = dispatcher
        .read_device_identification(1, DeviceIdCode::Basic, 0x00)
        .await
        .unwrap();
    assert_eq!(ident.objects.len(), 1);
    assert_eq!(ident.objects[0].value, b"M1");
    device.await.unwrap();
}

#[tokio::test]
async fn test_file_record_read() {
    init_test_logging();
    let (port, device) = spawn_device(|mut stream| async move {
        let request = read_request(&mut stream).await;
        assert_eq!(request[7], 0x14);
        stream
            .write_all(&[
                0x00, 0x01, 0x00, 0x00, 0x00, 0x09, 0x01, 0x14, 0x06, 0x05, 0x06, 0x0D, 0xFE,
                0x00, 0x20,
            ])
            .await
            .unwrap();
    })
    .await;

    let mut dispatcher = connect(port).await;
    let records = dispatcher
        .read_file_record(
            1,
            vec![FileRecordRef {
                file_number: 4,
                record_number: 1,
                record_length: 2,
            }],
        )
        .await
        .unwrap();
    assert_eq!(records, vec![vec![0x0DFE, 0x0020]]);
    device.await.unwrap();
}

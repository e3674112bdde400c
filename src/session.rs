//! TCP transport session.
//!
//! Owns the socket exclusively and moves whole frames: the dispatcher hands
//! it encoded bytes and gets back the complete response ADU. One request is
//! in flight at a time; there is no pipelining. Receive is two-phase: the
//! fixed 8-byte MBAP+function prefix first, then the remainder announced by
//! the Length field.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::codec;
use crate::error::{ModbusResult, ProtocolError};
use crate::fault::FaultInjector;
use crate::{DEFAULT_TCP_PORT, DEFAULT_TIMEOUT_MS};

/// Remote device address. Immutable once a session is open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> ModbusResult<Self> {
        if port == 0 {
            return Err(ProtocolError::invalid_argument("port must be 1-65535"));
        }
        Ok(Self {
            host: host.into(),
            port,
        })
    }

    /// Endpoint on the standard Modbus TCP port 502.
    pub fn with_default_port(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_TCP_PORT,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Transport statistics counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct SessionStats {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub errors: u64,
    pub timeouts: u64,
}

impl SessionStats {
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Handle for closing a session from another task.
///
/// Dropping the handle does nothing; calling [`disconnect`](Self::disconnect)
/// marks the session closed and wakes any in-flight receive, which then
/// returns `ConnectionLost`.
#[derive(Debug, Clone, Default)]
pub struct DisconnectHandle {
    closed: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl DisconnectHandle {
    pub fn disconnect(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Modbus TCP session over a single socket.
pub struct TcpSession {
    endpoint: Endpoint,
    stream: Option<TcpStream>,
    timeout: Duration,
    transaction_counter: u16,
    stats: SessionStats,
    faults: Arc<FaultInjector>,
    handle: DisconnectHandle,
}

impl TcpSession {
    /// Connect with the default 5 second timeout.
    pub async fn connect(endpoint: Endpoint) -> ModbusResult<Self> {
        Self::connect_with_timeout(endpoint, Duration::from_millis(DEFAULT_TIMEOUT_MS)).await
    }

    /// Connect to the endpoint, bounding the TCP handshake and every later
    /// send/receive by `timeout`.
    pub async fn connect_with_timeout(endpoint: Endpoint, timeout: Duration) -> ModbusResult<Self> {
        let address = endpoint.to_string();
        debug!("Connecting to Modbus device at {}", address);

        let stream = tokio::time::timeout(timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| ProtocolError::timeout("connect", timeout.as_millis() as u64))?
            .map_err(|e| ProtocolError::connection_lost(format!("connect to {address}: {e}")))?;
        stream
            .set_nodelay(true)
            .map_err(|e| ProtocolError::connection_lost(format!("set_nodelay: {e}")))?;

        debug!("Connected to {}", address);
        Ok(Self {
            endpoint,
            stream: Some(stream),
            timeout,
            transaction_counter: 0,
            stats: SessionStats::default(),
            faults: Arc::new(FaultInjector::new()),
            handle: DisconnectHandle::default(),
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some() && !self.handle.is_closed()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    /// Fault hooks shared with the harness.
    pub fn faults(&self) -> Arc<FaultInjector> {
        Arc::clone(&self.faults)
    }

    /// Handle another task can use to abort an in-flight receive.
    pub fn disconnect_handle(&self) -> DisconnectHandle {
        self.handle.clone()
    }

    /// Next transaction ID: a wrapping 16-bit counter, one per request.
    pub fn next_transaction_id(&mut self) -> u16 {
        self.transaction_counter = self.transaction_counter.wrapping_add(1);
        self.transaction_counter
    }

    /// Write one encoded frame to the socket.
    pub async fn send(&mut self, frame: &[u8]) -> ModbusResult<()> {
        if self.faults.take_connection_loss() {
            self.close_stream().await;
            self.stats.errors += 1;
            return Err(ProtocolError::connection_lost("injected connection loss"));
        }

        let mut bytes = frame.to_vec();
        self.faults.corrupt_frame(&mut bytes);

        let timeout = self.timeout;
        let stream = self.active_stream()?;
        trace!("TX {} bytes: {}", bytes.len(), hex::encode(&bytes));

        let written = tokio::time::timeout(timeout, stream.write_all(&bytes)).await;
        match written {
            Ok(Ok(())) => {
                self.stats.frames_sent += 1;
                self.stats.bytes_sent += bytes.len() as u64;
                Ok(())
            }
            Ok(Err(e)) => {
                self.stats.errors += 1;
                self.close_stream().await;
                Err(ProtocolError::connection_lost(format!("write: {e}")))
            }
            Err(_) => {
                self.stats.timeouts += 1;
                Err(ProtocolError::timeout("send", timeout.as_millis() as u64))
            }
        }
    }

    /// Read one complete response frame.
    ///
    /// Bounded by the session timeout; a timeout leaves the session usable
    /// for a fresh request. A peer close or a concurrent
    /// [`DisconnectHandle::disconnect`] yields `ConnectionLost`.
    pub async fn receive(&mut self) -> ModbusResult<Vec<u8>> {
        if self.faults.take_connection_loss() {
            self.close_stream().await;
            self.stats.errors += 1;
            return Err(ProtocolError::connection_lost("injected connection loss"));
        }

        let timeout = self.timeout;
        let notify = Arc::clone(&self.handle.notify);

        // Arm bodies only produce a value; all session bookkeeping happens
        // after the stream borrow ends.
        enum Outcome {
            Read(ModbusResult<Vec<u8>>),
            TimedOut,
            Aborted,
        }
        let outcome = {
            let stream = self.active_stream()?;
            tokio::select! {
                read = tokio::time::timeout(timeout, read_frame(stream)) => match read {
                    Ok(result) => Outcome::Read(result),
                    Err(_) => Outcome::TimedOut,
                },
                _ = notify.notified() => Outcome::Aborted,
            }
        };

        match outcome {
            Outcome::TimedOut => {
                self.stats.timeouts += 1;
                Err(ProtocolError::timeout("receive", timeout.as_millis() as u64))
            }
            Outcome::Aborted => {
                self.close_stream().await;
                Err(ProtocolError::connection_lost(
                    "session disconnected while receiving",
                ))
            }
            Outcome::Read(Ok(frame)) => {
                trace!("RX {} bytes: {}", frame.len(), hex::encode(&frame));
                self.stats.frames_received += 1;
                self.stats.bytes_received += frame.len() as u64;
                Ok(frame)
            }
            Outcome::Read(Err(e)) => {
                self.stats.errors += 1;
                if matches!(e, ProtocolError::ConnectionLost { .. }) {
                    self.close_stream().await;
                }
                Err(e)
            }
        }
    }

    /// Close the socket. Idempotent; wakes any in-flight receive.
    pub async fn disconnect(&mut self) {
        self.handle.disconnect();
        self.close_stream().await;
        debug!("Disconnected from {}", self.endpoint);
    }

    fn active_stream(&mut self) -> ModbusResult<&mut TcpStream> {
        if self.handle.is_closed() {
            self.stream = None;
        }
        self.stream.as_mut().ok_or(ProtocolError::NotConnected)
    }

    async fn close_stream(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
    }
}

impl fmt::Debug for TcpSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpSession")
            .field("endpoint", &self.endpoint)
            .field("connected", &self.is_connected())
            .field("timeout", &self.timeout)
            .field("transaction_counter", &self.transaction_counter)
            .finish()
    }
}

/// Two-phase frame read: the fixed MBAP+function prefix, then the remainder
/// the Length field announces.
async fn read_frame(stream: &mut TcpStream) -> ModbusResult<Vec<u8>> {
    let mut prefix = [0u8; codec::RESPONSE_PREFIX_SIZE];
    stream
        .read_exact(&mut prefix)
        .await
        .map_err(map_read_error)?;

    let remaining = codec::remaining_from_prefix(&prefix)?;
    let mut frame = vec![0u8; codec::RESPONSE_PREFIX_SIZE + remaining];
    frame[..codec::RESPONSE_PREFIX_SIZE].copy_from_slice(&prefix);
    if remaining > 0 {
        stream
            .read_exact(&mut frame[codec::RESPONSE_PREFIX_SIZE..])
            .await
            .map_err(map_read_error)?;
    }
    Ok(frame)
}

fn map_read_error(e: std::io::Error) -> ProtocolError {
    // read_exact reports a mid-frame close as UnexpectedEof.
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        ProtocolError::connection_lost("peer closed the connection mid-frame")
    } else {
        ProtocolError::from(e)
    }
}

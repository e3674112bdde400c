//! Structured operation logging.
//!
//! The dispatcher emits one event per completed operation through an
//! injected sink, so a harness can collect them without touching a global
//! logger. [`CallbackLogger::console`] is the ready-made stderr sink.

use std::fmt;
use std::sync::Arc;

use chrono::Local;

/// Severity of a logged event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warning,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Trace => "TRACE",
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warning => "WARN",
            Self::Error => "ERROR",
        };
        write!(f, "{name}")
    }
}

/// Sink invoked once per event with the level and a formatted message.
pub type LogCallback = dyn Fn(LogLevel, &str) + Send + Sync;

/// Logger that forwards events above a threshold to a callback.
#[derive(Clone)]
pub struct CallbackLogger {
    min_level: LogLevel,
    callback: Arc<LogCallback>,
}

impl CallbackLogger {
    pub fn new(min_level: LogLevel, callback: Arc<LogCallback>) -> Self {
        Self {
            min_level,
            callback,
        }
    }

    /// Timestamped stderr sink, for interactive runs.
    pub fn console(min_level: LogLevel) -> Self {
        Self::new(
            min_level,
            Arc::new(|level, message| {
                eprintln!(
                    "[{}] [{level}] {message}",
                    Local::now().format("%Y-%m-%d %H:%M:%S%.3f")
                );
            }),
        )
    }

    /// Sink that drops everything.
    pub fn disabled() -> Self {
        Self::new(LogLevel::Error, Arc::new(|_, _| {}))
    }

    pub fn log(&self, level: LogLevel, message: &str) {
        if level >= self.min_level {
            (self.callback)(level, message);
        }
    }

    /// One event per completed operation: Info on success, Warning on a
    /// device exception, Error on a transport or protocol failure.
    pub fn log_operation(&self, description: &str, outcome: &OperationOutcome, elapsed_ms: u64) {
        match outcome {
            OperationOutcome::Success => self.log(
                LogLevel::Info,
                &format!("{description} succeeded in {elapsed_ms}ms"),
            ),
            OperationOutcome::DeviceException(detail) => self.log(
                LogLevel::Warning,
                &format!("{description} rejected by device in {elapsed_ms}ms: {detail}"),
            ),
            OperationOutcome::Failure(detail) => self.log(
                LogLevel::Error,
                &format!("{description} failed in {elapsed_ms}ms: {detail}"),
            ),
        }
    }

    pub fn log_frame(&self, direction: FrameDirection, frame: &[u8]) {
        self.log(
            LogLevel::Trace,
            &format!(
                "{} {} bytes: {}",
                direction,
                frame.len(),
                hex::encode(frame)
            ),
        );
    }
}

impl fmt::Debug for CallbackLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackLogger")
            .field("min_level", &self.min_level)
            .finish()
    }
}

/// How an operation ended, for the per-operation event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationOutcome {
    Success,
    DeviceException(String),
    Failure(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDirection {
    Tx,
    Rx,
}

impl fmt::Display for FrameDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tx => write!(f, "TX"),
            Self::Rx => write!(f, "RX"),
        }
    }
}

//! Timing and diagnostics helpers.

use std::fmt;
use std::time::Instant;

/// Measures one operation from construction to [`finish`](Self::finish).
#[derive(Debug)]
pub struct OperationTimer {
    operation: String,
    start: Instant,
}

impl OperationTimer {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            start: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    pub fn finish(self) -> u64 {
        let elapsed = self.elapsed_ms();
        log::debug!("{} completed in {}ms", self.operation, elapsed);
        elapsed
    }
}

/// Aggregate latency counters across operations.
#[derive(Debug, Clone, Copy, Default)]
pub struct PerformanceMetrics {
    pub operations: u64,
    pub failures: u64,
    pub total_ms: u64,
    pub min_ms: u64,
    pub max_ms: u64,
}

impl PerformanceMetrics {
    pub fn record(&mut self, elapsed_ms: u64, success: bool) {
        if self.operations == 0 || elapsed_ms < self.min_ms {
            self.min_ms = elapsed_ms;
        }
        if elapsed_ms > self.max_ms {
            self.max_ms = elapsed_ms;
        }
        self.operations += 1;
        self.total_ms += elapsed_ms;
        if !success {
            self.failures += 1;
        }
    }

    pub fn average_ms(&self) -> f64 {
        if self.operations == 0 {
            0.0
        } else {
            self.total_ms as f64 / self.operations as f64
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.operations == 0 {
            100.0
        } else {
            (self.operations - self.failures) as f64 * 100.0 / self.operations as f64
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

impl fmt::Display for PerformanceMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ops, {:.1}% ok, avg {:.1}ms, min {}ms, max {}ms",
            self.operations,
            self.success_rate(),
            self.average_ms(),
            self.min_ms,
            self.max_ms
        )
    }
}

/// Route `log` and `tracing` output to the test harness. Safe to call from
/// every test; repeat initialization is ignored.
pub fn init_test_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

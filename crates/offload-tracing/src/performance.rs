//! Timing helpers for host/device operations.
//!
//! Every helper emits a `debug` event with a fixed message name, so a log
//! consumer can filter on `host_to_device`, `kernel_dispatch` and so on
//! without parsing free text.
//!
//! ```rust
//! use offload_tracing::performance::{record_transfer, PerformanceSpan, TransferDirection};
//!
//! let span = PerformanceSpan::new("build_program", Some(100));
//! drop(span); // logged only when it took at least 100us
//!
//! record_transfer(16_384, TransferDirection::HostToDevice, 42);
//! ```

use std::fmt;
use std::time::Instant;
use tracing::Level;

/// Times the enclosing scope and logs the duration on drop.
///
/// With a threshold, scopes faster than `threshold_us` stay silent.
pub struct PerformanceSpan {
    threshold_us: Option<u64>,
    start: Instant,
    span: tracing::Span,
}

impl PerformanceSpan {
    /// Start timing at `debug` level.
    pub fn new(name: impl AsRef<str>, threshold_us: Option<u64>) -> Self {
        Self::with_level(Level::DEBUG, name, threshold_us)
    }

    /// Start timing with the span created at `level`.
    pub fn with_level(level: Level, name: impl AsRef<str>, threshold_us: Option<u64>) -> Self {
        let name = name.as_ref();
        let span = match level {
            Level::TRACE => tracing::trace_span!("perf", name = %name),
            Level::DEBUG => tracing::debug_span!("perf", name = %name),
            Level::INFO => tracing::info_span!("perf", name = %name),
            Level::WARN => tracing::warn_span!("perf", name = %name),
            Level::ERROR => tracing::error_span!("perf", name = %name),
        };
        Self {
            threshold_us,
            start: Instant::now(),
            span,
        }
    }

    /// Microseconds since the span started.
    pub fn elapsed_us(&self) -> u64 {
        self.start.elapsed().as_micros() as u64
    }
}

impl Drop for PerformanceSpan {
    fn drop(&mut self) {
        let elapsed_us = self.elapsed_us();
        let over_threshold = match self.threshold_us {
            Some(threshold) => elapsed_us >= threshold,
            None => true,
        };
        if over_threshold {
            let _entered = self.span.enter();
            tracing::debug!(
                duration_us = elapsed_us,
                duration_ms = elapsed_us as f64 / 1000.0,
                "performance_span_complete"
            );
        }
    }
}

/// Direction of a buffer copy between host and device memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    HostToDevice,
    DeviceToHost,
}

impl TransferDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            TransferDirection::HostToDevice => "H2D",
            TransferDirection::DeviceToHost => "D2H",
        }
    }
}

impl fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Megabytes per second for `bytes` moved in `duration_us`; zero when the
/// duration rounds to nothing.
pub fn bandwidth_mbps(bytes: usize, duration_us: u64) -> f64 {
    if duration_us == 0 {
        return 0.0;
    }
    (bytes as f64 / (1024.0 * 1024.0)) / (duration_us as f64 / 1_000_000.0)
}

/// Log a completed host/device copy with its bandwidth.
pub fn record_transfer(bytes: usize, direction: TransferDirection, duration_us: u64) {
    tracing::debug!(
        bytes,
        direction = direction.as_str(),
        duration_us,
        bandwidth_mbps = bandwidth_mbps(bytes, duration_us),
        "buffer_transfer"
    );
}

/// Log a device allocation.
pub fn record_allocation(bytes: usize, access: &str, duration_us: u64) {
    tracing::debug!(bytes, access, duration_us, "device_allocation");
}

/// Log a kernel launch with its total work-item count.
pub fn record_dispatch(kernel: &str, work_items: usize, duration_us: u64) {
    let items_per_sec = if duration_us > 0 {
        work_items as f64 / (duration_us as f64 / 1_000_000.0)
    } else {
        0.0
    };
    tracing::debug!(kernel, work_items, duration_us, items_per_sec, "kernel_dispatch");
}

//! Timing macros built on [`crate::performance`].

/// Start a [`PerformanceSpan`](crate::performance::PerformanceSpan) that logs
/// its duration when the returned guard is dropped.
///
/// ```rust
/// use offload_tracing::perf_span;
///
/// let _span = perf_span!("enqueue_write", bytes = 4096);
/// ```
#[macro_export]
macro_rules! perf_span {
    ($name:expr) => {{
        $crate::performance::PerformanceSpan::new($name, None)
    }};
    ($name:expr, $($field:ident = $value:expr),+ $(,)?) => {{
        $crate::__tracing::debug!(operation = $name, $($field = $value),+, "perf_span_start");
        $crate::performance::PerformanceSpan::new($name, None)
    }};
}

/// Like [`perf_span!`] but silent when the scope finishes under
/// `threshold_us` microseconds.
#[macro_export]
macro_rules! perf_span_threshold {
    ($name:expr, $threshold_us:expr) => {{
        $crate::performance::PerformanceSpan::new($name, Some($threshold_us))
    }};
}

/// Evaluate a block and return `(value, duration_us)`, logging the duration.
///
/// ```rust
/// use offload_tracing::timed_block;
///
/// let (sum, _us) = timed_block!("sum", { (1..=4).sum::<i32>() });
/// assert_eq!(sum, 10);
/// ```
#[macro_export]
macro_rules! timed_block {
    ($name:expr, $block:block) => {{
        let start = ::std::time::Instant::now();
        let result = $block;
        let duration_us = start.elapsed().as_micros() as u64;
        $crate::__tracing::debug!(operation = $name, duration_us, "timed_block_complete");
        (result, duration_us)
    }};
}

/*!
 * Tracing
 * Structured tracing for scheduler operations using the tracing crate
 *
 * Features:
 * - Compact or JSON-formatted output
 * - Timed spans around periodic scheduler work, with slow-path warnings
 */

use std::time::Instant;
use tracing::{debug, info, span, warn, Level, Span};
use tracing_subscriber::{fmt::format::FmtSpan, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Operations slower than this are reported at warn level
const SLOW_OPERATION_US: u128 = 1_000;

/// Initialize structured tracing
///
/// Environment variables:
/// - RUST_LOG: Set log level (default: info)
/// - SCHED_TRACE_JSON: Enable JSON output (default: false)
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let use_json = std::env::var("SCHED_TRACE_JSON")
        .map(|v| v == "1" || v == "true")
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(env_filter);

    if use_json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_span_events(FmtSpan::CLOSE),
            )
            .init();
        info!("Structured tracing initialized with JSON output");
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_span_events(FmtSpan::CLOSE)
                    .compact(),
            )
            .init();
        info!("Structured tracing initialized");
    }
}

/// Timed span for one pass of scheduler work (a tick, a simulation round)
pub struct OperationSpan {
    span: Span,
    start: Instant,
    operation: &'static str,
}

impl OperationSpan {
    pub fn new(operation: &'static str, tick: u32) -> Self {
        let span = span!(
            Level::DEBUG,
            "sched_op",
            operation = operation,
            tick = tick,
            duration_us = tracing::field::Empty,
            items_processed = tracing::field::Empty,
        );

        Self {
            span,
            start: Instant::now(),
            operation,
        }
    }

    /// Record how many threads, queues or events the pass touched
    pub fn record_items_processed(&self, count: usize) {
        self.span.record("items_processed", count);
    }

    pub fn enter(&self) -> tracing::span::Entered<'_> {
        self.span.enter()
    }
}

impl Drop for OperationSpan {
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        let _entered = self.span.enter();
        self.span.record("duration_us", duration.as_micros() as u64);

        if duration.as_micros() > SLOW_OPERATION_US {
            warn!(
                operation = self.operation,
                duration_us = duration.as_micros() as u64,
                slow = true,
                "slow scheduler operation"
            );
        } else {
            debug!(
                operation = self.operation,
                duration_us = duration.as_micros() as u64,
                "scheduler operation completed"
            );
        }
    }
}

/// Helper to create an operation span
#[inline]
pub fn span_operation(name: &'static str, tick: u32) -> OperationSpan {
    OperationSpan::new(name, tick)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_without_subscriber() {
        let span = span_operation("test", 7);
        span.record_items_processed(3);
        let _entered = span.enter();
    }
}

//! Structured logging setup and span helpers
//!
//! Every cluster and job state transition is logged as one event carrying
//! machine-readable fields, under the spans created here.

use tracing::Span;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

const DEFAULT_FILTER: &str = "cloudharness_core=debug,cloudharness=info";

/// Initialize tracing with environment-based configuration.
///
/// `RUST_LOG` wins; otherwise `level` applies to the harness crates. Safe to
/// call more than once (later calls are no-ops).
pub fn init_tracing(level: Option<&str>) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| match level {
        Some(level) => EnvFilter::new(format!(
            "cloudharness_core={level},cloudharness={level}"
        )),
        None => EnvFilter::new(DEFAULT_FILTER),
    });

    let fmt_layer = fmt::layer().with_target(true).with_line_number(true);

    let _ = Registry::default().with(env_filter).with(fmt_layer).try_init();
}

/// Span for cluster lifecycle operations
#[inline]
pub fn cluster_span(operation: &str, expected_size: usize) -> Span {
    tracing::info_span!(
        "cluster",
        operation = %operation,
        expected_size = expected_size,
        state = tracing::field::Empty,
    )
}

/// Span for a request against one node
#[inline]
pub fn node_span(operation: &str, address: &str) -> Span {
    tracing::debug_span!(
        "node",
        operation = %operation,
        address = %address,
        status = tracing::field::Empty,
    )
}

/// Span for waiting on an asynchronous job
#[inline]
pub fn job_span(kind: &str, handle: &str) -> Span {
    tracing::info_span!(
        "job",
        kind = %kind,
        handle = %handle,
        status = tracing::field::Empty,
    )
}

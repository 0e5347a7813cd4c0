//! Tracing setup and metric events.
//!
//! ## Metrics Emitted
//!
//! Metric events are plain `tracing` events on the
//! `neighborhood_kernel::metrics` target, aggregated from logs:
//!
//! - `crawl_tick_metric` - requests processed per crawl tick
//! - `crawl_outcome_metric` - one per finalized crawl
//! - `flush_metric` - index buffer flush results
//! - `sweep_metric` - ephemeral rows removed by the expiration sweep
//! - `ranking_metric` - candidates and latency per ranking request

use tracing::info;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::index::FlushReport;
use crate::types::GroupId;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Structured JSON, one object per line.
    #[default]
    Json,
    /// Human-readable, for local development.
    Pretty,
}

impl LogFormat {
    /// Read `LOG_FORMAT` ("json" or "pretty"; default json).
    pub fn from_env() -> Self {
        match std::env::var("LOG_FORMAT").as_deref() {
            Ok("pretty") => Self::Pretty,
            _ => Self::Json,
        }
    }
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` overrides the default filter. Returns an error if a global
/// subscriber is already set.
pub fn init_tracing(format: LogFormat) -> Result<(), tracing_subscriber::util::TryInitError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "neighborhood_kernel=info,tower_http=info,sqlx=warn".into());

    match format {
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_span_events(FmtSpan::CLOSE))
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_current_span(true)
                    .with_span_events(FmtSpan::CLOSE)
                    .flatten_event(true),
            )
            .try_init(),
    }
}

/// Record one crawl tick.
pub fn record_crawl_tick(group: GroupId, processed: usize, folded: usize, errored: usize, latency_ms: u64) {
    info!(
        target: "neighborhood_kernel::metrics",
        metric_type = "crawl_tick",
        group = %group,
        processed = processed,
        folded = folded,
        errored = errored,
        latency_ms = latency_ms,
        "crawl_tick_metric"
    );
}

/// Record a finalized crawl.
pub fn record_crawl_outcome(group: GroupId, success: bool, close: usize, far: usize, errors: usize, duration_secs: i64) {
    let status = if success { "success" } else { "failure" };
    info!(
        target: "neighborhood_kernel::metrics",
        metric_type = "crawl_outcome",
        group = %group,
        status = status,
        close = close,
        far = far,
        errors = errors,
        duration_secs = duration_secs,
        "crawl_outcome_metric"
    );
}

/// Record one buffer flush pass.
pub fn record_flush(table: &str, report: &FlushReport) {
    info!(
        target: "neighborhood_kernel::metrics",
        metric_type = "flush",
        table = table,
        flushed = report.flushed,
        failed = report.failed,
        raced = report.raced,
        "flush_metric"
    );
}

/// Record an expiration sweep.
pub fn record_sweep(removed: u64) {
    info!(
        target: "neighborhood_kernel::metrics",
        metric_type = "sweep",
        removed = removed,
        "sweep_metric"
    );
}

/// Record a ranking request.
pub fn record_ranking(group: GroupId, buckets: usize, candidates: usize, returned: usize, latency_ms: u64) {
    info!(
        target: "neighborhood_kernel::metrics",
        metric_type = "ranking",
        group = %group,
        buckets = buckets,
        candidates = candidates,
        returned = returned,
        latency_ms = latency_ms,
        "ranking_metric"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_from_env() {
        std::env::set_var("LOG_FORMAT", "pretty");
        assert_eq!(LogFormat::from_env(), LogFormat::Pretty);
        std::env::set_var("LOG_FORMAT", "anything");
        assert_eq!(LogFormat::from_env(), LogFormat::Json);
        std::env::remove_var("LOG_FORMAT");
    }

    #[test]
    fn test_init_tracing_installs_once() {
        assert!(init_tracing(LogFormat::Json).is_ok());
        record_sweep(3);
        assert!(init_tracing(LogFormat::Pretty).is_err());
    }
}

//! Request metrics middleware.
//!
//! ## Metrics Exposed
//!
//! - `request` events on `neighborhood_kernel::metrics`: path pattern,
//!   method, status and latency per request
//! - `admin_delete` events for administrative deletes

use axum::{extract::Request, middleware::Next, response::Response};
use regex_lite::Regex;
use std::sync::OnceLock;
use std::time::Instant;
use tracing::info;

/// Metrics middleware that records request counts and latency.
///
/// Uses tracing events so counts can be aggregated from logs.
pub async fn metrics_middleware(request: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().clone();
    let path = normalize_path(request.uri().path());

    let response = next.run(request).await;

    let latency = start.elapsed();
    let status = response.status().as_u16();

    info!(
        target: "neighborhood_kernel::metrics",
        metric_type = "request",
        path = %path,
        method = %method,
        status = status,
        latency_ms = latency.as_millis() as u64,
        "request_metric"
    );

    response
}

/// Normalize path for metrics to avoid high cardinality.
///
/// Numeric path segments (group ids) become `:id`.
fn normalize_path(path: &str) -> String {
    static GROUP_ID: OnceLock<Regex> = OnceLock::new();
    let group_id = GROUP_ID.get_or_init(|| Regex::new(r"/[0-9]+(/|$)").expect("static group id pattern"));

    group_id.replace_all(path, "/:id$1").to_string()
}

/// Record an administrative delete.
pub fn record_admin_delete(prefix: &str, deleted: u64) {
    info!(
        target: "neighborhood_kernel::metrics",
        metric_type = "admin_delete",
        prefix = prefix,
        deleted = deleted,
        "admin_delete_metric"
    );
}

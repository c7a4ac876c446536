// ============================================================================
// Prometheus Metrics - Gateway Observability
// ============================================================================
//
// HTTP-level metrics (duration, counts, active connections) plus the
// gateway-specific counters: auth failures by reason, quota consumer
// throughput, quota denials, upstream dispatch outcomes per provider,
// billing settlement outcomes, pricing fallbacks and tool executions.
//
// Scraped from `GET /metrics` in text exposition format.
//
// ============================================================================

use axum::{
    extract::Request,
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_histogram_vec, Counter,
    CounterVec, Encoder, Gauge, HistogramVec, TextEncoder,
};
use std::time::Instant;

lazy_static! {
    pub static ref HTTP_REQUEST_DURATION: HistogramVec = register_histogram_vec!(
        "prism_http_request_duration_seconds",
        "HTTP request latency in seconds",
        &["method", "path", "status"],
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0]
    )
    .unwrap();
    pub static ref HTTP_REQUESTS_TOTAL: CounterVec = register_counter_vec!(
        "prism_http_requests_total",
        "Total number of HTTP requests",
        &["method", "path", "status"]
    )
    .unwrap();
    pub static ref HTTP_CONNECTIONS_ACTIVE: Gauge = register_gauge!(
        "prism_http_connections_active",
        "Number of in-flight HTTP requests"
    )
    .unwrap();
    pub static ref AUTH_FAILURES_TOTAL: CounterVec = register_counter_vec!(
        "prism_auth_failures_total",
        "Authentication failures by reason",
        &["reason"]
    )
    .unwrap();
    pub static ref QUOTA_EVENTS_PUBLISHED: Counter = register_counter!(
        "prism_quota_events_published_total",
        "Consume events published to the quota pipeline"
    )
    .unwrap();
    pub static ref QUOTA_EVENTS_PROCESSED: Counter = register_counter!(
        "prism_quota_events_processed_total",
        "Consume events committed to the store"
    )
    .unwrap();
    pub static ref QUOTA_EVENTS_DROPPED: Counter = register_counter!(
        "prism_quota_events_dropped_total",
        "Consume events dropped after retry exhaustion"
    )
    .unwrap();
    pub static ref QUOTA_BATCHES_FLUSHED: Counter = register_counter!(
        "prism_quota_batches_flushed_total",
        "Batches flushed by the quota consumer pool"
    )
    .unwrap();
    pub static ref QUOTA_DENIALS: CounterVec = register_counter_vec!(
        "prism_quota_denials_total",
        "Admission denials by quota type",
        &["quota_type"]
    )
    .unwrap();
    pub static ref UPSTREAM_DISPATCHES: CounterVec = register_counter_vec!(
        "prism_upstream_dispatches_total",
        "Upstream dispatch attempts by provider and outcome",
        &["provider", "outcome"]
    )
    .unwrap();
    pub static ref BILLING_SETTLEMENTS: CounterVec = register_counter_vec!(
        "prism_billing_settlements_total",
        "Billing settlement outcomes",
        &["outcome"]
    )
    .unwrap();
    pub static ref PRICING_FALLBACKS: CounterVec = register_counter_vec!(
        "prism_pricing_fallbacks_total",
        "Cost calculations that substituted the default price",
        &["pricing_type"]
    )
    .unwrap();
    pub static ref TOOL_EXECUTIONS: CounterVec = register_counter_vec!(
        "prism_tool_executions_total",
        "Tool-mediator executions by tool",
        &["tool"]
    )
    .unwrap();
}

/// Collapse IDs out of paths so label cardinality stays bounded.
/// `/v1/models/gpt-4` stays as-is; UUIDs and numeric segments become `:id`.
fn normalize_path(path: &str) -> String {
    let mut normalized = Vec::new();
    for segment in path.split('/') {
        if segment.is_empty() {
            continue;
        }
        if (segment.len() == 36 && segment.matches('-').count() == 4)
            || segment.parse::<i64>().is_ok()
        {
            normalized.push(":id");
        } else {
            normalized.push(segment);
        }
    }
    format!("/{}", normalized.join("/"))
}

pub async fn metrics_middleware(request: Request, next: Next) -> Response {
    HTTP_CONNECTIONS_ACTIVE.inc();

    let start = Instant::now();
    let method = request.method().clone();
    let path = normalize_path(request.uri().path());

    let response = next.run(request).await;

    let duration = start.elapsed();
    let status = response.status().as_u16().to_string();

    HTTP_REQUEST_DURATION
        .with_label_values(&[method.as_str(), &path, &status])
        .observe(duration.as_secs_f64());
    HTTP_REQUESTS_TOTAL
        .with_label_values(&[method.as_str(), &path, &status])
        .inc();
    HTTP_CONNECTIONS_ACTIVE.dec();

    response
}

pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = vec![];

    match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => (
            StatusCode::OK,
            [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            buffer,
        ),
        Err(e) => {
            tracing::error!("failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
                format!("failed to encode metrics: {e}").into_bytes(),
            )
        }
    }
}

/// Call whenever credential validation fails.
pub fn record_auth_failure(reason: &str) {
    AUTH_FAILURES_TOTAL.with_label_values(&[reason]).inc();
    tracing::warn!(target: "security", reason = %reason, "authentication failure");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn metrics_endpoint_renders() {
        record_auth_failure("test_reason");
        let response = metrics_handler().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn normalize_path_collapses_ids() {
        assert_eq!(
            normalize_path("/v1/keys/550e8400-e29b-41d4-a716-446655440000"),
            "/v1/keys/:id"
        );
        assert_eq!(normalize_path("/v1/keys/12345"), "/v1/keys/:id");
        assert_eq!(normalize_path("/v1/chat/completions"), "/v1/chat/completions");
        assert_eq!(normalize_path("/v1/models/gpt-4"), "/v1/models/gpt-4");
    }
}

use std::net::SocketAddr;

use metrics_exporter_prometheus::BuildError;

use crate::wire::Request;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: wire requests handled. Labels: op, outcome.
pub const REQUESTS_TOTAL: &str = "horizon_requests_total";

/// Histogram: wire request latency in seconds. Labels: op.
pub const REQUEST_DURATION_SECONDS: &str = "horizon_request_duration_seconds";

/// Counter: reservation mutations. Labels: queue, op, outcome.
pub const RESERVATIONS_TOTAL: &str = "horizon_reservations_total";

/// Histogram: time from call to commit or rejection, in seconds. Labels: op.
pub const ADMISSION_DURATION_SECONDS: &str = "horizon_admission_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: plans currently loaded.
pub const PLANS_ACTIVE: &str = "horizon_plans_active";

/// Gauge: live reservations. Labels: queue.
pub const RESERVATIONS_ACTIVE: &str = "horizon_reservations_active";

/// Counter: reservations archived after their end. Labels: queue.
pub const RESERVATIONS_EXPIRED_TOTAL: &str = "horizon_reservations_expired_total";

/// Histogram: duration of one plan follower step in seconds.
pub const FOLLOWER_STEP_DURATION_SECONDS: &str = "horizon_follower_step_duration_seconds";

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "horizon_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "horizon_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "horizon_connections_rejected_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a wire request to a short label for metrics.
pub fn request_label(request: &Request) -> &'static str {
    match request {
        Request::Submit { .. } => "submit",
        Request::Update { .. } => "update",
        Request::Delete { .. } => "delete",
        Request::Get { .. } => "get",
        Request::Allocation { .. } => "allocation",
        Request::Active { .. } => "active",
        Request::Plans => "plans",
        Request::Listen { .. } => "listen",
        Request::Unlisten { .. } => "unlisten",
    }
}

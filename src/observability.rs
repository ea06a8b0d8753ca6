use std::net::SocketAddr;
use std::time::Instant;

use crate::engine::EngineError;
use crate::wire::Request;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: wire requests handled. Labels: command, status.
pub const REQUESTS_TOTAL: &str = "reservd_requests_total";

/// Histogram: wire request latency in seconds. Labels: command.
pub const REQUEST_DURATION_SECONDS: &str = "reservd_request_duration_seconds";

/// Counter: admission decisions. Labels: operation, outcome.
pub const ADMISSIONS_TOTAL: &str = "reservd_admissions_total";

/// Histogram: time from request to decision in seconds. Labels: operation.
pub const ADMISSION_DURATION_SECONDS: &str = "reservd_admission_duration_seconds";

/// Counter: retries after a concurrent conflict. Labels: operation.
pub const CONFLICT_RETRIES_TOTAL: &str = "reservd_conflict_retries_total";

/// Counter: registry calls that failed or timed out.
pub const REGISTRY_FAILURES_TOTAL: &str = "reservd_registry_failures_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "reservd_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "reservd_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "reservd_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "reservd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "reservd_wal_flush_batch_size";

/// Counter: WAL compactions. Labels: status.
pub const WAL_COMPACTIONS_TOTAL: &str = "reservd_wal_compactions_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// `accepted`, or the error kind that rejected the request.
pub fn outcome_label<T>(result: &Result<T, EngineError>) -> &'static str {
    match result {
        Ok(_) => "accepted",
        Err(e) => e.kind().as_str(),
    }
}

pub fn record_admission<T>(operation: &'static str, started: Instant, result: &Result<T, EngineError>) {
    metrics::counter!(ADMISSIONS_TOTAL, "operation" => operation, "outcome" => outcome_label(result))
        .increment(1);
    metrics::histogram!(ADMISSION_DURATION_SECONDS, "operation" => operation)
        .record(started.elapsed().as_secs_f64());
}

/// Map a request to a short label for metrics.
pub fn command_label(req: &Request) -> &'static str {
    match req {
        Request::Create { .. } => "create",
        Request::Update { .. } => "update",
        Request::Delete { .. } => "delete",
        Request::Get { .. } => "get",
        Request::Query { .. } => "query",
        Request::Count { .. } => "count",
        Request::CheckAvailability { .. } => "check_availability",
        Request::AvailableUnits { .. } => "available_units",
        Request::Attach { .. } => "attach",
        Request::Detach { .. } => "detach",
        Request::Attachments { .. } => "attachments",
        Request::Ping => "ping",
    }
}

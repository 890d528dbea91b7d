use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: booking commits attempted. Labels: outcome.
pub const COMMITS_TOTAL: &str = "shears_commits_total";

/// Counter: conflicts returned to callers (commit + advisory checks).
pub const CONFLICTS_TOTAL: &str = "shears_conflicts_total";

/// Counter: state transitions applied. Labels: to.
pub const TRANSITIONS_TOTAL: &str = "shears_transitions_total";

/// Histogram: commit latency in seconds.
pub const COMMIT_DURATION_SECONDS: &str = "shears_commit_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: staff members with engine state loaded.
pub const STAFF_ACTIVE: &str = "shears_staff_active";

/// Histogram: journal group-commit flush duration in seconds.
pub const JOURNAL_FLUSH_DURATION_SECONDS: &str = "shears_journal_flush_duration_seconds";

/// Histogram: journal group-commit batch size (events per flush).
pub const JOURNAL_FLUSH_BATCH_SIZE: &str = "shears_journal_flush_batch_size";

/// Install the Prometheus metrics exporter on the given port for host
/// processes that want one. No-op if `port` is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}

use std::net::SocketAddr;

use metrics_exporter_prometheus::BuildError;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "leavebook_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "leavebook_query_duration_seconds";

/// Counter: approval attempts. Labels: outcome
/// (approved, overlapping, insufficient_balance, invalid_transition).
pub const APPROVALS_TOTAL: &str = "leavebook_approvals_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "leavebook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "leavebook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "leavebook_connections_rejected_total";

/// Histogram: WAL append (write + fsync) duration in seconds.
pub const WAL_APPEND_DURATION_SECONDS: &str = "leavebook_wal_append_duration_seconds";

/// Counter: WAL compactions performed.
pub const WAL_COMPACTIONS_TOTAL: &str = "leavebook_wal_compactions_total";

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

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::UpsertMember { .. } => "upsert_member",
        Command::DeleteMember { .. } => "delete_member",
        Command::InsertRequest { .. } => "insert_request",
        Command::ApproveRequest { .. } => "approve_request",
        Command::RejectRequest { .. } => "reject_request",
        Command::DeleteRequest { .. } => "delete_request",
        Command::InsertHoliday { .. } => "insert_holiday",
        Command::DeleteHoliday { .. } => "delete_holiday",
        Command::Batch(_) => "batch",
        Command::SelectMembers { .. } => "select_members",
        Command::SelectRequests { .. } => "select_requests",
        Command::SelectHolidays => "select_holidays",
        Command::SelectSummary => "select_summary",
        Command::SelectOverlaps => "select_overlaps",
        Command::SelectCalendar { .. } => "select_calendar",
        Command::SelectCalendarFeed { .. } => "select_calendar_feed",
    }
}

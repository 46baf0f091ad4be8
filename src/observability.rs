use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "courtside_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "courtside_query_duration_seconds";

/// Counter: registrations admitted. Labels: kind (USER/GUEST), state (CONFIRMED/WAITLISTED).
pub const REGISTRATIONS_TOTAL: &str = "courtside_registrations_total";

/// Counter: waitlisted registrations promoted into a court.
pub const PROMOTIONS_TOTAL: &str = "courtside_promotions_total";

/// Counter: commands rejected as Busy because the event lock was not acquired in time.
pub const LOCK_TIMEOUTS_TOTAL: &str = "courtside_lock_timeouts_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "courtside_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "courtside_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "courtside_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "courtside_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "courtside_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (commits per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "courtside_wal_flush_batch_size";

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

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertEvent { .. } => "insert_event",
        Command::UpdateEventStatus { .. } => "update_event_status",
        Command::InsertCourt { .. } => "insert_court",
        Command::UpdateCourt { .. } => "update_court",
        Command::DeleteCourt { .. } => "delete_court",
        Command::InsertCaptain { .. } => "insert_captain",
        Command::DeleteCaptain { .. } => "delete_captain",
        Command::InsertRegistration { .. } => "insert_registration",
        Command::InsertGuest { .. } => "insert_guest",
        Command::MoveRegistration { .. } => "move_registration",
        Command::DeleteRegistration { .. } => "delete_registration",
        Command::SelectEvents { .. } => "select_events",
        Command::SelectCourts { .. } => "select_courts",
        Command::SelectPlayers { .. } => "select_players",
        Command::SelectWaitlist { .. } => "select_waitlist",
        Command::SelectRegistration { .. } => "select_registration",
        Command::Listen { .. } => "listen",
        Command::Unlisten { .. } => "unlisten",
        Command::UnlistenAll => "unlisten_all",
    }
}

use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "slotbook_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "slotbook_query_duration_seconds";

// ── Booking outcomes ────────────────────────────────────────────

/// Counter: authoritative checks that found at least one conflict.
pub const CONFLICTS_DETECTED_TOTAL: &str = "slotbook_conflicts_detected_total";

/// Counter: conflict overrides recorded in the audit log. Labels: operation.
pub const OVERRIDES_TOTAL: &str = "slotbook_overrides_total";

/// Counter: reservations. Labels: outcome (linked, status_only, slot_failed, rejected).
pub const RESERVATIONS_TOTAL: &str = "slotbook_reservations_total";

/// Counter: per-student lesson creations that failed inside a reservation.
pub const RESERVATION_STUDENT_FAILURES_TOTAL: &str = "slotbook_reservation_student_failures_total";

/// Counter: slots that failed to reopen after a cancellation.
pub const REOPEN_FAILURES_TOTAL: &str = "slotbook_reopen_failures_total";

/// Counter: notifications that could not be delivered.
pub const NOTIFY_FAILURES_TOTAL: &str = "slotbook_notify_failures_total";

/// Counter: notifications dropped because the outbound queue was full.
pub const NOTIFY_DROPPED_TOTAL: &str = "slotbook_notify_dropped_total";

// ── Cache ───────────────────────────────────────────────────────

/// Counter: cache lookups. Labels: cache, result (fresh, stale, miss).
pub const CACHE_LOOKUPS_TOTAL: &str = "slotbook_cache_lookups_total";

/// Counter: upstream fetches actually issued. Labels: cache.
pub const CACHE_FETCHES_TOTAL: &str = "slotbook_cache_fetches_total";

/// Counter: callers that joined an in-flight fetch. Labels: cache.
pub const CACHE_COALESCED_TOTAL: &str = "slotbook_cache_coalesced_total";

/// Counter: writes the durable tier rejected. Labels: cache.
pub const CACHE_DURABLE_FAILURES_TOTAL: &str = "slotbook_cache_durable_failures_total";

/// Counter: entries evicted from the durable tier to make room.
pub const CACHE_EVICTIONS_TOTAL: &str = "slotbook_cache_evictions_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "slotbook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "slotbook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotbook_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotbook_wal_flush_batch_size";

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
        Command::InsertStudent { .. } => "insert_student",
        Command::InsertSlot { .. } => "insert_slot",
        Command::UpdateSlot { .. } => "update_slot",
        Command::InsertLesson { .. } => "insert_lesson",
        Command::UpdateLesson { .. } => "update_lesson",
        Command::InsertReservation { .. } => "insert_reservation",
        Command::SelectStudents { .. } => "select_students",
        Command::SelectSlots { .. } => "select_slots",
        Command::SelectLessons { .. } => "select_lessons",
        Command::SelectAvailableSlots { .. } => "select_available_slots",
        Command::SelectConflicts { .. } => "select_conflicts",
        Command::SelectOverrides { .. } => "select_overrides",
    }
}

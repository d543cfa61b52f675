use std::net::SocketAddr;

use crate::sql::{BookingQuery, Command};

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "tablebook_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "tablebook_query_duration_seconds";

// ── Booking lifecycle ───────────────────────────────────────────

pub const BOOKINGS_CREATED_TOTAL: &str = "tablebook_bookings_created_total";
pub const BOOKINGS_UPDATED_TOTAL: &str = "tablebook_bookings_updated_total";
pub const BOOKINGS_CANCELLED_TOTAL: &str = "tablebook_bookings_cancelled_total";
pub const BOOKINGS_DELETED_TOTAL: &str = "tablebook_bookings_deleted_total";

/// Counter: create/update attempts rejected for overlapping a confirmed booking.
pub const BOOKING_CONFLICTS_TOTAL: &str = "tablebook_booking_conflicts_total";

/// Counter: failed notification sends. Labels: channel.
pub const NOTIFICATION_FAILURES_TOTAL: &str = "tablebook_notification_failures_total";

/// Counter: bookings purged by the cleanup job.
pub const CLEANUP_DELETED_TOTAL: &str = "tablebook_cleanup_deleted_total";

pub const REMINDERS_SENT_TOTAL: &str = "tablebook_reminders_sent_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "tablebook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "tablebook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "tablebook_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "tablebook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "tablebook_wal_flush_batch_size";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus exporter on {addr}: {e}"),
    }
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertTable { .. } => "insert_table",
        Command::UpdateTable { .. } => "update_table",
        Command::DeleteTable { .. } => "delete_table",
        Command::SelectTables { .. } => "select_tables",
        Command::InsertBooking { .. } => "insert_booking",
        Command::UpdateBooking { changes, .. } if changes.is_status_only() => "cancel_booking",
        Command::UpdateBooking { .. } => "update_booking",
        Command::DeleteBooking { .. } => "delete_booking",
        Command::SelectBookings { query: BookingQuery::Today } => "select_today_bookings",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectAvailableTables { .. } => "select_available_tables",
        Command::SelectBookingStats { .. } => "select_booking_stats",
        Command::SelectTopTables { .. } => "select_top_tables",
        Command::SelectCancelledCount { .. } => "select_cancelled_count",
    }
}

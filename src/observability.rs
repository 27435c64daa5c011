use std::net::SocketAddr;

use crate::engine::EngineError;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: engine operations. Labels: op, outcome.
pub const OPERATIONS_TOTAL: &str = "courtside_operations_total";

/// Histogram: operation latency in seconds. Labels: op.
pub const OPERATION_DURATION_SECONDS: &str = "courtside_operation_duration_seconds";

/// Counter: booking attempts that lost the race for a slot.
pub const SLOT_CONFLICTS_TOTAL: &str = "courtside_slot_conflicts_total";

// ── Lifecycle ───────────────────────────────────────────────────

/// Counter: Pending reservations cancelled by their expiry timer.
pub const PENDING_EXPIRED_TOTAL: &str = "courtside_pending_expired_total";

/// Counter: reservations completed by the sweep.
pub const COMPLETIONS_TOTAL: &str = "courtside_completions_total";

/// Gauge: armed Pending expiry timers.
pub const PENDING_TIMERS_ACTIVE: &str = "courtside_pending_timers_active";

/// Counter: tier upgrades announced.
pub const TIER_UPGRADES_TOTAL: &str = "courtside_tier_upgrades_total";

/// Counter: loyalty reversals clamped at zero.
pub const LOYALTY_CLAMPS_TOTAL: &str = "courtside_loyalty_clamps_total";

// ── USE metrics (storage) ───────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "courtside_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "courtside_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short outcome label for an operation result.
pub fn outcome_label<T>(result: &Result<T, EngineError>) -> &'static str {
    match result {
        Ok(_) => "ok",
        Err(EngineError::InvalidRange(_)) => "invalid_range",
        Err(EngineError::SlotConflict(_)) => "slot_conflict",
        Err(EngineError::CoachUnavailable { .. }) => "coach_unavailable",
        Err(EngineError::InvalidTransition { .. }) => "invalid_transition",
        Err(EngineError::CancellationWindowClosed { .. }) => "cancellation_window_closed",
        Err(EngineError::CapacityExceeded(_)) => "capacity_exceeded",
        Err(EngineError::NotFound(_)) => "not_found",
        Err(EngineError::StartInPast { .. }) => "start_in_past",
        Err(EngineError::LightingUnavailable(_)) => "lighting_unavailable",
        Err(EngineError::LimitExceeded(_)) => "limit_exceeded",
        Err(EngineError::Storage(_)) => "storage",
    }
}

/// Record count + latency for one engine operation.
pub fn record_operation<T>(op: &'static str, started: std::time::Instant, result: &Result<T, EngineError>) {
    metrics::counter!(OPERATIONS_TOTAL, "op" => op, "outcome" => outcome_label(result)).increment(1);
    metrics::histogram!(OPERATION_DURATION_SECONDS, "op" => op).record(started.elapsed().as_secs_f64());
}

use crate::model::Ms;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// A single reservation may not exceed one day.
pub const MAX_RESERVATION_DURATION_MS: Ms = 24 * 3_600_000;
/// Availability queries are capped at 31 days.
pub const MAX_QUERY_WINDOW_MS: Ms = 31 * 24 * 3_600_000;

pub const MAX_EXTRAS_PER_RESERVATION: usize = 16;
pub const MAX_NOTES_LEN: usize = 1024;
pub const MAX_SLOTS_PER_COURT: usize = 100_000;

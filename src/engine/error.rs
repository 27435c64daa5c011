use ulid::Ulid;

use crate::model::{InvalidRange, Ms, ReservationStatus};
use crate::repository::StoreError;

#[derive(Debug)]
pub enum EngineError {
    InvalidRange(InvalidRange),
    /// Lost the race for a court-time slot; carries the conflicting slot's token.
    SlotConflict(Ulid),
    /// The coach is already booked by the carried reservation for an overlapping range.
    CoachUnavailable {
        coach_id: Ulid,
        reservation: Ulid,
    },
    InvalidTransition {
        id: Ulid,
        from: ReservationStatus,
        action: &'static str,
    },
    CancellationWindowClosed {
        id: Ulid,
        deadline: Ms,
    },
    CapacityExceeded(u32),
    NotFound(Ulid),
    StartInPast {
        start: Ms,
        now: Ms,
    },
    LightingUnavailable(&'static str),
    LimitExceeded(&'static str),
    Storage(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidRange(e) => write!(f, "{e}"),
            EngineError::SlotConflict(id) => write!(f, "slot conflicts with reservation: {id}"),
            EngineError::CoachUnavailable { coach_id, reservation } => {
                write!(f, "coach {coach_id} already booked by reservation {reservation}")
            }
            EngineError::InvalidTransition { id, from, action } => {
                write!(f, "cannot {action} reservation {id} in state {from}")
            }
            EngineError::CancellationWindowClosed { id, deadline } => {
                write!(f, "cancellation window for {id} closed at {deadline}")
            }
            EngineError::CapacityExceeded(limit) => {
                write!(f, "capacity exceeded: at most {limit} active reservations")
            }
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::StartInPast { start, now } => {
                write!(f, "start {start} is in the past (now {now})")
            }
            EngineError::LightingUnavailable(msg) => write!(f, "lighting unavailable: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Storage(e) => write!(f, "storage error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<InvalidRange> for EngineError {
    fn from(e: InvalidRange) -> Self {
        EngineError::InvalidRange(e)
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        EngineError::Storage(e.to_string())
    }
}

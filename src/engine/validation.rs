use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn validate_range(range: &TimeRange) -> Result<(), EngineError> {
    if range.start() < MIN_VALID_TIMESTAMP_MS || range.end() > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if range.duration_ms() > MAX_RESERVATION_DURATION_MS {
        return Err(EngineError::LimitExceeded("reservation too long"));
    }
    Ok(())
}

pub(crate) fn validate_window(window: &TimeRange) -> Result<(), EngineError> {
    if window.start() < MIN_VALID_TIMESTAMP_MS || window.end() > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if window.duration_ms() > MAX_QUERY_WINDOW_MS {
        return Err(EngineError::LimitExceeded("query window too wide"));
    }
    Ok(())
}

pub(crate) fn validate_notes(notes: Option<&str>) -> Result<(), EngineError> {
    if let Some(n) = notes
        && n.len() > MAX_NOTES_LEN
    {
        return Err(EngineError::LimitExceeded("notes too long"));
    }
    Ok(())
}

/// Drop repeated ids, keeping first-seen order.
pub(crate) fn dedupe_extras(ids: Vec<Ulid>) -> Result<Vec<Ulid>, EngineError> {
    let mut out: Vec<Ulid> = Vec::with_capacity(ids.len());
    for id in ids {
        if !out.contains(&id) {
            out.push(id);
        }
    }
    if out.len() > MAX_EXTRAS_PER_RESERVATION {
        return Err(EngineError::LimitExceeded("too many extras"));
    }
    Ok(out)
}

/// UTC hour of day `ms` falls in.
pub(crate) fn hour_of_day(ms: Ms) -> u32 {
    (ms.rem_euclid(24 * HOUR_MS) / HOUR_MS) as u32
}

/// Lighting extras need a lit court and a start at or after `lighting_start_hour`.
pub(crate) fn check_lighting(
    court: &Court,
    extras: &[Extra],
    range: &TimeRange,
    lighting_start_hour: u32,
) -> Result<(), EngineError> {
    if !extras.iter().any(|e| e.requires_lighting) {
        return Ok(());
    }
    if !court.has_lighting {
        return Err(EngineError::LightingUnavailable("court has no lighting"));
    }
    if hour_of_day(range.start()) < lighting_start_hour {
        return Err(EngineError::LightingUnavailable("lighting starts later in the day"));
    }
    Ok(())
}

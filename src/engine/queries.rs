use std::time::Instant;

use ulid::Ulid;

use crate::model::*;
use crate::observability::record_operation;

use super::validation::validate_window;
use super::{EngineError, ReservationEngine};

impl ReservationEngine {
    pub async fn get_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        self.load(id).await
    }

    /// All of a user's reservations, any status, ordered by start.
    pub async fn user_reservations(&self, user_id: Ulid) -> Result<Vec<Reservation>, EngineError> {
        Ok(self.repo.user_reservations(user_id).await?)
    }

    /// Free/busy partition of `window` for one court. Pending, Confirmed and Completed
    /// reservations count as busy.
    pub async fn get_availability(
        &self,
        court_id: Ulid,
        window: TimeRange,
    ) -> Result<Vec<AvailabilitySlot>, EngineError> {
        let started = Instant::now();
        let result = self.availability_inner(court_id, window).await;
        record_operation("get_availability", started, &result);
        result
    }

    async fn availability_inner(
        &self,
        court_id: Ulid,
        window: TimeRange,
    ) -> Result<Vec<AvailabilitySlot>, EngineError> {
        validate_window(&window)?;
        self.load_court(court_id).await?;
        Ok(self.index.free_busy(court_id, &window).await)
    }

    /// Free/busy partition of `window` for one coach, across every court.
    pub async fn get_coach_availability(
        &self,
        coach_id: Ulid,
        window: TimeRange,
    ) -> Result<Vec<AvailabilitySlot>, EngineError> {
        let started = Instant::now();
        let result = match validate_window(&window) {
            Ok(()) => Ok(self.index.free_busy(coach_id, &window).await),
            Err(e) => Err(e),
        };
        record_operation("get_coach_availability", started, &result);
        result
    }

    pub async fn loyalty_account(&self, user_id: Ulid) -> LoyaltyAccount {
        self.ledger.account(user_id).await
    }
}

use std::time::Instant;

use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::config::PaymentMode;
use crate::limits::MAX_SLOTS_PER_COURT;
use crate::model::*;
use crate::notify::Notification;
use crate::observability::{record_operation, COMPLETIONS_TOTAL, PENDING_EXPIRED_TOTAL};

use super::validation::{check_lighting, dedupe_extras, validate_notes, validate_range};
use super::{BookingRequest, EngineError, ModifyRequest, Placement, ReservationEngine, SlotToken};

impl ReservationEngine {
    /// Book a court, and a coach when one is requested. The slot checks, the persist
    /// and the index insert all happen under the court and coach locks; if the
    /// persist fails the index is left untouched.
    pub async fn create(&self, request: BookingRequest) -> Result<Reservation, EngineError> {
        let started = Instant::now();
        let result = self.create_inner(request).await;
        record_operation("create", started, &result);
        result
    }

    async fn create_inner(&self, request: BookingRequest) -> Result<Reservation, EngineError> {
        let BookingRequest {
            user_id,
            court_id,
            coach_id,
            range,
            extras,
            notes,
        } = request;
        let now = self.clock.now_ms();

        validate_range(&range)?;
        validate_notes(notes.as_deref())?;
        if range.start() < now {
            return Err(EngineError::StartInPast { start: range.start(), now });
        }
        let extra_ids = dedupe_extras(extras)?;
        let court = self.load_court(court_id).await?;
        let extras = self.load_extras(&extra_ids).await?;
        check_lighting(&court, &extras, &range, self.config.lighting_start_hour)?;
        self.check_capacity(user_id, now).await?;
        let price = self.quote(user_id, &court, &range, &extras).await;

        let (status, pending_expires_at) = match self.config.payment {
            PaymentMode::Immediate => (ReservationStatus::Confirmed, None),
            PaymentMode::Deferred { hold_ms } => (ReservationStatus::Pending, Some(now + hold_ms)),
        };
        let reservation = Reservation {
            id: Ulid::new(),
            court_id,
            coach_id,
            user_id,
            range,
            extras: extra_ids,
            status,
            price,
            notes,
            created_at: now,
            modified_at: now,
            pending_expires_at,
        };

        let placement = Placement::of(&reservation);
        let token = SlotToken(reservation.id);
        let mut held = self.lock_placements(&[&placement]).await;
        self.check_free(&held, token, &placement)?;
        if held.len(&court_id) >= MAX_SLOTS_PER_COURT {
            return Err(EngineError::LimitExceeded("too many reservations on court"));
        }
        self.repo.persist_reservation(&reservation).await?;
        held.insert(&placement.resources(), token, range);
        drop(held);

        match pending_expires_at {
            None => self.announce_confirmed(&reservation),
            Some(at) => self.timers.arm(reservation.id, at - now),
        }
        info!(
            "created {} reservation {} on court {court_id} {range} for {user_id}, total {}",
            reservation.status, reservation.id, reservation.price.total
        );
        Ok(reservation)
    }

    async fn check_capacity(&self, user_id: Ulid, now: Ms) -> Result<(), EngineError> {
        let Some(limit) = self.config.max_active_per_user else {
            return Ok(());
        };
        let active = self
            .repo
            .user_reservations(user_id)
            .await?
            .iter()
            .filter(|r| {
                matches!(r.status, ReservationStatus::Pending | ReservationStatus::Confirmed)
                    && r.range.end() > now
            })
            .count();
        if active >= limit as usize {
            return Err(EngineError::CapacityExceeded(limit));
        }
        Ok(())
    }

    /// Pending → Confirmed. Confirming twice returns the record unchanged.
    pub async fn confirm(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let started = Instant::now();
        let result = self.confirm_inner(id).await;
        record_operation("confirm", started, &result);
        result
    }

    async fn confirm_inner(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let _record = self.lock_record(id).await;
        let mut reservation = self.load(id).await?;
        match reservation.status {
            ReservationStatus::Confirmed => return Ok(reservation),
            ReservationStatus::Pending => {}
            from => {
                return Err(EngineError::InvalidTransition { id, from, action: "confirm" });
            }
        }

        reservation.status = ReservationStatus::Confirmed;
        reservation.pending_expires_at = None;
        reservation.modified_at = self.clock.now_ms();
        self.repo.persist_reservation(&reservation).await?;
        self.timers.disarm(&id);
        self.announce_confirmed(&reservation);
        info!("confirmed reservation {id}");
        Ok(reservation)
    }

    /// Target of the Pending expiry timer. Returns `None` when the reservation is
    /// gone or no longer Pending, so redundant fires do nothing.
    pub async fn expire_pending(&self, id: Ulid) -> Result<Option<Reservation>, EngineError> {
        let started = Instant::now();
        let result = self.expire_pending_inner(id).await;
        record_operation("expire_pending", started, &result);
        result
    }

    async fn expire_pending_inner(&self, id: Ulid) -> Result<Option<Reservation>, EngineError> {
        let _record = self.lock_record(id).await;
        let Some(reservation) = self.repo.load_reservation(id).await? else {
            return Ok(None);
        };
        if reservation.status != ReservationStatus::Pending {
            return Ok(None);
        }
        let cancelled = self.cancel_locked(reservation).await?;
        metrics::counter!(PENDING_EXPIRED_TOTAL).increment(1);
        Ok(Some(cancelled))
    }

    /// Change the court, range, extras or notes of a Confirmed reservation. The price
    /// is recomputed from scratch. A move swaps the slots under the locks of every
    /// court and coach involved; other changes never touch the index.
    pub async fn modify(&self, id: Ulid, request: ModifyRequest) -> Result<Reservation, EngineError> {
        let started = Instant::now();
        let result = self.modify_inner(id, request).await;
        record_operation("modify", started, &result);
        result
    }

    async fn modify_inner(&self, id: Ulid, request: ModifyRequest) -> Result<Reservation, EngineError> {
        let _record = self.lock_record(id).await;
        let current = self.load(id).await?;
        if current.status != ReservationStatus::Confirmed {
            return Err(EngineError::InvalidTransition {
                id,
                from: current.status,
                action: "modify",
            });
        }

        let now = self.clock.now_ms();
        validate_notes(request.notes.as_deref())?;
        let court_id = request.court_id.unwrap_or(current.court_id);
        let range = request.range.unwrap_or(current.range);
        let court_changed = court_id != current.court_id;
        let moved = court_changed || range != current.range;
        if moved {
            validate_range(&range)?;
            if range.start() < now {
                return Err(EngineError::StartInPast { start: range.start(), now });
            }
        }
        let extra_ids = match request.extras {
            Some(ids) => dedupe_extras(ids)?,
            None => current.extras.clone(),
        };
        let court = self.load_court(court_id).await?;
        let extras = self.load_extras(&extra_ids).await?;
        check_lighting(&court, &extras, &range, self.config.lighting_start_hour)?;
        let price = self.quote(current.user_id, &court, &range, &extras).await;

        let next = Reservation {
            court_id,
            range,
            extras: extra_ids,
            price,
            notes: request.notes.or_else(|| current.notes.clone()),
            modified_at: now,
            ..current.clone()
        };

        if moved {
            let from = Placement::of(&current);
            let to = Placement::of(&next);
            let token = SlotToken(id);
            let mut held = self.lock_placements(&[&from, &to]).await;
            self.check_free(&held, token, &to)?;
            if court_changed && held.len(&court_id) >= MAX_SLOTS_PER_COURT {
                return Err(EngineError::LimitExceeded("too many reservations on court"));
            }
            self.repo.persist_reservation(&next).await?;
            held.remove(&from.resources(), token);
            held.insert(&to.resources(), token, range);
        } else {
            self.repo.persist_reservation(&next).await?;
        }

        info!(
            "modified reservation {id}: court {} {} -> court {court_id} {range}, total {} -> {}",
            current.court_id, current.range, current.price.total, next.price.total
        );
        Ok(next)
    }

    /// Cancel a Pending or Confirmed reservation before its cancellation deadline.
    /// Cancelling an already-cancelled reservation returns it unchanged.
    pub async fn cancel(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let started = Instant::now();
        let result = self.cancel_inner(id).await;
        record_operation("cancel", started, &result);
        result
    }

    async fn cancel_inner(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let _record = self.lock_record(id).await;
        let reservation = self.load(id).await?;
        match reservation.status {
            ReservationStatus::Cancelled => {
                // Finishes a reversal that failed after the status was persisted.
                self.ledger
                    .on_reservation_cancelled(reservation.user_id, id)
                    .await?;
                debug!("reservation {id} already cancelled");
                return Ok(reservation);
            }
            ReservationStatus::Completed => {
                return Err(EngineError::InvalidTransition {
                    id,
                    from: ReservationStatus::Completed,
                    action: "cancel",
                });
            }
            ReservationStatus::Pending | ReservationStatus::Confirmed => {}
        }

        let deadline = reservation.range.start() - self.config.cancellation_cutoff_ms;
        if self.clock.now_ms() >= deadline {
            return Err(EngineError::CancellationWindowClosed { id, deadline });
        }
        self.cancel_locked(reservation).await
    }

    /// Caller holds the record lock and has checked the transition is legal.
    async fn cancel_locked(&self, reservation: Reservation) -> Result<Reservation, EngineError> {
        let id = reservation.id;
        let next = Reservation {
            status: ReservationStatus::Cancelled,
            pending_expires_at: None,
            modified_at: self.clock.now_ms(),
            ..reservation
        };

        self.repo.persist_reservation(&next).await?;
        for resource in Placement::of(&next).resources() {
            self.index.release(resource, SlotToken(id)).await;
        }

        self.timers.disarm(&id);
        self.forget_record(&id);
        self.ledger.on_reservation_cancelled(next.user_id, id).await?;
        self.notify.send(Notification::ReservationCancelled {
            reservation_id: id,
            user_id: next.user_id,
            court_id: next.court_id,
        });
        info!("cancelled reservation {id} on court {} {}", next.court_id, next.range);
        Ok(next)
    }

    /// Confirmed → Completed once the range has ended; awards loyalty points.
    /// The slot stays booked.
    pub async fn complete(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let started = Instant::now();
        let result = self.complete_inner(id).await;
        record_operation("complete", started, &result);
        result
    }

    async fn complete_inner(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let _record = self.lock_record(id).await;
        let reservation = self.load(id).await?;
        match reservation.status {
            // Points were awarded before the status was written.
            ReservationStatus::Completed => return Ok(reservation),
            ReservationStatus::Confirmed => {}
            from => {
                return Err(EngineError::InvalidTransition { id, from, action: "complete" });
            }
        }

        let now = self.clock.now_ms();
        if now < reservation.range.end() {
            return Err(EngineError::InvalidTransition {
                id,
                from: reservation.status,
                action: "complete before end",
            });
        }

        // Award before the status write. The award is idempotent per reservation.
        self.ledger
            .on_reservation_completed(reservation.user_id, id, reservation.price.total)
            .await?;
        let next = Reservation {
            status: ReservationStatus::Completed,
            modified_at: now,
            ..reservation
        };
        self.repo.persist_reservation(&next).await?;
        self.ledger.settle(next.user_id, id).await;
        self.forget_record(&id);
        self.notify.send(Notification::ReservationCompleted {
            reservation_id: id,
            user_id: next.user_id,
        });
        info!("completed reservation {id}");
        Ok(next)
    }

    /// Complete every Confirmed reservation whose range has ended. Returns how many
    /// were completed; one that fails is logged and left for the next sweep.
    pub async fn complete_due(&self) -> Result<usize, EngineError> {
        let now = self.clock.now_ms();
        let due: Vec<Ulid> = self
            .repo
            .active_reservations()
            .await?
            .into_iter()
            .filter(|r| r.status == ReservationStatus::Confirmed && r.range.end() <= now)
            .map(|r| r.id)
            .collect();

        let mut completed = 0;
        for id in due {
            match self.complete(id).await {
                Ok(_) => completed += 1,
                // Cancelled between the scan and the record lock.
                Err(EngineError::InvalidTransition { .. }) => {}
                Err(e) => warn!("completion of {id} failed, retrying next sweep: {e}"),
            }
        }
        metrics::counter!(COMPLETIONS_TOTAL).increment(completed as u64);
        Ok(completed)
    }

    /// Administrative loyalty correction; negative deltas clamp the balance at 0.
    pub async fn adjust_loyalty(&self, user_id: Ulid, delta: i64) -> Result<LoyaltyAccount, EngineError> {
        let started = Instant::now();
        let result = self.ledger.adjust(user_id, delta).await.map_err(EngineError::from);
        record_operation("adjust_loyalty", started, &result);
        if let Ok(account) = &result {
            info!("adjusted loyalty of {user_id} by {delta}: balance {}", account.balance);
        }
        result
    }
}

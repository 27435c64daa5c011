mod availability;
mod error;
mod mutations;
mod queries;
mod validation;

pub use availability::{
    merge_overlapping, subtract_intervals, AvailabilityIndex, BookedSlot, CourtSlots, HeldSlots,
    SlotToken,
};
pub use error::EngineError;

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{info, warn};
use ulid::Ulid;

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::loyalty::{LoyaltyLedger, TierTable};
use crate::model::*;
use crate::notify::{Notification, NotifyHub};
use crate::observability::SLOT_CONFLICTS_TOTAL;
use crate::pricing::{DiscountTable, PricingCalculator};
use crate::repository::Repository;
use crate::scheduler::{self, PendingTimers};

/// A booking attempt by one user for one court, optionally with a coach.
#[derive(Debug, Clone)]
pub struct BookingRequest {
    pub user_id: Ulid,
    pub court_id: Ulid,
    pub coach_id: Option<Ulid>,
    pub range: TimeRange,
    pub extras: Vec<Ulid>,
    pub notes: Option<String>,
}

/// Fields left `None` keep their current value.
#[derive(Debug, Clone, Default)]
pub struct ModifyRequest {
    /// Move to another court; availability is checked there and the price uses its rate.
    pub court_id: Option<Ulid>,
    pub range: Option<TimeRange>,
    pub extras: Option<Vec<Ulid>>,
    pub notes: Option<String>,
}

/// The resources a reservation occupies and for how long.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Placement {
    court_id: Ulid,
    coach_id: Option<Ulid>,
    range: TimeRange,
}

impl Placement {
    fn of(r: &Reservation) -> Self {
        Self {
            court_id: r.court_id,
            coach_id: r.coach_id,
            range: r.range,
        }
    }

    fn resources(&self) -> Vec<Ulid> {
        let mut ids = vec![self.court_id];
        ids.extend(self.coach_id);
        ids
    }
}

pub struct ReservationEngine {
    repo: Arc<dyn Repository>,
    index: AvailabilityIndex,
    pricing: PricingCalculator,
    discounts: DiscountTable,
    ledger: LoyaltyLedger,
    notify: Arc<NotifyHub>,
    clock: Arc<dyn Clock>,
    timers: PendingTimers,
    /// Serializes lifecycle transitions of one reservation. Taken before the court lock.
    record_locks: DashMap<Ulid, Arc<Mutex<()>>>,
    config: EngineConfig,
}

impl ReservationEngine {
    /// Build an engine over `repo`, rebuild the availability index and loyalty
    /// balances from persisted state, and re-arm expiry for Pending reservations.
    pub async fn start(
        repo: Arc<dyn Repository>,
        notify: Arc<NotifyHub>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Result<Arc<Self>, EngineError> {
        let (timers, expired_rx) = PendingTimers::new();
        let ledger = LoyaltyLedger::new(
            repo.clone(),
            notify.clone(),
            TierTable::new(config.tier_thresholds.clone()),
            config.points_per_currency_unit,
        );
        let engine = Arc::new(Self {
            repo,
            index: AvailabilityIndex::new(),
            pricing: PricingCalculator::new(config.billable_unit_ms),
            discounts: DiscountTable::new(config.discounts.clone()),
            ledger,
            notify,
            clock,
            timers,
            record_locks: DashMap::new(),
            config,
        });

        engine.ledger.restore(engine.repo.loyalty_accounts().await?);
        engine.rebuild().await?;
        tokio::spawn(scheduler::run_expiry_loop(Arc::downgrade(&engine), expired_rx));
        Ok(engine)
    }

    /// Load every slot-holding reservation into the index.
    async fn rebuild(&self) -> Result<(), EngineError> {
        let now = self.clock.now_ms();
        let active = self.repo.active_reservations().await?;
        let mut pending = 0usize;
        for r in &active {
            let placement = Placement::of(r);
            let token = SlotToken(r.id);
            let mut held = self.lock_placements(&[&placement]).await;
            if let Some((resource, existing)) = held.conflict(&placement.resources(), &r.range, Some(token)) {
                warn!(
                    "rebuild: reservation {} overlaps {} on {resource}; not indexed",
                    r.id, existing.0
                );
                continue;
            }
            held.insert(&placement.resources(), token, r.range);
            drop(held);

            match r.status {
                ReservationStatus::Pending => {
                    let expires_at = r.pending_expires_at.unwrap_or(now);
                    self.timers.arm(r.id, expires_at - now);
                    pending += 1;
                }
                ReservationStatus::Completed => self.ledger.settle(r.user_id, r.id).await,
                _ => {}
            }
        }
        info!("rebuilt availability from {} reservations ({pending} pending)", active.len());
        Ok(())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn index(&self) -> &AvailabilityIndex {
        &self.index
    }

    pub fn ledger(&self) -> &LoyaltyLedger {
        &self.ledger
    }

    pub fn pricing(&self) -> &PricingCalculator {
        &self.pricing
    }

    pub fn pending_timers(&self) -> usize {
        self.timers.armed()
    }

    pub fn is_expiry_armed(&self, id: &Ulid) -> bool {
        self.timers.is_armed(id)
    }

    /// Lock every resource of `placements` at once.
    async fn lock_placements(&self, placements: &[&Placement]) -> HeldSlots {
        let resources: Vec<Ulid> = placements.iter().flat_map(|p| p.resources()).collect();
        self.index.lock_all(&resources).await
    }

    /// `to` must be free on all its resources, apart from `token`'s own slots.
    fn check_free(&self, held: &HeldSlots, token: SlotToken, to: &Placement) -> Result<(), EngineError> {
        let Some((resource, existing)) = held.conflict(&to.resources(), &to.range, Some(token)) else {
            return Ok(());
        };
        metrics::counter!(SLOT_CONFLICTS_TOTAL).increment(1);
        if resource == to.court_id {
            Err(EngineError::SlotConflict(existing.0))
        } else {
            Err(EngineError::CoachUnavailable {
                coach_id: resource,
                reservation: existing.0,
            })
        }
    }

    async fn lock_record(&self, id: Ulid) -> OwnedMutexGuard<()> {
        let lock = self.record_locks.entry(id).or_default().value().clone();
        lock.lock_owned().await
    }

    /// Drop the record lock of a reservation that reached a terminal state.
    fn forget_record(&self, id: &Ulid) {
        self.record_locks.remove(id);
    }

    async fn load(&self, id: Ulid) -> Result<Reservation, EngineError> {
        self.repo
            .load_reservation(id)
            .await?
            .ok_or(EngineError::NotFound(id))
    }

    async fn load_court(&self, id: Ulid) -> Result<Court, EngineError> {
        self.repo.load_court(id).await?.ok_or(EngineError::NotFound(id))
    }

    /// Extras for `ids`, in the same order. Any unknown id is `NotFound`.
    async fn load_extras(&self, ids: &[Ulid]) -> Result<Vec<Extra>, EngineError> {
        let extras = self.repo.load_extras(ids).await?;
        if extras.len() != ids.len()
            && let Some(missing) = ids.iter().find(|id| !extras.iter().any(|e| e.id == **id))
        {
            return Err(EngineError::NotFound(*missing));
        }
        Ok(extras)
    }

    /// Gross price for the given booking, discounted for the user's current tier.
    async fn quote(
        &self,
        user_id: Ulid,
        court: &Court,
        range: &TimeRange,
        extras: &[Extra],
    ) -> PriceBreakdown {
        let tier = self.ledger.account(user_id).await.tier;
        self.discounts.apply(self.pricing.price(court, range, extras), tier)
    }

    fn announce_confirmed(&self, r: &Reservation) {
        self.notify.send(Notification::ReservationConfirmed {
            reservation_id: r.id,
            user_id: r.user_id,
            court_id: r.court_id,
            range: r.range,
            total: r.price.total,
        });
    }
}

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::model::*;
use crate::notify::{Notification, NotifyHub};
use crate::repository::{Repository, StoreError};

/// Points needed for each tier, lowest first.
pub const DEFAULT_TIER_THRESHOLDS: [(u64, Tier); 4] = [
    (0, Tier::Beginner),
    (100, Tier::Silver),
    (500, Tier::Gold),
    (1_500, Tier::Platinum),
];

/// Ordered `(threshold, tier)` table. The tier for a balance is the highest entry
/// whose threshold is at or below it.
#[derive(Debug, Clone)]
pub struct TierTable {
    thresholds: Vec<(u64, Tier)>,
}

impl Default for TierTable {
    fn default() -> Self {
        Self::new(DEFAULT_TIER_THRESHOLDS.to_vec())
    }
}

impl TierTable {
    pub fn new(mut thresholds: Vec<(u64, Tier)>) -> Self {
        thresholds.sort_by_key(|(points, tier)| (*points, *tier));
        Self { thresholds }
    }

    pub fn tier_for(&self, balance: u64) -> Tier {
        self.thresholds
            .iter()
            .rev()
            .find(|(points, _)| *points <= balance)
            .map(|(_, tier)| *tier)
            .unwrap_or(Tier::Beginner)
    }

    /// The next tier above `balance` and the points it requires.
    pub fn next_threshold(&self, balance: u64) -> Option<(u64, Tier)> {
        let current = self.tier_for(balance);
        self.thresholds
            .iter()
            .find(|(points, tier)| *points > balance && *tier > current)
            .copied()
    }
}

/// Per-user point balances, mutated only in response to reservation lifecycle
/// events (plus administrative adjustments). Every lifecycle call is idempotent per
/// reservation id.
pub struct LoyaltyLedger {
    accounts: DashMap<Ulid, Arc<Mutex<LoyaltyRecord>>>,
    repo: Arc<dyn Repository>,
    notify: Arc<NotifyHub>,
    tiers: TierTable,
    points_per_currency_unit: u32,
}

impl LoyaltyLedger {
    pub fn new(
        repo: Arc<dyn Repository>,
        notify: Arc<NotifyHub>,
        tiers: TierTable,
        points_per_currency_unit: u32,
    ) -> Self {
        Self {
            accounts: DashMap::new(),
            repo,
            notify,
            tiers,
            points_per_currency_unit,
        }
    }

    /// Load persisted records. Called once at startup, before any traffic.
    pub fn restore(&self, records: Vec<LoyaltyRecord>) {
        for record in records {
            self.accounts
                .insert(record.user_id, Arc::new(Mutex::new(record)));
        }
    }

    pub fn tiers(&self) -> &TierTable {
        &self.tiers
    }

    /// `floor(price × points_per_currency_unit)`, price in whole currency units.
    pub fn points_for(&self, price: Money) -> u64 {
        let cents = price.cents().max(0) as u64;
        cents * self.points_per_currency_unit as u64 / 100
    }

    fn handle(&self, user_id: Ulid) -> Arc<Mutex<LoyaltyRecord>> {
        self.accounts
            .entry(user_id)
            .or_insert_with(|| Arc::new(Mutex::new(LoyaltyRecord::new(user_id))))
            .value()
            .clone()
    }

    fn view(&self, record: &LoyaltyRecord) -> LoyaltyAccount {
        LoyaltyAccount {
            user_id: record.user_id,
            balance: record.balance,
            tier: self.tiers.tier_for(record.balance),
        }
    }

    /// Current standing. Users without history read as Beginner with 0 points.
    pub async fn account(&self, user_id: Ulid) -> LoyaltyAccount {
        let Some(handle) = self.accounts.get(&user_id).map(|e| e.value().clone()) else {
            return LoyaltyAccount {
                user_id,
                balance: 0,
                tier: self.tiers.tier_for(0),
            };
        };
        let record = handle.lock().await;
        self.view(&record)
    }

    pub async fn on_reservation_completed(
        &self,
        user_id: Ulid,
        reservation_id: Ulid,
        price: Money,
    ) -> Result<LoyaltyAccount, StoreError> {
        let handle = self.handle(user_id);
        let mut record = handle.lock().await;
        if record.entry(&reservation_id).is_some() {
            debug!("points for reservation {reservation_id} already recorded");
            return Ok(self.view(&record));
        }

        let points = self.points_for(price);
        let mut next = record.clone();
        next.balance = next.balance.saturating_add(points);
        next.entries.push(LedgerEntry { reservation_id, points });
        self.commit(&mut record, next).await?;
        info!("awarded {points} points to {user_id} for reservation {reservation_id}");
        Ok(self.view(&record))
    }

    /// Take back points awarded for `reservation_id`. Never fails on insufficient
    /// balance: the balance is clamped at zero and the shortfall logged.
    pub async fn on_reservation_cancelled(
        &self,
        user_id: Ulid,
        reservation_id: Ulid,
    ) -> Result<LoyaltyAccount, StoreError> {
        let handle = self.handle(user_id);
        let mut record = handle.lock().await;
        let Some(entry) = record.entry(&reservation_id).copied() else {
            debug!("no points to reverse for reservation {reservation_id}");
            return Ok(self.view(&record));
        };

        let mut next = record.clone();
        next.balance = match record.balance.checked_sub(entry.points) {
            Some(b) => b,
            None => {
                warn!(
                    "loyalty discrepancy for {user_id}: reversing {} points from balance {} \
                     (reservation {reservation_id}); clamping to 0",
                    entry.points, record.balance
                );
                metrics::counter!(crate::observability::LOYALTY_CLAMPS_TOTAL).increment(1);
                0
            }
        };
        next.entries.retain(|e| e.reservation_id != reservation_id);
        self.commit(&mut record, next).await?;
        info!("reversed {} points from {user_id} for reservation {reservation_id}", entry.points);
        Ok(self.view(&record))
    }

    /// Forget the award marker once the reservation is durably Completed. The
    /// pruned record is written with the user's next loyalty change.
    pub async fn settle(&self, user_id: Ulid, reservation_id: Ulid) {
        let Some(handle) = self.accounts.get(&user_id).map(|e| e.value().clone()) else {
            return;
        };
        handle
            .lock()
            .await
            .entries
            .retain(|e| e.reservation_id != reservation_id);
    }

    /// Number of awards not yet settled for `user_id`.
    pub async fn unsettled(&self, user_id: Ulid) -> usize {
        match self.accounts.get(&user_id).map(|e| e.value().clone()) {
            Some(handle) => handle.lock().await.entries.len(),
            None => 0,
        }
    }

    /// Administrative correction. Negative deltas clamp at zero.
    pub async fn adjust(&self, user_id: Ulid, delta: i64) -> Result<LoyaltyAccount, StoreError> {
        let handle = self.handle(user_id);
        let mut record = handle.lock().await;
        let mut next = record.clone();
        next.balance = if delta >= 0 {
            record.balance.saturating_add(delta as u64)
        } else {
            record.balance.saturating_sub(delta.unsigned_abs())
        };
        self.commit(&mut record, next).await?;
        Ok(self.view(&record))
    }

    /// Persist `next`, then make it current and announce any tier increase.
    async fn commit(&self, current: &mut LoyaltyRecord, next: LoyaltyRecord) -> Result<(), StoreError> {
        self.repo.persist_loyalty(&next).await?;
        let before = self.tiers.tier_for(current.balance);
        *current = next;
        let after = self.tiers.tier_for(current.balance);
        if after > before {
            info!("{} upgraded {before} -> {after}", current.user_id);
            metrics::counter!(crate::observability::TIER_UPGRADES_TOTAL).increment(1);
            self.notify.send(Notification::TierUpgraded {
                user_id: current.user_id,
                from: before,
                to: after,
                balance: current.balance,
            });
        }
        Ok(())
    }
}

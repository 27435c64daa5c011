use async_trait::async_trait;
use dashmap::DashMap;
use ulid::Ulid;

use crate::model::*;
use crate::repository::{Repository, StoreError};

/// Materialized state shared by both repository implementations.
pub struct Tables {
    courts: DashMap<Ulid, Court>,
    extras: DashMap<Ulid, Extra>,
    reservations: DashMap<Ulid, Reservation>,
    /// User → reservation ids, in insertion order.
    by_user: DashMap<Ulid, Vec<Ulid>>,
    loyalty: DashMap<Ulid, LoyaltyRecord>,
}

impl Default for Tables {
    fn default() -> Self {
        Self::new()
    }
}

impl Tables {
    pub fn new() -> Self {
        Self {
            courts: DashMap::new(),
            extras: DashMap::new(),
            reservations: DashMap::new(),
            by_user: DashMap::new(),
            loyalty: DashMap::new(),
        }
    }

    pub fn reservation_count(&self) -> usize {
        self.reservations.len()
    }

    // ── Event application ────────────────────────────────────

    pub fn apply_event(&self, event: &Event) {
        match event {
            Event::CourtPut { court } => {
                self.courts.insert(court.id, court.clone());
            }
            Event::ExtraPut { extra } => {
                self.extras.insert(extra.id, extra.clone());
            }
            Event::ReservationPut { reservation } => {
                let prev = self.reservations.insert(reservation.id, reservation.clone());
                if prev.is_none() {
                    self.by_user
                        .entry(reservation.user_id)
                        .or_default()
                        .push(reservation.id);
                }
            }
            Event::LoyaltyPut { record } => {
                self.loyalty.insert(record.user_id, record.clone());
            }
        }
    }

    /// Minimal event list that recreates the current state.
    pub fn snapshot(&self) -> Vec<Event> {
        let mut events = Vec::with_capacity(
            self.courts.len() + self.extras.len() + self.reservations.len() + self.loyalty.len(),
        );
        events.extend(self.courts.iter().map(|e| Event::CourtPut { court: e.value().clone() }));
        events.extend(self.extras.iter().map(|e| Event::ExtraPut { extra: e.value().clone() }));
        let mut reservations: Vec<Reservation> =
            self.reservations.iter().map(|e| e.value().clone()).collect();
        reservations.sort_by_key(|r| r.id);
        events.extend(
            reservations
                .into_iter()
                .map(|reservation| Event::ReservationPut { reservation }),
        );
        events.extend(
            self.loyalty
                .iter()
                .map(|e| Event::LoyaltyPut { record: e.value().clone() }),
        );
        events
    }

    // ── Reads ────────────────────────────────────────────────

    pub fn court(&self, id: &Ulid) -> Option<Court> {
        self.courts.get(id).map(|e| e.value().clone())
    }

    pub fn extras(&self, ids: &[Ulid]) -> Vec<Extra> {
        ids.iter()
            .filter_map(|id| self.extras.get(id).map(|e| e.value().clone()))
            .collect()
    }

    pub fn reservation(&self, id: &Ulid) -> Option<Reservation> {
        self.reservations.get(id).map(|e| e.value().clone())
    }

    pub fn active_reservations(&self) -> Vec<Reservation> {
        self.reservations
            .iter()
            .filter(|e| e.value().status.holds_slot())
            .map(|e| e.value().clone())
            .collect()
    }

    pub fn user_reservations(&self, user_id: &Ulid) -> Vec<Reservation> {
        let ids = self
            .by_user
            .get(user_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        let mut out: Vec<Reservation> = ids.iter().filter_map(|id| self.reservation(id)).collect();
        out.sort_by_key(|r| r.range.start());
        out
    }

    pub fn loyalty_records(&self) -> Vec<LoyaltyRecord> {
        self.loyalty.iter().map(|e| e.value().clone()).collect()
    }
}

/// Volatile repository. State lives only as long as the process.
#[derive(Default)]
pub struct InMemoryRepository {
    tables: Tables,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tables(&self) -> &Tables {
        &self.tables
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn put_court(&self, court: Court) -> Result<(), StoreError> {
        self.tables.apply_event(&Event::CourtPut { court });
        Ok(())
    }

    async fn put_extra(&self, extra: Extra) -> Result<(), StoreError> {
        self.tables.apply_event(&Event::ExtraPut { extra });
        Ok(())
    }

    async fn load_court(&self, id: Ulid) -> Result<Option<Court>, StoreError> {
        Ok(self.tables.court(&id))
    }

    async fn load_extras(&self, ids: &[Ulid]) -> Result<Vec<Extra>, StoreError> {
        Ok(self.tables.extras(ids))
    }

    async fn persist_reservation(&self, reservation: &Reservation) -> Result<(), StoreError> {
        self.tables.apply_event(&Event::ReservationPut {
            reservation: reservation.clone(),
        });
        Ok(())
    }

    async fn load_reservation(&self, id: Ulid) -> Result<Option<Reservation>, StoreError> {
        Ok(self.tables.reservation(&id))
    }

    async fn active_reservations(&self) -> Result<Vec<Reservation>, StoreError> {
        Ok(self.tables.active_reservations())
    }

    async fn user_reservations(&self, user_id: Ulid) -> Result<Vec<Reservation>, StoreError> {
        Ok(self.tables.user_reservations(&user_id))
    }

    async fn persist_loyalty(&self, record: &LoyaltyRecord) -> Result<(), StoreError> {
        self.tables.apply_event(&Event::LoyaltyPut { record: record.clone() });
        Ok(())
    }

    async fn loyalty_accounts(&self) -> Result<Vec<LoyaltyRecord>, StoreError> {
        Ok(self.tables.loyalty_records())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reservation(user_id: Ulid, start: Ms, status: ReservationStatus) -> Reservation {
        Reservation {
            id: Ulid::new(),
            court_id: Ulid::new(),
            coach_id: None,
            user_id,
            range: TimeRange::new(start, start + HOUR_MS).unwrap(),
            extras: Vec::new(),
            status,
            price: PriceBreakdown::default(),
            notes: None,
            created_at: 0,
            modified_at: 0,
            pending_expires_at: None,
        }
    }

    #[tokio::test]
    async fn user_index_sorted_by_start_and_not_duplicated() {
        let repo = InMemoryRepository::new();
        let user = Ulid::new();
        let late = reservation(user, 5 * HOUR_MS, ReservationStatus::Confirmed);
        let early = reservation(user, HOUR_MS, ReservationStatus::Confirmed);
        repo.persist_reservation(&late).await.unwrap();
        repo.persist_reservation(&early).await.unwrap();

        // Re-persisting a record must not add a second index entry.
        let mut cancelled = late.clone();
        cancelled.status = ReservationStatus::Cancelled;
        repo.persist_reservation(&cancelled).await.unwrap();

        let mine = repo.user_reservations(user).await.unwrap();
        assert_eq!(mine.len(), 2);
        assert_eq!(mine[0].id, early.id);
        assert_eq!(mine[1].status, ReservationStatus::Cancelled);
    }

    #[tokio::test]
    async fn active_excludes_cancelled() {
        let repo = InMemoryRepository::new();
        let user = Ulid::new();
        repo.persist_reservation(&reservation(user, 0, ReservationStatus::Pending)).await.unwrap();
        repo.persist_reservation(&reservation(user, 0, ReservationStatus::Cancelled)).await.unwrap();
        repo.persist_reservation(&reservation(user, 0, ReservationStatus::Completed)).await.unwrap();
        assert_eq!(repo.active_reservations().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn load_extras_skips_unknown_and_keeps_order() {
        let repo = InMemoryRepository::new();
        let a = Extra {
            id: Ulid::new(),
            name: "racket".into(),
            unit_price: Money::from_cents(500),
            mode: PricingMode::Flat,
            requires_lighting: false,
        };
        let b = Extra {
            id: Ulid::new(),
            name: "balls".into(),
            unit_price: Money::from_cents(300),
            mode: PricingMode::Flat,
            requires_lighting: false,
        };
        repo.put_extra(a.clone()).await.unwrap();
        repo.put_extra(b.clone()).await.unwrap();
        let found = repo.load_extras(&[b.id, Ulid::new(), a.id]).await.unwrap();
        assert_eq!(found, vec![b, a]);
    }

    #[test]
    fn snapshot_replays_to_same_state() {
        let tables = Tables::new();
        let user = Ulid::new();
        tables.apply_event(&Event::ReservationPut {
            reservation: reservation(user, 0, ReservationStatus::Confirmed),
        });
        tables.apply_event(&Event::LoyaltyPut { record: LoyaltyRecord::new(user) });

        let copy = Tables::new();
        for e in tables.snapshot() {
            copy.apply_event(&e);
        }
        assert_eq!(copy.reservation_count(), 1);
        assert_eq!(copy.user_reservations(&user).len(), 1);
        assert_eq!(copy.loyalty_records().len(), 1);
    }
}

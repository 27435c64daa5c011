use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use ulid::Ulid;

use crate::model::*;

/// Handle for one booked range in the index. The engine uses the reservation id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotToken(pub Ulid);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BookedSlot {
    pub token: SlotToken,
    pub range: TimeRange,
}

/// Booked ranges of one resource (a court or a coach), sorted by start.
///
/// Stored ranges never overlap each other, so their ends are sorted too; both
/// bounds of an overlap query are found by binary search.
#[derive(Debug, Default)]
pub struct CourtSlots {
    slots: Vec<BookedSlot>,
    by_token: HashMap<SlotToken, TimeRange>,
}

impl CourtSlots {
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn range_of(&self, token: &SlotToken) -> Option<TimeRange> {
        self.by_token.get(token).copied()
    }

    pub fn slots(&self) -> &[BookedSlot] {
        &self.slots
    }

    /// Only slots whose range overlaps `query`.
    pub fn overlapping(&self, query: &TimeRange) -> &[BookedSlot] {
        let left = self.slots.partition_point(|s| s.range.end() <= query.start());
        let right = self.slots.partition_point(|s| s.range.start() < query.end());
        if left >= right {
            return &[];
        }
        &self.slots[left..right]
    }

    /// First slot overlapping `range`, ignoring `ignore` (a slot being moved).
    pub fn conflict(&self, range: &TimeRange, ignore: Option<SlotToken>) -> Option<SlotToken> {
        self.overlapping(range)
            .iter()
            .find(|s| Some(s.token) != ignore)
            .map(|s| s.token)
    }

    pub fn is_free(&self, range: &TimeRange) -> bool {
        self.conflict(range, None).is_none()
    }

    /// Insert without checking. Caller has verified there is no conflict.
    pub fn insert(&mut self, token: SlotToken, range: TimeRange) {
        let pos = self.slots.partition_point(|s| s.range.start() < range.start());
        self.slots.insert(pos, BookedSlot { token, range });
        self.by_token.insert(token, range);
    }

    /// Remove a slot. Removing an unknown token is a no-op.
    pub fn remove(&mut self, token: SlotToken) -> Option<TimeRange> {
        let range = self.by_token.remove(&token)?;
        let pos = self.slots.partition_point(|s| s.range.start() < range.start());
        if let Some(offset) = self.slots[pos..].iter().position(|s| s.token == token) {
            self.slots.remove(pos + offset);
        }
        Some(range)
    }

    /// Busy ranges clamped to `window`, adjacent ones merged.
    pub fn busy_within(&self, window: &TimeRange) -> Vec<TimeRange> {
        let clamped: Vec<TimeRange> = self
            .overlapping(window)
            .iter()
            .filter_map(|s| s.range.clamp_to(window))
            .collect();
        merge_overlapping(&clamped)
    }
}

pub type SharedCourtSlots = Arc<Mutex<CourtSlots>>;

/// Locks on several resources at once. Built by [`AvailabilityIndex::lock_all`].
///
/// Operations on a resource that is not held are no-ops; callers lock every
/// resource they read or write.
pub struct HeldSlots {
    guards: BTreeMap<Ulid, OwnedMutexGuard<CourtSlots>>,
}

impl HeldSlots {
    pub fn holds(&self, resource: &Ulid) -> bool {
        self.guards.contains_key(resource)
    }

    pub fn len(&self, resource: &Ulid) -> usize {
        self.guards.get(resource).map_or(0, |slots| slots.len())
    }

    /// First resource in `resources` with a slot overlapping `range`, other than
    /// `ignore`, and the token holding it.
    pub fn conflict(
        &self,
        resources: &[Ulid],
        range: &TimeRange,
        ignore: Option<SlotToken>,
    ) -> Option<(Ulid, SlotToken)> {
        resources.iter().find_map(|resource| {
            debug_assert!(self.holds(resource), "resource {resource} not locked");
            let existing = self.guards.get(resource)?.conflict(range, ignore)?;
            Some((*resource, existing))
        })
    }

    /// Book `range` for `token` on every resource. Caller has checked [`Self::conflict`].
    pub fn insert(&mut self, resources: &[Ulid], token: SlotToken, range: TimeRange) {
        for resource in resources {
            if let Some(slots) = self.guards.get_mut(resource) {
                slots.insert(token, range);
            }
        }
    }

    pub fn remove(&mut self, resources: &[Ulid], token: SlotToken) {
        for resource in resources {
            if let Some(slots) = self.guards.get_mut(resource) {
                slots.remove(token);
            }
        }
    }
}

/// Per-resource booked ranges for active reservations. Courts and coaches are
/// keyed by their own ids. Each resource has its own lock, so bookings that share
/// no resource never wait on each other.
#[derive(Default)]
pub struct AvailabilityIndex {
    resources: DashMap<Ulid, SharedCourtSlots>,
}

impl AvailabilityIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots_of(&self, resource: Ulid) -> SharedCourtSlots {
        self.resources.entry(resource).or_default().value().clone()
    }

    /// Exclusive access to one resource's slots for a multi-step critical section.
    pub async fn lock(&self, resource: Ulid) -> OwnedMutexGuard<CourtSlots> {
        self.slots_of(resource).lock_owned().await
    }

    /// Lock every listed resource, always in id order so that two callers with
    /// overlapping sets cannot deadlock. Duplicates are locked once.
    pub async fn lock_all(&self, resources: &[Ulid]) -> HeldSlots {
        let mut ids = resources.to_vec();
        ids.sort();
        ids.dedup();
        let mut guards = BTreeMap::new();
        for id in ids {
            guards.insert(id, self.lock(id).await);
        }
        HeldSlots { guards }
    }

    pub async fn is_free(&self, resource: Ulid, range: &TimeRange) -> bool {
        self.lock(resource).await.is_free(range)
    }

    /// Idempotent: releasing an unknown or already-released token does nothing.
    pub async fn release(&self, resource: Ulid, token: SlotToken) -> Option<TimeRange> {
        let slots = self.resources.get(&resource).map(|e| e.value().clone())?;
        let mut guard = slots.lock().await;
        guard.remove(token)
    }

    /// Free/busy partition of `window`, in order.
    pub async fn free_busy(&self, resource: Ulid, window: &TimeRange) -> Vec<AvailabilitySlot> {
        let busy = match self.resources.get(&resource).map(|e| e.value().clone()) {
            Some(slots) => slots.lock().await.busy_within(window),
            None => Vec::new(),
        };
        let free = subtract_intervals(&[*window], &busy);

        let mut out: Vec<AvailabilitySlot> = free
            .into_iter()
            .map(|range| AvailabilitySlot { range, state: SlotState::Free })
            .chain(busy.into_iter().map(|range| AvailabilitySlot { range, state: SlotState::Busy }))
            .collect();
        out.sort_by_key(|s| s.range.start());
        out
    }

    pub async fn booked_count(&self, resource: Ulid) -> usize {
        match self.resources.get(&resource).map(|e| e.value().clone()) {
            Some(slots) => slots.lock().await.len(),
            None => 0,
        }
    }
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[TimeRange]) -> Vec<TimeRange> {
    let mut merged: Vec<TimeRange> = Vec::new();
    for &range in sorted {
        if let Some(last) = merged.last_mut()
            && range.start() <= last.end()
        {
            *last = TimeRange::from_bounds(last.start(), last.end().max(range.end()));
            continue;
        }
        merged.push(range);
    }
    merged
}

/// `base` minus `to_remove`; both sorted by start.
pub fn subtract_intervals(base: &[TimeRange], to_remove: &[TimeRange]) -> Vec<TimeRange> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start();
        let current_end = b.end();

        while ri < to_remove.len() && to_remove[ri].end() <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start() < current_end {
            let r = &to_remove[j];
            if r.start() > current_start {
                result.push(TimeRange::from_bounds(current_start, r.start()));
            }
            current_start = current_start.max(r.end());
            j += 1;
        }

        if current_start < current_end {
            result.push(TimeRange::from_bounds(current_start, current_end));
        }
    }

    result
}

use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Sub};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only time type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 3_600_000;

/// Rejected `[start, end)` pair: `end` must be strictly after `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidRange {
    pub start: Ms,
    pub end: Ms,
}

impl fmt::Display for InvalidRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid range [{}, {}): end must be after start", self.start, self.end)
    }
}

impl std::error::Error for InvalidRange {}

/// Half-open interval `[start, end)`. Only constructible with `start < end`,
/// including when decoded from the WAL or JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawRange")]
pub struct TimeRange {
    start: Ms,
    end: Ms,
}

#[derive(Deserialize)]
struct RawRange {
    start: Ms,
    end: Ms,
}

impl TryFrom<RawRange> for TimeRange {
    type Error = InvalidRange;

    fn try_from(raw: RawRange) -> Result<Self, InvalidRange> {
        TimeRange::new(raw.start, raw.end)
    }
}

impl TimeRange {
    pub fn new(start: Ms, end: Ms) -> Result<Self, InvalidRange> {
        if end <= start {
            return Err(InvalidRange { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> Ms {
        self.start
    }

    pub fn end(&self) -> Ms {
        self.end
    }

    /// Caller guarantees `start < end`; used where the bound is already established.
    pub(crate) fn from_bounds(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "TimeRange start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms() as u64)
    }

    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_range(&self, other: &TimeRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Intersection with `window`, or `None` when they do not overlap.
    pub fn clamp_to(&self, window: &TimeRange) -> Option<TimeRange> {
        let start = self.start.max(window.start);
        let end = self.end.min(window.end);
        (start < end).then(|| Self::from_bounds(start, end))
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

// ── Money ────────────────────────────────────────────────────────

/// Amount in minor currency units (cents).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Money(i64);

impl Money {
    pub const ZERO: Money = Money(0);

    pub const fn from_cents(cents: i64) -> Self {
        Self(cents)
    }

    pub const fn from_units(units: i64) -> Self {
        Self(units * 100)
    }

    pub const fn cents(&self) -> i64 {
        self.0
    }

    pub fn times(&self, n: i64) -> Money {
        Money(self.0 * n)
    }
}

impl Add for Money {
    type Output = Money;
    fn add(self, rhs: Money) -> Money {
        Money(self.0 + rhs.0)
    }
}

impl AddAssign for Money {
    fn add_assign(&mut self, rhs: Money) {
        self.0 += rhs.0;
    }
}

impl Sub for Money {
    type Output = Money;
    fn sub(self, rhs: Money) -> Money {
        Money(self.0 - rhs.0)
    }
}

impl Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Money {
        iter.fold(Money::ZERO, |acc, m| acc + m)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{sign}{}.{:02}", abs / 100, abs % 100)
    }
}

// ── Catalog reference data ───────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Surface {
    Hard,
    Clay,
    Grass,
    Indoor,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Court {
    pub id: Ulid,
    pub number: u32,
    pub surface: Surface,
    pub has_lighting: bool,
    /// Base rate charged per hour of play.
    pub rate_per_hour: Money,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PricingMode {
    /// Charged once per reservation.
    Flat,
    /// Charged per started hour.
    PerHour,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extra {
    pub id: Ulid,
    pub name: String,
    pub unit_price: Money,
    pub mode: PricingMode,
    /// Only bookable on lit courts, after the lighting hour.
    pub requires_lighting: bool,
}

// ── Reservations ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationStatus {
    Pending,
    Confirmed,
    Cancelled,
    Completed,
}

impl ReservationStatus {
    /// Statuses that occupy their slot in the availability index.
    pub fn holds_slot(&self) -> bool {
        matches!(self, Self::Pending | Self::Confirmed | Self::Completed)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Completed)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Cancelled => "cancelled",
            Self::Completed => "completed",
        }
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceBreakdown {
    pub base: Money,
    pub extras: Money,
    pub discount: Money,
    pub total: Money,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub court_id: Ulid,
    /// Coach booked alongside the court, if any. A coach is in one place at a time.
    pub coach_id: Option<Ulid>,
    pub user_id: Ulid,
    pub range: TimeRange,
    pub extras: Vec<Ulid>,
    pub status: ReservationStatus,
    pub price: PriceBreakdown,
    pub notes: Option<String>,
    pub created_at: Ms,
    pub modified_at: Ms,
    /// Deadline for a Pending reservation to be confirmed.
    pub pending_expires_at: Option<Ms>,
}

// ── Loyalty ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Tier {
    Beginner,
    Silver,
    Gold,
    Platinum,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Tier::Beginner => "beginner",
            Tier::Silver => "silver",
            Tier::Gold => "gold",
            Tier::Platinum => "platinum",
        };
        f.write_str(s)
    }
}

/// Read view of a user's loyalty standing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoyaltyAccount {
    pub user_id: Ulid,
    pub balance: u64,
    pub tier: Tier,
}

/// Points granted for one reservation, kept until the award is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub reservation_id: Ulid,
    pub points: u64,
}

/// Durable loyalty state. The tier is never stored; it is derived from `balance`.
/// `entries` holds only awards whose reservation is not yet durably Completed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoyaltyRecord {
    pub user_id: Ulid,
    pub balance: u64,
    pub entries: Vec<LedgerEntry>,
}

impl LoyaltyRecord {
    pub fn new(user_id: Ulid) -> Self {
        Self {
            user_id,
            balance: 0,
            entries: Vec::new(),
        }
    }

    pub fn entry(&self, reservation_id: &Ulid) -> Option<&LedgerEntry> {
        self.entries.iter().find(|e| e.reservation_id == *reservation_id)
    }
}

// ── Availability query results ───────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotState {
    Free,
    Busy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilitySlot {
    pub range: TimeRange,
    pub state: SlotState,
}

/// The event types — flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    CourtPut { court: Court },
    ExtraPut { extra: Extra },
    ReservationPut { reservation: Reservation },
    LoyaltyPut { record: LoyaltyRecord },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_basics() {
        let r = TimeRange::new(100, 200).unwrap();
        assert_eq!(r.duration_ms(), 100);
        assert_eq!(r.duration(), Duration::from_millis(100));
        assert!(r.contains_instant(100));
        assert!(r.contains_instant(199));
        assert!(!r.contains_instant(200)); // half-open
    }

    #[test]
    fn range_rejects_empty_and_inverted() {
        assert_eq!(TimeRange::new(200, 200), Err(InvalidRange { start: 200, end: 200 }));
        assert!(TimeRange::new(300, 200).is_err());
    }

    #[test]
    fn decoding_rejects_inverted_range() {
        let json: Result<TimeRange, _> = serde_json::from_str(r#"{"start":500,"end":100}"#);
        assert!(json.is_err());

        let ok: TimeRange = serde_json::from_str(r#"{"start":100,"end":500}"#).unwrap();
        assert_eq!((ok.start(), ok.end()), (100, 500));

        // Same field layout as TimeRange, without the check.
        #[derive(Serialize)]
        struct Unchecked {
            start: Ms,
            end: Ms,
        }
        let bytes = bincode::serialize(&Unchecked { start: 900, end: 300 }).unwrap();
        assert!(bincode::deserialize::<TimeRange>(&bytes).is_err());
    }

    #[test]
    fn range_overlap() {
        let a = TimeRange::new(100, 200).unwrap();
        let b = TimeRange::new(150, 250).unwrap();
        let c = TimeRange::new(200, 300).unwrap();
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c)); // touching, not overlapping
        assert!(!c.overlaps(&a));
    }

    #[test]
    fn range_contains_range() {
        let outer = TimeRange::new(100, 400).unwrap();
        let inner = TimeRange::new(150, 300).unwrap();
        let partial = TimeRange::new(50, 200).unwrap();
        assert!(outer.contains_range(&inner));
        assert!(outer.contains_range(&outer));
        assert!(!outer.contains_range(&partial));
    }

    #[test]
    fn range_clamp() {
        let window = TimeRange::new(100, 200).unwrap();
        let r = TimeRange::new(50, 150).unwrap();
        assert_eq!(r.clamp_to(&window), Some(TimeRange::new(100, 150).unwrap()));
        let outside = TimeRange::new(200, 300).unwrap();
        assert_eq!(outside.clamp_to(&window), None);
    }

    #[test]
    fn money_display() {
        assert_eq!(Money::from_cents(1250).to_string(), "12.50");
        assert_eq!(Money::from_cents(5).to_string(), "0.05");
        assert_eq!(Money::from_cents(-310).to_string(), "-3.10");
        assert_eq!(Money::from_units(20), Money::from_cents(2000));
    }

    #[test]
    fn money_sum() {
        let total: Money = [Money::from_cents(100), Money::from_cents(250)].into_iter().sum();
        assert_eq!(total, Money::from_cents(350));
    }

    #[test]
    fn status_slot_occupancy() {
        assert!(ReservationStatus::Pending.holds_slot());
        assert!(ReservationStatus::Confirmed.holds_slot());
        assert!(ReservationStatus::Completed.holds_slot());
        assert!(!ReservationStatus::Cancelled.holds_slot());
        assert!(ReservationStatus::Completed.is_terminal());
        assert!(!ReservationStatus::Confirmed.is_terminal());
    }

    #[test]
    fn tiers_are_ordered() {
        assert!(Tier::Beginner < Tier::Silver);
        assert!(Tier::Silver < Tier::Gold);
        assert!(Tier::Gold < Tier::Platinum);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::ReservationPut {
            reservation: Reservation {
                id: Ulid::new(),
                court_id: Ulid::new(),
                coach_id: Some(Ulid::new()),
                user_id: Ulid::new(),
                range: TimeRange::new(0, HOUR_MS).unwrap(),
                extras: vec![Ulid::new()],
                status: ReservationStatus::Confirmed,
                price: PriceBreakdown::default(),
                notes: Some("bring water".into()),
                created_at: 1,
                modified_at: 1,
                pending_expires_at: None,
            },
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}

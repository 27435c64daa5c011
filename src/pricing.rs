use crate::model::*;

/// Default billable unit: durations are rounded up to whole half hours.
pub const DEFAULT_BILLABLE_UNIT_MS: Ms = 30 * MINUTE_MS;

/// Discount per tier in basis points (1/100 of a percent), ordered by tier.
pub const DEFAULT_DISCOUNTS: [(Tier, u32); 4] = [
    (Tier::Beginner, 0),
    (Tier::Silver, 500),
    (Tier::Gold, 1_000),
    (Tier::Platinum, 1_500),
];

/// Ceiling division for positive operands.
fn ceil_div(n: Ms, d: Ms) -> Ms {
    (n + d - 1) / d
}

/// Computes reservation prices. Only durations are rounded (up, to whole billable
/// units or started hours); prices are never rounded except once when a per-hour rate
/// does not divide evenly into billable units.
#[derive(Debug, Clone)]
pub struct PricingCalculator {
    billable_unit_ms: Ms,
}

impl Default for PricingCalculator {
    fn default() -> Self {
        Self::new(DEFAULT_BILLABLE_UNIT_MS)
    }
}

impl PricingCalculator {
    pub fn new(billable_unit_ms: Ms) -> Self {
        Self {
            billable_unit_ms: billable_unit_ms.max(1),
        }
    }

    pub fn billable_unit_ms(&self) -> Ms {
        self.billable_unit_ms
    }

    pub fn billable_units(&self, range: &TimeRange) -> Ms {
        ceil_div(range.duration_ms(), self.billable_unit_ms)
    }

    pub fn started_hours(range: &TimeRange) -> Ms {
        ceil_div(range.duration_ms(), HOUR_MS)
    }

    /// Court rate × billed duration, rounded half-up to the cent.
    pub fn base_price(&self, court: &Court, range: &TimeRange) -> Money {
        let billed_ms = self.billable_units(range) as i128 * self.billable_unit_ms as i128;
        let numerator = court.rate_per_hour.cents() as i128 * billed_ms;
        let hour = HOUR_MS as i128;
        Money::from_cents(((numerator + hour / 2) / hour) as i64)
    }

    pub fn extra_price(&self, extra: &Extra, range: &TimeRange) -> Money {
        match extra.mode {
            PricingMode::Flat => extra.unit_price,
            PricingMode::PerHour => extra.unit_price.times(Self::started_hours(range)),
        }
    }

    pub fn price(&self, court: &Court, range: &TimeRange, extras: &[Extra]) -> PriceBreakdown {
        let base = self.base_price(court, range);
        let extras: Money = extras.iter().map(|e| self.extra_price(e, range)).sum();
        PriceBreakdown {
            base,
            extras,
            discount: Money::ZERO,
            total: base + extras,
        }
    }
}

/// Loyalty discounts, one ordered table.
#[derive(Debug, Clone)]
pub struct DiscountTable {
    entries: Vec<(Tier, u32)>,
}

impl Default for DiscountTable {
    fn default() -> Self {
        Self {
            entries: DEFAULT_DISCOUNTS.to_vec(),
        }
    }
}

impl DiscountTable {
    pub fn new(mut entries: Vec<(Tier, u32)>) -> Self {
        entries.sort_by_key(|(tier, _)| *tier);
        Self { entries }
    }

    /// No discount for any tier.
    pub fn none() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn basis_points(&self, tier: Tier) -> u32 {
        self.entries
            .iter()
            .find(|(t, _)| *t == tier)
            .map(|(_, bps)| (*bps).min(10_000))
            .unwrap_or(0)
    }

    /// Discount the pre-discount total by the tier's rate, rounding half-up to the cent.
    pub fn apply(&self, breakdown: PriceBreakdown, tier: Tier) -> PriceBreakdown {
        let gross = breakdown.base + breakdown.extras;
        let bps = self.basis_points(tier) as i128;
        let discount = (gross.cents() as i128 * bps + 5_000) / 10_000;
        let discount = Money::from_cents(discount as i64);
        PriceBreakdown {
            base: breakdown.base,
            extras: breakdown.extras,
            discount,
            total: gross - discount,
        }
    }
}

use std::path::PathBuf;

use crate::loyalty::DEFAULT_TIER_THRESHOLDS;
use crate::model::*;
use crate::pricing::{DEFAULT_BILLABLE_UNIT_MS, DEFAULT_DISCOUNTS};

/// How a new reservation is paid for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentMode {
    /// Booked straight into Confirmed.
    Immediate,
    /// Booked as Pending; cancelled unless confirmed within `hold_ms`.
    Deferred { hold_ms: Ms },
}

/// Business policy for the reservation engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub billable_unit_ms: Ms,
    /// Cancellations must happen at least this long before the start.
    pub cancellation_cutoff_ms: Ms,
    pub payment: PaymentMode,
    pub points_per_currency_unit: u32,
    pub tier_thresholds: Vec<(u64, Tier)>,
    /// Discount per tier in basis points.
    pub discounts: Vec<(Tier, u32)>,
    /// Extras that need lighting may not start before this UTC hour.
    pub lighting_start_hour: u32,
    /// Max Pending/Confirmed reservations per user that have not ended yet.
    pub max_active_per_user: Option<u32>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            billable_unit_ms: DEFAULT_BILLABLE_UNIT_MS,
            cancellation_cutoff_ms: 0,
            payment: PaymentMode::Immediate,
            points_per_currency_unit: 1,
            tier_thresholds: DEFAULT_TIER_THRESHOLDS.to_vec(),
            discounts: DEFAULT_DISCOUNTS.to_vec(),
            lighting_start_hour: 19,
            max_active_per_user: None,
        }
    }
}

/// Process-level settings for the `courtside` daemon.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub metrics_port: Option<u16>,
    /// Compact the WAL once this many appends accumulated.
    pub compact_threshold: u64,
    /// Period of the completion sweep.
    pub sweep_interval_ms: u64,
    pub engine: EngineConfig,
}

impl Config {
    /// Read `COURTSIDE_*` environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let parsed = |key: &str| lookup(key).and_then(|s| s.trim().parse::<i64>().ok());

        let mut engine = EngineConfig::default();
        if let Some(m) = parsed("COURTSIDE_BILLABLE_UNIT_MINUTES").filter(|m| *m > 0) {
            engine.billable_unit_ms = m * MINUTE_MS;
        }
        if let Some(m) = parsed("COURTSIDE_CANCEL_CUTOFF_MINUTES").filter(|m| *m >= 0) {
            engine.cancellation_cutoff_ms = m * MINUTE_MS;
        }
        if let Some(s) = parsed("COURTSIDE_PAYMENT_HOLD_SECONDS").filter(|s| *s > 0) {
            engine.payment = PaymentMode::Deferred { hold_ms: s * 1_000 };
        }
        if let Some(p) = parsed("COURTSIDE_POINTS_PER_UNIT").and_then(|p| u32::try_from(p).ok()) {
            engine.points_per_currency_unit = p;
        }
        if let Some(h) = parsed("COURTSIDE_LIGHTING_HOUR").filter(|h| (0..24).contains(h)) {
            engine.lighting_start_hour = h as u32;
        }
        engine.max_active_per_user = parsed("COURTSIDE_MAX_ACTIVE_PER_USER")
            .and_then(|n| u32::try_from(n).ok())
            .filter(|n| *n > 0);

        Self {
            data_dir: PathBuf::from(lookup("COURTSIDE_DATA_DIR").unwrap_or_else(|| "./data".into())),
            metrics_port: parsed("COURTSIDE_METRICS_PORT").and_then(|p| u16::try_from(p).ok()),
            compact_threshold: parsed("COURTSIDE_COMPACT_THRESHOLD")
                .and_then(|n| u64::try_from(n).ok())
                .unwrap_or(1000),
            sweep_interval_ms: parsed("COURTSIDE_SWEEP_INTERVAL_MS")
                .and_then(|n| u64::try_from(n).ok())
                .filter(|n| *n > 0)
                .unwrap_or(60_000),
            engine,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|k| vars.get(k).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let c = config_from(&[]);
        assert_eq!(c.data_dir, PathBuf::from("./data"));
        assert_eq!(c.metrics_port, None);
        assert_eq!(c.compact_threshold, 1000);
        assert_eq!(c.engine.billable_unit_ms, 30 * MINUTE_MS);
        assert_eq!(c.engine.payment, PaymentMode::Immediate);
        assert_eq!(c.engine.max_active_per_user, None);
        assert_eq!(c.engine.discounts, DEFAULT_DISCOUNTS.to_vec());
        assert_eq!(c.engine.tier_thresholds, DEFAULT_TIER_THRESHOLDS.to_vec());
    }

    #[test]
    fn overrides_are_parsed() {
        let c = config_from(&[
            ("COURTSIDE_DATA_DIR", "/var/lib/courtside"),
            ("COURTSIDE_METRICS_PORT", "9100"),
            ("COURTSIDE_BILLABLE_UNIT_MINUTES", "15"),
            ("COURTSIDE_CANCEL_CUTOFF_MINUTES", "120"),
            ("COURTSIDE_PAYMENT_HOLD_SECONDS", "600"),
            ("COURTSIDE_MAX_ACTIVE_PER_USER", "3"),
            ("COURTSIDE_LIGHTING_HOUR", "18"),
        ]);
        assert_eq!(c.data_dir, PathBuf::from("/var/lib/courtside"));
        assert_eq!(c.metrics_port, Some(9100));
        assert_eq!(c.engine.billable_unit_ms, 15 * MINUTE_MS);
        assert_eq!(c.engine.cancellation_cutoff_ms, 2 * HOUR_MS);
        assert_eq!(c.engine.payment, PaymentMode::Deferred { hold_ms: 600_000 });
        assert_eq!(c.engine.max_active_per_user, Some(3));
        assert_eq!(c.engine.lighting_start_hour, 18);
    }

    #[test]
    fn garbage_falls_back_to_defaults() {
        let c = config_from(&[
            ("COURTSIDE_METRICS_PORT", "not-a-port"),
            ("COURTSIDE_BILLABLE_UNIT_MINUTES", "0"),
            ("COURTSIDE_LIGHTING_HOUR", "25"),
            ("COURTSIDE_PAYMENT_HOLD_SECONDS", "-5"),
        ]);
        assert_eq!(c.metrics_port, None);
        assert_eq!(c.engine.billable_unit_ms, 30 * MINUTE_MS);
        assert_eq!(c.engine.lighting_start_hour, 19);
        assert_eq!(c.engine.payment, PaymentMode::Immediate);
    }
}

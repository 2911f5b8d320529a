// src/pricing.rs
//! Single source of truth for balance-subsystem constants and the
//! per-model turn cost table.

use chrono::FixedOffset;
use once_cell::sync::Lazy;
use std::collections::HashMap;

/// Seconds between timer-bucket credits.
pub const REFILL_INTERVAL_SECS: i64 = 7_200;

/// Hard cap on the timer bucket.
pub const TIMER_BUCKET_MAX: i64 = 15;

/// TTL of the per-user refill lock, in milliseconds.
pub const REFILL_LOCK_TTL_MS: u64 = 5_000;

/// TTL of a reseeded balance key. Short on purpose: the ledger remains the
/// source of truth and a stale key self-heals on expiry.
pub const BALANCE_CACHE_TTL_SECS: u64 = 300;

/// Length of the advisory recent-activity ring per user.
pub const RECENT_RING_LEN: usize = 20;

/// Ruby granted by the daily check-in.
pub const CHECKIN_REWARD: i64 = 5;

/// TTL of a webhook idempotency claim.
pub const WEBHOOK_CLAIM_TTL_SECS: u64 = 24 * 60 * 60;

/// Turn cost charged for model ids missing from the table.
pub const DEFAULT_TURN_COST: i64 = 1;

/// Calendar-day operations (check-in) are scoped to KST, UTC+9.
pub fn kst() -> FixedOffset {
    FixedOffset::east_opt(9 * 3600).unwrap()
}

static MODEL_COSTS: Lazy<HashMap<&'static str, i64>> = Lazy::new(|| {
    HashMap::from([
        ("basic", 0),
        ("standard", 1),
        ("advanced", 3),
        ("premium", 5),
    ])
});

/// Ruby cost of one chat turn on the given model.
pub fn turn_cost(model_id: &str) -> i64 {
    MODEL_COSTS
        .get(model_id)
        .copied()
        .unwrap_or(DEFAULT_TURN_COST)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_models_use_table_costs() {
        assert_eq!(turn_cost("basic"), 0);
        assert_eq!(turn_cost("premium"), 5);
    }

    #[test]
    fn unknown_models_fall_back_to_default() {
        assert_eq!(turn_cost("next-gen-unreleased"), DEFAULT_TURN_COST);
    }
}

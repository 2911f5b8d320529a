// src/refill.rs
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::pricing::{REFILL_INTERVAL_SECS, TIMER_BUCKET_MAX};

/// Regeneration progress for the timer allowance.
///
/// Invariants:
/// - `timer_bucket` never exceeds `TIMER_BUCKET_MAX` and only increases,
///   in whole-interval credits
/// - `last_refill_at` is a watermark that advances by credited intervals,
///   never jumps to "now" (fractional progress is kept)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefillState {
    pub user_id: Uuid,
    pub timer_bucket: i64,
    pub last_refill_at: DateTime<Utc>,
}

impl RefillState {
    pub fn new(user_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            user_id,
            timer_bucket: 0,
            last_refill_at: now,
        }
    }

    pub fn capacity(&self) -> i64 {
        TIMER_BUCKET_MAX - self.timer_bucket
    }

    /// Whole intervals earned since the watermark, capped by remaining
    /// capacity. Clock skew (watermark in the future) earns nothing.
    pub fn earned_since(&self, now: DateTime<Utc>) -> i64 {
        let elapsed = (now - self.last_refill_at).num_seconds();
        if elapsed < REFILL_INTERVAL_SECS {
            return 0;
        }
        (elapsed / REFILL_INTERVAL_SECS).min(self.capacity()).max(0)
    }

    /// Apply earned credits, advancing the watermark by exactly the
    /// credited intervals.
    pub fn credit(&mut self, earned: i64) {
        self.timer_bucket = (self.timer_bucket + earned).min(TIMER_BUCKET_MAX);
        self.last_refill_at += Duration::seconds(earned * REFILL_INTERVAL_SECS);
    }

    /// Seconds until the next credit, 0 once the bucket is full.
    pub fn next_refill_seconds(&self, now: DateTime<Utc>) -> i64 {
        if self.timer_bucket >= TIMER_BUCKET_MAX {
            return 0;
        }
        let elapsed = (now - self.last_refill_at).num_seconds().max(0);
        REFILL_INTERVAL_SECS - (elapsed % REFILL_INTERVAL_SECS)
    }
}

/// What a status read reports back to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerStatus {
    pub current: i64,
    pub max: i64,
    pub earned: i64,
    pub next_refill_seconds: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_at(bucket: i64, intervals_ago: i64) -> (RefillState, DateTime<Utc>) {
        let now = Utc::now();
        let state = RefillState {
            user_id: Uuid::now_v7(),
            timer_bucket: bucket,
            last_refill_at: now - Duration::seconds(intervals_ago * REFILL_INTERVAL_SECS),
        };
        (state, now)
    }

    #[test]
    fn earns_whole_intervals_only() {
        let (state, now) = state_at(0, 0);
        assert_eq!(state.earned_since(now), 0);

        let now_plus = now + Duration::seconds(REFILL_INTERVAL_SECS - 1);
        assert_eq!(state.earned_since(now_plus), 0);

        let now_plus = now + Duration::seconds(REFILL_INTERVAL_SECS);
        assert_eq!(state.earned_since(now_plus), 1);
    }

    #[test]
    fn earned_is_capped_by_capacity() {
        let (state, now) = state_at(12, 100);
        assert_eq!(state.earned_since(now), 3);

        let (state, now) = state_at(TIMER_BUCKET_MAX, 100);
        assert_eq!(state.earned_since(now), 0);
    }

    #[test]
    fn credit_advances_watermark_by_whole_intervals() {
        let (mut state, now) = state_at(0, 5);
        let before = state.last_refill_at;
        let earned = state.earned_since(now);
        assert_eq!(earned, 5);

        state.credit(earned);
        assert_eq!(state.timer_bucket, 5);
        assert_eq!(
            state.last_refill_at - before,
            Duration::seconds(5 * REFILL_INTERVAL_SECS)
        );
    }

    #[test]
    fn fractional_progress_survives_credit() {
        let now = Utc::now();
        let mut state = RefillState {
            user_id: Uuid::now_v7(),
            timer_bucket: 0,
            last_refill_at: now
                - Duration::seconds(REFILL_INTERVAL_SECS + REFILL_INTERVAL_SECS / 2),
        };
        state.credit(state.earned_since(now));
        assert_eq!(state.timer_bucket, 1);
        // Half an interval of progress remains banked in the watermark.
        assert_eq!(
            state.next_refill_seconds(now),
            REFILL_INTERVAL_SECS - REFILL_INTERVAL_SECS / 2
        );
    }

    #[test]
    fn next_refill_is_zero_at_max() {
        let (state, now) = state_at(TIMER_BUCKET_MAX, 1);
        assert_eq!(state.next_refill_seconds(now), 0);
    }

    #[test]
    fn future_watermark_earns_nothing() {
        let (state, now) = state_at(0, -2);
        assert_eq!(state.earned_since(now), 0);
        assert_eq!(state.next_refill_seconds(now), REFILL_INTERVAL_SECS);
    }
}

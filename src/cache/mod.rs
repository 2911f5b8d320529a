// src/cache/mod.rs
pub mod memory;
pub mod redis;

pub use self::memory::MemoryCache;
pub use self::redis::RedisCache;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::error::PointError;

/// Result of one atomic check-and-decrement against the cached balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpendOutcome {
    /// Decremented; carries the new balance.
    Spent(i64),
    /// Balance present but short; carries the current balance. No mutation.
    Insufficient(i64),
    /// No cached balance for this user. No mutation.
    Miss,
}

/// One record of the advisory recent-activity ring. Not authoritative;
/// support/debug lookups only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub entry_id: Uuid,
    pub amount: i64,
    pub balance_after: i64,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Fast mirror of current balances and the serialization point for spend.
///
/// Implementors MUST make `spend` a single indivisible step: concurrent
/// callers on the same user serialize, and a failed check leaves the key
/// untouched. `seed` MUST be set-if-absent so a reseed can never clobber a
/// concurrently decremented value. `release_lock` MUST compare the owner
/// token before deleting — never an unconditional delete.
#[async_trait]
pub trait BalanceCache: Send + Sync {
    async fn spend(&self, user_id: Uuid, amount: i64) -> Result<SpendOutcome, PointError>;

    /// Set-if-absent with TTL. Returns whether this call created the key.
    async fn seed(&self, user_id: Uuid, balance: i64, ttl: Duration) -> Result<bool, PointError>;

    async fn read(&self, user_id: Uuid) -> Result<Option<i64>, PointError>;

    /// Unconditional write-through after a ledger-side balance change.
    async fn write(&self, user_id: Uuid, balance: i64, ttl: Duration) -> Result<(), PointError>;

    async fn invalidate(&self, user_id: Uuid) -> Result<(), PointError>;

    async fn push_recent(&self, user_id: Uuid, record: &ActivityRecord) -> Result<(), PointError>;

    async fn recent(&self, user_id: Uuid, limit: usize)
    -> Result<Vec<ActivityRecord>, PointError>;

    /// Non-blocking set-if-absent mutual exclusion. Fail-fast on contention.
    async fn acquire_lock(
        &self,
        name: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, PointError>;

    /// Owner-verified release. Returns whether this call deleted the lock.
    async fn release_lock(&self, name: &str, token: &str) -> Result<bool, PointError>;

    /// Atomic dedup claim. `true` means the caller owns processing and must
    /// complete or explicitly release.
    async fn claim(&self, key: &str, ttl: Duration) -> Result<bool, PointError>;

    async fn release_claim(&self, key: &str) -> Result<(), PointError>;

    /// Durable list of ledger appends that failed after an authorized spend.
    async fn enqueue_reconciliation(&self, payload: &str) -> Result<(), PointError>;

    async fn drain_reconciliation(&self, max: usize) -> Result<Vec<String>, PointError>;
}

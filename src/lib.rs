//! # ruby-ledger
//!
//! The balance subsystem behind the Ruby virtual currency: a cache-first
//! spend path with a durable audit ledger underneath.
//!
//! ## What's inside
//!
//! ### Atomic spend
//! Every spend is one indivisible check-and-decrement against the cached
//! balance, so concurrent callers on the same user serialize and the
//! balance can never go negative. A cache miss reseeds from the ledger and
//! retries exactly once.
//!
//! ### Append-only ledger
//! Every balance change — charge, use, bonus, refund — lands as a signed
//! entry with the balance it settled at. Nothing is mutated. Nothing is
//! deleted. The cache may run ahead of the ledger for a bounded window;
//! appends that fail after an authorized spend are parked on a durable
//! reconciliation queue and replayed, never silently dropped.
//!
//! ### Timer refill
//! A capped free allowance regenerates on wall-clock intervals, computed
//! lazily at read time under a short-lived, owner-checked lock — no
//! background scheduler process.
//!
//! ### Idempotent charge events
//! Externally-delivered payment events are applied at most once via
//! set-if-absent claims, with the business record independently re-verified
//! before any effect.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use ruby_ledger::{Config, RubySystem};
//!
//! let system = RubySystem::connect(&Config::from_env()?).await?;
//! let service = system.service();
//! let status = service.get_timer_status(user_id).await?;
//! ```

pub mod adapters;
pub mod balance;
pub mod cache;
pub mod config;
pub mod entry;
pub mod error;
pub mod pricing;
pub mod refill;
pub mod service;

pub use adapters::{LedgerAdapter, MemoryLedger, PostgresLedger};
pub use balance::Balance;
pub use cache::{ActivityRecord, BalanceCache, MemoryCache, RedisCache, SpendOutcome};
pub use config::Config;
pub use entry::{EntryKind, LedgerEntry, TransactionRef};
pub use error::PointError;
pub use refill::{RefillState, TimerStatus};
pub use service::{
    ChargeEventOutcome, CheckInResult, PendingCharge, PointService, SpendResult, TurnResult,
};

use std::sync::Arc;
use std::time::Duration;

/// Claim keys carry external ids and dates; hash them so cache keys stay
/// fixed-width and safe regardless of what the gateway sends.
pub(crate) fn hash_claim_key(key: &str) -> String {
    blake3::hash(key.as_bytes()).to_hex().to_string()
}

/// The process-wide resource handles behind the facade: the durable ledger
/// store and the balance cache. Build one at startup, hand out
/// [`PointService`] facades from it, and drop it at shutdown to close the
/// underlying connections.
pub struct RubySystem {
    ledger: Arc<dyn LedgerAdapter>,
    cache: Arc<dyn BalanceCache>,
    cache_ttl: Duration,
}

impl RubySystem {
    pub fn new(ledger: Arc<dyn LedgerAdapter>, cache: Arc<dyn BalanceCache>) -> Self {
        Self {
            ledger,
            cache,
            cache_ttl: Duration::from_secs(pricing::BALANCE_CACHE_TTL_SECS),
        }
    }

    /// Fully in-process system for tests and local development.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryLedger::new()), Arc::new(MemoryCache::new()))
    }

    /// Wire the Postgres pool and Redis client. Call once at startup.
    pub async fn connect(config: &Config) -> Result<Self, PointError> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.database_url)
            .await
            .map_err(|e| PointError::Storage(e.to_string()))?;
        let ledger = PostgresLedger::from_pool(pool);
        ledger.init_schema().await?;

        let cache = RedisCache::new(&config.redis_url)?.with_prefix(config.key_prefix.clone());

        let mut system = Self::new(Arc::new(ledger), Arc::new(cache));
        system.cache_ttl = Duration::from_secs(config.cache_ttl_secs);
        Ok(system)
    }

    pub fn ledger(&self) -> Arc<dyn LedgerAdapter> {
        Arc::clone(&self.ledger)
    }

    pub fn cache(&self) -> Arc<dyn BalanceCache> {
        Arc::clone(&self.cache)
    }

    /// The operation facade. Cheap to create; every facade shares this
    /// system's handles.
    pub fn service(&self) -> PointService {
        PointService::new(self.ledger(), self.cache()).with_cache_ttl(self.cache_ttl)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_key_hashing_is_stable_and_collision_resistant() {
        let a = hash_claim_key("webhook:ev_1:paid");
        let b = hash_claim_key("webhook:ev_1:paid");
        let c = hash_claim_key("webhook:ev_2:paid");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }
}

// src/cache/memory.rs
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use uuid::Uuid;

use super::{ActivityRecord, BalanceCache, SpendOutcome};
use crate::error::PointError;
use crate::pricing::RECENT_RING_LEN;

struct Slot {
    value: i64,
    expires_at: Instant,
}

struct Lock {
    token: String,
    expires_at: Instant,
}

#[derive(Default)]
struct Inner {
    balances: HashMap<Uuid, Slot>,
    recents: HashMap<Uuid, VecDeque<ActivityRecord>>,
    locks: HashMap<String, Lock>,
    claims: HashMap<String, Instant>,
    reconciliation: VecDeque<String>,
}

/// In-process cache adapter. A single mutex makes every operation
/// indivisible, which is exactly the atomicity the contract asks for.
pub struct MemoryCache {
    inner: Arc<Mutex<Inner>>,
    available: AtomicBool,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            available: AtomicBool::new(true),
        }
    }

    /// Chaos toggle: while unavailable, every operation fails the way a
    /// dropped Redis connection would.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), PointError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(PointError::Cache("connection refused".to_string()))
        }
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

fn live_balance(inner: &mut Inner, user_id: Uuid, now: Instant) -> Option<i64> {
    let slot = inner
        .balances
        .get(&user_id)
        .map(|slot| (slot.value, slot.expires_at > now));
    match slot {
        Some((value, true)) => Some(value),
        Some((_, false)) => {
            inner.balances.remove(&user_id);
            None
        }
        None => None,
    }
}

#[async_trait]
impl BalanceCache for MemoryCache {
    async fn spend(&self, user_id: Uuid, amount: i64) -> Result<SpendOutcome, PointError> {
        self.check_available()?;
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();

        if live_balance(&mut inner, user_id, now).is_none() {
            return Ok(SpendOutcome::Miss);
        }
        let Some(slot) = inner.balances.get_mut(&user_id) else {
            return Ok(SpendOutcome::Miss);
        };
        if slot.value < amount {
            return Ok(SpendOutcome::Insufficient(slot.value));
        }
        slot.value -= amount;
        Ok(SpendOutcome::Spent(slot.value))
    }

    async fn seed(&self, user_id: Uuid, balance: i64, ttl: Duration) -> Result<bool, PointError> {
        self.check_available()?;
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();

        if live_balance(&mut inner, user_id, now).is_some() {
            return Ok(false);
        }
        inner.balances.insert(
            user_id,
            Slot {
                value: balance,
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn read(&self, user_id: Uuid) -> Result<Option<i64>, PointError> {
        self.check_available()?;
        let mut inner = self.inner.lock().unwrap();
        Ok(live_balance(&mut inner, user_id, Instant::now()))
    }

    async fn write(&self, user_id: Uuid, balance: i64, ttl: Duration) -> Result<(), PointError> {
        self.check_available()?;
        let mut inner = self.inner.lock().unwrap();
        inner.balances.insert(
            user_id,
            Slot {
                value: balance,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn invalidate(&self, user_id: Uuid) -> Result<(), PointError> {
        self.check_available()?;
        let mut inner = self.inner.lock().unwrap();
        inner.balances.remove(&user_id);
        Ok(())
    }

    async fn push_recent(&self, user_id: Uuid, record: &ActivityRecord) -> Result<(), PointError> {
        self.check_available()?;
        let mut inner = self.inner.lock().unwrap();
        let ring = inner.recents.entry(user_id).or_default();
        ring.push_front(record.clone());
        ring.truncate(RECENT_RING_LEN);
        Ok(())
    }

    async fn recent(
        &self,
        user_id: Uuid,
        limit: usize,
    ) -> Result<Vec<ActivityRecord>, PointError> {
        self.check_available()?;
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .recents
            .get(&user_id)
            .map(|ring| ring.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn acquire_lock(
        &self,
        name: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, PointError> {
        self.check_available()?;
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();

        if let Some(lock) = inner.locks.get(name) {
            if lock.expires_at > now {
                return Ok(false);
            }
        }
        inner.locks.insert(
            name.to_string(),
            Lock {
                token: token.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn release_lock(&self, name: &str, token: &str) -> Result<bool, PointError> {
        self.check_available()?;
        let mut inner = self.inner.lock().unwrap();
        let owned = inner
            .locks
            .get(name)
            .is_some_and(|lock| lock.token == token);
        if owned {
            inner.locks.remove(name);
        }
        Ok(owned)
    }

    async fn claim(&self, key: &str, ttl: Duration) -> Result<bool, PointError> {
        self.check_available()?;
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();

        if let Some(expires_at) = inner.claims.get(key) {
            if *expires_at > now {
                return Ok(false);
            }
        }
        inner.claims.insert(key.to_string(), now + ttl);
        Ok(true)
    }

    async fn release_claim(&self, key: &str) -> Result<(), PointError> {
        self.check_available()?;
        let mut inner = self.inner.lock().unwrap();
        inner.claims.remove(key);
        Ok(())
    }

    async fn enqueue_reconciliation(&self, payload: &str) -> Result<(), PointError> {
        self.check_available()?;
        let mut inner = self.inner.lock().unwrap();
        inner.reconciliation.push_back(payload.to_string());
        Ok(())
    }

    async fn drain_reconciliation(&self, max: usize) -> Result<Vec<String>, PointError> {
        self.check_available()?;
        let mut inner = self.inner.lock().unwrap();
        let take = max.min(inner.reconciliation.len());
        Ok(inner.reconciliation.drain(..take).collect())
    }
}

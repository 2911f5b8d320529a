// src/service.rs
use chrono::{Timelike, Utc};
use metrics::{counter, histogram};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::adapters::LedgerAdapter;
use crate::cache::{ActivityRecord, BalanceCache, SpendOutcome};
use crate::entry::{EntryKind, LedgerEntry, TransactionRef};
use crate::error::PointError;
use crate::hash_claim_key;
use crate::pricing::{
    self, BALANCE_CACHE_TTL_SECS, CHECKIN_REWARD, REFILL_LOCK_TTL_MS, TIMER_BUCKET_MAX,
    WEBHOOK_CLAIM_TTL_SECS,
};
use crate::refill::{RefillState, TimerStatus};

/// Outcome of an atomic spend. Insufficient balance is an expected business
/// outcome, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpendResult {
    Spent { balance: i64, entry_id: Uuid },
    Insufficient { balance: i64 },
}

/// Outcome of a chat-turn deduction. Zero-cost models deduct nothing and
/// carry no entry id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnResult {
    Deducted { cost: i64, entry_id: Option<Uuid> },
    Insufficient { balance: i64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckInResult {
    pub already_checked_in: bool,
    pub balance: i64,
    pub reward: i64,
}

/// A charge event that is still pending on the business side, as confirmed
/// by the caller's `verify` closure.
#[derive(Debug, Clone)]
pub struct PendingCharge {
    pub user_id: Uuid,
    pub amount: i64,
    pub description: String,
    pub reference: Option<TransactionRef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargeEventOutcome {
    Applied { balance: i64 },
    /// The claim was already held; redelivery is expected and a no-op.
    AlreadyProcessed,
    /// Claimed, but the business record is no longer pending. No effect.
    Ignored,
}

enum CachePath {
    Spent(i64),
    Insufficient(i64),
    Down(String),
}

/// The only entry point external callers use. Serializes spend through the
/// cache, keeps the ledger as audit truth, and owns refill, check-in and
/// webhook idempotency.
#[derive(Clone)]
pub struct PointService {
    ledger: Arc<dyn LedgerAdapter>,
    cache: Arc<dyn BalanceCache>,
    cache_ttl: Duration,
}

impl PointService {
    pub fn new(ledger: Arc<dyn LedgerAdapter>, cache: Arc<dyn BalanceCache>) -> Self {
        Self {
            ledger,
            cache,
            cache_ttl: Duration::from_secs(BALANCE_CACHE_TTL_SECS),
        }
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    // ==================== Balance ====================

    pub async fn get_balance(&self, user_id: Uuid) -> Result<i64, PointError> {
        match self.cache.read(user_id).await {
            Ok(Some(balance)) => return Ok(balance),
            Ok(None) => {}
            Err(e) => {
                warn!("balance cache unavailable, reading ledger directly: {e}");
                return self.ledger.balance(user_id).await;
            }
        }

        let balance = self.ledger.balance(user_id).await?;
        if let Err(e) = self.cache.seed(user_id, balance, self.cache_ttl).await {
            debug!("balance reseed failed for {user_id}: {e}");
        }
        Ok(balance)
    }

    pub async fn charge_points(
        &self,
        user_id: Uuid,
        amount: i64,
        description: &str,
        reference: Option<TransactionRef>,
    ) -> Result<i64, PointError> {
        self.credit(user_id, amount, EntryKind::Charge, description, reference)
            .await
    }

    pub async fn refund_points(
        &self,
        user_id: Uuid,
        amount: i64,
        description: &str,
        reference: Option<TransactionRef>,
    ) -> Result<i64, PointError> {
        let description = format!("[refund] {description}");
        self.credit(user_id, amount, EntryKind::Refund, &description, reference)
            .await
    }

    async fn credit(
        &self,
        user_id: Uuid,
        amount: i64,
        kind: EntryKind,
        description: &str,
        reference: Option<TransactionRef>,
    ) -> Result<i64, PointError> {
        if amount <= 0 {
            return Err(PointError::InvalidAmount);
        }

        let (_, balance) = self
            .ledger
            .charge(user_id, amount, kind, description, reference)
            .await?;

        counter!("ruby.charge.total", "kind" => kind.as_str()).increment(1);
        histogram!("ruby.charge.amount").record(amount as f64);

        self.write_through(user_id, balance).await;
        Ok(balance)
    }

    // ==================== Atomic spend ====================

    pub async fn use_points_atomic(
        &self,
        user_id: Uuid,
        amount: i64,
        reason: &str,
        reference: Option<TransactionRef>,
    ) -> Result<SpendResult, PointError> {
        if amount <= 0 {
            return Err(PointError::InvalidAmount);
        }

        let path = self.spend_with_reseed(user_id, amount).await?;
        match path {
            CachePath::Down(msg) => {
                warn!("balance cache unavailable, spending against ledger: {msg}");
                counter!("ruby.spend.total", "status" => "degraded").increment(1);
                self.spend_via_ledger(user_id, amount, reason, reference)
                    .await
            }
            CachePath::Insufficient(balance) => {
                counter!("ruby.spend.total", "status" => "insufficient").increment(1);
                Ok(SpendResult::Insufficient { balance })
            }
            CachePath::Spent(balance) => {
                let entry = LedgerEntry::use_entry(
                    user_id,
                    amount,
                    balance,
                    reason.to_string(),
                    reference,
                );
                self.finish_authorized_spend(&entry).await;

                counter!("ruby.spend.total", "status" => "success").increment(1);
                histogram!("ruby.spend.amount").record(amount as f64);
                Ok(SpendResult::Spent {
                    balance,
                    entry_id: entry.id,
                })
            }
        }
    }

    /// One atomic attempt, with exactly one reseed-and-retry on a cache
    /// miss. A second miss is a hard failure; transport errors surface as
    /// `Down` so the caller can degrade to the ledger.
    async fn spend_with_reseed(
        &self,
        user_id: Uuid,
        amount: i64,
    ) -> Result<CachePath, PointError> {
        let first = match self.cache.spend(user_id, amount).await {
            Ok(outcome) => outcome,
            Err(PointError::Cache(msg)) => return Ok(CachePath::Down(msg)),
            Err(e) => return Err(e),
        };

        let outcome = match first {
            SpendOutcome::Miss => {
                let balance = self.ledger.balance(user_id).await?;
                match self.cache.seed(user_id, balance, self.cache_ttl).await {
                    Ok(_) => {}
                    Err(PointError::Cache(msg)) => return Ok(CachePath::Down(msg)),
                    Err(e) => return Err(e),
                }
                debug!("reseeded balance cache for {user_id} at {balance}");

                match self.cache.spend(user_id, amount).await {
                    Ok(SpendOutcome::Miss) => {
                        return Err(PointError::Cache(
                            "balance key missing after reseed".to_string(),
                        ));
                    }
                    Ok(outcome) => outcome,
                    Err(PointError::Cache(msg)) => return Ok(CachePath::Down(msg)),
                    Err(e) => return Err(e),
                }
            }
            outcome => outcome,
        };

        match outcome {
            SpendOutcome::Spent(balance) => Ok(CachePath::Spent(balance)),
            SpendOutcome::Insufficient(balance) => Ok(CachePath::Insufficient(balance)),
            SpendOutcome::Miss => Err(PointError::Cache(
                "balance key missing after reseed".to_string(),
            )),
        }
    }

    /// The cache has authorized and applied the decrement; log it to the
    /// ring and append to the ledger. The spend result is already final:
    /// an append failure parks the entry for reconciliation instead of
    /// propagating.
    async fn finish_authorized_spend(&self, entry: &LedgerEntry) {
        let record = ActivityRecord {
            entry_id: entry.id,
            amount: entry.amount,
            balance_after: entry.balance_after,
            reason: entry.description.clone(),
            at: entry.created_at,
        };
        if let Err(e) = self.cache.push_recent(entry.user_id, &record).await {
            debug!("recent-activity push failed for {}: {e}", entry.user_id);
        }

        if let Err(e) = self.ledger.record_use(entry).await {
            warn!(
                "ledger append failed after authorized spend for {}: {e}",
                entry.user_id
            );
            match serde_json::to_string(entry) {
                Ok(payload) => {
                    if let Err(qe) = self.cache.enqueue_reconciliation(&payload).await {
                        warn!("reconciliation enqueue failed, drift until next reseed: {qe}");
                    } else {
                        counter!("ruby.reconciliation.enqueued").increment(1);
                    }
                }
                Err(se) => warn!("could not serialize entry for reconciliation: {se}"),
            }
        }
    }

    /// Degraded path when the cache cannot execute: read-check-write
    /// against the ledger alone. Availability over strict serialization.
    async fn spend_via_ledger(
        &self,
        user_id: Uuid,
        amount: i64,
        reason: &str,
        reference: Option<TransactionRef>,
    ) -> Result<SpendResult, PointError> {
        let balance = self.ledger.balance(user_id).await?;
        if balance < amount {
            return Ok(SpendResult::Insufficient { balance });
        }

        let entry = LedgerEntry::use_entry(
            user_id,
            amount,
            balance - amount,
            reason.to_string(),
            reference,
        );
        self.ledger.record_use(&entry).await?;

        Ok(SpendResult::Spent {
            balance: balance - amount,
            entry_id: entry.id,
        })
    }

    /// Replay parked ledger appends. Returns how many entries were healed;
    /// stops and re-parks on the first replay failure.
    pub async fn drain_reconciliation(&self, max: usize) -> Result<usize, PointError> {
        let payloads = self.cache.drain_reconciliation(max).await?;
        let mut healed = 0;

        for payload in payloads {
            let entry: LedgerEntry = match serde_json::from_str(&payload) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("dropping unreadable reconciliation payload: {e}");
                    continue;
                }
            };
            if let Err(e) = self.ledger.record_use(&entry).await {
                warn!("reconciliation replay failed, re-parking entry {}: {e}", entry.id);
                self.cache.enqueue_reconciliation(&payload).await?;
                return Ok(healed);
            }
            healed += 1;
        }
        Ok(healed)
    }

    // ==================== Chat turns ====================

    pub async fn deduct_chat_turn(
        &self,
        user_id: Uuid,
        model_id: &str,
    ) -> Result<TurnResult, PointError> {
        let cost = pricing::turn_cost(model_id);
        if cost == 0 {
            return Ok(TurnResult::Deducted {
                cost: 0,
                entry_id: None,
            });
        }

        let reason = format!("chat turn ({model_id})");
        match self
            .use_points_atomic(
                user_id,
                cost,
                &reason,
                Some(TransactionRef::new("chat_model", model_id)),
            )
            .await?
        {
            SpendResult::Spent { entry_id, .. } => Ok(TurnResult::Deducted {
                cost,
                entry_id: Some(entry_id),
            }),
            SpendResult::Insufficient { balance } => Ok(TurnResult::Insufficient { balance }),
        }
    }

    /// Compensating action for a downstream model failure after a
    /// successful deduction. Returns `(refunded_amount, new_balance)`.
    pub async fn refund_chat_turn(
        &self,
        user_id: Uuid,
        model_id: &str,
        entry_id: Uuid,
    ) -> Result<(i64, i64), PointError> {
        let cost = pricing::turn_cost(model_id);
        if cost == 0 {
            return Ok((0, self.get_balance(user_id).await?));
        }

        let balance = self
            .refund_points(
                user_id,
                cost,
                &format!("chat turn ({model_id})"),
                Some(TransactionRef::new("ledger_entry", entry_id.to_string())),
            )
            .await?;
        Ok((cost, balance))
    }

    // ==================== Daily check-in ====================

    pub async fn daily_check_in(&self, user_id: Uuid) -> Result<CheckInResult, PointError> {
        let now_kst = Utc::now().with_timezone(&pricing::kst());
        let date = now_kst.date_naive();
        let remaining = 86_400 - i64::from(now_kst.num_seconds_from_midnight());
        let ttl = Duration::from_secs(remaining.max(1) as u64);

        let key = hash_claim_key(&format!("checkin:{user_id}:{date}"));
        if !self.cache.claim(&key, ttl).await? {
            let balance = self.get_balance(user_id).await?;
            return Ok(CheckInResult {
                already_checked_in: true,
                balance,
                reward: 0,
            });
        }

        match self
            .ledger
            .charge(
                user_id,
                CHECKIN_REWARD,
                EntryKind::Bonus,
                "daily check-in",
                Some(TransactionRef::new("check_in", date.to_string())),
            )
            .await
        {
            Ok((_, balance)) => {
                self.write_through(user_id, balance).await;
                Ok(CheckInResult {
                    already_checked_in: false,
                    balance,
                    reward: CHECKIN_REWARD,
                })
            }
            Err(e) => {
                // Release so a retry today is not permanently blocked.
                if let Err(re) = self.cache.release_claim(&key).await {
                    warn!("check-in claim release failed for {user_id}: {re}");
                }
                Err(e)
            }
        }
    }

    // ==================== Timer refill ====================

    pub async fn get_timer_status(&self, user_id: Uuid) -> Result<TimerStatus, PointError> {
        let now = Utc::now();

        let lock_name = format!("refill:{user_id}");
        let token = Uuid::now_v7().to_string();
        let ttl = Duration::from_millis(REFILL_LOCK_TTL_MS);

        let acquired = match self.cache.acquire_lock(&lock_name, &token, ttl).await {
            Ok(acquired) => acquired,
            Err(e) => {
                warn!("refill lock unavailable for {user_id}, skipping credit: {e}");
                false
            }
        };
        if !acquired {
            debug!("refill lock contended for {user_id}, reporting persisted state");
            let state = self.ledger.refill_state(user_id).await?;
            return Ok(TimerStatus {
                current: state.timer_bucket,
                max: TIMER_BUCKET_MAX,
                earned: 0,
                next_refill_seconds: state.next_refill_seconds(now),
            });
        }

        // State is read under the lock: a reader that lost the race to a
        // just-finished credit sees the advanced watermark, not a stale one.
        let credited = match self.ledger.refill_state(user_id).await {
            Ok(mut state) => self
                .credit_refill(&mut state, now)
                .await
                .map(|earned| (state, earned)),
            Err(e) => Err(e),
        };
        if let Err(e) = self.cache.release_lock(&lock_name, &token).await {
            warn!("refill lock release failed for {user_id}: {e}");
        }
        let (state, earned) = credited?;

        Ok(TimerStatus {
            current: state.timer_bucket,
            max: TIMER_BUCKET_MAX,
            earned,
            next_refill_seconds: state.next_refill_seconds(now),
        })
    }

    async fn credit_refill(
        &self,
        state: &mut RefillState,
        now: chrono::DateTime<Utc>,
    ) -> Result<i64, PointError> {
        let earned = state.earned_since(now);
        if earned == 0 {
            return Ok(0);
        }

        let (_, balance) = self
            .ledger
            .charge(
                state.user_id,
                earned,
                EntryKind::Bonus,
                "timer refill",
                Some(TransactionRef::new(
                    "refill",
                    state.last_refill_at.to_rfc3339(),
                )),
            )
            .await?;

        state.credit(earned);
        self.ledger.store_refill_state(state).await?;
        self.write_through(state.user_id, balance).await;

        Ok(earned)
    }

    // ==================== External charge events ====================

    /// Apply an externally-delivered charge event at most once. `verify`
    /// must re-check the referenced business record and return it only if
    /// it is still pending; the claim alone is not trusted against
    /// key collisions or TTL races.
    pub async fn apply_charge_event<F, Fut>(
        &self,
        event_id: &str,
        status: &str,
        verify: F,
    ) -> Result<ChargeEventOutcome, PointError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<PendingCharge>, PointError>>,
    {
        let key = hash_claim_key(&format!("webhook:{event_id}:{status}"));
        let ttl = Duration::from_secs(WEBHOOK_CLAIM_TTL_SECS);

        if !self.cache.claim(&key, ttl).await? {
            return Ok(ChargeEventOutcome::AlreadyProcessed);
        }

        let pending = match verify().await {
            Ok(pending) => pending,
            Err(e) => {
                self.release_claim_or_warn(&key).await;
                return Err(e);
            }
        };
        let Some(charge) = pending else {
            // Not pending anymore: effect was applied elsewhere. Keep the
            // claim so redeliveries stay no-ops.
            return Ok(ChargeEventOutcome::Ignored);
        };

        if charge.amount <= 0 {
            self.release_claim_or_warn(&key).await;
            return Err(PointError::InvalidAmount);
        }

        match self
            .ledger
            .charge(
                charge.user_id,
                charge.amount,
                EntryKind::Charge,
                &charge.description,
                charge.reference,
            )
            .await
        {
            Ok((_, balance)) => {
                self.write_through(charge.user_id, balance).await;
                Ok(ChargeEventOutcome::Applied { balance })
            }
            Err(e) => {
                self.release_claim_or_warn(&key).await;
                Err(e)
            }
        }
    }

    async fn release_claim_or_warn(&self, key: &str) {
        if let Err(e) = self.cache.release_claim(key).await {
            warn!("claim release failed, retries blocked until TTL: {e}");
        }
    }

    // ==================== Queries ====================

    /// Transaction history from the ledger, newest first.
    pub async fn transactions(
        &self,
        user_id: Uuid,
        kind: Option<EntryKind>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<LedgerEntry>, PointError> {
        self.ledger.transactions(user_id, kind, limit, offset).await
    }

    /// Advisory recent-spend ring from the cache, newest first.
    pub async fn recent_activity(
        &self,
        user_id: Uuid,
        limit: usize,
    ) -> Result<Vec<ActivityRecord>, PointError> {
        self.cache.recent(user_id, limit).await
    }

    async fn write_through(&self, user_id: Uuid, balance: i64) {
        if let Err(e) = self.cache.write(user_id, balance, self.cache_ttl).await {
            warn!("cache write-through failed for {user_id}: {e}");
        }
    }
}

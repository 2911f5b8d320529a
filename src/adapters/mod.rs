// src/adapters/mod.rs
pub mod memory;
pub mod postgres;

pub use memory::MemoryLedger;
pub use postgres::PostgresLedger;

use async_trait::async_trait;
use uuid::Uuid;

use crate::entry::{EntryKind, LedgerEntry, TransactionRef};
use crate::error::PointError;
use crate::refill::RefillState;

/// Durable record of balances and their signed transaction history, the
/// source of audit truth.
///
/// Implementors MUST:
/// 1. make `charge` transactional: balance bump and entry append commit or
///    roll back together
/// 2. make `record_use` reconcile the balance row to the entry's
///    `balance_after` (the cache has already authorized the spend)
/// 3. never mutate or delete an appended entry
#[async_trait]
pub trait LedgerAdapter: Send + Sync {
    /// Credit the balance and append an entry of the given kind. Used for
    /// payment top-ups, subscription grants, refunds, check-in bonuses and
    /// refill credits. Returns the entry id and the new balance.
    async fn charge(
        &self,
        user_id: Uuid,
        amount: i64,
        kind: EntryKind,
        description: &str,
        reference: Option<TransactionRef>,
    ) -> Result<(Uuid, i64), PointError>;

    /// Append a pre-built `Use` entry and reconcile the balance row to its
    /// `balance_after`. The entry id is caller-assigned so a replay from
    /// the reconciliation queue stays idempotent at the call site.
    async fn record_use(&self, entry: &LedgerEntry) -> Result<(), PointError>;

    /// Current balance, 0 when the user has no row.
    async fn balance(&self, user_id: Uuid) -> Result<i64, PointError>;

    /// Transaction history, newest first.
    async fn transactions(
        &self,
        user_id: Uuid,
        kind: Option<EntryKind>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<LedgerEntry>, PointError>;

    /// Regeneration progress; lazily created on first read.
    async fn refill_state(&self, user_id: Uuid) -> Result<RefillState, PointError>;

    async fn store_refill_state(&self, state: &RefillState) -> Result<(), PointError>;
}

// src/adapters/memory.rs
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use super::LedgerAdapter;
use crate::balance::Balance;
use crate::entry::{EntryKind, LedgerEntry, TransactionRef};
use crate::error::PointError;
use crate::refill::RefillState;

#[derive(Default)]
struct Store {
    balances: HashMap<Uuid, Balance>,
    entries: Vec<LedgerEntry>,
    refill_states: HashMap<Uuid, RefillState>,
}

/// In-memory ledger store. One mutex per store gives the same
/// balance-row-and-entry atomicity the Postgres adapter gets from a
/// database transaction.
pub struct MemoryLedger {
    store: Arc<Mutex<Store>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self {
            store: Arc::new(Mutex::new(Store::default())),
        }
    }

    /// Number of appended entries, across all users. Test visibility only.
    pub fn entry_count(&self) -> usize {
        self.store.lock().unwrap().entries.len()
    }
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LedgerAdapter for MemoryLedger {
    async fn charge(
        &self,
        user_id: Uuid,
        amount: i64,
        kind: EntryKind,
        description: &str,
        reference: Option<TransactionRef>,
    ) -> Result<(Uuid, i64), PointError> {
        let mut store = self.store.lock().unwrap();

        let balance = store
            .balances
            .entry(user_id)
            .or_insert_with(|| Balance::new(user_id));
        balance.amount += amount;
        balance.updated_at = Utc::now();
        let new_balance = balance.amount;

        let entry = LedgerEntry::new(
            user_id,
            kind,
            amount,
            new_balance,
            description.to_string(),
            reference,
        );
        let entry_id = entry.id;
        store.entries.push(entry);

        Ok((entry_id, new_balance))
    }

    async fn record_use(&self, entry: &LedgerEntry) -> Result<(), PointError> {
        let mut store = self.store.lock().unwrap();

        let balance = store
            .balances
            .entry(entry.user_id)
            .or_insert_with(|| Balance::new(entry.user_id));
        balance.amount = entry.balance_after;
        balance.updated_at = Utc::now();

        store.entries.push(entry.clone());
        Ok(())
    }

    async fn balance(&self, user_id: Uuid) -> Result<i64, PointError> {
        let store = self.store.lock().unwrap();
        Ok(store.balances.get(&user_id).map(|b| b.amount).unwrap_or(0))
    }

    async fn transactions(
        &self,
        user_id: Uuid,
        kind: Option<EntryKind>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<LedgerEntry>, PointError> {
        let store = self.store.lock().unwrap();
        Ok(store
            .entries
            .iter()
            .rev()
            .filter(|e| e.user_id == user_id && kind.is_none_or(|k| e.kind == k))
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn refill_state(&self, user_id: Uuid) -> Result<RefillState, PointError> {
        let mut store = self.store.lock().unwrap();
        Ok(store
            .refill_states
            .entry(user_id)
            .or_insert_with(|| RefillState::new(user_id, Utc::now()))
            .clone())
    }

    async fn store_refill_state(&self, state: &RefillState) -> Result<(), PointError> {
        let mut store = self.store.lock().unwrap();
        store.refill_states.insert(state.user_id, state.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn charge_appends_and_credits() {
        let ledger = MemoryLedger::new();
        let user = Uuid::now_v7();

        let (_, balance) = ledger
            .charge(user, 100, EntryKind::Charge, "top-up", None)
            .await
            .unwrap();
        assert_eq!(balance, 100);
        assert_eq!(ledger.balance(user).await.unwrap(), 100);
        assert_eq!(ledger.entry_count(), 1);
    }

    #[tokio::test]
    async fn record_use_reconciles_to_balance_after() {
        let ledger = MemoryLedger::new();
        let user = Uuid::now_v7();
        ledger
            .charge(user, 100, EntryKind::Charge, "top-up", None)
            .await
            .unwrap();

        let entry = LedgerEntry::use_entry(user, 30, 70, "chat turn".to_string(), None);
        ledger.record_use(&entry).await.unwrap();
        assert_eq!(ledger.balance(user).await.unwrap(), 70);
    }

    #[tokio::test]
    async fn transactions_filter_and_page_newest_first() {
        let ledger = MemoryLedger::new();
        let user = Uuid::now_v7();
        ledger
            .charge(user, 100, EntryKind::Charge, "top-up", None)
            .await
            .unwrap();
        ledger
            .charge(user, 5, EntryKind::Bonus, "check-in", None)
            .await
            .unwrap();
        let entry = LedgerEntry::use_entry(user, 30, 75, "chat turn".to_string(), None);
        ledger.record_use(&entry).await.unwrap();

        let all = ledger.transactions(user, None, 10, 0).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].kind, EntryKind::Use);

        let bonuses = ledger
            .transactions(user, Some(EntryKind::Bonus), 10, 0)
            .await
            .unwrap();
        assert_eq!(bonuses.len(), 1);

        let page = ledger.transactions(user, None, 1, 1).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].kind, EntryKind::Bonus);
    }

    #[tokio::test]
    async fn refill_state_is_created_lazily() {
        let ledger = MemoryLedger::new();
        let user = Uuid::now_v7();

        let state = ledger.refill_state(user).await.unwrap();
        assert_eq!(state.timer_bucket, 0);

        let again = ledger.refill_state(user).await.unwrap();
        assert_eq!(again.last_refill_at, state.last_refill_at);
    }
}

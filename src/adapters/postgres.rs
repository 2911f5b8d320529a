// src/adapters/postgres.rs
use async_trait::async_trait;
use sqlx::Row;
use uuid::Uuid;

use super::LedgerAdapter;
use crate::entry::{EntryKind, LedgerEntry, TransactionRef};
use crate::error::PointError;
use crate::refill::RefillState;

/// Postgres-backed ledger store. Every write locks the balance row with
/// `SELECT ... FOR UPDATE` inside a transaction, so the entry append and
/// the balance change commit or roll back together.
pub struct PostgresLedger {
    pool: sqlx::PgPool,
}

impl PostgresLedger {
    pub fn from_pool(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    /// Shared process-wide pool; close it at shutdown.
    pub fn pool(&self) -> &sqlx::PgPool {
        &self.pool
    }

    pub async fn init_schema(&self) -> Result<(), PointError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| PointError::Storage(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ruby_balances (
                user_id UUID PRIMARY KEY,
                amount BIGINT NOT NULL DEFAULT 0 CHECK (amount >= 0),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(|e| PointError::Storage(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ruby_ledger_entries (
                id UUID PRIMARY KEY,
                user_id UUID NOT NULL,
                kind TEXT NOT NULL CHECK (kind IN ('charge', 'use', 'bonus', 'refund')),
                amount BIGINT NOT NULL,
                balance_after BIGINT NOT NULL,
                description TEXT NOT NULL,
                reference_type TEXT,
                reference_id TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(|e| PointError::Storage(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_ruby_entries_user_created
            ON ruby_ledger_entries(user_id, created_at DESC)
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(|e| PointError::Storage(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ruby_refill_states (
                user_id UUID PRIMARY KEY,
                timer_bucket BIGINT NOT NULL DEFAULT 0,
                last_refill_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(|e| PointError::Storage(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| PointError::Storage(e.to_string()))?;

        Ok(())
    }

    async fn lock_balance_row(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        user_id: Uuid,
    ) -> Result<i64, PointError> {
        sqlx::query(
            r#"
            INSERT INTO ruby_balances (user_id, amount)
            VALUES ($1, 0)
            ON CONFLICT (user_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .execute(&mut **tx)
        .await
        .map_err(|e| PointError::Storage(e.to_string()))?;

        sqlx::query_scalar(
            r#"
            SELECT amount FROM ruby_balances
            WHERE user_id = $1
            FOR UPDATE
            "#,
        )
        .bind(user_id)
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| PointError::Storage(e.to_string()))
    }

    async fn insert_entry(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        entry: &LedgerEntry,
    ) -> Result<(), PointError> {
        sqlx::query(
            r#"
            INSERT INTO ruby_ledger_entries
                (id, user_id, kind, amount, balance_after, description,
                 reference_type, reference_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(entry.id)
        .bind(entry.user_id)
        .bind(entry.kind.as_str())
        .bind(entry.amount)
        .bind(entry.balance_after)
        .bind(&entry.description)
        .bind(entry.reference.as_ref().map(|r| r.ref_type.as_str()))
        .bind(entry.reference.as_ref().map(|r| r.ref_id.as_str()))
        .bind(entry.created_at)
        .execute(&mut **tx)
        .await
        .map_err(|e| PointError::Storage(e.to_string()))?;

        Ok(())
    }

    fn entry_from_row(row: &sqlx::postgres::PgRow) -> Result<LedgerEntry, PointError> {
        let kind_raw: String = row
            .try_get("kind")
            .map_err(|e| PointError::Storage(e.to_string()))?;
        let kind = EntryKind::parse(&kind_raw)
            .ok_or_else(|| PointError::Storage(format!("unknown entry kind: {kind_raw}")))?;

        let reference_type: Option<String> = row
            .try_get("reference_type")
            .map_err(|e| PointError::Storage(e.to_string()))?;
        let reference_id: Option<String> = row
            .try_get("reference_id")
            .map_err(|e| PointError::Storage(e.to_string()))?;
        let reference = match (reference_type, reference_id) {
            (Some(ref_type), Some(ref_id)) => Some(TransactionRef { ref_type, ref_id }),
            _ => None,
        };

        Ok(LedgerEntry {
            id: row
                .try_get("id")
                .map_err(|e| PointError::Storage(e.to_string()))?,
            user_id: row
                .try_get("user_id")
                .map_err(|e| PointError::Storage(e.to_string()))?,
            kind,
            amount: row
                .try_get("amount")
                .map_err(|e| PointError::Storage(e.to_string()))?,
            balance_after: row
                .try_get("balance_after")
                .map_err(|e| PointError::Storage(e.to_string()))?,
            description: row
                .try_get("description")
                .map_err(|e| PointError::Storage(e.to_string()))?,
            reference,
            created_at: row
                .try_get("created_at")
                .map_err(|e| PointError::Storage(e.to_string()))?,
        })
    }
}

#[async_trait]
impl LedgerAdapter for PostgresLedger {
    async fn charge(
        &self,
        user_id: Uuid,
        amount: i64,
        kind: EntryKind,
        description: &str,
        reference: Option<TransactionRef>,
    ) -> Result<(Uuid, i64), PointError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| PointError::Storage(e.to_string()))?;

        let current = Self::lock_balance_row(&mut tx, user_id).await?;
        let new_balance = current + amount;

        sqlx::query(
            r#"
            UPDATE ruby_balances
            SET amount = $2, updated_at = NOW()
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .bind(new_balance)
        .execute(&mut *tx)
        .await
        .map_err(|e| PointError::Storage(e.to_string()))?;

        let entry = LedgerEntry::new(
            user_id,
            kind,
            amount,
            new_balance,
            description.to_string(),
            reference,
        );
        Self::insert_entry(&mut tx, &entry).await?;

        tx.commit()
            .await
            .map_err(|e| PointError::Storage(e.to_string()))?;

        Ok((entry.id, new_balance))
    }

    async fn record_use(&self, entry: &LedgerEntry) -> Result<(), PointError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| PointError::Storage(e.to_string()))?;

        // The cache already authorized this spend; reconcile, don't re-check.
        Self::lock_balance_row(&mut tx, entry.user_id).await?;

        sqlx::query(
            r#"
            UPDATE ruby_balances
            SET amount = $2, updated_at = NOW()
            WHERE user_id = $1
            "#,
        )
        .bind(entry.user_id)
        .bind(entry.balance_after)
        .execute(&mut *tx)
        .await
        .map_err(|e| PointError::Storage(e.to_string()))?;

        Self::insert_entry(&mut tx, entry).await?;

        tx.commit()
            .await
            .map_err(|e| PointError::Storage(e.to_string()))?;

        Ok(())
    }

    async fn balance(&self, user_id: Uuid) -> Result<i64, PointError> {
        let amount: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT amount FROM ruby_balances
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| PointError::Storage(e.to_string()))?;

        Ok(amount.unwrap_or(0))
    }

    async fn transactions(
        &self,
        user_id: Uuid,
        kind: Option<EntryKind>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<LedgerEntry>, PointError> {
        let rows = match kind {
            Some(kind) => {
                sqlx::query(
                    r#"
                    SELECT id, user_id, kind, amount, balance_after, description,
                           reference_type, reference_id, created_at
                    FROM ruby_ledger_entries
                    WHERE user_id = $1 AND kind = $2
                    ORDER BY created_at DESC
                    LIMIT $3 OFFSET $4
                    "#,
                )
                .bind(user_id)
                .bind(kind.as_str())
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT id, user_id, kind, amount, balance_after, description,
                           reference_type, reference_id, created_at
                    FROM ruby_ledger_entries
                    WHERE user_id = $1
                    ORDER BY created_at DESC
                    LIMIT $2 OFFSET $3
                    "#,
                )
                .bind(user_id)
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(|e| PointError::Storage(e.to_string()))?;

        rows.iter().map(Self::entry_from_row).collect()
    }

    async fn refill_state(&self, user_id: Uuid) -> Result<RefillState, PointError> {
        sqlx::query(
            r#"
            INSERT INTO ruby_refill_states (user_id, timer_bucket, last_refill_at)
            VALUES ($1, 0, NOW())
            ON CONFLICT (user_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .execute(&self.pool)
        .await
        .map_err(|e| PointError::Storage(e.to_string()))?;

        let row = sqlx::query(
            r#"
            SELECT timer_bucket, last_refill_at FROM ruby_refill_states
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| PointError::Storage(e.to_string()))?;

        Ok(RefillState {
            user_id,
            timer_bucket: row
                .try_get("timer_bucket")
                .map_err(|e| PointError::Storage(e.to_string()))?,
            last_refill_at: row
                .try_get("last_refill_at")
                .map_err(|e| PointError::Storage(e.to_string()))?,
        })
    }

    async fn store_refill_state(&self, state: &RefillState) -> Result<(), PointError> {
        sqlx::query(
            r#"
            INSERT INTO ruby_refill_states (user_id, timer_bucket, last_refill_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id) DO UPDATE
            SET timer_bucket = $2, last_refill_at = $3
            "#,
        )
        .bind(state.user_id)
        .bind(state.timer_bucket)
        .bind(state.last_refill_at)
        .execute(&self.pool)
        .await
        .map_err(|e| PointError::Storage(e.to_string()))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env_nonempty(key: &str) -> Option<String> {
        std::env::var(key)
            .ok()
            .filter(|value| !value.trim().is_empty())
    }

    async fn test_ledger() -> Option<PostgresLedger> {
        let url = env_nonempty("RUBY_TEST_DATABASE_URL")?;
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .expect("connect");
        let ledger = PostgresLedger::from_pool(pool);
        ledger.init_schema().await.expect("schema");
        Some(ledger)
    }

    #[tokio::test]
    async fn charge_and_use_round_trip_against_live_postgres() {
        let Some(ledger) = test_ledger().await else {
            return;
        };
        let user = Uuid::now_v7();

        let (_, balance) = ledger
            .charge(user, 100, EntryKind::Charge, "top-up", None)
            .await
            .expect("charge");
        assert_eq!(balance, 100);

        let entry = LedgerEntry::use_entry(user, 40, 60, "chat turn".to_string(), None);
        ledger.record_use(&entry).await.expect("use");
        assert_eq!(ledger.balance(user).await.expect("balance"), 60);

        let history = ledger
            .transactions(user, None, 10, 0)
            .await
            .expect("history");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].kind, EntryKind::Use);
        assert_eq!(history[0].amount, -40);
    }

    #[tokio::test]
    async fn refill_state_round_trips_against_live_postgres() {
        let Some(ledger) = test_ledger().await else {
            return;
        };
        let user = Uuid::now_v7();

        let mut state = ledger.refill_state(user).await.expect("lazy create");
        assert_eq!(state.timer_bucket, 0);

        state.credit(3);
        ledger.store_refill_state(&state).await.expect("store");
        let reread = ledger.refill_state(user).await.expect("reread");
        assert_eq!(reread.timer_bucket, 3);
    }
}

// src/entry.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Provenance of a ledger entry. `Use` entries carry a negative amount;
/// everything else credits the balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Charge,
    Use,
    Bonus,
    Refund,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Charge => "charge",
            Self::Use => "use",
            Self::Bonus => "bonus",
            Self::Refund => "refund",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "charge" => Some(Self::Charge),
            "use" => Some(Self::Use),
            "bonus" => Some(Self::Bonus),
            "refund" => Some(Self::Refund),
            _ => None,
        }
    }
}

/// Pointer to the business record that caused a balance change
/// (payment order, chat model, check-in date, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRef {
    pub ref_type: String,
    pub ref_id: String,
}

impl TransactionRef {
    pub fn new(ref_type: impl Into<String>, ref_id: impl Into<String>) -> Self {
        Self {
            ref_type: ref_type.into(),
            ref_id: ref_id.into(),
        }
    }
}

/// Immutable audit record of one balance change.
///
/// Invariants:
/// - entries are append-only, never mutated or deleted
/// - `amount` is signed: negative for `Use`, positive otherwise
/// - `balance_after` is the balance the change settled at
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub user_id: Uuid,
    pub kind: EntryKind,
    pub amount: i64,
    pub balance_after: i64,
    pub description: String,
    pub reference: Option<TransactionRef>,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn new(
        user_id: Uuid,
        kind: EntryKind,
        amount: i64,
        balance_after: i64,
        description: String,
        reference: Option<TransactionRef>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            user_id,
            kind,
            amount,
            balance_after,
            description,
            reference,
            created_at: Utc::now(),
        }
    }

    /// Spend entry authorized by the cache; `amount` is stored negated.
    pub fn use_entry(
        user_id: Uuid,
        amount: i64,
        balance_after: i64,
        description: String,
        reference: Option<TransactionRef>,
    ) -> Self {
        Self::new(
            user_id,
            EntryKind::Use,
            -amount,
            balance_after,
            description,
            reference,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn use_entry_negates_amount() {
        let user = Uuid::now_v7();
        let entry = LedgerEntry::use_entry(user, 40, 60, "chat turn".to_string(), None);
        assert_eq!(entry.kind, EntryKind::Use);
        assert_eq!(entry.amount, -40);
        assert_eq!(entry.balance_after, 60);
    }

    #[test]
    fn kind_round_trips_through_str() {
        for kind in [
            EntryKind::Charge,
            EntryKind::Use,
            EntryKind::Bonus,
            EntryKind::Refund,
        ] {
            assert_eq!(EntryKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(EntryKind::parse("void"), None);
    }
}

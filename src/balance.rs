// src/balance.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Balance {
    pub user_id: Uuid,
    pub amount: i64,
    pub updated_at: DateTime<Utc>,
}

impl Balance {
    pub fn new(user_id: Uuid) -> Self {
        Self {
            user_id,
            amount: 0,
            updated_at: Utc::now(),
        }
    }
}

// src/cache/redis.rs
use async_trait::async_trait;
use redis::AsyncCommands;
use std::time::Duration;
use uuid::Uuid;

use super::{ActivityRecord, BalanceCache, SpendOutcome};
use crate::error::PointError;
use crate::pricing::RECENT_RING_LEN;

/// Redis-backed cache adapter. The spend path is a single Lua script so the
/// read-check-decrement happens in one server-side step; the lock release is
/// likewise scripted so only the owning token can delete.
#[derive(Clone)]
pub struct RedisCache {
    client: redis::Client,
    prefix: String,
}

impl RedisCache {
    pub fn new(url: impl AsRef<str>) -> Result<Self, PointError> {
        Ok(Self {
            client: redis::Client::open(url.as_ref())
                .map_err(|e| PointError::Cache(e.to_string()))?,
            prefix: "ruby".to_string(),
        })
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, PointError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| PointError::Cache(e.to_string()))
    }

    fn key_balance(&self, user_id: Uuid) -> String {
        format!("{}:balance:{user_id}", self.prefix)
    }

    fn key_recent(&self, user_id: Uuid) -> String {
        format!("{}:recent:{user_id}", self.prefix)
    }

    fn key_lock(&self, name: &str) -> String {
        format!("{}:lock:{name}", self.prefix)
    }

    fn key_claim(&self, key: &str) -> String {
        format!("{}:claim:{key}", self.prefix)
    }

    fn key_reconciliation(&self) -> String {
        format!("{}:reconciliation", self.prefix)
    }

    pub async fn ping(&self) -> Result<(), PointError> {
        let mut conn = self.connection().await?;
        let _: Option<String> = conn
            .get(format!("{}:__ping__", self.prefix))
            .await
            .map_err(|e| PointError::Cache(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl BalanceCache for RedisCache {
    async fn spend(&self, user_id: Uuid, amount: i64) -> Result<SpendOutcome, PointError> {
        let mut conn = self.connection().await?;

        let script = redis::Script::new(
            r#"
local balance = redis.call("GET", KEYS[1])
if not balance then
  return { "MISS" }
end
balance = tonumber(balance)
local amount = tonumber(ARGV[1])
if balance < amount then
  return { "SHORT", tostring(balance) }
end
local after = redis.call("DECRBY", KEYS[1], amount)
return { "OK", tostring(after) }
"#,
        );

        let result: Vec<String> = script
            .key(self.key_balance(user_id))
            .arg(amount)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| PointError::Cache(e.to_string()))?;

        let parsed = result
            .get(1)
            .and_then(|raw| raw.parse::<i64>().ok());

        match (result.first().map(|s| s.as_str()), parsed) {
            (Some("MISS"), _) => Ok(SpendOutcome::Miss),
            (Some("SHORT"), Some(balance)) => Ok(SpendOutcome::Insufficient(balance)),
            (Some("OK"), Some(balance)) => Ok(SpendOutcome::Spent(balance)),
            _ => Err(PointError::Cache(
                "unexpected spend script response".to_string(),
            )),
        }
    }

    async fn seed(&self, user_id: Uuid, balance: i64, ttl: Duration) -> Result<bool, PointError> {
        let mut conn = self.connection().await?;
        let created: Option<String> = redis::cmd("SET")
            .arg(self.key_balance(user_id))
            .arg(balance)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .map_err(|e| PointError::Cache(e.to_string()))?;
        Ok(created.is_some())
    }

    async fn read(&self, user_id: Uuid) -> Result<Option<i64>, PointError> {
        let mut conn = self.connection().await?;
        conn.get(self.key_balance(user_id))
            .await
            .map_err(|e| PointError::Cache(e.to_string()))
    }

    async fn write(&self, user_id: Uuid, balance: i64, ttl: Duration) -> Result<(), PointError> {
        let mut conn = self.connection().await?;
        let _: () = redis::cmd("SET")
            .arg(self.key_balance(user_id))
            .arg(balance)
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .map_err(|e| PointError::Cache(e.to_string()))?;
        Ok(())
    }

    async fn invalidate(&self, user_id: Uuid) -> Result<(), PointError> {
        let mut conn = self.connection().await?;
        let _: i64 = conn
            .del(self.key_balance(user_id))
            .await
            .map_err(|e| PointError::Cache(e.to_string()))?;
        Ok(())
    }

    async fn push_recent(&self, user_id: Uuid, record: &ActivityRecord) -> Result<(), PointError> {
        let serialized =
            serde_json::to_string(record).map_err(|e| PointError::Cache(e.to_string()))?;
        let mut conn = self.connection().await?;
        let key = self.key_recent(user_id);

        let _: () = redis::pipe()
            .atomic()
            .lpush(&key, serialized)
            .ltrim(&key, 0, RECENT_RING_LEN as isize - 1)
            .query_async(&mut conn)
            .await
            .map_err(|e| PointError::Cache(e.to_string()))?;
        Ok(())
    }

    async fn recent(
        &self,
        user_id: Uuid,
        limit: usize,
    ) -> Result<Vec<ActivityRecord>, PointError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.connection().await?;
        let raw: Vec<String> = redis::cmd("LRANGE")
            .arg(self.key_recent(user_id))
            .arg(0)
            .arg(limit as isize - 1)
            .query_async(&mut conn)
            .await
            .map_err(|e| PointError::Cache(e.to_string()))?;

        let mut out = Vec::with_capacity(raw.len());
        for item in raw {
            out.push(serde_json::from_str(&item).map_err(|e| PointError::Cache(e.to_string()))?);
        }
        Ok(out)
    }

    async fn acquire_lock(
        &self,
        name: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, PointError> {
        let mut conn = self.connection().await?;
        let acquired: Option<String> = redis::cmd("SET")
            .arg(self.key_lock(name))
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis().max(1) as u64)
            .query_async(&mut conn)
            .await
            .map_err(|e| PointError::Cache(e.to_string()))?;
        Ok(acquired.is_some())
    }

    async fn release_lock(&self, name: &str, token: &str) -> Result<bool, PointError> {
        let mut conn = self.connection().await?;

        let script = redis::Script::new(
            r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
  return redis.call("DEL", KEYS[1])
end
return 0
"#,
        );

        let deleted: i64 = script
            .key(self.key_lock(name))
            .arg(token)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| PointError::Cache(e.to_string()))?;
        Ok(deleted == 1)
    }

    async fn claim(&self, key: &str, ttl: Duration) -> Result<bool, PointError> {
        let mut conn = self.connection().await?;
        let claimed: Option<String> = redis::cmd("SET")
            .arg(self.key_claim(key))
            .arg(1)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .map_err(|e| PointError::Cache(e.to_string()))?;
        Ok(claimed.is_some())
    }

    async fn release_claim(&self, key: &str) -> Result<(), PointError> {
        let mut conn = self.connection().await?;
        let _: i64 = conn
            .del(self.key_claim(key))
            .await
            .map_err(|e| PointError::Cache(e.to_string()))?;
        Ok(())
    }

    async fn enqueue_reconciliation(&self, payload: &str) -> Result<(), PointError> {
        let mut conn = self.connection().await?;
        let _: i64 = conn
            .rpush(self.key_reconciliation(), payload)
            .await
            .map_err(|e| PointError::Cache(e.to_string()))?;
        Ok(())
    }

    async fn drain_reconciliation(&self, max: usize) -> Result<Vec<String>, PointError> {
        let mut conn = self.connection().await?;
        let mut out = Vec::new();
        for _ in 0..max {
            let payload: Option<String> = redis::cmd("LPOP")
                .arg(self.key_reconciliation())
                .query_async(&mut conn)
                .await
                .map_err(|e| PointError::Cache(e.to_string()))?;
            match payload {
                Some(payload) => out.push(payload),
                None => break,
            }
        }
        Ok(out)
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

    fn test_cache() -> Option<RedisCache> {
        let url = env_nonempty("RUBY_TEST_REDIS_URL").or_else(|| env_nonempty("REDIS_URL"))?;
        let prefix = format!("ruby_test:{}", Uuid::now_v7());
        Some(RedisCache::new(url).expect("cache").with_prefix(prefix))
    }

    #[tokio::test]
    async fn spend_round_trips_against_live_redis() {
        let Some(cache) = test_cache() else {
            return;
        };
        cache.ping().await.expect("ping");
        let user = Uuid::now_v7();
        let ttl = Duration::from_secs(60);

        assert_eq!(cache.spend(user, 10).await.expect("miss"), SpendOutcome::Miss);
        assert!(cache.seed(user, 100, ttl).await.expect("seed"));
        assert!(!cache.seed(user, 999, ttl).await.expect("reseed"));
        assert_eq!(
            cache.spend(user, 30).await.expect("spend"),
            SpendOutcome::Spent(70)
        );
        assert_eq!(
            cache.spend(user, 500).await.expect("short"),
            SpendOutcome::Insufficient(70)
        );
        assert_eq!(cache.read(user).await.expect("read"), Some(70));
    }

    #[tokio::test]
    async fn lock_and_claim_round_trip_against_live_redis() {
        let Some(cache) = test_cache() else {
            return;
        };
        let ttl = Duration::from_secs(5);

        assert!(cache.acquire_lock("refill:u", "t1", ttl).await.expect("acquire"));
        assert!(!cache.acquire_lock("refill:u", "t2", ttl).await.expect("contend"));
        assert!(!cache.release_lock("refill:u", "t2").await.expect("foreign"));
        assert!(cache.release_lock("refill:u", "t1").await.expect("release"));

        assert!(cache.claim("webhook:ev:done", ttl).await.expect("claim"));
        assert!(!cache.claim("webhook:ev:done", ttl).await.expect("dup"));
    }
}

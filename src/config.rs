// src/config.rs
use crate::error::PointError;
use crate::pricing::BALANCE_CACHE_TTL_SECS;

/// Process-wide configuration for the balance subsystem. The Postgres pool
/// and Redis client built from this are init-at-startup, teardown-at-shutdown
/// resources; nothing here is per-request.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub redis_url: String,
    pub key_prefix: String,
    pub cache_ttl_secs: u64,
    pub max_connections: u32,
}

impl Config {
    pub fn from_env() -> Result<Self, PointError> {
        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| PointError::Config("DATABASE_URL not set".to_string()))?;
        let redis_url = std::env::var("REDIS_URL")
            .map_err(|_| PointError::Config("REDIS_URL not set".to_string()))?;

        Ok(Self {
            database_url,
            redis_url,
            key_prefix: "ruby".to_string(),
            cache_ttl_secs: BALANCE_CACHE_TTL_SECS,
            max_connections: 5,
        })
    }
}

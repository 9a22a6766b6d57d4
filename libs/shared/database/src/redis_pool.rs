use anyhow::{anyhow, Context, Result};
use deadpool_redis::{Config, Connection, Pool, Runtime};
use tracing::{debug, info};

use shared_config::AppConfig;

/// Thin wrapper over a deadpool Redis pool shared by the Redis-backed stores.
#[derive(Clone)]
pub struct RedisPool {
    pool: Pool,
    key_prefix: String,
}

impl RedisPool {
    pub async fn get(&self) -> Result<Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| anyhow!("Failed to get Redis connection: {}", e))
    }

    /// Namespaces a key; tests use a unique prefix so runs never collide.
    pub fn key(&self, suffix: &str) -> String {
        if self.key_prefix.is_empty() {
            suffix.to_string()
        } else {
            format!("{}:{}", self.key_prefix, suffix)
        }
    }

    pub fn prefix(&self) -> &str {
        &self.key_prefix
    }
}

/// Builds the pool from `REDIS_URL` and checks it with a PING.
pub async fn connect(config: &AppConfig) -> Result<RedisPool> {
    let url = config
        .redis_url
        .clone()
        .ok_or_else(|| anyhow!("REDIS_URL is not configured"))?;
    connect_url(&url, "").await
}

pub async fn connect_url(url: &str, key_prefix: &str) -> Result<RedisPool> {
    let pool = Config::from_url(url)
        .create_pool(Some(Runtime::Tokio1))
        .context("Failed to create Redis pool")?;

    let mut conn = pool
        .get()
        .await
        .map_err(|e| anyhow!("Failed to connect to Redis: {}", e))?;
    let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
    debug!("Redis answered {}", pong);

    info!("Redis pool initialized");
    Ok(RedisPool {
        pool,
        key_prefix: key_prefix.to_string(),
    })
}

//! Redis-backed revocation store, shared by every gateway replica.
//!
//! Wire contract: `EXISTS key` for lookups and `SET key 1 PX <ttl>` for
//! blocks, so Redis expires entries on its own.

use std::time::Duration;

use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tracing::{debug, info};

use super::{RevocationError, RevocationStore};

/// Blocklist in Redis, reached through an auto-reconnecting connection.
#[derive(Clone)]
pub struct RedisRevocationStore {
    conn: ConnectionManager,
}

impl RedisRevocationStore {
    /// Open a managed connection and check it with `PING`.
    pub async fn connect(url: &str) -> Result<Self, RevocationError> {
        let client = redis::Client::open(url).map_err(backend)?;
        let mut conn = ConnectionManager::new(client).await.map_err(backend)?;
        let pong: String = redis::cmd("PING").query_async(&mut conn).await.map_err(backend)?;
        info!(reply = %pong, "Connected to Redis revocation store");
        Ok(Self { conn })
    }
}

fn backend(e: redis::RedisError) -> RevocationError {
    RevocationError::Backend(e.to_string())
}

#[async_trait::async_trait]
impl RevocationStore for RedisRevocationStore {
    async fn is_blocked(&self, key: &str) -> Result<bool, RevocationError> {
        let mut conn = self.conn.clone();
        let exists: bool = conn.exists(key).await.map_err(backend)?;
        Ok(exists)
    }

    async fn block(&self, key: &str, ttl: Duration) -> Result<(), RevocationError> {
        let mut conn = self.conn.clone();
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);

        // PTTL: -2 missing, -1 no expiry. Keep an existing block that outlives this one.
        let current: i64 = conn.pttl(key).await.map_err(backend)?;
        if current == -1 || u64::try_from(current).is_ok_and(|c| c >= ttl_ms) {
            debug!("Existing revocation entry outlives the new one");
            return Ok(());
        }

        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(1)
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}

//! Redis implementation of the remote backend primitives.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tracing::info;

use super::remote::{RemoteBackend, TtlStatus};
use crate::error::StorageError;

/// Redis connection used by [`RemoteStore`](super::RemoteStore).
///
/// Cloning is cheap; clones share one multiplexed connection that reconnects
/// on failure.
#[derive(Clone)]
pub struct RedisBackend {
    conn: ConnectionManager,
}

impl RedisBackend {
    /// Connect to the Redis server at `url` (e.g. `redis://127.0.0.1:6379`).
    pub async fn connect(url: &str) -> Result<Self, StorageError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        info!(url = %url, "Connected to Redis");
        Ok(Self { conn })
    }
}

#[async_trait]
impl RemoteBackend for RedisBackend {
    /// `MULTI; INCR; PEXPIRE NX; PTTL; EXEC`. `PEXPIRE ... NX` needs Redis 7.0.
    async fn incr_with_ttl(
        &self,
        key: &str,
        ttl: Duration,
    ) -> Result<(i64, TtlStatus), StorageError> {
        let mut conn = self.conn.clone();
        let millis = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let (count, pttl): (i64, i64) = redis::pipe()
            .atomic()
            .incr(key, 1)
            .cmd("PEXPIRE")
            .arg(key)
            .arg(millis)
            .arg("NX")
            .ignore()
            .pttl(key)
            .query_async(&mut conn)
            .await?;
        Ok((count, TtlStatus::from_pttl(pttl)))
    }

    async fn get_with_ttl(&self, key: &str) -> Result<(Option<i64>, TtlStatus), StorageError> {
        let mut conn = self.conn.clone();
        let (count, pttl): (Option<i64>, i64) = redis::pipe()
            .get(key)
            .pttl(key)
            .query_async(&mut conn)
            .await?;
        Ok((count, TtlStatus::from_pttl(pttl)))
    }
}

impl std::fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBackend").finish_non_exhaustive()
    }
}

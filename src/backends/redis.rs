//! Redis Store - Distributed Backend
//!
//! Redis-based key-value store shared by every instance of the service.

use crate::error::{CacheError, Result};
use crate::traits::{KeyTtl, KvStore, PoolStats};
use async_trait::async_trait;
use redis::Client;
use redis::aio::ConnectionManager;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

/// Default cap on concurrently issued commands
pub const DEFAULT_MAX_CONNECTIONS: u32 = 64;

/// Deletes the key only while it still holds the caller's token
const COMPARE_AND_DELETE: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
";

fn millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// Redis store with `ConnectionManager` for automatic reconnection
///
/// - Distributed storage across multiple instances
/// - Automatic reconnection via `ConnectionManager`
/// - Bounded command concurrency, reported through [`KvStore::pool_stats`]
/// - Cursor-based key scanning
pub struct RedisStore {
    /// Redis connection manager - handles reconnection automatically
    conn_manager: ConnectionManager,
    permits: Arc<Semaphore>,
    max_connections: u32,
    total_commands: AtomicU64,
    failed_commands: AtomicU64,
}

impl RedisStore {
    /// Connect using `REDIS_URL`, falling back to localhost
    ///
    /// # Errors
    ///
    /// Returns `StoreUnavailable` if the client cannot be created or the connection fails.
    pub async fn new() -> Result<Self> {
        let redis_url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        Self::with_url(&redis_url, DEFAULT_MAX_CONNECTIONS).await
    }

    /// Connect to a custom URL
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection string (e.g., `<redis://localhost:6379>`)
    /// * `max_connections` - Upper bound on commands in flight at once
    ///
    /// # Errors
    ///
    /// Returns `StoreUnavailable` if the client cannot be created or the connection fails.
    pub async fn with_url(redis_url: &str, max_connections: u32) -> Result<Self> {
        info!(redis_url = %redis_url, "Initializing Redis Store with ConnectionManager");

        let client = Client::open(redis_url).map_err(|e| {
            CacheError::StoreUnavailable(format!(
                "Failed to create Redis client with URL {redis_url}: {e}"
            ))
        })?;

        let conn_manager = ConnectionManager::new(client).await.map_err(|e| {
            CacheError::StoreUnavailable(format!(
                "Failed to establish Redis connection manager: {e}"
            ))
        })?;

        // Test connection
        let mut conn = conn_manager.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;

        let max_connections = max_connections.max(1);
        info!(redis_url = %redis_url, max_connections, "Redis Store connected successfully");

        Ok(Self {
            conn_manager,
            permits: Arc::new(Semaphore::new(max_connections as usize)),
            max_connections,
            total_commands: AtomicU64::new(0),
            failed_commands: AtomicU64::new(0),
        })
    }

    async fn conn(&self) -> Result<(ConnectionManager, OwnedSemaphorePermit)> {
        self.total_commands.fetch_add(1, Ordering::Relaxed);
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| CacheError::Shutdown("redis store"))?;
        Ok((self.conn_manager.clone(), permit))
    }

    /// Run a single command, counting transport failures
    async fn query<T: redis::FromRedisValue>(&self, cmd: &redis::Cmd) -> Result<T> {
        let (mut conn, _permit) = self.conn().await?;
        cmd.query_async(&mut conn).await.map_err(|e| {
            self.failed_commands.fetch_add(1, Ordering::Relaxed);
            warn!(error = %e, "[Redis] Command failed");
            CacheError::from(e)
        })
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.query(redis::cmd("GET").arg(key)).await
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(millis(ttl));
        }
        let (): () = self.query(&cmd).await?;
        debug!(key = %key, ttl_secs = ?ttl.map(|t| t.as_secs()), "[Redis] Stored key");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let removed: usize = self.query(redis::cmd("DEL").arg(key)).await?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let count: usize = self.query(redis::cmd("EXISTS").arg(key)).await?;
        Ok(count > 0)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let set: i64 = self
            .query(redis::cmd("PEXPIRE").arg(key).arg(millis(ttl)))
            .await?;
        Ok(set == 1)
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl> {
        // -2 = key doesn't exist, -1 = no expiry
        let ttl_ms: i64 = self.query(redis::cmd("PTTL").arg(key)).await?;
        Ok(match ttl_ms {
            -2 => KeyTtl::Missing,
            ms if ms < 0 => KeyTtl::Persistent,
            ms => KeyTtl::Expires(Duration::from_millis(ms.unsigned_abs())),
        })
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        self.query(redis::cmd("MGET").arg(keys)).await
    }

    async fn mset(&self, entries: &[(String, Vec<u8>)], ttl: Option<Duration>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        pipe.atomic();
        for (key, value) in entries {
            let cmd = pipe.cmd("SET").arg(key).arg(value.as_slice());
            if let Some(ttl) = ttl {
                cmd.arg("PX").arg(millis(ttl));
            }
            cmd.ignore();
        }
        let (mut conn, _permit) = self.conn().await?;
        let (): () = pipe.query_async(&mut conn).await.map_err(|e| {
            self.failed_commands.fetch_add(1, Ordering::Relaxed);
            CacheError::from(e)
        })?;
        debug!(count = entries.len(), "[Redis] Stored keys in bulk");
        Ok(())
    }

    async fn mdel(&self, keys: &[String]) -> Result<usize> {
        if keys.is_empty() {
            return Ok(0);
        }
        let count: usize = self.query(redis::cmd("DEL").arg(keys)).await?;
        debug!(count = count, "[Redis] Removed keys in bulk");
        Ok(count)
    }

    async fn set_nx(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
        let reply: Option<String> = self
            .query(
                redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("NX")
                    .arg("PX")
                    .arg(millis(ttl)),
            )
            .await?;
        Ok(reply.is_some())
    }

    async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> Result<bool> {
        let (mut conn, _permit) = self.conn().await?;
        let removed: i64 = redis::Script::new(COMPARE_AND_DELETE)
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| {
                self.failed_commands.fetch_add(1, Ordering::Relaxed);
                CacheError::from(e)
            })?;
        Ok(removed == 1)
    }

    async fn incr(&self, key: &str, by: i64) -> Result<i64> {
        self.query(redis::cmd("INCRBY").arg(key).arg(by)).await
    }

    async fn hset(&self, key: &str, field: &str, value: &[u8]) -> Result<()> {
        let _: i64 = self
            .query(redis::cmd("HSET").arg(key).arg(field).arg(value))
            .await?;
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>> {
        self.query(redis::cmd("HGET").arg(key).arg(field)).await
    }

    async fn hgetall(&self, key: &str) -> Result<Vec<(String, Vec<u8>)>> {
        self.query(redis::cmd("HGETALL").arg(key)).await
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool> {
        let removed: i64 = self.query(redis::cmd("HDEL").arg(key).arg(field)).await?;
        Ok(removed > 0)
    }

    async fn lpush(&self, key: &str, value: &[u8]) -> Result<usize> {
        self.query(redis::cmd("LPUSH").arg(key).arg(value)).await
    }

    async fn rpush(&self, key: &str, value: &[u8]) -> Result<usize> {
        self.query(redis::cmd("RPUSH").arg(key).arg(value)).await
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<Vec<u8>>> {
        self.query(redis::cmd("LRANGE").arg(key).arg(start).arg(stop))
            .await
    }

    async fn ltrim(&self, key: &str, start: isize, stop: isize) -> Result<()> {
        let (): () = self
            .query(redis::cmd("LTRIM").arg(key).arg(start).arg(stop))
            .await?;
        Ok(())
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool> {
        let added: i64 = self.query(redis::cmd("SADD").arg(key).arg(member)).await?;
        Ok(added > 0)
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool> {
        let removed: i64 = self.query(redis::cmd("SREM").arg(key).arg(member)).await?;
        Ok(removed > 0)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        self.query(redis::cmd("SMEMBERS").arg(key)).await
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool> {
        let found: i64 = self
            .query(redis::cmd("SISMEMBER").arg(key).arg(member))
            .await?;
        Ok(found == 1)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        let _: i64 = self
            .query(redis::cmd("ZADD").arg(key).arg(score).arg(member))
            .await?;
        Ok(())
    }

    async fn zincr_by(&self, key: &str, member: &str, delta: f64) -> Result<f64> {
        self.query(redis::cmd("ZINCRBY").arg(key).arg(delta).arg(member))
            .await
    }

    async fn zrevrange_with_scores(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<(String, f64)>> {
        self.query(
            redis::cmd("ZREVRANGE")
                .arg(key)
                .arg(start)
                .arg(stop)
                .arg("WITHSCORES"),
        )
        .await
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        let removed: i64 = self.query(redis::cmd("ZREM").arg(key).arg(member)).await?;
        Ok(removed > 0)
    }

    /// Uses the cursor-based SCAN command, which is safe for production use unlike KEYS
    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;

        loop {
            // SCAN cursor MATCH pattern COUNT 100
            let (next, batch): (u64, Vec<String>) = self
                .query(
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(pattern)
                        .arg("COUNT")
                        .arg(100),
                )
                .await?;

            cursor = next;
            keys.extend(batch);

            // Cursor 0 means iteration is complete
            if cursor == 0 {
                break;
            }
        }

        debug!(pattern = %pattern, count = keys.len(), "[Redis] Scanned keys matching pattern");
        Ok(keys)
    }

    fn pool_stats(&self) -> PoolStats {
        let idle = u32::try_from(self.permits.available_permits()).unwrap_or(u32::MAX);
        PoolStats {
            max_connections: self.max_connections,
            active: self.max_connections.saturating_sub(idle),
            idle,
            total_commands: self.total_commands.load(Ordering::Relaxed),
            failed_commands: self.failed_commands.load(Ordering::Relaxed),
        }
    }

    async fn health_check(&self) -> bool {
        let test_key = "health_check_redis";
        let test_value = vec![1, 2, 3, 4];

        match self
            .set(test_key, &test_value, Some(Duration::from_secs(10)))
            .await
        {
            Ok(()) => match self.get(test_key).await {
                Ok(Some(retrieved)) => {
                    let _ = self.delete(test_key).await;
                    retrieved == test_value
                }
                _ => false,
            },
            Err(_) => false,
        }
    }

    fn name(&self) -> &'static str {
        "Redis"
    }
}

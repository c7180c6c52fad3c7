//! Store-backed lease lock with fencing tokens.
//!
//! Every acquisition draws a token from a shared counter (`incr`), so tokens grow
//! monotonically across all instances. The lock key holds the token of its owner and
//! expires after `lease`, which frees locks of crashed holders. Release and the
//! pre-write ownership check both compare against the token, so a holder whose lease
//! lapsed can neither delete nor write over a newer holder's work.

use crate::error::{CacheError, Result};
use crate::keys::{CacheKey, KeyBuilder};
use crate::store::CacheStore;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockConfig {
    /// Lease after which an unreleased lock frees itself
    pub lease: Duration,
    /// Longest a caller waits for a lock (in-process or distributed)
    pub wait_timeout: Duration,
    pub retry_base: Duration,
    pub retry_max: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lease: Duration::from_secs(10),
            wait_timeout: Duration::from_secs(5),
            retry_base: Duration::from_millis(10),
            retry_max: Duration::from_millis(200),
        }
    }
}

/// Held lease; pass back to [`LeaseLock::release`]
#[derive(Debug)]
#[must_use]
pub struct LeaseGuard {
    lock_key: CacheKey,
    token: u64,
}

impl LeaseGuard {
    #[must_use]
    pub fn token(&self) -> u64 {
        self.token
    }
}

#[derive(Debug, Clone)]
pub struct LeaseLock {
    store: CacheStore,
    keys: KeyBuilder,
    config: LockConfig,
}

impl LeaseLock {
    #[must_use]
    pub fn new(store: CacheStore, keys: KeyBuilder, config: LockConfig) -> Self {
        Self {
            store,
            keys,
            config,
        }
    }

    /// Acquire the lease guarding `key`, waiting with backoff
    ///
    /// # Errors
    ///
    /// `LockTimeout` after `wait_timeout`, `Cancelled` if `cancel` fires first,
    /// `StoreUnavailable` if the store cannot be reached.
    pub async fn acquire(&self, key: &CacheKey, cancel: &CancellationToken) -> Result<LeaseGuard> {
        let lock_key = self.keys.lock_for(key)?;
        let token = self.next_token().await?;
        let token_bytes = token.to_string().into_bytes();
        let started = Instant::now();
        let deadline = started + self.config.wait_timeout;
        let mut backoff = self.config.retry_base;

        loop {
            if self
                .store
                .set_nx(&lock_key, &token_bytes, self.config.lease)
                .await?
            {
                debug!(key = %key, token, "Lease acquired");
                return Ok(LeaseGuard { lock_key, token });
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(CacheError::LockTimeout {
                    key: key.to_string(),
                    waited: now.duration_since(started),
                });
            }

            let jitter = rand::thread_rng().gen_range(0..=backoff.as_millis().max(1) / 2);
            let pause = (backoff + Duration::from_millis(u64::try_from(jitter).unwrap_or(0)))
                .min(deadline.duration_since(now));
            tokio::select! {
                () = cancel.cancelled() => return Err(CacheError::Cancelled),
                () = tokio::time::sleep(pause) => {}
            }
            backoff = (backoff * 2).min(self.config.retry_max);
        }
    }

    async fn next_token(&self) -> Result<u64> {
        let counter = self.keys.fence_counter()?;
        let token = self.store.incr(&counter, 1).await?;
        Ok(token.unsigned_abs())
    }

    /// Whether the lease is still ours (it may have expired and been taken over)
    ///
    /// # Errors
    ///
    /// `StoreUnavailable` if the store cannot be reached.
    pub async fn still_held(&self, guard: &LeaseGuard) -> Result<bool> {
        let current = self.store.get_raw(&guard.lock_key).await?;
        Ok(current.is_some_and(|bytes| bytes == guard.token.to_string().as_bytes()))
    }

    /// Release the lease if it is still ours; returns whether anything was deleted
    pub async fn release(&self, guard: LeaseGuard) -> bool {
        match self
            .store
            .compare_and_delete(&guard.lock_key, guard.token.to_string().as_bytes())
            .await
        {
            Ok(released) => {
                if !released {
                    warn!(lock = %guard.lock_key, token = guard.token, "Lease expired before release");
                }
                released
            }
            Err(e) => {
                // The lease expiry frees the lock eventually
                warn!(lock = %guard.lock_key, error = %e, "Failed to release lease");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::MemoryStore;
    use crate::store::StoreConfig;
    use std::sync::Arc;

    fn lock(config: LockConfig) -> (LeaseLock, KeyBuilder) {
        let store = CacheStore::new(Arc::new(MemoryStore::new()), &StoreConfig::default());
        let keys = KeyBuilder::new("test").unwrap_or_else(|e| panic!("{e}"));
        (LeaseLock::new(store, keys.clone(), config), keys)
    }

    #[tokio::test]
    async fn tokens_increase_and_release_frees_the_lock() {
        let (lock, keys) = lock(LockConfig::default());
        let key = keys.entity("product", 1).unwrap_or_else(|e| panic!("{e}"));
        let cancel = CancellationToken::new();

        let first = lock.acquire(&key, &cancel).await.unwrap_or_else(|e| panic!("{e}"));
        assert!(lock.still_held(&first).await.unwrap_or(false));
        let first_token = first.token();
        assert!(lock.release(first).await);

        let second = lock.acquire(&key, &cancel).await.unwrap_or_else(|e| panic!("{e}"));
        assert!(second.token() > first_token);
        assert!(lock.release(second).await);
    }

    #[tokio::test]
    async fn contended_lock_times_out() {
        let (lock, keys) = lock(LockConfig {
            wait_timeout: Duration::from_millis(50),
            ..LockConfig::default()
        });
        let key = keys.entity("product", 2).unwrap_or_else(|e| panic!("{e}"));
        let cancel = CancellationToken::new();

        let held = lock.acquire(&key, &cancel).await.unwrap_or_else(|e| panic!("{e}"));
        let started = std::time::Instant::now();
        let err = lock.acquire(&key, &cancel).await.err();
        assert!(matches!(err, Some(CacheError::LockTimeout { .. })));
        assert!(started.elapsed() < Duration::from_millis(500));
        let _ = lock.release(held).await;
    }

    #[tokio::test]
    async fn expired_lease_cannot_be_released_by_old_holder() {
        let (lock, keys) = lock(LockConfig {
            lease: Duration::from_millis(20),
            ..LockConfig::default()
        });
        let key = keys.entity("product", 3).unwrap_or_else(|e| panic!("{e}"));
        let cancel = CancellationToken::new();

        let stale = lock.acquire(&key, &cancel).await.unwrap_or_else(|e| panic!("{e}"));
        tokio::time::sleep(Duration::from_millis(40)).await;
        let fresh = lock.acquire(&key, &cancel).await.unwrap_or_else(|e| panic!("{e}"));

        assert!(!lock.still_held(&stale).await.unwrap_or(true));
        assert!(!lock.release(stale).await);
        assert!(lock.still_held(&fresh).await.unwrap_or(false));
        assert!(lock.release(fresh).await);
    }

    #[tokio::test]
    async fn waiting_is_cancellable() {
        let (lock, keys) = lock(LockConfig::default());
        let key = keys.entity("product", 4).unwrap_or_else(|e| panic!("{e}"));
        let cancel = CancellationToken::new();
        let held = lock.acquire(&key, &cancel).await.unwrap_or_else(|e| panic!("{e}"));

        let waiter_cancel = CancellationToken::new();
        let trigger = waiter_cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });
        let err = lock.acquire(&key, &waiter_cancel).await.err();
        assert!(matches!(err, Some(CacheError::Cancelled)));
        let _ = lock.release(held).await;
    }
}

//! Memory Store - Concurrent `HashMap` Backend
//!
//! An in-process key-value store built on `DashMap`. It implements the full
//! [`KvStore`] surface (strings, hashes, lists, sets, sorted sets, leases, counters)
//! with per-key expiry, so the whole resilience layer can run without Redis.

use crate::error::{CacheError, Result};
use crate::traits::{KeyTtl, KvStore, PoolStats};
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry as MapEntry;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info};

#[derive(Debug, Clone)]
enum StoredValue {
    Bytes(Vec<u8>),
    Hash(HashMap<String, Vec<u8>>),
    List(VecDeque<Vec<u8>>),
    Set(HashSet<String>),
    SortedSet(HashMap<String, f64>),
}

impl StoredValue {
    fn kind(&self) -> &'static str {
        match self {
            Self::Bytes(_) => "string",
            Self::Hash(_) => "hash",
            Self::List(_) => "list",
            Self::Set(_) => "set",
            Self::SortedSet(_) => "zset",
        }
    }
}

/// Entry with expiration tracking
#[derive(Debug, Clone)]
struct Entry {
    value: StoredValue,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: StoredValue, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at
            .is_some_and(|expires_at| Instant::now() >= expires_at)
    }
}

fn wrong_type(key: &str, found: &StoredValue) -> CacheError {
    CacheError::Serialization(format!(
        "WRONGTYPE key '{key}' holds a {} value",
        found.kind()
    ))
}

/// Tracks a command for pool statistics while it runs
struct CommandGuard<'a> {
    active: &'a AtomicU32,
}

impl Drop for CommandGuard<'_> {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Concurrent in-memory store using `DashMap`
///
/// **Use Case**: tests, single-instance deployments, and as a reference for writing
/// other backends.
///
/// **Features**:
/// - Lock-free concurrent reads/writes across shards
/// - Per-key TTL, checked lazily on access and by [`MemoryStore::cleanup_expired`]
/// - Outage simulation through [`MemoryStore::set_available`]
///
/// **Example**:
/// ```rust
/// use resilient_cache::backends::MemoryStore;
/// use resilient_cache::KvStore;
/// use std::time::Duration;
///
/// # async fn example() -> resilient_cache::Result<()> {
/// let store = MemoryStore::new();
/// store.set("shop:user:1", b"alice", Some(Duration::from_secs(60))).await?;
/// assert_eq!(store.get("shop:user:1").await?, Some(b"alice".to_vec()));
/// # Ok(())
/// # }
/// ```
pub struct MemoryStore {
    map: Arc<DashMap<String, Entry>>,
    available: AtomicBool,
    active: AtomicU32,
    total_commands: AtomicU64,
    failed_commands: AtomicU64,
}

impl MemoryStore {
    /// Create new in-memory store
    #[must_use]
    pub fn new() -> Self {
        info!("Initializing Memory Store (concurrent HashMap)");

        Self {
            map: Arc::new(DashMap::new()),
            available: AtomicBool::new(true),
            active: AtomicU32::new(0),
            total_commands: AtomicU64::new(0),
            failed_commands: AtomicU64::new(0),
        }
    }

    /// Simulate an outage: while unavailable every command fails with `StoreUnavailable`
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Remove expired entries, returning how many were dropped
    pub fn cleanup_expired(&self) -> usize {
        let mut removed = 0;
        self.map.retain(|_, entry| {
            if entry.is_expired() {
                removed += 1;
                false
            } else {
                true
            }
        });
        if removed > 0 {
            debug!(count = removed, "[Memory] Cleaned up expired entries");
        }
        removed
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    fn begin(&self) -> Result<CommandGuard<'_>> {
        self.total_commands.fetch_add(1, Ordering::Relaxed);
        if !self.available.load(Ordering::SeqCst) {
            self.failed_commands.fetch_add(1, Ordering::Relaxed);
            return Err(CacheError::StoreUnavailable(
                "memory store marked unavailable".to_string(),
            ));
        }
        self.active.fetch_add(1, Ordering::Relaxed);
        Ok(CommandGuard {
            active: &self.active,
        })
    }

    /// Read a live entry through `f`, dropping it first if it has expired
    fn read<T>(&self, key: &str, f: impl FnOnce(&Entry) -> T) -> Option<T> {
        let entry = self.map.get(key)?;
        if entry.is_expired() {
            drop(entry); // Release read lock
            self.map.remove_if(key, |_, e| e.is_expired());
            return None;
        }
        Some(f(&entry))
    }

    /// Mutate the live entry for `key`, creating it with `init` if absent or expired
    fn upsert<T>(
        &self,
        key: &str,
        init: impl FnOnce() -> StoredValue,
        f: impl FnOnce(&mut Entry) -> Result<T>,
    ) -> Result<T> {
        match self.map.entry(key.to_string()) {
            MapEntry::Occupied(mut occupied) => {
                if occupied.get().is_expired() {
                    occupied.insert(Entry::new(init(), None));
                }
                f(occupied.get_mut())
            }
            MapEntry::Vacant(vacant) => {
                let mut entry = Entry::new(init(), None);
                let result = f(&mut entry);
                if result.is_ok() {
                    vacant.insert(entry);
                }
                result
            }
        }
    }

    /// Mutate an existing live entry; returns `None` when the key is absent
    fn modify<T>(&self, key: &str, f: impl FnOnce(&mut Entry) -> Result<T>) -> Result<Option<T>> {
        let Some(mut entry) = self.map.get_mut(key) else {
            return Ok(None);
        };
        if entry.is_expired() {
            drop(entry);
            self.map.remove_if(key, |_, e| e.is_expired());
            return Ok(None);
        }
        f(&mut entry).map(Some)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve a Redis-style inclusive range against a collection length
fn resolve_range(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
    let len = isize::try_from(len).ok()?;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if len == 0 || start > stop || start >= len {
        return None;
    }
    Some((usize::try_from(start).ok()?, usize::try_from(stop).ok()?))
}

/// Glob match supporting `*` and `?`
fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    let (mut p, mut t) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut mark = 0usize;

    while t < text.len() {
        match pattern.get(p) {
            Some('?') => {
                p += 1;
                t += 1;
            }
            Some('*') => {
                star = Some(p);
                p += 1;
                mark = t;
            }
            Some(c) if Some(c) == text.get(t) => {
                p += 1;
                t += 1;
            }
            _ => match star {
                Some(s) => {
                    p = s + 1;
                    mark += 1;
                    t = mark;
                }
                None => return false,
            },
        }
    }
    pattern.get(p..).is_some_and(|rest| rest.iter().all(|c| *c == '*'))
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let _cmd = self.begin()?;
        match self.read(key, |e| e.value.clone()) {
            Some(StoredValue::Bytes(bytes)) => Ok(Some(bytes)),
            Some(other) => Err(wrong_type(key, &other)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()> {
        let _cmd = self.begin()?;
        self.map.insert(
            key.to_string(),
            Entry::new(StoredValue::Bytes(value.to_vec()), ttl),
        );
        debug!(key = %key, ttl_secs = ?ttl.map(|t| t.as_secs()), "[Memory] Stored key");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let _cmd = self.begin()?;
        Ok(self
            .map
            .remove(key)
            .is_some_and(|(_, entry)| !entry.is_expired()))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let _cmd = self.begin()?;
        Ok(self.read(key, |_| ()).is_some())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let _cmd = self.begin()?;
        Ok(self
            .modify(key, |entry| {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(())
            })?
            .is_some())
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl> {
        let _cmd = self.begin()?;
        Ok(self
            .read(key, |entry| match entry.expires_at {
                Some(at) => KeyTtl::Expires(at.saturating_duration_since(Instant::now())),
                None => KeyTtl::Persistent,
            })
            .unwrap_or(KeyTtl::Missing))
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        let _cmd = self.begin()?;
        Ok(keys
            .iter()
            .map(|key| match self.read(key, |e| e.value.clone()) {
                Some(StoredValue::Bytes(bytes)) => Some(bytes),
                _ => None,
            })
            .collect())
    }

    async fn mset(&self, entries: &[(String, Vec<u8>)], ttl: Option<Duration>) -> Result<()> {
        let _cmd = self.begin()?;
        for (key, value) in entries {
            self.map
                .insert(key.clone(), Entry::new(StoredValue::Bytes(value.clone()), ttl));
        }
        debug!(count = entries.len(), "[Memory] Stored keys in bulk");
        Ok(())
    }

    async fn mdel(&self, keys: &[String]) -> Result<usize> {
        let _cmd = self.begin()?;
        let removed = keys
            .iter()
            .filter(|key| {
                self.map
                    .remove(key.as_str())
                    .is_some_and(|(_, entry)| !entry.is_expired())
            })
            .count();
        debug!(count = removed, "[Memory] Removed keys in bulk");
        Ok(removed)
    }

    async fn set_nx(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
        let _cmd = self.begin()?;
        let fresh = Entry::new(StoredValue::Bytes(value.to_vec()), Some(ttl));
        match self.map.entry(key.to_string()) {
            MapEntry::Occupied(mut occupied) => {
                if occupied.get().is_expired() {
                    occupied.insert(fresh);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            MapEntry::Vacant(vacant) => {
                vacant.insert(fresh);
                Ok(true)
            }
        }
    }

    async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> Result<bool> {
        let _cmd = self.begin()?;
        Ok(self
            .map
            .remove_if(key, |_, entry| {
                !entry.is_expired()
                    && matches!(&entry.value, StoredValue::Bytes(bytes) if bytes.as_slice() == expected)
            })
            .is_some())
    }

    async fn incr(&self, key: &str, by: i64) -> Result<i64> {
        let _cmd = self.begin()?;
        self.upsert(
            key,
            || StoredValue::Bytes(b"0".to_vec()),
            |entry| match &mut entry.value {
                StoredValue::Bytes(bytes) => {
                    let current: i64 = std::str::from_utf8(bytes)
                        .ok()
                        .and_then(|s| s.parse().ok())
                        .ok_or_else(|| {
                            CacheError::Serialization(format!(
                                "value at '{key}' is not an integer"
                            ))
                        })?;
                    let next = current.saturating_add(by);
                    *bytes = next.to_string().into_bytes();
                    Ok(next)
                }
                other => Err(wrong_type(key, other)),
            },
        )
    }

    async fn hset(&self, key: &str, field: &str, value: &[u8]) -> Result<()> {
        let _cmd = self.begin()?;
        self.upsert(
            key,
            || StoredValue::Hash(HashMap::new()),
            |entry| match &mut entry.value {
                StoredValue::Hash(hash) => {
                    hash.insert(field.to_string(), value.to_vec());
                    Ok(())
                }
                other => Err(wrong_type(key, other)),
            },
        )
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>> {
        let _cmd = self.begin()?;
        match self.read(key, |e| e.value.clone()) {
            Some(StoredValue::Hash(hash)) => Ok(hash.get(field).cloned()),
            Some(other) => Err(wrong_type(key, &other)),
            None => Ok(None),
        }
    }

    async fn hgetall(&self, key: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let _cmd = self.begin()?;
        match self.read(key, |e| e.value.clone()) {
            Some(StoredValue::Hash(hash)) => Ok(hash.into_iter().collect()),
            Some(other) => Err(wrong_type(key, &other)),
            None => Ok(Vec::new()),
        }
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool> {
        let _cmd = self.begin()?;
        Ok(self
            .modify(key, |entry| match &mut entry.value {
                StoredValue::Hash(hash) => Ok(hash.remove(field).is_some()),
                other => Err(wrong_type(key, other)),
            })?
            .unwrap_or(false))
    }

    async fn lpush(&self, key: &str, value: &[u8]) -> Result<usize> {
        let _cmd = self.begin()?;
        self.upsert(
            key,
            || StoredValue::List(VecDeque::new()),
            |entry| match &mut entry.value {
                StoredValue::List(list) => {
                    list.push_front(value.to_vec());
                    Ok(list.len())
                }
                other => Err(wrong_type(key, other)),
            },
        )
    }

    async fn rpush(&self, key: &str, value: &[u8]) -> Result<usize> {
        let _cmd = self.begin()?;
        self.upsert(
            key,
            || StoredValue::List(VecDeque::new()),
            |entry| match &mut entry.value {
                StoredValue::List(list) => {
                    list.push_back(value.to_vec());
                    Ok(list.len())
                }
                other => Err(wrong_type(key, other)),
            },
        )
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<Vec<u8>>> {
        let _cmd = self.begin()?;
        match self.read(key, |e| e.value.clone()) {
            Some(StoredValue::List(list)) => Ok(resolve_range(list.len(), start, stop)
                .map(|(from, to)| list.range(from..=to).cloned().collect())
                .unwrap_or_default()),
            Some(other) => Err(wrong_type(key, &other)),
            None => Ok(Vec::new()),
        }
    }

    async fn ltrim(&self, key: &str, start: isize, stop: isize) -> Result<()> {
        let _cmd = self.begin()?;
        self.modify(key, |entry| match &mut entry.value {
            StoredValue::List(list) => {
                *list = resolve_range(list.len(), start, stop)
                    .map(|(from, to)| list.range(from..=to).cloned().collect())
                    .unwrap_or_default();
                Ok(())
            }
            other => Err(wrong_type(key, other)),
        })?;
        Ok(())
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool> {
        let _cmd = self.begin()?;
        self.upsert(
            key,
            || StoredValue::Set(HashSet::new()),
            |entry| match &mut entry.value {
                StoredValue::Set(set) => Ok(set.insert(member.to_string())),
                other => Err(wrong_type(key, other)),
            },
        )
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool> {
        let _cmd = self.begin()?;
        Ok(self
            .modify(key, |entry| match &mut entry.value {
                StoredValue::Set(set) => Ok(set.remove(member)),
                other => Err(wrong_type(key, other)),
            })?
            .unwrap_or(false))
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let _cmd = self.begin()?;
        match self.read(key, |e| e.value.clone()) {
            Some(StoredValue::Set(set)) => Ok(set.into_iter().collect()),
            Some(other) => Err(wrong_type(key, &other)),
            None => Ok(Vec::new()),
        }
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool> {
        let _cmd = self.begin()?;
        match self.read(key, |e| e.value.clone()) {
            Some(StoredValue::Set(set)) => Ok(set.contains(member)),
            Some(other) => Err(wrong_type(key, &other)),
            None => Ok(false),
        }
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        let _cmd = self.begin()?;
        self.upsert(
            key,
            || StoredValue::SortedSet(HashMap::new()),
            |entry| match &mut entry.value {
                StoredValue::SortedSet(zset) => {
                    zset.insert(member.to_string(), score);
                    Ok(())
                }
                other => Err(wrong_type(key, other)),
            },
        )
    }

    async fn zincr_by(&self, key: &str, member: &str, delta: f64) -> Result<f64> {
        let _cmd = self.begin()?;
        self.upsert(
            key,
            || StoredValue::SortedSet(HashMap::new()),
            |entry| match &mut entry.value {
                StoredValue::SortedSet(zset) => {
                    let score = zset.entry(member.to_string()).or_insert(0.0);
                    *score += delta;
                    Ok(*score)
                }
                other => Err(wrong_type(key, other)),
            },
        )
    }

    async fn zrevrange_with_scores(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<(String, f64)>> {
        let _cmd = self.begin()?;
        match self.read(key, |e| e.value.clone()) {
            Some(StoredValue::SortedSet(zset)) => {
                let mut members: Vec<(String, f64)> = zset.into_iter().collect();
                members.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| b.0.cmp(&a.0)));
                Ok(resolve_range(members.len(), start, stop)
                    .and_then(|(from, to)| members.get(from..=to).map(<[_]>::to_vec))
                    .unwrap_or_default())
            }
            Some(other) => Err(wrong_type(key, &other)),
            None => Ok(Vec::new()),
        }
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        let _cmd = self.begin()?;
        Ok(self
            .modify(key, |entry| match &mut entry.value {
                StoredValue::SortedSet(zset) => Ok(zset.remove(member).is_some()),
                other => Err(wrong_type(key, other)),
            })?
            .unwrap_or(false))
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>> {
        let _cmd = self.begin()?;
        let keys: Vec<String> = self
            .map
            .iter()
            .filter(|entry| !entry.value().is_expired() && glob_match(pattern, entry.key()))
            .map(|entry| entry.key().clone())
            .collect();
        debug!(pattern = %pattern, count = keys.len(), "[Memory] Scanned keys matching pattern");
        Ok(keys)
    }

    fn pool_stats(&self) -> PoolStats {
        let active = self.active.load(Ordering::Relaxed);
        PoolStats {
            max_connections: u32::MAX,
            active,
            idle: 0,
            total_commands: self.total_commands.load(Ordering::Relaxed),
            failed_commands: self.failed_commands.load(Ordering::Relaxed),
        }
    }

    async fn health_check(&self) -> bool {
        let test_key = "health_check_memory";
        let test_value = b"health_check_value";

        match self
            .set(test_key, test_value, Some(Duration::from_secs(60)))
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
        "Memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn expired_keys_disappear() {
        let store = MemoryStore::new();
        store
            .set("k", b"v", Some(Duration::from_millis(20)))
            .await
            .unwrap_or_else(|e| panic!("{e}"));
        assert!(matches!(store.ttl("k").await, Ok(KeyTtl::Expires(_))));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(store.get("k").await.ok().flatten(), None);
        assert_eq!(store.ttl("k").await.ok(), Some(KeyTtl::Missing));
    }

    #[tokio::test]
    async fn set_nx_and_compare_and_delete() {
        let store = MemoryStore::new();
        let lease = Duration::from_secs(5);
        assert_eq!(store.set_nx("lock", b"1", lease).await.ok(), Some(true));
        assert_eq!(store.set_nx("lock", b"2", lease).await.ok(), Some(false));
        assert_eq!(store.compare_and_delete("lock", b"2").await.ok(), Some(false));
        assert_eq!(store.compare_and_delete("lock", b"1").await.ok(), Some(true));
        assert_eq!(store.set_nx("lock", b"3", lease).await.ok(), Some(true));
    }

    #[tokio::test]
    async fn counters_and_collections() {
        let store = MemoryStore::new();
        assert_eq!(store.incr("fence", 1).await.ok(), Some(1));
        assert_eq!(store.incr("fence", 1).await.ok(), Some(2));

        store.rpush("list", b"a").await.unwrap_or_else(|e| panic!("{e}"));
        store.rpush("list", b"b").await.unwrap_or_else(|e| panic!("{e}"));
        store.lpush("list", b"z").await.unwrap_or_else(|e| panic!("{e}"));
        let items = store.lrange("list", 0, -1).await.unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(items, vec![b"z".to_vec(), b"a".to_vec(), b"b".to_vec()]);
        store.ltrim("list", 0, 1).await.unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(store.lrange("list", 0, -1).await.map(|l| l.len()).ok(), Some(2));

        store.zadd("hot", "a", 1.0).await.unwrap_or_else(|e| panic!("{e}"));
        store.zincr_by("hot", "b", 5.0).await.unwrap_or_else(|e| panic!("{e}"));
        let top = store
            .zrevrange_with_scores("hot", 0, 0)
            .await
            .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(top, vec![("b".to_string(), 5.0)]);

        assert!(matches!(store.get("hot").await, Err(CacheError::Serialization(_))));
    }

    #[tokio::test]
    async fn unavailable_store_fails_with_retryable_error() {
        let store = MemoryStore::new();
        store.set_available(false);
        let err = store.get("k").await.err().unwrap_or_else(|| panic!("expected error"));
        assert!(err.is_retryable());
        assert_eq!(store.pool_stats().failed_commands, 1);
        store.set_available(true);
        assert!(store.health_check().await);
    }

    #[test]
    fn glob_patterns() {
        assert!(glob_match("shop:*", "shop:product:1"));
        assert!(glob_match("shop:?:x", "shop:a:x"));
        assert!(!glob_match("shop:?:x", "shop:ab:x"));
        assert!(glob_match("*", ""));
        assert!(!glob_match("user:*", "shop:user:1"));
    }
}

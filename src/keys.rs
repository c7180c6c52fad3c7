//! Key Fabric - canonical cache keys and per-category TTLs
//!
//! Every key written to the store is a [`CacheKey`], and the only way to obtain one is
//! through a [`KeyBuilder`]. Keys therefore always carry the configured namespace
//! prefix and always pass validation.

use crate::error::{CacheError, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// Maximum key length in bytes
pub const MAX_KEY_LEN: usize = 250;

/// Separator placed between namespace and key segments
pub const KEY_SEPARATOR: char = ':';

/// Leading segments starting with this are kept for lease locks and fencing counters
pub const RESERVED_PREFIX: &str = "__";

const LOCK_SEGMENT: &str = "__lock";
const FENCE_SEGMENT: &str = "__fence";

/// Validated, namespaced cache key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// Full key as stored
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Key split back into namespace and segments
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split(KEY_SEPARATOR)
    }

    /// Namespace prefix of this key
    #[must_use]
    pub fn namespace(&self) -> &str {
        self.segments().next().unwrap_or_default()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Builds [`CacheKey`]s under one namespace
#[derive(Debug, Clone)]
pub struct KeyBuilder {
    namespace: String,
}

impl KeyBuilder {
    /// Create a builder for the given namespace
    ///
    /// # Errors
    ///
    /// Returns `MalformedKey` if the namespace itself is not a valid segment.
    pub fn new(namespace: impl Into<String>) -> Result<Self> {
        let namespace = namespace.into();
        validate_segment(&namespace)?;
        Ok(Self { namespace })
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Join `namespace:seg1:seg2:...` and validate the result
    ///
    /// # Errors
    ///
    /// Returns `MalformedKey` when no segment is given, a segment is empty or
    /// contains whitespace/control characters, the first segment starts with
    /// [`RESERVED_PREFIX`], or the key exceeds [`MAX_KEY_LEN`].
    pub fn build<I, S>(&self, segments: I) -> Result<CacheKey>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.join(segments, false)
    }

    fn join<I, S>(&self, segments: I, internal: bool) -> Result<CacheKey>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut key = self.namespace.clone();
        let mut count = 0usize;
        for segment in segments {
            let segment = segment.as_ref();
            validate_segment(segment)?;
            if count == 0 && !internal && segment.starts_with(RESERVED_PREFIX) {
                return Err(CacheError::malformed(segment, "reserved key segment"));
            }
            key.push(KEY_SEPARATOR);
            key.push_str(segment);
            count += 1;
        }
        if count == 0 {
            return Err(CacheError::malformed(key, "key has no segments"));
        }
        validate_key(&key)?;
        Ok(CacheKey(key))
    }

    /// Key for a single entity: `namespace:kind:id`
    ///
    /// # Errors
    ///
    /// See [`KeyBuilder::build`].
    pub fn entity(&self, kind: &str, id: impl fmt::Display) -> Result<CacheKey> {
        self.build([kind, &id.to_string()])
    }

    /// Lease-lock key guarding loads of `key`
    ///
    /// Keys too long to carry the lock prefix are replaced by their SHA-256 digest.
    pub(crate) fn lock_for(&self, key: &CacheKey) -> Result<CacheKey> {
        let rest = key
            .as_str()
            .strip_prefix(&self.namespace)
            .unwrap_or(key.as_str())
            .trim_start_matches(KEY_SEPARATOR);
        let plain_len = self.namespace.len() + LOCK_SEGMENT.len() + rest.len() + 2;
        if plain_len <= MAX_KEY_LEN {
            return self.join([LOCK_SEGMENT, rest], true);
        }
        let digest = Sha256::digest(key.as_str().as_bytes());
        let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
        self.join([LOCK_SEGMENT, "sha256", &hex], true)
    }

    /// Counter key used to issue fencing tokens
    pub(crate) fn fence_counter(&self) -> Result<CacheKey> {
        self.join([FENCE_SEGMENT], true)
    }

    /// Re-validate a key received from outside the process (e.g. an event on the wire)
    ///
    /// # Errors
    ///
    /// Returns `MalformedKey` if the key is invalid or lives outside this namespace.
    pub fn parse(&self, raw: &str) -> Result<CacheKey> {
        validate_key(raw)?;
        let mut parts = raw.split(KEY_SEPARATOR);
        if parts.next() != Some(self.namespace.as_str()) {
            return Err(CacheError::malformed(raw, "key is outside this namespace"));
        }
        let mut count = 0usize;
        for part in parts {
            if part.is_empty() {
                return Err(CacheError::malformed(raw, "empty segment"));
            }
            count += 1;
        }
        if count == 0 {
            return Err(CacheError::malformed(raw, "key has no segments"));
        }
        if raw
            .split(KEY_SEPARATOR)
            .nth(1)
            .is_some_and(|kind| kind.starts_with(RESERVED_PREFIX))
        {
            return Err(CacheError::malformed(raw, "reserved key segment"));
        }
        Ok(CacheKey(raw.to_string()))
    }
}

fn validate_segment(segment: &str) -> Result<()> {
    if segment.is_empty() {
        return Err(CacheError::malformed(segment, "empty segment"));
    }
    if segment.contains(KEY_SEPARATOR) && segment.split(KEY_SEPARATOR).any(str::is_empty) {
        return Err(CacheError::malformed(segment, "empty segment"));
    }
    check_characters(segment)
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(CacheError::malformed(key, "empty key"));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(CacheError::malformed(
            truncate_for_error(key),
            "key exceeds 250 bytes",
        ));
    }
    check_characters(key)
}

fn check_characters(value: &str) -> Result<()> {
    if value.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(CacheError::malformed(
            value,
            "whitespace or control character",
        ));
    }
    Ok(())
}

fn truncate_for_error(key: &str) -> String {
    key.chars().take(64).collect::<String>() + "..."
}

/// Category of cached data, used to pick a default TTL
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataCategory {
    /// Prices, counters and other fast-moving values
    RealTime,
    Session,
    Product,
    Category,
    Inventory,
    UserProfile,
    Search,
    Config,
    /// Anything unrecognized; receives the safe default TTL
    Other,
}

impl DataCategory {
    /// Map a system-of-record entity kind onto a category
    #[must_use]
    pub fn from_entity_kind(kind: &str) -> Self {
        match kind.to_ascii_lowercase().as_str() {
            "price" | "ticker" | "realtime" => Self::RealTime,
            "session" => Self::Session,
            "product" => Self::Product,
            "category" => Self::Category,
            "inventory" | "stock" => Self::Inventory,
            "user" | "profile" => Self::UserProfile,
            "search" | "query" => Self::Search,
            "config" | "setting" => Self::Config,
            _ => Self::Other,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RealTime => "real_time",
            Self::Session => "session",
            Self::Product => "product",
            Self::Category => "category",
            Self::Inventory => "inventory",
            Self::UserProfile => "user_profile",
            Self::Search => "search",
            Self::Config => "config",
            Self::Other => "other",
        }
    }

    fn default_ttl(self) -> Option<Duration> {
        match self {
            Self::RealTime => Some(Duration::from_secs(10)),
            Self::Session => Some(Duration::from_secs(1800)), // 30 minutes
            Self::Product => Some(Duration::from_secs(3600)), // 1 hour
            Self::Category => Some(Duration::from_secs(10800)), // 3 hours
            Self::Inventory => Some(Duration::from_secs(300)),
            Self::UserProfile => Some(Duration::from_secs(1800)),
            Self::Search => Some(Duration::from_secs(600)),
            Self::Config => Some(Duration::from_secs(86400)),
            Self::Other => None,
        }
    }
}

/// Default TTL assigned to categories without a table entry
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

/// Category → TTL lookup with runtime overrides
#[derive(Debug)]
pub struct TtlTable {
    fallback: Duration,
    overrides: RwLock<HashMap<DataCategory, Duration>>,
}

impl TtlTable {
    #[must_use]
    pub fn new(fallback: Duration) -> Self {
        Self {
            fallback,
            overrides: RwLock::new(HashMap::new()),
        }
    }

    /// Table with the given overrides already applied
    #[must_use]
    pub fn with_overrides(fallback: Duration, overrides: HashMap<DataCategory, Duration>) -> Self {
        Self {
            fallback,
            overrides: RwLock::new(overrides),
        }
    }

    /// TTL for a category: override, then built-in default, then fallback
    #[must_use]
    pub fn ttl_for(&self, category: DataCategory) -> Duration {
        if let Some(ttl) = self.overrides.read().get(&category) {
            return *ttl;
        }
        category.default_ttl().unwrap_or(self.fallback)
    }

    pub fn set_override(&self, category: DataCategory, ttl: Duration) {
        self.overrides.write().insert(category, ttl);
    }

    pub fn clear_override(&self, category: DataCategory) {
        self.overrides.write().remove(&category);
    }
}

impl Default for TtlTable {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder() -> KeyBuilder {
        KeyBuilder::new("shop").unwrap_or_else(|_| panic!("valid namespace"))
    }

    #[test]
    fn builds_namespaced_keys() {
        let key = builder().build(["product", "42"]).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(key.as_str(), "shop:product:42");
        assert_eq!(key.namespace(), "shop");
        assert_eq!(key.segments().collect::<Vec<_>>(), vec!["shop", "product", "42"]);
    }

    #[test]
    fn rejects_bad_input() {
        let keys = builder();
        assert!(matches!(keys.build(["product", ""]), Err(CacheError::MalformedKey { .. })));
        assert!(matches!(keys.build(["pro duct"]), Err(CacheError::MalformedKey { .. })));
        assert!(matches!(keys.build(["tab\there"]), Err(CacheError::MalformedKey { .. })));
        assert!(matches!(keys.build(["bell\u{7}"]), Err(CacheError::MalformedKey { .. })));
        assert!(matches!(keys.build(Vec::<String>::new()), Err(CacheError::MalformedKey { .. })));
        assert!(KeyBuilder::new("").is_err());
    }

    #[test]
    fn enforces_length_limit() {
        let keys = builder();
        // "shop:" is 5 bytes, so a 245 byte segment lands exactly on the limit
        let fits = "a".repeat(MAX_KEY_LEN - 5);
        assert!(keys.build([fits.as_str()]).is_ok());
        let too_long = "a".repeat(MAX_KEY_LEN - 4);
        assert!(matches!(keys.build([too_long.as_str()]), Err(CacheError::MalformedKey { .. })));
    }

    #[test]
    fn parse_checks_namespace() {
        let keys = builder();
        assert!(keys.parse("shop:user:7").is_ok());
        assert!(keys.parse("other:user:7").is_err());
        assert!(keys.parse("shop").is_err());
        assert!(keys.parse("shop::7").is_err());
    }

    #[test]
    fn lock_keys_stay_in_namespace() {
        let keys = builder();
        let key = keys.entity("product", 9).unwrap_or_else(|e| panic!("{e}"));
        let lock = keys.lock_for(&key).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(lock.as_str(), "shop:__lock:product:9");
        let fence = keys.fence_counter().unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(fence.as_str(), "shop:__fence");
    }

    #[test]
    fn user_keys_cannot_reach_internal_keys() {
        let keys = builder();
        assert!(matches!(keys.entity("__lock", "fence"), Err(CacheError::MalformedKey { .. })));
        assert!(matches!(keys.build(["__fence"]), Err(CacheError::MalformedKey { .. })));
        assert!(matches!(keys.parse("shop:__lock:product:9"), Err(CacheError::MalformedKey { .. })));

        // A plain "lock" kind is ordinary user data
        let user = keys.entity("lock", "fence").unwrap_or_else(|e| panic!("{e}"));
        assert_ne!(user, keys.fence_counter().unwrap_or_else(|e| panic!("{e}")));
    }

    #[test]
    fn longest_valid_key_still_gets_a_lock() {
        let keys = builder();
        // "shop:product:" is 13 bytes
        let id = "a".repeat(MAX_KEY_LEN - 13);
        let key = keys.entity("product", &id).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(key.as_str().len(), MAX_KEY_LEN);

        let lock = keys.lock_for(&key).unwrap_or_else(|e| panic!("{e}"));
        assert!(lock.as_str().starts_with("shop:__lock:sha256:"));
        assert!(lock.as_str().len() <= MAX_KEY_LEN);
        // Same key, same lock; different key, different lock
        assert_eq!(lock, keys.lock_for(&key).unwrap_or_else(|e| panic!("{e}")));
        let other = keys.entity("product", "b".repeat(MAX_KEY_LEN - 13)).unwrap_or_else(|e| panic!("{e}"));
        assert_ne!(lock, keys.lock_for(&other).unwrap_or_else(|e| panic!("{e}")));
    }

    #[test]
    fn ttl_table_overrides_and_fallback() {
        let table = TtlTable::default();
        assert_eq!(table.ttl_for(DataCategory::Product), Duration::from_secs(3600));
        assert_eq!(table.ttl_for(DataCategory::Other), DEFAULT_TTL);

        table.set_override(DataCategory::Product, Duration::from_secs(60));
        assert_eq!(table.ttl_for(DataCategory::Product), Duration::from_secs(60));

        table.clear_override(DataCategory::Product);
        assert_eq!(table.ttl_for(DataCategory::Product), Duration::from_secs(3600));
    }

    #[test]
    fn entity_kinds_map_to_categories() {
        assert_eq!(DataCategory::from_entity_kind("Product"), DataCategory::Product);
        assert_eq!(DataCategory::from_entity_kind("user"), DataCategory::UserProfile);
        assert_eq!(DataCategory::from_entity_kind("widget"), DataCategory::Other);
    }
}

use serde::{Deserialize, Serialize};

/// How a write to the system of record reaches the cache
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsistencyStrategy {
    /// Source first, then cache, in the same call
    #[default]
    WriteThrough,
    /// Cache now, source later through a queued flush
    WriteBehind,
    /// Source, then evict; the next read repopulates
    CacheAside,
    /// Source, then reload; hot keys are refreshed again before they expire
    RefreshAhead,
}

impl ConsistencyStrategy {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WriteThrough => "write_through",
            Self::WriteBehind => "write_behind",
            Self::CacheAside => "cache_aside",
            Self::RefreshAhead => "refresh_ahead",
        }
    }
}

/// What `sync_cache` achieved
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum SyncOutcome {
    /// Source and cache both hold the new value
    Synced,
    /// Cache updated; the source write is queued
    Queued,
    /// Source updated; the cache entry was evicted
    Invalidated,
    /// Source updated but the cache could not be brought in line; nothing was rolled back
    PartialFailure { warning: String },
}

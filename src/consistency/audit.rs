use crate::keys::CacheKey;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

/// Outcome of comparing one cached entry against the source
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsistencyCheckResult {
    pub key: CacheKey,
    pub entity_kind: String,
    pub entity_id: String,
    pub is_consistent: bool,
    /// Whether a mismatch was repaired from the source
    pub resynced: bool,
    pub checked_at: DateTime<Utc>,
}

/// A key the coordinator keeps an eye on, for audits and refresh-ahead
#[derive(Debug, Clone)]
pub(crate) struct TrackedKey {
    pub key: CacheKey,
    pub kind: String,
    pub id: String,
    /// Accesses since the last refresh pass
    pub accesses: u32,
    pub refresh: bool,
}

/// A cached entry that was never written counts as consistent; a cached entry for an
/// entity the source no longer has does not
pub(crate) fn is_consistent(cached: Option<&Value>, source: Option<&Value>) -> bool {
    match (cached, source) {
        (None, _) => true,
        (Some(cached), Some(source)) => cached == source,
        (Some(_), None) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn absent_cache_entries_are_consistent() {
        let record = json!({"stock": 4});
        assert!(is_consistent(None, Some(&record)));
        assert!(is_consistent(None, None));
        assert!(is_consistent(Some(&record), Some(&json!({"stock": 4}))));
        assert!(!is_consistent(Some(&record), Some(&json!({"stock": 5}))));
        assert!(!is_consistent(Some(&record), None));
    }
}

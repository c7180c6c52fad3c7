//! The system of record, as seen by the coordinator.

use async_trait::async_trait;
use serde_json::Value;

/// Read/write access to the authoritative data
///
/// Errors are opaque to the cache layer and surface as `CacheError::Source`.
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Current record for an entity, `None` if it does not exist
    async fn load(&self, kind: &str, id: &str) -> anyhow::Result<Option<Value>>;

    /// Apply `changes` to an entity and return the resulting record
    async fn write(&self, kind: &str, id: &str, changes: &Value) -> anyhow::Result<Value>;
}

/// Shallow-merge `changes` into `base`: object fields are overwritten one by one,
/// anything else replaces `base` wholesale
pub fn merge_changes(base: &mut Value, changes: &Value) {
    match (base, changes) {
        (Value::Object(target), Value::Object(patch)) => {
            for (field, value) in patch {
                target.insert(field.clone(), value.clone());
            }
        }
        (base, changes) => *base = changes.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merges_objects_field_by_field() {
        let mut record = json!({"name": "lamp", "price": 10});
        merge_changes(&mut record, &json!({"price": 12, "stock": 3}));
        assert_eq!(record, json!({"name": "lamp", "price": 12, "stock": 3}));

        let mut scalar = json!(1);
        merge_changes(&mut scalar, &json!({"a": 1}));
        assert_eq!(scalar, json!({"a": 1}));
    }
}

//! Mutation events emitted by the system of record.

use crate::error::{CacheError, Result};
use crate::keys::{CacheKey, KeyBuilder};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Create,
    Update,
    Delete,
}

impl EventType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

/// A committed change to one entity; immutable once built
///
/// `payload` carries the new record, or `null` when consumers should reload it from
/// the source. When `affected_keys` is empty the entity key `ns:kind:id` is used.
#[derive(Debug, Clone, Serialize)]
pub struct UpdateEvent {
    id: Uuid,
    event_type: EventType,
    entity_kind: String,
    entity_id: String,
    payload: Value,
    affected_keys: Vec<CacheKey>,
    version: Option<u64>,
    created_at: DateTime<Utc>,
}

impl UpdateEvent {
    pub fn new(
        event_type: EventType,
        entity_kind: impl Into<String>,
        entity_id: impl Into<String>,
        payload: Value,
        affected_keys: Vec<CacheKey>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type,
            entity_kind: entity_kind.into(),
            entity_id: entity_id.into(),
            payload,
            affected_keys,
            version: None,
            created_at: Utc::now(),
        }
    }

    /// Attach a source version; events older than the last applied version are skipped
    #[must_use]
    pub fn with_version(mut self, version: u64) -> Self {
        self.version = Some(version);
        self
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    #[must_use]
    pub fn entity_kind(&self) -> &str {
        &self.entity_kind
    }

    #[must_use]
    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    #[must_use]
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    #[must_use]
    pub fn affected_keys(&self) -> &[CacheKey] {
        &self.affected_keys
    }

    #[must_use]
    pub fn version(&self) -> Option<u64> {
        self.version
    }

    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Keys this event touches, falling back to the entity key
    pub(crate) fn target_keys(&self, keys: &KeyBuilder) -> Result<Vec<CacheKey>> {
        if self.affected_keys.is_empty() {
            Ok(vec![keys.entity(&self.entity_kind, &self.entity_id)?])
        } else {
            Ok(self.affected_keys.clone())
        }
    }

    /// Routing string; events sharing it are handled in order by one worker
    pub(crate) fn shard_key(&self) -> String {
        self.affected_keys.first().map_or_else(
            || format!("{}:{}", self.entity_kind, self.entity_id),
            |key| key.as_str().to_string(),
        )
    }
}

/// Wire form of an [`UpdateEvent`]; keys travel as plain strings and are re-validated on receipt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub id: Uuid,
    pub event_type: EventType,
    pub entity_kind: String,
    pub entity_id: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub affected_keys: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    pub created_at: DateTime<Utc>,
}

impl From<&UpdateEvent> for EventEnvelope {
    fn from(event: &UpdateEvent) -> Self {
        Self {
            id: event.id,
            event_type: event.event_type,
            entity_kind: event.entity_kind.clone(),
            entity_id: event.entity_id.clone(),
            payload: event.payload.clone(),
            affected_keys: event
                .affected_keys
                .iter()
                .map(|k| k.as_str().to_string())
                .collect(),
            version: event.version,
            created_at: event.created_at,
        }
    }
}

impl EventEnvelope {
    /// # Errors
    ///
    /// `Serialization` if the envelope cannot be encoded.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// # Errors
    ///
    /// `Serialization` if `json` is not a valid envelope.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Validate every key against `keys` and rebuild the event
    ///
    /// # Errors
    ///
    /// `MalformedKey` if a key is invalid or belongs to another namespace.
    pub fn into_event(self, keys: &KeyBuilder) -> Result<UpdateEvent> {
        if self.entity_kind.is_empty() || self.entity_id.is_empty() {
            return Err(CacheError::malformed(
                format!("{}:{}", self.entity_kind, self.entity_id),
                "event has an empty entity kind or id",
            ));
        }
        let affected_keys = self
            .affected_keys
            .iter()
            .map(|raw| keys.parse(raw))
            .collect::<Result<Vec<_>>>()?;
        Ok(UpdateEvent {
            id: self.id,
            event_type: self.event_type,
            entity_kind: self.entity_kind,
            entity_id: self.entity_id,
            payload: self.payload,
            affected_keys,
            version: self.version,
            created_at: self.created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_revalidates_keys() {
        let keys = KeyBuilder::new("shop").unwrap_or_else(|e| panic!("{e}"));
        let key = keys.entity("product", 1).unwrap_or_else(|e| panic!("{e}"));
        let event = UpdateEvent::new(EventType::Update, "product", "1", json!({"price": 5}), vec![key])
            .with_version(3);

        let json = EventEnvelope::from(&event).to_json().unwrap_or_else(|e| panic!("{e}"));
        let back = EventEnvelope::from_json(&json)
            .and_then(|env| env.into_event(&keys))
            .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(back.id(), event.id());
        assert_eq!(back.version(), Some(3));
        assert_eq!(back.affected_keys()[0].as_str(), "shop:product:1");

        let other = KeyBuilder::new("blog").unwrap_or_else(|e| panic!("{e}"));
        let foreign = EventEnvelope::from_json(&json).and_then(|env| env.into_event(&other));
        assert!(matches!(foreign, Err(CacheError::MalformedKey { .. })));
    }

    #[test]
    fn target_keys_fall_back_to_entity_key() {
        let keys = KeyBuilder::new("shop").unwrap_or_else(|e| panic!("{e}"));
        let event = UpdateEvent::new(EventType::Delete, "product", "9", Value::Null, Vec::new());
        let targets = event.target_keys(&keys).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].as_str(), "shop:product:9");
        assert_eq!(event.shard_key(), "product:9");
    }
}

//! Cross-instance event transport over Redis Pub/Sub.
//!
//! Every instance publishes the events it produces on one channel and runs an
//! [`EventSubscriber`] that feeds events from the channel into its local
//! [`ConsistencyCoordinator`]. Keys are re-validated on receipt, so an event from another
//! namespace is dropped rather than applied.

use super::ConsistencyCoordinator;
use super::event::{EventEnvelope, UpdateEvent};
use crate::error::Result;
use anyhow::Context;
use futures_util::StreamExt;
use moka::future::Cache;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const RECENT_EVENTS: u64 = 10_000;
const RECENT_EVENT_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBusConfig {
    /// Pub/Sub channel carrying serialized events
    pub channel: String,
    /// Mirror published events into a Redis stream for auditing
    pub enable_audit_stream: bool,
    pub audit_stream: String,
    /// Approximate cap on the audit stream length
    pub audit_stream_maxlen: Option<usize>,
    pub reconnect_delay: Duration,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            channel: "cache:events".to_string(),
            enable_audit_stream: false,
            audit_stream: "cache:events:audit".to_string(),
            audit_stream_maxlen: Some(10_000),
            reconnect_delay: Duration::from_secs(5),
        }
    }
}

/// Sends events to every subscribed instance
pub struct EventPublisher {
    connection: redis::aio::ConnectionManager,
    config: EventBusConfig,
    sent: AtomicU64,
    /// Ids published recently, so our own events are not applied twice when they come back
    recent: Cache<Uuid, ()>,
}

impl EventPublisher {
    pub fn new(connection: redis::aio::ConnectionManager, config: EventBusConfig) -> Self {
        Self {
            connection,
            config,
            sent: AtomicU64::new(0),
            recent: Cache::builder()
                .max_capacity(RECENT_EVENTS)
                .time_to_live(RECENT_EVENT_TTL)
                .build(),
        }
    }

    /// # Errors
    ///
    /// `Serialization` if the event cannot be encoded, `StoreUnavailable` if Redis
    /// rejects the publish. A failed audit-stream mirror is only logged.
    pub async fn publish(&self, event: &UpdateEvent) -> Result<()> {
        let json = EventEnvelope::from(event).to_json()?;
        let mut connection = self.connection.clone();
        self.recent.insert(event.id(), ()).await;
        let receivers: i64 = connection.publish(&self.config.channel, &json).await?;
        self.sent.fetch_add(1, Ordering::Relaxed);
        debug!(event_id = %event.id(), receivers, channel = %self.config.channel, "Published update event");

        if self.config.enable_audit_stream
            && let Err(e) = self.mirror_to_stream(&mut connection, event).await
        {
            warn!(error = %e, "Failed to mirror event to audit stream");
        }
        Ok(())
    }

    async fn mirror_to_stream(
        &self,
        connection: &mut redis::aio::ConnectionManager,
        event: &UpdateEvent,
    ) -> anyhow::Result<()> {
        let mut cmd = redis::cmd("XADD");
        cmd.arg(&self.config.audit_stream);
        if let Some(maxlen) = self.config.audit_stream_maxlen {
            cmd.arg("MAXLEN").arg("~").arg(maxlen);
        }
        cmd.arg("*")
            .arg("event_id")
            .arg(event.id().to_string())
            .arg("type")
            .arg(event.event_type().as_str())
            .arg("kind")
            .arg(event.entity_kind())
            .arg("id")
            .arg(event.entity_id())
            .arg("created_at")
            .arg(event.created_at().to_rfc3339());

        let _: String = cmd
            .query_async(connection)
            .await
            .context("Failed to add event to audit stream")?;
        Ok(())
    }

    #[must_use]
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub(crate) fn sent_event(&self, id: Uuid) -> bool {
        self.recent.contains_key(&id)
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct SubscriberStats {
    pub messages_received: u64,
    pub events_forwarded: u64,
    /// Undecodable payloads, foreign keys and rejected enqueues
    pub processing_errors: u64,
    pub reconnects: u64,
}

#[derive(Debug, Default)]
struct AtomicSubscriberStats {
    messages_received: AtomicU64,
    events_forwarded: AtomicU64,
    processing_errors: AtomicU64,
    reconnects: AtomicU64,
}

impl AtomicSubscriberStats {
    fn snapshot(&self) -> SubscriberStats {
        SubscriberStats {
            messages_received: self.messages_received.load(Ordering::Relaxed),
            events_forwarded: self.events_forwarded.load(Ordering::Relaxed),
            processing_errors: self.processing_errors.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

/// Listens on the event channel and forwards events to a coordinator
pub struct EventSubscriber {
    client: redis::Client,
    config: EventBusConfig,
    stats: Arc<AtomicSubscriberStats>,
    shutdown_tx: broadcast::Sender<()>,
}

impl EventSubscriber {
    /// # Errors
    ///
    /// `StoreUnavailable` if `redis_url` cannot be parsed into a client.
    pub fn new(redis_url: &str, config: EventBusConfig) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Self {
            client,
            config,
            stats: Arc::new(AtomicSubscriberStats::default()),
            shutdown_tx,
        })
    }

    #[must_use]
    pub fn stats(&self) -> SubscriberStats {
        self.stats.snapshot()
    }

    /// Spawn the listening task; it reconnects after `reconnect_delay` until shut down
    pub fn start(&self, coordinator: Arc<ConsistencyCoordinator>) -> JoinHandle<()> {
        let client = self.client.clone();
        let config = self.config.clone();
        let stats = Arc::clone(&self.stats);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            loop {
                match Self::listen(&client, &config.channel, &coordinator, &stats, &mut shutdown_rx)
                    .await
                {
                    Ok(()) => {
                        info!("Event subscriber shutting down");
                        break;
                    }
                    Err(e) => {
                        error!(
                            error = %e,
                            retry_in_secs = config.reconnect_delay.as_secs(),
                            "Event subscriber lost its connection"
                        );
                        stats.reconnects.fetch_add(1, Ordering::Relaxed);
                        tokio::select! {
                            () = tokio::time::sleep(config.reconnect_delay) => {}
                            _ = shutdown_rx.recv() => {
                                info!("Event subscriber shutting down");
                                break;
                            }
                        }
                    }
                }
            }
        })
    }

    /// Returns `Ok(())` on shutdown and an error when the connection drops
    async fn listen(
        client: &redis::Client,
        channel: &str,
        coordinator: &ConsistencyCoordinator,
        stats: &AtomicSubscriberStats,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> anyhow::Result<()> {
        let mut pubsub = client
            .get_async_pubsub()
            .await
            .context("Failed to get pubsub connection")?;
        pubsub
            .subscribe(channel)
            .await
            .context("Failed to subscribe to event channel")?;
        info!(channel, "Subscribed to event channel");

        let mut stream = pubsub.on_message();
        loop {
            tokio::select! {
                message = stream.next() => {
                    let Some(message) = message else {
                        anyhow::bail!("Pub/Sub message stream ended");
                    };
                    stats.messages_received.fetch_add(1, Ordering::Relaxed);
                    let forwarded = match message.get_payload::<String>() {
                        Ok(payload) => Self::forward(&payload, coordinator).await,
                        Err(e) => Err(e.into()),
                    };
                    match forwarded {
                        Ok(true) => {
                            stats.events_forwarded.fetch_add(1, Ordering::Relaxed);
                        }
                        Ok(false) => debug!("Skipped our own event"),
                        Err(e) => {
                            warn!(error = %e, "Dropped event from channel");
                            stats.processing_errors.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
                _ = shutdown_rx.recv() => return Ok(()),
            }
        }
    }

    /// Apply one event from the channel locally; `Ok(false)` if this instance sent it
    async fn forward(payload: &str, coordinator: &ConsistencyCoordinator) -> Result<bool> {
        let event = EventEnvelope::from_json(payload)?.into_event(coordinator.keys())?;
        if coordinator.sent_here(event.id()) {
            return Ok(false);
        }
        coordinator.enqueue_event(event).await?;
        Ok(true)
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::MemoryStore;
    use crate::consistency::{ConsistencyConfig, DataSource, EventType};
    use crate::error::CacheError;
    use crate::keys::{KeyBuilder, TtlTable};
    use crate::store::{CacheMode, CacheStore, StoreConfig};
    use async_trait::async_trait;
    use serde_json::{Value, json};

    struct NoSource;

    #[async_trait]
    impl DataSource for NoSource {
        async fn load(&self, _kind: &str, _id: &str) -> anyhow::Result<Option<Value>> {
            Ok(None)
        }

        async fn write(&self, _kind: &str, _id: &str, changes: &Value) -> anyhow::Result<Value> {
            Ok(changes.clone())
        }
    }

    #[tokio::test]
    async fn channel_events_apply_locally_and_foreign_keys_are_dropped() {
        let keys = KeyBuilder::new("shop").unwrap_or_else(|e| panic!("{e}"));
        let store = CacheStore::new(Arc::new(MemoryStore::new()), &StoreConfig::default());
        let coordinator = ConsistencyCoordinator::new(
            CacheMode::Enabled(store.clone()),
            keys.clone(),
            Arc::new(NoSource),
            Arc::new(TtlTable::default()),
            None,
            ConsistencyConfig::default(),
        );

        let key = keys.entity("product", 4).unwrap_or_else(|e| panic!("{e}"));
        let event = UpdateEvent::new(
            EventType::Update,
            "product",
            "4",
            json!({"price": 12}),
            vec![key.clone()],
        );
        let payload = EventEnvelope::from(&event)
            .to_json()
            .unwrap_or_else(|e| panic!("{e}"));
        let applied = EventSubscriber::forward(&payload, &coordinator)
            .await
            .unwrap_or_else(|e| panic!("{e}"));
        assert!(applied);

        let blog = KeyBuilder::new("blog").unwrap_or_else(|e| panic!("{e}"));
        let foreign_key = blog.entity("post", 1).unwrap_or_else(|e| panic!("{e}"));
        let foreign = UpdateEvent::new(EventType::Delete, "post", "1", Value::Null, vec![foreign_key]);
        let foreign = EventEnvelope::from(&foreign)
            .to_json()
            .unwrap_or_else(|e| panic!("{e}"));
        assert!(matches!(
            EventSubscriber::forward(&foreign, &coordinator).await,
            Err(CacheError::MalformedKey { .. })
        ));
        assert!(matches!(
            EventSubscriber::forward("not json", &coordinator).await,
            Err(CacheError::Serialization(_))
        ));

        coordinator.shutdown().await;
        let stats = coordinator.get_stats();
        assert_eq!(stats.total_events, 1);
        assert_eq!(stats.processed_events, 1);
        let cached: Option<Value> = store.get(&key).await.unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(cached, Some(json!({"price": 12})));
    }

    #[test]
    fn default_channel_and_reconnect_delay() {
        let config = EventBusConfig::default();
        assert_eq!(config.channel, "cache:events");
        assert_eq!(config.reconnect_delay, Duration::from_secs(5));
        assert!(!config.enable_audit_stream);
    }
}

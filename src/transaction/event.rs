use crate::core::Result;
use async_trait::async_trait;
use chrono::{NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityChangeEventType {
    Create,
    Update,
    Delete,
}

impl fmt::Display for EntityChangeEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntityChangeEventType::Create => "CREATE",
            EntityChangeEventType::Update => "UPDATE",
            EntityChangeEventType::Delete => "DELETE",
        };
        f.write_str(name)
    }
}

/// Notification that an entity changed. Recorded on the current frame and
/// broadcast when the outermost frame completes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityChangeEvent {
    pub event_id: Uuid,
    pub event_type: EntityChangeEventType,
    pub source_client_id: String,
    pub entity: String,
    pub id: Option<i64>,
    pub recorded_at: NaiveDateTime,
}

impl EntityChangeEvent {
    pub fn new(
        event_type: EntityChangeEventType,
        source_client_id: &str,
        entity: &str,
        id: Option<i64>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type,
            source_client_id: source_client_id.to_string(),
            entity: entity.to_string(),
            id,
            recorded_at: Utc::now().naive_utc(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[async_trait]
pub trait EntityChangeEventBroadcaster: Send + Sync {
    async fn broadcast_entity_change(&self, event: &EntityChangeEvent) -> Result<()>;
}

/// Drops every event.
#[derive(Debug, Default)]
pub struct NoOpEventBroadcaster;

#[async_trait]
impl EntityChangeEventBroadcaster for NoOpEventBroadcaster {
    async fn broadcast_entity_change(&self, _event: &EntityChangeEvent) -> Result<()> {
        Ok(())
    }
}

/// Writes every event to the `tracing` log.
#[derive(Debug, Default)]
pub struct LoggingEventBroadcaster;

#[async_trait]
impl EntityChangeEventBroadcaster for LoggingEventBroadcaster {
    async fn broadcast_entity_change(&self, event: &EntityChangeEvent) -> Result<()> {
        info!(
            event_type = %event.event_type,
            entity = %event.entity,
            id = ?event.id,
            client = %event.source_client_id,
            payload = %event.to_json()?,
            "Entity changed"
        );
        Ok(())
    }
}

/// Fans events out to in-process subscribers.
pub struct ChannelEventBroadcaster {
    sender: broadcast::Sender<EntityChangeEvent>,
}

impl ChannelEventBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EntityChangeEvent> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl EntityChangeEventBroadcaster for ChannelEventBroadcaster {
    async fn broadcast_entity_change(&self, event: &EntityChangeEvent) -> Result<()> {
        // Without subscribers the event has nowhere to go.
        if self.sender.send(event.clone()).is_err() {
            debug!(entity = %event.entity, "No subscriber for entity change event");
        }
        Ok(())
    }
}

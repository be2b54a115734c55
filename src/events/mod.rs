//! Event bus used to announce completed sessions.
//!
//! The scheduler only publishes; turning events into user-facing notifications
//! is the job of whoever subscribes.
//!
//! - [`BroadcastEventBus`]: in-process `tokio::sync::broadcast` fan-out
//! - [`RedisEventBus`]: Redis pub/sub, one JSON message per event
//!
//! Neither is durable. A subscriber that is not listening when an event is
//! published never sees it.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::EventBusError;

/// Name of the event published once per completed session.
pub const SESSION_COMPLETED_EVENT: &str = "session.completed";

/// Publishing side of an event bus.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, event_name: &str, payload: serde_json::Value)
        -> Result<(), EventBusError>;
}

/// An event as delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusEvent {
    pub event: String,
    pub payload: serde_json::Value,
}

/// In-process event bus.
#[derive(Debug, Clone)]
pub struct BroadcastEventBus {
    sender: broadcast::Sender<BusEvent>,
}

impl BroadcastEventBus {
    /// Creates a bus buffering up to `capacity` events per lagging subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl EventBus for BroadcastEventBus {
    async fn publish(
        &self,
        event_name: &str,
        payload: serde_json::Value,
    ) -> Result<(), EventBusError> {
        let event = BusEvent {
            event: event_name.to_string(),
            payload,
        };
        // A send error only means nobody is subscribed right now.
        if self.sender.send(event).is_err() {
            debug!(event = event_name, "Published event with no subscribers");
        }
        Ok(())
    }
}

/// Redis pub/sub event bus.
#[derive(Clone)]
pub struct RedisEventBus {
    redis: ConnectionManager,
    channel: String,
}

impl RedisEventBus {
    /// Connects to Redis and publishes on `channel`.
    pub async fn connect(redis_url: &str, channel: impl Into<String>) -> Result<Self, EventBusError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| EventBusError::ConnectionFailed(e.to_string()))?;
        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| EventBusError::ConnectionFailed(e.to_string()))?;
        Ok(Self::from_connection(redis, channel))
    }

    /// Publishes over an existing connection.
    pub fn from_connection(redis: ConnectionManager, channel: impl Into<String>) -> Self {
        Self {
            redis,
            channel: channel.into(),
        }
    }
}

#[async_trait]
impl EventBus for RedisEventBus {
    async fn publish(
        &self,
        event_name: &str,
        payload: serde_json::Value,
    ) -> Result<(), EventBusError> {
        let message = serde_json::to_string(&BusEvent {
            event: event_name.to_string(),
            payload,
        })?;

        let mut conn = self.redis.clone();
        let receivers: i64 = conn.publish(&self.channel, message).await?;
        debug!(
            event = event_name,
            channel = %self.channel,
            receivers = receivers,
            "Published event"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_broadcast_delivers_to_subscribers() {
        let bus = BroadcastEventBus::new(8);
        let mut rx = bus.subscribe();

        bus.publish(SESSION_COMPLETED_EVENT, serde_json::json!({"session_id": "s1"}))
            .await
            .unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event, "session.completed");
        assert_eq!(event.payload["session_id"], "s1");
    }

    #[tokio::test]
    async fn test_broadcast_without_subscribers_is_ok() {
        let bus = BroadcastEventBus::default();
        assert!(bus
            .publish("anything", serde_json::Value::Null)
            .await
            .is_ok());
    }

    #[test]
    fn test_bus_event_wire_shape() {
        let event = BusEvent {
            event: SESSION_COMPLETED_EVENT.to_string(),
            payload: serde_json::json!({"total_jobs": 3}),
        };
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["event"], "session.completed");
        assert_eq!(json["payload"]["total_jobs"], 3);
    }
}

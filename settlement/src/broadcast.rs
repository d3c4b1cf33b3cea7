//! Live broadcast sink
//!
//! Derived market updates are pushed to connected clients through a
//! fire-and-forget sink. Publishing never blocks and never fails the caller;
//! slow subscribers lose the oldest messages.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Price change after a block
pub const EVENT_MARKET_UPDATE: &str = "market_update";

/// Volume figures for a block
pub const EVENT_VOLUME_UPDATE: &str = "volume_update";

/// One broadcast message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastMessage {
    /// Event type
    #[serde(rename = "type")]
    pub event_type: String,

    /// Payload
    pub data: Value,
}

/// Fire-and-forget publisher
pub trait BroadcastSink: Send + Sync {
    /// Publish without waiting
    fn publish(&self, event_type: &str, payload: Value);
}

/// Serialize `payload` and publish it, logging instead of failing
pub fn publish_json<T: Serialize>(sink: &dyn BroadcastSink, event_type: &str, payload: &T) {
    match serde_json::to_value(payload) {
        Ok(value) => sink.publish(event_type, value),
        Err(e) => warn!("Failed to encode {} broadcast: {}", event_type, e),
    }
}

/// Sink backed by a tokio broadcast channel
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: broadcast::Sender<BroadcastMessage>,
}

impl ChannelSink {
    /// Sink buffering up to `capacity` messages per subscriber
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// New subscriber
    pub fn subscribe(&self) -> broadcast::Receiver<BroadcastMessage> {
        self.sender.subscribe()
    }
}

impl BroadcastSink for ChannelSink {
    fn publish(&self, event_type: &str, payload: Value) {
        let message = BroadcastMessage {
            event_type: event_type.to_string(),
            data: payload,
        };
        // No subscribers is not an error
        if self.sender.send(message).is_err() {
            debug!("No broadcast subscribers for {}", event_type);
        }
    }
}

/// Sink that keeps everything it is given
#[derive(Debug, Default)]
pub struct RecordingSink {
    messages: Mutex<Vec<BroadcastMessage>>,
}

impl RecordingSink {
    /// Empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages published so far
    pub fn messages(&self) -> Vec<BroadcastMessage> {
        self.messages.lock().clone()
    }

    /// Messages of one type
    pub fn of_type(&self, event_type: &str) -> Vec<BroadcastMessage> {
        self.messages
            .lock()
            .iter()
            .filter(|m| m.event_type == event_type)
            .cloned()
            .collect()
    }
}

impl BroadcastSink for RecordingSink {
    fn publish(&self, event_type: &str, payload: Value) {
        self.messages.lock().push(BroadcastMessage {
            event_type: event_type.to_string(),
            data: payload,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_channel_sink_delivers_to_subscribers() {
        let sink = ChannelSink::new(8);
        let mut rx = sink.subscribe();
        sink.publish(EVENT_MARKET_UPDATE, json!({"price": 1.5}));

        let message = rx.recv().await.unwrap();
        assert_eq!(message.event_type, EVENT_MARKET_UPDATE);
        assert_eq!(message.data["price"], 1.5);
    }

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        let sink = ChannelSink::new(1);
        sink.publish(EVENT_VOLUME_UPDATE, json!({}));
    }

    #[test]
    fn test_wire_format() {
        let message = BroadcastMessage {
            event_type: EVENT_MARKET_UPDATE.to_string(),
            data: json!({"block_id": 1}),
        };
        let encoded = serde_json::to_value(&message).unwrap();
        assert_eq!(encoded["type"], "market_update");
        assert_eq!(encoded["data"]["block_id"], 1);
    }
}

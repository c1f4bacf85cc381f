//! In-process message bus: one tokio broadcast channel per name.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use tokio::sync::broadcast;

use riskcoord_core::defaults::BUS_CHANNEL_CAPACITY;
use riskcoord_core::{BroadcastMessage, MessageBus, Result};

/// Named broadcast channels shared by every context in the process.
///
/// Publishing to a channel nobody has subscribed to drops the message, the
/// same way a `BroadcastChannel` with no other listeners does.
pub struct InProcessBus {
    channels: RwLock<HashMap<String, broadcast::Sender<BroadcastMessage>>>,
    capacity: usize,
}

impl InProcessBus {
    pub fn new() -> Self {
        Self::with_capacity(BUS_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// Number of live receivers on `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(channel)
            .map(broadcast::Sender::receiver_count)
            .unwrap_or(0)
    }
}

impl Default for InProcessBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBus for InProcessBus {
    fn publish(&self, channel: &str, message: BroadcastMessage) -> Result<usize> {
        let channels = self.channels.read().unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = channels.get(channel) else {
            return Ok(0);
        };
        let delivered = tx.send(message).unwrap_or(0);
        tracing::trace!(channel, delivered, "Bus publish");
        Ok(delivered)
    }

    fn subscribe(&self, channel: &str) -> broadcast::Receiver<BroadcastMessage> {
        let mut channels = self.channels.write().unwrap_or_else(PoisonError::into_inner);
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use riskcoord_core::{CacheEntry, TaskKey};
    use uuid::Uuid;

    fn message() -> BroadcastMessage {
        let key = TaskKey::new("acme-nda");
        let entry = CacheEntry::processing(&key, "acme-nda.pdf", Utc::now());
        BroadcastMessage::cache_update(key, entry, Uuid::now_v7())
    }

    #[test]
    fn test_publish_without_subscribers_is_dropped() {
        let bus = InProcessBus::new();
        assert_eq!(bus.publish("risk-extraction:p1", message()).unwrap(), 0);
    }

    #[test]
    fn test_channels_are_isolated() {
        let bus = InProcessBus::new();
        let mut p1 = bus.subscribe("risk-extraction:p1");
        let mut p2 = bus.subscribe("risk-extraction:p2");

        assert_eq!(bus.publish("risk-extraction:p1", message()).unwrap(), 1);
        assert!(p1.try_recv().is_ok());
        assert!(p2.try_recv().is_err());
        assert_eq!(bus.subscriber_count("risk-extraction:p2"), 1);
    }
}

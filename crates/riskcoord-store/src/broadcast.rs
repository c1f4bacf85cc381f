//! Cross-context cache deltas.
//!
//! Every delta goes out twice: over the project's bus channel, and through
//! a single delta slot on the shared medium whose change notification
//! reaches contexts that missed the channel. The slot is cleared shortly
//! after each write. Receivers get duplicates and no ordering, so handlers
//! must be idempotent and merge against their own cache.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use uuid::Uuid;

use riskcoord_core::defaults::DELTA_CLEAR_DELAY_MS;
use riskcoord_core::{
    BroadcastMessage, CacheEntry, KeyValueStore, MessageBus, MessageKind, ProjectScope, TaskKey,
};

/// Publishes and receives cache deltas for one context.
pub struct BroadcastSync {
    scope: ProjectScope,
    origin: Uuid,
    bus: Arc<dyn MessageBus>,
    kv: Arc<dyn KeyValueStore>,
    clear_delay: Duration,
}

impl BroadcastSync {
    pub fn new(
        scope: ProjectScope,
        origin: Uuid,
        bus: Arc<dyn MessageBus>,
        kv: Arc<dyn KeyValueStore>,
    ) -> Self {
        Self {
            scope,
            origin,
            bus,
            kv,
            clear_delay: Duration::from_millis(DELTA_CLEAR_DELAY_MS),
        }
    }

    pub fn with_clear_delay(mut self, delay: Duration) -> Self {
        self.clear_delay = delay;
        self
    }

    /// Identifier stamped on every message this context sends.
    pub fn origin(&self) -> Uuid {
        self.origin
    }

    /// Send a delta on both paths. Never fails.
    pub fn publish(&self, key: &TaskKey, entry: &CacheEntry) {
        let message = BroadcastMessage::cache_update(key.clone(), entry.clone(), self.origin);
        self.send(key, message);
    }

    /// Send an operator override. Receivers take it over their own entry,
    /// `success` included.
    pub fn publish_manual(&self, key: &TaskKey, entry: &CacheEntry) {
        let message = BroadcastMessage::manual_override(key.clone(), entry.clone(), self.origin);
        self.send(key, message);
    }

    fn send(&self, key: &TaskKey, message: BroadcastMessage) {
        match self.bus.publish(&self.scope.channel(), message.clone()) {
            Ok(delivered) => {
                tracing::debug!(component = "broadcast", task_key = %key, kind = ?message.kind, status = %message.entry.status, delivered, "Published delta");
            }
            Err(e) => {
                tracing::debug!(component = "broadcast", task_key = %key, error = %e, "Bus publish failed");
            }
        }

        self.write_delta_slot(key, &message);
    }

    fn write_delta_slot(&self, key: &TaskKey, message: &BroadcastMessage) {
        let slot = self.scope.delta_key();
        let serialized = match serde_json::to_string(message) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(component = "broadcast", task_key = %key, error = %e, "Failed to serialize delta");
                return;
            }
        };
        if let Err(e) = self.kv.set(&slot, &serialized) {
            tracing::debug!(component = "broadcast", task_key = %key, error = %e, "Delta slot write failed");
            return;
        }

        // Fire-and-forget clear; skipped when no runtime is around (the
        // lifecycle path during shutdown).
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let kv = Arc::clone(&self.kv);
        let delay = self.clear_delay;
        handle.spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = kv.remove(&slot);
        });
    }

    /// Register `handler` on both delivery paths.
    ///
    /// The handler sees `(kind, task_key, entry)` for every delta from
    /// another context, possibly twice. Listening stops when the returned
    /// [`Subscription`] is dropped.
    pub fn subscribe<H>(&self, handler: H) -> Subscription
    where
        H: Fn(MessageKind, TaskKey, CacheEntry) + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        let mut tasks = Vec::with_capacity(2);

        let mut rx = self.bus.subscribe(&self.scope.channel());
        let origin = self.origin;
        let on_bus = Arc::clone(&handler);
        tasks.push(tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(message) => {
                        if message.origin != origin {
                            on_bus(message.kind, message.task_key, message.entry);
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(component = "broadcast", skipped, "Bus receiver lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }));

        if let Some(mut changes) = self.kv.changes() {
            let slot = self.scope.delta_key();
            let on_slot = Arc::clone(&handler);
            tasks.push(tokio::spawn(async move {
                loop {
                    match changes.recv().await {
                        Ok(event) => {
                            if event.key != slot {
                                continue;
                            }
                            // Clearing the slot reports no value.
                            let Some(raw) = event.new_value else {
                                continue;
                            };
                            match serde_json::from_str::<BroadcastMessage>(&raw) {
                                Ok(message) if message.origin != origin => {
                                    on_slot(message.kind, message.task_key, message.entry);
                                }
                                Ok(_) => {}
                                Err(e) => {
                                    tracing::debug!(component = "broadcast", error = %e, "Ignoring malformed delta");
                                }
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(component = "broadcast", skipped, "Storage change feed lagged");
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }));
        }

        Subscription { tasks }
    }
}

/// Listener tasks of a [`BroadcastSync::subscribe`] call.
pub struct Subscription {
    tasks: Vec<JoinHandle<()>>,
}

impl Subscription {
    /// Number of delivery paths being listened on.
    pub fn path_count(&self) -> usize {
        self.tasks.len()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InProcessBus;
    use crate::memory::MemoryKv;
    use chrono::Utc;
    use std::sync::Mutex;

    type Seen = Arc<Mutex<Vec<(MessageKind, TaskKey, CacheEntry)>>>;

    fn recorder() -> (Seen, impl Fn(MessageKind, TaskKey, CacheEntry) + Send + Sync + 'static) {
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |kind, k, e| sink.lock().unwrap().push((kind, k, e)))
    }

    fn entry() -> (TaskKey, CacheEntry) {
        let key = TaskKey::new("acme-nda");
        let entry = CacheEntry::processing(&key, "acme-nda.pdf", Utc::now());
        (key, entry)
    }

    #[tokio::test]
    async fn test_own_echo_is_dropped() {
        let bus = Arc::new(InProcessBus::new());
        let kv = Arc::new(MemoryKv::new());
        let sync = BroadcastSync::new(ProjectScope::new("p1"), Uuid::now_v7(), bus, kv);

        let (seen, handler) = recorder();
        let _sub = sync.subscribe(handler);
        let (key, entry) = entry();
        sync.publish(&key, &entry);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delta_slot_is_cleared() {
        let bus = Arc::new(InProcessBus::new());
        let kv = Arc::new(MemoryKv::new());
        let sync = BroadcastSync::new(ProjectScope::new("p1"), Uuid::now_v7(), bus, kv.clone())
            .with_clear_delay(Duration::from_millis(10));

        let (key, entry) = entry();
        sync.publish(&key, &entry);
        assert!(kv.get("risk_extraction_cache_delta_p1").unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(kv.get("risk_extraction_cache_delta_p1").unwrap().is_none());
    }

    #[test]
    fn test_publish_outside_runtime_keeps_slot() {
        let bus = Arc::new(InProcessBus::new());
        let kv = Arc::new(MemoryKv::new());
        let sync = BroadcastSync::new(ProjectScope::new("p1"), Uuid::now_v7(), bus, kv.clone());
        let (key, entry) = entry();
        sync.publish(&key, &entry);
        assert!(kv.get("risk_extraction_cache_delta_p1").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_manual_override_keeps_its_kind_on_both_paths() {
        let bus = Arc::new(InProcessBus::new());
        let kv = Arc::new(MemoryKv::new());
        let scope = ProjectScope::new("p1");
        let sender = BroadcastSync::new(scope.clone(), Uuid::now_v7(), bus.clone(), kv.clone());
        let receiver = BroadcastSync::new(scope, Uuid::now_v7(), bus, kv);

        let (seen, handler) = recorder();
        let _sub = receiver.subscribe(handler);
        let key = TaskKey::new("acme-nda");
        sender.publish_manual(&key, &CacheEntry::pending(&key, "acme-nda.pdf", Utc::now()));

        tokio::time::sleep(Duration::from_millis(20)).await;
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2, "bus and slot both deliver");
        assert!(seen.iter().all(|(kind, k, _)| *kind == MessageKind::ManualOverride && *k == key));
    }
}

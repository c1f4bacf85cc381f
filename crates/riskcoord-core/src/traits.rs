//! Core traits for riskcoord abstractions.
//!
//! These traits define the shared medium (key-value storage and pub/sub)
//! and the external collaborators (classifier, durable result store). The
//! coordination protocol only depends on these seams, so the medium can be
//! an in-memory map in tests, a file on one device, or a real broker.

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::Result;
use crate::key::TaskKey;
use crate::models::*;

// =============================================================================
// SHARED MEDIUM
// =============================================================================

/// Change notification emitted by a [`KeyValueStore`] on every write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
    pub key: String,
    /// `None` when the key was removed.
    pub new_value: Option<String>,
}

/// Synchronous string key-value storage shared by every context on a device.
///
/// Calls are synchronous so lifecycle guards can persist state while the
/// context is going away. Implementations must be cheap enough to call
/// from async code without `spawn_blocking`.
pub trait KeyValueStore: Send + Sync {
    /// Read a value.
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a value, replacing any previous one.
    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Delete a value. Deleting a missing key is not an error.
    fn remove(&self, key: &str) -> Result<()>;

    /// List keys starting with `prefix`.
    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    /// Atomically replace `key` if its current value equals `expected`
    /// (`None` = absent).
    ///
    /// Returns `Ok(None)` when the backend has no atomic primitive; callers
    /// then fall back to a plain read-then-write.
    fn compare_and_swap(&self, _key: &str, _expected: Option<&str>, _new: &str) -> Result<Option<bool>> {
        Ok(None)
    }

    /// Subscribe to changes made through any handle of this store.
    ///
    /// Backends without a change feed return `None`.
    fn changes(&self) -> Option<broadcast::Receiver<StorageEvent>> {
        None
    }
}

/// Named-channel publish/subscribe bus.
///
/// Delivery is at-least-once at best, unordered, and duplicate-prone;
/// subscribers must re-derive truth from their own cache.
pub trait MessageBus: Send + Sync {
    /// Send to every current subscriber of `channel`. Returns the number of
    /// receivers the message was handed to.
    fn publish(&self, channel: &str, message: BroadcastMessage) -> Result<usize>;

    /// Open a receiver on `channel`.
    fn subscribe(&self, channel: &str) -> broadcast::Receiver<BroadcastMessage>;
}

// =============================================================================
// EXTERNAL COLLABORATORS
// =============================================================================

/// AI classification backend.
///
/// Must tolerate being invoked more than once for the same task; the
/// coordination layer does not guarantee exactly-once.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, task: &ExtractionTask) -> Result<ClassificationOutcome>;
}

/// Durable store of finished results.
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// How many findings were already saved for this task (0 = none).
    async fn existing_result_count(&self, key: &TaskKey, file_stem: &str) -> Result<usize>;

    /// Persist the findings for a task, replacing unsaved earlier ones.
    async fn save_result(
        &self,
        key: &TaskKey,
        file_stem: &str,
        classifications: &[Classification],
    ) -> Result<()>;
}

//! Context teardown handling.
//!
//! Two hooks mirror what a closing context gets: a cancelable
//! "before unload" prompt, and a final "page hide" notification that has no
//! time for async work. Everything here is synchronous and best-effort.

use std::sync::Arc;

use tracing::{info, warn};

use riskcoord_core::{CacheEntry, Clock, ExtractionStatus, TaskKey};
use riskcoord_store::{BroadcastSync, CacheStore, LockManager};

use crate::scheduler::ExtractionScheduler;

/// Marker error stored on tasks abandoned by a closing context.
pub const ABORTED_BY_UNLOAD: &str = "Processing aborted by page unload";

/// Answer to a close request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnloadDecision {
    /// Work is in progress; ask the user before closing.
    Warn {
        message: String,
        processing: Vec<TaskKey>,
    },
    Proceed,
}

/// Lifecycle hooks for one context.
pub struct LifecycleGuard {
    cache: Arc<CacheStore>,
    locks: Arc<LockManager>,
    sync: Arc<BroadcastSync>,
    clock: Arc<dyn Clock>,
    scheduler: ExtractionScheduler,
}

impl LifecycleGuard {
    pub fn new(
        cache: Arc<CacheStore>,
        locks: Arc<LockManager>,
        sync: Arc<BroadcastSync>,
        clock: Arc<dyn Clock>,
        scheduler: ExtractionScheduler,
    ) -> Self {
        Self {
            cache,
            locks,
            sync,
            clock,
            scheduler,
        }
    }

    /// Whether closing now would abandon work.
    pub fn before_unload(&self) -> UnloadDecision {
        let processing = self.cache.keys_with_status(ExtractionStatus::Processing);
        if processing.is_empty() && !self.scheduler.is_running() {
            return UnloadDecision::Proceed;
        }
        let message = format!(
            "Risk extraction is in progress for {} file(s). Leaving now will abort it.",
            processing.len().max(self.scheduler.owned_in_flight().len())
        );
        UnloadDecision::Warn {
            message,
            processing,
        }
    }

    /// The user closed anyway: fail every visible `processing` entry so no
    /// context waits on it for the stale window, then release our locks.
    pub fn confirm_unload(&self) -> Vec<TaskKey> {
        let processing = self.cache.keys_with_status(ExtractionStatus::Processing);
        for key in &processing {
            self.abort(key);
        }
        for key in self.scheduler.owned_in_flight() {
            self.locks.release(&key);
        }
        self.cache.flush();
        if !processing.is_empty() {
            info!(component = "lifecycle", aborted = processing.len(), "Aborted processing on unload");
        }
        processing
    }

    /// Final notification: fail only what this context owns, release its
    /// locks, and persist synchronously. Returns how many tasks were failed.
    pub fn on_page_hide(&self) -> usize {
        let owned = self.scheduler.owned_in_flight();
        let mut aborted = 0;
        for key in &owned {
            let still_processing = self
                .cache
                .get(key)
                .is_some_and(|e| e.status == ExtractionStatus::Processing);
            if still_processing {
                self.abort(key);
                aborted += 1;
            }
            self.locks.release(key);
        }
        if !self.cache.flush() {
            warn!(component = "lifecycle", "Snapshot write failed on page hide");
        }
        aborted
    }

    fn abort(&self, key: &TaskKey) {
        let now = self.clock.now();
        let file_name = self
            .cache
            .get(key)
            .map(|e| e.file_name)
            .unwrap_or_else(|| key.to_string());
        let failed = CacheEntry::failed(key, &file_name, now, ABORTED_BY_UNLOAD);
        if self.cache.put(key, failed) {
            if let Some(stored) = self.cache.get(key) {
                self.sync.publish(key, &stored);
            }
        }
    }
}

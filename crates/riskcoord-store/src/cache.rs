//! Per-context cache of task status.
//!
//! The in-memory map is authoritative for the current context. It is
//! persisted to the shared medium as one JSON snapshot per project, written
//! at most once per coalescing window, and restored on startup with stale
//! entries dropped. Every write first merges the snapshot already on the
//! medium, so contexts that never see each other's deltas still keep each
//! other's entries. Storage failures never reach callers: they are logged
//! and the context carries on without durability.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;

use riskcoord_core::defaults::{
    CACHE_CHANGE_CAPACITY, CACHE_PERSIST_DEBOUNCE_MS, CACHE_RETENTION_SECS,
};
use riskcoord_core::{
    CacheEntry, Clock, ExtractionStatus, KeyValueStore, ProjectScope, TaskKey,
};

/// Serializable form of the cache, keyed by task key.
pub type CacheSnapshot = BTreeMap<String, CacheEntry>;

/// Configuration for a [`CacheStore`].
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Entries at least this old are pruned.
    pub retention_secs: u64,
    /// Coalescing window for snapshot writes.
    pub persist_debounce_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            retention_secs: CACHE_RETENTION_SECS,
            persist_debounce_ms: CACHE_PERSIST_DEBOUNCE_MS,
        }
    }
}

impl CacheConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `RISKCOORD_CACHE_RETENTION_SECS` | `86400` | Entry retention window |
    /// | `RISKCOORD_CACHE_DEBOUNCE_MS` | `500` | Snapshot write coalescing window |
    pub fn from_env() -> Self {
        let retention_secs = std::env::var("RISKCOORD_CACHE_RETENTION_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(CACHE_RETENTION_SECS)
            .max(1);

        let persist_debounce_ms = std::env::var("RISKCOORD_CACHE_DEBOUNCE_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(CACHE_PERSIST_DEBOUNCE_MS);

        Self {
            retention_secs,
            persist_debounce_ms,
        }
    }

    pub fn with_retention_secs(mut self, secs: u64) -> Self {
        self.retention_secs = secs;
        self
    }

    pub fn with_persist_debounce_ms(mut self, ms: u64) -> Self {
        self.persist_debounce_ms = ms;
        self
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn persist_debounce(&self) -> Duration {
        Duration::from_millis(self.persist_debounce_ms)
    }
}

/// Change notification from a [`CacheStore`].
#[derive(Debug, Clone, PartialEq)]
pub enum CacheChange {
    Updated { key: TaskKey, entry: CacheEntry },
    Removed { key: TaskKey },
    Cleared,
}

/// Task-status cache for one project in one context.
pub struct CacheStore {
    scope: ProjectScope,
    kv: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    config: CacheConfig,
    entries: RwLock<HashMap<TaskKey, CacheEntry>>,
    /// Locked after `entries` when both are held.
    watermarks: Mutex<Watermarks>,
    changes: broadcast::Sender<CacheChange>,
    dirty: AtomicBool,
    wake: Arc<Notify>,
}

impl CacheStore {
    pub fn new(
        scope: ProjectScope,
        kv: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        config: CacheConfig,
    ) -> Self {
        let (changes, _) = broadcast::channel(CACHE_CHANGE_CAPACITY);
        Self {
            scope,
            kv,
            clock,
            config,
            entries: RwLock::new(HashMap::new()),
            watermarks: Mutex::new(Watermarks::default()),
            changes,
            dirty: AtomicBool::new(false),
            wake: Arc::new(Notify::new()),
        }
    }

    pub fn scope(&self) -> &ProjectScope {
        &self.scope
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Subscribe to every change of this cache.
    pub fn subscribe(&self) -> broadcast::Receiver<CacheChange> {
        self.changes.subscribe()
    }

    // =========================================================================
    // READS
    // =========================================================================

    /// Current entry for `key`, pruning expired entries first.
    pub fn get(&self, key: &TaskKey) -> Option<CacheEntry> {
        self.prune(self.clock.now());
        self.read().get(key).cloned()
    }

    /// All entries, ordered by key.
    pub fn entries(&self) -> Vec<(TaskKey, CacheEntry)> {
        self.prune(self.clock.now());
        let mut all: Vec<_> = self
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    /// Keys currently at `status`, ordered.
    pub fn keys_with_status(&self, status: ExtractionStatus) -> Vec<TaskKey> {
        self.entries()
            .into_iter()
            .filter(|(_, e)| e.status == status)
            .map(|(k, _)| k)
            .collect()
    }

    pub fn count_with_status(&self, status: ExtractionStatus) -> usize {
        self.read().values().filter(|e| e.status == status).count()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Serializable copy of the current map.
    pub fn snapshot(&self) -> CacheSnapshot {
        self.read()
            .iter()
            .map(|(k, v)| (k.as_str().to_string(), v.clone()))
            .collect()
    }

    // =========================================================================
    // WRITES
    // =========================================================================

    /// Write an entry produced by this context.
    ///
    /// A non-success entry never replaces an existing `success`. The stored
    /// timestamp is the current time, but never earlier than the one it
    /// replaces. Returns whether the write was applied.
    pub fn put(&self, key: &TaskKey, entry: CacheEntry) -> bool {
        let now = self.now();
        let (pruned, stored) = {
            let mut map = self.write();
            let pruned = prune_map(&mut map, now, self.config.retention());

            if let Some(existing) = map.get(key) {
                if existing.status == ExtractionStatus::Success
                    && entry.status != ExtractionStatus::Success
                {
                    tracing::debug!(
                        component = "cache",
                        task_key = %key,
                        status = %entry.status,
                        "Write ignored, entry already succeeded"
                    );
                    (pruned, None)
                } else {
                    let timestamp = now.max(existing.timestamp);
                    let stored = stamp(entry, key, timestamp);
                    map.insert(key.clone(), stored.clone());
                    (pruned, Some(stored))
                }
            } else {
                let stored = stamp(entry, key, now);
                map.insert(key.clone(), stored.clone());
                (pruned, Some(stored))
            }
        };

        self.announce_pruned(pruned);
        match stored {
            Some(entry) => {
                self.announce(CacheChange::Updated {
                    key: key.clone(),
                    entry,
                });
                true
            }
            None => false,
        }
    }

    /// Merge an entry received from another context.
    ///
    /// The remote timestamp is kept. A remote `success` always lands over a
    /// non-success; otherwise the delta must not be older than the local
    /// entry. Exact duplicates are ignored so the same delta arriving over
    /// both delivery paths is applied once. Returns whether anything changed.
    pub fn apply_remote(&self, key: &TaskKey, entry: CacheEntry) -> bool {
        let now = self.clock.now();
        let retention = self.config.retention();
        if !entry.is_fresh(now, retention) {
            return false;
        }

        let (pruned, stored) = {
            let mut map = self.write();
            let pruned = prune_map(&mut map, now, retention);
            let entry = CacheEntry {
                base_name: key.clone(),
                ..entry
            };
            if should_merge(map.get(key), &entry) {
                map.insert(key.clone(), entry.clone());
                (pruned, Some(entry))
            } else {
                (pruned, None)
            }
        };

        self.announce_pruned(pruned);
        match stored {
            Some(entry) => {
                tracing::debug!(
                    component = "cache",
                    task_key = %key,
                    status = %entry.status,
                    "Applied remote delta"
                );
                self.announce(CacheChange::Updated {
                    key: key.clone(),
                    entry,
                });
                true
            }
            None => false,
        }
    }

    /// Merge an operator override made in another context.
    ///
    /// Lands over any local entry, `success` included, as long as the local
    /// entry is not newer. A re-delivered override therefore cannot undo
    /// work finished after it.
    pub fn apply_remote_manual(&self, key: &TaskKey, entry: CacheEntry) -> bool {
        let now = self.clock.now();
        if !entry.is_fresh(now, self.config.retention()) {
            return false;
        }

        let entry = CacheEntry {
            base_name: key.clone(),
            ..entry
        };
        let applied = {
            let mut map = self.write();
            let applies = map
                .get(key)
                .map_or(true, |existing| entry.timestamp >= existing.timestamp && &entry != existing);
            if applies {
                map.insert(key.clone(), entry.clone());
                self.marks().raise(key, entry.timestamp);
            }
            applies
        };

        if applied {
            tracing::info!(
                component = "cache",
                task_key = %key,
                status = %entry.status,
                "Applied remote override"
            );
            self.announce(CacheChange::Updated {
                key: key.clone(),
                entry,
            });
        }
        applied
    }

    /// Operator override: write `entry` even over a `success`, stamped now
    /// but never earlier than the entry it replaces.
    pub fn set_manual(&self, key: &TaskKey, entry: CacheEntry) -> CacheEntry {
        let now = self.now();
        let stored = {
            let mut map = self.write();
            let timestamp = map.get(key).map_or(now, |existing| now.max(existing.timestamp));
            let stored = stamp(entry, key, timestamp);
            map.insert(key.clone(), stored.clone());
            self.marks().raise(key, timestamp);
            stored
        };
        tracing::info!(
            component = "cache",
            task_key = %key,
            status = %stored.status,
            "Manual status override"
        );
        self.announce(CacheChange::Updated {
            key: key.clone(),
            entry: stored.clone(),
        });
        stored
    }

    pub fn remove(&self, key: &TaskKey) -> Option<CacheEntry> {
        let now = self.now();
        let removed = {
            let mut map = self.write();
            let removed = map.remove(key);
            if let Some(entry) = &removed {
                self.marks().raise(key, now.max(entry.timestamp));
            }
            removed
        };
        if removed.is_some() {
            self.announce(CacheChange::Removed { key: key.clone() });
        }
        removed
    }

    /// Drop every entry. Returns how many were removed.
    pub fn clear(&self) -> usize {
        let removed = {
            let mut map = self.write();
            let newest = map.values().map(|e| e.timestamp).max();
            self.marks().clear_through(self.now().max(newest.unwrap_or_default()));
            let n = map.len();
            map.clear();
            n
        };
        self.announce(CacheChange::Cleared);
        removed
    }

    /// Remove entries whose age is at least the retention window.
    pub fn prune(&self, now: DateTime<Utc>) -> usize {
        let pruned = prune_map(&mut self.write(), now, self.config.retention());
        let count = pruned.len();
        self.announce_pruned(pruned);
        count
    }

    // =========================================================================
    // PERSISTENCE
    // =========================================================================

    /// Merge a previously persisted snapshot, dropping stale entries and
    /// re-normalizing keys. Entries no newer than a local removal or manual
    /// override of the same key are skipped. Returns the number of entries
    /// taken over.
    pub fn restore(&self, snapshot: CacheSnapshot) -> usize {
        let now = self.clock.now();
        let retention = self.config.retention();
        let mut restored = Vec::new();
        {
            let mut map = self.write();
            let mut marks = self.marks();
            marks.prune(now, retention);
            for (raw_key, entry) in snapshot {
                if !entry.is_fresh(now, retention) {
                    tracing::trace!(component = "cache", storage_key = %raw_key, "Dropped stale entry");
                    continue;
                }
                let key = if entry.base_name.is_empty() {
                    TaskKey::new(&raw_key)
                } else {
                    entry.base_name.renormalized()
                };
                if key.is_empty() || marks.covers(&key, &entry) {
                    continue;
                }
                let entry = CacheEntry {
                    base_name: key.clone(),
                    ..entry
                };
                if should_merge(map.get(&key), &entry) {
                    map.insert(key.clone(), entry.clone());
                    restored.push((key, entry));
                }
            }
        }

        let count = restored.len();
        for (key, entry) in restored {
            let _ = self.changes.send(CacheChange::Updated { key, entry });
        }
        count
    }

    /// Load and merge the snapshot persisted on the shared medium.
    ///
    /// Corrupt entries are skipped individually; a missing or unreadable
    /// snapshot restores nothing.
    pub fn restore_from_medium(&self) -> usize {
        let Some(snapshot) = self.read_persisted() else {
            return 0;
        };
        let restored = self.restore(snapshot);
        tracing::info!(
            component = "cache",
            project_id = %self.scope.project_id(),
            entry_count = restored,
            "Restored cache snapshot"
        );
        restored
    }

    fn read_persisted(&self) -> Option<CacheSnapshot> {
        let storage_key = self.scope.cache_key();
        let raw = match self.kv.get(&storage_key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(component = "cache", storage_key = %storage_key, error = %e, "Failed to read cache snapshot");
                return None;
            }
        };

        let object = match serde_json::from_str::<JsonValue>(&raw) {
            Ok(JsonValue::Object(object)) => object,
            Ok(_) => {
                tracing::warn!(component = "cache", storage_key = %storage_key, "Cache snapshot is not an object");
                return None;
            }
            Err(e) => {
                tracing::warn!(component = "cache", storage_key = %storage_key, error = %e, "Failed to parse cache snapshot");
                return None;
            }
        };

        let mut snapshot = CacheSnapshot::new();
        for (key, value) in object {
            match serde_json::from_value::<CacheEntry>(value) {
                Ok(entry) => {
                    snapshot.insert(key, entry);
                }
                Err(e) => {
                    tracing::debug!(component = "cache", storage_key = %key, error = %e, "Skipping corrupt entry");
                }
            }
        }
        Some(snapshot)
    }

    /// Write the snapshot to the shared medium now. Returns whether it
    /// was persisted.
    ///
    /// The persisted snapshot is merged into this cache first, under the
    /// same rules as [`CacheStore::restore`]. The read and the write are
    /// two separate storage calls, so a writer landing between them is
    /// still overwritten; its entries come back with its own next flush.
    pub fn flush(&self) -> bool {
        self.dirty.store(false, Ordering::SeqCst);
        let storage_key = self.scope.cache_key();
        if let Some(persisted) = self.read_persisted() {
            let merged = self.restore(persisted);
            if merged > 0 {
                tracing::debug!(component = "cache", storage_key = %storage_key, entry_count = merged, "Merged persisted entries before write");
            }
        }
        let snapshot = self.snapshot();

        let serialized = match serde_json::to_string(&snapshot) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(component = "cache", storage_key = %storage_key, error = %e, "Failed to serialize cache snapshot");
                return false;
            }
        };

        match self.kv.set(&storage_key, &serialized) {
            Ok(()) => {
                tracing::trace!(component = "cache", storage_key = %storage_key, entry_count = snapshot.len(), "Persisted cache snapshot");
                true
            }
            Err(e) => {
                tracing::warn!(component = "cache", storage_key = %storage_key, error = %e, "Failed to persist cache snapshot");
                false
            }
        }
    }

    /// Spawn the background writer that persists the snapshot after each
    /// burst of changes.
    ///
    /// The first change after a write opens a window of `persist_debounce`;
    /// everything changed inside it lands in one write at its end. The task
    /// exits once the store is dropped.
    pub fn spawn_persister(self: &Arc<Self>) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let wake = Arc::clone(&self.wake);
        let window = self.config.persist_debounce();

        tokio::spawn(async move {
            loop {
                wake.notified().await;
                tokio::time::sleep(window).await;

                let Some(cache) = weak.upgrade() else {
                    break;
                };
                // A synchronous flush inside the window already wrote it.
                if cache.dirty.load(Ordering::SeqCst) {
                    cache.flush();
                }
            }
        })
    }

    // =========================================================================
    // INTERNALS
    // =========================================================================

    /// Current time at the wire precision, so an entry compares equal to
    /// its own serialized form.
    fn now(&self) -> DateTime<Utc> {
        let now = self.clock.now();
        DateTime::<Utc>::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<TaskKey, CacheEntry>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<TaskKey, CacheEntry>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn marks(&self) -> std::sync::MutexGuard<'_, Watermarks> {
        self.watermarks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn announce(&self, change: CacheChange) {
        let _ = self.changes.send(change);
        self.mark_dirty();
    }

    fn announce_pruned(&self, keys: Vec<TaskKey>) {
        if keys.is_empty() {
            return;
        }
        for key in keys {
            tracing::trace!(component = "cache", task_key = %key, "Pruned expired entry");
            let _ = self.changes.send(CacheChange::Removed { key });
        }
        self.mark_dirty();
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }
}

/// Floors below which persisted entries are not taken back in.
///
/// Set by removals, clears, and manual overrides in this context. They
/// last one retention window; anything older is stale anyway.
#[derive(Debug, Default)]
struct Watermarks {
    cleared: Option<DateTime<Utc>>,
    keys: HashMap<TaskKey, DateTime<Utc>>,
}

impl Watermarks {
    fn raise(&mut self, key: &TaskKey, at: DateTime<Utc>) {
        let mark = self.keys.entry(key.clone()).or_insert(at);
        *mark = (*mark).max(at);
    }

    fn clear_through(&mut self, at: DateTime<Utc>) {
        self.cleared = Some(self.cleared.map_or(at, |c| c.max(at)));
    }

    fn covers(&self, key: &TaskKey, entry: &CacheEntry) -> bool {
        self.cleared.is_some_and(|at| entry.timestamp <= at)
            || self.keys.get(key).is_some_and(|at| entry.timestamp <= *at)
    }

    fn prune(&mut self, now: DateTime<Utc>, retention: Duration) {
        let live = |at: &DateTime<Utc>| (now - *at).to_std().map_or(true, |age| age < retention);
        self.keys.retain(|_, at| live(at));
        if self.cleared.as_ref().is_some_and(|at| !live(at)) {
            self.cleared = None;
        }
    }
}

fn stamp(entry: CacheEntry, key: &TaskKey, timestamp: DateTime<Utc>) -> CacheEntry {
    CacheEntry {
        timestamp,
        base_name: key.clone(),
        ..entry
    }
}

fn prune_map(
    map: &mut HashMap<TaskKey, CacheEntry>,
    now: DateTime<Utc>,
    retention: Duration,
) -> Vec<TaskKey> {
    let expired: Vec<TaskKey> = map
        .iter()
        .filter(|(_, e)| !e.is_fresh(now, retention))
        .map(|(k, _)| k.clone())
        .collect();
    for key in &expired {
        map.remove(key);
    }
    expired
}

/// Whether an entry from elsewhere should replace the local one.
fn should_merge(existing: Option<&CacheEntry>, incoming: &CacheEntry) -> bool {
    let Some(existing) = existing else {
        return true;
    };
    let existing_success = existing.status == ExtractionStatus::Success;
    let incoming_success = incoming.status == ExtractionStatus::Success;
    match (existing_success, incoming_success) {
        (true, false) => false,
        (false, true) => true,
        _ => incoming.timestamp >= existing.timestamp && incoming != existing,
    }
}

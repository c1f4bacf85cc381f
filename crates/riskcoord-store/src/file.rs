//! File-backed shared medium.
//!
//! The whole store is one JSON object on disk. Every operation re-reads the
//! file so several processes pointed at the same path see each other's
//! writes. Each write goes to its own temporary file next to the target and
//! is renamed over it, so readers never observe a half-written document.
//!
//! Handles in one process that share a path also share one lock, which
//! makes read-modify-write atomic among them. Across processes the window
//! between the read and the rename remains: two processes writing at the
//! same moment can lose one of the two updates, but never corrupt the file.
//!
//! Once subscribed, a handle polls the file and reports values changed by
//! any other writer on its change feed. A key written twice between two
//! polls is reported once, with its latest value.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use once_cell::sync::Lazy;
use tempfile::NamedTempFile;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use riskcoord_core::defaults::{CACHE_CHANGE_CAPACITY, FILE_POLL_INTERVAL_MS};
use riskcoord_core::{KeyValueStore, Result, StorageEvent};

type Document = BTreeMap<String, String>;

/// JSON file holding every key of the medium.
///
/// There is no cross-process compare-and-swap, so
/// [`KeyValueStore::compare_and_swap`] keeps its default and locks stay
/// best-effort.
pub struct FileKv {
    shared: Arc<Shared>,
    poll_interval: Duration,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    path: PathBuf,
    io: Arc<Mutex<()>>,
    events: broadcast::Sender<StorageEvent>,
    /// Contents as of the last poll or own write; `None` until watched.
    seen: Mutex<Option<Document>>,
}

/// One lock per store path, shared by every handle in the process.
static PATH_LOCKS: Lazy<Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

fn path_lock(path: &Path) -> Arc<Mutex<()>> {
    let key = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    let mut locks = PATH_LOCKS.lock().unwrap_or_else(PoisonError::into_inner);
    Arc::clone(locks.entry(key).or_default())
}

impl FileKv {
    /// Open (or lazily create) the store at `path`. Parent directories are
    /// created on first write.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let (events, _) = broadcast::channel(CACHE_CHANGE_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                io: path_lock(&path),
                path,
                events,
                seen: Mutex::new(None),
            }),
            poll_interval: Duration::from_millis(FILE_POLL_INTERVAL_MS),
            watcher: Mutex::new(None),
        }
    }

    /// How often the file is re-read once someone subscribes.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    /// Start polling for foreign writes. Without a Tokio runtime the feed
    /// only carries this handle's own writes.
    fn start_watcher(&self) {
        let mut watcher = self.watcher.lock().unwrap_or_else(PoisonError::into_inner);
        if watcher.is_some() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::debug!(path = %self.shared.path.display(), "No runtime, storage changes from other writers are not watched");
            return;
        };

        {
            let _guard = self.shared.lock_io();
            let baseline = self.shared.load().unwrap_or_default();
            *self.shared.seen() = Some(baseline);
        }

        let shared = Arc::clone(&self.shared);
        let period = self.poll_interval;
        *watcher = Some(runtime.spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                shared.poll();
            }
        }));
    }
}

impl Drop for FileKv {
    fn drop(&mut self) {
        if let Some(watcher) = self
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            watcher.abort();
        }
    }
}

impl Shared {
    fn lock_io(&self) -> std::sync::MutexGuard<'_, ()> {
        self.io.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn seen(&self) -> std::sync::MutexGuard<'_, Option<Document>> {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn load(&self) -> Result<Document> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Document::new()),
            Err(e) => return Err(e.into()),
        };
        if raw.trim().is_empty() {
            return Ok(Document::new());
        }
        match serde_json::from_str(&raw) {
            Ok(map) => Ok(map),
            Err(e) => {
                // A corrupt medium is treated as empty and rewritten on the
                // next write.
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Corrupt storage file, starting empty"
                );
                Ok(Document::new())
            }
        }
    }

    fn store(&self, data: &Document) -> Result<()> {
        let parent = match self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            Some(parent) => {
                fs::create_dir_all(parent)?;
                parent
            }
            None => Path::new("."),
        };
        let mut tmp = NamedTempFile::new_in(parent)?;
        tmp.write_all(&serde_json::to_vec_pretty(data)?)?;
        tmp.flush()?;
        tmp.persist(&self.path).map_err(std::io::Error::from)?;
        Ok(())
    }

    /// Changes between the last seen contents and `current`, made by
    /// writers other than this handle. Empty while unwatched.
    fn foreign_changes(&self, current: &Document) -> Vec<StorageEvent> {
        let mut seen = self.seen();
        let Some(previous) = seen.as_ref() else {
            return Vec::new();
        };
        let mut changes: Vec<StorageEvent> = current
            .iter()
            .filter(|(k, v)| previous.get(*k) != Some(*v))
            .map(|(k, v)| StorageEvent {
                key: k.clone(),
                new_value: Some(v.clone()),
            })
            .collect();
        changes.extend(
            previous
                .keys()
                .filter(|k| !current.contains_key(*k))
                .map(|k| StorageEvent {
                    key: k.clone(),
                    new_value: None,
                }),
        );
        *seen = Some(current.clone());
        changes
    }

    /// Record this handle's own write so the next poll does not report it.
    fn remember(&self, data: Document) {
        let mut seen = self.seen();
        if seen.is_some() {
            *seen = Some(data);
        }
    }

    fn poll(&self) {
        let changes = {
            let _guard = self.lock_io();
            match self.load() {
                Ok(current) => self.foreign_changes(&current),
                Err(e) => {
                    tracing::debug!(path = %self.path.display(), error = %e, "Storage poll failed");
                    return;
                }
            }
        };
        for event in changes {
            tracing::trace!(storage_key = %event.key, "Storage changed by another writer");
            let _ = self.events.send(event);
        }
    }

    fn emit_all(&self, events: Vec<StorageEvent>) {
        for event in events {
            let _ = self.events.send(event);
        }
    }
}

impl KeyValueStore for FileKv {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let _guard = self.shared.lock_io();
        Ok(self.shared.load()?.remove(key))
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        {
            let _guard = self.shared.lock_io();
            let mut data = self.shared.load()?;
            self.shared.emit_all(self.shared.foreign_changes(&data));
            data.insert(key.to_string(), value.to_string());
            self.shared.store(&data)?;
            self.shared.remember(data);
        }
        self.shared.emit_all(vec![StorageEvent {
            key: key.to_string(),
            new_value: Some(value.to_string()),
        }]);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let removed = {
            let _guard = self.shared.lock_io();
            let mut data = self.shared.load()?;
            self.shared.emit_all(self.shared.foreign_changes(&data));
            let removed = data.remove(key).is_some();
            if removed {
                self.shared.store(&data)?;
                self.shared.remember(data);
            }
            removed
        };
        if removed {
            self.shared.emit_all(vec![StorageEvent {
                key: key.to_string(),
                new_value: None,
            }]);
        }
        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let _guard = self.shared.lock_io();
        Ok(self
            .shared
            .load()?
            .into_keys()
            .filter(|k| k.starts_with(prefix))
            .collect())
    }

    fn changes(&self) -> Option<broadcast::Receiver<StorageEvent>> {
        let rx = self.shared.events.subscribe();
        self.start_watcher();
        Some(rx)
    }
}

//! Two contexts sharing one medium: delta delivery on both paths, lock
//! exclusion, manual overrides, and snapshot persistence.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use uuid::Uuid;

use tempfile::TempDir;

use riskcoord_store::{
    BroadcastMessage, BroadcastSync, CacheConfig, CacheEntry, CacheStore, Clock, ExtractionStatus,
    FileKv, InProcessBus, KeyValueStore, LockConfig, LockManager, ManualClock, MemoryKv,
    MessageBus, MessageKind, ProjectScope, Result, StorageEvent, Subscription, SystemClock,
    TaskKey,
};

struct Context {
    cache: Arc<CacheStore>,
    sync: BroadcastSync,
    _sub: Subscription,
}

fn context(kv: Arc<dyn KeyValueStore>, bus: Arc<dyn MessageBus>, clock: Arc<dyn Clock>) -> Context {
    let scope = ProjectScope::new("p1");
    let cache = Arc::new(CacheStore::new(scope.clone(), kv.clone(), clock, CacheConfig::default()));
    let sync = BroadcastSync::new(scope, Uuid::now_v7(), bus, kv);
    let target = Arc::clone(&cache);
    let sub = sync.subscribe(move |kind, key, entry| {
        match kind {
            MessageKind::CacheUpdate => target.apply_remote(&key, entry),
            MessageKind::ManualOverride => target.apply_remote_manual(&key, entry),
        };
    });
    Context {
        cache,
        sync,
        _sub: sub,
    }
}

fn now_ms() -> chrono::DateTime<chrono::Utc> {
    chrono::DateTime::from_timestamp_millis(chrono::Utc::now().timestamp_millis()).unwrap()
}

async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

/// Bus that accepts publishes and delivers nothing, like a channel that
/// was created after the sender posted.
struct DeafBus {
    tx: broadcast::Sender<BroadcastMessage>,
}

impl MessageBus for DeafBus {
    fn publish(&self, _channel: &str, _message: BroadcastMessage) -> Result<usize> {
        Ok(0)
    }
    fn subscribe(&self, _channel: &str) -> broadcast::Receiver<BroadcastMessage> {
        self.tx.subscribe()
    }
}

#[tokio::test]
async fn test_success_reaches_other_context_over_bus() {
    let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryKv::new());
    let bus: Arc<dyn MessageBus> = Arc::new(InProcessBus::new());
    let a = context(kv.clone(), bus.clone(), Arc::new(SystemClock));
    let b = context(kv, bus, Arc::new(SystemClock));

    let key = TaskKey::new("acme-nda");
    let entry = CacheEntry::success(&key, "acme-nda.pdf", chrono::Utc::now(), Some(serde_json::json!([1, 2, 3])));
    assert!(a.cache.put(&key, entry.clone()));
    let stored = a.cache.get(&key).unwrap();
    a.sync.publish(&key, &stored);

    settle().await;
    let seen = b.cache.get(&key).expect("delta applied in second context");
    assert_eq!(seen.status, ExtractionStatus::Success);
    assert_eq!(seen.finding_count(), Some(3));
}

#[tokio::test]
async fn test_fallback_slot_delivers_when_bus_is_deaf() {
    let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryKv::new());
    let bus: Arc<dyn MessageBus> = Arc::new(DeafBus {
        tx: broadcast::channel(8).0,
    });
    let a = context(kv.clone(), bus.clone(), Arc::new(SystemClock));
    let b = context(kv, bus, Arc::new(SystemClock));

    let key = TaskKey::new("acme-nda");
    let entry = CacheEntry::processing(&key, "acme-nda.pdf", chrono::Utc::now());
    a.sync.publish(&key, &entry);

    settle().await;
    assert_eq!(b.cache.get(&key).unwrap().status, ExtractionStatus::Processing);
    // The publisher ignores its own delta on the slot path.
    assert!(a.cache.get(&key).is_none());
}

#[tokio::test]
async fn test_duplicate_delivery_applies_once() {
    let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryKv::new());
    let bus: Arc<dyn MessageBus> = Arc::new(InProcessBus::new());
    let a = context(kv.clone(), bus.clone(), Arc::new(SystemClock));
    let b = context(kv, bus, Arc::new(SystemClock));
    let mut changes = b.cache.subscribe();

    let key = TaskKey::new("acme-nda");
    let entry = CacheEntry::failed(&key, "acme-nda.pdf", now_ms(), "timeout");
    a.sync.publish(&key, &entry);

    settle().await;
    assert!(changes.try_recv().is_ok());
    assert!(changes.try_recv().is_err(), "second path delivery was a no-op");
}

#[test]
fn test_lock_exclusion_between_contexts() {
    let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryKv::new());
    let clock = Arc::new(ManualClock::starting_now());
    let scope = ProjectScope::new("p1");
    let a = LockManager::new(scope.clone(), kv.clone(), clock.clone(), LockConfig::default());
    let b = LockManager::new(scope, kv, clock.clone(), LockConfig::default());
    let key = TaskKey::new("acme-nda");

    assert!(a.try_acquire(&key));
    assert!(!b.try_acquire(&key));
    a.release(&key);
    assert!(b.try_acquire(&key));
}

/// Counts snapshot writes.
struct CountingKv {
    inner: MemoryKv,
    sets: AtomicUsize,
}

impl KeyValueStore for CountingKv {
    fn get(&self, key: &str) -> Result<Option<String>> {
        self.inner.get(key)
    }
    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.sets.fetch_add(1, Ordering::SeqCst);
        self.inner.set(key, value)
    }
    fn remove(&self, key: &str) -> Result<()> {
        self.inner.remove(key)
    }
    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        self.inner.keys_with_prefix(prefix)
    }
    fn changes(&self) -> Option<broadcast::Receiver<StorageEvent>> {
        self.inner.changes()
    }
}

#[tokio::test(start_paused = true)]
async fn test_burst_of_writes_persists_once() {
    let kv = Arc::new(CountingKv {
        inner: MemoryKv::new(),
        sets: AtomicUsize::new(0),
    });
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let cache = Arc::new(CacheStore::new(ProjectScope::new("p1"), kv.clone(), clock, CacheConfig::default()));
    let _persister = cache.spawn_persister();

    for name in ["a", "b", "c", "d"] {
        let key = TaskKey::new(name);
        cache.put(&key, CacheEntry::processing(&key, name, chrono::Utc::now()));
    }
    settle().await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(kv.sets.load(Ordering::SeqCst), 0, "nothing written inside the window");

    tokio::time::sleep(Duration::from_millis(500)).await;
    settle().await;
    assert_eq!(kv.sets.load(Ordering::SeqCst), 1);

    let raw = kv.get("risk_extraction_cache_p1").unwrap().unwrap();
    let snapshot: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(snapshot.as_object().unwrap().len(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_flush_inside_window_skips_trailing_write() {
    let kv = Arc::new(CountingKv {
        inner: MemoryKv::new(),
        sets: AtomicUsize::new(0),
    });
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let cache = Arc::new(CacheStore::new(ProjectScope::new("p1"), kv.clone(), clock, CacheConfig::default()));
    let _persister = cache.spawn_persister();

    let key = TaskKey::new("a");
    cache.put(&key, CacheEntry::processing(&key, "a.pdf", chrono::Utc::now()));
    assert!(cache.flush());

    tokio::time::sleep(Duration::from_millis(800)).await;
    settle().await;
    assert_eq!(kv.sets.load(Ordering::SeqCst), 1);
}

#[test]
fn test_snapshot_survives_into_new_context() {
    let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryKv::new());
    let clock = Arc::new(ManualClock::starting_now());
    let scope = ProjectScope::new("p1");

    let first = CacheStore::new(scope.clone(), kv.clone(), clock.clone(), CacheConfig::default());
    let key = TaskKey::new("ACME-NDA.pdf");
    first.put(&key, CacheEntry::success(&key, "ACME-NDA.pdf", clock.now(), None));
    assert!(first.flush());

    clock.advance(chrono::Duration::hours(1));
    let second = CacheStore::new(scope.clone(), kv.clone(), clock.clone(), CacheConfig::default());
    assert_eq!(second.restore_from_medium(), 1);
    assert_eq!(second.get(&key).unwrap().status, ExtractionStatus::Success);

    clock.advance(chrono::Duration::hours(24));
    let third = CacheStore::new(scope, kv, clock, CacheConfig::default());
    assert_eq!(third.restore_from_medium(), 0);
}

#[test]
fn test_separate_file_handles_keep_each_others_results() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("medium.json");
    let clock = Arc::new(ManualClock::starting_now());
    let scope = ProjectScope::new("p1");
    let store = |kv: FileKv| CacheStore::new(scope.clone(), Arc::new(kv), clock.clone(), CacheConfig::default());

    // Two runners with no delta path between them.
    let a = store(FileKv::open(&path));
    let b = store(FileKv::open(&path));
    let (ka, kb) = (TaskKey::new("doc-a"), TaskKey::new("doc-b"));

    a.put(&ka, CacheEntry::success(&ka, "doc-a.pdf", clock.now(), None));
    assert!(a.flush());
    b.put(&kb, CacheEntry::success(&kb, "doc-b.pdf", clock.now(), None));
    assert!(b.flush());

    let fresh = store(FileKv::open(&path));
    assert_eq!(fresh.restore_from_medium(), 2);
    assert_eq!(fresh.get(&ka).unwrap().status, ExtractionStatus::Success);
    assert_eq!(fresh.get(&kb).unwrap().status, ExtractionStatus::Success);

    // A clear is not undone by the clearing runner's next write.
    fresh.clear();
    assert!(fresh.flush());
    assert!(fresh.flush());
    assert_eq!(store(FileKv::open(&path)).restore_from_medium(), 0);
}

#[tokio::test]
async fn test_manual_override_reaches_other_context() {
    let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryKv::new());
    let bus: Arc<dyn MessageBus> = Arc::new(InProcessBus::new());
    let clock = Arc::new(ManualClock::starting_now());
    let a = context(kv.clone(), bus.clone(), clock.clone());
    let b = context(kv.clone(), bus, clock.clone());

    let key = TaskKey::new("acme-nda");
    a.cache.put(&key, CacheEntry::success(&key, "acme-nda.pdf", clock.now(), None));
    let done = a.cache.get(&key).unwrap();
    a.sync.publish(&key, &done);
    settle().await;
    assert_eq!(b.cache.get(&key).unwrap().status, ExtractionStatus::Success);
    assert!(b.cache.flush());

    clock.advance(chrono::Duration::seconds(3));
    let reset = a.cache.set_manual(&key, CacheEntry::pending(&key, "acme-nda.pdf", clock.now()));
    a.sync.publish_manual(&key, &reset);
    settle().await;
    assert_eq!(b.cache.get(&key).unwrap().status, ExtractionStatus::Pending);

    assert!(a.cache.flush());
    assert!(b.cache.flush());
    let raw = kv.get("risk_extraction_cache_p1").unwrap().unwrap();
    assert!(!raw.contains("\"success\""), "snapshot still holds success: {raw}");
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 2s");
}

#[tokio::test]
async fn test_runners_on_one_file_see_each_others_deltas() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("medium.json");
    let clock = Arc::new(ManualClock::starting_now());
    // Separate handles and separate buses: only the file connects them.
    let open = || {
        let kv: Arc<dyn KeyValueStore> =
            Arc::new(FileKv::open(&path).with_poll_interval(Duration::from_millis(10)));
        context(kv, Arc::new(InProcessBus::new()), clock.clone())
    };
    let a = open();
    let b = open();
    let key = TaskKey::new("acme-nda");

    a.cache.put(&key, CacheEntry::success(&key, "acme-nda.pdf", clock.now(), None));
    let done = a.cache.get(&key).unwrap();
    a.sync.publish(&key, &done);
    eventually(|| b.cache.get(&key).is_some_and(|e| e.status == ExtractionStatus::Success)).await;

    clock.advance(chrono::Duration::seconds(3));
    let reset = a.cache.set_manual(&key, CacheEntry::pending(&key, "acme-nda.pdf", clock.now()));
    a.sync.publish_manual(&key, &reset);
    eventually(|| b.cache.get(&key).is_some_and(|e| e.status == ExtractionStatus::Pending)).await;

    // Neither runner writes the old success back.
    assert!(b.cache.flush());
    assert!(a.cache.flush());
    let fresh = CacheStore::new(
        ProjectScope::new("p1"),
        Arc::new(FileKv::open(&path)),
        clock.clone(),
        CacheConfig::default(),
    );
    fresh.restore_from_medium();
    assert_eq!(fresh.get(&key).unwrap().status, ExtractionStatus::Pending);
}

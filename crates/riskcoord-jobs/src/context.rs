//! One execution context wired onto a shared medium.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::info;
use uuid::Uuid;

use riskcoord_core::{
    Classifier, Clock, Error, KeyValueStore, MessageBus, MessageKind, ProjectScope, Result,
    ResultStore, SystemClock,
};
use riskcoord_store::{
    BroadcastSync, CacheConfig, CacheStore, LockConfig, LockManager, Subscription,
};

use crate::config::SchedulerConfig;
use crate::lifecycle::LifecycleGuard;
use crate::scheduler::ExtractionScheduler;

/// Builder for [`ExtractionContext`].
pub struct ContextBuilder {
    project_id: String,
    kv: Option<Arc<dyn KeyValueStore>>,
    bus: Option<Arc<dyn MessageBus>>,
    classifier: Option<Arc<dyn Classifier>>,
    results: Option<Arc<dyn ResultStore>>,
    clock: Arc<dyn Clock>,
    cache_config: CacheConfig,
    lock_config: LockConfig,
    scheduler_config: SchedulerConfig,
}

impl ContextBuilder {
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            kv: None,
            bus: None,
            classifier: None,
            results: None,
            clock: Arc::new(SystemClock),
            cache_config: CacheConfig::default(),
            lock_config: LockConfig::default(),
            scheduler_config: SchedulerConfig::default(),
        }
    }

    pub fn kv(mut self, kv: Arc<dyn KeyValueStore>) -> Self {
        self.kv = Some(kv);
        self
    }

    pub fn bus(mut self, bus: Arc<dyn MessageBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn classifier(mut self, classifier: Arc<dyn Classifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn results(mut self, results: Arc<dyn ResultStore>) -> Self {
        self.results = Some(results);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn cache_config(mut self, config: CacheConfig) -> Self {
        self.cache_config = config;
        self
    }

    pub fn lock_config(mut self, config: LockConfig) -> Self {
        self.lock_config = config;
        self
    }

    pub fn scheduler_config(mut self, config: SchedulerConfig) -> Self {
        self.scheduler_config = config;
        self
    }

    /// Take every setting from the environment.
    pub fn from_env(self) -> Self {
        self.cache_config(CacheConfig::from_env())
            .lock_config(LockConfig::from_env())
            .scheduler_config(SchedulerConfig::from_env())
    }

    /// Restore the persisted cache, start the snapshot writer, and begin
    /// listening for deltas. Must be called inside a Tokio runtime.
    pub fn build(self) -> Result<ExtractionContext> {
        if self.project_id.trim().is_empty() {
            return Err(Error::Config("project id is empty".into()));
        }
        let kv = self
            .kv
            .ok_or_else(|| Error::Config("shared storage not configured".into()))?;
        let bus = self
            .bus
            .ok_or_else(|| Error::Config("message bus not configured".into()))?;
        let classifier = self
            .classifier
            .ok_or_else(|| Error::Config("classifier not configured".into()))?;
        let results = self
            .results
            .ok_or_else(|| Error::Config("result store not configured".into()))?;

        let scope = ProjectScope::new(self.project_id);
        let origin = Uuid::now_v7();

        let cache = Arc::new(CacheStore::new(
            scope.clone(),
            Arc::clone(&kv),
            Arc::clone(&self.clock),
            self.cache_config,
        ));
        let restored = cache.restore_from_medium();
        let persister = cache.spawn_persister();

        let locks = Arc::new(LockManager::new(
            scope.clone(),
            Arc::clone(&kv),
            Arc::clone(&self.clock),
            self.lock_config,
        ));
        let sync = Arc::new(BroadcastSync::new(scope.clone(), origin, bus, kv));

        let remote_cache = Arc::clone(&cache);
        let subscription = sync.subscribe(move |kind, key, entry| {
            match kind {
                MessageKind::CacheUpdate => remote_cache.apply_remote(&key, entry),
                MessageKind::ManualOverride => remote_cache.apply_remote_manual(&key, entry),
            };
        });

        let scheduler = ExtractionScheduler::new(
            Arc::clone(&cache),
            Arc::clone(&locks),
            Arc::clone(&sync),
            classifier,
            results,
            Arc::clone(&self.clock),
            self.scheduler_config,
        );
        let lifecycle = LifecycleGuard::new(
            Arc::clone(&cache),
            Arc::clone(&locks),
            Arc::clone(&sync),
            self.clock,
            scheduler.clone(),
        );

        info!(
            component = "context",
            project_id = %scope.project_id(),
            context_id = %origin,
            entry_count = restored,
            "Context started"
        );

        Ok(ExtractionContext {
            scope,
            cache,
            locks,
            sync,
            scheduler,
            lifecycle,
            _subscription: subscription,
            persister,
        })
    }
}

/// A running context: cache, locks, broadcast listener, and scheduler.
pub struct ExtractionContext {
    scope: ProjectScope,
    cache: Arc<CacheStore>,
    locks: Arc<LockManager>,
    sync: Arc<BroadcastSync>,
    scheduler: ExtractionScheduler,
    lifecycle: LifecycleGuard,
    _subscription: Subscription,
    persister: JoinHandle<()>,
}

impl ExtractionContext {
    pub fn scope(&self) -> &ProjectScope {
        &self.scope
    }

    pub fn origin(&self) -> Uuid {
        self.sync.origin()
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    pub fn scheduler(&self) -> &ExtractionScheduler {
        &self.scheduler
    }

    pub fn lifecycle(&self) -> &LifecycleGuard {
        &self.lifecycle
    }

    /// Persist the snapshot and stop listening.
    pub fn close(self) {
        self.cache.flush();
        info!(component = "context", project_id = %self.scope.project_id(), "Context closed");
    }
}

impl Drop for ExtractionContext {
    fn drop(&mut self) {
        self.persister.abort();
    }
}

//! Extraction scheduler.
//!
//! One pass takes the candidate tasks, drops those the cache says need no
//! work, and runs the rest at most `max_concurrent` at a time with at most
//! `rate_cap` starts per rolling window. Each task runs
//! lock → re-check → durable-store check → `processing` → classify → save →
//! `success`/`failed` → release, publishing every status write. Whatever
//! goes wrong inside one task, panics included, is recorded for that task
//! only.

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::sync::{broadcast, watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use riskcoord_core::defaults::{EVENT_CAPACITY, UNKNOWN_ERROR};
use riskcoord_core::{
    CacheEntry, ClassificationOutcome, Classifier, Clock, Error, ExtractionStatus, ExtractionTask,
    ProcessingState, Result, ResultStore, TaskKey,
};
use riskcoord_store::{BroadcastSync, CacheStore, LockManager};

use crate::config::SchedulerConfig;
use crate::events::{SchedulerEvent, SkipReason};
use crate::rate_limit::SlidingWindowLimiter;

/// Whether a cache entry allows an automatic run.
pub fn eligibility(
    entry: Option<&CacheEntry>,
    now: DateTime<Utc>,
    config: &SchedulerConfig,
) -> std::result::Result<(), SkipReason> {
    let Some(entry) = entry else {
        return Ok(());
    };
    match entry.status {
        ExtractionStatus::Success => Err(SkipReason::Succeeded),
        ExtractionStatus::Processing if entry.is_fresh(now, config.processing_stale()) => {
            Err(SkipReason::FreshProcessing)
        }
        ExtractionStatus::Failed if entry.is_fresh(now, config.failed_retry()) => {
            Err(SkipReason::RecentlyFailed)
        }
        _ => Ok(()),
    }
}

/// How one task settled.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Skipped(SkipReason),
    Completed { findings: usize, recovered: bool },
    Failed(String),
}

/// Totals of a finished pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Result of asking for a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    /// Another pass of this scheduler is running.
    Refused,
    /// No candidate needed work.
    Idle,
    Finished(PassSummary),
}

impl PassOutcome {
    pub fn summary(&self) -> Option<&PassSummary> {
        match self {
            Self::Finished(summary) => Some(summary),
            _ => None,
        }
    }
}

struct Shared {
    cache: Arc<CacheStore>,
    locks: Arc<LockManager>,
    sync: Arc<BroadcastSync>,
    classifier: Arc<dyn Classifier>,
    results: Arc<dyn ResultStore>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    limiter: SlidingWindowLimiter,
    permits: Semaphore,
    running: AtomicBool,
    enqueued: Mutex<HashSet<TaskKey>>,
    /// Keys this context moved to `processing` and has not settled yet.
    in_flight: Mutex<HashSet<TaskKey>>,
    candidates: RwLock<Vec<ExtractionTask>>,
    state: watch::Sender<ProcessingState>,
    events: broadcast::Sender<SchedulerEvent>,
}

/// Scheduler for one execution context. Cloning shares the same scheduler.
#[derive(Clone)]
pub struct ExtractionScheduler {
    shared: Arc<Shared>,
}

impl ExtractionScheduler {
    pub fn new(
        cache: Arc<CacheStore>,
        locks: Arc<LockManager>,
        sync: Arc<BroadcastSync>,
        classifier: Arc<dyn Classifier>,
        results: Arc<dyn ResultStore>,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (state, _) = watch::channel(ProcessingState::default());
        Self {
            shared: Arc::new(Shared {
                limiter: SlidingWindowLimiter::new(config.rate_cap, config.rate_window()),
                permits: Semaphore::new(config.max_concurrent.max(1)),
                cache,
                locks,
                sync,
                classifier,
                results,
                clock,
                config,
                running: AtomicBool::new(false),
                enqueued: Mutex::new(HashSet::new()),
                in_flight: Mutex::new(HashSet::new()),
                candidates: RwLock::new(Vec::new()),
                state,
                events,
            }),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    pub fn events(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.shared.events.subscribe()
    }

    /// Current progress of this scheduler.
    pub fn state(&self) -> ProcessingState {
        self.shared.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ProcessingState> {
        self.shared.state.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Keys this context is classifying right now.
    pub fn owned_in_flight(&self) -> Vec<TaskKey> {
        let mut keys: Vec<_> = lock(&self.shared.in_flight).iter().cloned().collect();
        keys.sort();
        keys
    }

    // =========================================================================
    // CANDIDATES
    // =========================================================================

    /// Record the candidate set the owning view shows.
    pub fn mount(&self, candidates: Vec<ExtractionTask>) {
        info!(component = "scheduler", candidates = candidates.len(), "Mounted candidates");
        *self
            .shared
            .candidates
            .write()
            .unwrap_or_else(PoisonError::into_inner) = candidates;
    }

    pub fn candidates(&self) -> Vec<ExtractionTask> {
        self.shared
            .candidates
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// First pass after mounting. Skipped when any candidate already
    /// succeeded, since the view then shows results instead of starting work.
    pub async fn auto_start(&self) -> PassOutcome {
        let candidates = self.candidates();
        let already_done = candidates
            .iter()
            .any(|t| matches!(self.shared.cache.get(&t.key), Some(e) if e.status == ExtractionStatus::Success));
        if already_done {
            debug!(component = "scheduler", "Auto-start skipped, results already present");
            return PassOutcome::Idle;
        }
        self.run_pass(candidates).await
    }

    /// Pass over the mounted candidates.
    pub async fn run_mounted(&self) -> PassOutcome {
        self.run_pass(self.candidates()).await
    }

    // =========================================================================
    // OPERATOR OVERRIDES
    // =========================================================================

    /// Forget every failure and run the mounted candidates again.
    pub async fn retry_failed(&self) -> PassOutcome {
        let failed = self.shared.cache.keys_with_status(ExtractionStatus::Failed);
        for key in &failed {
            self.shared.cache.remove(key);
        }
        self.shared.state.send_modify(|state| state.failed_keys.clear());
        info!(component = "scheduler", cleared = failed.len(), "Retrying failed tasks");
        self.run_mounted().await
    }

    /// Drop one entry, or the whole cache, and persist the result.
    pub fn clear_cache(&self, key: Option<&TaskKey>) -> usize {
        let removed = match key {
            Some(key) => usize::from(self.shared.cache.remove(key).is_some()),
            None => self.shared.cache.clear(),
        };
        self.shared.cache.flush();
        info!(component = "scheduler", removed, "Cleared cache");
        removed
    }

    /// Force a status for `key`, bypassing the success rule, and broadcast
    /// it as an override every other context applies as well.
    pub fn update_status(&self, key: &TaskKey, status: ExtractionStatus) -> CacheEntry {
        let now = self.shared.clock.now();
        let base = self.shared.cache.get(key).unwrap_or_else(|| {
            let file_name = self
                .candidates()
                .into_iter()
                .find(|t| &t.key == key)
                .map(|t| t.file_name)
                .unwrap_or_else(|| key.to_string());
            CacheEntry::pending(key, &file_name, now)
        });
        let mut entry = base.with_status(status, now);
        if status == ExtractionStatus::Failed && entry.error.is_none() {
            entry.error = Some("Marked failed manually".to_string());
        }
        let stored = self.shared.cache.set_manual(key, entry);
        self.shared.sync.publish_manual(key, &stored);
        stored
    }

    // =========================================================================
    // PASS
    // =========================================================================

    /// Run one scheduling pass over `tasks`.
    #[instrument(skip(self, tasks), fields(project_id = %self.shared.cache.scope().project_id(), candidates = tasks.len()))]
    pub async fn run_pass(&self, tasks: Vec<ExtractionTask>) -> PassOutcome {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            debug!(component = "scheduler", "Pass refused, another pass is running");
            return PassOutcome::Refused;
        }

        let start = Instant::now();
        let mut skipped = 0;
        let targets = self.select_targets(tasks, &mut skipped);
        if targets.is_empty() {
            self.shared.running.store(false, Ordering::SeqCst);
            debug!(component = "scheduler", skipped, "Nothing to schedule");
            return PassOutcome::Idle;
        }

        let total = targets.len();
        self.shared.state.send_replace(ProcessingState::started(total));
        let _ = self.shared.events.send(SchedulerEvent::PassStarted { total });
        info!(component = "scheduler", total, skipped, "Pass started");

        let mut join_set = JoinSet::new();
        for task in targets {
            let scheduler = self.clone();
            join_set.spawn(async move { scheduler.run_queued(task).await });
        }

        let mut summary = PassSummary {
            total,
            skipped,
            ..PassSummary::default()
        };
        while let Some(joined) = join_set.join_next().await {
            let (key, outcome) = match joined {
                Ok(report) => report,
                Err(e) => {
                    error!(component = "scheduler", error = ?e, "Task join failed");
                    summary.failed += 1;
                    continue;
                }
            };
            match &outcome {
                TaskOutcome::Skipped(_) => summary.skipped += 1,
                TaskOutcome::Completed { .. } => summary.completed += 1,
                TaskOutcome::Failed(_) => summary.failed += 1,
            }
            self.shared.state.send_modify(|state| {
                state.completed_count += 1;
                if matches!(outcome, TaskOutcome::Failed(_)) {
                    state.failed_keys.insert(key.clone());
                }
            });
        }

        lock(&self.shared.enqueued).clear();
        self.shared.state.send_modify(|state| state.is_processing = false);
        let _ = self.shared.events.send(SchedulerEvent::PassFinished {
            completed: summary.completed,
            failed: summary.failed,
        });
        self.shared.running.store(false, Ordering::SeqCst);

        info!(
            component = "scheduler",
            total,
            completed = summary.completed,
            failed = summary.failed,
            skipped = summary.skipped,
            duration_ms = start.elapsed().as_millis() as u64,
            "Pass finished"
        );
        PassOutcome::Finished(summary)
    }

    fn select_targets(&self, tasks: Vec<ExtractionTask>, skipped: &mut usize) -> Vec<ExtractionTask> {
        let now = self.shared.clock.now();
        let mut seen = HashSet::new();
        let mut enqueued = lock(&self.shared.enqueued);
        let mut targets = Vec::new();

        for task in tasks {
            if task.key.is_empty() || !seen.insert(task.key.clone()) {
                continue;
            }
            let verdict = if task.is_saved {
                Err(SkipReason::Saved)
            } else if enqueued.contains(&task.key) {
                Err(SkipReason::AlreadyEnqueued)
            } else {
                eligibility(self.shared.cache.get(&task.key).as_ref(), now, &self.shared.config)
            };
            match verdict {
                Ok(()) => {
                    enqueued.insert(task.key.clone());
                    targets.push(task);
                }
                Err(reason) => {
                    *skipped += 1;
                    self.skip(&task.key, reason);
                }
            }
        }
        targets
    }

    fn skip(&self, key: &TaskKey, reason: SkipReason) -> TaskOutcome {
        debug!(component = "scheduler", task_key = %key, skip_reason = %reason, "Task skipped");
        let _ = self.shared.events.send(SchedulerEvent::TaskSkipped {
            key: key.clone(),
            reason,
        });
        TaskOutcome::Skipped(reason)
    }

    /// Wait for capacity, then run the task; panics become a failure.
    async fn run_queued(self, task: ExtractionTask) -> (TaskKey, TaskOutcome) {
        let key = task.key.clone();
        let file_name = task.file_name.clone();

        let _permit = match self.shared.permits.acquire().await {
            Ok(permit) => permit,
            Err(_) => return (key, TaskOutcome::Failed("Scheduler closed".to_string())),
        };
        self.shared.limiter.acquire().await;

        match AssertUnwindSafe(self.run_task(task)).catch_unwind().await {
            Ok(outcome) => (key, outcome),
            Err(panic) => {
                let message = panic
                    .downcast_ref::<String>()
                    .cloned()
                    .or_else(|| panic.downcast_ref::<&str>().map(|s| s.to_string()))
                    .unwrap_or_else(|| UNKNOWN_ERROR.to_string());
                error!(component = "scheduler", task_key = %key, error = %message, "Task panicked");
                let outcome = self.settle_failure(&key, &file_name, format!("Task panicked: {message}"));
                (key, outcome)
            }
        }
    }

    #[instrument(skip(self, task), fields(task_key = %task.key))]
    async fn run_task(&self, task: ExtractionTask) -> TaskOutcome {
        let key = task.key.clone();
        let cache = &self.shared.cache;

        if !self.shared.locks.try_acquire(&key) {
            return self.skip(&key, SkipReason::Locked);
        }

        // Second look now that the lock is ours.
        let now = self.shared.clock.now();
        if let Err(reason) = eligibility(cache.get(&key).as_ref(), now, &self.shared.config) {
            self.shared.locks.release(&key);
            return self.skip(&key, reason);
        }

        match self
            .shared
            .results
            .existing_result_count(&key, task.file_stem())
            .await
        {
            Ok(count) if count > 0 => {
                let entry = CacheEntry::success(&key, &task.file_name, self.shared.clock.now(), None);
                self.write_and_publish(&key, entry);
                self.shared.locks.release(&key);
                info!(component = "scheduler", task_key = %key, finding_count = count, "Recovered stored result");
                let _ = self.shared.events.send(SchedulerEvent::TaskCompleted {
                    key: key.clone(),
                    findings: count,
                    recovered: true,
                });
                return TaskOutcome::Completed {
                    findings: count,
                    recovered: true,
                };
            }
            Ok(_) => {}
            Err(e) => {
                debug!(component = "scheduler", task_key = %key, error = %e, "Existence check failed, classifying");
            }
        }

        let processing = CacheEntry::processing(&key, &task.file_name, self.shared.clock.now());
        if !self.write_and_publish(&key, processing) {
            self.shared.locks.release(&key);
            return self.skip(&key, SkipReason::Succeeded);
        }
        lock(&self.shared.in_flight).insert(key.clone());
        let _ = self
            .shared
            .events
            .send(SchedulerEvent::TaskStarted { key: key.clone() });

        let start = Instant::now();
        let outcome = match self.classify(&task).await {
            Ok(outcome) => outcome,
            Err(e) => {
                let message = e.to_string();
                warn!(
                    component = "scheduler",
                    task_key = %key,
                    error = %message,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Classification failed"
                );
                return self.settle_failure(&key, &task.file_name, message);
            }
        };

        let findings = outcome.classifications.len();
        if let Err(e) = self
            .shared
            .results
            .save_result(&key, task.file_stem(), &outcome.classifications)
            .await
        {
            warn!(component = "scheduler", task_key = %key, error = %e, "Saving result failed, keeping local success");
        }

        let payload = match serde_json::to_value(&outcome.classifications) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(component = "scheduler", task_key = %key, error = %e, "Result not serializable, caching status only");
                None
            }
        };
        let success = CacheEntry::success(&key, &task.file_name, self.shared.clock.now(), payload);
        self.write_and_publish(&key, success);
        lock(&self.shared.in_flight).remove(&key);
        self.shared.locks.release(&key);

        info!(
            component = "scheduler",
            task_key = %key,
            finding_count = findings,
            duration_ms = start.elapsed().as_millis() as u64,
            "Task completed"
        );
        let _ = self.shared.events.send(SchedulerEvent::TaskCompleted {
            key,
            findings,
            recovered: false,
        });
        TaskOutcome::Completed {
            findings,
            recovered: false,
        }
    }

    async fn classify(&self, task: &ExtractionTask) -> Result<ClassificationOutcome> {
        if task.articles.is_empty() {
            return Err(Error::Classification("No articles found in OCR data".to_string()));
        }
        let timeout = self.shared.config.classify_timeout();
        match tokio::time::timeout(timeout, self.shared.classifier.classify(task)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(timeout.as_millis() as u64)),
        }
    }

    /// Record a failure unless a success landed meanwhile, then release.
    fn settle_failure(&self, key: &TaskKey, file_name: &str, message: String) -> TaskOutcome {
        let message = if message.trim().is_empty() {
            UNKNOWN_ERROR.to_string()
        } else {
            message
        };
        let failed = CacheEntry::failed(key, file_name, self.shared.clock.now(), message.clone());
        let written = self.write_and_publish(key, failed);
        lock(&self.shared.in_flight).remove(key);
        self.shared.locks.release(key);

        if !written {
            return self.skip(key, SkipReason::Succeeded);
        }
        let _ = self.shared.events.send(SchedulerEvent::TaskFailed {
            key: key.clone(),
            error: message.clone(),
        });
        TaskOutcome::Failed(message)
    }

    /// Write through the cache and broadcast what was stored.
    fn write_and_publish(&self, key: &TaskKey, entry: CacheEntry) -> bool {
        if !self.shared.cache.put(key, entry) {
            return false;
        }
        if let Some(stored) = self.shared.cache.get(key) {
            self.shared.sync.publish(key, &stored);
        }
        true
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn entry(status: ExtractionStatus, age_mins: i64, now: DateTime<Utc>) -> CacheEntry {
        let key = TaskKey::new("acme-nda");
        let at = now - ChronoDuration::minutes(age_mins);
        match status {
            ExtractionStatus::Pending => CacheEntry::pending(&key, "a.pdf", at),
            ExtractionStatus::Processing => CacheEntry::processing(&key, "a.pdf", at),
            ExtractionStatus::Success => CacheEntry::success(&key, "a.pdf", at, None),
            ExtractionStatus::Failed => CacheEntry::failed(&key, "a.pdf", at, "x"),
        }
    }

    #[test]
    fn test_eligibility_table() {
        let now = Utc::now();
        let config = SchedulerConfig::default();
        let check = |status, age| eligibility(Some(&entry(status, age, now)), now, &config);

        assert_eq!(eligibility(None, now, &config), Ok(()));
        assert_eq!(check(ExtractionStatus::Pending, 0), Ok(()));
        assert_eq!(check(ExtractionStatus::Success, 0), Err(SkipReason::Succeeded));
        assert_eq!(check(ExtractionStatus::Success, 60 * 23), Err(SkipReason::Succeeded));
        assert_eq!(check(ExtractionStatus::Processing, 10), Err(SkipReason::FreshProcessing));
        assert_eq!(check(ExtractionStatus::Processing, 30), Ok(()));
        assert_eq!(check(ExtractionStatus::Failed, 29), Err(SkipReason::RecentlyFailed));
        assert_eq!(check(ExtractionStatus::Failed, 31), Ok(()));
    }

    #[test]
    fn test_pass_outcome_summary() {
        assert!(PassOutcome::Refused.summary().is_none());
        let finished = PassOutcome::Finished(PassSummary {
            total: 2,
            completed: 2,
            ..Default::default()
        });
        assert_eq!(finished.summary().map(|s| s.completed), Some(2));
    }
}

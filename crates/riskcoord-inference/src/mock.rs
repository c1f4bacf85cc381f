//! Deterministic collaborator doubles for testing.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use riskcoord_inference::mock::{MockClassifier, MockResultStore};
//!
//! let classifier = MockClassifier::new()
//!     .with_findings(3)
//!     .with_latency_ms(50)
//!     .with_failure_for("broken-contract", "API request failed: 500");
//! let store = MockResultStore::new().with_existing("already-done", 4);
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::time::{Duration, Instant};

use riskcoord_core::{
    Classification, ClassificationOutcome, Classifier, Error, ExtractionTask, Result, ResultStore,
    TaskKey,
};

/// One recorded classifier invocation.
#[derive(Debug, Clone)]
pub struct MockCall {
    pub key: TaskKey,
    pub article_count: usize,
    /// Tokio clock, so paused-time tests can reason about spacing.
    pub started_at: Instant,
}

#[derive(Debug, Clone, Default)]
struct MockConfig {
    findings: usize,
    latency_ms: u64,
    failures: HashMap<TaskKey, String>,
    fail_all: Option<String>,
    panics: HashSet<TaskKey>,
}

/// Classifier returning canned findings.
#[derive(Clone)]
pub struct MockClassifier {
    config: Arc<MockConfig>,
    call_log: Arc<Mutex<Vec<MockCall>>>,
    in_flight: Arc<AtomicUsize>,
    peak_in_flight: Arc<AtomicUsize>,
}

impl MockClassifier {
    pub fn new() -> Self {
        Self {
            config: Arc::new(MockConfig::default()),
            call_log: Arc::new(Mutex::new(Vec::new())),
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of findings every successful call returns.
    pub fn with_findings(mut self, n: usize) -> Self {
        Arc::make_mut(&mut self.config).findings = n;
        self
    }

    /// Simulated call duration.
    pub fn with_latency_ms(mut self, ms: u64) -> Self {
        Arc::make_mut(&mut self.config).latency_ms = ms;
        self
    }

    /// Fail calls for one task.
    pub fn with_failure_for(mut self, key: &str, message: impl Into<String>) -> Self {
        Arc::make_mut(&mut self.config)
            .failures
            .insert(TaskKey::new(key), message.into());
        self
    }

    /// Fail every call.
    pub fn failing(mut self, message: impl Into<String>) -> Self {
        Arc::make_mut(&mut self.config).fail_all = Some(message.into());
        self
    }

    /// Panic inside the call for one task.
    pub fn with_panic_for(mut self, key: &str) -> Self {
        Arc::make_mut(&mut self.config).panics.insert(TaskKey::new(key));
        self
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.call_log.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn call_count(&self) -> usize {
        self.call_log.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn calls_for(&self, key: &str) -> usize {
        let key = TaskKey::new(key);
        self.calls().iter().filter(|c| c.key == key).count()
    }

    /// Highest number of simultaneous calls observed.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn findings_for(&self, task: &ExtractionTask) -> Vec<Classification> {
        (0..self.config.findings)
            .map(|i| Classification {
                id: format!("{}-{}", task.key, i + 1),
                text: format!("clause {} of {}", i + 1, task.file_name),
                risk_type: ((i % 9) + 1).to_string(),
                reason: format!("mock finding {}", i + 1),
                article_info: Some(format!("第{}条", i + 1)),
                ..Default::default()
            })
            .collect()
    }
}

impl Default for MockClassifier {
    fn default() -> Self {
        Self::new()
    }
}

struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Classifier for MockClassifier {
    async fn classify(&self, task: &ExtractionTask) -> Result<ClassificationOutcome> {
        self.call_log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(MockCall {
                key: task.key.clone(),
                article_count: task.articles.len(),
                started_at: Instant::now(),
            });

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(Arc::clone(&self.in_flight));

        if self.config.latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.config.latency_ms)).await;
        }

        if self.config.panics.contains(&task.key) {
            panic!("mock classifier panicked for {}", task.key);
        }
        if let Some(message) = self
            .config
            .fail_all
            .as_ref()
            .or_else(|| self.config.failures.get(&task.key))
        {
            return Err(Error::Classification(message.clone()));
        }

        Ok(ClassificationOutcome {
            classifications: self.findings_for(task),
            processed_articles: task.articles.len(),
        })
    }
}

/// One recorded save.
#[derive(Debug, Clone, PartialEq)]
pub struct SavedResult {
    pub key: TaskKey,
    pub file_stem: String,
    pub finding_count: usize,
}

/// In-memory result store.
#[derive(Clone, Default)]
pub struct MockResultStore {
    existing: Arc<Mutex<HashMap<TaskKey, usize>>>,
    saved: Arc<Mutex<Vec<SavedResult>>>,
    lookups: Arc<AtomicUsize>,
    fail_saves: bool,
    fail_lookups: bool,
}

impl MockResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pretend `count` findings were saved earlier for `key`.
    pub fn with_existing(self, key: &str, count: usize) -> Self {
        self.existing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(TaskKey::new(key), count);
        self
    }

    pub fn with_failing_saves(mut self) -> Self {
        self.fail_saves = true;
        self
    }

    pub fn with_failing_lookups(mut self) -> Self {
        self.fail_lookups = true;
        self
    }

    pub fn saved(&self) -> Vec<SavedResult> {
        self.saved.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn lookup_count(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ResultStore for MockResultStore {
    async fn existing_result_count(&self, key: &TaskKey, _file_stem: &str) -> Result<usize> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if self.fail_lookups {
            return Err(Error::ResultStore("Lookup failed: 503".into()));
        }
        Ok(self
            .existing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .copied()
            .unwrap_or(0))
    }

    async fn save_result(
        &self,
        key: &TaskKey,
        file_stem: &str,
        classifications: &[Classification],
    ) -> Result<()> {
        if self.fail_saves {
            return Err(Error::ResultStore("Save failed: 500".into()));
        }
        self.saved
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(SavedResult {
                key: key.clone(),
                file_stem: file_stem.to_string(),
                finding_count: classifications.len(),
            });
        self.existing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.clone(), classifications.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_classifier_records_calls() {
        let classifier = MockClassifier::new().with_findings(3);
        let task = ExtractionTask::new("ACME-NDA.pdf");
        let outcome = classifier.classify(&task).await.unwrap();
        assert_eq!(outcome.classifications.len(), 3);
        assert_eq!(classifier.calls_for("acme-nda"), 1);
        assert_eq!(classifier.peak_in_flight(), 1);
    }

    #[tokio::test]
    async fn test_mock_classifier_failure() {
        let classifier = MockClassifier::new().with_failure_for("bad", "boom");
        let err = classifier.classify(&ExtractionTask::new("bad.pdf")).await.unwrap_err();
        assert!(err.to_string().contains("boom"));
        assert!(classifier.classify(&ExtractionTask::new("good.pdf")).await.is_ok());
    }

    #[tokio::test]
    async fn test_mock_store_save_then_lookup() {
        let store = MockResultStore::new();
        let key = TaskKey::new("acme-nda");
        assert_eq!(store.existing_result_count(&key, "acme-nda").await.unwrap(), 0);
        store
            .save_result(&key, "ACME-NDA", &[Classification::default()])
            .await
            .unwrap();
        assert_eq!(store.existing_result_count(&key, "ACME-NDA").await.unwrap(), 1);
        assert_eq!(store.saved()[0].file_stem, "ACME-NDA");
    }
}

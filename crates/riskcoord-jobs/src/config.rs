//! Scheduler configuration.

use std::time::Duration;

use riskcoord_core::defaults;

/// Configuration for an [`crate::ExtractionScheduler`].
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum simultaneous classification calls.
    pub max_concurrent: usize,
    /// Maximum classification calls started per rate window.
    pub rate_cap: usize,
    /// Rolling rate window in milliseconds.
    pub rate_window_ms: u64,
    /// Timeout for one classification call.
    pub classify_timeout_secs: u64,
    /// Age after which a `processing` entry may be taken over.
    pub processing_stale_secs: u64,
    /// Age after which a `failed` entry is retried automatically.
    pub failed_retry_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: defaults::SCHEDULER_MAX_CONCURRENT,
            rate_cap: defaults::SCHEDULER_RATE_CAP,
            rate_window_ms: defaults::SCHEDULER_RATE_WINDOW_MS,
            classify_timeout_secs: defaults::CLASSIFY_TIMEOUT_SECS,
            processing_stale_secs: defaults::PROCESSING_STALE_SECS,
            failed_retry_secs: defaults::FAILED_RETRY_SECS,
        }
    }
}

impl SchedulerConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `RISKCOORD_MAX_CONCURRENT` | `3` | Max concurrent classification calls |
    /// | `RISKCOORD_RATE_CAP` | `3` | Calls started per rate window |
    /// | `RISKCOORD_RATE_WINDOW_MS` | `1000` | Rate window |
    /// | `RISKCOORD_CLASSIFY_TIMEOUT_SECS` | `60` | Classification timeout |
    /// | `RISKCOORD_PROCESSING_STALE_SECS` | `1800` | Processing takeover threshold |
    /// | `RISKCOORD_FAILED_RETRY_SECS` | `1800` | Automatic retry threshold for failures |
    pub fn from_env() -> Self {
        fn var<T: std::str::FromStr>(name: &str, default: T) -> T {
            std::env::var(name)
                .ok()
                .and_then(|v| v.parse::<T>().ok())
                .unwrap_or(default)
        }

        Self {
            max_concurrent: var("RISKCOORD_MAX_CONCURRENT", defaults::SCHEDULER_MAX_CONCURRENT).max(1),
            rate_cap: var("RISKCOORD_RATE_CAP", defaults::SCHEDULER_RATE_CAP).max(1),
            rate_window_ms: var("RISKCOORD_RATE_WINDOW_MS", defaults::SCHEDULER_RATE_WINDOW_MS),
            classify_timeout_secs: var(
                "RISKCOORD_CLASSIFY_TIMEOUT_SECS",
                defaults::CLASSIFY_TIMEOUT_SECS,
            )
            .max(1),
            processing_stale_secs: var(
                "RISKCOORD_PROCESSING_STALE_SECS",
                defaults::PROCESSING_STALE_SECS,
            ),
            failed_retry_secs: var("RISKCOORD_FAILED_RETRY_SECS", defaults::FAILED_RETRY_SECS),
        }
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max.max(1);
        self
    }

    pub fn with_rate_limit(mut self, cap: usize, window_ms: u64) -> Self {
        self.rate_cap = cap.max(1);
        self.rate_window_ms = window_ms;
        self
    }

    pub fn with_classify_timeout_secs(mut self, secs: u64) -> Self {
        self.classify_timeout_secs = secs;
        self
    }

    pub fn with_processing_stale_secs(mut self, secs: u64) -> Self {
        self.processing_stale_secs = secs;
        self
    }

    pub fn with_failed_retry_secs(mut self, secs: u64) -> Self {
        self.failed_retry_secs = secs;
        self
    }

    pub fn rate_window(&self) -> Duration {
        Duration::from_millis(self.rate_window_ms)
    }

    pub fn classify_timeout(&self) -> Duration {
        Duration::from_secs(self.classify_timeout_secs)
    }

    pub fn processing_stale(&self) -> Duration {
        Duration::from_secs(self.processing_stale_secs)
    }

    pub fn failed_retry(&self) -> Duration {
        Duration::from_secs(self.failed_retry_secs)
    }
}

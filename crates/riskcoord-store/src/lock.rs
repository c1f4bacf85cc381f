//! Per-task locks on the shared medium.
//!
//! A lock is a storage slot holding the acquisition instant in epoch
//! milliseconds. Expiry is evaluated lazily on the acquisition read, so a
//! context that crashed while holding a lock blocks others for at most the
//! TTL. On backends with compare-and-swap, acquisition is atomic; otherwise
//! two contexts reading in the same instant can both acquire, and the cache
//! write rules bound that to a duplicate classifier call.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use riskcoord_core::defaults::LOCK_TTL_SECS;
use riskcoord_core::{Clock, KeyValueStore, ProjectScope, TaskKey};

/// Configuration for a [`LockManager`].
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// A lock at least this old counts as released.
    pub ttl_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl_secs: LOCK_TTL_SECS,
        }
    }
}

impl LockConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `RISKCOORD_LOCK_TTL_SECS` | `300` | Lock time-to-live |
    pub fn from_env() -> Self {
        let ttl_secs = std::env::var("RISKCOORD_LOCK_TTL_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(LOCK_TTL_SECS)
            .max(1);
        Self { ttl_secs }
    }

    pub fn with_ttl_secs(mut self, secs: u64) -> Self {
        self.ttl_secs = secs;
        self
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// TTL locks for one project.
pub struct LockManager {
    scope: ProjectScope,
    kv: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    config: LockConfig,
}

impl LockManager {
    pub fn new(
        scope: ProjectScope,
        kv: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        config: LockConfig,
    ) -> Self {
        Self {
            scope,
            kv,
            clock,
            config,
        }
    }

    /// Try to take the lock for `key`.
    ///
    /// Returns `false` only when another holder's lock is still live. When
    /// the medium cannot be read or written the lock is treated as taken,
    /// trading a possible duplicate run for never wedging a task.
    pub fn try_acquire(&self, key: &TaskKey) -> bool {
        let storage_key = self.scope.lock_key(key);
        let now = self.clock.now();

        let current = match self.kv.get(&storage_key) {
            Ok(current) => current,
            Err(e) => {
                tracing::warn!(component = "lock", task_key = %key, error = %e, "Lock read failed, proceeding unlocked");
                return true;
            }
        };

        if let Some(acquired_at) = current.as_deref().and_then(parse_instant) {
            if self.is_live(acquired_at, now) {
                tracing::debug!(component = "lock", task_key = %key, "Lock held elsewhere");
                return false;
            }
            tracing::debug!(component = "lock", task_key = %key, "Taking over expired lock");
        }

        let value = now.timestamp_millis().to_string();
        match self.kv.compare_and_swap(&storage_key, current.as_deref(), &value) {
            Ok(Some(true)) => true,
            Ok(Some(false)) => {
                tracing::debug!(component = "lock", task_key = %key, "Lost lock race");
                false
            }
            Ok(None) => {
                if let Err(e) = self.kv.set(&storage_key, &value) {
                    tracing::warn!(component = "lock", task_key = %key, error = %e, "Lock write failed, proceeding unlocked");
                }
                true
            }
            Err(e) => {
                tracing::warn!(component = "lock", task_key = %key, error = %e, "Lock swap failed, proceeding unlocked");
                true
            }
        }
    }

    /// Clear the lock for `key`, whoever holds it.
    pub fn release(&self, key: &TaskKey) {
        if let Err(e) = self.kv.remove(&self.scope.lock_key(key)) {
            tracing::warn!(component = "lock", task_key = %key, error = %e, "Lock release failed");
        }
    }

    /// Age of a live lock on `key`, `None` when unlocked or expired.
    pub fn holder_age(&self, key: &TaskKey) -> Option<Duration> {
        let raw = self.kv.get(&self.scope.lock_key(key)).ok().flatten()?;
        let acquired_at = parse_instant(&raw)?;
        let now = self.clock.now();
        if !self.is_live(acquired_at, now) {
            return None;
        }
        Some((now - acquired_at).to_std().unwrap_or(Duration::ZERO))
    }

    /// Whether any live lock exists in this project.
    pub fn any_held(&self) -> bool {
        let Ok(keys) = self.kv.keys_with_prefix(&self.scope.lock_prefix()) else {
            return false;
        };
        let now = self.clock.now();
        keys.iter().any(|k| {
            self.kv
                .get(k)
                .ok()
                .flatten()
                .as_deref()
                .and_then(parse_instant)
                .is_some_and(|at| self.is_live(at, now))
        })
    }

    fn is_live(&self, acquired_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        // A holder's clock running ahead reads as a fresh lock.
        match (now - acquired_at).to_std() {
            Ok(age) => age < self.config.ttl(),
            Err(_) => true,
        }
    }
}

fn parse_instant(raw: &str) -> Option<DateTime<Utc>> {
    raw.trim()
        .parse::<i64>()
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
}

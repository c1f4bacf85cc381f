//! Scheduler events and skip reasons.

use std::fmt;

use riskcoord_core::TaskKey;

/// Why a candidate was not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SkipReason {
    /// The contract was saved by a user.
    Saved,
    /// Already queued by this scheduler.
    AlreadyEnqueued,
    /// The cache holds a `success`.
    Succeeded,
    /// Another run is in progress and not yet stale.
    FreshProcessing,
    /// Failed recently; automatic retry waits for the threshold.
    RecentlyFailed,
    /// Another context holds the lock.
    Locked,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Saved => "saved",
            Self::AlreadyEnqueued => "already_enqueued",
            Self::Succeeded => "succeeded",
            Self::FreshProcessing => "fresh_processing",
            Self::RecentlyFailed => "recently_failed",
            Self::Locked => "locked",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event emitted by the extraction scheduler.
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    /// A pass began over `total` eligible tasks.
    PassStarted { total: usize },
    /// A candidate was skipped, before or after queuing.
    TaskSkipped { key: TaskKey, reason: SkipReason },
    /// Classification was started for a task.
    TaskStarted { key: TaskKey },
    /// A task reached `success`; `recovered` when the durable store already
    /// held its result.
    TaskCompleted {
        key: TaskKey,
        findings: usize,
        recovered: bool,
    },
    /// A task was recorded as `failed`.
    TaskFailed { key: TaskKey, error: String },
    /// Every task of the pass settled.
    PassFinished { completed: usize, failed: usize },
}

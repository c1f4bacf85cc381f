//! # riskcoord-jobs
//!
//! Runs risk extraction for one execution context:
//!
//! - [`ExtractionScheduler`]: bounded, rate-limited passes over candidate
//!   tasks with lock, re-check, and staleness rules
//! - [`LifecycleGuard`]: unload warnings and best-effort cleanup when the
//!   context goes away
//! - [`ExtractionContext`]: wires cache, locks, broadcast, and scheduler
//!   onto a shared medium
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use riskcoord_jobs::ContextBuilder;
//! use riskcoord_store::{InProcessBus, MemoryKv};
//!
//! let ctx = ContextBuilder::new("42")
//!     .kv(Arc::new(MemoryKv::new()))
//!     .bus(Arc::new(InProcessBus::new()))
//!     .classifier(classifier)
//!     .results(store)
//!     .build()?;
//! ctx.scheduler().mount(tasks);
//! ctx.scheduler().auto_start().await;
//! ```

pub mod config;
pub mod context;
pub mod events;
pub mod lifecycle;
pub mod rate_limit;
pub mod scheduler;

pub use config::SchedulerConfig;
pub use context::{ContextBuilder, ExtractionContext};
pub use events::{SchedulerEvent, SkipReason};
pub use lifecycle::{LifecycleGuard, UnloadDecision};
pub use rate_limit::SlidingWindowLimiter;
pub use scheduler::{eligibility, ExtractionScheduler, PassOutcome, PassSummary, TaskOutcome};

// Re-export core types
pub use riskcoord_core::*;

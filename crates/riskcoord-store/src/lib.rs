//! # riskcoord-store
//!
//! The shared medium every execution context on a device coordinates
//! through, and the three components built directly on it:
//!
//! - [`CacheStore`]: per-context view of task status with retention pruning,
//!   the success write rule, and coalesced snapshot persistence
//! - [`LockManager`]: short-TTL, lazily expiring per-task locks
//! - [`BroadcastSync`]: cache deltas over a pub/sub channel with a
//!   storage-slot fallback path
//!
//! Backends: [`MemoryKv`] and [`InProcessBus`] for contexts within one
//! process, [`FileKv`] for a medium that survives restarts.

pub mod broadcast;
pub mod bus;
pub mod cache;
pub mod file;
pub mod lock;
pub mod memory;

pub use broadcast::{BroadcastSync, Subscription};
pub use bus::InProcessBus;
pub use cache::{CacheChange, CacheConfig, CacheSnapshot, CacheStore};
pub use file::FileKv;
pub use lock::{LockConfig, LockManager};
pub use memory::MemoryKv;

// Re-export core types
pub use riskcoord_core::*;

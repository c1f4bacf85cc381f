//! Centralized default constants for riskcoord.
//!
//! **This module is the single source of truth** for shared default values.
//! Config types in the other crates start from these and let environment
//! variables override them.

// =============================================================================
// CACHE
// =============================================================================

/// Retention window for cache entries (24 hours).
pub const CACHE_RETENTION_SECS: u64 = 24 * 60 * 60;

/// Debounce window for persisting the cache snapshot.
pub const CACHE_PERSIST_DEBOUNCE_MS: u64 = 500;

/// Capacity of the in-process cache change feed.
pub const CACHE_CHANGE_CAPACITY: usize = 256;

// =============================================================================
// STALENESS
// =============================================================================

/// Age after which a `processing` entry is considered abandoned (30 minutes).
pub const PROCESSING_STALE_SECS: u64 = 30 * 60;

/// Age after which a `failed` entry may be retried automatically (30 minutes).
pub const FAILED_RETRY_SECS: u64 = 30 * 60;

// =============================================================================
// LOCKING
// =============================================================================

/// Lock time-to-live; a lock older than this counts as released (5 minutes).
pub const LOCK_TTL_SECS: u64 = 5 * 60;

// =============================================================================
// BROADCAST
// =============================================================================

/// Delay before the fallback delta slot is cleared after a write.
pub const DELTA_CLEAR_DELAY_MS: u64 = 1_000;

/// Capacity of each in-process message bus channel.
pub const BUS_CHANNEL_CAPACITY: usize = 256;

/// How often a file-backed medium re-reads its file for other writers' changes.
pub const FILE_POLL_INTERVAL_MS: u64 = 50;

// =============================================================================
// SCHEDULING
// =============================================================================

/// Maximum simultaneous in-flight classification calls.
pub const SCHEDULER_MAX_CONCURRENT: usize = 3;

/// Maximum classification calls started per rate window.
pub const SCHEDULER_RATE_CAP: usize = 3;

/// Rolling rate window in milliseconds.
pub const SCHEDULER_RATE_WINDOW_MS: u64 = 1_000;

/// Timeout for one classification call (60 seconds).
pub const CLASSIFY_TIMEOUT_SECS: u64 = 60;

/// Capacity of the scheduler event broadcast channel.
pub const EVENT_CAPACITY: usize = 256;

// =============================================================================
// HTTP
// =============================================================================

/// Default base URL of the application API.
pub const API_URL: &str = "http://127.0.0.1:3000";

/// Timeout for result-store requests (existence check, save).
pub const HTTP_TIMEOUT_SECS: u64 = 30;

/// Fallback message when a failure carries no diagnostic.
pub const UNKNOWN_ERROR: &str = "Unknown error";

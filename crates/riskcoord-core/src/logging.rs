//! Structured logging field name constants for riskcoord.
//!
//! All crates use these constants for consistent structured logging fields,
//! so log queries can filter by the same names across every subsystem.
//!
//! ## Log Level Contract
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | A task panicked or a pass could not be scheduled |
//! | WARN  | Swallowed storage failure, best-effort save failed, task failed |
//! | INFO  | Pass lifecycle, task completion |
//! | DEBUG | Skip decisions, lock outcomes, broadcast deliveries |
//! | TRACE | Per-entry pruning and snapshot details |

// ─── Identity fields ───────────────────────────────────────────────────────

/// Project the coordination layer is scoped to.
pub const PROJECT_ID: &str = "project_id";

/// Execution context (tab/window) identifier, UUIDv7.
pub const CONTEXT_ID: &str = "context_id";

/// Component within a crate.
/// Examples: "cache", "lock", "broadcast", "scheduler", "lifecycle", "context"
pub const COMPONENT: &str = "component";

// ─── Entity fields ─────────────────────────────────────────────────────────

/// Canonical task key.
pub const TASK_KEY: &str = "task_key";

/// Cache entry status.
pub const STATUS: &str = "status";

/// Storage key touched by a medium operation.
pub const STORAGE_KEY: &str = "storage_key";

// ─── Measurement fields ────────────────────────────────────────────────────

/// Wall-clock duration in milliseconds.
pub const DURATION_MS: &str = "duration_ms";

/// Number of findings produced by a classification.
pub const FINDING_COUNT: &str = "finding_count";

/// Number of entries in a snapshot.
pub const ENTRY_COUNT: &str = "entry_count";

// ─── Outcome fields ────────────────────────────────────────────────────────

/// Reason a task was skipped.
pub const SKIP_REASON: &str = "skip_reason";

/// Error message when an operation fails.
pub const ERROR_MSG: &str = "error";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_names_are_snake_case_and_unique() {
        let fields = [
            PROJECT_ID,
            CONTEXT_ID,
            COMPONENT,
            TASK_KEY,
            STATUS,
            STORAGE_KEY,
            DURATION_MS,
            FINDING_COUNT,
            ENTRY_COUNT,
            SKIP_REASON,
            ERROR_MSG,
        ];
        for field in fields {
            assert!(
                field.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
                "{field} is not snake_case"
            );
        }
        let unique: std::collections::HashSet<_> = fields.iter().collect();
        assert_eq!(unique.len(), fields.len());
    }
}

//! Canonical task identity and per-project storage naming.

use std::borrow::Borrow;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Extensions stripped from file names when deriving a task key.
pub const KNOWN_EXTENSIONS: &[&str] = &[".pdf", ".json"];

/// Derive the canonical task key from a path-like or file-like string.
///
/// Keeps the trailing path segment, strips known extensions (repeatedly,
/// case-insensitively), trims, and lowercases. Total and idempotent.
pub fn normalize_key(raw: &str) -> String {
    let segment = raw.rsplit(&['/', '\\'][..]).next().unwrap_or("");
    let mut name = segment.trim();
    while let Some(stripped) = strip_known_extension(name) {
        name = stripped.trim();
    }
    name.to_lowercase()
}

fn strip_known_extension(name: &str) -> Option<&str> {
    KNOWN_EXTENSIONS.iter().find_map(|ext| {
        let split = name.len().checked_sub(ext.len())?;
        if !name.is_char_boundary(split) {
            return None;
        }
        let (head, tail) = name.split_at(split);
        tail.eq_ignore_ascii_case(ext).then_some(head)
    })
}

/// Canonical, normalized task identifier.
///
/// Constructing through [`TaskKey::new`] always normalizes, so two keys
/// derived from `"docs/ACME-NDA.pdf"` and `"acme-nda"` compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskKey(String);

impl TaskKey {
    pub fn new(raw: &str) -> Self {
        Self(normalize_key(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Re-apply normalization (used on keys read back from storage).
    pub fn renormalized(&self) -> Self {
        Self::new(&self.0)
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for TaskKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TaskKey {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

/// Names every storage slot and channel used for one project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectScope {
    project_id: String,
}

impl ProjectScope {
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
        }
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// Storage key of the persisted cache snapshot.
    pub fn cache_key(&self) -> String {
        format!("risk_extraction_cache_{}", self.project_id)
    }

    /// Storage key of the lock record for one task.
    pub fn lock_key(&self, key: &TaskKey) -> String {
        format!("{}{}", self.lock_prefix(), key.renormalized())
    }

    /// Common prefix of every lock record in this project.
    pub fn lock_prefix(&self) -> String {
        format!("risk_extraction_lock_{}_", self.project_id)
    }

    /// Storage key of the transient fallback delta slot.
    pub fn delta_key(&self) -> String {
        format!("risk_extraction_cache_delta_{}", self.project_id)
    }

    /// Name of the primary pub/sub channel.
    pub fn channel(&self) -> String {
        format!("risk-extraction:{}", self.project_id)
    }
}

//! Core data models for riskcoord.
//!
//! These types are shared across all riskcoord crates and cross the shared
//! storage medium as JSON, so their serialized shape is part of the
//! coordination protocol between execution contexts.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::error::Error;
use crate::key::TaskKey;

// =============================================================================
// STATUS
// =============================================================================

/// Status of one extraction task in the shared cache.
///
/// `Pending → Processing → Success | Failed`, with `Failed → Processing`
/// allowed once the failure is stale or on manual retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionStatus {
    Pending,
    Processing,
    Success,
    Failed,
}

impl ExtractionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    /// `Success` is the only state no automatic write may leave.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl fmt::Display for ExtractionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExtractionStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            other => Err(Error::InvalidInput(format!("unknown status: {other}"))),
        }
    }
}

// =============================================================================
// CACHE ENTRY
// =============================================================================

/// One task's row in the cache snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub status: ExtractionStatus,
    /// Instant of the last status write, epoch milliseconds on the wire.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    /// Original, non-normalized file name.
    pub file_name: String,
    /// Canonical key, kept so restored snapshots can be re-normalized.
    pub base_name: TaskKey,
    /// Classifier output; only ever set on `Success`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<JsonValue>,
    /// Short diagnostic; only ever set on `Failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CacheEntry {
    fn base(
        status: ExtractionStatus,
        key: &TaskKey,
        file_name: &str,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            status,
            timestamp,
            file_name: file_name.to_string(),
            base_name: key.clone(),
            payload: None,
            error: None,
        }
    }

    pub fn pending(key: &TaskKey, file_name: &str, at: DateTime<Utc>) -> Self {
        Self::base(ExtractionStatus::Pending, key, file_name, at)
    }

    pub fn processing(key: &TaskKey, file_name: &str, at: DateTime<Utc>) -> Self {
        Self::base(ExtractionStatus::Processing, key, file_name, at)
    }

    pub fn success(
        key: &TaskKey,
        file_name: &str,
        at: DateTime<Utc>,
        payload: Option<JsonValue>,
    ) -> Self {
        Self {
            payload,
            ..Self::base(ExtractionStatus::Success, key, file_name, at)
        }
    }

    pub fn failed(key: &TaskKey, file_name: &str, at: DateTime<Utc>, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::base(ExtractionStatus::Failed, key, file_name, at)
        }
    }

    /// Entry with the given status, dropping fields the status does not allow.
    pub fn with_status(&self, status: ExtractionStatus, at: DateTime<Utc>) -> Self {
        Self {
            status,
            timestamp: at,
            file_name: self.file_name.clone(),
            base_name: self.base_name.clone(),
            payload: if status == ExtractionStatus::Success {
                self.payload.clone()
            } else {
                None
            },
            error: if status == ExtractionStatus::Failed {
                self.error.clone()
            } else {
                None
            },
        }
    }

    /// Age relative to `now`; timestamps in the future count as zero.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.timestamp).to_std().unwrap_or(Duration::ZERO)
    }

    /// Whether the entry is younger than `threshold`.
    pub fn is_fresh(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        self.age(now) < threshold
    }

    /// Number of findings in the payload, if it is a list.
    pub fn finding_count(&self) -> Option<usize> {
        match &self.payload {
            Some(JsonValue::Array(items)) => Some(items.len()),
            Some(JsonValue::Object(obj)) => obj
                .get("classifications")
                .and_then(JsonValue::as_array)
                .map(Vec::len),
            _ => None,
        }
    }
}

// =============================================================================
// BROADCAST
// =============================================================================

/// Discriminator of broadcast messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    #[serde(rename = "cache:update")]
    CacheUpdate,
    /// Operator override. Receivers apply it even over a `success`.
    #[serde(rename = "cache:manual")]
    ManualOverride,
}

/// Cross-context cache delta.
///
/// A hint to re-read the cache, never authoritative: the primary and
/// fallback paths can deliver the same delta twice and in either order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastMessage {
    pub kind: MessageKind,
    pub task_key: TaskKey,
    pub entry: CacheEntry,
    /// Context that published the delta.
    pub origin: Uuid,
}

impl BroadcastMessage {
    pub fn cache_update(task_key: TaskKey, entry: CacheEntry, origin: Uuid) -> Self {
        Self {
            kind: MessageKind::CacheUpdate,
            task_key,
            entry,
            origin,
        }
    }

    pub fn manual_override(task_key: TaskKey, entry: CacheEntry, origin: Uuid) -> Self {
        Self {
            kind: MessageKind::ManualOverride,
            ..Self::cache_update(task_key, entry, origin)
        }
    }
}

// =============================================================================
// CLASSIFICATION
// =============================================================================

/// Character span of a finding within its article.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextPosition {
    pub start: usize,
    pub end: usize,
}

/// One classified risk finding.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Classification {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub text: String,
    /// Risk category identifier.
    #[serde(rename = "type", default)]
    pub risk_type: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default = "default_page")]
    pub page_number: u32,
    #[serde(default)]
    pub position: TextPosition,
    /// Structured reference such as `第9条第1項` or `Article 9(1)`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub article_info: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub article_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub article_overview: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub specific_clause: Option<String>,
}

fn default_page() -> u32 {
    1
}

/// What a classifier returns for one task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassificationOutcome {
    #[serde(default)]
    pub classifications: Vec<Classification>,
    #[serde(default)]
    pub processed_articles: usize,
}

// =============================================================================
// TASKS
// =============================================================================

/// One article of a contract's OCR output; classifier input material.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Article {
    #[serde(default)]
    pub article_number: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
}

/// Classification criteria shared by every task of a pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionCriteria {
    pub target_company: String,
    /// Custom risk ids; empty means the default risk set.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub selected_risk_ids: Vec<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
}

/// A candidate classification job.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionTask {
    pub key: TaskKey,
    pub file_name: String,
    /// The contract was already saved by a user; never scheduled.
    pub is_saved: bool,
    pub articles: Vec<Article>,
    pub criteria: ExtractionCriteria,
}

impl ExtractionTask {
    pub fn new(file_name: impl Into<String>) -> Self {
        let file_name = file_name.into();
        Self {
            key: TaskKey::new(&file_name),
            file_name,
            is_saved: false,
            articles: Vec::new(),
            criteria: ExtractionCriteria::default(),
        }
    }

    pub fn with_articles(mut self, articles: Vec<Article>) -> Self {
        self.articles = articles;
        self
    }

    pub fn with_criteria(mut self, criteria: ExtractionCriteria) -> Self {
        self.criteria = criteria;
        self
    }

    pub fn with_saved(mut self, is_saved: bool) -> Self {
        self.is_saved = is_saved;
        self
    }

    /// File name without directory or extension, as the result store expects.
    pub fn file_stem(&self) -> &str {
        let name = self
            .file_name
            .rsplit(&['/', '\\'][..])
            .next()
            .unwrap_or(&self.file_name);
        match name.rfind('.') {
            Some(dot) if dot > 0 => &name[..dot],
            _ => name,
        }
    }
}

// =============================================================================
// PROCESSING STATE
// =============================================================================

/// Progress of the current scheduling pass in one context.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingState {
    pub is_processing: bool,
    pub total_count: usize,
    pub completed_count: usize,
    pub failed_keys: BTreeSet<TaskKey>,
}

impl ProcessingState {
    /// Fresh state for a pass over `total` tasks.
    pub fn started(total: usize) -> Self {
        Self {
            is_processing: true,
            total_count: total,
            completed_count: 0,
            failed_keys: BTreeSet::new(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.total_count.saturating_sub(self.completed_count)
    }

    pub fn has_failures(&self) -> bool {
        !self.failed_keys.is_empty()
    }
}

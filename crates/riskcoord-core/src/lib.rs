//! # riskcoord-core
//!
//! Core types, traits, and abstractions for the riskcoord workspace.
//!
//! This crate provides the domain model shared by every other riskcoord
//! crate: canonical task keys, cache entries and their status lifecycle,
//! broadcast messages, classification findings, and the trait seams
//! (`KeyValueStore`, `MessageBus`, `Classifier`, `ResultStore`, `Clock`)
//! that concrete backends implement.

pub mod article;
pub mod clock;
pub mod defaults;
pub mod error;
pub mod key;
pub mod logging;
pub mod models;
pub mod reducer;
pub mod traits;

// Re-export commonly used types at crate root
pub use article::{compare_article_info, parse_article_ref, ArticleRef};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Error, Result};
pub use key::{normalize_key, ProjectScope, TaskKey};
pub use models::*;
pub use reducer::{merge_classifications, sort_by_article};
pub use traits::*;

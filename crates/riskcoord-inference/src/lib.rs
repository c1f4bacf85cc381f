//! # riskcoord-inference
//!
//! Backends for the two external collaborators of the scheduler:
//!
//! - [`HttpClassifier`]: the application's full-context classification endpoint
//! - [`HttpResultStore`]: the project's extracted-risk store
//!
//! Both speak the application's JSON API and share one [`ApiConfig`].
//! Deterministic in-memory doubles live in [`mock`] behind the `mock`
//! feature.

pub mod classifier;
pub mod config;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod result_store;

pub use classifier::HttpClassifier;
pub use config::ApiConfig;
pub use result_store::{HttpResultStore, RiskRecord};

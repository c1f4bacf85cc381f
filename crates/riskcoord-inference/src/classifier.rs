//! Full-context classification over HTTP.

use std::time::Instant;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, instrument};

use riskcoord_core::{Article, ClassificationOutcome, Classifier, Error, ExtractionTask, Result};

use crate::config::ApiConfig;

const CLASSIFY_PATH: &str = "/api/classify-full-context";

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ClassifyRequest<'a> {
    articles: &'a [Article],
    target_company: &'a str,
    project_id: i64,
    #[serde(skip_serializing_if = "no_ids")]
    selected_risk_ids: &'a [i64],
    #[serde(skip_serializing_if = "Option::is_none")]
    user_prompt: Option<&'a str>,
}

fn no_ids(ids: &&[i64]) -> bool {
    ids.is_empty()
}

/// Classifier backed by `POST /api/classify-full-context`.
pub struct HttpClassifier {
    client: Client,
    config: ApiConfig,
    project_id: i64,
}

impl HttpClassifier {
    /// Classifier for one project. The application addresses projects by
    /// numeric id, so a non-numeric id is a configuration error.
    pub fn new(config: ApiConfig, project_id: &str) -> Result<Self> {
        let project_id = project_id
            .trim()
            .parse::<i64>()
            .map_err(|_| Error::Config(format!("Invalid projectId: {project_id}")))?;
        let client = config.client(config.classify_timeout_secs)?;
        Ok(Self {
            client,
            config,
            project_id,
        })
    }

    pub fn from_env(project_id: &str) -> Result<Self> {
        Self::new(ApiConfig::from_env(), project_id)
    }
}

#[async_trait]
impl Classifier for HttpClassifier {
    #[instrument(skip(self, task), fields(task_key = %task.key, articles = task.articles.len()))]
    async fn classify(&self, task: &ExtractionTask) -> Result<ClassificationOutcome> {
        let start = Instant::now();
        let body = ClassifyRequest {
            articles: &task.articles,
            target_company: &task.criteria.target_company,
            project_id: self.project_id,
            selected_risk_ids: &task.criteria.selected_risk_ids,
            user_prompt: task.criteria.prompt.as_deref(),
        };

        let response = self
            .client
            .post(self.config.url(CLASSIFY_PATH))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::Timeout(self.config.classify_timeout_secs * 1000)
                } else {
                    Error::Classification(format!("Request failed: {e}"))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(Error::Classification(format!(
                "API request failed: {} {}",
                status.as_u16(),
                summarize_error_body(&detail)
            )));
        }

        let outcome: ClassificationOutcome = response
            .json()
            .await
            .map_err(|e| Error::Classification(format!("Failed to parse response: {e}")))?;

        debug!(
            finding_count = outcome.classifications.len(),
            processed_articles = outcome.processed_articles,
            duration_ms = start.elapsed().as_millis() as u64,
            "Classification complete"
        );
        Ok(outcome)
    }
}

/// Pull `error`/`details` out of a JSON error body, otherwise keep a prefix.
pub(crate) fn summarize_error_body(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        let error = value.get("error").and_then(|v| v.as_str());
        let details = value.get("details").and_then(|v| v.as_str());
        match (error, details) {
            (Some(e), Some(d)) => return format!("{e}: {d}"),
            (Some(e), None) => return e.to_string(),
            _ => {}
        }
    }
    body.chars().take(200).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_numeric_project_rejected() {
        let err = HttpClassifier::new(ApiConfig::default(), "abc").err().unwrap();
        assert!(matches!(err, Error::Config(_)));
        assert!(HttpClassifier::new(ApiConfig::default(), " 42 ").is_ok());
    }

    #[test]
    fn test_summarize_error_body() {
        assert_eq!(
            summarize_error_body(r#"{"error":"Classification failed","details":"quota"}"#),
            "Classification failed: quota"
        );
        assert_eq!(summarize_error_body(r#"{"error":"targetCompany is required"}"#), "targetCompany is required");
        assert_eq!(summarize_error_body("Bad Gateway"), "Bad Gateway");
    }

    #[test]
    fn test_request_omits_empty_optionals() {
        let body = ClassifyRequest {
            articles: &[],
            target_company: "ACME",
            project_id: 7,
            selected_risk_ids: &[],
            user_prompt: None,
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value, serde_json::json!({"articles": [], "targetCompany": "ACME", "projectId": 7}));
    }
}

//! Durable store of extracted risks over HTTP.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use riskcoord_core::{Classification, Error, Result, ResultStore, TaskKey};

use crate::classifier::summarize_error_body;
use crate::config::ApiConfig;

/// One risk row as the extracted-risk endpoint stores it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskRecord {
    pub text: String,
    #[serde(rename = "type")]
    pub risk_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub article_info: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub article_title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub article_overview: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub specific_clause: Option<String>,
    pub page_number: u32,
    pub position_start: usize,
    pub position_end: usize,
}

impl From<&Classification> for RiskRecord {
    fn from(c: &Classification) -> Self {
        Self {
            text: c.text.clone(),
            risk_type: c.risk_type.clone(),
            reason: Some(c.reason.clone()).filter(|r| !r.is_empty()),
            article_info: c.article_info.clone(),
            article_title: c.article_title.clone(),
            article_overview: c.article_overview.clone(),
            specific_clause: c.specific_clause.clone(),
            page_number: c.page_number.max(1),
            position_start: c.position.start,
            position_end: c.position.end,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SaveRequest<'a> {
    file_name: &'a str,
    risks: Vec<RiskRecord>,
}

/// Either shape the lookup endpoint answers with.
#[derive(Deserialize)]
struct ExistingResponse {
    #[serde(default)]
    risks: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    count: Option<usize>,
}

/// Result store backed by `/api/projects/{id}/extract-risks`.
pub struct HttpResultStore {
    client: Client,
    config: ApiConfig,
    project_id: String,
}

impl HttpResultStore {
    pub fn new(config: ApiConfig, project_id: impl Into<String>) -> Result<Self> {
        let client = config.client(config.request_timeout_secs)?;
        Ok(Self {
            client,
            config,
            project_id: project_id.into(),
        })
    }

    pub fn from_env(project_id: impl Into<String>) -> Result<Self> {
        Self::new(ApiConfig::from_env(), project_id)
    }

    fn endpoint(&self) -> String {
        self.config
            .url(&format!("/api/projects/{}/extract-risks", self.project_id))
    }
}

#[async_trait]
impl ResultStore for HttpResultStore {
    #[instrument(skip(self), fields(task_key = %key))]
    async fn existing_result_count(&self, key: &TaskKey, file_stem: &str) -> Result<usize> {
        let response = self
            .client
            .get(self.endpoint())
            .query(&[("fileName", file_stem)])
            .send()
            .await
            .map_err(|e| Error::ResultStore(format!("Lookup failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::ResultStore(format!(
                "Lookup failed: {} {}",
                status.as_u16(),
                summarize_error_body(&body)
            )));
        }

        let parsed: ExistingResponse = response
            .json()
            .await
            .map_err(|e| Error::ResultStore(format!("Failed to parse lookup: {e}")))?;
        let count = match parsed.risks {
            Some(risks) => risks.len(),
            None => parsed.count.unwrap_or(0),
        };
        debug!(finding_count = count, "Existing results");
        Ok(count)
    }

    #[instrument(skip(self, classifications), fields(task_key = %key, finding_count = classifications.len()))]
    async fn save_result(
        &self,
        key: &TaskKey,
        file_stem: &str,
        classifications: &[Classification],
    ) -> Result<()> {
        let body = SaveRequest {
            file_name: file_stem,
            risks: classifications.iter().map(RiskRecord::from).collect(),
        };

        let response = self
            .client
            .post(self.endpoint())
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::ResultStore(format!("Save failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::ResultStore(format!(
                "Save failed: {} {}",
                status.as_u16(),
                summarize_error_body(&body)
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use riskcoord_core::TextPosition;

    #[test]
    fn test_record_from_classification() {
        let c = Classification {
            id: "r1".into(),
            text: "Either party may terminate".into(),
            risk_type: "3".into(),
            reason: String::new(),
            page_number: 0,
            position: TextPosition { start: 4, end: 30 },
            article_info: Some("第9条".into()),
            ..Default::default()
        };
        let record = RiskRecord::from(&c);
        assert_eq!(record.reason, None);
        assert_eq!(record.page_number, 1);

        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["type"], "3");
        assert_eq!(value["positionStart"], 4);
        assert_eq!(value["positionEnd"], 30);
        assert_eq!(value["articleInfo"], "第9条");
    }
}

//! Connection settings for the application API.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE, COOKIE};
use reqwest::Client;

use riskcoord_core::defaults::{API_URL, CLASSIFY_TIMEOUT_SECS, HTTP_TIMEOUT_SECS};
use riskcoord_core::{Error, Result};

/// Where the application API lives and how to authenticate against it.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Base URL without trailing slash, e.g. `http://127.0.0.1:3000`.
    pub base_url: String,
    /// Session token sent as the `auth-token` cookie.
    pub auth_token: Option<String>,
    /// Timeout for result-store requests.
    pub request_timeout_secs: u64,
    /// Timeout for a classification request.
    pub classify_timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: API_URL.to_string(),
            auth_token: None,
            request_timeout_secs: HTTP_TIMEOUT_SECS,
            classify_timeout_secs: CLASSIFY_TIMEOUT_SECS,
        }
    }
}

impl ApiConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `RISKCOORD_API_URL` | `http://127.0.0.1:3000` | Application base URL |
    /// | `RISKCOORD_API_TOKEN` | unset | Session token (`auth-token` cookie) |
    /// | `RISKCOORD_HTTP_TIMEOUT_SECS` | `30` | Result-store request timeout |
    /// | `RISKCOORD_CLASSIFY_TIMEOUT_SECS` | `60` | Classification request timeout |
    pub fn from_env() -> Self {
        let base_url = std::env::var("RISKCOORD_API_URL").unwrap_or_else(|_| API_URL.to_string());
        let auth_token = std::env::var("RISKCOORD_API_TOKEN")
            .ok()
            .filter(|t| !t.trim().is_empty());
        let request_timeout_secs = std::env::var("RISKCOORD_HTTP_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(HTTP_TIMEOUT_SECS);
        let classify_timeout_secs = std::env::var("RISKCOORD_CLASSIFY_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(CLASSIFY_TIMEOUT_SECS);

        Self {
            base_url,
            auth_token,
            request_timeout_secs,
            classify_timeout_secs,
        }
        .normalized()
    }

    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
        .normalized()
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn with_request_timeout_secs(mut self, secs: u64) -> Self {
        self.request_timeout_secs = secs;
        self
    }

    pub fn with_classify_timeout_secs(mut self, secs: u64) -> Self {
        self.classify_timeout_secs = secs;
        self
    }

    fn normalized(mut self) -> Self {
        while self.base_url.ends_with('/') {
            self.base_url.pop();
        }
        self
    }

    /// Absolute URL for an API path starting with `/`.
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// HTTP client with default headers and the given timeout.
    pub(crate) fn client(&self, timeout_secs: u64) -> Result<Client> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(token) = &self.auth_token {
            let cookie = HeaderValue::from_str(&format!("auth-token={token}"))
                .map_err(|e| Error::Config(format!("Invalid auth token: {e}")))?;
            headers.insert(COOKIE, cookie);
        }

        Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {e}")))
    }
}

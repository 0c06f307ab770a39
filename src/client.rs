//! HTTP client for the context store API.

use std::time::Duration;

use reqwest::{header, Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{ContextError, Result};
use crate::repository::{ContextRecord, ContextSummary, SyncOutcome, VersionInfo};

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the context store, e.g. `http://localhost:8087`
    pub base_url: String,
    /// Bearer credential: a signed JWT or a registered API key
    pub token: String,
    /// Context addressed when a call does not name one
    pub context_id: String,
    /// Request timeout in seconds (default: 30)
    pub timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8087".to_string(),
            token: String::new(),
            context_id: "default".to_string(),
            timeout_secs: 30,
        }
    }
}

/// Response from the save endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveResponse {
    pub success: bool,
    pub context_id: String,
    pub version: i64,
    pub timestamp: String,
}

/// Response from the delete endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteResponse {
    pub success: bool,
    pub deleted: usize,
}

/// Response from the restore endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreResponse {
    pub success: bool,
    pub restored_version: i64,
}

/// Response from the health endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    contexts: Vec<ContextSummary>,
}

#[derive(Debug, Deserialize)]
struct VersionsResponse {
    versions: Vec<VersionInfo>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

/// HTTP client for the context store API
///
/// # Example
///
/// ```rust,no_run
/// use context_vault::client::{ClientConfig, ContextClient};
/// use serde_json::json;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = ContextClient::new(ClientConfig {
///     base_url: "http://localhost:8087".into(),
///     token: "my-api-key".into(),
///     ..Default::default()
/// });
///
/// client.save(&json!({"notes": ["first"]})).await?;
/// let record = client.get().await?;
/// println!("{}", record.content);
/// # Ok(())
/// # }
/// ```
pub struct ContextClient {
    config: ClientConfig,
    client: Client,
}

impl ContextClient {
    /// Create a new client
    pub fn new(mut config: ClientConfig) -> Self {
        config.base_url = config.base_url.trim_end_matches('/').to_string();

        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            header::HeaderValue::from_str(&format!("Bearer {}", config.token))
                .expect("Invalid token"),
        );

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .expect("Failed to build HTTP client");

        Self { config, client }
    }

    /// Check server liveness (no credential required)
    pub async fn health(&self) -> Result<HealthResponse> {
        let url = format!("{}/api/health", self.config.base_url);
        let response = self.client.get(&url).send().await?;
        self.handle_response(response).await
    }

    /// Save content to the configured context
    pub async fn save(&self, content: &serde_json::Value) -> Result<SaveResponse> {
        let context_id = self.config.context_id.clone();
        self.save_as(&context_id, content, None).await
    }

    /// Save content to the configured context with caller metadata
    pub async fn save_with_metadata(
        &self,
        content: &serde_json::Value,
        metadata: &serde_json::Value,
    ) -> Result<SaveResponse> {
        let context_id = self.config.context_id.clone();
        self.save_as(&context_id, content, Some(metadata)).await
    }

    /// Save content to a named context, optionally with caller metadata
    pub async fn save_as(
        &self,
        context_id: &str,
        content: &serde_json::Value,
        metadata: Option<&serde_json::Value>,
    ) -> Result<SaveResponse> {
        let url = format!("{}/api/context", self.config.base_url);
        let body = json!({"content": content, "metadata": metadata});

        let response = self
            .client
            .post(&url)
            .header("X-Context-ID", context_id)
            .header(header::CONTENT_TYPE, "application/json")
            .json(&body)
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// Fetch the configured context
    pub async fn get(&self) -> Result<ContextRecord> {
        let context_id = self.config.context_id.clone();
        self.get_as(&context_id).await
    }

    /// Fetch a named context
    pub async fn get_as(&self, context_id: &str) -> Result<ContextRecord> {
        let url = format!("{}/api/context", self.config.base_url);

        let response = self
            .client
            .get(&url)
            .header("X-Context-ID", context_id)
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// Delete the configured context and its history
    pub async fn delete(&self) -> Result<DeleteResponse> {
        let context_id = self.config.context_id.clone();
        self.delete_as(&context_id).await
    }

    /// Delete a named context and its history
    pub async fn delete_as(&self, context_id: &str) -> Result<DeleteResponse> {
        let url = format!("{}/api/context", self.config.base_url);

        let response = self
            .client
            .delete(&url)
            .header("X-Context-ID", context_id)
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// List the caller's contexts
    pub async fn list(&self) -> Result<Vec<ContextSummary>> {
        let url = format!("{}/api/context/list", self.config.base_url);
        let response = self.client.get(&url).send().await?;
        let body: ListResponse = self.handle_response(response).await?;
        Ok(body.contexts)
    }

    /// Reconcile the configured context against a last-seen timestamp
    pub async fn sync(&self, last_sync: Option<&str>) -> Result<SyncOutcome> {
        let context_id = self.config.context_id.clone();
        self.sync_as(&context_id, last_sync).await
    }

    /// Reconcile a named context against a last-seen timestamp
    pub async fn sync_as(&self, context_id: &str, last_sync: Option<&str>) -> Result<SyncOutcome> {
        let url = format!("{}/api/context/sync", self.config.base_url);
        let body = json!({"contextId": context_id, "lastSync": last_sync});

        let response = self
            .client
            .post(&url)
            .header(header::CONTENT_TYPE, "application/json")
            .json(&body)
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// List version history for the configured context, ascending, capped at `limit`
    pub async fn versions(&self, limit: Option<usize>) -> Result<Vec<VersionInfo>> {
        let context_id = self.config.context_id.clone();
        self.versions_as(&context_id, limit).await
    }

    /// List version history for a named context
    pub async fn versions_as(
        &self,
        context_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<VersionInfo>> {
        let url = format!("{}/api/context/version", self.config.base_url);
        let body = json!({"contextId": context_id, "limit": limit});

        let response = self
            .client
            .post(&url)
            .header(header::CONTENT_TYPE, "application/json")
            .json(&body)
            .send()
            .await?;

        let body: VersionsResponse = self.handle_response(response).await?;
        Ok(body.versions)
    }

    /// Point the configured context's current state at an old version
    pub async fn restore(&self, version: i64) -> Result<RestoreResponse> {
        let context_id = self.config.context_id.clone();
        self.restore_as(&context_id, version).await
    }

    /// Point a named context's current state at an old version
    pub async fn restore_as(&self, context_id: &str, version: i64) -> Result<RestoreResponse> {
        let url = format!("{}/api/context/restore", self.config.base_url);
        let body = json!({"contextId": context_id, "version": version});

        let response = self
            .client
            .post(&url)
            .header(header::CONTENT_TYPE, "application/json")
            .json(&body)
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// Decode a response, mapping error statuses back onto the error taxonomy.
    async fn handle_response<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }

        let message = response
            .json::<ErrorBody>()
            .await
            .map(|body| body.error)
            .unwrap_or_else(|_| format!("HTTP {}", status.as_u16()));

        Err(match status {
            StatusCode::BAD_REQUEST => ContextError::Validation(message),
            StatusCode::UNAUTHORIZED => ContextError::Auth(message),
            StatusCode::NOT_FOUND => ContextError::NotFound(message),
            _ => ContextError::Internal(format!("server error {}: {}", status.as_u16(), message)),
        })
    }
}

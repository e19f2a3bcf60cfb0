//! Browser automation bridge.
//!
//! Browser tools delegate to an external automation service; each call
//! returns a text/JSON summary. Screenshots are uploaded to durable
//! storage and referenced by id, never embedded inline in the trace.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;

use crate::config::BrowserConfig;
use crate::error::ToolError;

/// A browser action forwarded to the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrowserAction {
    Navigate,
    Act,
    Observe,
    Extract,
    ExecuteScript,
}

impl BrowserAction {
    fn endpoint(&self) -> &'static str {
        match self {
            BrowserAction::Navigate => "navigate",
            BrowserAction::Act => "act",
            BrowserAction::Observe => "observe",
            BrowserAction::Extract => "extract",
            BrowserAction::ExecuteScript => "execute",
        }
    }
}

/// External browser-automation service.
#[async_trait]
pub trait BrowserBridge: Send + Sync {
    /// Run one action; the bridge returns a textual summary of the result.
    async fn perform(
        &self,
        action: BrowserAction,
        instruction: &str,
    ) -> Result<String, ToolError>;

    /// Capture the current page as PNG bytes.
    async fn screenshot(&self) -> Result<Vec<u8>, ToolError>;
}

/// Durable storage for captured screenshots.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Upload image bytes, returning a storage id.
    async fn upload_screenshot(&self, bytes: &[u8]) -> Result<String, ToolError>;
}

/// HTTP client for the bridge service.
pub struct HttpBrowserBridge {
    client: Client,
    config: BrowserConfig,
}

impl HttpBrowserBridge {
    pub fn new(config: BrowserConfig) -> Self {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { client, config }
    }
}

#[async_trait]
impl BrowserBridge for HttpBrowserBridge {
    async fn perform(
        &self,
        action: BrowserAction,
        instruction: &str,
    ) -> Result<String, ToolError> {
        let url = format!("{}/{}", self.config.bridge_url, action.endpoint());
        let response = self
            .client
            .post(&url)
            .json(&json!({ "instruction": instruction }))
            .send()
            .await
            .map_err(|e| ToolError::ExternalService(e.to_string()))?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(ToolError::ExternalService(format!(
                "bridge returned HTTP {status}: {body}"
            )));
        }
        Ok(body)
    }

    async fn screenshot(&self) -> Result<Vec<u8>, ToolError> {
        let url = format!("{}/screenshot", self.config.bridge_url);
        let response = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(|e| ToolError::ExternalService(e.to_string()))?
            .error_for_status()
            .map_err(|e| ToolError::ExternalService(e.to_string()))?;

        let bytes = response
            .bytes()
            .await
            .map_err(|e| ToolError::ExternalService(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

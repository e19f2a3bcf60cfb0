//! HTTP client for the durable store's mutation/query endpoints.
//!
//! Scan workers run in sandboxes that cannot reach the API server, so they
//! write to the store directly: mutations are POSTed as
//! `{ "path": "<table:op>", "args": { ... } }` with deploy-key auth.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use secrecy::ExposeSecret;
use serde::de::DeserializeOwned;
use serde_json::json;

use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::error::ToolError;
use crate::model::{ActionRecord, ActionType, HumanPrompt, Report, ScanStatus};
use crate::relay::{ActionRelay, GateStore, ReportSink};
use crate::tools::SnapshotStore;

/// Client for the durable store.
pub struct HttpRelay {
    client: Client,
    config: RelayConfig,
}

impl HttpRelay {
    pub fn new(config: RelayConfig) -> Self {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { client, config }
    }

    fn auth_header(&self) -> String {
        let key = self
            .config
            .deploy_key
            .as_ref()
            .map(|k| k.expose_secret().to_string())
            .unwrap_or_default();
        format!("Convex {key}")
    }

    async fn call<R: DeserializeOwned>(
        &self,
        endpoint: &str,
        path: &str,
        args: serde_json::Value,
    ) -> Result<R, RelayError> {
        let url = format!("{}/api/{}", self.config.base_url, endpoint);

        let response = self
            .client
            .post(&url)
            .header("Authorization", self.auth_header())
            .json(&json!({ "path": path, "args": args }))
            .send()
            .await
            .map_err(|e| RelayError::RequestFailed {
                reason: e.to_string(),
            })?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(RelayError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        serde_json::from_str(&body)
            .map_err(|e| RelayError::InvalidResponse(format!("{e}: {body}")))
    }

    async fn mutation<R: DeserializeOwned>(
        &self,
        path: &str,
        args: serde_json::Value,
    ) -> Result<R, RelayError> {
        self.call("mutation", path, args).await
    }

    async fn query<R: DeserializeOwned>(
        &self,
        path: &str,
        args: serde_json::Value,
    ) -> Result<R, RelayError> {
        self.call("query", path, args).await
    }
}

#[async_trait]
impl ActionRelay for HttpRelay {
    async fn push(
        &self,
        scan_id: &str,
        action_type: ActionType,
        payload: serde_json::Value,
    ) -> Result<(), RelayError> {
        let _: serde_json::Value = self
            .mutation(
                "actions:push",
                json!({
                    "scanId": scan_id,
                    "type": action_type,
                    "payload": payload,
                }),
            )
            .await?;
        Ok(())
    }

    async fn list_actions_after(
        &self,
        scan_id: &str,
        after: DateTime<Utc>,
    ) -> Result<Vec<ActionRecord>, RelayError> {
        self.query(
            "actions:listAfter",
            json!({ "scanId": scan_id, "after": after.timestamp_millis() }),
        )
        .await
    }

    async fn list_all_actions(&self, scan_id: &str) -> Result<Vec<ActionRecord>, RelayError> {
        self.query("actions:listAll", json!({ "scanId": scan_id }))
            .await
    }
}

#[async_trait]
impl ReportSink for HttpRelay {
    async fn submit_report(&self, project_id: &str, report: &Report) -> Result<(), RelayError> {
        let _: serde_json::Value = self
            .mutation(
                "reports:submit",
                json!({
                    "scanId": report.scan_id,
                    "projectId": project_id,
                    "findings": report.findings,
                    "summary": report.summary,
                }),
            )
            .await?;
        Ok(())
    }

    async fn update_scan_status(
        &self,
        scan_id: &str,
        status: ScanStatus,
        error: Option<&str>,
    ) -> Result<(), RelayError> {
        let mut args = json!({ "scanId": scan_id, "status": status });
        if let Some(error) = error {
            args["error"] = json!(error);
        }
        let _: serde_json::Value = self.mutation("scans:updateStatus", args).await?;
        Ok(())
    }
}

#[async_trait]
impl SnapshotStore for HttpRelay {
    async fn upload_screenshot(&self, bytes: &[u8]) -> Result<String, ToolError> {
        #[derive(serde::Deserialize)]
        struct UploadResponse {
            #[serde(rename = "storageId")]
            storage_id: String,
        }

        let url = format!("{}/api/storage/upload", self.config.base_url);
        let response = self
            .client
            .post(&url)
            .header("Authorization", self.auth_header())
            .header("Content-Type", "image/png")
            .body(bytes.to_vec())
            .send()
            .await
            .map_err(|e| ToolError::ExternalService(e.to_string()))?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(ToolError::ExternalService(format!(
                "storage upload rejected: HTTP {status}: {body}"
            )));
        }

        let parsed: UploadResponse = serde_json::from_str(&body)
            .map_err(|e| ToolError::ExternalService(format!("{e}: {body}")))?;
        Ok(parsed.storage_id)
    }
}

#[async_trait]
impl GateStore for HttpRelay {
    async fn create_prompt(&self, scan_id: &str, question: &str) -> Result<String, RelayError> {
        #[derive(serde::Deserialize)]
        struct CreateResponse {
            #[serde(rename = "promptId")]
            prompt_id: String,
        }

        let resp: CreateResponse = self
            .mutation(
                "gate:createPrompt",
                json!({ "scanId": scan_id, "question": question }),
            )
            .await?;
        Ok(resp.prompt_id)
    }

    async fn get_prompt(&self, prompt_id: &str) -> Result<HumanPrompt, RelayError> {
        self.query("gate:getPrompt", json!({ "promptId": prompt_id }))
            .await
    }
}

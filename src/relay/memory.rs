//! In-process store used by tests and local single-worker runs.
//!
//! Mirrors the remote store's semantics: server-assigned timestamps,
//! monotonic scan status, duplicate tolerance for identified pushes
//! (tool_call/tool_result are keyed by call id and stored once).

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{RelayError, ToolError};
use crate::model::{
    ActionRecord, ActionType, HumanPrompt, PromptStatus, Report, ScanStatus,
};
use crate::relay::{ActionRelay, GateStore, ReportSink};
use crate::tools::SnapshotStore;

#[derive(Default)]
struct Inner {
    actions: Vec<ActionRecord>,
    reports: Vec<(String, Report)>,
    statuses: HashMap<String, (ScanStatus, Option<String>)>,
    prompts: HashMap<String, HumanPrompt>,
    screenshots: Vec<Vec<u8>>,
}

/// In-memory relay, report sink, and gate store.
#[derive(Default)]
pub struct MemoryRelay {
    inner: Mutex<Inner>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// All stored actions for a scan (test observation).
    pub fn actions(&self, scan_id: &str) -> Vec<ActionRecord> {
        let inner = self.inner.lock().expect("relay lock");
        inner
            .actions
            .iter()
            .filter(|a| a.scan_id == scan_id)
            .cloned()
            .collect()
    }

    /// Actions of one type for a scan (test observation).
    pub fn actions_of_type(&self, scan_id: &str, action_type: ActionType) -> Vec<ActionRecord> {
        self.actions(scan_id)
            .into_iter()
            .filter(|a| a.action_type == action_type)
            .collect()
    }

    /// The submitted report for a scan, if any.
    pub fn report(&self, scan_id: &str) -> Option<Report> {
        let inner = self.inner.lock().expect("relay lock");
        inner
            .reports
            .iter()
            .find(|(_, r)| r.scan_id == scan_id)
            .map(|(_, r)| r.clone())
    }

    /// Current status and error for a scan.
    pub fn status(&self, scan_id: &str) -> Option<(ScanStatus, Option<String>)> {
        let inner = self.inner.lock().expect("relay lock");
        inner.statuses.get(scan_id).cloned()
    }

    /// Answer a pending prompt (stands in for the external operator).
    pub fn answer_prompt(&self, prompt_id: &str, response: &str) {
        let mut inner = self.inner.lock().expect("relay lock");
        if let Some(prompt) = inner.prompts.get_mut(prompt_id) {
            prompt.status = PromptStatus::Answered;
            prompt.response = Some(response.to_string());
        }
    }

    /// Latest pending prompt for a scan, if any.
    pub fn pending_prompt(&self, scan_id: &str) -> Option<HumanPrompt> {
        let inner = self.inner.lock().expect("relay lock");
        inner
            .prompts
            .values()
            .find(|p| p.scan_id == scan_id && p.status == PromptStatus::Pending)
            .cloned()
    }

    fn call_id_of(payload: &serde_json::Value) -> Option<&str> {
        payload.get("call_id").and_then(|v| v.as_str())
    }
}

#[async_trait]
impl ActionRelay for MemoryRelay {
    async fn push(
        &self,
        scan_id: &str,
        action_type: ActionType,
        payload: serde_json::Value,
    ) -> Result<(), RelayError> {
        let mut inner = self.inner.lock().expect("relay lock");

        // Identified pushes are idempotent: one tool_call and at most one
        // terminal tool_result per call id, no matter how many observers
        // push the same event.
        if matches!(action_type, ActionType::ToolCall | ActionType::ToolResult) {
            if let Some(call_id) = Self::call_id_of(&payload) {
                let duplicate = inner.actions.iter().any(|a| {
                    a.scan_id == scan_id
                        && a.action_type == action_type
                        && a.payload.get("call_id").and_then(|v| v.as_str()) == Some(call_id)
                });
                if duplicate {
                    return Ok(());
                }
            }
        }

        inner.actions.push(ActionRecord {
            scan_id: scan_id.to_string(),
            action_type,
            payload,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    async fn list_actions_after(
        &self,
        scan_id: &str,
        after: DateTime<Utc>,
    ) -> Result<Vec<ActionRecord>, RelayError> {
        let inner = self.inner.lock().expect("relay lock");
        Ok(inner
            .actions
            .iter()
            .filter(|a| a.scan_id == scan_id && a.timestamp > after)
            .cloned()
            .collect())
    }

    async fn list_all_actions(&self, scan_id: &str) -> Result<Vec<ActionRecord>, RelayError> {
        let inner = self.inner.lock().expect("relay lock");
        Ok(inner
            .actions
            .iter()
            .filter(|a| a.scan_id == scan_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ReportSink for MemoryRelay {
    async fn submit_report(&self, project_id: &str, report: &Report) -> Result<(), RelayError> {
        let mut inner = self.inner.lock().expect("relay lock");
        inner
            .reports
            .push((project_id.to_string(), report.clone()));
        Ok(())
    }

    async fn update_scan_status(
        &self,
        scan_id: &str,
        status: ScanStatus,
        error: Option<&str>,
    ) -> Result<(), RelayError> {
        let mut inner = self.inner.lock().expect("relay lock");
        let current = inner
            .statuses
            .get(scan_id)
            .map(|(s, _)| *s)
            .unwrap_or(ScanStatus::Pending);
        if current != status && !current.can_transition_to(status) {
            // Terminal states are sticky.
            return Ok(());
        }
        inner
            .statuses
            .insert(scan_id.to_string(), (status, error.map(String::from)));
        Ok(())
    }
}

#[async_trait]
impl SnapshotStore for MemoryRelay {
    async fn upload_screenshot(&self, bytes: &[u8]) -> Result<String, ToolError> {
        let mut inner = self.inner.lock().expect("relay lock");
        inner.screenshots.push(bytes.to_vec());
        Ok(format!("img_{}", inner.screenshots.len()))
    }
}

#[async_trait]
impl GateStore for MemoryRelay {
    async fn create_prompt(&self, scan_id: &str, question: &str) -> Result<String, RelayError> {
        let mut inner = self.inner.lock().expect("relay lock");
        let id = Uuid::new_v4().to_string();
        inner.prompts.insert(
            id.clone(),
            HumanPrompt {
                id: id.clone(),
                scan_id: scan_id.to_string(),
                question: question.to_string(),
                status: PromptStatus::Pending,
                response: None,
            },
        );
        Ok(id)
    }

    async fn get_prompt(&self, prompt_id: &str) -> Result<HumanPrompt, RelayError> {
        let inner = self.inner.lock().expect("relay lock");
        inner
            .prompts
            .get(prompt_id)
            .cloned()
            .ok_or_else(|| RelayError::ScanNotFound(prompt_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn duplicate_tool_call_by_id_is_dropped() {
        let relay = MemoryRelay::new();
        let payload = json!({"call_id": "c1", "tool": "read_file"});
        relay
            .push("scan", ActionType::ToolCall, payload.clone())
            .await
            .unwrap();
        relay
            .push("scan", ActionType::ToolCall, payload)
            .await
            .unwrap();

        assert_eq!(relay.actions_of_type("scan", ActionType::ToolCall).len(), 1);
    }

    #[tokio::test]
    async fn unidentified_duplicates_are_accepted() {
        let relay = MemoryRelay::new();
        for _ in 0..2 {
            relay
                .push("scan", ActionType::Reasoning, json!("same thought"))
                .await
                .unwrap();
        }
        assert_eq!(relay.actions_of_type("scan", ActionType::Reasoning).len(), 2);
    }

    #[tokio::test]
    async fn terminal_status_is_sticky() {
        let relay = MemoryRelay::new();
        relay
            .update_scan_status("scan", ScanStatus::Running, None)
            .await
            .unwrap();
        relay
            .update_scan_status("scan", ScanStatus::Completed, None)
            .await
            .unwrap();
        relay
            .update_scan_status("scan", ScanStatus::Failed, Some("late"))
            .await
            .unwrap();

        let (status, error) = relay.status("scan").unwrap();
        assert_eq!(status, ScanStatus::Completed);
        assert!(error.is_none());
    }

    #[tokio::test]
    async fn prompt_round_trip() {
        let relay = MemoryRelay::new();
        let id = relay.create_prompt("scan", "Which subdomain?").await.unwrap();

        let prompt = relay.get_prompt(&id).await.unwrap();
        assert_eq!(prompt.status, PromptStatus::Pending);

        relay.answer_prompt(&id, "admin.example.com");
        let prompt = relay.get_prompt(&id).await.unwrap();
        assert_eq!(prompt.status, PromptStatus::Answered);
        assert_eq!(prompt.response.as_deref(), Some("admin.example.com"));
    }
}

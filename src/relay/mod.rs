//! Durable coordination: the action relay, report sink, and human-gate
//! store.
//!
//! The relay is an append-mostly sink for scan events and the single point
//! of durable coordination between the harness, live observers, and the
//! report compiler. Delivery is at-least-once: callers either deduplicate
//! identified pushes (tool calls by call id) before pushing or rely on the
//! store tolerating duplicates.

mod http;
mod memory;

pub use http::HttpRelay;
pub use memory::MemoryRelay;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::RelayError;
use crate::model::{ActionRecord, ActionType, HumanPrompt, Report, ScanStatus};

/// Append-mostly sink for scan trace events.
#[async_trait]
pub trait ActionRelay: Send + Sync {
    /// Append one action. The server assigns the ordering timestamp.
    async fn push(
        &self,
        scan_id: &str,
        action_type: ActionType,
        payload: serde_json::Value,
    ) -> Result<(), RelayError>;

    /// Actions strictly after the given server timestamp.
    async fn list_actions_after(
        &self,
        scan_id: &str,
        after: DateTime<Utc>,
    ) -> Result<Vec<ActionRecord>, RelayError>;

    /// The full trace for a scan, in server-timestamp order. Used by the
    /// report compiler.
    async fn list_all_actions(&self, scan_id: &str) -> Result<Vec<ActionRecord>, RelayError>;
}

/// Report submission and scan status updates.
#[async_trait]
pub trait ReportSink: Send + Sync {
    async fn submit_report(&self, project_id: &str, report: &Report) -> Result<(), RelayError>;

    async fn update_scan_status(
        &self,
        scan_id: &str,
        status: ScanStatus,
        error: Option<&str>,
    ) -> Result<(), RelayError>;
}

/// Store side of the human-input gate.
#[async_trait]
pub trait GateStore: Send + Sync {
    /// Create a pending prompt, returning its id.
    async fn create_prompt(&self, scan_id: &str, question: &str) -> Result<String, RelayError>;

    /// Current state of a prompt.
    async fn get_prompt(&self, prompt_id: &str) -> Result<HumanPrompt, RelayError>;
}

/// Push an action, logging and continuing on failure.
///
/// Relay pushes are observability, not control flow: a failed push must
/// never take down a scan. The policy is log-and-continue, applied at
/// every call site through this helper rather than a silent catch-all.
pub async fn push_or_log(
    relay: &dyn ActionRelay,
    scan_id: &str,
    action_type: ActionType,
    payload: serde_json::Value,
) {
    if let Err(e) = relay.push(scan_id, action_type, payload).await {
        tracing::warn!(scan_id, ?action_type, error = %e, "relay push failed, continuing");
    }
}

/// Convenience for free-text actions (reasoning/observation).
pub async fn push_text_or_log(
    relay: &dyn ActionRelay,
    scan_id: &str,
    action_type: ActionType,
    text: impl Into<String>,
) {
    push_or_log(
        relay,
        scan_id,
        action_type,
        serde_json::Value::String(text.into()),
    )
    .await;
}

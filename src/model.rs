//! Core data model: scan sessions, trace actions, findings, reports,
//! and human prompts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of a scan. Transitions are monotonic: a terminal state is
/// never left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl ScanStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ScanStatus::Completed | ScanStatus::Failed)
    }

    /// Whether a transition to `next` is allowed.
    pub fn can_transition_to(&self, next: ScanStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (ScanStatus::Pending, ScanStatus::Running) => true,
            (_, ScanStatus::Completed) | (_, ScanStatus::Failed) => true,
            _ => false,
        }
    }
}

/// Which execution harness drives a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HarnessKind {
    TurnLoop,
    Streaming,
}

/// What the scan is auditing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScanTarget {
    /// A cloned codebase snapshot on local disk.
    Codebase { snapshot_dir: String },
    /// A live web endpoint.
    WebApp {
        url: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        credentials: Option<WebCredentials>,
    },
}

impl ScanTarget {
    /// Snapshot directory, when the target is a codebase.
    pub fn snapshot_dir(&self) -> Option<&str> {
        match self {
            ScanTarget::Codebase { snapshot_dir } => Some(snapshot_dir),
            ScanTarget::WebApp { .. } => None,
        }
    }

    /// One-line description pushed as the opening observation.
    pub fn describe(&self) -> String {
        match self {
            ScanTarget::Codebase { snapshot_dir } => {
                format!("codebase snapshot at {snapshot_dir}")
            }
            ScanTarget::WebApp { url, credentials } => {
                if credentials.is_some() {
                    format!("web application at {url} (authenticated)")
                } else {
                    format!("web application at {url}")
                }
            }
        }
    }
}

/// Login material for authenticated web targets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebCredentials {
    pub username: String,
    pub password: String,
}

/// One scan from request to terminal report or failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanSession {
    pub id: String,
    pub project_id: String,
    pub target: ScanTarget,
    pub harness: HarnessKind,
    pub model: String,
    pub status: ScanStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ScanSession {
    pub fn new(project_id: impl Into<String>, target: ScanTarget, model: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            project_id: project_id.into(),
            target,
            harness: HarnessKind::TurnLoop,
            model: model.into(),
            status: ScanStatus::Pending,
            error: None,
        }
    }
}

/// Kind of a trace action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Reasoning,
    ToolCall,
    ToolResult,
    Observation,
    HumanInputRequest,
}

/// One appended trace record. Ordering is by the server-assigned
/// timestamp, not client order; duplicates of non-identified types are
/// tolerated (at-least-once delivery).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRecord {
    pub scan_id: String,
    #[serde(rename = "type")]
    pub action_type: ActionType,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl ActionRecord {
    /// Text content of the payload: the string itself, or the `summary` /
    /// `text` field of a structured payload.
    pub fn payload_text(&self) -> Option<&str> {
        match &self.payload {
            serde_json::Value::String(s) => Some(s),
            serde_json::Value::Object(map) => map
                .get("summary")
                .or_else(|| map.get("text"))
                .and_then(|v| v.as_str()),
            _ => None,
        }
    }
}

/// Severity scale for findings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
    Info,
}

/// A single vulnerability finding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    /// Sequential id (`VN-001`, ...) assigned at submission time.
    #[serde(default)]
    pub id: String,
    pub title: String,
    pub severity: Severity,
    pub description: String,
    /// `file:start-end` or a URL.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recommendation: Option<String>,
    /// Evidence snippet; backfilled from the snapshot when absent and the
    /// location parses as a file range.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
}

/// Assign `VN-001`, `VN-002`, ... in order. Ids are immutable after this.
pub fn assign_finding_ids(findings: &mut [Finding]) {
    for (i, finding) in findings.iter_mut().enumerate() {
        finding.id = format!("VN-{:03}", i + 1);
    }
}

/// The structured scan report. Submission is terminal for the session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub scan_id: String,
    pub summary: String,
    pub findings: Vec<Finding>,
}

/// A file location parsed from a finding's `location` field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRange {
    pub path: String,
    pub start: usize,
    pub end: usize,
}

/// Parse `path:start` or `path:start-end` (1-based, inclusive).
/// URLs and bare paths yield `None`.
pub fn parse_file_range(location: &str) -> Option<FileRange> {
    if location.contains("://") {
        return None;
    }
    let (path, range) = location.rsplit_once(':')?;
    if path.is_empty() {
        return None;
    }
    let (start_str, end_str) = match range.split_once('-') {
        Some((s, e)) => (s, e),
        None => (range, range),
    };
    let start: usize = start_str.trim().parse().ok()?;
    let end: usize = end_str.trim().parse().ok()?;
    if start == 0 || end < start {
        return None;
    }
    Some(FileRange {
        path: path.to_string(),
        start,
        end,
    })
}

/// Status of a pending human prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptStatus {
    Pending,
    Answered,
}

/// A question raised by the agent, answered by an external operator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HumanPrompt {
    pub id: String,
    pub scan_id: String,
    pub question: String,
    pub status: PromptStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
}

//! Tool dispatch table.
//!
//! A closed set of tool kinds with typed input contracts, dispatched by
//! `match`. Every dispatch follows the same relay contract: a `tool_call`
//! action is pushed before execution and a `tool_result` after, success
//! or not. Execution errors become the result's payload text; they are
//! never fatal to the scan.

mod browser;
mod fs;
mod http;

pub use browser::{
    BrowserAction, BrowserBridge, HttpBrowserBridge, SnapshotStore,
};
pub use fs::{READ_FILE_MAX_CHARS, SEARCH_OUTPUT_MAX_CHARS};
pub use http::{HttpProbe, PROBE_BODY_MAX_CHARS};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::json;

use crate::error::ToolError;
use crate::gate::HumanGate;
use crate::llm::{ToolDefinition, ToolUse};
use crate::model::{ActionType, Finding};
use crate::relay::{push_or_log, ActionRelay};

/// The fixed tool variant set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolKind {
    ReadFile,
    SearchCode,
    AskHuman,
    HttpProbe,
    BrowserNavigate,
    BrowserAct,
    BrowserObserve,
    BrowserExtract,
    BrowserScreenshot,
    BrowserExecuteScript,
    SubmitFindings,
}

impl ToolKind {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "read_file" => ToolKind::ReadFile,
            "search_code" => ToolKind::SearchCode,
            "ask_human" => ToolKind::AskHuman,
            "http_probe" => ToolKind::HttpProbe,
            "browser_navigate" => ToolKind::BrowserNavigate,
            "browser_act" => ToolKind::BrowserAct,
            "browser_observe" => ToolKind::BrowserObserve,
            "browser_extract" => ToolKind::BrowserExtract,
            "browser_screenshot" => ToolKind::BrowserScreenshot,
            "browser_execute_script" => ToolKind::BrowserExecuteScript,
            "submit_findings" => ToolKind::SubmitFindings,
            _ => return None,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            ToolKind::ReadFile => "read_file",
            ToolKind::SearchCode => "search_code",
            ToolKind::AskHuman => "ask_human",
            ToolKind::HttpProbe => "http_probe",
            ToolKind::BrowserNavigate => "browser_navigate",
            ToolKind::BrowserAct => "browser_act",
            ToolKind::BrowserObserve => "browser_observe",
            ToolKind::BrowserExtract => "browser_extract",
            ToolKind::BrowserScreenshot => "browser_screenshot",
            ToolKind::BrowserExecuteScript => "browser_execute_script",
            ToolKind::SubmitFindings => "submit_findings",
        }
    }
}

/// A parsed `submit_findings` call.
#[derive(Debug, Clone, Deserialize)]
pub struct Submission {
    pub summary: String,
    #[serde(default)]
    pub findings: Vec<Finding>,
}

/// The outcome of one dispatched call.
#[derive(Debug)]
pub struct ToolExecution {
    /// Text fed back to the model as the tool result.
    pub content: String,
    /// Set when the call was `submit_findings`; terminal for the session.
    pub submission: Option<Submission>,
}

// Typed inputs.

#[derive(Deserialize)]
struct ReadFileInput {
    path: String,
}

#[derive(Deserialize)]
struct SearchCodeInput {
    pattern: String,
}

#[derive(Deserialize)]
struct AskHumanInput {
    question: String,
}

#[derive(Deserialize)]
struct HttpProbeInput {
    method: String,
    url: String,
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default)]
    body: Option<String>,
}

#[derive(Deserialize)]
struct BrowserInput {
    #[serde(alias = "url", alias = "script")]
    instruction: String,
}

/// Executes tool calls for one scan.
pub struct Dispatcher {
    scan_id: String,
    snapshot_dir: Option<PathBuf>,
    probe: HttpProbe,
    browser: Option<Arc<dyn BrowserBridge>>,
    snapshots: Option<Arc<dyn SnapshotStore>>,
    gate: HumanGate,
}

impl Dispatcher {
    pub fn new(scan_id: impl Into<String>, snapshot_dir: Option<PathBuf>, gate: HumanGate) -> Self {
        Self {
            scan_id: scan_id.into(),
            snapshot_dir,
            probe: HttpProbe::new(),
            browser: None,
            snapshots: None,
            gate,
        }
    }

    pub fn with_browser(
        mut self,
        bridge: Arc<dyn BrowserBridge>,
        snapshots: Arc<dyn SnapshotStore>,
    ) -> Self {
        self.browser = Some(bridge);
        self.snapshots = Some(snapshots);
        self
    }

    /// The tool schema set offered to the model.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs = Vec::new();

        if self.snapshot_dir.is_some() {
            defs.push(ToolDefinition {
                name: "read_file".to_string(),
                description: "Read a file from the repository".to_string(),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "path": {"type": "string", "description": "File path relative to repo root"}
                    },
                    "required": ["path"]
                }),
            });
            defs.push(ToolDefinition {
                name: "search_code".to_string(),
                description: "Search for a pattern in the codebase".to_string(),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "pattern": {"type": "string", "description": "Grep pattern to search for"}
                    },
                    "required": ["pattern"]
                }),
            });
        }

        defs.push(ToolDefinition {
            name: "ask_human".to_string(),
            description: "Ask the human operator a question and wait for their answer"
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "question": {"type": "string"}
                },
                "required": ["question"]
            }),
        });

        defs.push(ToolDefinition {
            name: "http_probe".to_string(),
            description:
                "Send a raw HTTP request to the target, bypassing the browser. For API probing."
                    .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "method": {"type": "string", "enum": ["GET", "POST", "PUT", "DELETE", "PATCH", "HEAD"]},
                    "url": {"type": "string"},
                    "headers": {"type": "object", "additionalProperties": {"type": "string"}},
                    "body": {"type": "string"}
                },
                "required": ["method", "url"]
            }),
        });

        if self.browser.is_some() {
            for (name, description, field) in [
                ("browser_navigate", "Navigate the browser to a URL", "url"),
                ("browser_act", "Perform an action on the current page", "instruction"),
                ("browser_observe", "Describe interactive elements on the current page", "instruction"),
                ("browser_extract", "Extract structured data from the current page", "instruction"),
                ("browser_execute_script", "Run JavaScript in the page context", "script"),
            ] {
                defs.push(ToolDefinition {
                    name: name.to_string(),
                    description: description.to_string(),
                    input_schema: json!({
                        "type": "object",
                        "properties": { field: {"type": "string"} },
                        "required": [field]
                    }),
                });
            }
            defs.push(ToolDefinition {
                name: "browser_screenshot".to_string(),
                description: "Capture a screenshot of the current page".to_string(),
                input_schema: json!({"type": "object", "properties": {}}),
            });
        }

        defs.push(ToolDefinition {
            name: "submit_findings".to_string(),
            description: "Submit the final security report".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "summary": {"type": "string"},
                    "findings": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "title": {"type": "string"},
                                "severity": {"type": "string", "enum": ["critical", "high", "medium", "low", "info"]},
                                "description": {"type": "string"},
                                "location": {"type": "string"},
                                "recommendation": {"type": "string"}
                            },
                            "required": ["title", "severity", "description"]
                        }
                    }
                },
                "required": ["summary", "findings"]
            }),
        });

        defs
    }

    /// Dispatch one call, with the full relay contract.
    pub async fn dispatch(&self, relay: &dyn ActionRelay, call: &ToolUse) -> ToolExecution {
        let call_summary = self.call_summary(call);
        push_or_log(
            relay,
            &self.scan_id,
            ActionType::ToolCall,
            json!({
                "call_id": call.id,
                "tool": call.name,
                "summary": call_summary,
                "input": call.input,
            }),
        )
        .await;

        let (execution, result_summary) = match self.execute(relay, call).await {
            Ok(ok) => ok,
            Err(e) => {
                let text = format!("Error: {e}");
                let summary = format!("{} failed: {e}", call.name);
                (
                    ToolExecution {
                        content: text,
                        submission: None,
                    },
                    summary,
                )
            }
        };

        push_or_log(
            relay,
            &self.scan_id,
            ActionType::ToolResult,
            json!({
                "call_id": call.id,
                "tool": call.name,
                "summary": result_summary,
            }),
        )
        .await;

        execution
    }

    fn call_summary(&self, call: &ToolUse) -> String {
        match ToolKind::from_name(&call.name) {
            Some(ToolKind::ReadFile) => {
                let path = call.input.get("path").and_then(|v| v.as_str()).unwrap_or("?");
                format!("Reading {path}")
            }
            Some(ToolKind::SearchCode) => {
                let pattern = call
                    .input
                    .get("pattern")
                    .and_then(|v| v.as_str())
                    .unwrap_or("?");
                format!("Searching for `{pattern}`")
            }
            Some(ToolKind::AskHuman) => "Waiting for human input".to_string(),
            Some(ToolKind::HttpProbe) => {
                let method = call.input.get("method").and_then(|v| v.as_str()).unwrap_or("?");
                let url = call.input.get("url").and_then(|v| v.as_str()).unwrap_or("?");
                format!("{method} {url}")
            }
            Some(ToolKind::SubmitFindings) => "Submitting findings".to_string(),
            Some(_) => format!("Browser: {}", call.name.trim_start_matches("browser_")),
            None => format!("Unknown tool {}", call.name),
        }
    }

    async fn execute(
        &self,
        relay: &dyn ActionRelay,
        call: &ToolUse,
    ) -> Result<(ToolExecution, String), ToolError> {
        let Some(kind) = ToolKind::from_name(&call.name) else {
            return Err(ToolError::InvalidParameters(format!(
                "unknown tool: {}",
                call.name
            )));
        };

        match kind {
            ToolKind::ReadFile => {
                let input: ReadFileInput = parse_input(&call.input)?;
                let dir = self.snapshot_dir()?;
                let (content, lines) = fs::read_file(dir, &input.path).await?;
                let summary = format!(
                    "Read {} ({} chars, {} lines)",
                    input.path,
                    content.chars().count(),
                    lines
                );
                Ok((done(content), summary))
            }
            ToolKind::SearchCode => {
                let input: SearchCodeInput = parse_input(&call.input)?;
                let dir = self.snapshot_dir()?;
                let output = fs::search_code(dir, &input.pattern).await?;
                let matches = if output == "No matches found." {
                    0
                } else {
                    output.lines().count()
                };
                let summary = format!("Found {matches} matches for `{}`", input.pattern);
                Ok((done(output), summary))
            }
            ToolKind::AskHuman => {
                let input: AskHumanInput = parse_input(&call.input)?;
                let response = self.gate.ask(relay, &self.scan_id, &input.question).await;
                Ok((done(response), "Human responded".to_string()))
            }
            ToolKind::HttpProbe => {
                let input: HttpProbeInput = parse_input(&call.input)?;
                let resp = self
                    .probe
                    .execute(&input.method, &input.url, &input.headers, input.body.as_deref())
                    .await?;
                let summary = format!("{} {} -> {}", input.method, input.url, resp.status);
                let content = json!({
                    "status": resp.status,
                    "headers": resp.headers,
                    "body": resp.body,
                })
                .to_string();
                Ok((done(content), summary))
            }
            ToolKind::BrowserNavigate
            | ToolKind::BrowserAct
            | ToolKind::BrowserObserve
            | ToolKind::BrowserExtract
            | ToolKind::BrowserExecuteScript => {
                let input: BrowserInput = parse_input(&call.input)?;
                let action = match kind {
                    ToolKind::BrowserNavigate => BrowserAction::Navigate,
                    ToolKind::BrowserAct => BrowserAction::Act,
                    ToolKind::BrowserObserve => BrowserAction::Observe,
                    ToolKind::BrowserExtract => BrowserAction::Extract,
                    _ => BrowserAction::ExecuteScript,
                };
                let bridge = self.bridge()?;
                let result = bridge.perform(action, &input.instruction).await?;
                Ok((done(result), format!("{} ok", call.name)))
            }
            ToolKind::BrowserScreenshot => {
                let bridge = self.bridge()?;
                let bytes = bridge.screenshot().await?;
                let store = self.snapshots.as_ref().ok_or_else(|| {
                    ToolError::ExecutionFailed("screenshot storage not configured".to_string())
                })?;
                let storage_id = store.upload_screenshot(&bytes).await?;
                let summary = format!("Screenshot stored as {storage_id}");
                Ok((done(format!("Screenshot captured: {storage_id}")), summary))
            }
            ToolKind::SubmitFindings => {
                let submission: Submission = parse_input(&call.input)?;
                let summary = format!(
                    "Report submitted with {} findings",
                    submission.findings.len()
                );
                Ok((
                    ToolExecution {
                        content: "Report received.".to_string(),
                        submission: Some(submission),
                    },
                    summary,
                ))
            }
        }
    }

    fn snapshot_dir(&self) -> Result<&std::path::Path, ToolError> {
        self.snapshot_dir.as_deref().ok_or_else(|| {
            ToolError::InvalidParameters(
                "no codebase snapshot for this target".to_string(),
            )
        })
    }

    fn bridge(&self) -> Result<&Arc<dyn BrowserBridge>, ToolError> {
        self.browser.as_ref().ok_or_else(|| {
            ToolError::ExecutionFailed("browser bridge not configured".to_string())
        })
    }
}

/// Read the snapshot lines a finding's location points at, for evidence
/// snippet backfill.
pub async fn read_snippet(
    snapshot_dir: &std::path::Path,
    range: &crate::model::FileRange,
) -> Result<String, ToolError> {
    fs::read_line_range(snapshot_dir, &range.path, range.start, range.end).await
}

fn parse_input<T: serde::de::DeserializeOwned>(input: &serde_json::Value) -> Result<T, ToolError> {
    serde_json::from_value(input.clone())
        .map_err(|e| ToolError::InvalidParameters(e.to_string()))
}

fn done(content: String) -> ToolExecution {
    ToolExecution {
        content,
        submission: None,
    }
}

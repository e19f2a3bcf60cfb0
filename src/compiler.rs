//! Second-pass report compiler.
//!
//! When a harness runs out of budget without a submission, or the agent
//! submits something under-structured, the compiler reads the condensed
//! trace and asks a completion provider to restructure it into discrete
//! findings. Compiler failure is the one terminal failure path in the
//! pipeline.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;

use crate::error::CompilerError;
use crate::llm::{ChatMessage, CompletionProvider, CompletionRequest};
use crate::model::{
    assign_finding_ids, parse_file_range, ActionRecord, ActionType, Finding, Report,
};
use crate::tools::Submission;

/// Cap on the condensed trace handed to the restructuring prompt.
pub const TRACE_MAX_CHARS: usize = 80_000;

const COMPILE_SYSTEM_PROMPT: &str = r#"You are a security report compiler. You are given the raw trace of a security scan: the scanning agent's reasoning, observations, and tool activity. The agent failed to produce a properly structured report.

Reconstruct a structured report from the trace:
1. Extract every distinct vulnerability the agent identified, with evidence.
2. For each finding provide: title, severity (critical/high/medium/low/info), description, location (file:start-end or URL when known), recommendation.
3. Write a short overall summary.

Only include findings actually supported by the trace. Respond with JSON only:
{
  "summary": "...",
  "findings": [
    {"title": "...", "severity": "...", "description": "...", "location": "...", "recommendation": "..."}
  ]
}"#;

/// Whether a submission is too unstructured to accept as-is.
///
/// The exact calibration (`<= 1` finding, `> 300` summary chars) comes
/// from observed agent behavior; do not retune it casually.
pub fn is_under_structured(submission: &Submission) -> bool {
    submission.findings.len() <= 1 && submission.summary.chars().count() > 300
}

/// The compiler itself.
pub struct ReportCompiler {
    provider: Arc<dyn CompletionProvider>,
    snapshot_dir: Option<PathBuf>,
}

impl ReportCompiler {
    pub fn new(provider: Arc<dyn CompletionProvider>, snapshot_dir: Option<PathBuf>) -> Self {
        Self {
            provider,
            snapshot_dir,
        }
    }

    /// Compile a structured report from the raw trace.
    pub async fn compile(
        &self,
        scan_id: &str,
        trace: &[ActionRecord],
    ) -> Result<Report, CompilerError> {
        let condensed = condense_trace(trace);
        if condensed.trim().is_empty() {
            return Err(CompilerError::EmptyTrace);
        }

        tracing::info!(scan_id, trace_chars = condensed.len(), "compiling report from trace");

        let request = CompletionRequest::new(
            COMPILE_SYSTEM_PROMPT,
            vec![ChatMessage::user(format!(
                "Scan trace follows.\n\n{condensed}"
            ))],
        )
        .with_max_tokens(4096)
        .with_temperature(0.2);

        let response = self.provider.complete(request).await.map_err(CompilerError::Llm)?;
        let text = response.text_blocks().join("\n");

        let parsed = parse_compiled(&text)?;
        if parsed.findings.is_empty() {
            return Err(CompilerError::Unstructured(
                "restructuring produced zero findings".to_string(),
            ));
        }

        let mut findings = parsed.findings;
        assign_finding_ids(&mut findings);
        if let Some(dir) = &self.snapshot_dir {
            backfill_snippets(&mut findings, dir).await;
        }

        Ok(Report {
            scan_id: scan_id.to_string(),
            summary: parsed.summary,
            findings,
        })
    }
}

#[derive(Deserialize)]
struct CompiledReport {
    summary: String,
    #[serde(default)]
    findings: Vec<Finding>,
}

/// Extract the JSON object from a model response that may wrap it in
/// prose or a code fence.
fn parse_compiled(text: &str) -> Result<CompiledReport, CompilerError> {
    let start = text.find('{');
    let end = text.rfind('}');
    let (Some(start), Some(end)) = (start, end) else {
        return Err(CompilerError::Unstructured(
            "no JSON object in compiler response".to_string(),
        ));
    };
    if end < start {
        return Err(CompilerError::Unstructured(
            "malformed compiler response".to_string(),
        ));
    }
    serde_json::from_str(&text[start..=end])
        .map_err(|e| CompilerError::Unstructured(format!("JSON parse error: {e}")))
}

/// Condense a trace to reasoning, observations, and tool summaries,
/// capped for the restructuring prompt.
pub fn condense_trace(trace: &[ActionRecord]) -> String {
    let mut out = String::new();
    for record in trace {
        let line = match record.action_type {
            ActionType::Reasoning => record
                .payload_text()
                .map(|t| format!("[reasoning] {t}")),
            ActionType::Observation => record
                .payload_text()
                .map(|t| format!("[observation] {t}")),
            ActionType::ToolCall | ActionType::ToolResult => {
                record.payload_text().map(|t| format!("[tool] {t}"))
            }
            ActionType::HumanInputRequest => None,
        };
        if let Some(line) = line {
            if out.len() + line.len() + 1 > TRACE_MAX_CHARS {
                break;
            }
            out.push_str(&line);
            out.push('\n');
        }
    }
    out
}

/// Backfill evidence snippets for findings whose location parses as a
/// file range but which carry no snippet.
pub async fn backfill_snippets(findings: &mut [Finding], snapshot_dir: &Path) {
    for finding in findings.iter_mut() {
        if finding.snippet.is_some() {
            continue;
        }
        let Some(location) = &finding.location else {
            continue;
        };
        let Some(range) = parse_file_range(location) else {
            continue;
        };
        match crate::tools::read_snippet(snapshot_dir, &range).await {
            Ok(snippet) => finding.snippet = Some(snippet),
            Err(e) => {
                tracing::debug!(location, error = %e, "snippet backfill skipped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{CompletionResponse, ContentBlock, FinishReason};
    use crate::model::Severity;
    use async_trait::async_trait;
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    struct CannedProvider {
        reply: String,
    }

    #[async_trait]
    impl CompletionProvider for CannedProvider {
        async fn complete(
            &self,
            _req: CompletionRequest,
        ) -> Result<CompletionResponse, crate::error::LlmError> {
            Ok(CompletionResponse {
                content: vec![ContentBlock::Text {
                    text: self.reply.clone(),
                }],
                finish_reason: FinishReason::EndTurn,
            })
        }

        fn model_name(&self) -> &str {
            "canned"
        }
    }

    fn trace_record(action_type: ActionType, payload: serde_json::Value) -> ActionRecord {
        ActionRecord {
            scan_id: "scan".to_string(),
            action_type,
            payload,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn under_structured_heuristic_is_exact() {
        let long_summary = "x".repeat(301);
        let short_summary = "x".repeat(300);
        let finding = Finding {
            id: String::new(),
            title: "t".to_string(),
            severity: Severity::Low,
            description: "d".to_string(),
            location: None,
            recommendation: None,
            snippet: None,
        };

        // One finding + long prose: hand off.
        assert!(is_under_structured(&Submission {
            summary: long_summary.clone(),
            findings: vec![finding.clone()],
        }));
        // Exactly 300 chars is fine.
        assert!(!is_under_structured(&Submission {
            summary: short_summary,
            findings: vec![],
        }));
        // Two findings are structured no matter the summary length.
        assert!(!is_under_structured(&Submission {
            summary: long_summary,
            findings: vec![finding.clone(), finding],
        }));
    }

    #[test]
    fn condense_skips_gate_requests_and_caps() {
        let trace = vec![
            trace_record(ActionType::Reasoning, serde_json::json!("auth looks weak")),
            trace_record(
                ActionType::ToolResult,
                serde_json::json!({"tool": "read_file", "summary": "Read app.py (120 chars, 8 lines)"}),
            ),
            trace_record(
                ActionType::HumanInputRequest,
                serde_json::json!({"question": "?"}),
            ),
        ];
        let condensed = condense_trace(&trace);
        assert!(condensed.contains("[reasoning] auth looks weak"));
        assert!(condensed.contains("[tool] Read app.py"));
        assert!(!condensed.contains('?'));
    }

    #[tokio::test]
    async fn compile_assigns_ids_and_parses_fenced_json() {
        let reply = r#"Here is the report:
```json
{"summary": "Two issues.", "findings": [
  {"title": "Hardcoded secret", "severity": "high", "description": "d"},
  {"title": "Open redirect", "severity": "medium", "description": "d"}
]}
```"#;
        let compiler = ReportCompiler::new(
            Arc::new(CannedProvider {
                reply: reply.to_string(),
            }),
            None,
        );
        let trace = vec![trace_record(
            ActionType::Reasoning,
            serde_json::json!("found things"),
        )];

        let report = compiler.compile("scan", &trace).await.unwrap();
        assert_eq!(report.findings.len(), 2);
        assert_eq!(report.findings[0].id, "VN-001");
        assert_eq!(report.findings[1].id, "VN-002");
    }

    #[tokio::test]
    async fn empty_trace_is_terminal() {
        let compiler = ReportCompiler::new(
            Arc::new(CannedProvider {
                reply: "{}".to_string(),
            }),
            None,
        );
        let err = compiler.compile("scan", &[]).await.unwrap_err();
        assert!(matches!(err, CompilerError::EmptyTrace));
    }

    #[tokio::test]
    async fn zero_findings_is_unstructured() {
        let compiler = ReportCompiler::new(
            Arc::new(CannedProvider {
                reply: r#"{"summary": "nothing", "findings": []}"#.to_string(),
            }),
            None,
        );
        let trace = vec![trace_record(
            ActionType::Observation,
            serde_json::json!("scanned"),
        )];
        let err = compiler.compile("scan", &trace).await.unwrap_err();
        assert!(matches!(err, CompilerError::Unstructured(_)));
    }

    #[tokio::test]
    async fn snippet_backfill_reads_exact_lines() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("vuln.py"), "a\nSECRET = 'k'\nc\n").unwrap();

        let mut findings = vec![Finding {
            id: String::new(),
            title: "Hardcoded secret".to_string(),
            severity: Severity::High,
            description: "d".to_string(),
            location: Some("vuln.py:2".to_string()),
            recommendation: None,
            snippet: None,
        }];
        backfill_snippets(&mut findings, dir.path()).await;
        assert_eq!(findings[0].snippet.as_deref(), Some("SECRET = 'k'"));
    }
}

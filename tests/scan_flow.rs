//! End-to-end scan flow tests against the in-memory store.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use rezero::config::Config;
use rezero::error::{LlmError, ScanError};
use rezero::llm::{
    CompletionProvider, CompletionRequest, CompletionResponse, ContentBlock, FinishReason,
};
use rezero::model::{ActionType, HarnessKind, ScanStatus, ScanTarget};
use rezero::relay::MemoryRelay;
use rezero::session::{
    FeedEvent, MessagePart, SessionControl, SessionLiveness, ToolState,
};
use rezero::{ScanRunner, ScanSession};

/// Provider replaying a fixed response script.
struct ScriptedProvider {
    script: Mutex<Vec<CompletionResponse>>,
}

impl ScriptedProvider {
    fn new(mut responses: Vec<CompletionResponse>) -> Arc<Self> {
        responses.reverse();
        Arc::new(Self {
            script: Mutex::new(responses),
        })
    }
}

#[async_trait]
impl CompletionProvider for ScriptedProvider {
    async fn complete(&self, _req: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        self.script
            .lock()
            .unwrap()
            .pop()
            .ok_or_else(|| LlmError::Session("script exhausted".to_string()))
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}

fn tool_turn(calls: Vec<(&str, &str, serde_json::Value)>) -> CompletionResponse {
    CompletionResponse {
        content: calls
            .into_iter()
            .map(|(id, name, input)| ContentBlock::ToolUse {
                id: id.to_string(),
                name: name.to_string(),
                input,
            })
            .collect(),
        finish_reason: FinishReason::ToolUse,
    }
}

fn text_turn(text: &str) -> CompletionResponse {
    CompletionResponse {
        content: vec![ContentBlock::Text {
            text: text.to_string(),
        }],
        finish_reason: FinishReason::EndTurn,
    }
}

fn submit_turn(id: &str, summary: &str, findings: serde_json::Value) -> CompletionResponse {
    tool_turn(vec![(
        id,
        "submit_findings",
        json!({ "summary": summary, "findings": findings }),
    )])
}

fn codebase_session(dir: &std::path::Path) -> ScanSession {
    ScanSession::new(
        "proj-1",
        ScanTarget::Codebase {
            snapshot_dir: dir.to_string_lossy().to_string(),
        },
        "claude-opus-4",
    )
}

fn runner(
    store: Arc<MemoryRelay>,
    provider: Arc<dyn CompletionProvider>,
) -> ScanRunner<MemoryRelay> {
    ScanRunner::from_parts(store, Config::default(), provider)
}

#[tokio::test]
async fn codebase_scan_relays_trace_and_submits_report() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("auth.py"), "password = 'admin'\ntoken = None\n").unwrap();

    let provider = ScriptedProvider::new(vec![
        tool_turn(vec![("c1", "read_file", json!({"path": "auth.py"}))]),
        tool_turn(vec![("c2", "search_code", json!({"pattern": "password"}))]),
        submit_turn(
            "c3",
            "Two credential handling issues.",
            json!([
                {"title": "Hardcoded password", "severity": "critical", "description": "d",
                 "location": "auth.py:1"},
                {"title": "Token defaults to None", "severity": "low", "description": "d"}
            ]),
        ),
    ]);

    let store = Arc::new(MemoryRelay::new());
    let mut session = codebase_session(dir.path());
    let scan_id = session.id.clone();

    let report = runner(store.clone(), provider)
        .run(&mut session)
        .await
        .expect("scan completes");

    // Every tool call relayed as a call/result pair, in order.
    let calls = store.actions_of_type(&scan_id, ActionType::ToolCall);
    let results = store.actions_of_type(&scan_id, ActionType::ToolResult);
    assert_eq!(calls.len(), 3);
    assert_eq!(results.len(), 3);
    assert_eq!(calls[0].payload["tool"], "read_file");
    assert_eq!(calls[1].payload["tool"], "search_code");
    assert_eq!(calls[2].payload["tool"], "submit_findings");

    // Sequential finding ids, snippet backfilled from the located line.
    assert_eq!(report.findings[0].id, "VN-001");
    assert_eq!(report.findings[1].id, "VN-002");
    assert_eq!(report.findings[0].snippet.as_deref(), Some("password = 'admin'"));

    assert_eq!(session.status, ScanStatus::Completed);
    let (status, error) = store.status(&scan_id).unwrap();
    assert_eq!(status, ScanStatus::Completed);
    assert!(error.is_none());
    assert_eq!(store.report(&scan_id).unwrap().findings.len(), 2);
}

#[tokio::test]
async fn tool_error_is_relayed_and_scan_still_completes() {
    let dir = tempfile::tempdir().unwrap();

    let provider = ScriptedProvider::new(vec![
        tool_turn(vec![("c1", "read_file", json!({"path": "does/not/exist.py"}))]),
        submit_turn(
            "c2",
            "Nothing readable.",
            json!([{"title": "Empty repo", "severity": "info", "description": "d"}]),
        ),
    ]);

    let store = Arc::new(MemoryRelay::new());
    let mut session = codebase_session(dir.path());
    let scan_id = session.id.clone();

    runner(store.clone(), provider)
        .run(&mut session)
        .await
        .expect("scan completes");

    let results = store.actions_of_type(&scan_id, ActionType::ToolResult);
    assert!(results[0].payload["summary"]
        .as_str()
        .unwrap()
        .contains("failed"));
    assert_eq!(store.status(&scan_id).unwrap().0, ScanStatus::Completed);
}

#[tokio::test]
async fn turn_cap_hands_partial_trace_to_compiler() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("app.py"), "eval(input())\n").unwrap();

    // Twenty turns of exploration without ever submitting, then the
    // compiler's restructuring response.
    let mut script: Vec<CompletionResponse> = (0..20)
        .map(|i| {
            let id = format!("c{i}");
            tool_turn(vec![(id.as_str(), "read_file", json!({"path": "app.py"}))])
        })
        .collect();
    script.push(text_turn(
        r#"{"summary": "Code execution via eval.", "findings": [
            {"title": "eval on user input", "severity": "critical", "description": "d",
             "location": "app.py:1"}
        ]}"#,
    ));

    let store = Arc::new(MemoryRelay::new());
    let mut session = codebase_session(dir.path());
    let scan_id = session.id.clone();

    let report = runner(store.clone(), ScriptedProvider::new(script))
        .run(&mut session)
        .await
        .expect("compiler salvages the scan");

    assert_eq!(report.findings.len(), 1);
    assert_eq!(report.findings[0].id, "VN-001");
    assert_eq!(report.findings[0].snippet.as_deref(), Some("eval(input())"));
    assert_eq!(store.status(&scan_id).unwrap().0, ScanStatus::Completed);
}

#[tokio::test]
async fn prose_submission_is_restructured() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.py"), "x = 1\n").unwrap();

    // One finding plus a long prose summary trips the restructuring
    // heuristic; the compiler then splits it into discrete findings.
    let prose = "The application has several problems. ".repeat(10);
    let provider = ScriptedProvider::new(vec![
        tool_turn(vec![("c1", "read_file", json!({"path": "a.py"}))]),
        submit_turn(
            "c2",
            &prose,
            json!([{"title": "Everything", "severity": "high", "description": "d"}]),
        ),
        text_turn(
            r#"{"summary": "Split into findings.", "findings": [
                {"title": "Issue one", "severity": "high", "description": "d"},
                {"title": "Issue two", "severity": "medium", "description": "d"}
            ]}"#,
        ),
    ]);

    let store = Arc::new(MemoryRelay::new());
    let mut session = codebase_session(dir.path());
    let scan_id = session.id.clone();

    let report = runner(store.clone(), provider)
        .run(&mut session)
        .await
        .expect("recompiled");

    assert_eq!(report.findings.len(), 2);
    assert_eq!(store.report(&scan_id).unwrap().summary, "Split into findings.");
}

#[tokio::test(start_paused = true)]
async fn unanswered_human_gate_never_hangs_the_scan() {
    let dir = tempfile::tempdir().unwrap();

    let provider = ScriptedProvider::new(vec![
        tool_turn(vec![(
            "c1",
            "ask_human",
            json!({"question": "Is the staging environment in scope?"}),
        )]),
        submit_turn(
            "c2",
            "Proceeded without operator input.",
            json!([{"title": "Scope unclear", "severity": "info", "description": "d"}]),
        ),
    ]);

    let store = Arc::new(MemoryRelay::new());
    let mut session = codebase_session(dir.path());
    let scan_id = session.id.clone();

    runner(store.clone(), provider)
        .run(&mut session)
        .await
        .expect("completes after gate timeout");

    // The request was surfaced for observers even though nobody answered.
    assert_eq!(
        store
            .actions_of_type(&scan_id, ActionType::HumanInputRequest)
            .len(),
        1
    );
    assert!(store.pending_prompt(&scan_id).is_some());
    assert_eq!(store.status(&scan_id).unwrap().0, ScanStatus::Completed);
}

#[tokio::test]
async fn missing_snapshot_fails_terminally() {
    let provider = ScriptedProvider::new(vec![]);
    let store = Arc::new(MemoryRelay::new());

    let mut session = ScanSession::new(
        "proj-1",
        ScanTarget::Codebase {
            snapshot_dir: "/nonexistent/snapshot".to_string(),
        },
        "claude-opus-4",
    );
    let scan_id = session.id.clone();

    let err = runner(store.clone(), provider)
        .run(&mut session)
        .await
        .unwrap_err();

    assert!(matches!(err, ScanError::MissingSnapshot(_)));
    assert_eq!(session.status, ScanStatus::Failed);
    let (status, error) = store.status(&scan_id).unwrap();
    assert_eq!(status, ScanStatus::Failed);
    assert!(error.unwrap().contains("/nonexistent/snapshot"));
}

#[tokio::test]
async fn unstructurable_trace_fails_the_scan() {
    let dir = tempfile::tempdir().unwrap();

    // The agent ends its turn immediately and the compiler cannot extract
    // any findings from what little trace exists.
    let provider = ScriptedProvider::new(vec![
        text_turn("Nothing to audit."),
        text_turn(r#"{"summary": "No evidence.", "findings": []}"#),
    ]);

    let store = Arc::new(MemoryRelay::new());
    let mut session = codebase_session(dir.path());
    let scan_id = session.id.clone();

    let err = runner(store.clone(), provider)
        .run(&mut session)
        .await
        .unwrap_err();

    assert!(matches!(err, ScanError::Compiler(_)));
    assert_eq!(store.status(&scan_id).unwrap().0, ScanStatus::Failed);
}

/// Session control plane scripted through channels.
struct ScriptedControl {
    events: Mutex<Option<mpsc::UnboundedReceiver<FeedEvent>>>,
    fetched: Vec<MessagePart>,
}

#[async_trait]
impl SessionControl for ScriptedControl {
    async fn create_session(&self) -> Result<String, LlmError> {
        Ok("ses_1".to_string())
    }

    async fn submit_prompt(
        &self,
        _session_id: &str,
        _model: &str,
        _system: &str,
        _user_text: &str,
    ) -> Result<(), LlmError> {
        Ok(())
    }

    async fn subscribe_events(&self) -> Result<BoxStream<'static, FeedEvent>, LlmError> {
        let rx = self.events.lock().unwrap().take().expect("subscribed once");
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn fetch_messages(&self, _session_id: &str) -> Result<Vec<MessagePart>, LlmError> {
        Ok(self.fetched.clone())
    }

    async fn session_status(&self, _session_id: &str) -> Result<SessionLiveness, LlmError> {
        Ok(SessionLiveness::Active)
    }
}

#[tokio::test(start_paused = true)]
async fn streaming_hard_cap_still_completes_from_partial_trace() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("api.py"), "app.secret_key = 'dev'\n").unwrap();

    // One finalized part early, then nothing but deltas until the
    // 45-minute cap forces abandonment.
    let (tx, rx) = mpsc::unbounded_channel();
    tx.send(FeedEvent::PartFinal {
        session_id: "ses_1".to_string(),
        part_id: "prt_1".to_string(),
        reasoning: false,
        text: "The Flask secret key is hardcoded to 'dev'.".to_string(),
    })
    .unwrap();
    let feeder = tokio::spawn(async move {
        loop {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            if tx
                .send(FeedEvent::PartDelta {
                    session_id: "ses_1".to_string(),
                })
                .is_err()
            {
                break;
            }
        }
    });

    let control = Arc::new(ScriptedControl {
        events: Mutex::new(Some(rx)),
        fetched: vec![],
    });
    let provider = ScriptedProvider::new(vec![text_turn(
        r#"{"summary": "Hardcoded secret key.", "findings": [
            {"title": "Hardcoded secret key", "severity": "high", "description": "d",
             "location": "api.py:1"}
        ]}"#,
    )]);

    let store = Arc::new(MemoryRelay::new());
    let mut session = codebase_session(dir.path());
    session.harness = HarnessKind::Streaming;
    session.model = "rl/osiris-8b".to_string();
    let scan_id = session.id.clone();

    let report = runner(store.clone(), provider)
        .with_session_control(control)
        .run(&mut session)
        .await
        .expect("partial trace still compiles");
    feeder.abort();

    assert_eq!(report.findings.len(), 1);
    assert_eq!(store.status(&scan_id).unwrap().0, ScanStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn streaming_scan_relays_feed_and_compiles() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("db.py"), "query = f\"... {user}\"\n").unwrap();

    let (tx, rx) = mpsc::unbounded_channel();
    tx.send(FeedEvent::PartFinal {
        session_id: "ses_1".to_string(),
        part_id: "prt_1".to_string(),
        reasoning: true,
        text: "Checking the query builder for injection.".to_string(),
    })
    .unwrap();
    tx.send(FeedEvent::Tool {
        session_id: "ses_1".to_string(),
        call_id: "call_1".to_string(),
        name: "read".to_string(),
        state: ToolState::Completed,
        input: json!({"path": "db.py"}),
        output: Some("query = ...".to_string()),
    })
    .unwrap();
    tx.send(FeedEvent::Idle {
        session_id: "ses_1".to_string(),
    })
    .unwrap();

    let control = Arc::new(ScriptedControl {
        events: Mutex::new(Some(rx)),
        fetched: vec![MessagePart::Text {
            part_id: "prt_1".to_string(),
            reasoning: true,
            text: "Checking the query builder for injection.".to_string(),
        }],
    });

    // The compiler runs on the completion provider after the feed ends.
    let provider = ScriptedProvider::new(vec![text_turn(
        r#"{"summary": "SQL injection in the query builder.", "findings": [
            {"title": "SQL injection", "severity": "critical", "description": "d",
             "location": "db.py:1"}
        ]}"#,
    )]);

    let store = Arc::new(MemoryRelay::new());
    let mut session = codebase_session(dir.path());
    session.harness = HarnessKind::Streaming;
    session.model = "rl/osiris-8b".to_string();
    let scan_id = session.id.clone();

    let report = runner(store.clone(), provider)
        .with_session_control(control)
        .run(&mut session)
        .await
        .expect("streaming scan completes");

    assert_eq!(report.findings[0].id, "VN-001");

    // Feed relayed once despite reconciliation re-observing the part.
    assert_eq!(store.actions_of_type(&scan_id, ActionType::Reasoning).len(), 1);
    assert_eq!(store.actions_of_type(&scan_id, ActionType::ToolCall).len(), 1);
    assert_eq!(store.actions_of_type(&scan_id, ActionType::ToolResult).len(), 1);
    assert_eq!(store.status(&scan_id).unwrap().0, ScanStatus::Completed);
}

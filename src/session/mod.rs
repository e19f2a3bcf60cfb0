//! Session control plane for the streaming harness.
//!
//! The event feed is global, not scoped to one session: every event
//! carries its session id in nested metadata and consumers demultiplex
//! client-side. Text and reasoning parts stream as partial deltas first
//! and are reported once more when finalized; tool calls move through
//! pending/running to a terminal completed/error state.

mod opencode;

pub use opencode::OpenCodeClient;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::Deserialize;

use crate::error::LlmError;

/// Tool-call state as reported by the feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolState {
    Pending,
    Running,
    Completed,
    Error,
}

impl ToolState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ToolState::Completed | ToolState::Error)
    }
}

/// An event from the global feed, already shaped for the harness.
#[derive(Debug, Clone)]
pub enum FeedEvent {
    /// A partial text delta. Never relayed; resets the staleness clock.
    PartDelta { session_id: String },
    /// A finalized text or reasoning part.
    PartFinal {
        session_id: String,
        part_id: String,
        reasoning: bool,
        text: String,
    },
    /// A tool call sighting (may repeat across states).
    Tool {
        session_id: String,
        call_id: String,
        name: String,
        state: ToolState,
        input: serde_json::Value,
        output: Option<String>,
    },
    /// The session went idle: generation finished.
    Idle { session_id: String },
    /// The session errored out.
    Error { session_id: String, message: String },
}

impl FeedEvent {
    pub fn session_id(&self) -> &str {
        match self {
            FeedEvent::PartDelta { session_id }
            | FeedEvent::PartFinal { session_id, .. }
            | FeedEvent::Tool { session_id, .. }
            | FeedEvent::Idle { session_id }
            | FeedEvent::Error { session_id, .. } => session_id,
        }
    }

    /// Meaningful events advance the scan; deltas only prove liveness.
    pub fn is_meaningful(&self) -> bool {
        !matches!(self, FeedEvent::PartDelta { .. })
    }
}

/// One part of a fetched message, for post-stream reconciliation.
#[derive(Debug, Clone)]
pub enum MessagePart {
    Text {
        part_id: String,
        reasoning: bool,
        text: String,
    },
    Tool {
        call_id: String,
        name: String,
        state: ToolState,
        input: serde_json::Value,
        output: Option<String>,
    },
}

/// Result of a liveness poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionLiveness {
    Active,
    Dead,
}

/// Remote conversation session API.
#[async_trait]
pub trait SessionControl: Send + Sync {
    /// Create a remote session, returning its id.
    async fn create_session(&self) -> Result<String, LlmError>;

    /// Submit the scan task. May not return until generation ends, so the
    /// harness runs it concurrently with feed consumption and must already
    /// be subscribed when calling it.
    async fn submit_prompt(
        &self,
        session_id: &str,
        model: &str,
        system: &str,
        user_text: &str,
    ) -> Result<(), LlmError>;

    /// Subscribe to the global event feed.
    async fn subscribe_events(&self) -> Result<BoxStream<'static, FeedEvent>, LlmError>;

    /// Fetch the full message list for a session (reconciliation).
    async fn fetch_messages(&self, session_id: &str) -> Result<Vec<MessagePart>, LlmError>;

    /// Poll whether the session is still alive.
    async fn session_status(&self, session_id: &str) -> Result<SessionLiveness, LlmError>;
}

/// Shape a raw feed event into a [`FeedEvent`]. Events the harness does
/// not consume yield `None`.
pub fn classify_event(raw: &serde_json::Value) -> Option<FeedEvent> {
    let event_type = raw.get("type")?.as_str()?;
    let props = raw.get("properties")?;

    match event_type {
        "message.part.delta" => {
            let session_id = props
                .get("part")
                .and_then(|p| p.get("sessionID"))
                .or_else(|| props.get("sessionID"))?
                .as_str()?
                .to_string();
            Some(FeedEvent::PartDelta { session_id })
        }
        "message.part.updated" => {
            let part = props.get("part")?;
            let session_id = part.get("sessionID")?.as_str()?.to_string();
            match part.get("type")?.as_str()? {
                "text" | "reasoning" => Some(FeedEvent::PartFinal {
                    session_id,
                    part_id: part.get("id")?.as_str()?.to_string(),
                    reasoning: part["type"] == "reasoning",
                    text: part.get("text")?.as_str().unwrap_or_default().to_string(),
                }),
                "tool" => {
                    let state = part.get("state")?;
                    let status: ToolState =
                        serde_json::from_value(state.get("status")?.clone()).ok()?;
                    Some(FeedEvent::Tool {
                        session_id,
                        call_id: part.get("callID")?.as_str()?.to_string(),
                        name: part
                            .get("tool")
                            .and_then(|v| v.as_str())
                            .unwrap_or("unknown")
                            .to_string(),
                        state: status,
                        input: state.get("input").cloned().unwrap_or(serde_json::Value::Null),
                        output: state
                            .get("output")
                            .and_then(|v| v.as_str())
                            .map(String::from),
                    })
                }
                _ => None,
            }
        }
        "session.idle" => Some(FeedEvent::Idle {
            session_id: props.get("sessionID")?.as_str()?.to_string(),
        }),
        "session.error" => Some(FeedEvent::Error {
            session_id: props
                .get("sessionID")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            message: props
                .get("error")
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown session error".to_string()),
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classifies_finalized_text_part() {
        let raw = json!({
            "type": "message.part.updated",
            "properties": {
                "part": {
                    "id": "prt_1",
                    "sessionID": "ses_1",
                    "type": "text",
                    "text": "The login endpoint lacks rate limiting."
                }
            }
        });
        match classify_event(&raw) {
            Some(FeedEvent::PartFinal {
                session_id,
                part_id,
                reasoning,
                text,
            }) => {
                assert_eq!(session_id, "ses_1");
                assert_eq!(part_id, "prt_1");
                assert!(!reasoning);
                assert!(text.contains("rate limiting"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn classifies_tool_states() {
        for (status, terminal) in [("running", false), ("completed", true), ("error", true)] {
            let raw = json!({
                "type": "message.part.updated",
                "properties": {
                    "part": {
                        "id": "prt_t",
                        "sessionID": "ses_1",
                        "type": "tool",
                        "callID": "call_9",
                        "tool": "read_file",
                        "state": {"status": status, "input": {"path": "x"}, "output": "data"}
                    }
                }
            });
            match classify_event(&raw) {
                Some(FeedEvent::Tool { call_id, state, .. }) => {
                    assert_eq!(call_id, "call_9");
                    assert_eq!(state.is_terminal(), terminal);
                }
                other => panic!("unexpected: {other:?}"),
            }
        }
    }

    #[test]
    fn delta_is_not_meaningful() {
        let raw = json!({
            "type": "message.part.delta",
            "properties": {"part": {"sessionID": "ses_1"}}
        });
        let event = classify_event(&raw).unwrap();
        assert!(!event.is_meaningful());
        assert_eq!(event.session_id(), "ses_1");
    }

    #[test]
    fn idle_and_unknown_events() {
        let idle = json!({"type": "session.idle", "properties": {"sessionID": "ses_2"}});
        assert!(matches!(
            classify_event(&idle),
            Some(FeedEvent::Idle { .. })
        ));

        let unknown = json!({"type": "server.heartbeat", "properties": {}});
        assert!(classify_event(&unknown).is_none());
    }
}

//! Asynchronous streaming-session harness.
//!
//! Creates a remote conversation session, subscribes to the global event
//! feed *before* submitting the task (events emitted at task start would
//! otherwise be lost), then consumes the feed with ID-keyed dedup until
//! the session ends, goes stale, or hits the wall-clock cap. Whatever
//! ends the feed, a reconciliation fetch re-applies the same dedup over
//! the full message list: providers sometimes emit output only as
//! streamed deltas without ever finalizing a part, and the fetch is the
//! only place that output can be recovered.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::StreamExt;
use serde_json::json;
use tokio::time::Instant;

use crate::config::ScanLimits;
use crate::harness::HarnessResult;
use crate::model::ActionType;
use crate::relay::{push_or_log, push_text_or_log, ActionRelay};
use crate::session::{FeedEvent, MessagePart, SessionControl, SessionLiveness, ToolState};

/// Why feed consumption stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
enum FeedEnd {
    Idle,
    SessionError(String),
    Stale,
    HardCap,
    FeedClosed,
}

/// Per-call relay state: one `tool_call` push, at most one terminal
/// `tool_result` push, across live feed and reconciliation.
#[derive(Default)]
struct CallSeen {
    pushed_call: bool,
    pushed_terminal: bool,
}

/// Dedup state for one session's lifetime.
#[derive(Default)]
struct DedupState {
    part_ids: HashSet<String>,
    calls: HashMap<String, CallSeen>,
}

/// The streaming harness.
pub struct StreamingHarness {
    control: Arc<dyn SessionControl>,
    model: String,
    subscribe_settle: std::time::Duration,
    limits: ScanLimits,
}

impl StreamingHarness {
    pub fn new(
        control: Arc<dyn SessionControl>,
        model: impl Into<String>,
        subscribe_settle: std::time::Duration,
        limits: ScanLimits,
    ) -> Self {
        Self {
            control,
            model: model.into(),
            subscribe_settle,
            limits,
        }
    }

    /// Run the streaming scan. Always ends in compiler handoff: the
    /// remote agent has no submit tool, so structure is reconstructed
    /// from the relayed trace.
    pub async fn run(
        &self,
        relay: &dyn ActionRelay,
        scan_id: &str,
        system: &str,
        task: &str,
    ) -> HarnessResult {
        let session_id = match self.control.create_session().await {
            Ok(id) => id,
            Err(e) => {
                return HarnessResult::NeedsCompilation {
                    reason: format!("failed to create streaming session: {e}"),
                };
            }
        };

        // Subscribe before submitting; the settle delay covers the gap
        // between the subscription request and the server actually
        // registering the consumer.
        let mut events = match self.control.subscribe_events().await {
            Ok(stream) => stream,
            Err(e) => {
                return HarnessResult::NeedsCompilation {
                    reason: format!("failed to subscribe to event feed: {e}"),
                };
            }
        };
        tokio::time::sleep(self.subscribe_settle).await;

        let submit = {
            let control = Arc::clone(&self.control);
            let session_id = session_id.clone();
            let model = self.model.clone();
            let system = system.to_string();
            let task = task.to_string();
            tokio::spawn(async move {
                if let Err(e) = control.submit_prompt(&session_id, &model, &system, &task).await {
                    tracing::warn!(session_id, error = %e, "prompt submission failed");
                }
            })
        };

        let mut dedup = DedupState::default();
        let deadline = Instant::now() + self.limits.wall_clock_cap;
        let mut last_activity = Instant::now();

        let end = loop {
            let stale_at = last_activity + self.limits.staleness_window;

            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => break FeedEnd::HardCap,
                _ = tokio::time::sleep_until(stale_at) => {
                    // Silence window elapsed: poll liveness before giving up.
                    match self.control.session_status(&session_id).await {
                        Ok(SessionLiveness::Dead) => break FeedEnd::Stale,
                        Ok(SessionLiveness::Active) => {
                            tracing::debug!(session_id, "stale but alive, extending watch");
                            last_activity = Instant::now();
                        }
                        Err(e) => {
                            tracing::warn!(session_id, error = %e, "liveness poll failed");
                            break FeedEnd::Stale;
                        }
                    }
                }
                event = events.next() => {
                    let Some(event) = event else { break FeedEnd::FeedClosed };
                    // Global feed: drop events for unrelated sessions.
                    if event.session_id() != session_id {
                        continue;
                    }
                    // Deltas prove liveness but are never relayed.
                    last_activity = Instant::now();
                    if !event.is_meaningful() {
                        continue;
                    }
                    match event {
                        FeedEvent::PartFinal { part_id, reasoning, text, .. } => {
                            self.relay_part(relay, scan_id, &mut dedup, &part_id, reasoning, &text).await;
                        }
                        FeedEvent::Tool { call_id, name, state, input, output, .. } => {
                            self.relay_tool(relay, scan_id, &mut dedup, &call_id, &name, state, &input, output.as_deref()).await;
                        }
                        FeedEvent::Idle { .. } => break FeedEnd::Idle,
                        FeedEvent::Error { message, .. } => break FeedEnd::SessionError(message),
                        FeedEvent::PartDelta { .. } => unreachable!("filtered above"),
                    }
                }
            }
        };

        drop(events);
        submit.abort();

        tracing::info!(scan_id, session_id, end = ?end, "event feed ended, reconciling");

        // Post-stream reconciliation: one fetch, same dedup. Recovers
        // parts that streamed as deltas but never finalized.
        match self.control.fetch_messages(&session_id).await {
            Ok(parts) => {
                for part in parts {
                    match part {
                        MessagePart::Text { part_id, reasoning, text } => {
                            self.relay_part(relay, scan_id, &mut dedup, &part_id, reasoning, &text)
                                .await;
                        }
                        MessagePart::Tool { call_id, name, state, input, output } => {
                            self.relay_tool(
                                relay, scan_id, &mut dedup, &call_id, &name, state, &input,
                                output.as_deref(),
                            )
                            .await;
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!(session_id, error = %e, "reconciliation fetch failed");
            }
        }

        let reason = match end {
            FeedEnd::Idle | FeedEnd::FeedClosed => {
                "streaming session finished without a structured submission".to_string()
            }
            FeedEnd::SessionError(message) => {
                format!("streaming session errored: {message}")
            }
            FeedEnd::Stale => "streaming session went stale".to_string(),
            FeedEnd::HardCap => "streaming session hit the wall-clock cap".to_string(),
        };
        HarnessResult::NeedsCompilation { reason }
    }

    /// Push a finalized part once, keyed by part id.
    async fn relay_part(
        &self,
        relay: &dyn ActionRelay,
        scan_id: &str,
        dedup: &mut DedupState,
        part_id: &str,
        reasoning: bool,
        text: &str,
    ) {
        if text.trim().is_empty() || !dedup.part_ids.insert(part_id.to_string()) {
            return;
        }
        let action_type = if reasoning {
            ActionType::Reasoning
        } else {
            ActionType::Observation
        };
        push_text_or_log(relay, scan_id, action_type, text.trim()).await;
    }

    /// Push a tool call once on first sighting and its result once on the
    /// first terminal sighting, keyed by call id.
    #[allow(clippy::too_many_arguments)]
    async fn relay_tool(
        &self,
        relay: &dyn ActionRelay,
        scan_id: &str,
        dedup: &mut DedupState,
        call_id: &str,
        name: &str,
        state: ToolState,
        input: &serde_json::Value,
        output: Option<&str>,
    ) {
        let seen = dedup.calls.entry(call_id.to_string()).or_default();

        if !seen.pushed_call {
            seen.pushed_call = true;
            push_or_log(
                relay,
                scan_id,
                ActionType::ToolCall,
                json!({
                    "call_id": call_id,
                    "tool": name,
                    "summary": format!("Running {name}"),
                    "input": input,
                }),
            )
            .await;
        }

        if state.is_terminal() && !seen.pushed_terminal {
            seen.pushed_terminal = true;
            let summary = match (state, output) {
                (ToolState::Error, Some(out)) => format!("{name} failed: {out}"),
                (ToolState::Error, None) => format!("{name} failed"),
                (_, Some(out)) => {
                    let preview: String = out.chars().take(400).collect();
                    format!("{name}: {preview}")
                }
                (_, None) => format!("{name} completed"),
            };
            push_or_log(
                relay,
                scan_id,
                ActionType::ToolResult,
                json!({
                    "call_id": call_id,
                    "tool": name,
                    "summary": summary,
                }),
            )
            .await;
        }
    }
}

//! Synchronous turn-loop harness.
//!
//! Drives a bounded sequence of request/response turns against a
//! tool-calling completion provider. Tool calls within a turn execute
//! strictly sequentially in array order, each fully relayed before the
//! next, so the trace stays a strict causal sequence that the compiler
//! and any live observer can replay without reordering.

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::ScanLimits;
use crate::error::{LlmError, ToolError};
use crate::harness::HarnessResult;
use crate::llm::{
    ChatMessage, CompletionProvider, CompletionRequest, ContentBlock, FinishReason,
};
use crate::model::ActionType;
use crate::relay::{push_text_or_log, ActionRelay};
use crate::tools::Dispatcher;

/// An optional auxiliary integration consulted before each turn, e.g. a
/// secondary search provider that contributes extra context. Dropped for
/// the rest of the session after repeated transient failure; never
/// re-enabled.
#[async_trait]
pub trait AuxAnalyzer: Send + Sync {
    fn name(&self) -> &str;

    /// Produce an extra context note for the next turn.
    async fn enrich(&self, conversation_tail: &str) -> Result<String, ToolError>;
}

/// The synchronous harness.
pub struct TurnLoopHarness {
    provider: Arc<dyn CompletionProvider>,
    dispatcher: Dispatcher,
    aux: Option<Arc<dyn AuxAnalyzer>>,
    limits: ScanLimits,
}

impl TurnLoopHarness {
    pub fn new(
        provider: Arc<dyn CompletionProvider>,
        dispatcher: Dispatcher,
        limits: ScanLimits,
    ) -> Self {
        Self {
            provider,
            dispatcher,
            aux: None,
            limits,
        }
    }

    pub fn with_aux(mut self, aux: Arc<dyn AuxAnalyzer>) -> Self {
        self.aux = Some(aux);
        self
    }

    /// Run the loop to termination.
    pub async fn run(
        &self,
        relay: &dyn ActionRelay,
        scan_id: &str,
        system: &str,
        task: &str,
    ) -> HarnessResult {
        let tools = self.dispatcher.definitions();
        let mut messages = vec![ChatMessage::user(task)];
        let mut aux_enabled = self.aux.is_some();

        for turn in 0..self.limits.max_turns {
            // Auxiliary enrichment first; transient failure drops it for
            // the rest of the session and the same turn retries without.
            if aux_enabled {
                if let Some(aux) = &self.aux {
                    match self.try_aux(aux.as_ref(), &messages).await {
                        Some(note) if !note.trim().is_empty() => {
                            messages.push(ChatMessage::user(note));
                        }
                        // An empty note contributes nothing this turn but
                        // keeps the integration enabled.
                        Some(_) => {}
                        None => {
                            tracing::warn!(
                                scan_id,
                                aux = aux.name(),
                                "auxiliary integration dropped for this session"
                            );
                            aux_enabled = false;
                        }
                    }
                }
            }

            let request = CompletionRequest::new(system, messages.clone())
                .with_tools(tools.clone())
                .with_max_tokens(4096);

            let response = match self.complete_with_retry(request).await {
                Ok(r) => r,
                Err(e) => {
                    tracing::error!(scan_id, turn, error = %e, "completion failed");
                    return HarnessResult::NeedsCompilation {
                        reason: format!("completion provider failed on turn {}: {e}", turn + 1),
                    };
                }
            };

            // Text blocks appear alongside tool uses; relay them first.
            for text in response.text_blocks() {
                push_text_or_log(relay, scan_id, ActionType::Reasoning, text).await;
            }

            let tool_uses = response.tool_uses();
            if tool_uses.is_empty() {
                if response.finish_reason == FinishReason::EndTurn {
                    return HarnessResult::NeedsCompilation {
                        reason: "agent finished without calling submit_findings".to_string(),
                    };
                }
                // Truncated or unknown stop with no tools: nudge once by
                // feeding the turn back as-is.
                messages.push(ChatMessage::assistant(response.content.clone()));
                messages.push(ChatMessage::user(
                    "Continue the audit. Call submit_findings when done.",
                ));
                continue;
            }

            messages.push(ChatMessage::assistant(response.content.clone()));

            // Sequential, in array order, each fully relayed before the next.
            let mut results = Vec::with_capacity(tool_uses.len());
            for call in &tool_uses {
                let execution = self.dispatcher.dispatch(relay, call).await;

                if let Some(submission) = execution.submission {
                    return HarnessResult::Submitted(submission);
                }

                results.push(ContentBlock::ToolResult {
                    tool_use_id: call.id.clone(),
                    content: execution.content,
                });
            }
            messages.push(ChatMessage::tool_results(results));
        }

        HarnessResult::NeedsCompilation {
            reason: format!(
                "agent did not submit a structured report within {} turns",
                self.limits.max_turns
            ),
        }
    }

    /// Attempt the auxiliary integration up to the failure cap. `None`
    /// means repeated transient failure and the integration must be
    /// dropped; a successful empty note is still `Some`.
    async fn try_aux(&self, aux: &dyn AuxAnalyzer, messages: &[ChatMessage]) -> Option<String> {
        let tail = conversation_tail(messages);
        for attempt in 1..=self.limits.aux_max_failures {
            match aux.enrich(&tail).await {
                Ok(note) => return Some(note),
                Err(e) => {
                    tracing::warn!(
                        aux = aux.name(),
                        attempt,
                        error = %e,
                        "auxiliary integration failed"
                    );
                }
            }
        }
        None
    }

    async fn complete_with_retry(
        &self,
        request: CompletionRequest,
    ) -> Result<crate::llm::CompletionResponse, LlmError> {
        let mut last_err = None;
        for attempt in 0..3 {
            if attempt > 0 {
                tokio::time::sleep(std::time::Duration::from_secs(2 << attempt)).await;
            }
            match self.provider.complete(request.clone()).await {
                Ok(r) => return Ok(r),
                Err(e @ (LlmError::RequestFailed { .. } | LlmError::RateLimited { .. })) => {
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or(LlmError::Session("retry loop exhausted".to_string())))
    }
}

/// Last stretch of user-visible text, as context for aux providers.
fn conversation_tail(messages: &[ChatMessage]) -> String {
    let mut tail = String::new();
    for message in messages.iter().rev() {
        for block in &message.content {
            if let ContentBlock::Text { text } = block {
                tail.insert_str(0, text);
                tail.insert(0, '\n');
            }
        }
        if tail.len() > 2_000 {
            break;
        }
    }
    tail.trim().to_string()
}

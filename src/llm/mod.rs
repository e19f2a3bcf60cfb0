//! Completion provider integration.
//!
//! The turn-loop harness drives a tool-calling messages API; the streaming
//! harness lives in [`crate::session`] and talks to a session control
//! plane instead.

mod anthropic;
mod provider;

pub use anthropic::AnthropicProvider;
pub use provider::{
    ChatMessage, CompletionProvider, CompletionRequest, CompletionResponse, ContentBlock,
    FinishReason, Role, ToolDefinition, ToolUse,
};

use std::sync::Arc;

use crate::config::LlmConfig;
use crate::error::LlmError;

/// Create the turn-loop completion provider for a configuration.
pub fn create_provider(config: &LlmConfig) -> Result<Arc<dyn CompletionProvider>, LlmError> {
    tracing::info!(model = %config.model, "using messages API provider");
    Ok(Arc::new(AnthropicProvider::new(config.clone())?))
}

//! Provider-neutral completion contract.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::LlmError;

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One block of message content. Tool results travel back to the model as
/// user-role blocks referencing the originating call id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
    },
}

/// One message in the conversation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl ChatMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    pub fn assistant(content: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::Assistant,
            content,
        }
    }

    /// Tool results for the next turn's input.
    pub fn tool_results(results: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::User,
            content: results,
        }
    }
}

/// A tool the model may call, described by JSON Schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// A tool invocation extracted from a response.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolUse {
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
}

/// Why the model stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// Final answer; no more tool calls expected.
    EndTurn,
    ToolUse,
    MaxTokens,
    Unknown,
}

/// A completion request: system prompt, history, and the tool schema set.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub system: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDefinition>,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
}

impl CompletionRequest {
    pub fn new(system: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            system: system.into(),
            messages,
            tools: Vec::new(),
            max_tokens: 4096,
            temperature: None,
        }
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

/// A completion response: text/reasoning blocks and zero or more tool-use
/// blocks, in model order.
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub content: Vec<ContentBlock>,
    pub finish_reason: FinishReason,
}

impl CompletionResponse {
    /// Free-text blocks, trimmed, empty ones dropped.
    pub fn text_blocks(&self) -> Vec<&str> {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => {
                    let trimmed = text.trim();
                    (!trimmed.is_empty()).then_some(trimmed)
                }
                _ => None,
            })
            .collect()
    }

    /// Tool invocations, in array order.
    pub fn tool_uses(&self) -> Vec<ToolUse> {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolUse { id, name, input } => Some(ToolUse {
                    id: id.clone(),
                    name: name.clone(),
                    input: input.clone(),
                }),
                _ => None,
            })
            .collect()
    }
}

/// Turn-based, tool-calling completion provider.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn complete(&self, req: CompletionRequest) -> Result<CompletionResponse, LlmError>;

    fn model_name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tool_uses_preserve_array_order() {
        let response = CompletionResponse {
            content: vec![
                ContentBlock::Text {
                    text: "Checking two files".to_string(),
                },
                ContentBlock::ToolUse {
                    id: "a".to_string(),
                    name: "read_file".to_string(),
                    input: json!({"path": "a.rs"}),
                },
                ContentBlock::ToolUse {
                    id: "b".to_string(),
                    name: "read_file".to_string(),
                    input: json!({"path": "b.rs"}),
                },
            ],
            finish_reason: FinishReason::ToolUse,
        };

        let uses = response.tool_uses();
        assert_eq!(uses.len(), 2);
        assert_eq!(uses[0].id, "a");
        assert_eq!(uses[1].id, "b");
    }

    #[test]
    fn text_blocks_skip_blank() {
        let response = CompletionResponse {
            content: vec![
                ContentBlock::Text {
                    text: "  ".to_string(),
                },
                ContentBlock::Text {
                    text: " found it ".to_string(),
                },
            ],
            finish_reason: FinishReason::EndTurn,
        };
        assert_eq!(response.text_blocks(), vec!["found it"]);
    }
}

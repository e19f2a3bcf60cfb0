//! Anthropic Messages API provider.

use async_trait::async_trait;
use reqwest::Client;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};

use crate::config::LlmConfig;
use crate::error::LlmError;
use crate::llm::provider::{
    ChatMessage, CompletionProvider, CompletionRequest, CompletionResponse, ContentBlock,
    FinishReason, Role,
};

const API_VERSION: &str = "2023-06-01";

/// Messages API client with tool-use support.
#[derive(Debug)]
pub struct AnthropicProvider {
    client: Client,
    config: LlmConfig,
}

impl AnthropicProvider {
    pub fn new(config: LlmConfig) -> Result<Self, LlmError> {
        if config.api_key.is_none() {
            return Err(LlmError::AuthFailed {
                provider: "anthropic".to_string(),
            });
        }

        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(300))
            .build()
            .unwrap_or_else(|_| Client::new());

        Ok(Self { client, config })
    }

    fn api_key(&self) -> String {
        self.config
            .api_key
            .as_ref()
            .map(|k| k.expose_secret().to_string())
            .unwrap_or_default()
    }
}

#[async_trait]
impl CompletionProvider for AnthropicProvider {
    async fn complete(&self, req: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let url = format!("{}/v1/messages", self.config.base_url);

        let body = MessagesRequest {
            model: self.config.model.clone(),
            max_tokens: req.max_tokens,
            system: Some(req.system),
            temperature: req.temperature,
            tools: req
                .tools
                .into_iter()
                .map(|t| WireTool {
                    name: t.name,
                    description: t.description,
                    input_schema: t.input_schema,
                })
                .collect(),
            messages: req.messages.iter().map(WireMessage::from).collect(),
        };

        tracing::debug!(model = %body.model, turns = body.messages.len(), "messages API request");

        let response = self
            .client
            .post(&url)
            .header("x-api-key", self.api_key())
            .header("anthropic-version", API_VERSION)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::RequestFailed {
                provider: "anthropic".to_string(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();

        if !status.is_success() {
            if status.as_u16() == 401 {
                return Err(LlmError::AuthFailed {
                    provider: "anthropic".to_string(),
                });
            }
            if status.as_u16() == 429 {
                return Err(LlmError::RateLimited {
                    provider: "anthropic".to_string(),
                });
            }
            return Err(LlmError::RequestFailed {
                provider: "anthropic".to_string(),
                reason: format!("HTTP {status}: {text}"),
            });
        }

        let parsed: MessagesResponse =
            serde_json::from_str(&text).map_err(|e| LlmError::InvalidResponse {
                provider: "anthropic".to_string(),
                reason: format!("JSON parse error: {e}"),
            })?;

        let content = parsed
            .content
            .into_iter()
            .map(|block| match block {
                WireBlock::Text { text } => ContentBlock::Text { text },
                WireBlock::ToolUse { id, name, input } => ContentBlock::ToolUse { id, name, input },
                WireBlock::ToolResult {
                    tool_use_id,
                    content,
                } => ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                },
            })
            .collect();

        let finish_reason = match parsed.stop_reason.as_deref() {
            Some("end_turn") => FinishReason::EndTurn,
            Some("tool_use") => FinishReason::ToolUse,
            Some("max_tokens") => FinishReason::MaxTokens,
            _ => FinishReason::Unknown,
        };

        Ok(CompletionResponse {
            content,
            finish_reason,
        })
    }

    fn model_name(&self) -> &str {
        &self.config.model
    }
}

// Wire types for the messages endpoint.

#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool>,
    messages: Vec<WireMessage>,
}

#[derive(Debug, Serialize)]
struct WireTool {
    name: String,
    description: String,
    input_schema: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: Vec<WireBlock>,
}

impl From<&ChatMessage> for WireMessage {
    fn from(msg: &ChatMessage) -> Self {
        let role = match msg.role {
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        let content = msg
            .content
            .iter()
            .map(|block| match block {
                ContentBlock::Text { text } => WireBlock::Text { text: text.clone() },
                ContentBlock::ToolUse { id, name, input } => WireBlock::ToolUse {
                    id: id.clone(),
                    name: name.clone(),
                    input: input.clone(),
                },
                ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                } => WireBlock::ToolResult {
                    tool_use_id: tool_use_id.clone(),
                    content: content.clone(),
                },
            })
            .collect();
        Self { role, content }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireBlock {
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

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<WireBlock>,
    stop_reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rejects_missing_api_key() {
        let err = AnthropicProvider::new(LlmConfig::default()).unwrap_err();
        assert!(matches!(err, LlmError::AuthFailed { .. }));
    }

    #[test]
    fn wire_message_roundtrip() {
        let msg = ChatMessage::assistant(vec![
            ContentBlock::Text {
                text: "Looking at the login handler".to_string(),
            },
            ContentBlock::ToolUse {
                id: "toolu_1".to_string(),
                name: "read_file".to_string(),
                input: json!({"path": "app/login.py"}),
            },
        ]);
        let wire = WireMessage::from(&msg);
        assert_eq!(wire.role, "assistant");

        let serialized = serde_json::to_value(&wire).unwrap();
        assert_eq!(serialized["content"][1]["type"], "tool_use");
        assert_eq!(serialized["content"][1]["name"], "read_file");
    }

    #[test]
    fn response_block_parsing() {
        let raw = json!({
            "content": [
                {"type": "text", "text": "Found a flaw"},
                {"type": "tool_use", "id": "t1", "name": "search_code", "input": {"pattern": "eval("}}
            ],
            "stop_reason": "tool_use"
        });
        let parsed: MessagesResponse = serde_json::from_value(raw).unwrap();
        assert_eq!(parsed.content.len(), 2);
        assert_eq!(parsed.stop_reason.as_deref(), Some("tool_use"));
    }
}

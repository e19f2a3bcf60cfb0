//! HTTP/SSE client for an OpenCode-style session server.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::config::SessionApiConfig;
use crate::error::LlmError;
use crate::session::{
    classify_event, FeedEvent, MessagePart, SessionControl, SessionLiveness, ToolState,
};

/// Client for the session control plane.
pub struct OpenCodeClient {
    client: Client,
    config: SessionApiConfig,
}

impl OpenCodeClient {
    pub fn new(config: SessionApiConfig) -> Self {
        let client = Client::builder()
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { client, config }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url, path.trim_start_matches('/'))
    }

    fn request_error(e: reqwest::Error) -> LlmError {
        LlmError::RequestFailed {
            provider: "opencode".to_string(),
            reason: e.to_string(),
        }
    }
}

/// Incremental SSE frame parser: feed raw bytes, pull out `data:` payloads
/// as complete frames arrive.
pub(crate) struct SseParser {
    buffer: String,
}

impl SseParser {
    pub(crate) fn new() -> Self {
        Self {
            buffer: String::new(),
        }
    }

    /// Earliest frame boundary in the buffer. Servers may terminate
    /// frames with either LF or CRLF blank lines.
    fn boundary(&self) -> Option<(usize, usize)> {
        let lf = self.buffer.find("\n\n").map(|i| (i, 2));
        let crlf = self.buffer.find("\r\n\r\n").map(|i| (i, 4));
        match (lf, crlf) {
            (Some(a), Some(b)) => Some(if b.0 < a.0 { b } else { a }),
            (a, b) => a.or(b),
        }
    }

    /// Append a chunk and return the data payloads of any completed frames.
    pub(crate) fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));

        let mut frames = Vec::new();
        while let Some((end, width)) = self.boundary() {
            let frame: String = self.buffer.drain(..end + width).collect();
            let mut data = String::new();
            for line in frame.lines() {
                if let Some(rest) = line.strip_prefix("data:") {
                    if !data.is_empty() {
                        data.push('\n');
                    }
                    data.push_str(rest.trim_start());
                }
            }
            if !data.is_empty() {
                frames.push(data);
            }
        }
        frames
    }
}

#[async_trait]
impl SessionControl for OpenCodeClient {
    async fn create_session(&self) -> Result<String, LlmError> {
        #[derive(Deserialize)]
        struct CreateResponse {
            id: String,
        }

        let resp: CreateResponse = self
            .client
            .post(self.url("session"))
            .json(&json!({}))
            .send()
            .await
            .map_err(Self::request_error)?
            .error_for_status()
            .map_err(Self::request_error)?
            .json()
            .await
            .map_err(Self::request_error)?;

        tracing::info!(session_id = %resp.id, "created remote session");
        Ok(resp.id)
    }

    async fn submit_prompt(
        &self,
        session_id: &str,
        model: &str,
        system: &str,
        user_text: &str,
    ) -> Result<(), LlmError> {
        // Blocks until the server finishes generating; callers run this
        // concurrently with feed consumption.
        let body = json!({
            "model": model,
            "system": system,
            "parts": [{ "type": "text", "text": user_text }],
        });

        self.client
            .post(self.url(&format!("session/{session_id}/message")))
            .json(&body)
            .send()
            .await
            .map_err(Self::request_error)?
            .error_for_status()
            .map_err(Self::request_error)?;
        Ok(())
    }

    async fn subscribe_events(&self) -> Result<BoxStream<'static, FeedEvent>, LlmError> {
        let response = self
            .client
            .get(self.url("event"))
            .header("Accept", "text/event-stream")
            .send()
            .await
            .map_err(Self::request_error)?
            .error_for_status()
            .map_err(Self::request_error)?;

        let (tx, rx) = mpsc::channel::<FeedEvent>(256);

        tokio::spawn(async move {
            let mut bytes = response.bytes_stream();
            let mut parser = SseParser::new();

            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        tracing::warn!(error = %e, "event feed read failed");
                        break;
                    }
                };
                for data in parser.feed(&chunk) {
                    let Ok(raw) = serde_json::from_str::<serde_json::Value>(&data) else {
                        continue;
                    };
                    if let Some(event) = classify_event(&raw) {
                        // Receiver dropped means the harness is done.
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        Ok(ReceiverStream::new(rx).boxed())
    }

    async fn fetch_messages(&self, session_id: &str) -> Result<Vec<MessagePart>, LlmError> {
        #[derive(Deserialize)]
        struct WireMessage {
            #[serde(default)]
            parts: Vec<serde_json::Value>,
        }

        let messages: Vec<WireMessage> = self
            .client
            .get(self.url(&format!("session/{session_id}/message")))
            .send()
            .await
            .map_err(Self::request_error)?
            .error_for_status()
            .map_err(Self::request_error)?
            .json()
            .await
            .map_err(Self::request_error)?;

        let mut parts = Vec::new();
        for message in messages {
            for part in message.parts {
                match part.get("type").and_then(|v| v.as_str()) {
                    Some("text") | Some("reasoning") => {
                        let Some(id) = part.get("id").and_then(|v| v.as_str()) else {
                            continue;
                        };
                        parts.push(MessagePart::Text {
                            part_id: id.to_string(),
                            reasoning: part["type"] == "reasoning",
                            text: part
                                .get("text")
                                .and_then(|v| v.as_str())
                                .unwrap_or_default()
                                .to_string(),
                        });
                    }
                    Some("tool") => {
                        let Some(call_id) = part.get("callID").and_then(|v| v.as_str()) else {
                            continue;
                        };
                        let state = part.get("state").cloned().unwrap_or_default();
                        let status: ToolState = state
                            .get("status")
                            .and_then(|s| serde_json::from_value(s.clone()).ok())
                            .unwrap_or(ToolState::Completed);
                        parts.push(MessagePart::Tool {
                            call_id: call_id.to_string(),
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
                        });
                    }
                    _ => {}
                }
            }
        }
        Ok(parts)
    }

    async fn session_status(&self, session_id: &str) -> Result<SessionLiveness, LlmError> {
        let response = self
            .client
            .get(self.url(&format!("session/{session_id}")))
            .send()
            .await
            .map_err(Self::request_error)?;

        if response.status().as_u16() == 404 {
            return Ok(SessionLiveness::Dead);
        }
        let body: serde_json::Value = response
            .error_for_status()
            .map_err(Self::request_error)?
            .json()
            .await
            .map_err(Self::request_error)?;

        // A session that reports an aborted/errored state is dead for our
        // purposes even though the record still exists.
        let dead = body
            .get("state")
            .and_then(|v| v.as_str())
            .map(|s| s == "error" || s == "aborted")
            .unwrap_or(false);

        Ok(if dead {
            SessionLiveness::Dead
        } else {
            SessionLiveness::Active
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_parser_handles_split_frames() {
        let mut parser = SseParser::new();
        assert!(parser.feed(b"data: {\"a\":").is_empty());
        let frames = parser.feed(b" 1}\n\n");
        assert_eq!(frames, vec!["{\"a\": 1}".to_string()]);
    }

    #[test]
    fn sse_parser_handles_multiple_frames_per_chunk() {
        let mut parser = SseParser::new();
        let frames = parser.feed(b"data: one\n\ndata: two\n\n");
        assert_eq!(frames, vec!["one".to_string(), "two".to_string()]);
    }

    #[test]
    fn sse_parser_joins_multiline_data() {
        let mut parser = SseParser::new();
        let frames = parser.feed(b"data: first\ndata: second\n\n");
        assert_eq!(frames, vec!["first\nsecond".to_string()]);
    }

    #[test]
    fn sse_parser_handles_crlf_frames() {
        let mut parser = SseParser::new();
        assert!(parser.feed(b"data: {\"a\": 1}\r").is_empty());
        let frames = parser.feed(b"\n\r\ndata: two\n\n");
        assert_eq!(frames, vec!["{\"a\": 1}".to_string(), "two".to_string()]);
    }

    #[test]
    fn sse_parser_skips_comment_frames() {
        let mut parser = SseParser::new();
        let frames = parser.feed(b": keep-alive\n\ndata: real\n\n");
        assert_eq!(frames, vec!["real".to_string()]);
    }
}

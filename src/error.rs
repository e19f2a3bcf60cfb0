//! Error types for the scan engine.
//!
//! Each concern gets its own enum; nothing here crosses the top-level scan
//! entrypoint uncaught. User-visible failure is always a short string
//! attached to the scan session, never a raw error chain.

use std::time::Duration;

use thiserror::Error;

/// Errors from the durable action relay / report store.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Relay request failed: {reason}")]
    RequestFailed { reason: String },

    #[error("Relay rejected the call: HTTP {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("Invalid relay response: {0}")]
    InvalidResponse(String),

    #[error("Scan {0} not found")]
    ScanNotFound(String),
}

/// Errors from completion providers (turn-based and streaming).
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("Request to {provider} failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Rate limited by {provider}")]
    RateLimited { provider: String },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Streaming session error: {0}")]
    Session(String),
}

/// Errors from tool execution.
///
/// Most tool failures are not fatal: the dispatcher converts them into an
/// error-string `tool_result` so the loop can continue.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("External service error: {0}")]
    ExternalService(String),
}

impl From<std::io::Error> for ToolError {
    fn from(err: std::io::Error) -> Self {
        ToolError::ExecutionFailed(err.to_string())
    }
}

/// Errors from the report compiler.
///
/// Compiler failure is the one terminal failure path in the pipeline.
#[derive(Debug, Error)]
pub enum CompilerError {
    #[error("Trace is empty; nothing to compile")]
    EmptyTrace,

    #[error("Completion provider error: {0}")]
    Llm(#[from] LlmError),

    #[error("Compiler produced no structured findings: {0}")]
    Unstructured(String),

    #[error("Report submission failed: {0}")]
    Submit(#[from] RelayError),
}

/// Top-level scan errors. These become the session's error string.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("Report compilation failed: {0}")]
    Compiler(#[from] CompilerError),

    #[error("Completion provider failed: {0}")]
    Llm(#[from] LlmError),

    #[error("Durable store error: {0}")]
    Relay(#[from] RelayError),

    #[error("No snapshot at {0}")]
    MissingSnapshot(String),
}

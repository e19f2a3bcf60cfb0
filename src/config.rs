//! Engine configuration, loaded from environment variables.
//!
//! One `Config` is constructed per scan and threaded through every
//! component; there are no module-level singleton clients.

use std::time::Duration;

use secrecy::SecretString;

use crate::model::HarnessKind;

/// Completion provider configuration (turn-loop harness).
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// Base URL for the messages API.
    pub base_url: String,
    /// Model identifier, e.g. `claude-opus-4`.
    pub model: String,
    /// API key. Absent only in tests that never hit the network.
    pub api_key: Option<SecretString>,
    pub max_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.anthropic.com".to_string(),
            model: "claude-opus-4".to_string(),
            api_key: None,
            max_tokens: 4096,
        }
    }
}

/// Durable store (action relay / reports / prompts) configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Base URL of the store's HTTP API.
    pub base_url: String,
    /// Deploy key sent as `Authorization: Convex <key>`.
    pub deploy_key: Option<SecretString>,
    /// Per-call request timeout.
    pub timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            deploy_key: None,
            timeout: Duration::from_secs(15),
        }
    }
}

/// Session control plane configuration (streaming harness).
#[derive(Debug, Clone)]
pub struct SessionApiConfig {
    /// Base URL of the session server.
    pub base_url: String,
    /// Delay between subscribing to the event feed and submitting the
    /// prompt, so no event emitted at task start is lost.
    pub subscribe_settle: Duration,
}

impl Default for SessionApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:4096".to_string(),
            subscribe_settle: Duration::from_millis(500),
        }
    }
}

/// Browser automation bridge configuration.
#[derive(Debug, Clone, Default)]
pub struct BrowserConfig {
    /// Base URL of the bridge; empty disables browser tools.
    pub bridge_url: String,
}

/// Caps and timeouts for a single scan. Overridable so tests do not wait
/// out wall-clock windows.
#[derive(Debug, Clone)]
pub struct ScanLimits {
    /// Maximum request/response turns in the turn-loop harness.
    pub max_turns: u32,
    /// Silence window before the streaming harness polls session liveness.
    pub staleness_window: Duration,
    /// Hard wall-clock cap on a streaming session.
    pub wall_clock_cap: Duration,
    /// Interval between human-gate polls.
    pub gate_poll_interval: Duration,
    /// Total time the human gate waits before returning the placeholder.
    pub gate_timeout: Duration,
    /// Attempts before an optional auxiliary integration is dropped.
    pub aux_max_failures: u32,
}

impl Default for ScanLimits {
    fn default() -> Self {
        Self {
            max_turns: 20,
            staleness_window: Duration::from_secs(5 * 60),
            wall_clock_cap: Duration::from_secs(45 * 60),
            gate_poll_interval: Duration::from_secs(3),
            gate_timeout: Duration::from_secs(10 * 60),
            aux_max_failures: 3,
        }
    }
}

/// Full engine configuration for one scan.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub llm: LlmConfig,
    pub relay: RelayConfig,
    pub session_api: SessionApiConfig,
    pub browser: BrowserConfig,
    pub limits: ScanLimits,
}

impl Config {
    /// Load configuration from the environment. `.env` is honored when
    /// present; missing optional values fall back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("REZERO_LLM_BASE_URL") {
            config.llm.base_url = url;
        }
        if let Ok(model) = std::env::var("REZERO_MODEL") {
            config.llm.model = model;
        }
        if let Ok(key) = std::env::var("ANTHROPIC_API_KEY") {
            config.llm.api_key = Some(SecretString::from(key));
        }
        if let Ok(url) = std::env::var("REZERO_RELAY_URL") {
            config.relay.base_url = url;
        }
        if let Ok(key) = std::env::var("REZERO_RELAY_DEPLOY_KEY") {
            config.relay.deploy_key = Some(SecretString::from(key));
        }
        if let Ok(url) = std::env::var("REZERO_SESSION_API_URL") {
            config.session_api.base_url = url;
        }
        if let Ok(url) = std::env::var("REZERO_BROWSER_BRIDGE_URL") {
            config.browser.bridge_url = url;
        }

        config
    }

    /// Pick the harness for a model identifier.
    ///
    /// Models served through the session control plane (RL-tuned models
    /// behind an OpenCode-style server) run the streaming harness; direct
    /// messages-API models run the turn loop.
    pub fn harness_for_model(&self, model: &str) -> HarnessKind {
        if model.starts_with("opencode/") || model.starts_with("rl/") {
            HarnessKind::Streaming
        } else {
            HarnessKind::TurnLoop
        }
    }
}

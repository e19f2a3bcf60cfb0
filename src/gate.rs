//! Human-Input Gate: suspends a turn pending an external operator answer.
//!
//! The gate never hangs a scan. If nobody answers within the timeout it
//! returns a fixed placeholder so the loop can proceed.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::Instant;

use crate::model::{ActionType, PromptStatus};
use crate::relay::{push_or_log, ActionRelay, GateStore};

/// Returned when the operator does not answer in time.
pub const TIMEOUT_PLACEHOLDER: &str =
    "No human response was received in time. Proceed with your best judgment.";

/// The gate, bound to a prompt store.
pub struct HumanGate {
    store: Arc<dyn GateStore>,
    poll_interval: Duration,
    timeout: Duration,
}

impl HumanGate {
    pub fn new(store: Arc<dyn GateStore>, poll_interval: Duration, timeout: Duration) -> Self {
        Self {
            store,
            poll_interval,
            timeout,
        }
    }

    /// Ask the operator a question and wait for the answer.
    ///
    /// Creates a pending prompt, pushes a `human_input_request` action so
    /// an observer can answer, then polls until answered or the timeout
    /// boundary. Failures to reach the store resolve to the placeholder
    /// rather than blocking the scan.
    pub async fn ask(&self, relay: &dyn ActionRelay, scan_id: &str, question: &str) -> String {
        let prompt_id = match self.store.create_prompt(scan_id, question).await {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(scan_id, error = %e, "failed to create human prompt");
                return TIMEOUT_PLACEHOLDER.to_string();
            }
        };

        push_or_log(
            relay,
            scan_id,
            ActionType::HumanInputRequest,
            json!({ "prompt_id": prompt_id, "question": question }),
        )
        .await;

        let deadline = Instant::now() + self.timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                tracing::info!(scan_id, prompt_id, "human gate timed out");
                return TIMEOUT_PLACEHOLDER.to_string();
            }
            let wait = self.poll_interval.min(deadline - now);
            tokio::time::sleep(wait).await;

            match self.store.get_prompt(&prompt_id).await {
                Ok(prompt) if prompt.status == PromptStatus::Answered => {
                    return prompt
                        .response
                        .unwrap_or_else(|| TIMEOUT_PLACEHOLDER.to_string());
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(prompt_id, error = %e, "prompt poll failed, continuing");
                }
            }
        }
    }
}

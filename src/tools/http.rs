//! Direct HTTP probing, bypassing any browser context.
//!
//! Used for backend/API probing against live web targets. The response
//! body is capped before it reaches the model.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::Client;

use crate::error::ToolError;

/// Cap on probe response bodies.
pub const PROBE_BODY_MAX_CHARS: usize = 20_000;

const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// A single probe result.
#[derive(Debug)]
pub struct ProbeResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: String,
}

/// HTTP probe executor.
pub struct HttpProbe {
    client: Client,
}

impl HttpProbe {
    pub fn new() -> Self {
        let client = Client::builder()
            .timeout(PROBE_TIMEOUT)
            .danger_accept_invalid_certs(false)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { client }
    }

    pub async fn execute(
        &self,
        method: &str,
        url: &str,
        headers: &HashMap<String, String>,
        body: Option<&str>,
    ) -> Result<ProbeResponse, ToolError> {
        let parsed = reqwest::Url::parse(url)
            .map_err(|e| ToolError::InvalidParameters(format!("invalid URL: {e}")))?;

        let mut request = match method.to_uppercase().as_str() {
            "GET" => self.client.get(parsed),
            "POST" => self.client.post(parsed),
            "PUT" => self.client.put(parsed),
            "DELETE" => self.client.delete(parsed),
            "PATCH" => self.client.patch(parsed),
            "HEAD" => self.client.head(parsed),
            other => {
                return Err(ToolError::InvalidParameters(format!(
                    "unsupported method: {other}"
                )));
            }
        };

        for (key, value) in headers {
            request = request.header(key, value);
        }
        if let Some(body) = body {
            request = request.body(body.to_string());
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ToolError::Timeout(PROBE_TIMEOUT)
            } else {
                ToolError::ExternalService(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
            .collect();

        let body_text = response
            .text()
            .await
            .map_err(|e| ToolError::ExternalService(format!("failed to read body: {e}")))?;

        Ok(ProbeResponse {
            status,
            headers,
            body: body_text.chars().take(PROBE_BODY_MAX_CHARS).collect(),
        })
    }
}

impl Default for HttpProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_bad_url() {
        let probe = HttpProbe::new();
        let err = probe
            .execute("GET", "not a url", &HashMap::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidParameters(_)));
    }

    #[tokio::test]
    async fn rejects_unknown_method() {
        let probe = HttpProbe::new();
        let err = probe
            .execute("BREW", "https://example.com", &HashMap::new(), None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unsupported method"));
    }
}

use std::time::Duration;
use tracing::debug;

use crate::error::{EngineError, EngineResult};

pub const DEFAULT_INFERENCE_ENDPOINT: &str = "http://localhost:11434/api/generate";

/// Hands a JSON prompt to a local Ollama server and returns its raw answer.
pub struct OllamaForwarder {
    client: reqwest::Client,
    endpoint: String,
}

impl OllamaForwarder {
    pub fn new(endpoint: impl Into<String>, request_timeout: Duration) -> EngineResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|error| EngineError::Config(format!("failed to build http client: {error}")))?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub async fn forward(&self, request_body: &str) -> EngineResult<String> {
        serde_json::from_str::<serde_json::Value>(request_body)
            .map_err(|error| EngineError::InvalidInput(format!("prompt is not JSON: {error}")))?;

        debug!("forwarding {} bytes to {}", request_body.len(), self.endpoint);
        let response = self
            .client
            .post(&self.endpoint)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(request_body.to_string())
            .send()
            .await
            .map_err(|error| self.failure(format!("request failed: {error}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|error| self.failure(format!("failed to read response: {error}")))?;

        if !status.is_success() {
            return Err(self.failure(format!("{status}: {}", body.trim())));
        }
        Ok(body)
    }

    fn failure(&self, message: String) -> EngineError {
        EngineError::upstream(&self.endpoint, message)
    }
}

//! Ollama Executor
//!
//! Runs payloads against an Ollama server through its non-streaming
//! generate endpoint.
//!
//! # Ollama API
//!
//! - `POST {endpoint}/api/generate` with `{"model", "prompt", "stream": false}`
//! - The response carries `response`, `prompt_eval_count` and `eval_count`
//!
//! Object payloads may carry `system` and `options`, which are passed through.

use std::time::Duration;

use async_trait::async_trait;

use super::traits::{prompt_text, ExecutionError, ExecutionOutput, Executor, Payload};
use crate::routing::BackendDefinition;

/// Default request timeout
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Executor for backends served by Ollama
#[derive(Clone, Debug)]
pub struct OllamaExecutor {
    http_client: reqwest::Client,
    fallback_endpoint: Option<String>,
}

impl OllamaExecutor {
    /// Create an executor with the default HTTP timeout
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new() -> Result<Self, ExecutionError> {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    /// Create an executor with a custom HTTP timeout
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn with_timeout(timeout: Duration) -> Result<Self, ExecutionError> {
        let http_client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http_client,
            fallback_endpoint: None,
        })
    }

    /// Endpoint used for backends that do not configure one
    #[must_use]
    pub fn with_fallback_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.fallback_endpoint = Some(endpoint.into());
        self
    }

    /// Generate endpoint URL for a backend
    fn generate_url(&self, backend: &BackendDefinition) -> Result<String, ExecutionError> {
        let base = backend
            .endpoint
            .as_deref()
            .or(self.fallback_endpoint.as_deref())
            .ok_or_else(|| ExecutionError::MissingEndpoint(backend.id.clone()))?;
        Ok(format!("{}/api/generate", base.trim_end_matches('/')))
    }
}

/// Build the generate request body
fn build_request(backend: &BackendDefinition, payload: &Payload) -> serde_json::Value {
    let mut body = serde_json::json!({
        "model": backend.model_name(),
        "prompt": prompt_text(payload),
        "stream": false,
    });

    for key in ["system", "options"] {
        if let Some(value) = payload.get(key) {
            body[key] = value.clone();
        }
    }
    body
}

/// Extract the output and token counts from a generate response
fn parse_generate_response(data: &serde_json::Value) -> Result<ExecutionOutput, ExecutionError> {
    if let Some(error) = data.get("error").and_then(|e| e.as_str()) {
        return Err(ExecutionError::Backend(error.to_string()));
    }

    let content = data
        .get("response")
        .and_then(|r| r.as_str())
        .ok_or_else(|| ExecutionError::Backend("response missing 'response' field".to_string()))?;

    let input_tokens = data
        .get("prompt_eval_count")
        .and_then(serde_json::Value::as_u64)
        .unwrap_or(0);
    let output_tokens = data
        .get("eval_count")
        .and_then(serde_json::Value::as_u64)
        .unwrap_or(0);

    Ok(ExecutionOutput::new(
        serde_json::Value::String(content.to_string()),
        input_tokens,
        output_tokens,
    ))
}

#[async_trait]
impl Executor for OllamaExecutor {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn execute(
        &self,
        backend: &BackendDefinition,
        payload: &Payload,
    ) -> Result<ExecutionOutput, ExecutionError> {
        let url = self.generate_url(backend)?;
        let body = build_request(backend, payload);

        tracing::debug!(backend = %backend.id, url = %url, "Sending generate request");

        let response = self.http_client.post(&url).json(&body).send().await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ExecutionError::Status { status, body });
        }

        let data: serde_json::Value = response.json().await?;
        parse_generate_response(&data)
    }
}

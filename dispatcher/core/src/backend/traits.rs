//! Execution Traits
//!
//! The dispatcher never performs inference itself. A worker hands the
//! resolved [`BackendDefinition`] and the opaque request payload to an
//! [`Executor`], which talks to the actual model and reports token usage.
//!
//! # Design Philosophy
//!
//! The Executor trait is the single seam between routing and providers:
//! - The worker decides *when* a backend runs
//! - The executor decides *how* a payload reaches it
//!
//! Implementations handle provider-specific details (API formats, auth, etc.)

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::routing::BackendDefinition;

/// Opaque request body
pub type Payload = serde_json::Value;

/// Result of a successful execution
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutput {
    /// Output produced by the backend
    pub output: serde_json::Value,
    /// Tokens consumed by the input
    pub input_tokens: u64,
    /// Tokens produced as output
    pub output_tokens: u64,
}

impl ExecutionOutput {
    /// Create an output with token counts
    pub fn new(output: serde_json::Value, input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            output,
            input_tokens,
            output_tokens,
        }
    }

    /// Input plus output tokens
    #[must_use]
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}

/// Execution failures
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// The backend has no endpoint configured
    #[error("backend '{0}' has no endpoint configured")]
    MissingEndpoint(String),

    /// The payload cannot be sent to this backend
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// Transport failure
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Backend answered with a non-success status
    #[error("backend returned {status}: {body}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Response body
        body: String,
    },

    /// Anything else the provider reported
    #[error("{0}")]
    Backend(String),
}

/// Executes a payload on a backend
///
/// Implement this trait to add support for different model providers.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Executor name for logs (e.g., "ollama", "echo")
    fn name(&self) -> &str;

    /// Run the payload on the backend and report token usage
    async fn execute(
        &self,
        backend: &BackendDefinition,
        payload: &Payload,
    ) -> Result<ExecutionOutput, ExecutionError>;
}

/// Text a payload carries, for providers that take a plain prompt
///
/// Strings are used as-is; objects contribute their `prompt` field and fall
/// back to their JSON rendering.
#[must_use]
pub fn prompt_text(payload: &Payload) -> String {
    match payload {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Object(map) => match map.get("prompt") {
            Some(serde_json::Value::String(prompt)) => prompt.clone(),
            _ => payload.to_string(),
        },
        other => other.to_string(),
    }
}

/// Rough token count used when a caller supplies no estimate
///
/// Roughly four characters per token, plus the requested output budget
/// (`max_tokens` on an object payload) when present.
#[must_use]
pub fn estimate_tokens(payload: &Payload) -> u64 {
    let chars = prompt_text(payload).chars().count() as u64;
    let input = chars.div_ceil(4);
    let output = payload
        .get("max_tokens")
        .and_then(serde_json::Value::as_u64)
        .unwrap_or(0);
    input.saturating_add(output)
}

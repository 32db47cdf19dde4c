//! Echo executor
//!
//! Deterministic executor that returns the payload unchanged. Used for dry
//! runs of the daemon and as a stand-in backend in tests.

use std::time::Duration;

use async_trait::async_trait;

use super::traits::{prompt_text, ExecutionError, ExecutionOutput, Executor, Payload};
use crate::routing::BackendDefinition;

/// Echoes payloads back, counting whitespace-separated words as tokens
#[derive(Clone, Debug, Default)]
pub struct EchoExecutor {
    latency: Option<Duration>,
}

impl EchoExecutor {
    /// Create an echo executor with no latency
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long before answering
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = (!latency.is_zero()).then_some(latency);
        self
    }
}

fn word_count(text: &str) -> u64 {
    text.split_whitespace().count() as u64
}

#[async_trait]
impl Executor for EchoExecutor {
    fn name(&self) -> &str {
        "echo"
    }

    async fn execute(
        &self,
        backend: &BackendDefinition,
        payload: &Payload,
    ) -> Result<ExecutionOutput, ExecutionError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let text = prompt_text(payload);
        let tokens = word_count(&text);
        let output = serde_json::json!({
            "backend": backend.id,
            "model": backend.model_name(),
            "echo": text,
        });

        Ok(ExecutionOutput::new(output, tokens, tokens))
    }
}

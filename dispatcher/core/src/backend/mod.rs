//! Backend Execution
//!
//! Adapters that actually run a dispatched payload on a model.
//!
//! # Available Executors
//!
//! - **Ollama**: Local or remote Ollama server, via `/api/generate`
//! - **Echo**: Deterministic stand-in for dry runs and tests
//!
//! # Usage
//!
//! ```ignore
//! use dispatcher_core::backend::{EchoExecutor, Executor};
//!
//! let executor = EchoExecutor::new();
//! let output = executor.execute(&definition, &payload).await?;
//! ```

mod echo;
mod ollama;
mod traits;

pub use echo::EchoExecutor;
pub use ollama::OllamaExecutor;
pub use traits::{
    estimate_tokens, prompt_text, ExecutionError, ExecutionOutput, Executor, Payload,
};

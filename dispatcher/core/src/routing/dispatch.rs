//! Dispatch Queue & Worker
//!
//! Requests are accepted synchronously, queued in submission order, and
//! executed by sequential lanes.
//!
//! # Lanes
//!
//! ```text
//!                        ┌─────────────────────────────────────┐
//!  submit() ──mpsc──>    │ single:      one lane, global FIFO  │
//!                        │ per_backend: forwarder ──> lane[a]  │
//!                        │                        ──> lane[b]  │
//!                        └─────────────────────────────────────┘
//! ```
//!
//! Every lane processes one request at a time:
//!
//! 1. Re-resolve the backend against the current registry snapshot
//! 2. Mark it busy and count the request
//! 3. Execute (in its own task, optionally under a timeout)
//! 4. Charge tokens and append a history record
//! 5. Mark it ready and invoke the completion handler exactly once

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::ledger::{summarize, HistoryRecord, UsageLedger};
use super::policy::{SelectionCriteria, SelectionReason};
use super::registry::{BackendDefinition, ModelRegistry};
use crate::backend::{ExecutionOutput, Executor, Payload};

// ============================================================================
// Request Identity
// ============================================================================

/// Unique request identifier
///
/// Built from the submission time, a CRC32 fingerprint of the payload, and
/// a process-local sequence number.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Generate a new request ID
    #[must_use]
    pub fn generate(payload: &Payload, submitted_at: DateTime<Utc>) -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let count = COUNTER.fetch_add(1, Ordering::SeqCst);
        let fingerprint = crc32fast::hash(payload.to_string().as_bytes());

        Self(format!(
            "req_{}_{fingerprint:08x}_{count}",
            submitted_at.timestamp_millis()
        ))
    }

    /// Get the string value
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Submission
// ============================================================================

/// Lifecycle state reported for a request
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStatus {
    /// Queued, not yet finished
    Pending,
    /// Executed successfully
    Completed,
    /// Finished with an error
    Failed,
}

/// A request as submitted by a caller
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SubmitRequest {
    /// Selection requirements
    #[serde(flatten)]
    pub criteria: SelectionCriteria,

    /// Opaque body handed to the executor
    #[serde(default)]
    pub payload: Payload,

    /// Skip selection and use this backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_id: Option<String>,
}

impl SubmitRequest {
    /// Request with a payload and no requirements
    pub fn new(payload: Payload) -> Self {
        Self {
            payload,
            ..Default::default()
        }
    }

    /// Require capabilities
    #[must_use]
    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.criteria.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    /// Set the token estimate
    #[must_use]
    pub fn with_token_estimate(mut self, tokens: u64) -> Self {
        self.criteria.token_estimate = Some(tokens);
        self
    }

    /// Set the caller
    #[must_use]
    pub fn with_caller(mut self, caller_id: impl Into<String>) -> Self {
        self.criteria.caller_id = Some(caller_id.into());
        self
    }

    /// Set the cost tier
    #[must_use]
    pub fn with_cost_tier(mut self, tier: impl Into<String>) -> Self {
        self.criteria.cost_tier = Some(tier.into());
        self
    }

    /// Pin to a backend, bypassing selection
    #[must_use]
    pub fn pinned_to(mut self, backend_id: impl Into<String>) -> Self {
        self.backend_id = Some(backend_id.into());
        self
    }
}

/// Returned synchronously by `submit`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitReceipt {
    /// Assigned request id
    pub request_id: RequestId,
    /// Backend the request was queued for
    pub backend_id: String,
    /// Always `pending` at submission
    pub status: DispatchStatus,
    /// Why the backend was chosen
    pub reason: SelectionReason,
}

/// Rejections returned synchronously from `submit`
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// Selection fell through to a default backend that is not configured
    #[error("no backend could be resolved and no default backend is configured")]
    NoBackendResolved,

    /// The resolved backend is not enabled
    #[error("backend not found: {0}")]
    BackendNotFound(String),

    /// The queue no longer accepts requests
    #[error("dispatcher is shutting down")]
    ShuttingDown,

    /// The outcome channel closed before delivery
    #[error("request was abandoned before completing")]
    Abandoned,
}

// ============================================================================
// Completion
// ============================================================================

/// Invoked exactly once with the outcome of an accepted request
pub type CompletionHandler = Box<dyn FnOnce(DispatchOutcome) + Send + 'static>;

/// Why an accepted request did not produce output
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum DispatchFailure {
    /// Backend vanished between submission and execution
    BackendNotFound,
    /// The executor reported an error
    Execution(String),
    /// Execution exceeded the configured timeout
    TimedOut {
        /// Configured limit in milliseconds
        after_ms: u64,
    },
    /// The executor panicked
    Panicked(String),
}

impl std::fmt::Display for DispatchFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BackendNotFound => write!(f, "backend not found"),
            Self::Execution(msg) => write!(f, "execution failed: {msg}"),
            Self::TimedOut { after_ms } => write!(f, "execution timed out after {after_ms}ms"),
            Self::Panicked(msg) => write!(f, "executor panicked: {msg}"),
        }
    }
}

/// Output and accounting of a successful execution
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompletedDispatch {
    /// Executor output
    pub output: serde_json::Value,
    /// Input tokens
    pub input_tokens: u64,
    /// Output tokens
    pub output_tokens: u64,
    /// Input plus output tokens
    pub total_tokens: u64,
    /// Cost charged
    pub cost: f64,
}

/// What the completion handler receives
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DispatchOutcome {
    /// Request id
    pub request_id: RequestId,
    /// Backend the request was queued for
    pub backend_id: String,
    /// Submitting caller
    pub caller_id: Option<String>,
    /// When execution began (absent if it never did)
    pub started_at: Option<DateTime<Utc>>,
    /// When the outcome was produced
    pub completed_at: DateTime<Utc>,
    /// Output or failure
    pub result: Result<CompletedDispatch, DispatchFailure>,
}

impl DispatchOutcome {
    /// Whether execution succeeded
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    /// Final status
    #[must_use]
    pub fn status(&self) -> DispatchStatus {
        if self.is_success() {
            DispatchStatus::Completed
        } else {
            DispatchStatus::Failed
        }
    }

    /// Error text, if execution failed
    #[must_use]
    pub fn error(&self) -> Option<String> {
        self.result.as_ref().err().map(ToString::to_string)
    }

    /// Output, if execution succeeded
    #[must_use]
    pub fn output(&self) -> Option<&serde_json::Value> {
        self.result.as_ref().ok().map(|done| &done.output)
    }
}

/// A queued unit of work
pub struct DispatchRequest {
    /// Request id
    pub request_id: RequestId,
    /// Backend resolved at submission
    pub backend_id: String,
    /// Opaque body
    pub payload: Payload,
    /// Submitting caller
    pub caller_id: Option<String>,
    /// When the request was accepted
    pub submitted_at: DateTime<Utc>,
    /// Outcome callback
    pub handler: CompletionHandler,
}

impl std::fmt::Debug for DispatchRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchRequest")
            .field("request_id", &self.request_id)
            .field("backend_id", &self.backend_id)
            .field("caller_id", &self.caller_id)
            .field("submitted_at", &self.submitted_at)
            .finish_non_exhaustive()
    }
}

/// How queued requests are spread across lanes
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaneMode {
    /// One global FIFO lane
    #[default]
    Single,
    /// One FIFO lane per backend
    PerBackend,
}

impl std::str::FromStr for LaneMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "single" => Ok(Self::Single),
            "per_backend" => Ok(Self::PerBackend),
            other => Err(format!("unknown lane mode: {other}")),
        }
    }
}

impl std::fmt::Display for LaneMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Single => write!(f, "single"),
            Self::PerBackend => write!(f, "per_backend"),
        }
    }
}

// ============================================================================
// Queue
// ============================================================================

/// Unbounded FIFO in front of the lanes
#[derive(Debug)]
pub(crate) struct DispatchQueue {
    sender: Mutex<Option<mpsc::UnboundedSender<DispatchRequest>>>,
    depth: Arc<AtomicUsize>,
}

impl DispatchQueue {
    /// Create the queue and its receiving end
    pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<DispatchRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = Self {
            sender: Mutex::new(Some(tx)),
            depth: Arc::new(AtomicUsize::new(0)),
        };
        (queue, rx)
    }

    /// Shared depth counter, decremented by lanes when work starts
    pub(crate) fn depth_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.depth)
    }

    /// Requests accepted but not yet started
    pub(crate) fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    /// Enqueue; hands the request back if the queue is closed
    pub(crate) fn enqueue(&self, request: DispatchRequest) -> Result<(), Box<DispatchRequest>> {
        let guard = self.sender.lock();
        let Some(sender) = guard.as_ref() else {
            return Err(Box::new(request));
        };

        self.depth.fetch_add(1, Ordering::SeqCst);
        sender.send(request).map_err(|rejected| {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            Box::new(rejected.0)
        })
    }

    /// Stop accepting requests; lanes drain what is already queued
    pub(crate) fn close(&self) -> bool {
        self.sender.lock().take().is_some()
    }

    /// Whether `close` has been called
    pub(crate) fn is_closed(&self) -> bool {
        self.sender.lock().is_none()
    }
}

// ============================================================================
// Worker
// ============================================================================

/// Everything a lane needs to process requests
pub(crate) struct WorkerContext {
    pub(crate) registry: Arc<ModelRegistry>,
    pub(crate) ledger: Arc<UsageLedger>,
    pub(crate) executor: Arc<dyn Executor>,
    pub(crate) execution_timeout: Option<Duration>,
    pub(crate) summary_chars: usize,
    pub(crate) queue_depth: Arc<AtomicUsize>,
}

impl WorkerContext {
    /// Process one request to completion
    pub(crate) async fn process(&self, request: DispatchRequest) {
        self.queue_depth.fetch_sub(1, Ordering::SeqCst);

        let DispatchRequest {
            request_id,
            backend_id,
            payload,
            caller_id,
            submitted_at: _,
            handler,
        } = request;

        // Re-resolve: the backend may have been disabled or removed while queued
        let registered = self.registry.snapshot().get(&backend_id).cloned();
        let Some(registered) = registered else {
            tracing::warn!(
                request_id = %request_id,
                backend = %backend_id,
                "Backend not found at execution time"
            );
            deliver(
                handler,
                DispatchOutcome {
                    request_id,
                    backend_id,
                    caller_id,
                    started_at: None,
                    completed_at: Utc::now(),
                    result: Err(DispatchFailure::BackendNotFound),
                },
            );
            return;
        };

        let runtime = registered.runtime;
        if !runtime.begin() {
            tracing::error!(
                request_id = %request_id,
                backend = %backend_id,
                "Backend already busy; more than one lane is serving it"
            );
        }

        let started_at = Utc::now();
        tracing::debug!(request_id = %request_id, backend = %backend_id, "Executing request");

        let input_summary = summarize(&payload, self.summary_chars);
        let executed = self.execute(registered.definition, payload).await;
        let completed_at = Utc::now();

        let result = match executed {
            Ok(output) => {
                let total_tokens = output.total_tokens();
                // Charge the current snapshot if a reload happened meanwhile
                let current = self
                    .registry
                    .snapshot()
                    .get(&backend_id)
                    .map_or_else(|| Arc::clone(&runtime), |b| Arc::clone(&b.runtime));
                let cost = self.ledger.record_usage(&current, total_tokens);
                tracing::info!(
                    request_id = %request_id,
                    backend = %backend_id,
                    tokens = total_tokens,
                    cost,
                    "Request completed"
                );
                Ok(CompletedDispatch {
                    output: output.output,
                    input_tokens: output.input_tokens,
                    output_tokens: output.output_tokens,
                    total_tokens,
                    cost,
                })
            }
            Err(failure) => {
                tracing::warn!(
                    request_id = %request_id,
                    backend = %backend_id,
                    error = %failure,
                    "Request failed"
                );
                Err(failure)
            }
        };

        self.ledger.append(history_record(
            &request_id,
            &backend_id,
            caller_id.as_deref(),
            input_summary,
            &result,
            self.summary_chars,
            started_at,
            completed_at,
        ));

        runtime.finish();

        deliver(
            handler,
            DispatchOutcome {
                request_id,
                backend_id,
                caller_id,
                started_at: Some(started_at),
                completed_at,
                result,
            },
        );
    }

    /// Run the executor in its own task, under the timeout if one is set
    async fn execute(
        &self,
        definition: BackendDefinition,
        payload: Payload,
    ) -> Result<ExecutionOutput, DispatchFailure> {
        let executor = Arc::clone(&self.executor);
        let mut task = tokio::spawn(async move { executor.execute(&definition, &payload).await });

        let joined = match self.execution_timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut task).await {
                Ok(joined) => joined,
                Err(_) => {
                    task.abort();
                    return Err(DispatchFailure::TimedOut {
                        after_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                    });
                }
            },
            None => task.await,
        };

        match joined {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(DispatchFailure::Execution(e.to_string())),
            Err(join_error) if join_error.is_panic() => {
                Err(DispatchFailure::Panicked(panic_message(join_error.into_panic())))
            }
            Err(join_error) => Err(DispatchFailure::Execution(join_error.to_string())),
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn history_record(
    request_id: &RequestId,
    backend_id: &str,
    caller_id: Option<&str>,
    input_summary: String,
    result: &Result<CompletedDispatch, DispatchFailure>,
    summary_chars: usize,
    started_at: DateTime<Utc>,
    completed_at: DateTime<Utc>,
) -> HistoryRecord {
    let (output_summary, input_tokens, output_tokens, cost, error) = match result {
        Ok(done) => (
            summarize(&done.output, summary_chars),
            done.input_tokens,
            done.output_tokens,
            done.cost,
            None,
        ),
        Err(failure) => (String::new(), 0, 0, 0.0, Some(failure.to_string())),
    };

    HistoryRecord {
        request_id: request_id.to_string(),
        backend_id: backend_id.to_string(),
        caller_id: caller_id.map(str::to_string),
        input_summary,
        output_summary,
        input_tokens,
        output_tokens,
        total_tokens: input_tokens.saturating_add(output_tokens),
        cost,
        success: result.is_ok(),
        error,
        started_at,
        completed_at,
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Invoke a completion handler, containing any panic it raises
fn deliver(handler: CompletionHandler, outcome: DispatchOutcome) {
    let request_id = outcome.request_id.clone();
    if std::panic::catch_unwind(AssertUnwindSafe(move || handler(outcome))).is_err() {
        tracing::error!(request_id = %request_id, "Completion handler panicked");
    }
}

/// Spawn one sequential lane consuming `rx` until it closes
pub(crate) fn spawn_lane(
    ctx: Arc<WorkerContext>,
    mut rx: mpsc::UnboundedReceiver<DispatchRequest>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(request) = rx.recv().await {
            ctx.process(request).await;
        }
    })
}

/// Spawn a forwarder that fans requests out to one lane per backend
///
/// Forwarding happens in submission order, so each lane sees its backend's
/// requests in FIFO order. The forwarder waits for every lane to drain
/// before it finishes.
pub(crate) fn spawn_per_backend_lanes(
    ctx: Arc<WorkerContext>,
    mut rx: mpsc::UnboundedReceiver<DispatchRequest>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lanes: HashMap<String, (mpsc::UnboundedSender<DispatchRequest>, JoinHandle<()>)> =
            HashMap::new();

        while let Some(request) = rx.recv().await {
            let (lane, _) = lanes
                .entry(request.backend_id.clone())
                .or_insert_with_key(|backend_id| {
                    tracing::debug!(backend = %backend_id, "Starting backend lane");
                    let (tx, lane_rx) = mpsc::unbounded_channel();
                    (tx, spawn_lane(Arc::clone(&ctx), lane_rx))
                });

            if let Err(rejected) = lane.send(request) {
                // Lane task is gone; process inline so the handler still fires
                ctx.process(rejected.0).await;
            }
        }

        for (backend_id, (lane, handle)) in lanes {
            drop(lane);
            if let Err(e) = handle.await {
                tracing::error!(backend = %backend_id, error = %e, "Backend lane ended abnormally");
            }
        }
    })
}

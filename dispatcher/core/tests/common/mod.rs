//! Shared fixtures for dispatcher integration tests
//!
//! [`ScriptedExecutor`] stands in for real model backends. Each backend can be
//! given a delay, made to fail, panic or hang, or held behind a gate that the
//! test opens explicitly. Every execution is recorded with its time window,
//! and overlapping executions on the same backend are detected.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Semaphore;

use dispatcher_core::backend::{prompt_text, ExecutionError, ExecutionOutput, Executor, Payload};
use dispatcher_core::{
    BackendDefinition, BackendKind, ConfigStore, DispatchOutcome, MemoryConfigStore, RequestId,
    Router, RouterSettings, StoreDocument,
};

/// Output tokens reported for every successful execution
pub const OUTPUT_TOKENS: u64 = 3;

// =============================================================================
// Scripted Executor
// =============================================================================

/// One recorded execution
#[derive(Clone, Debug)]
pub struct ExecutionWindow {
    /// Backend that executed
    pub backend_id: String,
    /// Prompt text of the payload
    pub label: String,
    /// When execution began
    pub started: Instant,
    /// When execution ended (absent if it never returned)
    pub finished: Option<Instant>,
}

#[derive(Default)]
struct Script {
    delays: HashMap<String, Duration>,
    failing: HashSet<String>,
    panicking: HashSet<String>,
    hanging: HashSet<String>,
    gates: HashMap<String, Arc<Semaphore>>,
}

/// Executor whose behaviour is configured per backend
#[derive(Default)]
pub struct ScriptedExecutor {
    script: Mutex<Script>,
    windows: Mutex<Vec<ExecutionWindow>>,
    in_flight: Mutex<HashMap<String, usize>>,
    overlaps: AtomicUsize,
    peak_total_in_flight: AtomicUsize,
    total_in_flight: AtomicUsize,
}

impl ScriptedExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Sleep this long on every execution for the backend
    pub fn delay(&self, backend_id: &str, delay: Duration) {
        self.script.lock().delays.insert(backend_id.to_string(), delay);
    }

    /// Return an execution error for the backend
    pub fn fail(&self, backend_id: &str) {
        self.script.lock().failing.insert(backend_id.to_string());
    }

    /// Panic inside execution for the backend
    pub fn panic(&self, backend_id: &str) {
        self.script.lock().panicking.insert(backend_id.to_string());
    }

    /// Never return for the backend
    pub fn hang(&self, backend_id: &str) {
        self.script.lock().hanging.insert(backend_id.to_string());
    }

    /// Hold every execution for the backend until a permit is released
    pub fn gate(&self, backend_id: &str) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        self.script
            .lock()
            .gates
            .insert(backend_id.to_string(), Arc::clone(&gate));
        gate
    }

    /// Executions recorded so far, in start order
    pub fn windows(&self) -> Vec<ExecutionWindow> {
        self.windows.lock().clone()
    }

    /// Labels of executions on one backend, in start order
    pub fn labels_for(&self, backend_id: &str) -> Vec<String> {
        self.windows
            .lock()
            .iter()
            .filter(|w| w.backend_id == backend_id)
            .map(|w| w.label.clone())
            .collect()
    }

    /// Number of times two executions overlapped on one backend
    pub fn overlaps(&self) -> usize {
        self.overlaps.load(Ordering::SeqCst)
    }

    /// Largest number of simultaneous executions across all backends
    pub fn peak_parallelism(&self) -> usize {
        self.peak_total_in_flight.load(Ordering::SeqCst)
    }

    fn enter(&self, backend_id: &str, label: String) -> usize {
        {
            let mut in_flight = self.in_flight.lock();
            let count = in_flight.entry(backend_id.to_string()).or_insert(0);
            *count += 1;
            if *count > 1 {
                self.overlaps.fetch_add(1, Ordering::SeqCst);
            }
        }
        let total = self.total_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_total_in_flight.fetch_max(total, Ordering::SeqCst);

        let mut windows = self.windows.lock();
        windows.push(ExecutionWindow {
            backend_id: backend_id.to_string(),
            label,
            started: Instant::now(),
            finished: None,
        });
        windows.len() - 1
    }

    fn leave(&self, backend_id: &str, index: usize) {
        if let Some(count) = self.in_flight.lock().get_mut(backend_id) {
            *count = count.saturating_sub(1);
        }
        self.total_in_flight.fetch_sub(1, Ordering::SeqCst);
        if let Some(window) = self.windows.lock().get_mut(index) {
            window.finished = Some(Instant::now());
        }
    }
}

/// Decrements in-flight counters even when execution is aborted
struct InFlight<'a> {
    executor: &'a ScriptedExecutor,
    backend_id: String,
    index: usize,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.executor.leave(&self.backend_id, self.index);
    }
}

#[async_trait]
impl Executor for ScriptedExecutor {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn execute(
        &self,
        backend: &BackendDefinition,
        payload: &Payload,
    ) -> Result<ExecutionOutput, ExecutionError> {
        let label = prompt_text(payload);
        let index = self.enter(&backend.id, label.clone());
        let _guard = InFlight {
            executor: self,
            backend_id: backend.id.clone(),
            index,
        };

        let (delay, fail, panic, hang, gate) = {
            let script = self.script.lock();
            (
                script.delays.get(&backend.id).copied(),
                script.failing.contains(&backend.id),
                script.panicking.contains(&backend.id),
                script.hanging.contains(&backend.id),
                script.gates.get(&backend.id).cloned(),
            )
        };

        if let Some(gate) = gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        if hang {
            std::future::pending::<()>().await;
        }
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if panic {
            panic!("scripted panic on {}", backend.id);
        }
        if fail {
            return Err(ExecutionError::Backend(format!("scripted failure on {}", backend.id)));
        }

        let input_tokens = label.split_whitespace().count() as u64;
        Ok(ExecutionOutput::new(
            serde_json::json!({ "backend": backend.id, "echo": label }),
            input_tokens,
            OUTPUT_TOKENS,
        ))
    }
}

// =============================================================================
// Outcome Collection
// =============================================================================

/// Collects completion handler invocations
#[derive(Clone, Default)]
pub struct OutcomeLog {
    outcomes: Arc<Mutex<Vec<DispatchOutcome>>>,
    invocations: Arc<Mutex<HashMap<RequestId, usize>>>,
}

impl OutcomeLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// A completion handler that records into this log
    pub fn handler(&self) -> impl FnOnce(DispatchOutcome) + Send + 'static {
        let outcomes = Arc::clone(&self.outcomes);
        let invocations = Arc::clone(&self.invocations);
        move |outcome| {
            *invocations
                .lock()
                .entry(outcome.request_id.clone())
                .or_insert(0) += 1;
            outcomes.lock().push(outcome);
        }
    }

    pub fn outcomes(&self) -> Vec<DispatchOutcome> {
        self.outcomes.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.outcomes.lock().len()
    }

    /// Outcome for a request, if delivered
    pub fn get(&self, request_id: &RequestId) -> Option<DispatchOutcome> {
        self.outcomes
            .lock()
            .iter()
            .find(|o| &o.request_id == request_id)
            .cloned()
    }

    /// How many times each request's handler ran
    pub fn invocation_counts(&self) -> HashMap<RequestId, usize> {
        self.invocations.lock().clone()
    }

    /// Wait until `count` outcomes have arrived
    pub async fn wait_for(&self, count: usize, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        while self.len() < count {
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        true
    }
}

// =============================================================================
// Fixtures
// =============================================================================

/// `fast` (4000 tokens, priority 1, free) and `big` (16000 tokens, priority 2)
pub fn scenario_document() -> StoreDocument {
    let mut doc = StoreDocument::default();
    doc.insert(
        BackendDefinition::new("fast", BackendKind::Local)
            .with_display_name("Fast local model")
            .with_capabilities(["text_generation"])
            .with_max_tokens(4000)
            .with_priority(1),
    );
    doc.insert(
        BackendDefinition::new("big", BackendKind::Cloud)
            .with_display_name("Big cloud model")
            .with_capabilities(["text_generation", "code_generation"])
            .with_max_tokens(16000)
            .with_cost_per_token(0.000_02)
            .with_priority(2),
    );

    let rules = &mut doc.routing_rules;
    rules.default_backend = Some("fast".to_string());
    rules.capability_map.insert(
        "text_generation".to_string(),
        vec!["fast".to_string(), "big".to_string()],
    );
    rules
        .capability_map
        .insert("code_generation".to_string(), vec!["big".to_string()]);
    rules.token_thresholds.insert("fast".to_string(), 4000);
    rules.token_thresholds.insert("big".to_string(), 16000);
    rules
        .cost_tier_membership
        .insert("free".to_string(), vec!["fast".to_string()]);
    rules
        .cost_tier_membership
        .insert("premium".to_string(), vec!["big".to_string()]);
    doc
}

/// Start a router over an in-memory store
pub fn start_router(
    settings: RouterSettings,
    document: StoreDocument,
    executor: Arc<ScriptedExecutor>,
) -> (Arc<Router>, Arc<MemoryConfigStore>) {
    let store = Arc::new(MemoryConfigStore::new(document));
    let router = Router::start(
        settings,
        Arc::clone(&store) as Arc<dyn ConfigStore>,
        executor as Arc<dyn Executor>,
    );
    (Arc::new(router), store)
}

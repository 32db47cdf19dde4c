//! Router
//!
//! The in-process API surface. One `Router` is constructed at startup and
//! shared (usually behind an `Arc`) with whatever drives it.
//!
//! # Usage
//!
//! ```ignore
//! let router = Router::start(settings, store, executor);
//!
//! let receipt = router.submit(
//!     SubmitRequest::new(payload).with_capabilities(["text_generation"]),
//!     |outcome| println!("{}: {:?}", outcome.request_id, outcome.status()),
//! )?;
//!
//! router.shutdown().await;
//! ```
//!
//! # Administrative Mutations
//!
//! ```text
//! lock ──> load store ──> apply + validate ──> save store ──> swap snapshot
//!              │ (unreadable)                      │ (fails)
//!              ├─> last good document              └─> abort, nothing applied
//!              └─> none known: reject, file untouched
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::dispatch::{
    spawn_lane, spawn_per_backend_lanes, DispatchError, DispatchOutcome, DispatchQueue,
    DispatchRequest, DispatchStatus, LaneMode, RequestId, SubmitReceipt, SubmitRequest,
    WorkerContext,
};
use super::ledger::{BackendStats, BackendStatus, HistoryRecord, UsageLedger};
use super::policy::{CostTierMode, Selection, SelectionCriteria, SelectionPolicy, SelectionReason};
use super::registry::{
    BackendDefinition, BackendKind, CallerPreferences, ModelRegistry, RegisteredBackend,
    RegistryError, RoutingRulesPatch,
};
use super::store::{ConfigStore, StoreDocument, StoreError};
use crate::backend::{estimate_tokens, Executor};
use crate::config::{DispatcherConfigFile, DEFAULT_HISTORY_CAPACITY, DEFAULT_SUMMARY_CHARS};

// ============================================================================
// Settings
// ============================================================================

/// Runtime settings for a [`Router`]
#[derive(Clone, Debug)]
pub struct RouterSettings {
    /// Lane layout
    pub lane_mode: LaneMode,
    /// Per-request execution timeout
    pub execution_timeout: Option<Duration>,
    /// Maximum retained history records
    pub history_capacity: usize,
    /// Maximum characters kept in history summaries
    pub summary_chars: usize,
    /// Cost tier filtering mode
    pub cost_tier_mode: CostTierMode,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            lane_mode: LaneMode::default(),
            execution_timeout: None,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            summary_chars: DEFAULT_SUMMARY_CHARS,
            cost_tier_mode: CostTierMode::default(),
        }
    }
}

impl RouterSettings {
    /// Set the lane mode
    #[must_use]
    pub fn with_lane_mode(mut self, mode: LaneMode) -> Self {
        self.lane_mode = mode;
        self
    }

    /// Set the execution timeout
    #[must_use]
    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = Some(timeout);
        self
    }

    /// Set the history capacity
    #[must_use]
    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity;
        self
    }

    /// Set the cost tier mode
    #[must_use]
    pub fn with_cost_tier_mode(mut self, mode: CostTierMode) -> Self {
        self.cost_tier_mode = mode;
        self
    }
}

impl From<&DispatcherConfigFile> for RouterSettings {
    fn from(config: &DispatcherConfigFile) -> Self {
        Self {
            lane_mode: config.lane_mode,
            execution_timeout: config.execution_timeout,
            history_capacity: config.history_capacity,
            summary_chars: config.summary_chars,
            cost_tier_mode: config.cost_tier_mode,
        }
    }
}

// ============================================================================
// Reporting Types
// ============================================================================

/// Failures of administrative operations
#[derive(Debug, Error)]
pub enum AdminError {
    /// The mutation was rejected
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// The store could not be read or written
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// One row of `list_backends`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BackendSummary {
    /// Backend id
    pub id: String,
    /// Human-readable name
    pub display_name: String,
    /// Category
    pub kind: BackendKind,
    /// Capability tags
    pub capabilities: Vec<String>,
    /// Token limit
    pub max_tokens: u64,
    /// Price per token
    pub cost_per_token: f64,
    /// Sort key
    pub priority: i32,
    /// Ready or busy
    pub status: BackendStatus,
}

impl From<&RegisteredBackend> for BackendSummary {
    fn from(backend: &RegisteredBackend) -> Self {
        let def = &backend.definition;
        Self {
            id: def.id.clone(),
            display_name: def.display_name.clone(),
            kind: def.kind,
            capabilities: def.capabilities.iter().cloned().collect(),
            max_tokens: def.max_tokens,
            cost_per_token: def.cost_per_token,
            priority: def.priority,
            status: backend.runtime.status(),
        }
    }
}

// ============================================================================
// Router
// ============================================================================

/// Policy-driven request router
pub struct Router {
    /// Durable configuration
    store: Arc<dyn ConfigStore>,
    /// Last document successfully read or written, if any
    document: Mutex<Option<StoreDocument>>,
    /// Current snapshot holder
    registry: Arc<ModelRegistry>,
    /// Usage counters and history
    ledger: Arc<UsageLedger>,
    /// Selection engine
    policy: SelectionPolicy,
    /// Queue feeding the lanes
    queue: DispatchQueue,
    /// Lane (or forwarder) task
    worker: Mutex<Option<JoinHandle<()>>>,
    /// Settings the router was started with
    settings: RouterSettings,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("store", &self.store.describe())
            .field("snapshot_version", &self.registry.snapshot().version())
            .field("queue_depth", &self.queue.depth())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Router {
    /// Load the store, build the registry and start the worker lanes
    ///
    /// An unreadable or malformed store is logged and the router starts
    /// empty. Administrative changes are then refused until the store can
    /// be read again, so the file is never replaced by an empty document.
    ///
    /// # Panics
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(
        settings: RouterSettings,
        store: Arc<dyn ConfigStore>,
        executor: Arc<dyn Executor>,
    ) -> Self {
        let document = match store.load() {
            Ok(document) => Some(document),
            Err(e) => {
                tracing::warn!(
                    store = %store.describe(),
                    error = %e,
                    "Configuration store unavailable, starting with an empty configuration"
                );
                None
            }
        };

        let registry = Arc::new(ModelRegistry::new(
            document.as_ref().unwrap_or(&StoreDocument::default()),
        ));
        let ledger = Arc::new(UsageLedger::new(settings.history_capacity));
        let (queue, rx) = DispatchQueue::new();

        let ctx = Arc::new(WorkerContext {
            registry: Arc::clone(&registry),
            ledger: Arc::clone(&ledger),
            executor: Arc::clone(&executor),
            execution_timeout: settings.execution_timeout,
            summary_chars: settings.summary_chars,
            queue_depth: queue.depth_counter(),
        });
        let worker = match settings.lane_mode {
            LaneMode::Single => spawn_lane(ctx, rx),
            LaneMode::PerBackend => spawn_per_backend_lanes(ctx, rx),
        };

        tracing::info!(
            store = %store.describe(),
            executor = executor.name(),
            backends = registry.snapshot().len(),
            lane_mode = %settings.lane_mode,
            "Router started"
        );

        Self {
            store,
            document: Mutex::new(document),
            registry,
            ledger,
            policy: SelectionPolicy::new(settings.cost_tier_mode),
            queue,
            worker: Mutex::new(Some(worker)),
            settings,
        }
    }

    /// Settings the router was started with
    #[must_use]
    pub fn settings(&self) -> &RouterSettings {
        &self.settings
    }

    /// Version of the current registry snapshot
    #[must_use]
    pub fn snapshot_version(&self) -> u64 {
        self.registry.snapshot().version()
    }

    /// Requests accepted but not yet started
    #[must_use]
    pub fn queue_depth(&self) -> usize {
        self.queue.depth()
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    /// Enabled backends sorted by priority
    ///
    /// `capability` keeps only backends declaring it; `caller_id` removes the
    /// caller's excluded backends.
    #[must_use]
    pub fn list_backends(
        &self,
        capability: Option<&str>,
        caller_id: Option<&str>,
    ) -> Vec<BackendSummary> {
        let snapshot = self.registry.snapshot();
        let preferences = caller_id.and_then(|c| snapshot.rules().preferences_for(c));

        let mut summaries: Vec<BackendSummary> = snapshot
            .backends()
            .filter(|b| capability.map_or(true, |c| b.definition.capabilities.contains(c)))
            .filter(|b| !preferences.is_some_and(|p| p.excludes(&b.definition.id)))
            .map(BackendSummary::from)
            .collect();

        summaries.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));
        summaries
    }

    /// Run selection without submitting anything
    #[must_use]
    pub fn select(&self, criteria: &SelectionCriteria) -> Option<Selection> {
        self.policy.select(&self.registry.snapshot(), criteria)
    }

    /// Usage snapshot of one enabled backend
    #[must_use]
    pub fn stats(&self, backend_id: &str) -> Option<BackendStats> {
        self.registry
            .snapshot()
            .get(backend_id)
            .map(|b| b.runtime.stats())
    }

    /// Usage snapshots of every enabled backend
    #[must_use]
    pub fn all_stats(&self) -> BTreeMap<String, BackendStats> {
        self.registry
            .snapshot()
            .backends()
            .map(|b| (b.definition.id.clone(), b.runtime.stats()))
            .collect()
    }

    /// Most recent history records first
    #[must_use]
    pub fn history(&self, limit: usize, caller_id: Option<&str>) -> Vec<HistoryRecord> {
        self.ledger.history(limit, caller_id)
    }

    /// Charge tokens to a backend outside the dispatch path
    ///
    /// The cost is derived from the backend's per-token price.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownBackend`] if the backend is not enabled.
    pub fn record_usage(&self, backend_id: &str, tokens: u64) -> Result<f64, AdminError> {
        let snapshot = self.registry.snapshot();
        let backend = snapshot
            .get(backend_id)
            .ok_or_else(|| RegistryError::UnknownBackend(backend_id.to_string()))?;
        Ok(self.ledger.record_usage(&backend.runtime, tokens))
    }

    // ------------------------------------------------------------------------
    // Submission
    // ------------------------------------------------------------------------

    /// Resolve a backend and queue the request
    ///
    /// Returns as soon as the request is queued. `on_complete` is invoked
    /// exactly once, from a worker task, if and only if this returns `Ok`.
    ///
    /// # Errors
    ///
    /// - [`DispatchError::NoBackendResolved`] if selection found nothing
    /// - [`DispatchError::BackendNotFound`] if the resolved backend is not enabled
    /// - [`DispatchError::ShuttingDown`] after [`Router::shutdown`]
    pub fn submit<F>(
        &self,
        request: SubmitRequest,
        on_complete: F,
    ) -> Result<SubmitReceipt, DispatchError>
    where
        F: FnOnce(DispatchOutcome) + Send + 'static,
    {
        let SubmitRequest {
            mut criteria,
            payload,
            backend_id,
        } = request;

        let submitted_at = Utc::now();
        let request_id = RequestId::generate(&payload, submitted_at);

        if self.queue.is_closed() {
            tracing::warn!(request_id = %request_id, "Rejected submission during shutdown");
            return Err(DispatchError::ShuttingDown);
        }

        if criteria.token_estimate.is_none() {
            criteria.token_estimate = Some(estimate_tokens(&payload));
        }

        let snapshot = self.registry.snapshot();
        let (backend_id, reason) = match backend_id {
            Some(pinned) => (pinned, SelectionReason::Pinned),
            None => match self.policy.select(&snapshot, &criteria) {
                Some(selection) => (selection.backend_id, selection.reason),
                None => {
                    tracing::warn!(
                        request_id = %request_id,
                        caller = ?criteria.caller_id,
                        "No backend resolved and no default configured"
                    );
                    return Err(DispatchError::NoBackendResolved);
                }
            },
        };

        if !snapshot.contains(&backend_id) {
            tracing::warn!(
                request_id = %request_id,
                backend = %backend_id,
                reason = %reason,
                "Resolved backend is not enabled"
            );
            return Err(DispatchError::BackendNotFound(backend_id));
        }
        drop(snapshot);

        let dispatch = DispatchRequest {
            request_id: request_id.clone(),
            backend_id: backend_id.clone(),
            payload,
            caller_id: criteria.caller_id.clone(),
            submitted_at,
            handler: Box::new(on_complete),
        };

        if self.queue.enqueue(dispatch).is_err() {
            tracing::warn!(request_id = %request_id, "Rejected submission during shutdown");
            return Err(DispatchError::ShuttingDown);
        }

        tracing::info!(
            request_id = %request_id,
            backend = %backend_id,
            caller = ?criteria.caller_id,
            reason = %reason,
            "Request queued"
        );

        Ok(SubmitReceipt {
            request_id,
            backend_id,
            status: DispatchStatus::Pending,
            reason,
        })
    }

    /// Submit and receive the outcome on a channel
    ///
    /// # Errors
    ///
    /// Same as [`Router::submit`].
    pub fn submit_with_receiver(
        &self,
        request: SubmitRequest,
    ) -> Result<(SubmitReceipt, oneshot::Receiver<DispatchOutcome>), DispatchError> {
        let (tx, rx) = oneshot::channel();
        let receipt = self.submit(request, move |outcome| {
            // Receiver may have been dropped; nothing to do then
            let _ = tx.send(outcome);
        })?;
        Ok((receipt, rx))
    }

    /// Submit and wait for the outcome
    ///
    /// # Errors
    ///
    /// Same as [`Router::submit`], plus [`DispatchError::Abandoned`] if the
    /// outcome never arrives.
    pub async fn submit_and_wait(
        &self,
        request: SubmitRequest,
    ) -> Result<DispatchOutcome, DispatchError> {
        let (_, rx) = self.submit_with_receiver(request)?;
        rx.await.map_err(|_| DispatchError::Abandoned)
    }

    // ------------------------------------------------------------------------
    // Administration
    // ------------------------------------------------------------------------

    /// Add a new backend
    ///
    /// # Errors
    ///
    /// Rejects duplicates and invalid definitions; fails if the store cannot
    /// be written.
    pub fn add_backend(&self, definition: BackendDefinition) -> Result<(), AdminError> {
        let id = definition.id.clone();
        self.mutate("add_backend", &id, |doc| doc.add_backend(definition))
    }

    /// Replace a backend's definition
    ///
    /// # Errors
    ///
    /// Rejects unknown ids, id changes and invalid definitions.
    pub fn update_backend(
        &self,
        backend_id: &str,
        definition: BackendDefinition,
    ) -> Result<(), AdminError> {
        self.mutate("update_backend", backend_id, |doc| {
            doc.update_backend(backend_id, definition)
        })
    }

    /// Remove a disabled backend
    ///
    /// # Errors
    ///
    /// Rejects unknown ids and enabled backends.
    pub fn remove_backend(&self, backend_id: &str) -> Result<BackendDefinition, AdminError> {
        self.mutate("remove_backend", backend_id, |doc| {
            doc.remove_backend(backend_id)
        })
    }

    /// Enable a backend
    ///
    /// # Errors
    ///
    /// Rejects unknown ids.
    pub fn enable_backend(&self, backend_id: &str) -> Result<(), AdminError> {
        self.mutate("enable_backend", backend_id, |doc| {
            doc.set_enabled(backend_id, true)
        })
    }

    /// Disable a backend
    ///
    /// Requests already queued for it fail with "backend not found".
    ///
    /// # Errors
    ///
    /// Rejects unknown ids.
    pub fn disable_backend(&self, backend_id: &str) -> Result<(), AdminError> {
        self.mutate("disable_backend", backend_id, |doc| {
            doc.set_enabled(backend_id, false)
        })
    }

    /// Apply a full or partial routing rule update
    ///
    /// # Errors
    ///
    /// Fails if the store cannot be written.
    pub fn update_routing_rules(&self, patch: RoutingRulesPatch) -> Result<(), AdminError> {
        self.mutate("update_routing_rules", "*", |doc| {
            patch.apply_to(&mut doc.routing_rules);
            Ok(())
        })
    }

    /// Replace one caller's preferences
    ///
    /// # Errors
    ///
    /// Fails if the store cannot be written.
    pub fn update_caller_preferences(
        &self,
        caller_id: &str,
        preferences: CallerPreferences,
    ) -> Result<(), AdminError> {
        self.mutate("update_caller_preferences", caller_id, |doc| {
            doc.set_caller_preferences(caller_id, preferences);
            Ok(())
        })
    }

    /// Re-read the store and rebuild the registry
    ///
    /// Picks up edits made to the store outside the router. Runtime counters
    /// are reset, as on every reload.
    ///
    /// # Errors
    ///
    /// Returns the store error and keeps the current snapshot if the store
    /// cannot be read.
    pub fn reload(&self) -> Result<u64, AdminError> {
        let mut cached = self.document.lock();
        let document = self.store.load().map_err(|e| {
            tracing::warn!(store = %self.store.describe(), error = %e, "Reload failed");
            e
        })?;

        let snapshot = self.registry.reload(&document);
        *cached = Some(document);

        tracing::info!(
            version = snapshot.version(),
            backends = snapshot.len(),
            "Configuration reloaded"
        );
        Ok(snapshot.version())
    }

    /// Load, change, validate, persist, then swap the snapshot
    fn mutate<T>(
        &self,
        action: &str,
        target: &str,
        change: impl FnOnce(&mut StoreDocument) -> Result<T, RegistryError>,
    ) -> Result<T, AdminError> {
        let mut cached = self.document.lock();

        let mut document = match (self.store.load(), cached.as_ref()) {
            (Ok(document), _) => document,
            (Err(e), Some(last_good)) => {
                tracing::warn!(
                    store = %self.store.describe(),
                    error = %e,
                    "Store unreadable, applying change to last known configuration"
                );
                last_good.clone()
            }
            (Err(e), None) => {
                tracing::error!(
                    action,
                    target,
                    store = %self.store.describe(),
                    error = %e,
                    "Store unreadable and no configuration known, change refused"
                );
                return Err(e.into());
            }
        };

        let value = change(&mut document).map_err(|e| {
            tracing::warn!(action, target, error = %e, "Administrative change rejected");
            e
        })?;

        self.store.save(&document).map_err(|e| {
            tracing::error!(action, target, error = %e, "Failed to persist change");
            e
        })?;

        let snapshot = self.registry.reload(&document);
        *cached = Some(document);

        tracing::info!(
            action,
            target,
            version = snapshot.version(),
            "Configuration updated"
        );
        Ok(value)
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Stop accepting requests and wait for queued ones to finish
    ///
    /// Every request accepted before shutdown still completes and its handler
    /// still fires. Calling this more than once is harmless.
    pub async fn shutdown(&self) {
        if self.queue.close() {
            tracing::info!(pending = self.queue.depth(), "Router shutting down, draining queue");
        }

        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                tracing::error!(error = %e, "Dispatch worker ended abnormally");
            }
            tracing::info!("Router stopped");
        }
    }
}

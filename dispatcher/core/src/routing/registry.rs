//! Model Registry
//!
//! Backend definitions, routing rules, and the immutable registry snapshot
//! derived from them.
//!
//! # Snapshot Lifecycle
//!
//! ```text
//! StoreDocument ──load()──> RegistrySnapshot (enabled backends only)
//!                                 │
//!                     Arc swapped into ModelRegistry
//!                                 │
//!           readers clone the Arc; writers never block them
//! ```
//!
//! Every administrative mutation builds a fresh snapshot. Runtime state
//! (status, counters) is created zeroed for each enabled backend and lives
//! inside the snapshot, so a reload resets it.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::ledger::BackendRuntime;
use super::store::StoreDocument;

// ============================================================================
// Backend Definitions
// ============================================================================

/// Broad category of a backend
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Runs on local hardware
    #[default]
    Local,
    /// Hosted API
    Cloud,
    /// Narrow-purpose model (embeddings, code, vision...)
    Specialized,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Cloud => write!(f, "cloud"),
            Self::Specialized => write!(f, "specialized"),
        }
    }
}

fn default_enabled() -> bool {
    true
}

/// Static, configuration-owned description of a backend
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BackendDefinition {
    /// Unique identifier
    #[serde(default)]
    pub id: String,

    /// Human-readable name
    #[serde(default)]
    pub display_name: String,

    /// Backend category
    #[serde(default)]
    pub kind: BackendKind,

    /// Capability tags this backend can serve
    #[serde(default)]
    pub capabilities: BTreeSet<String>,

    /// Largest request (in tokens) the backend accepts
    #[serde(default)]
    pub max_tokens: u64,

    /// Price of a single token
    #[serde(default)]
    pub cost_per_token: f64,

    /// Sort key for tie-breaking, lower sorts first
    #[serde(default)]
    pub priority: i32,

    /// Disabled backends are never routed to
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Base URL for HTTP execution adapters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// Upstream model name (defaults to `id`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl BackendDefinition {
    /// Create an enabled definition with no capabilities
    pub fn new(id: impl Into<String>, kind: BackendKind) -> Self {
        let id = id.into();
        Self {
            display_name: id.clone(),
            id,
            kind,
            capabilities: BTreeSet::new(),
            max_tokens: 0,
            cost_per_token: 0.0,
            priority: 0,
            enabled: true,
            endpoint: None,
            model: None,
        }
    }

    /// Set the display name
    #[must_use]
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    /// Replace the capability set
    #[must_use]
    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    /// Set the token limit
    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u64) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Set the per-token cost
    #[must_use]
    pub fn with_cost_per_token(mut self, cost: f64) -> Self {
        self.cost_per_token = cost;
        self
    }

    /// Set the priority
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the HTTP endpoint
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Mark the definition disabled
    #[must_use]
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Whether every requested capability is supported
    #[must_use]
    pub fn supports_all<S: AsRef<str>>(&self, capabilities: &[S]) -> bool {
        capabilities
            .iter()
            .all(|c| self.capabilities.contains(c.as_ref()))
    }

    /// Upstream model name
    #[must_use]
    pub fn model_name(&self) -> &str {
        self.model.as_deref().unwrap_or(&self.id)
    }

    /// Check the definition is internally consistent
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::InvalidDefinition`] for an empty id or a
    /// negative / non-finite cost.
    pub fn validate(&self) -> Result<(), RegistryError> {
        if self.id.trim().is_empty() {
            return Err(RegistryError::InvalidDefinition {
                id: self.id.clone(),
                reason: "id must not be empty".to_string(),
            });
        }
        if !self.cost_per_token.is_finite() || self.cost_per_token < 0.0 {
            return Err(RegistryError::InvalidDefinition {
                id: self.id.clone(),
                reason: format!(
                    "cost_per_token must be a non-negative number, got {}",
                    self.cost_per_token
                ),
            });
        }
        Ok(())
    }
}

// ============================================================================
// Routing Rules
// ============================================================================

/// Per-caller routing preferences
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallerPreferences {
    /// Backend to use whenever it satisfies the request
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preferred_backend: Option<String>,

    /// Backends this caller must never be routed to
    pub excluded_backends: BTreeSet<String>,
}

impl CallerPreferences {
    /// Preferences with only a preferred backend
    pub fn preferring(backend: impl Into<String>) -> Self {
        Self {
            preferred_backend: Some(backend.into()),
            excluded_backends: BTreeSet::new(),
        }
    }

    /// Add an excluded backend
    #[must_use]
    pub fn excluding(mut self, backend: impl Into<String>) -> Self {
        self.excluded_backends.insert(backend.into());
        self
    }

    /// Whether the backend is excluded for this caller
    #[must_use]
    pub fn excludes(&self, backend_id: &str) -> bool {
        self.excluded_backends.contains(backend_id)
    }
}

/// Rules consumed by the selection policy
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingRules {
    /// Fallback backend when no rule matches
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_backend: Option<String>,

    /// Capability tag -> ordered candidate backend ids
    pub capability_map: BTreeMap<String, Vec<String>>,

    /// Backend id -> largest token estimate it will accept
    pub token_thresholds: BTreeMap<String, u64>,

    /// Cost tier name -> member backend ids
    pub cost_tier_membership: BTreeMap<String, Vec<String>>,

    /// Caller id -> preferences
    pub caller_preferences: BTreeMap<String, CallerPreferences>,
}

impl RoutingRules {
    /// Preferences for a caller, if any
    #[must_use]
    pub fn preferences_for(&self, caller_id: &str) -> Option<&CallerPreferences> {
        self.caller_preferences.get(caller_id)
    }
}

/// Partial update to [`RoutingRules`]; `None` fields are left untouched
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingRulesPatch {
    /// New default backend
    pub default_backend: Option<String>,
    /// Replacement capability map
    pub capability_map: Option<BTreeMap<String, Vec<String>>>,
    /// Replacement token thresholds
    pub token_thresholds: Option<BTreeMap<String, u64>>,
    /// Replacement cost tier membership
    pub cost_tier_membership: Option<BTreeMap<String, Vec<String>>>,
    /// Replacement caller preferences
    pub caller_preferences: Option<BTreeMap<String, CallerPreferences>>,
}

impl RoutingRulesPatch {
    /// Apply the patch in place
    pub fn apply_to(self, rules: &mut RoutingRules) {
        if let Some(default_backend) = self.default_backend {
            rules.default_backend = Some(default_backend);
        }
        if let Some(map) = self.capability_map {
            rules.capability_map = map;
        }
        if let Some(thresholds) = self.token_thresholds {
            rules.token_thresholds = thresholds;
        }
        if let Some(tiers) = self.cost_tier_membership {
            rules.cost_tier_membership = tiers;
        }
        if let Some(prefs) = self.caller_preferences {
            rules.caller_preferences = prefs;
        }
    }
}

// ============================================================================
// Validation Errors
// ============================================================================

/// Rejections from administrative mutations
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// A backend with this id already exists
    #[error("backend already exists: {0}")]
    DuplicateBackend(String),

    /// No backend with this id exists
    #[error("unknown backend: {0}")]
    UnknownBackend(String),

    /// Removal attempted on an enabled backend
    #[error("backend must be disabled before removal: {0}")]
    BackendStillEnabled(String),

    /// The definition failed validation
    #[error("invalid definition for backend '{id}': {reason}")]
    InvalidDefinition {
        /// Offending backend id
        id: String,
        /// What was wrong
        reason: String,
    },
}

// ============================================================================
// Registry Snapshot
// ============================================================================

/// An enabled backend together with its runtime state
#[derive(Clone, Debug)]
pub struct RegisteredBackend {
    /// Static definition
    pub definition: BackendDefinition,
    /// Live status and counters
    pub runtime: Arc<BackendRuntime>,
}

/// Immutable view of the enabled backends and routing rules
#[derive(Debug, Default)]
pub struct RegistrySnapshot {
    version: u64,
    backends: BTreeMap<String, RegisteredBackend>,
    rules: RoutingRules,
}

impl RegistrySnapshot {
    /// Build a snapshot from a store document, keeping enabled backends only
    #[must_use]
    pub fn load(document: &StoreDocument, version: u64) -> Self {
        Self::load_after(document, version, None)
    }

    /// Build a snapshot that replaces `previous`
    ///
    /// Counters start at zero, but a backend that stays enabled keeps its
    /// busy flag so an in-flight request is still reported.
    fn load_after(
        document: &StoreDocument,
        version: u64,
        previous: Option<&RegistrySnapshot>,
    ) -> Self {
        let backends = document
            .backends
            .iter()
            .filter(|(_, definition)| definition.enabled)
            .map(|(id, definition)| {
                let runtime = match previous.and_then(|p| p.get(id)) {
                    Some(old) => BackendRuntime::succeeding(definition, &old.runtime),
                    None => BackendRuntime::new(definition),
                };
                let registered = RegisteredBackend {
                    runtime: Arc::new(runtime),
                    definition: definition.clone(),
                };
                (id.clone(), registered)
            })
            .collect();

        Self {
            version,
            backends,
            rules: document.routing_rules.clone(),
        }
    }

    /// Monotonic version, bumped on every reload
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Look up an enabled backend
    #[must_use]
    pub fn get(&self, backend_id: &str) -> Option<&RegisteredBackend> {
        self.backends.get(backend_id)
    }

    /// Definition of an enabled backend
    #[must_use]
    pub fn definition(&self, backend_id: &str) -> Option<&BackendDefinition> {
        self.backends.get(backend_id).map(|b| &b.definition)
    }

    /// Whether the backend is enabled in this snapshot
    #[must_use]
    pub fn contains(&self, backend_id: &str) -> bool {
        self.backends.contains_key(backend_id)
    }

    /// All enabled backends, ordered by id
    pub fn backends(&self) -> impl Iterator<Item = &RegisteredBackend> {
        self.backends.values()
    }

    /// Number of enabled backends
    #[must_use]
    pub fn len(&self) -> usize {
        self.backends.len()
    }

    /// Whether no backend is enabled
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Routing rules captured with this snapshot
    #[must_use]
    pub fn rules(&self) -> &RoutingRules {
        &self.rules
    }
}

/// Holder of the current [`RegistrySnapshot`]
///
/// The snapshot is replaced wholesale; readers get an `Arc` that stays
/// consistent for as long as they hold it.
#[derive(Debug)]
pub struct ModelRegistry {
    current: RwLock<Arc<RegistrySnapshot>>,
    next_version: AtomicU64,
}

impl ModelRegistry {
    /// Create a registry from an initial document
    #[must_use]
    pub fn new(document: &StoreDocument) -> Self {
        Self {
            current: RwLock::new(Arc::new(RegistrySnapshot::load(document, 1))),
            next_version: AtomicU64::new(2),
        }
    }

    /// Current snapshot
    #[must_use]
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        Arc::clone(&self.current.read())
    }

    /// Rebuild from a document and swap it in
    pub fn reload(&self, document: &StoreDocument) -> Arc<RegistrySnapshot> {
        let version = self.next_version.fetch_add(1, Ordering::SeqCst);
        let mut current = self.current.write();
        let snapshot = Arc::new(RegistrySnapshot::load_after(
            document,
            version,
            Some(&**current),
        ));
        *current = Arc::clone(&snapshot);
        drop(current);

        tracing::debug!(
            version,
            backends = snapshot.len(),
            "Registry snapshot replaced"
        );
        snapshot
    }
}

//! Usage Ledger
//!
//! Per-backend runtime state and the bounded dispatch history.
//!
//! Counters are atomics written only by the worker lane that owns the
//! backend; reads are lock-free point-in-time snapshots. Token counters
//! saturate instead of wrapping, and cost is always derived from the token
//! total and the declared per-token price, so
//! `total_cost == total_tokens * cost_per_token` holds at every read.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::registry::BackendDefinition;

/// Declared price with negatives and non-finite values clamped to zero
fn sanitize_price(cost: f64) -> f64 {
    if cost.is_finite() && cost > 0.0 {
        cost
    } else {
        0.0
    }
}

/// Add to a counter, saturating at `u64::MAX`; returns the amount added
fn saturating_add(counter: &AtomicU64, amount: u64) -> u64 {
    let previous = counter
        .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
            Some(current.saturating_add(amount))
        })
        .unwrap_or_else(|current| current);
    previous.saturating_add(amount) - previous
}

// ============================================================================
// Backend Runtime State
// ============================================================================

/// Whether a backend is executing a request
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendStatus {
    /// Idle
    Ready,
    /// Executing a request
    Busy,
}

impl std::fmt::Display for BackendStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ready => write!(f, "ready"),
            Self::Busy => write!(f, "busy"),
        }
    }
}

/// Live status and usage counters for one enabled backend
#[derive(Debug)]
pub struct BackendRuntime {
    backend_id: String,
    cost_per_token: f64,
    /// Shared with the runtime this one replaced, if any
    busy: Arc<AtomicBool>,
    total_requests: AtomicU64,
    total_tokens: AtomicU64,
    last_used_at: Mutex<Option<DateTime<Utc>>>,
}

impl BackendRuntime {
    /// Fresh, ready state with zeroed counters
    #[must_use]
    pub fn new(definition: &BackendDefinition) -> Self {
        Self::with_busy_flag(definition, Arc::new(AtomicBool::new(false)))
    }

    /// Zeroed counters that keep `previous`'s busy flag
    ///
    /// Used when a reload keeps the backend enabled, so a request still
    /// executing against the old snapshot shows as busy in the new one.
    #[must_use]
    pub fn succeeding(definition: &BackendDefinition, previous: &BackendRuntime) -> Self {
        Self::with_busy_flag(definition, Arc::clone(&previous.busy))
    }

    fn with_busy_flag(definition: &BackendDefinition, busy: Arc<AtomicBool>) -> Self {
        Self {
            backend_id: definition.id.clone(),
            cost_per_token: sanitize_price(definition.cost_per_token),
            busy,
            total_requests: AtomicU64::new(0),
            total_tokens: AtomicU64::new(0),
            last_used_at: Mutex::new(None),
        }
    }

    /// Current status
    #[must_use]
    pub fn status(&self) -> BackendStatus {
        if self.busy.load(Ordering::Acquire) {
            BackendStatus::Busy
        } else {
            BackendStatus::Ready
        }
    }

    /// Mark busy, count the request and stamp the last-use time
    ///
    /// Returns `false` if the backend was already busy, which would mean two
    /// lanes are serving the same backend.
    pub fn begin(&self) -> bool {
        saturating_add(&self.total_requests, 1);
        *self.last_used_at.lock() = Some(Utc::now());
        !self.busy.swap(true, Ordering::AcqRel)
    }

    /// Mark ready
    pub fn finish(&self) {
        self.busy.store(false, Ordering::Release);
    }

    /// Add tokens; returns the cost of the tokens actually counted
    ///
    /// Once the token total saturates, further usage adds nothing.
    pub fn record_usage(&self, tokens: u64) -> f64 {
        let counted = saturating_add(&self.total_tokens, tokens);
        *self.last_used_at.lock() = Some(Utc::now());
        self.cost_of(counted)
    }

    /// Cost of `tokens` at this backend's price
    #[must_use]
    pub fn cost_of(&self, tokens: u64) -> f64 {
        tokens as f64 * self.cost_per_token
    }

    /// Point-in-time snapshot
    #[must_use]
    pub fn stats(&self) -> BackendStats {
        let total_tokens = self.total_tokens.load(Ordering::Relaxed);
        BackendStats {
            backend_id: self.backend_id.clone(),
            status: self.status(),
            total_requests: self.total_requests.load(Ordering::Relaxed),
            total_tokens,
            total_cost: self.cost_of(total_tokens),
            cost_per_token: self.cost_per_token,
            last_used_at: *self.last_used_at.lock(),
        }
    }
}

/// Snapshot of a backend's usage
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BackendStats {
    /// Backend id
    pub backend_id: String,
    /// Ready or busy
    pub status: BackendStatus,
    /// Requests started on this backend
    pub total_requests: u64,
    /// Input plus output tokens
    pub total_tokens: u64,
    /// Accrued cost
    pub total_cost: f64,
    /// Rate the cost was accrued at
    pub cost_per_token: f64,
    /// Last time a request started or usage was recorded
    pub last_used_at: Option<DateTime<Utc>>,
}

// ============================================================================
// History
// ============================================================================

/// Immutable record of one executed dispatch
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    /// Request id
    pub request_id: String,
    /// Backend that executed the request
    pub backend_id: String,
    /// Submitting caller
    pub caller_id: Option<String>,
    /// Truncated rendering of the payload
    pub input_summary: String,
    /// Truncated rendering of the output (empty on failure)
    pub output_summary: String,
    /// Input tokens reported by the executor
    pub input_tokens: u64,
    /// Output tokens reported by the executor
    pub output_tokens: u64,
    /// Input plus output tokens
    pub total_tokens: u64,
    /// Cost charged for this request
    pub cost: f64,
    /// Whether execution succeeded
    pub success: bool,
    /// Failure description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When execution began
    pub started_at: DateTime<Utc>,
    /// When execution finished
    pub completed_at: DateTime<Utc>,
}

/// Bounded, most-recent-last dispatch history
#[derive(Debug)]
pub struct UsageLedger {
    history: Mutex<VecDeque<HistoryRecord>>,
    capacity: usize,
    evicted: AtomicU64,
}

impl UsageLedger {
    /// Ledger retaining at most `capacity` records
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            history: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            capacity,
            evicted: AtomicU64::new(0),
        }
    }

    /// Configured history bound
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Records currently retained
    #[must_use]
    pub fn len(&self) -> usize {
        self.history.lock().len()
    }

    /// Whether no record is retained
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.history.lock().is_empty()
    }

    /// Records dropped to respect the bound
    #[must_use]
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    /// Charge tokens to a backend; returns the cost charged
    pub fn record_usage(&self, runtime: &BackendRuntime, tokens: u64) -> f64 {
        runtime.record_usage(tokens)
    }

    /// Append a record, evicting the oldest when full
    pub fn append(&self, record: HistoryRecord) {
        if self.capacity == 0 {
            self.evicted.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let mut history = self.history.lock();
        while history.len() >= self.capacity {
            history.pop_front();
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        history.push_back(record);
    }

    /// Most recent records first, optionally for one caller
    #[must_use]
    pub fn history(&self, limit: usize, caller_id: Option<&str>) -> Vec<HistoryRecord> {
        let history = self.history.lock();
        history
            .iter()
            .rev()
            .filter(|record| match caller_id {
                Some(caller) => record.caller_id.as_deref() == Some(caller),
                None => true,
            })
            .take(limit)
            .cloned()
            .collect()
    }
}

/// Render a payload or output for history, capped at `max_chars` characters
#[must_use]
pub fn summarize(value: &serde_json::Value, max_chars: usize) -> String {
    let rendered = match value {
        serde_json::Value::Null => return String::new(),
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    };

    if rendered.chars().count() <= max_chars {
        return rendered;
    }
    let mut truncated: String = rendered.chars().take(max_chars).collect();
    truncated.push_str("...");
    truncated
}

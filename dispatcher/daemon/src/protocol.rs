//! Line Protocol
//!
//! One JSON object per line in each direction.
//!
//! Commands carry an `op` tag and an optional `id` that is echoed back:
//!
//! ```text
//! {"id":1,"op":"submit","capabilities":["text_generation"],"payload":"Hello"}
//! {"id":1,"ok":true,"result":{"request_id":"req_...","backend_id":"fast",...}}
//! {"event":"completed","request_id":"req_...","success":true,...}
//! ```
//!
//! Responses are written in command order. Completion events are written
//! whenever a request finishes, interleaved with responses.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use dispatcher_core::{
    BackendDefinition, CallerPreferences, DispatchOutcome, DispatchStatus, RequestId, Router,
    RoutingRulesPatch, SelectionCriteria, SubmitRequest,
};

/// Default number of history records returned
const DEFAULT_HISTORY_LIMIT: usize = 50;

fn default_history_limit() -> usize {
    DEFAULT_HISTORY_LIMIT
}

/// Serialized lines bound for stdout
pub type LineSender = mpsc::UnboundedSender<String>;

// ============================================================================
// Commands
// ============================================================================

/// A request read from stdin
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Command {
    /// Queue a request for execution
    Submit {
        #[serde(flatten)]
        request: SubmitRequest,
    },
    /// Run selection without queueing anything
    Select {
        #[serde(flatten)]
        criteria: SelectionCriteria,
    },
    /// Enabled backends, optionally filtered
    ListBackends {
        #[serde(default)]
        capability: Option<String>,
        #[serde(default)]
        caller_id: Option<String>,
    },
    /// Usage counters for one backend or all of them
    Stats {
        #[serde(default)]
        backend_id: Option<String>,
    },
    /// Recent history, newest first
    History {
        #[serde(default = "default_history_limit")]
        limit: usize,
        #[serde(default)]
        caller_id: Option<String>,
    },
    AddBackend {
        backend: BackendDefinition,
    },
    UpdateBackend {
        backend_id: String,
        backend: BackendDefinition,
    },
    RemoveBackend {
        backend_id: String,
    },
    EnableBackend {
        backend_id: String,
    },
    DisableBackend {
        backend_id: String,
    },
    UpdateRoutingRules {
        #[serde(flatten)]
        patch: RoutingRulesPatch,
    },
    UpdateCallerPreferences {
        caller_id: String,
        preferences: CallerPreferences,
    },
    /// Charge tokens to a backend outside the dispatch path
    RecordUsage {
        backend_id: String,
        tokens: u64,
    },
    /// Re-read the configuration store
    Reload,
}

// ============================================================================
// Responses and Events
// ============================================================================

/// Reply to one command
#[derive(Debug, PartialEq, Serialize)]
pub struct Response {
    /// Correlation id copied from the command
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            id,
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    fn failure(id: Option<Value>, error: impl ToString) -> Self {
        Self {
            id,
            ok: false,
            result: None,
            error: Some(error.to_string()),
        }
    }
}

/// Written when a completion handler fires
#[derive(Debug, Serialize)]
pub struct CompletionEvent {
    /// Always `"completed"`
    pub event: &'static str,
    pub request_id: RequestId,
    pub backend_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caller_id: Option<String>,
    pub status: DispatchStatus,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub total_tokens: u64,
    pub cost: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: DateTime<Utc>,
}

impl From<DispatchOutcome> for CompletionEvent {
    fn from(outcome: DispatchOutcome) -> Self {
        let status = outcome.status();
        let error = outcome.error();
        let (output, total_tokens, cost) = match outcome.result {
            Ok(done) => (Some(done.output), done.total_tokens, done.cost),
            Err(_) => (None, 0, 0.0),
        };

        Self {
            event: "completed",
            request_id: outcome.request_id,
            backend_id: outcome.backend_id,
            caller_id: outcome.caller_id,
            status,
            success: error.is_none(),
            output,
            error,
            total_tokens,
            cost,
            started_at: outcome.started_at,
            completed_at: outcome.completed_at,
        }
    }
}

// ============================================================================
// Dispatch
// ============================================================================

/// Parse one input line and run it against the router
pub fn handle_line(router: &Router, line: &str, events: &LineSender) -> Response {
    let mut value: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(e) => return Response::failure(None, format!("invalid JSON: {e}")),
    };

    let id = value.as_object_mut().and_then(|obj| obj.remove("id"));
    let command: Command = match serde_json::from_value(value) {
        Ok(command) => command,
        Err(e) => return Response::failure(id, format!("invalid command: {e}")),
    };

    match execute(router, command, events) {
        Ok(result) => Response::success(id, result),
        Err(error) => Response::failure(id, error),
    }
}

/// Run a parsed command
pub fn execute(router: &Router, command: Command, events: &LineSender) -> Result<Value, String> {
    match command {
        Command::Submit { request } => {
            let events = events.clone();
            let receipt = router
                .submit(request, move |outcome| emit(&events, &CompletionEvent::from(outcome)))
                .map_err(|e| e.to_string())?;
            to_value(&receipt)
        }
        Command::Select { criteria } => match router.select(&criteria) {
            Some(selection) => to_value(&selection),
            None => Ok(Value::Null),
        },
        Command::ListBackends {
            capability,
            caller_id,
        } => to_value(&router.list_backends(capability.as_deref(), caller_id.as_deref())),
        Command::Stats { backend_id } => match backend_id {
            Some(id) => match router.stats(&id) {
                Some(stats) => to_value(&stats),
                None => Err(format!("backend not found: {id}")),
            },
            None => to_value(&router.all_stats()),
        },
        Command::History { limit, caller_id } => {
            to_value(&router.history(limit, caller_id.as_deref()))
        }
        Command::AddBackend { backend } => {
            router.add_backend(backend).map_err(|e| e.to_string())?;
            Ok(Value::Null)
        }
        Command::UpdateBackend {
            backend_id,
            backend,
        } => {
            router
                .update_backend(&backend_id, backend)
                .map_err(|e| e.to_string())?;
            Ok(Value::Null)
        }
        Command::RemoveBackend { backend_id } => {
            let removed = router
                .remove_backend(&backend_id)
                .map_err(|e| e.to_string())?;
            to_value(&removed)
        }
        Command::EnableBackend { backend_id } => {
            router
                .enable_backend(&backend_id)
                .map_err(|e| e.to_string())?;
            Ok(Value::Null)
        }
        Command::DisableBackend { backend_id } => {
            router
                .disable_backend(&backend_id)
                .map_err(|e| e.to_string())?;
            Ok(Value::Null)
        }
        Command::UpdateRoutingRules { patch } => {
            router
                .update_routing_rules(patch)
                .map_err(|e| e.to_string())?;
            Ok(Value::Null)
        }
        Command::UpdateCallerPreferences {
            caller_id,
            preferences,
        } => {
            router
                .update_caller_preferences(&caller_id, preferences)
                .map_err(|e| e.to_string())?;
            Ok(Value::Null)
        }
        Command::RecordUsage { backend_id, tokens } => {
            let cost = router
                .record_usage(&backend_id, tokens)
                .map_err(|e| e.to_string())?;
            Ok(serde_json::json!({ "cost": cost }))
        }
        Command::Reload => {
            let version = router.reload().map_err(|e| e.to_string())?;
            Ok(serde_json::json!({ "version": version }))
        }
    }
}

fn to_value<T: Serialize>(value: &T) -> Result<Value, String> {
    serde_json::to_value(value).map_err(|e| format!("failed to encode result: {e}"))
}

/// Serialize and queue a line for stdout
pub fn emit<T: Serialize>(lines: &LineSender, message: &T) {
    match serde_json::to_string(message) {
        Ok(line) => {
            if lines.send(line).is_err() {
                tracing::warn!("Output closed, dropping line");
            }
        }
        Err(e) => tracing::error!(error = %e, "Failed to encode output line"),
    }
}

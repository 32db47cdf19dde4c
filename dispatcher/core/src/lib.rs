//! Dispatcher Core - Policy-Driven Model Request Routing
//!
//! Accepts inference requests, selects among heterogeneous backends under
//! capability, capacity and cost constraints, serializes their execution,
//! and tracks usage for billing and capacity planning.
//!
//! The crate does not run inference itself. It decides *which* backend
//! handles a request and *when* that backend is free, then hands the payload
//! to an [`backend::Executor`].
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        Callers / Daemon                          │
//! └───────────────────────────────┬──────────────────────────────────┘
//!                                 │ submit / admin / stats
//! ┌───────────────────────────────┼──────────────────────────────────┐
//! │                          DISPATCHER CORE                         │
//! │  ┌────────────────────────────┴───────────────────────────────┐  │
//! │  │                          Router                            │  │
//! │  │  ┌──────────┐  ┌───────────┐  ┌──────────┐  ┌───────────┐  │  │
//! │  │  │ Registry │  │ Selection │  │ Dispatch │  │  Usage    │  │  │
//! │  │  │ Snapshot │  │  Policy   │  │  Lanes   │  │  Ledger   │  │  │
//! │  │  └────┬─────┘  └───────────┘  └────┬─────┘  └───────────┘  │  │
//! │  └───────┼────────────────────────────┼───────────────────────┘  │
//! │     ConfigStore                    Executor                      │
//! │   (TOML file / memory)        (Ollama / echo / ...)              │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use dispatcher_core::{
//!     backend::EchoExecutor, FileConfigStore, Router, RouterSettings, SubmitRequest,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = Arc::new(FileConfigStore::new("backends.toml"));
//!     let router = Router::start(RouterSettings::default(), store, Arc::new(EchoExecutor::new()));
//!
//!     let outcome = router
//!         .submit_and_wait(
//!             SubmitRequest::new(serde_json::json!("Hello"))
//!                 .with_capabilities(["text_generation"]),
//!         )
//!         .await;
//!
//!     router.shutdown().await;
//! }
//! ```
//!
//! # Module Overview
//!
//! - [`routing`]: registry, store, selection, dispatch, ledger and the [`Router`]
//! - [`backend`]: execution adapters (Ollama, echo)
//! - [`config`]: process settings from TOML, environment and CLI

#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

pub mod backend;
pub mod config;
pub mod routing;

// Routing exports
pub use routing::{
    AdminError, BackendDefinition, BackendKind, BackendStats, BackendStatus, BackendSummary,
    CallerPreferences, ConfigStore, CostTierMode, DispatchError, DispatchFailure,
    DispatchOutcome, DispatchStatus, FileConfigStore, HistoryRecord, LaneMode,
    MemoryConfigStore, RegistryError, RequestId, Router, RouterSettings, RoutingRules,
    RoutingRulesPatch, Selection, SelectionCriteria, SelectionReason, StoreDocument, StoreError,
    SubmitReceipt, SubmitRequest,
};

// Backend exports
pub use backend::{EchoExecutor, ExecutionError, ExecutionOutput, Executor, OllamaExecutor};

// Config exports
pub use config::{
    default_config_path, default_store_path, load_config, load_config_from_path,
    ConfigError, ConfigOverrides, ConfigSource, DispatcherConfigFile, DispatcherToml,
};

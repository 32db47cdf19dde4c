//! Request Routing
//!
//! Decides which backend serves a request and when that backend is free.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                           Router                             │
//! │                                                              │
//! │  submit() ──> SelectionPolicy ──> DispatchQueue ──> lane(s)  │
//! │                     │                                 │      │
//! │                     ▼                                 ▼      │
//! │               ModelRegistry <── ConfigStore      UsageLedger │
//! │            (snapshot swap)     (TOML / memory)  (stats, hist)│
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `registry`: backend definitions, routing rules, immutable snapshots
//! - `store`: durable document and its file/memory stores
//! - `policy`: pure selection engine
//! - `dispatch`: queue, lanes and completion delivery
//! - `ledger`: runtime counters and bounded history
//! - `router`: the API tying them together

pub mod dispatch;
pub mod ledger;
pub mod policy;
pub mod registry;
pub mod router;
pub mod store;

pub use dispatch::{
    CompletedDispatch, CompletionHandler, DispatchError, DispatchFailure, DispatchOutcome,
    DispatchRequest, DispatchStatus, LaneMode, RequestId, SubmitReceipt, SubmitRequest,
};
pub use ledger::{BackendRuntime, BackendStats, BackendStatus, HistoryRecord, UsageLedger};
pub use policy::{CostTierMode, Selection, SelectionCriteria, SelectionPolicy, SelectionReason};
pub use registry::{
    BackendDefinition, BackendKind, CallerPreferences, ModelRegistry, RegisteredBackend,
    RegistryError, RegistrySnapshot, RoutingRules, RoutingRulesPatch,
};
pub use router::{AdminError, BackendSummary, Router, RouterSettings};
pub use store::{ConfigStore, FileConfigStore, MemoryConfigStore, StoreDocument, StoreError};

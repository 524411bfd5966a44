//! Core orchestration domain for CogWorks.
//!
//! This crate contains every domain concept of the pipeline graph engine: the
//! graph model and its validator, the edge condition language, run state and
//! eligibility rules, budget and retry/rework accounting, the alignment model,
//! and the port traits infrastructure crates implement. It never performs I/O;
//! the `nodes` crate drives execution on top of it.
//!
//! ## Architectural Layer
//!
//! **Business logic + port definitions.** No I/O dependencies. It defines
//! *what* is needed; infrastructure crates define *how* to supply it.
//!
//! ## Module Layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`identifiers`] | Newtype domain identifiers (`NodeId`, `EdgeId`, `PipelineRunId`, etc.) |
//! | [`types`] | Shared value types (`TokenCost`, `CostBudget`, `AlignmentScore`, `Diagnostic`, etc.) |
//! | [`errors`] | `CogWorksError`, `NodeFailure`, `RetryPolicy` |
//! | [`graph`] | Graph description, validated `PipelineGraph`, default graph |
//! | [`condition`] | Edge conditions and the deterministic expression language |
//! | [`schema`] | Output schemas for generative nodes |
//! | [`budget`] | Shared `BudgetTracker` and per-node `NodeBudget` |
//! | [`ledger`] | Per-node retry and rework counters |
//! | [`alignment`] | Alignment findings, results and structural checks |
//! | [`state`] | `PipelineRun`, `NodeState`, snapshots and expression resolution |
//! | [`report`] | `RunReport`, `StatusUpdate`, `Escalation` |
//! | [`ports`] | `LlmProvider`, `DomainServiceClient`, `StateStore`, `WorkItemTracker`, `GraphLoader` |

pub mod alignment;
pub mod budget;
pub mod condition;
pub mod errors;
pub mod graph;
pub mod identifiers;
pub mod ledger;
pub mod ports;
pub mod report;
pub mod schema;
pub mod state;
pub mod types;

// Re-export the most used items at the crate root.
pub use errors::{CogWorksError, FailureKind, NodeFailure, RetryPolicy};
pub use identifiers::{
    ArtifactPath, DelegateId, DomainServiceName, EdgeId, NodeId, PipelineName, PipelineRunId,
    SubWorkItemId, WorkItemId,
};
pub use types::{
    AlignmentScore, CostBudget, Diagnostic, DiagnosticCategory, DiagnosticSeverity, Timestamp,
    TokenCost, TokenCount,
};

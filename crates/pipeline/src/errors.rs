//! Top-level error and retry-policy types for the CogWorks pipeline domain.
//!
//! [`CogWorksError`] covers conditions that halt or escalate the pipeline run.
//! [`NodeFailure`] is the terminal failure recorded against one node; it is
//! persisted in run snapshots and surfaces through [`CogWorksError::NodeFailed`].
//! Port-level errors (LLM delegate, domain service, state store, tracker) are
//! defined next to their traits in [`crate::ports`].
//!
//! [`RetryPolicy`] is a cross-cutting concern: any error type that participates
//! in retry decisions must be able to produce a [`RetryPolicy`].

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::alignment::AlignmentFinding;
use crate::budget::BudgetBreakdown;
use crate::graph::GraphValidationError;
use crate::ledger::{AttemptError, ReworkRecord};
use crate::{EdgeId, NodeId, TokenCost};

// ---------------------------------------------------------------------------
// Retry semantics
// ---------------------------------------------------------------------------

/// Whether an error condition is safe to retry and, if so, after what delay.
///
/// Returned by infrastructure error types to let the orchestrator decide
/// whether to re-invoke an operation without escalating.
///
/// - `Retryable` errors: API timeouts, transient rate-limit responses.
/// - `NonRetryable` errors: budget exceeded, invalid configuration, rejected
///   requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RetryPolicy {
    /// The operation may be retried.
    ///
    /// `after` optionally specifies the minimum delay before retrying (e.g.
    /// derived from `Retry-After` response headers).
    Retryable {
        /// Minimum back-off before the next attempt. `None` means apply the
        /// caller's own back-off schedule.
        after: Option<Duration>,
    },
    /// The operation must not be retried; escalation or pipeline halt is required.
    NonRetryable,
}

// ---------------------------------------------------------------------------
// Node-level failures
// ---------------------------------------------------------------------------

/// Discriminant of a [`NodeFailure`], used in logs, reports and assertions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    RetryExhausted,
    ReworkExhausted,
    BudgetExceeded,
    Infrastructure,
    Rejected,
    GateRejected,
    Blocked,
    AbortedBySibling,
}

impl FailureKind {
    /// Returns the snake_case name used in expressions and reports.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RetryExhausted => "retry_exhausted",
            Self::ReworkExhausted => "rework_exhausted",
            Self::BudgetExceeded => "budget_exceeded",
            Self::Infrastructure => "infrastructure",
            Self::Rejected => "rejected",
            Self::GateRejected => "gate_rejected",
            Self::Blocked => "blocked",
            Self::AbortedBySibling => "aborted_by_sibling",
        }
    }

    /// Returns `true` if a failure of this kind is handed to a human through
    /// an escalation rather than halting the run outright.
    pub fn escalates(self) -> bool {
        matches!(
            self,
            Self::RetryExhausted | Self::ReworkExhausted | Self::BudgetExceeded | Self::Infrastructure
        )
    }
}

/// Why a node entered the `failed` (or `blocked`) state.
///
/// "Could not produce valid output" ([`NodeFailure::RetryExhausted`]) and
/// "could not produce aligned output" ([`NodeFailure::ReworkExhausted`]) are
/// kept structurally distinct all the way to the final run report.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeFailure {
    /// Output was technically invalid on every attempt.
    #[error("retry budget exhausted after {} invalid attempt(s)", .attempts.len())]
    RetryExhausted {
        /// Every attempt's error, oldest first.
        attempts: Vec<AttemptError>,
    },

    /// Output was valid but failed alignment verification on every rework.
    #[error("rework budget exhausted after {} misaligned attempt(s)", .history.len())]
    ReworkExhausted {
        /// Findings of the final alignment check.
        findings: Vec<AlignmentFinding>,
        /// Every rework's alignment outcome, oldest first.
        history: Vec<ReworkRecord>,
    },

    /// A budget reservation was denied.
    #[error("budget reservation of {requested} denied ({} of {} consumed)", .breakdown.consumed, .breakdown.limit)]
    BudgetExceeded {
        /// Amount the denied reservation asked for.
        requested: TokenCost,
        /// Cost breakdown at the time of denial.
        breakdown: BudgetBreakdown,
    },

    /// A delegated call kept failing with transport or timeout errors.
    #[error("infrastructure failure in {operation} after {attempts} attempt(s): {message}")]
    Infrastructure {
        /// The delegated operation that failed (e.g. `"generate"`, `"alignment"`).
        operation: String,
        /// Number of attempts made before giving up.
        attempts: u32,
        /// Last error message.
        message: String,
    },

    /// A collaborator rejected the request in a way retrying cannot fix.
    #[error("request rejected: {message}")]
    Rejected {
        /// Description from the collaborator.
        message: String,
    },

    /// A human gate was explicitly rejected.
    #[error("human gate rejected")]
    GateRejected,

    /// A required input failed permanently upstream.
    #[error("blocked by failed upstream node '{upstream}'")]
    Blocked {
        /// The upstream node whose failure blocks this one.
        upstream: NodeId,
    },

    /// A sibling marked `abort_siblings_on_failure` failed while this node ran.
    #[error("aborted after sibling '{sibling}' failed")]
    AbortedBySibling {
        /// The failing sibling.
        sibling: NodeId,
    },
}

impl NodeFailure {
    /// Returns the discriminant of this failure.
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::RetryExhausted { .. } => FailureKind::RetryExhausted,
            Self::ReworkExhausted { .. } => FailureKind::ReworkExhausted,
            Self::BudgetExceeded { .. } => FailureKind::BudgetExceeded,
            Self::Infrastructure { .. } => FailureKind::Infrastructure,
            Self::Rejected { .. } => FailureKind::Rejected,
            Self::GateRejected => FailureKind::GateRejected,
            Self::Blocked { .. } => FailureKind::Blocked,
            Self::AbortedBySibling { .. } => FailureKind::AbortedBySibling,
        }
    }
}

// ---------------------------------------------------------------------------
// Pipeline-level errors
// ---------------------------------------------------------------------------

/// Errors that halt or escalate the pipeline itself.
///
/// These are distinct from per-component errors (LLM provider failure, tracker
/// failure) in that they represent conditions the pipeline cannot recover from
/// within its normal retry/rework budget.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum CogWorksError {
    /// The graph description is malformed. Always surfaced before any cost is spent.
    #[error("Graph validation failed: {0}")]
    Validation(#[from] GraphValidationError),

    /// A node failed terminally.
    #[error("Node '{node}' failed: {failure}")]
    NodeFailed {
        /// The failing node.
        node: NodeId,
        /// Why it failed.
        failure: NodeFailure,
    },

    /// No node is eligible, none is executing, and no terminal node was reached.
    #[error("Dead end: no eligible node and no terminal node reached (pending: {})", join_ids(.pending))]
    DeadEnd {
        /// Nodes still waiting for inputs or activation.
        pending: Vec<NodeId>,
        /// Nodes completed so far.
        completed: Vec<NodeId>,
    },

    /// A rework edge exceeded its traversal bound and its overflow policy halts the run.
    #[error("Rework edge '{edge}' exceeded {max_traversals} traversal(s)")]
    CycleLimitReached {
        /// The bounded back-edge.
        edge: EdgeId,
        /// Its configured bound.
        max_traversals: u32,
    },

    /// Edge evaluation for a completed node could not produce a decision.
    #[error("Edge evaluation for node '{node}' failed: {message}")]
    EdgeEvaluation {
        /// The completed node whose outgoing edges were evaluated.
        node: NodeId,
        /// Description of the failure.
        message: String,
    },

    /// The run snapshot could not be read or written.
    #[error("State persistence failed: {message}")]
    StatePersistence {
        /// Description of the store failure.
        message: String,
    },

    /// The pipeline configuration or runtime configuration is invalid.
    ///
    /// Produced at load time; the pipeline never starts with an invalid config.
    #[error("Configuration error: {message}")]
    ConfigurationError {
        /// Description of the configuration problem.
        message: String,
    },
}

impl CogWorksError {
    /// Returns `true` if this error should be handed to a human via escalation.
    pub fn escalates(&self) -> bool {
        match self {
            Self::NodeFailed { failure, .. } => failure.kind().escalates(),
            Self::DeadEnd { .. } => true,
            _ => false,
        }
    }
}

fn join_ids(ids: &[NodeId]) -> String {
    ids.iter().map(NodeId::as_str).collect::<Vec<_>>().join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_kind_retry_and_rework_expected_distinct() {
        let retry = NodeFailure::RetryExhausted { attempts: Vec::new() };
        let rework = NodeFailure::ReworkExhausted {
            findings: Vec::new(),
            history: Vec::new(),
        };
        assert_ne!(retry.kind(), rework.kind());
        assert_eq!(retry.kind().as_str(), "retry_exhausted");
        assert_eq!(rework.kind().as_str(), "rework_exhausted");
    }

    #[test]
    fn node_failure_serde_expected_kind_tag() {
        let failure = NodeFailure::Blocked {
            upstream: NodeId::new("planning").expect("non-empty"),
        };
        let json = serde_json::to_value(&failure).expect("serialise");
        assert_eq!(json["kind"], "blocked");
        let back: NodeFailure = serde_json::from_value(json).expect("deserialise");
        assert_eq!(back, failure);
    }

    #[test]
    fn cogworks_error_dead_end_expected_escalates() {
        let error = CogWorksError::DeadEnd {
            pending: vec![NodeId::new("review").expect("non-empty")],
            completed: Vec::new(),
        };
        assert!(error.escalates());
        assert!(error.to_string().contains("review"));
        let limit = CogWorksError::CycleLimitReached {
            edge: EdgeId::new("review_rework").expect("non-empty"),
            max_traversals: 3,
        };
        assert!(!limit.escalates());
    }
}

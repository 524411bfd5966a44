//! Values posted to the work-item tracker and returned to the caller.

use serde::{Deserialize, Serialize};

use crate::budget::BudgetBreakdown;
use crate::errors::{CogWorksError, FailureKind, NodeFailure};
use crate::ledger::{AttemptError, ReworkRecord};
use crate::state::{NodeStatus, PipelineRun, RunStatus};
use crate::{NodeId, PipelineName, PipelineRunId, Timestamp, TokenCost, WorkItemId};

/// A status change, posted at node boundaries and at the end of an invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub run_id: PipelineRunId,
    pub work_item: WorkItemId,
    /// `None` for run-level updates.
    #[serde(default)]
    pub node: Option<NodeId>,
    pub status: String,
    pub message: String,
    pub cost: TokenCost,
    pub at: Timestamp,
}

/// What one node tried before failing, as carried in an escalation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeAttempts {
    pub node: NodeId,
    pub status: NodeStatus,
    pub retries: u32,
    pub reworks: u32,
    #[serde(default)]
    pub attempt_errors: Vec<AttemptError>,
    #[serde(default)]
    pub rework_history: Vec<ReworkRecord>,
    #[serde(default)]
    pub failure: Option<NodeFailure>,
}

/// Structured hand-off to a human: what was tried, every failure, and the
/// accumulated cost.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Escalation {
    pub run_id: PipelineRunId,
    pub work_item: WorkItemId,
    pub pipeline: PipelineName,
    pub reason: CogWorksError,
    pub nodes: Vec<NodeAttempts>,
    pub budget: BudgetBreakdown,
    pub at: Timestamp,
}

impl Escalation {
    /// Builds an escalation from the run's current state. Only nodes that
    /// consumed retries or reworks, or that failed, are listed.
    pub fn from_run(run: &PipelineRun, reason: CogWorksError) -> Self {
        let nodes = run
            .node_states()
            .iter()
            .filter(|state| {
                state.ledger.attempts() > 0 || state.failure.is_some()
            })
            .map(|state| NodeAttempts {
                node: state.node.clone(),
                status: state.status,
                retries: state.ledger.retries(),
                reworks: state.ledger.reworks(),
                attempt_errors: state.ledger.attempt_errors().to_vec(),
                rework_history: state.ledger.rework_history().to_vec(),
                failure: state.failure.clone(),
            })
            .collect();
        Self {
            run_id: run.run_id(),
            work_item: run.work_item(),
            pipeline: run.pipeline().clone(),
            reason,
            nodes,
            budget: run.budget().clone(),
            at: Timestamp::now(),
        }
    }
}

/// Outcome of one engine invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: PipelineRunId,
    pub work_item: WorkItemId,
    pub pipeline: PipelineName,
    pub status: RunStatus,
    #[serde(default)]
    pub error: Option<CogWorksError>,
    pub completed: Vec<NodeId>,
    #[serde(default)]
    pub failed: Vec<(NodeId, FailureKind)>,
    #[serde(default)]
    pub blocked: Vec<NodeId>,
    /// Human-gated nodes waiting for approval; non-empty only while the run
    /// is still `running`.
    #[serde(default)]
    pub awaiting_approval: Vec<NodeId>,
    pub budget: BudgetBreakdown,
    /// Edge evaluations where a judged condition fell back to its static value.
    #[serde(default)]
    pub fallbacks_applied: usize,
}

impl RunReport {
    pub fn from_run(run: &PipelineRun, awaiting_approval: Vec<NodeId>) -> Self {
        let failed = run
            .node_states()
            .iter()
            .filter(|state| state.status == NodeStatus::Failed)
            .filter_map(|state| {
                state
                    .failure
                    .as_ref()
                    .map(|failure| (state.node.clone(), failure.kind()))
            })
            .collect();
        Self {
            run_id: run.run_id(),
            work_item: run.work_item(),
            pipeline: run.pipeline().clone(),
            status: run.status(),
            error: run.terminal_error().cloned(),
            completed: run.nodes_with_status(NodeStatus::Completed),
            failed,
            blocked: run.nodes_with_status(NodeStatus::Blocked),
            awaiting_approval,
            budget: run.budget().clone(),
            fallbacks_applied: run
                .edge_log()
                .iter()
                .filter(|record| record.fallback_applied())
                .count(),
        }
    }

    /// `true` when the invocation stopped only because human gates are pending.
    pub fn is_awaiting_approval(&self) -> bool {
        self.status == RunStatus::Running && !self.awaiting_approval.is_empty()
    }

    /// One-line summary for logs and status posts.
    pub fn summary(&self) -> String {
        let mut line = format!(
            "run {} {}: {} completed, {} failed, {} blocked, cost {} of {}",
            self.run_id,
            self.status,
            self.completed.len(),
            self.failed.len(),
            self.blocked.len(),
            self.budget.consumed,
            self.budget.limit
        );
        if let Some(error) = &self.error {
            line.push_str(&format!(" ({error})"));
        }
        if self.is_awaiting_approval() {
            let names: Vec<&str> = self.awaiting_approval.iter().map(NodeId::as_str).collect();
            line.push_str(&format!(", awaiting approval of {}", names.join(", ")));
        }
        line
    }
}

//! Pipeline run state: per-node status, cycle counters and snapshots.
//!
//! A [`PipelineRun`] is the only state an invocation needs. It is rebuilt from
//! the state store at the start of every invocation, mutated at node
//! boundaries, written back as a full JSON snapshot, and never changed again
//! once its status is terminal.
//!
//! Node states are stored in graph order so a [`NodeIndex`] addresses them
//! directly; snapshots record the node name alongside each state and are
//! rejected if they do not line up with the graph they are loaded against.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::alignment::AlignmentResult;
use crate::budget::BudgetBreakdown;
use crate::condition::{lookup, FieldPath, FieldResolver, PathRoot};
use crate::errors::{CogWorksError, FailureKind, NodeFailure};
use crate::graph::{EdgeIndex, NodeIndex, PipelineGraph, StatePreservation};
use crate::ledger::AttemptLedger;
use crate::ports::Feedback;
use crate::{
    DelegateId, EdgeId, NodeId, PipelineName, PipelineRunId, SubWorkItemId, Timestamp, TokenCost,
    WorkItemId,
};

/// Snapshot layout version written with every snapshot.
pub const SNAPSHOT_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Statuses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Eligible,
    Executing,
    Completed,
    Failed,
    /// A required input failed permanently; this node can never run.
    Blocked,
}

impl NodeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Eligible => "eligible",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
        }
    }

    /// `failed` and `blocked` are terminal within a run; only a restart clears them.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Blocked)
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    NotStarted,
    Running,
    Succeeded,
    Failed,
    Escalated,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Escalated => "escalated",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Escalated | Self::Cancelled
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Node state
// ---------------------------------------------------------------------------

/// Mutable state of one node within one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeState {
    pub node: NodeId,
    pub status: NodeStatus,
    /// Set when the run starts (entry nodes) or an incoming edge is taken.
    #[serde(default)]
    pub activated: bool,
    /// A human gate approval observed through the tracker. Never inferred.
    #[serde(default)]
    pub gate_approved: bool,
    #[serde(default)]
    pub ledger: AttemptLedger,
    #[serde(default)]
    pub last_output: Option<Value>,
    #[serde(default)]
    pub last_alignment: Option<AlignmentResult>,
    /// Most recent non-terminal error, e.g. a failed sub-work-item creation.
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub failure: Option<NodeFailure>,
    /// Feedback waiting for the next execution, set when a rework edge
    /// routes back into this node.
    #[serde(default)]
    pub feedback: Vec<Feedback>,
    #[serde(default)]
    pub completions: u32,
    #[serde(default)]
    pub sub_work_items: Vec<SubWorkItemId>,
    /// Delegate that produced `last_output`.
    #[serde(default)]
    pub producer: Option<DelegateId>,
    pub updated_at: Timestamp,
}

impl NodeState {
    fn new(node: NodeId) -> Self {
        Self {
            node,
            status: NodeStatus::Pending,
            activated: false,
            gate_approved: false,
            ledger: AttemptLedger::new(),
            last_output: None,
            last_alignment: None,
            last_error: None,
            failure: None,
            feedback: Vec::new(),
            completions: 0,
            sub_work_items: Vec::new(),
            producer: None,
            updated_at: Timestamp::now(),
        }
    }

    fn touch(&mut self) {
        self.updated_at = Timestamp::now();
    }
}

// ---------------------------------------------------------------------------
// Edge evaluation audit records
// ---------------------------------------------------------------------------

/// One observable step of evaluating an edge condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EvaluationEvent {
    Expression { expression: String, result: bool },
    Judged { prompt: String, verdict: bool },
    /// The judged delegate was unavailable or unparseable; the static
    /// fallback decided.
    FallbackApplied {
        prompt: String,
        fallback: bool,
        reason: String,
    },
    /// The node output named this edge (or did not) in `next_edges`.
    Explicit { listed: bool },
}

/// Outcome of evaluating one outgoing edge of a completed node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeEvaluationRecord {
    pub edge: EdgeId,
    pub source: NodeId,
    pub taken: bool,
    #[serde(default)]
    pub events: Vec<EvaluationEvent>,
    pub at: Timestamp,
}

impl EdgeEvaluationRecord {
    /// Returns `true` if any judged sub-condition fell back to its static value.
    pub fn fallback_applied(&self) -> bool {
        self.events
            .iter()
            .any(|event| matches!(event, EvaluationEvent::FallbackApplied { .. }))
    }
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

/// Result of retaking a bounded rework edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Traversal {
    /// The edge was taken; the counter now holds `count`.
    Taken { count: u32 },
    /// The counter already equals `max_traversals`.
    Exhausted { count: u32 },
}

/// The complete, serialisable state of one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    snapshot_version: u32,
    run_id: PipelineRunId,
    work_item: WorkItemId,
    pipeline: PipelineName,
    fingerprint: String,
    status: RunStatus,
    #[serde(default)]
    input: Value,
    #[serde(default)]
    safety_classified: bool,
    nodes: Vec<NodeState>,
    #[serde(default)]
    cycle_counters: BTreeMap<EdgeId, u32>,
    budget: BudgetBreakdown,
    #[serde(default)]
    edge_log: Vec<EdgeEvaluationRecord>,
    #[serde(default)]
    terminal_error: Option<CogWorksError>,
    created_at: Timestamp,
    updated_at: Timestamp,
}

impl PipelineRun {
    /// Creates a fresh run with every node pending and entry nodes activated.
    pub fn new(
        run_id: PipelineRunId,
        work_item: WorkItemId,
        graph: &PipelineGraph,
        input: Value,
        safety_classified: bool,
        budget: BudgetBreakdown,
    ) -> Self {
        let mut nodes: Vec<NodeState> = graph
            .nodes()
            .map(|(_, definition)| NodeState::new(definition.id.clone()))
            .collect();
        for entry in graph.entry_nodes() {
            nodes[entry.index()].activated = true;
        }
        let now = Timestamp::now();
        Self {
            snapshot_version: SNAPSHOT_VERSION,
            run_id,
            work_item,
            pipeline: graph.name().clone(),
            fingerprint: graph.fingerprint().to_string(),
            status: RunStatus::NotStarted,
            input,
            safety_classified,
            nodes,
            cycle_counters: BTreeMap::new(),
            budget,
            edge_log: Vec::new(),
            terminal_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Serialises the full run.
    pub fn to_snapshot(&self) -> Result<Value, CogWorksError> {
        serde_json::to_value(self).map_err(|e| CogWorksError::StatePersistence {
            message: format!("failed to serialise run snapshot: {e}"),
        })
    }

    /// Rebuilds a run from a snapshot, checking it against `graph`.
    pub fn from_snapshot(snapshot: Value, graph: &PipelineGraph) -> Result<Self, CogWorksError> {
        let run: Self =
            serde_json::from_value(snapshot).map_err(|e| CogWorksError::StatePersistence {
                message: format!("failed to parse run snapshot: {e}"),
            })?;
        if run.snapshot_version != SNAPSHOT_VERSION {
            return Err(CogWorksError::StatePersistence {
                message: format!(
                    "snapshot version {} is not supported (expected {SNAPSHOT_VERSION})",
                    run.snapshot_version
                ),
            });
        }
        if run.fingerprint != graph.fingerprint() {
            return Err(CogWorksError::ConfigurationError {
                message: format!(
                    "run {} was started with graph fingerprint {} but the loaded graph is {}; restart the run to use the new graph",
                    run.run_id,
                    run.fingerprint,
                    graph.fingerprint()
                ),
            });
        }
        let lines_up = run.nodes.len() == graph.node_count()
            && graph
                .nodes()
                .all(|(index, definition)| run.nodes[index.index()].node == definition.id);
        if !lines_up {
            return Err(CogWorksError::StatePersistence {
                message: "snapshot node states do not match the graph".into(),
            });
        }
        Ok(run)
    }

    pub fn run_id(&self) -> PipelineRunId {
        self.run_id
    }

    pub fn work_item(&self) -> WorkItemId {
        self.work_item
    }

    pub fn pipeline(&self) -> &PipelineName {
        &self.pipeline
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn input(&self) -> &Value {
        &self.input
    }

    pub fn safety_classified(&self) -> bool {
        self.safety_classified
    }

    /// Marks the run as safety-classified. Sticky for the rest of the run.
    pub fn mark_safety_classified(&mut self) {
        self.safety_classified = true;
    }

    pub fn budget(&self) -> &BudgetBreakdown {
        &self.budget
    }

    pub fn set_budget(&mut self, budget: BudgetBreakdown) {
        self.budget = budget;
    }

    pub fn edge_log(&self) -> &[EdgeEvaluationRecord] {
        &self.edge_log
    }

    pub fn terminal_error(&self) -> Option<&CogWorksError> {
        self.terminal_error.as_ref()
    }

    pub fn state(&self, node: NodeIndex) -> &NodeState {
        &self.nodes[node.index()]
    }

    pub fn state_mut(&mut self, node: NodeIndex) -> &mut NodeState {
        self.updated_at = Timestamp::now();
        let state = &mut self.nodes[node.index()];
        state.touch();
        state
    }

    pub fn node_states(&self) -> &[NodeState] {
        &self.nodes
    }

    /// Moves a fresh run to `running`.
    pub fn start(&mut self) {
        if self.status == RunStatus::NotStarted {
            self.status = RunStatus::Running;
            self.updated_at = Timestamp::now();
        }
    }

    /// Records the terminal disposition. Has no effect on a run that is
    /// already terminal.
    pub fn finish(&mut self, status: RunStatus, error: Option<CogWorksError>) {
        if self.status.is_terminal() || !status.is_terminal() {
            return;
        }
        self.status = status;
        self.terminal_error = error;
        self.updated_at = Timestamp::now();
    }

    /// Turns nodes left `executing` by an interrupted invocation back into
    /// `eligible`. Counters are kept.
    pub fn resume_in_flight(&mut self) -> Vec<NodeId> {
        let mut resumed = Vec::new();
        for state in &mut self.nodes {
            if state.status == NodeStatus::Executing {
                state.status = NodeStatus::Eligible;
                state.touch();
                resumed.push(state.node.clone());
            }
        }
        resumed
    }

    /// Nodes whose inputs are satisfied: either already `eligible`, or
    /// `pending`, activated, and with every required input `completed`.
    /// Gate approval is checked by the caller.
    pub fn ready_nodes(&self, graph: &PipelineGraph) -> Vec<NodeIndex> {
        graph
            .nodes()
            .filter(|(index, definition)| {
                let state = self.state(*index);
                match state.status {
                    NodeStatus::Eligible => true,
                    NodeStatus::Pending => {
                        state.activated
                            && definition
                                .required_inputs
                                .iter()
                                .all(|input| self.state(*input).status == NodeStatus::Completed)
                    }
                    _ => false,
                }
            })
            .map(|(index, _)| index)
            .collect()
    }

    /// Marks every not-yet-run node whose required inputs include a failed or
    /// blocked node as `blocked`, transitively. Returns the newly blocked nodes.
    pub fn propagate_blocked(&mut self, graph: &PipelineGraph) -> Vec<NodeIndex> {
        let mut newly_blocked = Vec::new();
        loop {
            let next = graph.nodes().find_map(|(index, definition)| {
                let state = self.state(index);
                if !matches!(state.status, NodeStatus::Pending | NodeStatus::Eligible) {
                    return None;
                }
                definition
                    .required_inputs
                    .iter()
                    .find(|input| self.state(**input).status.is_terminal())
                    .map(|upstream| (index, self.state(*upstream).node.clone()))
            });
            let Some((index, upstream)) = next else {
                break;
            };
            let state = self.state_mut(index);
            state.status = NodeStatus::Blocked;
            state.failure = Some(NodeFailure::Blocked { upstream });
            newly_blocked.push(index);
        }
        newly_blocked
    }

    /// Applies an incoming taken edge to `node`. A completed node is reopened;
    /// failed and blocked nodes stay terminal. Returns `true` if the node is
    /// now activated and waiting to run.
    pub fn activate(&mut self, node: NodeIndex) -> bool {
        let state = self.state_mut(node);
        match state.status {
            NodeStatus::Pending => {
                state.activated = true;
                true
            }
            NodeStatus::Completed => {
                state.status = NodeStatus::Pending;
                state.activated = true;
                true
            }
            NodeStatus::Eligible | NodeStatus::Executing => true,
            NodeStatus::Failed | NodeStatus::Blocked => false,
        }
    }

    pub fn counter(&self, edge: &EdgeId) -> u32 {
        self.cycle_counters.get(edge).copied().unwrap_or(0)
    }

    /// Counts one traversal of a bounded edge if the bound allows it.
    pub fn traverse(&mut self, edge: &EdgeId, max_traversals: u32) -> Traversal {
        let count = self.cycle_counters.entry(edge.clone()).or_insert(0);
        if *count < max_traversals {
            *count += 1;
            Traversal::Taken { count: *count }
        } else {
            Traversal::Exhausted { count: *count }
        }
    }

    /// Resets the loop body of a retaken rework edge and activates its target
    /// with the source's output as rework feedback.
    pub fn restart_loop(&mut self, graph: &PipelineGraph, edge: EdgeIndex) {
        let definition = graph.edge(edge);
        let preserve = definition
            .rework
            .as_ref()
            .map(|rework| rework.preserve)
            .unwrap_or_default();
        let source_output = self.state(definition.source).last_output.clone();

        for &member in graph.loop_body(edge) {
            let state = self.state_mut(member);
            if !matches!(
                state.status,
                NodeStatus::Completed | NodeStatus::Pending | NodeStatus::Eligible
            ) {
                continue;
            }
            state.status = NodeStatus::Pending;
            state.activated = false;
            if preserve == StatePreservation::Reset {
                state.last_output = None;
                state.last_alignment = None;
            }
        }

        let source = graph.node(definition.source).id.clone();
        let target = self.state_mut(definition.target);
        target.feedback.push(Feedback::ReworkRequested {
            edge: definition.id.clone(),
            from: source,
            output: source_output.unwrap_or(Value::Null),
        });
        self.activate(definition.target);
    }

    pub fn record_edge_evaluation(&mut self, record: EdgeEvaluationRecord) {
        self.edge_log.push(record);
    }

    /// `true` once any terminal node has completed.
    pub fn terminal_reached(&self, graph: &PipelineGraph) -> bool {
        graph
            .node_indices()
            .any(|index| graph.is_terminal(index) && self.state(index).status == NodeStatus::Completed)
    }

    pub fn any_executing(&self) -> bool {
        self.nodes
            .iter()
            .any(|state| state.status == NodeStatus::Executing)
    }

    /// First failed node (in graph order) whose failure originated there
    /// rather than being inherited from a sibling or upstream.
    pub fn first_failure(&self) -> Option<(&NodeId, &NodeFailure)> {
        let originated = |state: &&NodeState| {
            state.status == NodeStatus::Failed
                && state.failure.as_ref().is_some_and(|failure| {
                    !matches!(
                        failure.kind(),
                        FailureKind::Blocked | FailureKind::AbortedBySibling
                    )
                })
        };
        self.nodes
            .iter()
            .find(originated)
            .or_else(|| self.nodes.iter().find(|s| s.status == NodeStatus::Failed))
            .and_then(|state| state.failure.as_ref().map(|failure| (&state.node, failure)))
    }

    pub fn nodes_with_status(&self, status: NodeStatus) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|state| state.status == status)
            .map(|state| state.node.clone())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Expression resolution
// ---------------------------------------------------------------------------

/// Read-only view of a run used to resolve expression paths for the outgoing
/// edges of `current`.
pub struct RunView<'a> {
    pub graph: &'a PipelineGraph,
    pub run: &'a PipelineRun,
    pub current: NodeIndex,
    /// Committed pipeline cost at evaluation time.
    pub cost: TokenCost,
}

impl FieldResolver for RunView<'_> {
    fn resolve(&self, path: &FieldPath) -> Option<Value> {
        match path.root {
            PathRoot::Output => {
                let output = self.run.state(self.current).last_output.as_ref()?;
                lookup(output, &path.segments).cloned()
            }
            PathRoot::Alignment => {
                let alignment = self.run.state(self.current).last_alignment.as_ref()?;
                match path.segments.first()?.as_str() {
                    "aligned" => Some(Value::Bool(alignment.aligned())),
                    "score" => serde_json::to_value(alignment.score().as_f64()).ok(),
                    "threshold" => serde_json::to_value(alignment.threshold().as_f64()).ok(),
                    "bias_risk" => Some(Value::Bool(alignment.bias_risk())),
                    _ => None,
                }
            }
            PathRoot::Run => match path.segments.first()?.as_str() {
                "cost" => serde_json::to_value(self.cost.as_f64()).ok(),
                "safety_classified" => Some(Value::Bool(self.run.safety_classified())),
                "status" => Some(Value::String(self.run.status().as_str().into())),
                _ => None,
            },
            PathRoot::Nodes => {
                let (name, rest) = path.segments.split_first()?;
                let state = self.run.state(self.graph.node_index(name)?);
                let (field, rest) = rest.split_first()?;
                match field.as_str() {
                    "status" => Some(Value::String(state.status.as_str().into())),
                    "attempts" => Some(Value::from(state.ledger.retries())),
                    "reworks" => Some(Value::from(state.ledger.reworks())),
                    "completions" => Some(Value::from(state.completions)),
                    "output" => lookup(state.last_output.as_ref()?, rest).cloned(),
                    _ => None,
                }
            }
        }
    }
}

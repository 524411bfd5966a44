//! Port traits: the narrow interfaces through which the engine reaches its
//! external collaborators.
//!
//! | Port | Implemented by |
//! |------|----------------|
//! | [`LlmProvider`] | `llm` crate (Anthropic), test doubles |
//! | [`DomainServiceClient`] | `extension-api` crate (HTTP), test doubles |
//! | [`StateStore`] | `nodes::memory::InMemoryStateStore`, `cli` file store |
//! | [`WorkItemTracker`] | `cli` local tracker, test doubles |
//! | [`GraphLoader`] | `cli` TOML loader |
//!
//! All traits use `async_trait` so they can be held as `Arc<dyn Trait>`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::alignment::AlignmentFinding;
use crate::errors::{CogWorksError, RetryPolicy};
use crate::graph::{default_graph, GraphDescription, PipelineGraph};
use crate::report::{Escalation, StatusUpdate};
use crate::schema::OutputSchema;
use crate::{
    DelegateId, Diagnostic, DomainServiceName, EdgeId, NodeId, PipelineRunId, SubWorkItemId,
    TokenCost, TokenCount, WorkItemId,
};

/// Errors that can be classified for the infrastructure retry loop.
pub trait Retryable {
    /// Whether the failed operation may be attempted again, and when.
    fn retry_policy(&self) -> RetryPolicy;
}

// ---------------------------------------------------------------------------
// LLM delegate
// ---------------------------------------------------------------------------

/// Feedback handed to the delegate on re-execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Feedback {
    /// The previous output was technically invalid.
    InvalidOutput {
        /// 1-based attempt that produced the invalid output.
        attempt: u32,
        errors: Vec<String>,
    },
    /// The previous output was valid but misaligned with the input.
    Misaligned {
        /// Reworks consumed so far, including this one.
        rework: u32,
        findings: Vec<AlignmentFinding>,
    },
    /// A downstream node routed the work back through a rework edge.
    ReworkRequested {
        edge: EdgeId,
        /// Node whose edge sent the work back.
        from: NodeId,
        /// That node's output, typically review comments.
        output: Value,
    },
}

/// Why the delegate is being asked to generate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeneratePurpose {
    /// Produce the node's output.
    Produce,
    /// Decide which auxiliary work items to create; output is
    /// `{"items": [{"title": ..., "body": ...}]}`.
    Spawn,
}

/// One content generation call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub run_id: PipelineRunId,
    /// Node being executed.
    pub node: NodeId,
    pub purpose: GeneratePurpose,
    /// The node's configured instructions.
    pub instructions: String,
    /// Outputs of the node's required inputs keyed by node name, plus `work_item`.
    pub input: Value,
    /// Every earlier error and finding of this execution, oldest first.
    #[serde(default)]
    pub feedback: Vec<Feedback>,
    /// Output of the last misaligned or reworked attempt, if kept.
    #[serde(default)]
    pub previous_output: Option<Value>,
    /// Expected output shape, included in the prompt.
    #[serde(default)]
    pub output_schema: Option<OutputSchema>,
    /// The call must not cost more than this; it is what was reserved.
    pub cost_ceiling: TokenCost,
}

/// A successful generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Generated {
    /// Parsed JSON output.
    pub output: Value,
    /// Actual cost, settled against the reservation.
    pub cost: TokenCost,
    pub tokens: TokenCount,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JudgePurpose {
    /// Adversarial semantic alignment check; a score is expected.
    Alignment,
    /// Natural-language edge condition; a verdict is expected.
    EdgeCondition { edge: EdgeId },
}

/// One judging call: an alignment check or a natural-language edge condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeRequest {
    pub run_id: PipelineRunId,
    /// Node whose output is judged.
    pub node: NodeId,
    pub purpose: JudgePurpose,
    /// Judging criteria or the condition prompt.
    pub instructions: String,
    /// What the node was given.
    pub input: Value,
    /// What the node produced.
    pub output: Value,
    /// The call must not cost more than this.
    pub cost_ceiling: TokenCost,
}

/// A judge's answer. Which fields are set depends on the purpose.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Judgement {
    /// Edge condition answer. `None` means the judge gave no usable verdict.
    #[serde(default)]
    pub verdict: Option<bool>,
    /// Alignment score in `[0, 1]`; clamped by the verifier.
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub findings: Vec<AlignmentFinding>,
    pub cost: TokenCost,
}

/// Failure of a delegated LLM call.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DelegateError {
    /// Network, timeout, rate limit or server error.
    #[error("delegate transport error: {message}")]
    Transport { message: String, policy: RetryPolicy },
    /// The delegate answered, but the answer could not be used.
    #[error("delegate returned invalid output: {message}")]
    InvalidOutput { message: String, cost: TokenCost },
    /// The request was refused (authentication, malformed request, policy).
    #[error("delegate rejected the request: {message}")]
    Rejected { message: String },
}

impl DelegateError {
    /// Cost already incurred by the failed call.
    pub fn cost(&self) -> TokenCost {
        match self {
            Self::InvalidOutput { cost, .. } => *cost,
            _ => TokenCost::zero(),
        }
    }
}

impl Retryable for DelegateError {
    fn retry_policy(&self) -> RetryPolicy {
        match self {
            Self::Transport { policy, .. } => policy.clone(),
            Self::InvalidOutput { .. } | Self::Rejected { .. } => RetryPolicy::NonRetryable,
        }
    }
}

/// Content generation and judging delegate.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider and model identity, compared to detect self-judging.
    fn identity(&self) -> DelegateId;

    /// Produces a node output or a spawning decision.
    async fn generate(&self, request: GenerateRequest) -> Result<Generated, DelegateError>;

    /// Scores alignment or answers an edge condition.
    async fn judge(&self, request: JudgeRequest) -> Result<Judgement, DelegateError>;
}

// ---------------------------------------------------------------------------
// Domain services
// ---------------------------------------------------------------------------

/// One call to a domain service on behalf of a deterministic node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationRequest {
    pub run_id: PipelineRunId,
    pub node: NodeId,
    /// Configured service to call.
    pub service: DomainServiceName,
    /// Service-specific operation from the node configuration.
    #[serde(default)]
    pub operation: Option<String>,
    /// The node input: required outputs plus the work item.
    pub input: Value,
}

/// What a domain service found.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    #[serde(default)]
    pub findings: Vec<Diagnostic>,
    /// Structured result; becomes the node output with `diagnostics` added.
    #[serde(default)]
    pub output: Value,
}

impl ValidationReport {
    /// `true` if any finding is blocking.
    pub fn has_blocking(&self) -> bool {
        self.findings.iter().any(Diagnostic::is_blocking)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("domain service '{service}' failed: {message}")]
pub struct DomainServiceError {
    pub service: DomainServiceName,
    /// Transport or service error text.
    pub message: String,
    /// Whether the same request may succeed if retried.
    pub recoverable: bool,
}

impl Retryable for DomainServiceError {
    fn retry_policy(&self) -> RetryPolicy {
        if self.recoverable {
            RetryPolicy::Retryable { after: None }
        } else {
            RetryPolicy::NonRetryable
        }
    }
}

/// Deterministic validation and simulation tooling.
#[async_trait]
pub trait DomainServiceClient: Send + Sync {
    /// Runs one validation or simulation request.
    async fn validate(&self, request: ValidationRequest) -> Result<ValidationReport, DomainServiceError>;
}

// ---------------------------------------------------------------------------
// State store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("state store error: {message}")]
pub struct StateStoreError {
    /// Underlying storage error text.
    pub message: String,
}

/// Durable storage of run snapshots as opaque JSON.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Latest snapshot of the run, or `None` if it was never written.
    async fn read_state(&self, run_id: PipelineRunId) -> Result<Option<Value>, StateStoreError>;

    /// Replaces the stored snapshot. Must be atomic: a reader sees the old
    /// snapshot or the new one, never a mix.
    async fn write_state(&self, run_id: PipelineRunId, snapshot: Value) -> Result<(), StateStoreError>;
}

// ---------------------------------------------------------------------------
// Work-item tracker
// ---------------------------------------------------------------------------

/// Approval state of a human gate. `Pending` is the answer whenever no
/// explicit decision exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateSignal {
    /// A human approved the node.
    Approved,
    /// A human rejected the node; the run fails.
    Rejected,
    /// No decision yet.
    Pending,
}

/// A work item a spawning node decided to create.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubWorkItemRequest {
    /// Work item of the run that spawned it.
    pub parent: WorkItemId,
    pub run_id: PipelineRunId,
    /// Spawning node that decided on it.
    pub node: NodeId,
    pub title: String,
    pub body: String,
}

/// Failure of a tracker call.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("work item tracker error: {message}")]
pub struct TrackerError {
    pub message: String,
    /// Whether the call may be retried.
    pub policy: RetryPolicy,
}

impl Retryable for TrackerError {
    fn retry_policy(&self) -> RetryPolicy {
        self.policy.clone()
    }
}

/// Issue tracker / PR system used for gates, status and escalations.
#[async_trait]
pub trait WorkItemTracker: Send + Sync {
    /// Current approval state of a gated node. Absence of a decision is
    /// `Pending`, never approval.
    async fn gate_signal(&self, work_item: WorkItemId, node: &NodeId) -> Result<GateSignal, TrackerError>;

    /// Announces a node or run status change.
    async fn post_status(&self, update: StatusUpdate) -> Result<(), TrackerError>;

    /// Hands an escalated run to a human.
    async fn post_escalation(&self, escalation: Escalation) -> Result<(), TrackerError>;

    /// Creates an auxiliary work item and returns its tracker id.
    async fn create_sub_work_item(&self, request: SubWorkItemRequest) -> Result<SubWorkItemId, TrackerError>;
}

// ---------------------------------------------------------------------------
// Graph loader
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    /// No description exists at the source; the default graph applies.
    #[error("no graph description found at '{location}'")]
    NotFound { location: String },
    /// The description exists but is not valid TOML or JSON.
    #[error("graph description at '{location}' could not be parsed: {message}")]
    Parse { location: String, message: String },
    /// The description exists but could not be read.
    #[error("graph description at '{location}' could not be read: {message}")]
    Io { location: String, message: String },
}

/// Produces raw graph descriptions. The engine only ever consumes the
/// validated [`PipelineGraph`].
#[async_trait]
pub trait GraphLoader: Send + Sync {
    /// Reads the description at `source`; `NotFound` when there is none.
    async fn load(&self, source: &str) -> Result<GraphDescription, LoadError>;
}

/// Loads and validates the graph at `source`, substituting the default graph
/// when there is none.
pub async fn load_pipeline_graph(
    loader: &dyn GraphLoader,
    source: &str,
) -> Result<PipelineGraph, CogWorksError> {
    match loader.load(source).await {
        Ok(description) => Ok(PipelineGraph::from_description(&description)?),
        Err(LoadError::NotFound { .. }) => {
            tracing::info!(source, "No graph description found, using the default graph");
            Ok(default_graph()?)
        }
        Err(error) => Err(CogWorksError::ConfigurationError {
            message: error.to_string(),
        }),
    }
}

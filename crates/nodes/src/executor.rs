//! Node executor: runs one node to a terminal outcome.
//!
//! The executor owns the two-tier failure model for a single node:
//!
//! - **Retry**: technically invalid output (delegate could not produce valid
//!   JSON, schema violation, blocking service diagnostics). Re-executes with
//!   the errors as feedback until `max_retries` is exceeded.
//! - **Rework**: valid output that fails alignment. Re-executes with the
//!   findings as feedback until `max_reworks` is exceeded.
//!
//! Transport-level failures are handled one tier lower by
//! [`retry_infrastructure`] and never consume either budget. The executor does
//! not touch run state; it returns a [`NodeOutcome`] that the engine records.

use std::sync::{Arc, OnceLock};

use pipeline::alignment::AlignmentResult;
use pipeline::budget::{BudgetDenied, NodeBudget};
use pipeline::graph::{NodeDefinition, NodeIndex, NodeKind, SpawningConfig};
use pipeline::ledger::{AttemptLedger, LedgerDecision};
use pipeline::ports::{
    DelegateError, DomainServiceClient, DomainServiceError, Feedback, GeneratePurpose,
    GenerateRequest, LlmProvider, Retryable, SubWorkItemRequest, ValidationRequest,
    WorkItemTracker,
};
use pipeline::{
    DelegateId, Diagnostic, DomainServiceName, NodeFailure, NodeId, PipelineRunId, RetryPolicy,
    SubWorkItemId, WorkItemId,
};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::alignment::{AlignmentVerifier, VerificationError, VerificationRequest};
use crate::retry::{retry_infrastructure, RetryBackoffConfig};

// ---------------------------------------------------------------------------
// Sibling abort signal
// ---------------------------------------------------------------------------

/// Raised when a sibling marked `abort_siblings_on_failure` fails. The node
/// finishes its in-flight call, then fails with `AbortedBySibling`.
#[derive(Debug, Default)]
pub struct AbortSignal {
    token: CancellationToken,
    cause: OnceLock<NodeId>,
}

impl AbortSignal {
    /// Not yet signalled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Signals the node. The first sibling to abort is the recorded cause.
    pub fn abort(&self, sibling: NodeId) {
        let _ = self.cause.set(sibling);
        self.token.cancel();
    }

    /// The sibling that caused the abort, once signalled.
    pub fn aborted_by(&self) -> Option<&NodeId> {
        if self.token.is_cancelled() {
            self.cause.get()
        } else {
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Job and outcome
// ---------------------------------------------------------------------------

/// Everything a node execution needs, detached from the run so it can be
/// moved into its own task.
pub struct NodeJob {
    pub run_id: PipelineRunId,
    pub work_item: WorkItemId,
    pub index: NodeIndex,
    pub definition: NodeDefinition,
    /// Outputs of the required inputs keyed by node name, plus `work_item`.
    pub input: Value,
    pub ledger: AttemptLedger,
    /// Feedback carried in from a rework edge. Each failed attempt appends its
    /// own entry, so later attempts see every earlier error.
    pub feedback: Vec<Feedback>,
    pub previous_output: Option<Value>,
    pub safety_classified: bool,
    pub budget: NodeBudget,
    pub abort: Arc<AbortSignal>,
}

/// A completed node execution.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSuccess {
    /// The node output, published to downstream nodes and edge conditions.
    pub output: Value,
    /// Final alignment result, when the node has alignment checks.
    pub alignment: Option<AlignmentResult>,
    /// Work items a spawning node decided on. The engine creates them after
    /// recording the node, alongside downstream execution.
    pub sub_work_items: Vec<SubWorkItemRequest>,
}

/// What came of creating the work items one spawning node decided on.
#[derive(Debug, Clone, PartialEq)]
pub struct SubWorkItems {
    /// The spawning node.
    pub index: NodeIndex,
    /// Items the tracker created, in request order.
    pub created: Vec<SubWorkItemId>,
    /// One message per item that could not be created.
    pub errors: Vec<String>,
}

/// Terminal result of one node execution.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeOutcome {
    pub index: NodeIndex,
    /// Ledger after the final attempt.
    pub ledger: AttemptLedger,
    pub result: Result<NodeSuccess, NodeFailure>,
    /// Last alignment result, kept on failure for the run report.
    pub alignment: Option<AlignmentResult>,
    /// Non-terminal error worth surfacing, e.g. a degraded spawning decision.
    pub last_error: Option<String>,
    /// Delegate that produced the output; `None` for deterministic nodes.
    pub producer: Option<DelegateId>,
}

/// Collaborators shared by every node execution of a run.
#[derive(Clone)]
pub struct ExecutionServices {
    pub llm: Arc<dyn LlmProvider>,
    /// Backs deterministic nodes.
    pub domain: Option<Arc<dyn DomainServiceClient>>,
    /// Creates spawned work items.
    pub tracker: Arc<dyn WorkItemTracker>,
    pub verifier: Arc<AlignmentVerifier>,
    /// Backoff for infrastructure failures of any collaborator.
    pub retry: RetryBackoffConfig,
}

// ---------------------------------------------------------------------------
// Internal failure plumbing
// ---------------------------------------------------------------------------

/// Kind-specific step repeated on every attempt. Spawning nodes never enter
/// the attempt loop.
enum Work {
    Generate {
        instructions: String,
    },
    Validate {
        service: DomainServiceName,
        operation: Option<String>,
    },
}

/// Why producing an output did not yield a usable value.
enum Produce {
    /// Technically invalid; consumes retry budget.
    Invalid {
        message: String,
        diagnostics: Vec<Diagnostic>,
    },
    /// Terminal for the node.
    Failed(NodeFailure),
}

#[derive(Debug)]
enum CallFailure<E> {
    Call(E),
    Budget(BudgetDenied),
}

impl<E: std::fmt::Display> std::fmt::Display for CallFailure<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Call(error) => write!(f, "{error}"),
            Self::Budget(denied) => write!(f, "{denied}"),
        }
    }
}

impl<E: Retryable> Retryable for CallFailure<E> {
    fn retry_policy(&self) -> RetryPolicy {
        match self {
            Self::Call(error) => error.retry_policy(),
            Self::Budget(_) => RetryPolicy::NonRetryable,
        }
    }
}

fn budget_exceeded(budget: &NodeBudget, denied: BudgetDenied) -> NodeFailure {
    NodeFailure::BudgetExceeded {
        requested: denied.requested,
        breakdown: budget.tracker().breakdown(),
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// Executes single nodes. Holds no per-run state, so one executor serves
/// every concurrently running node.
pub struct NodeExecutor {
    services: ExecutionServices,
}

impl NodeExecutor {
    pub fn new(services: ExecutionServices) -> Self {
        Self { services }
    }

    /// Runs the node until it completes or fails terminally.
    pub async fn execute(&self, job: NodeJob) -> NodeOutcome {
        let work = match &job.definition.kind {
            NodeKind::Generative(config) => Work::Generate {
                instructions: config.instructions.clone(),
            },
            NodeKind::Deterministic { service, operation } => Work::Validate {
                service: service.clone(),
                operation: operation.clone(),
            },
            NodeKind::Spawning(config) => {
                let config = config.clone();
                return self.spawn(job, &config).await;
            }
        };
        self.attempt(job, work).await
    }

    /// The retry/rework loop shared by generative and deterministic nodes.
    async fn attempt(&self, job: NodeJob, work: Work) -> NodeOutcome {
        let NodeJob {
            run_id,
            index,
            definition,
            input,
            mut ledger,
            mut feedback,
            mut previous_output,
            safety_classified,
            budget,
            abort,
            ..
        } = job;

        let producer = match work {
            Work::Generate { .. } => Some(self.services.llm.identity()),
            Work::Validate { .. } => None,
        };
        let mut last_alignment: Option<AlignmentResult> = None;

        let result = loop {
            if let Some(sibling) = abort.aborted_by() {
                break Err(NodeFailure::AbortedBySibling {
                    sibling: sibling.clone(),
                });
            }

            let attempt = ledger.attempts() + 1;
            debug!(node = %definition.id, attempt, feedback = feedback.len(), "Executing node attempt");

            let produced = match &work {
                Work::Generate { instructions } => {
                    self.generate(
                        run_id,
                        &definition,
                        instructions,
                        &input,
                        feedback.clone(),
                        previous_output.clone(),
                        &budget,
                    )
                    .await
                }
                Work::Validate { service, operation } => {
                    self.validate(run_id, &definition.id, service, operation.clone(), &input)
                        .await
                }
            };

            // The in-flight call has finished; a sibling abort now takes effect.
            if let Some(sibling) = abort.aborted_by() {
                break Err(NodeFailure::AbortedBySibling {
                    sibling: sibling.clone(),
                });
            }

            let output = match produced.and_then(|output| check_schema(&definition, output)) {
                Ok(output) => output,
                Err(Produce::Failed(failure)) => break Err(failure),
                Err(Produce::Invalid {
                    message,
                    diagnostics,
                }) => {
                    warn!(node = %definition.id, attempt, error = %message, "Node produced invalid output");
                    match ledger.record_invalid(message.clone(), diagnostics, definition.max_retries) {
                        LedgerDecision::Exhausted => break Err(ledger.retry_exhausted()),
                        LedgerDecision::TryAgain => {
                            feedback.push(Feedback::InvalidOutput {
                                attempt,
                                errors: vec![message],
                            });
                            continue;
                        }
                    }
                }
            };

            let Some(spec) = &definition.alignment else {
                break Ok(NodeSuccess {
                    output,
                    alignment: None,
                    sub_work_items: Vec::new(),
                });
            };

            let verification = self
                .services
                .verifier
                .verify(VerificationRequest {
                    run_id,
                    node: &definition.id,
                    spec,
                    input: &input,
                    output: &output,
                    producer: producer.as_ref(),
                    safety_classified,
                    budget: &budget,
                })
                .await;
            let alignment = match verification {
                Ok(alignment) => alignment,
                Err(VerificationError::Budget(denied)) => break Err(budget_exceeded(&budget, denied)),
                Err(VerificationError::Rejected { message }) => {
                    break Err(NodeFailure::Rejected { message })
                }
                Err(VerificationError::Infrastructure { attempts, message }) => {
                    break Err(NodeFailure::Infrastructure {
                        operation: "alignment".into(),
                        attempts,
                        message,
                    })
                }
            };
            last_alignment = Some(alignment.clone());

            if alignment.aligned() {
                break Ok(NodeSuccess {
                    output,
                    alignment: Some(alignment),
                    sub_work_items: Vec::new(),
                });
            }

            warn!(
                node = %definition.id,
                score = %alignment.score(),
                threshold = %alignment.threshold(),
                blocking = alignment.blocking_findings().count(),
                "Node output misaligned"
            );
            match ledger.record_misaligned(
                alignment.score(),
                alignment.threshold(),
                alignment.findings().to_vec(),
                definition.max_reworks,
            ) {
                LedgerDecision::Exhausted => break Err(ledger.rework_exhausted()),
                LedgerDecision::TryAgain => {
                    feedback.push(Feedback::Misaligned {
                        rework: ledger.reworks(),
                        findings: alignment.findings().to_vec(),
                    });
                    previous_output = Some(output);
                }
            }
        };

        match &result {
            Ok(_) => info!(node = %definition.id, retries = ledger.retries(), reworks = ledger.reworks(), "Node completed"),
            Err(failure) => warn!(node = %definition.id, kind = failure.kind().as_str(), error = %failure, "Node failed"),
        }
        NodeOutcome {
            index,
            ledger,
            result,
            alignment: last_alignment,
            last_error: None,
            producer,
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn generate(
        &self,
        run_id: PipelineRunId,
        definition: &NodeDefinition,
        instructions: &str,
        input: &Value,
        feedback: Vec<Feedback>,
        previous_output: Option<Value>,
        budget: &NodeBudget,
    ) -> Result<Value, Produce> {
        let request = GenerateRequest {
            run_id,
            node: definition.id.clone(),
            purpose: GeneratePurpose::Produce,
            instructions: instructions.to_string(),
            input: input.clone(),
            feedback,
            previous_output,
            output_schema: definition.output_schema.clone(),
            cost_ceiling: pipeline::TokenCost::zero(),
        };
        match self.call_llm(request, "generate", budget).await {
            Ok(output) => Ok(output),
            Err((_, CallFailure::Budget(denied))) => Err(Produce::Failed(budget_exceeded(budget, denied))),
            Err((_, CallFailure::Call(DelegateError::InvalidOutput { message, .. }))) => {
                Err(Produce::Invalid {
                    message,
                    diagnostics: Vec::new(),
                })
            }
            Err((_, CallFailure::Call(DelegateError::Rejected { message }))) => {
                Err(Produce::Failed(NodeFailure::Rejected { message }))
            }
            Err((attempts, CallFailure::Call(error @ DelegateError::Transport { .. }))) => {
                Err(Produce::Failed(NodeFailure::Infrastructure {
                    operation: "generate".into(),
                    attempts,
                    message: error.to_string(),
                }))
            }
        }
    }

    /// One budgeted LLM generation with infrastructure retry. Every attempt
    /// reserves before calling and settles after.
    async fn call_llm(
        &self,
        request: GenerateRequest,
        item: &str,
        budget: &NodeBudget,
    ) -> Result<Value, (u32, CallFailure<DelegateError>)> {
        let llm = &self.services.llm;
        retry_infrastructure(&self.services.retry, item, |_| {
            let mut request = request.clone();
            async move {
                let reservation = budget.reserve(item).map_err(CallFailure::Budget)?;
                request.cost_ceiling = reservation.amount();
                match llm.generate(request).await {
                    Ok(generated) => {
                        budget
                            .settle(reservation, generated.cost)
                            .map_err(CallFailure::Budget)?;
                        Ok(generated.output)
                    }
                    Err(error) => {
                        let cost = error.cost();
                        if cost.is_zero() {
                            budget.release(reservation);
                        } else {
                            budget.settle(reservation, cost).map_err(CallFailure::Budget)?;
                        }
                        Err(CallFailure::Call(error))
                    }
                }
            }
        })
        .await
        .map_err(|failure| (failure.attempts, failure.error))
    }

    async fn validate(
        &self,
        run_id: PipelineRunId,
        node: &NodeId,
        service: &DomainServiceName,
        operation: Option<String>,
        input: &Value,
    ) -> Result<Value, Produce> {
        let Some(client) = &self.services.domain else {
            return Err(Produce::Failed(NodeFailure::Rejected {
                message: format!("no domain service client configured for '{service}'"),
            }));
        };
        let request = ValidationRequest {
            run_id,
            node: node.clone(),
            service: service.clone(),
            operation,
            input: input.clone(),
        };
        let report = retry_infrastructure(&self.services.retry, service.as_str(), |_| {
            client.validate(request.clone())
        })
        .await
        .map_err(|failure| {
            let DomainServiceError {
                message,
                recoverable,
                ..
            } = failure.error;
            Produce::Failed(if recoverable {
                NodeFailure::Infrastructure {
                    operation: format!("service:{service}"),
                    attempts: failure.attempts,
                    message,
                }
            } else {
                NodeFailure::Rejected { message }
            })
        })?;

        if report.has_blocking() {
            let blocking = report.findings.iter().filter(|d| d.is_blocking()).count();
            return Err(Produce::Invalid {
                message: format!("domain service '{service}' reported {blocking} blocking finding(s)"),
                diagnostics: report.findings,
            });
        }

        let diagnostics = serde_json::to_value(&report.findings).unwrap_or(Value::Null);
        Ok(match report.output {
            Value::Object(mut map) => {
                map.entry("diagnostics").or_insert(diagnostics);
                Value::Object(map)
            }
            other => json!({ "result": other, "diagnostics": diagnostics }),
        })
    }

    /// Spawning nodes always complete. The node only decides which work items
    /// to create; [`NodeExecutor::create_sub_work_items`] creates them once the
    /// engine has recorded the node. A failed or oversized decision is recorded
    /// in the output and `last_error`, never propagated.
    async fn spawn(&self, job: NodeJob, config: &SpawningConfig) -> NodeOutcome {
        let request = GenerateRequest {
            run_id: job.run_id,
            node: job.definition.id.clone(),
            purpose: GeneratePurpose::Spawn,
            instructions: config.instructions.clone(),
            input: job.input.clone(),
            feedback: job.feedback.clone(),
            previous_output: job.previous_output.clone(),
            output_schema: None,
            cost_ceiling: pipeline::TokenCost::zero(),
        };

        let mut errors: Vec<String> = Vec::new();
        let mut requests = Vec::new();
        match self.call_llm(request, "spawn", &job.budget).await {
            Ok(decision) => {
                let items = decision
                    .get("items")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                let limit = config.max_items.map_or(usize::MAX, |max| max as usize);
                if items.len() > limit {
                    errors.push(format!("{} items proposed, only the first {limit} created", items.len()));
                }
                for item in items.iter().take(limit) {
                    let title = item.get("title").and_then(Value::as_str).unwrap_or_default();
                    if title.is_empty() {
                        errors.push("proposed work item has no title".into());
                        continue;
                    }
                    let body = item.get("body").and_then(Value::as_str).unwrap_or_default();
                    requests.push(SubWorkItemRequest {
                        parent: job.work_item,
                        run_id: job.run_id,
                        node: job.definition.id.clone(),
                        title: title.to_string(),
                        body: body.to_string(),
                    });
                }
            }
            Err((_, failure)) => errors.push(format!("could not decide on work items: {failure}")),
        }

        for error in &errors {
            warn!(node = %job.definition.id, error = %error, "Spawning node degraded");
        }
        info!(node = %job.definition.id, proposed = requests.len(), "Spawning node completed");

        NodeOutcome {
            index: job.index,
            ledger: job.ledger,
            result: Ok(NodeSuccess {
                output: json!({
                    "proposed": requests.iter().map(|r| r.title.as_str()).collect::<Vec<_>>(),
                    "errors": errors,
                }),
                alignment: None,
                sub_work_items: requests,
            }),
            alignment: None,
            last_error: errors.last().cloned(),
            producer: Some(self.services.llm.identity()),
        }
    }

    /// Creates each work item in order, with infrastructure retry. Failures
    /// are collected per item.
    pub async fn create_sub_work_items(
        &self,
        index: NodeIndex,
        requests: Vec<SubWorkItemRequest>,
    ) -> SubWorkItems {
        let tracker = &self.services.tracker;
        let mut created = Vec::new();
        let mut errors = Vec::new();
        for request in requests {
            match retry_infrastructure(&self.services.retry, "create_sub_work_item", |_| {
                tracker.create_sub_work_item(request.clone())
            })
            .await
            {
                Ok(id) => created.push(id),
                Err(failure) => {
                    warn!(node = %request.node, title = %request.title, error = %failure.error, "Sub-work-item not created");
                    errors.push(format!("'{}': {}", request.title, failure.error));
                }
            }
        }
        SubWorkItems {
            index,
            created,
            errors,
        }
    }
}

fn check_schema(definition: &NodeDefinition, output: Value) -> Result<Value, Produce> {
    match &definition.output_schema {
        Some(schema) => match schema.validate(&output) {
            Ok(()) => Ok(output),
            Err(violations) => Err(Produce::Invalid {
                message: format!("output schema violated: {}", violations.join("; ")),
                diagnostics: Vec::new(),
            }),
        },
        None => Ok(output),
    }
}

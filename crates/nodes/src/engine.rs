//! The graph execution engine.
//!
//! One call to [`GraphExecutionEngine::run`] is one invocation of the step
//! function: reconstruct the run from the state store (or start fresh),
//! dispatch every ready node as its own task, evaluate outgoing edges as
//! nodes complete, persist a snapshot at every node boundary, and stop when
//! nothing more can run. A run whose only remaining work waits on human
//! approval stays `running`; the next invocation picks it up.
//!
//! The run state is owned by the dispatch loop. Node tasks receive a detached
//! [`NodeJob`] and share nothing but the [`BudgetTracker`]. A generative slot
//! is taken before a node is marked executing, so a node queued behind the
//! concurrency cap has not started and never starts after cancellation.
//! Work items decided on by spawning nodes are created by separate tasks that
//! the loop also waits for; downstream nodes do not.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use pipeline::budget::{BudgetBreakdown, BudgetTracker, NodeBudget};
use pipeline::graph::{GatePolicy, NodeIndex, OverflowPolicy, PipelineGraph};
use pipeline::ports::{
    DomainServiceClient, GateSignal, LlmProvider, StateStore, WorkItemTracker,
};
use pipeline::report::{Escalation, RunReport, StatusUpdate};
use pipeline::state::{NodeStatus, PipelineRun, RunStatus, RunView, Traversal};
use pipeline::{
    CogWorksError, CostBudget, NodeFailure, NodeId, PipelineRunId, Timestamp, TokenCost,
    WorkItemId,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{Id, JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::alignment::AlignmentVerifier;
use crate::edges::{EdgeContext, EdgeEvaluator};
use crate::executor::{
    AbortSignal, ExecutionServices, NodeExecutor, NodeJob, NodeOutcome, NodeSuccess, SubWorkItems,
};
use crate::retry::{retry_infrastructure, RetryBackoffConfig};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Engine-level settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Cost cap of one run.
    pub budget: CostBudget,
    /// Generative and spawning nodes running at once. Deterministic nodes
    /// are not capped.
    pub max_concurrent_generative: usize,
    /// Amount reserved before each delegated call.
    pub per_call_reservation: TokenCost,
    pub retry: RetryBackoffConfig,
    /// Threshold raise applied when the judge is also the producer on a
    /// safety-classified run.
    pub bias_threshold_uplift: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            budget: CostBudget::default(),
            max_concurrent_generative: 3,
            per_call_reservation: TokenCost::from_micros(500_000),
            retry: RetryBackoffConfig::default(),
            bias_threshold_uplift: 0.1,
        }
    }
}

/// External collaborators of the engine.
#[derive(Clone)]
pub struct EngineServices {
    /// Produces node outputs.
    pub llm: Arc<dyn LlmProvider>,
    /// Judges alignment and edge conditions. Defaults to `llm` when `None`.
    pub judge: Option<Arc<dyn LlmProvider>>,
    /// Required by deterministic nodes; validation rejects those without one.
    pub domain: Option<Arc<dyn DomainServiceClient>>,
    /// Gates, status updates, escalations and sub-work-items.
    pub tracker: Arc<dyn WorkItemTracker>,
    /// Run snapshots.
    pub store: Arc<dyn StateStore>,
}

/// One invocation request.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRequest {
    /// Resumes the stored run with this id, if there is one.
    pub run_id: PipelineRunId,
    pub work_item: WorkItemId,
    /// Work-item content handed to entry nodes as `work_item`.
    pub input: Value,
    /// Marks the run safety-critical from the start. A stored run keeps its
    /// own flag.
    pub safety_classified: bool,
    /// Discard any stored snapshot and start over.
    pub restart: bool,
}

/// Run-level stop raised while dispatching.
struct Halt {
    error: CogWorksError,
    status: RunStatus,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Drives one pipeline run over a validated graph.
///
/// Each call to [`GraphExecutionEngine::run`] reloads the snapshot, advances
/// the run as far as it can and persists after every state change.
pub struct GraphExecutionEngine {
    graph: Arc<PipelineGraph>,
    config: EngineConfig,
    tracker: Arc<dyn WorkItemTracker>,
    store: Arc<dyn StateStore>,
    executor: Arc<NodeExecutor>,
    evaluator: EdgeEvaluator,
}

impl GraphExecutionEngine {
    /// Judged edges and alignment checks use `services.judge`, or the
    /// producing delegate when none is configured.
    pub fn new(graph: PipelineGraph, config: EngineConfig, services: EngineServices) -> Self {
        let judge = services
            .judge
            .clone()
            .unwrap_or_else(|| Arc::clone(&services.llm));
        let verifier = AlignmentVerifier::new(
            Arc::clone(&judge),
            config.retry.clone(),
            config.bias_threshold_uplift,
        );
        let executor = NodeExecutor::new(ExecutionServices {
            llm: services.llm,
            domain: services.domain,
            tracker: Arc::clone(&services.tracker),
            verifier: Arc::new(verifier),
            retry: config.retry.clone(),
        });
        Self {
            graph: Arc::new(graph),
            config,
            tracker: services.tracker,
            store: services.store,
            executor: Arc::new(executor),
            evaluator: EdgeEvaluator::new(Some(judge)),
        }
    }

    /// The graph this engine executes.
    pub fn graph(&self) -> &PipelineGraph {
        &self.graph
    }

    /// Runs one invocation until no further progress is possible.
    pub async fn run(
        &self,
        request: RunRequest,
        cancel: CancellationToken,
    ) -> Result<RunReport, CogWorksError> {
        let span = info_span!(
            "pipeline_run",
            run_id = %request.run_id,
            work_item = %request.work_item,
            pipeline = %self.graph.name()
        );
        self.run_inner(request, cancel).instrument(span).await
    }

    async fn run_inner(
        &self,
        request: RunRequest,
        cancel: CancellationToken,
    ) -> Result<RunReport, CogWorksError> {
        let (mut run, budget) = self.load_run(&request).await?;
        if run.status().is_terminal() {
            info!(status = %run.status(), "Run already finished, nothing to do");
            return Ok(RunReport::from_run(&run, Vec::new()));
        }

        run.start();
        self.persist(&mut run, &budget).await?;

        let mut dispatch = Dispatch::new(self.config.max_concurrent_generative);
        let mut halt: Option<Halt> = None;
        let mut cancelled = false;

        loop {
            if !cancelled && cancel.is_cancelled() {
                info!(in_flight = dispatch.tasks.len(), "Cancellation observed, no new nodes will start");
                cancelled = true;
            }
            if halt.is_none() && !cancelled {
                halt = self.dispatch_ready(&mut run, &budget, &mut dispatch).await?;
            }
            if dispatch.is_idle() {
                break;
            }

            let event = tokio::select! {
                Some(joined) = dispatch.tasks.join_next_with_id(), if !dispatch.tasks.is_empty() => {
                    Event::Node(joined)
                }
                Some(landed) = dispatch.side_effects.join_next(), if !dispatch.side_effects.is_empty() => {
                    Event::SubWorkItems(landed)
                }
                _ = cancel.cancelled(), if !cancelled => continue,
                else => break,
            };
            let joined = match event {
                Event::Node(joined) => joined,
                Event::SubWorkItems(Ok(landed)) => {
                    self.record_sub_work_items(&mut run, &budget, landed).await?;
                    continue;
                }
                Event::SubWorkItems(Err(join_error)) => {
                    error!(error = %join_error, "Sub-work-item creation ended abnormally");
                    continue;
                }
            };
            let outcome = match joined {
                Ok((id, outcome)) => {
                    dispatch.finished(id);
                    outcome
                }
                Err(join_error) => {
                    let Some(index) = dispatch.finished(join_error.id()) else {
                        continue;
                    };
                    error!(node = %self.graph.node(index).id, error = %join_error, "Node task ended abnormally");
                    NodeOutcome {
                        index,
                        ledger: run.state(index).ledger.clone(),
                        result: Err(NodeFailure::Infrastructure {
                            operation: "execute".into(),
                            attempts: 1,
                            message: join_error.to_string(),
                        }),
                        alignment: None,
                        last_error: None,
                        producer: None,
                    }
                }
            };

            if let Some(raised) = self.apply_outcome(&mut run, &budget, &mut dispatch, outcome).await? {
                halt.get_or_insert(raised);
            }
        }

        self.finish(run, budget, halt, cancelled, dispatch.awaiting).await
    }

    /// Reconstructs the run from the store, or starts a fresh one.
    async fn load_run(
        &self,
        request: &RunRequest,
    ) -> Result<(PipelineRun, Arc<BudgetTracker>), CogWorksError> {
        let stored = if request.restart {
            info!("Restart requested, discarding any stored snapshot");
            None
        } else {
            self.store
                .read_state(request.run_id)
                .await
                .map_err(|e| CogWorksError::StatePersistence {
                    message: e.to_string(),
                })?
        };

        match stored {
            Some(snapshot) => {
                let mut run = PipelineRun::from_snapshot(snapshot, &self.graph)?;
                let resumed = run.resume_in_flight();
                if !resumed.is_empty() {
                    let names: Vec<&str> = resumed.iter().map(NodeId::as_str).collect();
                    warn!(nodes = ?names, "Resuming nodes interrupted mid-execution");
                }
                let budget = Arc::new(BudgetTracker::restore(self.config.budget, run.budget()));
                info!(status = %run.status(), consumed = %budget.consumed(), "Resumed run from snapshot");
                Ok((run, budget))
            }
            None => {
                let budget = Arc::new(BudgetTracker::new(self.config.budget));
                let run = PipelineRun::new(
                    request.run_id,
                    request.work_item,
                    &self.graph,
                    request.input.clone(),
                    request.safety_classified,
                    BudgetBreakdown::empty(self.config.budget),
                );
                info!(budget = %self.config.budget, "Starting new run");
                Ok((run, budget))
            }
        }
    }

    /// Propagates blocked state, checks gates and starts every ready node.
    async fn dispatch_ready(
        &self,
        run: &mut PipelineRun,
        budget: &Arc<BudgetTracker>,
        dispatch: &mut Dispatch,
    ) -> Result<Option<Halt>, CogWorksError> {
        let mut changed = !run.propagate_blocked(&self.graph).is_empty();
        let mut halt = None;

        for index in run.ready_nodes(&self.graph) {
            let definition = self.graph.node(index);
            if definition.gate == GatePolicy::Human && !run.state(index).gate_approved {
                match self.gate_signal(run, &definition.id).await {
                    GateSignal::Approved => {
                        info!(node = %definition.id, "Gate approved");
                        run.state_mut(index).gate_approved = true;
                        changed = true;
                    }
                    GateSignal::Pending => {
                        if dispatch.awaiting.insert(index) {
                            info!(node = %definition.id, "Waiting for gate approval");
                        }
                        continue;
                    }
                    GateSignal::Rejected => {
                        warn!(node = %definition.id, "Gate rejected");
                        dispatch.awaiting.remove(&index);
                        let state = run.state_mut(index);
                        state.status = NodeStatus::Failed;
                        state.failure = Some(NodeFailure::GateRejected);
                        changed = true;
                        halt.get_or_insert(Halt {
                            error: CogWorksError::NodeFailed {
                                node: definition.id.clone(),
                                failure: NodeFailure::GateRejected,
                            },
                            status: RunStatus::Failed,
                        });
                        break;
                    }
                }
            }
            let permit = if definition.kind.incurs_cost() {
                match Arc::clone(&dispatch.generative).try_acquire_owned() {
                    Ok(permit) => Some(permit),
                    Err(_) => {
                        debug!(node = %definition.id, "Generative slots taken, node stays queued");
                        continue;
                    }
                }
            } else {
                None
            };
            dispatch.awaiting.remove(&index);
            self.start_node(run, budget, dispatch, index, permit);
            changed = true;
        }

        if changed {
            self.persist(run, budget).await?;
        }
        Ok(halt)
    }

    async fn gate_signal(&self, run: &PipelineRun, node: &NodeId) -> GateSignal {
        let tracker = &self.tracker;
        let work_item = run.work_item();
        match retry_infrastructure(&self.config.retry, "gate_signal", |_| {
            tracker.gate_signal(work_item, node)
        })
        .await
        {
            Ok(signal) => signal,
            Err(failure) => {
                // Approval is never inferred.
                warn!(node = %node, error = %failure.error, "Gate signal unavailable, treating as pending");
                GateSignal::Pending
            }
        }
    }

    fn start_node(
        &self,
        run: &mut PipelineRun,
        budget: &Arc<BudgetTracker>,
        dispatch: &mut Dispatch,
        index: NodeIndex,
        permit: Option<OwnedSemaphorePermit>,
    ) {
        let definition = self.graph.node(index).clone();
        let input = self.node_input(run, index);
        let abort = Arc::new(AbortSignal::new());

        let state = run.state_mut(index);
        state.status = NodeStatus::Executing;
        let job = NodeJob {
            run_id: run.run_id(),
            work_item: run.work_item(),
            index,
            input,
            ledger: run.state(index).ledger.clone(),
            feedback: run.state(index).feedback.clone(),
            previous_output: run.state(index).last_output.clone(),
            safety_classified: run.safety_classified(),
            budget: self.node_budget(budget, index),
            abort: Arc::clone(&abort),
            definition,
        };

        let span = info_span!("node", node = %job.definition.id, kind = job.definition.kind.as_str());
        let executor = Arc::clone(&self.executor);
        info!(node = %job.definition.id, "Dispatching node");
        let handle = dispatch.tasks.spawn(
            async move {
                let _slot = permit;
                executor.execute(job).await
            }
            .instrument(span),
        );
        dispatch.running.insert(handle.id(), (index, abort));
    }

    /// Required inputs keyed by node name plus the work item itself.
    fn node_input(&self, run: &PipelineRun, index: NodeIndex) -> Value {
        let mut input = Map::new();
        input.insert("work_item".into(), run.input().clone());
        for &required in &self.graph.node(index).required_inputs {
            let state = run.state(required);
            input.insert(
                state.node.as_str().to_string(),
                state.last_output.clone().unwrap_or(Value::Null),
            );
        }
        Value::Object(input)
    }

    fn node_budget(&self, budget: &Arc<BudgetTracker>, index: NodeIndex) -> NodeBudget {
        let definition = self.graph.node(index);
        let share = definition.cost_share.map(|fraction| {
            TokenCost::from_micros((self.config.budget.as_micros() as f64 * fraction).round() as u64)
        });
        budget.node_budget(definition.id.clone(), share, self.config.per_call_reservation)
    }

    /// Records a finished node and, on success, applies its outgoing edges.
    async fn apply_outcome(
        &self,
        run: &mut PipelineRun,
        budget: &Arc<BudgetTracker>,
        dispatch: &mut Dispatch,
        outcome: NodeOutcome,
    ) -> Result<Option<Halt>, CogWorksError> {
        let index = outcome.index;
        let node = self.graph.node(index).id.clone();

        let state = run.state_mut(index);
        state.ledger = outcome.ledger;
        state.producer = outcome.producer;
        if outcome.last_error.is_some() {
            state.last_error = outcome.last_error;
        }

        let success = match outcome.result {
            Ok(success) => success,
            Err(failure) => {
                state.status = NodeStatus::Failed;
                state.last_alignment = outcome.alignment;
                state.failure = Some(failure.clone());
                self.persist(run, budget).await?;
                self.post_status(run, Some(&node), "failed", failure.to_string()).await;
                return Ok(self.node_failed(index, failure, dispatch));
            }
        };

        let NodeSuccess {
            output,
            alignment,
            sub_work_items,
        } = success;
        state.status = NodeStatus::Completed;
        state.last_output = Some(output);
        state.last_alignment = alignment;
        state.failure = None;
        state.feedback.clear();
        state.completions += 1;
        self.classify_safety(run, budget, index);
        self.persist(run, budget).await?;
        self.post_status(run, Some(&node), "completed", format!("{node} completed"))
            .await;

        if !sub_work_items.is_empty() {
            let executor = Arc::clone(&self.executor);
            let span = info_span!("sub_work_items", node = %node, count = sub_work_items.len());
            dispatch.side_effects.spawn(
                async move { executor.create_sub_work_items(index, sub_work_items).await }.instrument(span),
            );
        }

        let halt = self.apply_edges(run, budget, index).await;
        self.persist(run, budget).await?;
        Ok(halt)
    }

    /// Records sub-work-items of a spawning node once their creation lands.
    /// Creation errors stay on the node as `last_error`; they never fail it.
    async fn record_sub_work_items(
        &self,
        run: &mut PipelineRun,
        budget: &BudgetTracker,
        landed: SubWorkItems,
    ) -> Result<(), CogWorksError> {
        let SubWorkItems {
            index,
            created,
            errors,
        } = landed;
        info!(
            node = %self.graph.node(index).id,
            created = created.len(),
            failed = errors.len(),
            "Sub-work-item creation finished"
        );
        let state = run.state_mut(index);
        state.sub_work_items.extend(created);
        if let Some(error) = errors.last() {
            state.last_error = Some(error.clone());
        }
        self.persist(run, budget).await
    }

    fn node_failed(&self, index: NodeIndex, failure: NodeFailure, dispatch: &Dispatch) -> Option<Halt> {
        let definition = self.graph.node(index);
        if definition.abort_siblings_on_failure {
            for (sibling, abort) in dispatch.running.values() {
                if *sibling != index {
                    debug!(node = %self.graph.node(*sibling).id, cause = %definition.id, "Signalling sibling abort");
                    abort.abort(definition.id.clone());
                }
            }
        }

        // These stop the run from starting anything new; other failures only
        // block their own downstream nodes.
        let halting = matches!(
            failure,
            NodeFailure::ReworkExhausted { .. }
                | NodeFailure::BudgetExceeded { .. }
                | NodeFailure::GateRejected
        );
        halting.then(|| Halt {
            status: if failure.kind().escalates() {
                RunStatus::Escalated
            } else {
                RunStatus::Failed
            },
            error: CogWorksError::NodeFailed {
                node: definition.id.clone(),
                failure,
            },
        })
    }

    /// Applies the graph-level safety classification once it holds.
    fn classify_safety(&self, run: &mut PipelineRun, budget: &BudgetTracker, index: NodeIndex) {
        let Some(expression) = self.graph.safety_classification() else {
            return;
        };
        if run.safety_classified() {
            return;
        }
        let classified = expression.evaluate(&RunView {
            graph: &self.graph,
            run,
            current: index,
            cost: budget.committed(),
        });
        if classified {
            info!(expression = expression.source(), "Run classified as safety-critical");
            run.mark_safety_classified();
        }
    }

    async fn apply_edges(
        &self,
        run: &mut PipelineRun,
        budget: &Arc<BudgetTracker>,
        index: NodeIndex,
    ) -> Option<Halt> {
        let node_budget = self.node_budget(budget, index);
        let decision = self
            .evaluator
            .evaluate(&EdgeContext {
                graph: &self.graph,
                run,
                node: index,
                budget: &node_budget,
            })
            .await;
        let decision = match decision {
            Ok(decision) => decision,
            Err(error) => {
                warn!(node = %self.graph.node(index).id, error = %error, "Edge evaluation failed");
                return Some(Halt {
                    error: CogWorksError::EdgeEvaluation {
                        node: self.graph.node(index).id.clone(),
                        message: error.to_string(),
                    },
                    status: RunStatus::Failed,
                });
            }
        };
        for record in decision.records {
            run.record_edge_evaluation(record);
        }

        let mut halt = None;
        for edge_index in decision.taken {
            let edge = self.graph.edge(edge_index);
            let Some(rework) = &edge.rework else {
                run.activate(edge.target);
                continue;
            };
            match run.traverse(&edge.id, rework.max_traversals) {
                Traversal::Taken { count } => {
                    info!(edge = %edge.id, count, max = rework.max_traversals, "Rework edge taken");
                    run.restart_loop(&self.graph, edge_index);
                }
                Traversal::Exhausted { count } => {
                    warn!(edge = %edge.id, count, "Rework edge bound reached, applying overflow policy");
                    let limit = CogWorksError::CycleLimitReached {
                        edge: edge.id.clone(),
                        max_traversals: rework.max_traversals,
                    };
                    match rework.overflow {
                        OverflowPolicy::Halt => {
                            halt.get_or_insert(Halt {
                                error: limit,
                                status: RunStatus::Failed,
                            });
                        }
                        OverflowPolicy::Escalate => {
                            halt.get_or_insert(Halt {
                                error: limit,
                                status: RunStatus::Escalated,
                            });
                        }
                        OverflowPolicy::TakeAlternate(alternate) => {
                            let alternate = self.graph.edge(alternate);
                            info!(edge = %edge.id, alternate = %alternate.id, "Taking alternate edge");
                            run.activate(alternate.target);
                        }
                    }
                }
            }
        }
        halt
    }

    /// Decides the disposition, writes the final snapshot and reports.
    async fn finish(
        &self,
        mut run: PipelineRun,
        budget: Arc<BudgetTracker>,
        halt: Option<Halt>,
        cancelled: bool,
        awaiting: BTreeSet<NodeIndex>,
    ) -> Result<RunReport, CogWorksError> {
        run.propagate_blocked(&self.graph);
        let awaiting: Vec<NodeId> = awaiting
            .into_iter()
            .filter(|index| !run.state(*index).status.is_terminal())
            .map(|index| self.graph.node(index).id.clone())
            .collect();

        let (status, error) = if cancelled {
            (RunStatus::Cancelled, None)
        } else if let Some(halt) = halt {
            (halt.status, Some(halt.error))
        } else if let Some((node, failure)) = run.first_failure() {
            let error = CogWorksError::NodeFailed {
                node: node.clone(),
                failure: failure.clone(),
            };
            let status = if error.escalates() {
                RunStatus::Escalated
            } else {
                RunStatus::Failed
            };
            (status, Some(error))
        } else if run.terminal_reached(&self.graph) {
            (RunStatus::Succeeded, None)
        } else if !awaiting.is_empty() {
            (RunStatus::Running, None)
        } else {
            let mut pending = run.nodes_with_status(NodeStatus::Pending);
            pending.extend(run.nodes_with_status(NodeStatus::Eligible));
            let error = CogWorksError::DeadEnd {
                pending,
                completed: run.nodes_with_status(NodeStatus::Completed),
            };
            (RunStatus::Escalated, Some(error))
        };

        run.finish(status, error.clone());
        self.persist(&mut run, &budget).await?;

        if let (RunStatus::Escalated, Some(reason)) = (status, &error) {
            self.escalate(&run, reason.clone()).await;
        }
        let report = RunReport::from_run(&run, if status == RunStatus::Running { awaiting } else { Vec::new() });
        self.post_status(&run, None, status.as_str(), report.summary()).await;
        info!(status = %status, consumed = %budget.consumed(), "Invocation finished");
        Ok(report)
    }

    async fn escalate(&self, run: &PipelineRun, reason: CogWorksError) {
        let escalation = Escalation::from_run(run, reason);
        let tracker = &self.tracker;
        if let Err(failure) = retry_infrastructure(&self.config.retry, "post_escalation", |_| {
            tracker.post_escalation(escalation.clone())
        })
        .await
        {
            error!(error = %failure.error, "Escalation could not be posted");
        }
    }

    async fn post_status(&self, run: &PipelineRun, node: Option<&NodeId>, status: &str, message: String) {
        let update = StatusUpdate {
            run_id: run.run_id(),
            work_item: run.work_item(),
            node: node.cloned(),
            status: status.to_string(),
            message,
            cost: run.budget().consumed,
            at: Timestamp::now(),
        };
        let tracker = &self.tracker;
        if let Err(failure) = retry_infrastructure(&self.config.retry, "post_status", |_| {
            tracker.post_status(update.clone())
        })
        .await
        {
            warn!(error = %failure.error, "Status update could not be posted");
        }
    }

    async fn persist(&self, run: &mut PipelineRun, budget: &BudgetTracker) -> Result<(), CogWorksError> {
        run.set_budget(budget.breakdown());
        let snapshot = run.to_snapshot()?;
        self.store
            .write_state(run.run_id(), snapshot)
            .await
            .map_err(|e| CogWorksError::StatePersistence {
                message: e.to_string(),
            })
    }
}

// ---------------------------------------------------------------------------
// Dispatch bookkeeping
// ---------------------------------------------------------------------------

/// Something the dispatch loop was waiting on finished.
enum Event {
    Node(Result<(Id, NodeOutcome), JoinError>),
    SubWorkItems(Result<SubWorkItems, JoinError>),
}

struct Dispatch {
    tasks: JoinSet<NodeOutcome>,
    running: HashMap<Id, (NodeIndex, Arc<AbortSignal>)>,
    /// Sub-work-item creation started by completed spawning nodes.
    side_effects: JoinSet<SubWorkItems>,
    generative: Arc<Semaphore>,
    awaiting: BTreeSet<NodeIndex>,
}

impl Dispatch {
    fn new(max_concurrent_generative: usize) -> Self {
        Self {
            tasks: JoinSet::new(),
            running: HashMap::new(),
            side_effects: JoinSet::new(),
            generative: Arc::new(Semaphore::new(max_concurrent_generative.max(1))),
            awaiting: BTreeSet::new(),
        }
    }

    fn is_idle(&self) -> bool {
        self.tasks.is_empty() && self.side_effects.is_empty()
    }

    fn finished(&mut self, id: Id) -> Option<NodeIndex> {
        self.running.remove(&id).map(|(index, _)| index)
    }
}

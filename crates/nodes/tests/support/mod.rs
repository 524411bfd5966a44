#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use nodes::{EngineConfig, EngineServices, GraphExecutionEngine, InMemoryStateStore, RetryBackoffConfig, RunRequest};
use pipeline::alignment::{AlignmentFinding, FindingKind, FindingSource};
use pipeline::graph::{GraphDescription, PipelineGraph};
use pipeline::ports::{
    DelegateError, DomainServiceClient, DomainServiceError, GateSignal, Generated, GenerateRequest,
    Judgement, JudgePurpose, JudgeRequest, LlmProvider, SubWorkItemRequest, TrackerError,
    ValidationReport, ValidationRequest, WorkItemTracker,
};
use pipeline::report::{Escalation, StatusUpdate};
use pipeline::{
    CostBudget, DelegateId, DiagnosticSeverity, NodeId, PipelineRunId, SubWorkItemId, TokenCost,
    TokenCount, WorkItemId,
};
use serde_json::{json, Value};
use tokio::time::Instant;

pub fn usd(value: f64) -> TokenCost {
    TokenCost::new(value).expect("valid cost")
}

pub fn graph(description: Value) -> PipelineGraph {
    let description: GraphDescription =
        serde_json::from_value(description).expect("description should deserialise");
    PipelineGraph::from_description(&description).expect("graph should validate")
}

pub fn generative(name: &str) -> Value {
    json!({ "name": name, "generative": { "instructions": format!("produce {name}") } })
}

pub fn edge(name: &str, from: &str, to: &str) -> Value {
    json!({ "name": name, "from": from, "to": to })
}

pub fn config(budget: f64) -> EngineConfig {
    EngineConfig {
        budget: CostBudget::new(budget).expect("valid budget"),
        max_concurrent_generative: 3,
        per_call_reservation: usd(1.0),
        retry: RetryBackoffConfig::immediate(2),
        bias_threshold_uplift: 0.1,
    }
}

pub fn request(run_id: PipelineRunId) -> RunRequest {
    RunRequest {
        run_id,
        work_item: WorkItemId::new(7),
        input: json!({ "title": "add retry to the fetcher" }),
        safety_classified: false,
        restart: false,
    }
}

pub fn finding(kind: FindingKind, severity: DiagnosticSeverity, description: &str) -> AlignmentFinding {
    AlignmentFinding {
        kind,
        severity,
        description: description.to_string(),
        input_reference: None,
        output_reference: None,
        remediation: None,
        source: FindingSource::Semantic,
    }
}

// ---------------------------------------------------------------------------
// Scripted LLM
// ---------------------------------------------------------------------------

/// LLM double. Outputs are scripted per node and consumed in order; once a
/// script runs dry the node gets `{"ok": true}`. Judgements default to a
/// perfect score and a `true` verdict.
pub struct ScriptedLlm {
    identity: DelegateId,
    cost: TokenCost,
    delay: Duration,
    node_delays: HashMap<String, Duration>,
    outputs: Mutex<HashMap<String, VecDeque<Result<Value, DelegateError>>>>,
    alignment: Mutex<HashMap<String, VecDeque<Result<Judgement, DelegateError>>>>,
    verdicts: Mutex<HashMap<String, VecDeque<Result<Option<bool>, DelegateError>>>>,
    requests: Mutex<Vec<GenerateRequest>>,
    called_at: Mutex<Vec<(String, Instant)>>,
    judge_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    spent_micros: AtomicU64,
}

impl ScriptedLlm {
    pub fn new(identity: &str) -> Self {
        Self {
            identity: DelegateId::new(identity).expect("non-empty"),
            cost: usd(0.01),
            delay: Duration::ZERO,
            node_delays: HashMap::new(),
            outputs: Mutex::new(HashMap::new()),
            alignment: Mutex::new(HashMap::new()),
            verdicts: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            called_at: Mutex::new(Vec::new()),
            judge_calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            spent_micros: AtomicU64::new(0),
        }
    }

    pub fn with_cost(mut self, cost: TokenCost) -> Self {
        self.cost = cost;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_node_delay(mut self, node: &str, delay: Duration) -> Self {
        self.node_delays.insert(node.to_string(), delay);
        self
    }

    pub fn outputs(self, node: &str, outputs: Vec<Result<Value, DelegateError>>) -> Self {
        self.outputs
            .lock()
            .expect("lock")
            .insert(node.to_string(), outputs.into());
        self
    }

    pub fn alignment(self, node: &str, judgements: Vec<Result<Judgement, DelegateError>>) -> Self {
        self.alignment
            .lock()
            .expect("lock")
            .insert(node.to_string(), judgements.into());
        self
    }

    pub fn verdicts(self, edge: &str, verdicts: Vec<Result<Option<bool>, DelegateError>>) -> Self {
        self.verdicts
            .lock()
            .expect("lock")
            .insert(edge.to_string(), verdicts.into());
        self
    }

    /// Node names in generate-call order.
    pub fn calls(&self) -> Vec<String> {
        self.requests
            .lock()
            .expect("lock")
            .iter()
            .map(|request| request.node.as_str().to_string())
            .collect()
    }

    pub fn requests_for(&self, node: &str) -> Vec<GenerateRequest> {
        self.requests
            .lock()
            .expect("lock")
            .iter()
            .filter(|request| request.node.as_str() == node)
            .cloned()
            .collect()
    }

    pub fn calls_for(&self, node: &str) -> usize {
        self.calls().iter().filter(|call| *call == node).count()
    }

    /// When the first generate call for `node` arrived.
    pub fn first_call_at(&self, node: &str) -> Option<Instant> {
        self.called_at
            .lock()
            .expect("lock")
            .iter()
            .find(|(called, _)| called == node)
            .map(|(_, at)| *at)
    }

    pub fn judge_calls(&self) -> usize {
        self.judge_calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn spent(&self) -> TokenCost {
        TokenCost::from_micros(self.spent_micros.load(Ordering::SeqCst))
    }

    fn charge(&self) -> TokenCost {
        self.spent_micros
            .fetch_add(self.cost.as_micros(), Ordering::SeqCst);
        self.cost
    }
}

pub fn judgement(score: f64, findings: Vec<AlignmentFinding>) -> Judgement {
    Judgement {
        verdict: None,
        score: Some(score),
        findings,
        cost: usd(0.01),
    }
}

pub fn transport(message: &str) -> DelegateError {
    DelegateError::Transport {
        message: message.to_string(),
        policy: pipeline::RetryPolicy::Retryable { after: None },
    }
}

pub fn invalid(message: &str) -> DelegateError {
    DelegateError::InvalidOutput {
        message: message.to_string(),
        cost: usd(0.01),
    }
}

#[async_trait]
impl LlmProvider for ScriptedLlm {
    fn identity(&self) -> DelegateId {
        self.identity.clone()
    }

    async fn generate(&self, request: GenerateRequest) -> Result<Generated, DelegateError> {
        let node = request.node.as_str().to_string();
        self.requests.lock().expect("lock").push(request);
        self.called_at
            .lock()
            .expect("lock")
            .push((node.clone(), Instant::now()));
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let delay = self.node_delays.get(&node).copied().unwrap_or(self.delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let scripted = self
            .outputs
            .lock()
            .expect("lock")
            .get_mut(&node)
            .and_then(VecDeque::pop_front);
        match scripted.unwrap_or_else(|| Ok(json!({ "ok": true }))) {
            Ok(output) => Ok(Generated {
                output,
                cost: self.charge(),
                tokens: TokenCount::new(100),
            }),
            Err(error) => Err(error),
        }
    }

    async fn judge(&self, request: JudgeRequest) -> Result<Judgement, DelegateError> {
        self.judge_calls.fetch_add(1, Ordering::SeqCst);
        match request.purpose {
            JudgePurpose::Alignment => {
                let scripted = self
                    .alignment
                    .lock()
                    .expect("lock")
                    .get_mut(request.node.as_str())
                    .and_then(VecDeque::pop_front);
                let mut result = scripted.unwrap_or_else(|| Ok(judgement(1.0, Vec::new())));
                if let Ok(judgement) = &mut result {
                    judgement.cost = self.charge();
                }
                result
            }
            JudgePurpose::EdgeCondition { edge } => {
                let scripted = self
                    .verdicts
                    .lock()
                    .expect("lock")
                    .get_mut(edge.as_str())
                    .and_then(VecDeque::pop_front);
                scripted.unwrap_or(Ok(Some(true))).map(|verdict| Judgement {
                    verdict,
                    score: None,
                    findings: Vec::new(),
                    cost: self.charge(),
                })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingTracker {
    gates: Mutex<HashMap<String, GateSignal>>,
    statuses: Mutex<Vec<StatusUpdate>>,
    escalations: Mutex<Vec<Escalation>>,
    sub_items: Mutex<Vec<SubWorkItemRequest>>,
    created_at: Mutex<Vec<Instant>>,
    creation_delay: Mutex<Duration>,
    creation_fails: AtomicBool,
}

impl RecordingTracker {
    pub fn set_gate(&self, node: &str, signal: GateSignal) {
        self.gates
            .lock()
            .expect("lock")
            .insert(node.to_string(), signal);
    }

    pub fn statuses(&self) -> Vec<StatusUpdate> {
        self.statuses.lock().expect("lock").clone()
    }

    pub fn escalations(&self) -> Vec<Escalation> {
        self.escalations.lock().expect("lock").clone()
    }

    pub fn sub_items(&self) -> Vec<SubWorkItemRequest> {
        self.sub_items.lock().expect("lock").clone()
    }

    /// When each sub-work-item creation completed.
    pub fn created_at(&self) -> Vec<Instant> {
        self.created_at.lock().expect("lock").clone()
    }

    pub fn set_creation_delay(&self, delay: Duration) {
        *self.creation_delay.lock().expect("lock") = delay;
    }

    /// Every creation fails with a non-retryable error.
    pub fn fail_creation(&self) {
        self.creation_fails.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl WorkItemTracker for RecordingTracker {
    async fn gate_signal(&self, _work_item: WorkItemId, node: &NodeId) -> Result<GateSignal, TrackerError> {
        Ok(self
            .gates
            .lock()
            .expect("lock")
            .get(node.as_str())
            .copied()
            .unwrap_or(GateSignal::Pending))
    }

    async fn post_status(&self, update: StatusUpdate) -> Result<(), TrackerError> {
        self.statuses.lock().expect("lock").push(update);
        Ok(())
    }

    async fn post_escalation(&self, escalation: Escalation) -> Result<(), TrackerError> {
        self.escalations.lock().expect("lock").push(escalation);
        Ok(())
    }

    async fn create_sub_work_item(&self, request: SubWorkItemRequest) -> Result<SubWorkItemId, TrackerError> {
        let delay = *self.creation_delay.lock().expect("lock");
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.creation_fails.load(Ordering::SeqCst) {
            return Err(TrackerError {
                message: "issue tracker unavailable".into(),
                policy: pipeline::RetryPolicy::NonRetryable,
            });
        }
        self.created_at.lock().expect("lock").push(Instant::now());
        let mut items = self.sub_items.lock().expect("lock");
        items.push(request);
        Ok(SubWorkItemId::new(100 + items.len() as u64))
    }
}

// ---------------------------------------------------------------------------
// Domain service
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct ScriptedDomain {
    reports: Mutex<VecDeque<Result<ValidationReport, DomainServiceError>>>,
    calls: AtomicUsize,
}

impl ScriptedDomain {
    pub fn new(reports: Vec<Result<ValidationReport, DomainServiceError>>) -> Self {
        Self {
            reports: Mutex::new(reports.into()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DomainServiceClient for ScriptedDomain {
    async fn validate(&self, _request: ValidationRequest) -> Result<ValidationReport, DomainServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.reports
            .lock()
            .expect("lock")
            .pop_front()
            .unwrap_or_else(|| {
                Ok(ValidationReport {
                    findings: Vec::new(),
                    output: json!({ "passed": true }),
                })
            })
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub llm: Arc<ScriptedLlm>,
    pub tracker: Arc<RecordingTracker>,
    pub domain: Arc<ScriptedDomain>,
    pub store: Arc<InMemoryStateStore>,
    pub engine: GraphExecutionEngine,
}

impl Harness {
    pub fn new(graph: PipelineGraph, config: EngineConfig, llm: ScriptedLlm) -> Self {
        Self::with_domain(graph, config, llm, ScriptedDomain::default())
    }

    pub fn with_domain(
        graph: PipelineGraph,
        config: EngineConfig,
        llm: ScriptedLlm,
        domain: ScriptedDomain,
    ) -> Self {
        let llm = Arc::new(llm);
        let tracker = Arc::new(RecordingTracker::default());
        let domain = Arc::new(domain);
        let store = Arc::new(InMemoryStateStore::new());
        let engine = GraphExecutionEngine::new(
            graph,
            config,
            EngineServices {
                llm: llm.clone(),
                judge: None,
                domain: Some(domain.clone()),
                tracker: tracker.clone(),
                store: store.clone(),
            },
        );
        Self {
            llm,
            tracker,
            domain,
            store,
            engine,
        }
    }
}

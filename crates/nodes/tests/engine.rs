mod support;

use std::time::Duration;

use pipeline::alignment::FindingKind;
use pipeline::graph::default_graph;
use pipeline::ports::{DelegateError, Feedback, GateSignal};
use pipeline::state::{NodeState, NodeStatus, PipelineRun, RunStatus};
use pipeline::{
    CogWorksError, DiagnosticSeverity, EdgeId, FailureKind, NodeFailure, NodeId, PipelineRunId,
    SubWorkItemId,
};
use serde_json::json;
use support::*;
use tokio_util::sync::CancellationToken;

fn stored_run(harness: &Harness, run_id: PipelineRunId) -> PipelineRun {
    let snapshot = harness.store.snapshot(run_id).expect("snapshot written");
    PipelineRun::from_snapshot(snapshot, harness.engine.graph()).expect("snapshot loads")
}

fn node<'a>(harness: &Harness, run: &'a PipelineRun, name: &str) -> &'a NodeState {
    run.state(harness.engine.graph().node_index(name).expect("node exists"))
}

fn id(name: &str) -> NodeId {
    NodeId::new(name).expect("non-empty")
}

async fn run_once(harness: &Harness, run_id: PipelineRunId) -> pipeline::report::RunReport {
    harness
        .engine
        .run(request(run_id), CancellationToken::new())
        .await
        .expect("invocation completes")
}

fn routed(mode: &str) -> serde_json::Value {
    json!({
        "name": "routing",
        "nodes": [generative("a"), generative("b"), generative("c")],
        "edges": [
            { "name": "a_b", "from": "a", "to": "b", "mode": mode,
              "condition": { "expression": "output.route_b == true" } },
            { "name": "a_c", "from": "a", "to": "c", "mode": mode,
              "condition": { "expression": "output.route_c == true" } }
        ]
    })
}

// ---------------------------------------------------------------------------
// Routing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn all_matching_both_conditions_true_expected_both_targets_run() {
    let llm = ScriptedLlm::new("model-a").outputs("a", vec![Ok(json!({"route_b": true, "route_c": true}))]);
    let harness = Harness::new(graph(routed("all_matching")), config(10.0), llm);
    let run_id = PipelineRunId::new_random();

    let report = run_once(&harness, run_id).await;

    assert_eq!(report.status, RunStatus::Succeeded);
    assert_eq!(report.completed, vec![id("a"), id("b"), id("c")]);
    assert_eq!(harness.llm.calls_for("b"), 1);
    assert_eq!(harness.llm.calls_for("c"), 1);
}

#[tokio::test]
async fn all_matching_one_condition_false_expected_only_matching_target_runs() {
    let llm = ScriptedLlm::new("model-a").outputs("a", vec![Ok(json!({"route_b": true, "route_c": false}))]);
    let harness = Harness::new(graph(routed("all_matching")), config(10.0), llm);

    let report = run_once(&harness, PipelineRunId::new_random()).await;

    assert_eq!(report.status, RunStatus::Succeeded);
    assert_eq!(harness.llm.calls_for("c"), 0);
}

#[tokio::test]
async fn first_matching_both_conditions_true_expected_first_declared_edge_only() {
    let llm = ScriptedLlm::new("model-a").outputs("a", vec![Ok(json!({"route_b": true, "route_c": true}))]);
    let harness = Harness::new(graph(routed("first_matching")), config(10.0), llm);
    let run_id = PipelineRunId::new_random();

    let report = run_once(&harness, run_id).await;

    assert_eq!(report.status, RunStatus::Succeeded);
    assert_eq!(harness.llm.calls_for("b"), 1);
    assert_eq!(harness.llm.calls_for("c"), 0);
    let run = stored_run(&harness, run_id);
    assert_eq!(node(&harness, &run, "c").status, NodeStatus::Pending);
    let taken: Vec<&str> = run
        .edge_log()
        .iter()
        .filter(|record| record.taken)
        .map(|record| record.edge.as_str())
        .collect();
    assert_eq!(taken, vec!["a_b"]);
}

#[tokio::test]
async fn explicit_mode_next_edges_listed_expected_listed_edge_only() {
    let llm = ScriptedLlm::new("model-a").outputs("a", vec![Ok(json!({"next_edges": ["a_c"], "route_b": true}))]);
    let harness = Harness::new(graph(routed("explicit")), config(10.0), llm);

    let report = run_once(&harness, PipelineRunId::new_random()).await;

    assert_eq!(report.status, RunStatus::Succeeded);
    assert_eq!(harness.llm.calls_for("b"), 0);
    assert_eq!(harness.llm.calls_for("c"), 1);
}

#[tokio::test]
async fn explicit_mode_next_edges_missing_expected_edge_evaluation_failure() {
    let harness = Harness::new(graph(routed("explicit")), config(10.0), ScriptedLlm::new("model-a"));

    let report = run_once(&harness, PipelineRunId::new_random()).await;

    assert_eq!(report.status, RunStatus::Failed);
    assert!(matches!(report.error, Some(CogWorksError::EdgeEvaluation { .. })));
}

#[tokio::test]
async fn judged_condition_delegate_fails_expected_fallback_applied_and_audited() {
    let description = json!({
        "name": "judged",
        "nodes": [generative("a"), generative("b")],
        "edges": [{ "name": "a_b", "from": "a", "to": "b",
                    "condition": { "judged": { "prompt": "Does this need a second look?", "fallback": true } } }]
    });
    let llm = ScriptedLlm::new("model-a").verdicts("a_b", vec![Err(transport("connection reset"))]);
    let harness = Harness::new(graph(description), config(10.0), llm);

    let report = run_once(&harness, PipelineRunId::new_random()).await;

    assert_eq!(report.status, RunStatus::Succeeded);
    assert_eq!(report.fallbacks_applied, 1);
    assert_eq!(harness.llm.judge_calls(), 1);
    assert_eq!(harness.llm.calls_for("b"), 1);
}

#[tokio::test]
async fn composite_conditions_mixing_judged_and_expression_expected_short_circuit_and_negation() {
    let description = json!({
        "name": "composite",
        "nodes": [generative("a"), generative("b"), generative("c")],
        "edges": [
            { "name": "a_b", "from": "a", "to": "b",
              "condition": { "all": [
                  { "expression": "output.risk > 3" },
                  { "judged": { "prompt": "Is a security review warranted?", "fallback": true } }
              ] } },
            { "name": "a_c", "from": "a", "to": "c",
              "condition": { "any": [
                  { "expression": "output.risk > 3" },
                  { "not": { "judged": { "prompt": "Is the change trivial?", "fallback": true } } }
              ] } }
        ]
    });
    let llm = ScriptedLlm::new("model-a")
        .outputs("a", vec![Ok(json!({"risk": 1}))])
        .verdicts("a_c", vec![Ok(Some(false))]);
    let harness = Harness::new(graph(description), config(10.0), llm);

    let report = run_once(&harness, PipelineRunId::new_random()).await;

    assert_eq!(report.status, RunStatus::Succeeded);
    // `all` stops at the false expression, so only `a_c` consults the judge.
    assert_eq!(harness.llm.judge_calls(), 1);
    assert_eq!(report.fallbacks_applied, 0);
    assert_eq!(harness.llm.calls_for("b"), 0);
    assert_eq!(harness.llm.calls_for("c"), 1);
}

#[tokio::test]
async fn dead_end_no_edge_taken_expected_escalated_with_pending_nodes() {
    let description = json!({
        "name": "dead_end",
        "nodes": [generative("a"), generative("b")],
        "edges": [{ "name": "a_b", "from": "a", "to": "b", "condition": { "expression": "output.go == true" } }]
    });
    let llm = ScriptedLlm::new("model-a").outputs("a", vec![Ok(json!({"go": false}))]);
    let harness = Harness::new(graph(description), config(10.0), llm);

    let report = run_once(&harness, PipelineRunId::new_random()).await;

    assert_eq!(report.status, RunStatus::Escalated);
    match report.error {
        Some(CogWorksError::DeadEnd { pending, completed }) => {
            assert_eq!(pending, vec![id("b")]);
            assert_eq!(completed, vec![id("a")]);
        }
        other => panic!("expected dead end, got {other:?}"),
    }
    assert_eq!(harness.tracker.escalations().len(), 1);
}

// ---------------------------------------------------------------------------
// Rework cycles
// ---------------------------------------------------------------------------

#[tokio::test]
async fn rework_edge_max_traversals_three_expected_overflow_on_fourth_request() {
    let description = json!({
        "name": "cycle",
        "nodes": [generative("draft"), generative("check"), generative("done")],
        "edges": [
            edge("draft_check", "draft", "check"),
            { "name": "check_rework", "from": "check", "to": "draft", "mode": "first_matching",
              "condition": { "expression": "output.approved == false" },
              "rework": { "max_traversals": 3, "overflow": "escalate" } },
            { "name": "check_done", "from": "check", "to": "done", "mode": "first_matching",
              "condition": { "expression": "output.approved == true" } }
        ]
    });
    let rejected = || Ok(json!({"approved": false}));
    let llm = ScriptedLlm::new("model-a").outputs("check", vec![rejected(), rejected(), rejected(), rejected()]);
    let harness = Harness::new(graph(description), config(10.0), llm);
    let run_id = PipelineRunId::new_random();

    let report = run_once(&harness, run_id).await;

    assert_eq!(report.status, RunStatus::Escalated);
    assert!(matches!(
        report.error,
        Some(CogWorksError::CycleLimitReached { max_traversals: 3, .. })
    ));
    // Three retakes plus the initial pass.
    assert_eq!(harness.llm.calls_for("draft"), 4);
    assert_eq!(harness.llm.calls_for("check"), 4);
    assert_eq!(harness.llm.calls_for("done"), 0);
    let run = stored_run(&harness, run_id);
    assert_eq!(run.counter(&EdgeId::new("check_rework").expect("non-empty")), 3);
    assert_eq!(harness.tracker.escalations().len(), 1);
}

#[tokio::test]
async fn default_graph_review_requests_changes_once_expected_rework_then_success() {
    let llm = ScriptedLlm::new("model-a")
        .outputs("intake", vec![Ok(json!({"summary": "add retries", "safety_critical": true}))])
        .outputs(
            "planning",
            vec![Ok(json!({"items": [{"title": "retry module", "body": "wrap the fetcher"}]}))],
        )
        .outputs(
            "review",
            vec![
                Ok(json!({"approved": false, "comments": ["no tests"]})),
                Ok(json!({"approved": true, "comments": []})),
            ],
        );
    let harness = Harness::new(default_graph().expect("valid"), config(10.0), llm);
    let run_id = PipelineRunId::new_random();

    let report = run_once(&harness, run_id).await;

    assert_eq!(report.status, RunStatus::Succeeded, "{}", report.summary());
    assert_eq!(harness.llm.calls_for("code_generation"), 2);
    assert_eq!(harness.llm.calls_for("specification"), 1);
    assert_eq!(harness.domain.calls(), 1);
    assert_eq!(harness.tracker.sub_items().len(), 1);

    let second = &harness.llm.requests_for("code_generation")[1];
    assert!(second
        .feedback
        .iter()
        .any(|feedback| matches!(feedback, Feedback::ReworkRequested { edge, .. } if edge.as_str() == "review_rework")));
    assert!(second.previous_output.is_some());

    let run = stored_run(&harness, run_id);
    assert!(run.safety_classified());
    assert_eq!(run.counter(&EdgeId::new("review_rework").expect("non-empty")), 1);
    let alignment = node(&harness, &run, "specification")
        .last_alignment
        .as_ref()
        .expect("alignment recorded");
    assert!(alignment.bias_risk());
    assert!((alignment.threshold().as_f64() - 0.9).abs() < 1e-9);
}

// ---------------------------------------------------------------------------
// Retry and rework budgets
// ---------------------------------------------------------------------------

fn single_aligned_node(max_reworks: u32) -> serde_json::Value {
    json!({
        "name": "single",
        "nodes": [{
            "name": "a",
            "generative": { "instructions": "write the specification" },
            "max_reworks": max_reworks,
            "alignment": { "semantic": true, "threshold": 0.8 }
        }],
        "edges": []
    })
}

#[tokio::test]
async fn invalid_then_misaligned_then_aligned_expected_one_retry_and_one_rework() {
    let llm = ScriptedLlm::new("model-a")
        .outputs(
            "a",
            vec![Err(invalid("not json")), Ok(json!({"v": 1})), Ok(json!({"v": 2}))],
        )
        .alignment("a", vec![Ok(judgement(0.2, Vec::new()))]);
    let harness = Harness::new(graph(single_aligned_node(2)), config(10.0), llm);
    let run_id = PipelineRunId::new_random();

    let report = run_once(&harness, run_id).await;

    assert_eq!(report.status, RunStatus::Succeeded);
    let run = stored_run(&harness, run_id);
    let state = node(&harness, &run, "a");
    assert_eq!(state.ledger.retries(), 1);
    assert_eq!(state.ledger.reworks(), 1);
    assert_eq!(state.last_output, Some(json!({"v": 2})));

    let requests = harness.llm.requests_for("a");
    assert_eq!(requests.len(), 3);
    assert!(matches!(requests[1].feedback.as_slice(), [Feedback::InvalidOutput { .. }]));
    assert!(matches!(
        requests[2].feedback.as_slice(),
        [Feedback::InvalidOutput { attempt: 1, .. }, Feedback::Misaligned { rework: 1, .. }]
    ));
    assert_eq!(requests[2].previous_output, Some(json!({"v": 1})));
}

#[tokio::test]
async fn feedback_four_attempts_expected_every_earlier_error_carried_forward() {
    let llm = ScriptedLlm::new("model-a")
        .outputs(
            "a",
            vec![
                Err(invalid("not json")),
                Err(invalid("missing field 'requirements'")),
                Ok(json!({"v": 1})),
                Ok(json!({"v": 2})),
            ],
        )
        .alignment("a", vec![Ok(judgement(0.2, Vec::new()))]);
    let harness = Harness::new(graph(single_aligned_node(2)), config(10.0), llm);

    let report = run_once(&harness, PipelineRunId::new_random()).await;

    assert_eq!(report.status, RunStatus::Succeeded);
    let requests = harness.llm.requests_for("a");
    assert_eq!(requests.len(), 4);
    assert!(requests[0].feedback.is_empty());
    match requests[3].feedback.as_slice() {
        [Feedback::InvalidOutput { attempt: 1, errors: first }, Feedback::InvalidOutput { attempt: 2, errors: second }, Feedback::Misaligned { rework: 1, .. }] =>
        {
            assert!(first[0].contains("not json"));
            assert!(second[0].contains("requirements"));
        }
        other => panic!("expected the full feedback history, got {other:?}"),
    }
}

#[tokio::test]
async fn blocking_missing_finding_high_score_expected_misaligned_and_reworked() {
    let missing = finding(FindingKind::Missing, DiagnosticSeverity::Blocking, "requirement R2 is not covered");
    let llm = ScriptedLlm::new("model-a").alignment("a", vec![Ok(judgement(0.95, vec![missing]))]);
    let harness = Harness::new(graph(single_aligned_node(2)), config(10.0), llm);
    let run_id = PipelineRunId::new_random();

    let report = run_once(&harness, run_id).await;

    assert_eq!(report.status, RunStatus::Succeeded);
    let run = stored_run(&harness, run_id);
    let ledger = &node(&harness, &run, "a").ledger;
    assert_eq!(ledger.retries(), 0);
    assert_eq!(ledger.reworks(), 1);
    assert_eq!(ledger.rework_history()[0].findings[0].kind, FindingKind::Missing);
}

#[tokio::test]
async fn rework_budget_zero_misaligned_expected_rework_exhausted_escalation() {
    let missing = finding(FindingKind::Missing, DiagnosticSeverity::Blocking, "requirement R2 is not covered");
    let llm = ScriptedLlm::new("model-a").alignment("a", vec![Ok(judgement(0.95, vec![missing]))]);
    let harness = Harness::new(graph(single_aligned_node(0)), config(10.0), llm);

    let report = run_once(&harness, PipelineRunId::new_random()).await;

    assert_eq!(report.status, RunStatus::Escalated);
    assert_eq!(report.failed, vec![(id("a"), FailureKind::ReworkExhausted)]);
    let escalations = harness.tracker.escalations();
    assert_eq!(escalations.len(), 1);
    assert!(matches!(
        escalations[0].nodes[0].failure,
        Some(NodeFailure::ReworkExhausted { .. })
    ));
}

#[tokio::test]
async fn invalid_output_every_attempt_expected_retry_exhausted_with_all_errors() {
    let description = json!({ "name": "single", "nodes": [generative("a")], "edges": [] });
    let outputs = (0..4).map(|n| Err(invalid(&format!("bad output {n}")))).collect();
    let llm = ScriptedLlm::new("model-a").outputs("a", outputs);
    let harness = Harness::new(graph(description), config(10.0), llm);
    let run_id = PipelineRunId::new_random();

    let report = run_once(&harness, run_id).await;

    assert_eq!(report.status, RunStatus::Escalated);
    let run = stored_run(&harness, run_id);
    match &node(&harness, &run, "a").failure {
        Some(NodeFailure::RetryExhausted { attempts }) => assert_eq!(attempts.len(), 4),
        other => panic!("expected retry exhaustion, got {other:?}"),
    }
    // Infrastructure retry never consumes the node's retry budget.
    assert_eq!(harness.llm.calls_for("a"), 4);
}

#[tokio::test]
async fn transport_error_once_expected_infrastructure_retry_without_ledger_change() {
    let description = json!({ "name": "single", "nodes": [generative("a")], "edges": [] });
    let llm = ScriptedLlm::new("model-a").outputs("a", vec![Err(transport("503"))]);
    let harness = Harness::new(graph(description), config(10.0), llm);
    let run_id = PipelineRunId::new_random();

    let report = run_once(&harness, run_id).await;

    assert_eq!(report.status, RunStatus::Succeeded);
    assert_eq!(harness.llm.calls_for("a"), 2);
    let run = stored_run(&harness, run_id);
    assert_eq!(node(&harness, &run, "a").ledger.attempts(), 0);
}

#[tokio::test]
async fn terminal_run_invoked_again_expected_unchanged_until_restart() {
    let description = json!({ "name": "single", "nodes": [generative("a")], "edges": [] });
    let outputs = (0..4).map(|_| Err(invalid("bad"))).collect();
    let llm = ScriptedLlm::new("model-a").outputs("a", outputs);
    let harness = Harness::new(graph(description), config(10.0), llm);
    let run_id = PipelineRunId::new_random();

    let first = run_once(&harness, run_id).await;
    let again = run_once(&harness, run_id).await;
    assert_eq!(first.status, RunStatus::Escalated);
    assert_eq!(again.status, RunStatus::Escalated);
    assert_eq!(harness.llm.calls_for("a"), 4);

    let mut restart = request(run_id);
    restart.restart = true;
    let restarted = harness
        .engine
        .run(restart, CancellationToken::new())
        .await
        .expect("invocation completes");
    assert_eq!(restarted.status, RunStatus::Succeeded);
}

// ---------------------------------------------------------------------------
// Concurrency, budget and fan-in
// ---------------------------------------------------------------------------

fn fan_out(targets: &[&str]) -> serde_json::Value {
    let mut nodes = vec![generative("a")];
    let mut edges = Vec::new();
    for target in targets {
        nodes.push(generative(target));
        edges.push(edge(&format!("a_{target}"), "a", target));
    }
    json!({ "name": "fan_out", "nodes": nodes, "edges": edges })
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn concurrent_reservations_80_and_80_against_100_expected_exactly_one_denied() {
    let llm = ScriptedLlm::new("model-a")
        .with_node_delay("b", Duration::from_millis(50))
        .with_node_delay("c", Duration::from_millis(50));
    let mut config = config(1.0);
    config.per_call_reservation = usd(0.8);
    let harness = Harness::new(graph(fan_out(&["b", "c"])), config, llm);

    let report = run_once(&harness, PipelineRunId::new_random()).await;

    assert_eq!(report.status, RunStatus::Escalated);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].1, FailureKind::BudgetExceeded);
    assert_eq!(harness.llm.calls_for("b") + harness.llm.calls_for("c"), 1);
    assert!(report.budget.consumed.as_f64() <= 1.0);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn generative_cap_two_four_ready_nodes_expected_at_most_two_in_flight() {
    let llm = ScriptedLlm::new("model-a").with_delay(Duration::from_millis(10));
    let mut config = config(10.0);
    config.max_concurrent_generative = 2;
    let harness = Harness::new(graph(fan_out(&["b", "c", "d", "e"])), config, llm);

    let report = run_once(&harness, PipelineRunId::new_random()).await;

    assert_eq!(report.status, RunStatus::Succeeded);
    assert_eq!(harness.llm.max_in_flight(), 2);
}

fn diamond() -> serde_json::Value {
    json!({
        "name": "diamond",
        "nodes": [
            generative("a"),
            { "name": "b", "generative": { "instructions": "b" }, "required_inputs": ["a"] },
            { "name": "c", "generative": { "instructions": "c" }, "required_inputs": ["a"] },
            { "name": "d", "generative": { "instructions": "d" }, "required_inputs": ["b", "c"] }
        ],
        "edges": [
            edge("a_b", "a", "b"),
            edge("a_c", "a", "c"),
            edge("b_d", "b", "d"),
            edge("c_d", "c", "d")
        ]
    })
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn fan_in_slow_contributor_expected_target_waits_for_both_inputs() {
    let llm = ScriptedLlm::new("model-a")
        .with_node_delay("c", Duration::from_millis(100))
        .outputs("b", vec![Ok(json!({"part": "b"}))])
        .outputs("c", vec![Ok(json!({"part": "c"}))]);
    let harness = Harness::new(graph(diamond()), config(10.0), llm);

    let report = run_once(&harness, PipelineRunId::new_random()).await;

    assert_eq!(report.status, RunStatus::Succeeded);
    assert_eq!(harness.llm.calls(), vec!["a", "b", "c", "d"]);
    let input = &harness.llm.requests_for("d")[0].input;
    assert_eq!(input["b"], json!({"part": "b"}));
    assert_eq!(input["c"], json!({"part": "c"}));
}

#[tokio::test]
async fn fan_in_contributor_fails_expected_target_blocked() {
    let outputs = (0..4).map(|_| Err(invalid("bad"))).collect();
    let llm = ScriptedLlm::new("model-a").outputs("c", outputs);
    let harness = Harness::new(graph(diamond()), config(10.0), llm);
    let run_id = PipelineRunId::new_random();

    let report = run_once(&harness, run_id).await;

    assert_eq!(report.status, RunStatus::Escalated);
    assert_eq!(report.blocked, vec![id("d")]);
    let run = stored_run(&harness, run_id);
    assert_eq!(
        node(&harness, &run, "d").failure,
        Some(NodeFailure::Blocked { upstream: id("c") })
    );
    assert_eq!(harness.llm.calls_for("d"), 0);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn abort_siblings_on_failure_expected_sibling_finishes_call_then_aborts() {
    let description = json!({
        "name": "siblings",
        "nodes": [
            generative("a"),
            { "name": "b", "generative": { "instructions": "b" }, "abort_siblings_on_failure": true },
            generative("c")
        ],
        "edges": [edge("a_b", "a", "b"), edge("a_c", "a", "c")]
    });
    let llm = ScriptedLlm::new("model-a")
        .with_node_delay("b", Duration::from_millis(10))
        .with_node_delay("c", Duration::from_millis(100))
        .outputs("b", vec![Err(DelegateError::Rejected { message: "policy".into() })]);
    let harness = Harness::new(graph(description), config(10.0), llm);
    let run_id = PipelineRunId::new_random();

    let report = run_once(&harness, run_id).await;

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(harness.llm.calls_for("c"), 1);
    let run = stored_run(&harness, run_id);
    assert_eq!(
        node(&harness, &run, "c").failure,
        Some(NodeFailure::AbortedBySibling { sibling: id("b") })
    );
    assert!(matches!(
        report.error,
        Some(CogWorksError::NodeFailed { ref node, .. }) if node.as_str() == "b"
    ));
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn cancellation_mid_run_expected_in_flight_finishes_and_nothing_new_starts() {
    let description = json!({
        "name": "pair",
        "nodes": [generative("a"), generative("b")],
        "edges": [edge("a_b", "a", "b")]
    });
    let llm = ScriptedLlm::new("model-a").with_node_delay("a", Duration::from_millis(50));
    let harness = Harness::new(graph(description), config(10.0), llm);
    let run_id = PipelineRunId::new_random();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        trigger.cancel();
    });
    let report = harness
        .engine
        .run(request(run_id), cancel)
        .await
        .expect("invocation completes");

    assert_eq!(report.status, RunStatus::Cancelled);
    assert_eq!(report.completed, vec![id("a")]);
    assert_eq!(harness.llm.calls_for("b"), 0);
    assert_eq!(stored_run(&harness, run_id).status(), RunStatus::Cancelled);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn cancellation_with_node_queued_behind_cap_expected_queued_node_never_starts() {
    let llm = ScriptedLlm::new("model-a")
        .with_node_delay("b", Duration::from_millis(50))
        .with_node_delay("c", Duration::from_millis(50));
    let mut config = config(10.0);
    config.max_concurrent_generative = 1;
    let harness = Harness::new(graph(fan_out(&["b", "c"])), config, llm);
    let run_id = PipelineRunId::new_random();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        trigger.cancel();
    });
    let report = harness
        .engine
        .run(request(run_id), cancel)
        .await
        .expect("invocation completes");

    assert_eq!(report.status, RunStatus::Cancelled);
    assert_eq!(harness.llm.calls_for("b") + harness.llm.calls_for("c"), 1);
    assert_eq!(report.completed, vec![id("a"), id("b")]);
    let run = stored_run(&harness, run_id);
    assert_eq!(node(&harness, &run, "c").status, NodeStatus::Pending);
}

// ---------------------------------------------------------------------------
// Gates and resume
// ---------------------------------------------------------------------------

fn gated() -> serde_json::Value {
    json!({
        "name": "gated",
        "nodes": [generative("a"), { "name": "b", "generative": { "instructions": "b" }, "gate": "human" }],
        "edges": [edge("a_b", "a", "b")]
    })
}

#[tokio::test]
async fn human_gate_without_signal_expected_awaiting_then_resumes_after_approval() {
    let harness = Harness::new(graph(gated()), config(10.0), ScriptedLlm::new("model-a"));
    let run_id = PipelineRunId::new_random();

    let first = run_once(&harness, run_id).await;
    assert_eq!(first.status, RunStatus::Running);
    assert!(first.is_awaiting_approval());
    assert_eq!(first.awaiting_approval, vec![id("b")]);
    assert_eq!(harness.llm.calls_for("b"), 0);

    harness.tracker.set_gate("b", GateSignal::Approved);
    let second = run_once(&harness, run_id).await;
    assert_eq!(second.status, RunStatus::Succeeded);
    assert_eq!(harness.llm.calls_for("a"), 1);
    assert_eq!(harness.llm.calls_for("b"), 1);
}

#[tokio::test]
async fn human_gate_rejected_expected_run_failed() {
    let harness = Harness::new(graph(gated()), config(10.0), ScriptedLlm::new("model-a"));
    let run_id = PipelineRunId::new_random();
    run_once(&harness, run_id).await;

    harness.tracker.set_gate("b", GateSignal::Rejected);
    let report = run_once(&harness, run_id).await;

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.failed, vec![(id("b"), FailureKind::GateRejected)]);
}

#[tokio::test]
async fn resume_after_crash_mid_node_expected_same_ready_set_as_uninterrupted() {
    let harness = Harness::new(graph(gated()), config(10.0), ScriptedLlm::new("model-a"));
    let run_id = PipelineRunId::new_random();
    run_once(&harness, run_id).await;

    let graph = harness.engine.graph();
    let uninterrupted = stored_run(&harness, run_id);
    let expected = uninterrupted.ready_nodes(graph);
    assert_eq!(expected, vec![graph.node_index("b").expect("exists")]);

    // Crash while `b` was executing.
    let mut crashed = uninterrupted.clone();
    crashed.state_mut(expected[0]).status = NodeStatus::Executing;
    harness
        .store
        .insert(run_id, crashed.to_snapshot().expect("serialises"));

    let mut resumed = stored_run(&harness, run_id);
    assert_eq!(resumed.resume_in_flight(), vec![id("b")]);
    assert_eq!(resumed.ready_nodes(graph), expected);

    harness.tracker.set_gate("b", GateSignal::Approved);
    let report = run_once(&harness, run_id).await;
    assert_eq!(report.status, RunStatus::Succeeded);
    assert_eq!(harness.llm.calls_for("a"), 1);
    assert_eq!(harness.llm.calls_for("b"), 1);
}

#[tokio::test]
async fn snapshot_from_other_graph_expected_configuration_error() {
    let first = Harness::new(graph(gated()), config(10.0), ScriptedLlm::new("model-a"));
    let run_id = PipelineRunId::new_random();
    run_once(&first, run_id).await;
    let snapshot = first.store.snapshot(run_id).expect("written");

    let other = Harness::new(graph(routed("all_matching")), config(10.0), ScriptedLlm::new("model-a"));
    other.store.insert(run_id, snapshot);
    let result = other.engine.run(request(run_id), CancellationToken::new()).await;

    assert!(matches!(result, Err(CogWorksError::ConfigurationError { .. })));
}

// ---------------------------------------------------------------------------
// Deterministic and spawning nodes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn deterministic_blocking_findings_expected_retry_then_success() {
    use pipeline::ports::ValidationReport;
    use pipeline::{Diagnostic, DiagnosticCategory};

    let description = json!({
        "name": "checked",
        "nodes": [{ "name": "lint", "deterministic": { "service": "linter" } }],
        "edges": []
    });
    let blocking = ValidationReport {
        findings: vec![Diagnostic {
            artifact: None,
            location: Some("line 3".into()),
            severity: DiagnosticSeverity::Blocking,
            category: DiagnosticCategory::new("style").expect("non-empty"),
            message: "tabs are not allowed".into(),
        }],
        output: json!({"passed": false}),
    };
    let domain = ScriptedDomain::new(vec![Ok(blocking)]);
    let harness = Harness::with_domain(graph(description), config(10.0), ScriptedLlm::new("model-a"), domain);
    let run_id = PipelineRunId::new_random();

    let report = run_once(&harness, run_id).await;

    assert_eq!(report.status, RunStatus::Succeeded);
    assert_eq!(harness.domain.calls(), 2);
    let run = stored_run(&harness, run_id);
    let state = node(&harness, &run, "lint");
    assert_eq!(state.ledger.retries(), 1);
    assert_eq!(state.last_output.as_ref().map(|o| o["passed"].clone()), Some(json!(true)));
}

#[tokio::test]
async fn spawning_node_over_limit_expected_capped_items_and_completion() {
    let description = json!({
        "name": "spawn",
        "nodes": [{ "name": "plan", "spawning": { "instructions": "split", "max_items": 2 } }],
        "edges": []
    });
    let items = json!({"items": [
        {"title": "one", "body": "1"},
        {"title": "two", "body": "2"},
        {"title": "three", "body": "3"}
    ]});
    let llm = ScriptedLlm::new("model-a").outputs("plan", vec![Ok(items)]);
    let harness = Harness::new(graph(description), config(10.0), llm);
    let run_id = PipelineRunId::new_random();

    let report = run_once(&harness, run_id).await;

    assert_eq!(report.status, RunStatus::Succeeded);
    assert_eq!(harness.tracker.sub_items().len(), 2);
    let run = stored_run(&harness, run_id);
    let state = node(&harness, &run, "plan");
    assert_eq!(state.sub_work_items.len(), 2);
    assert!(state.last_error.is_some());
}

fn spawn_then_build() -> serde_json::Value {
    json!({
        "name": "spawn_then_build",
        "nodes": [
            { "name": "plan", "spawning": { "instructions": "split the work" } },
            generative("build")
        ],
        "edges": [edge("plan_build", "plan", "build")]
    })
}

fn one_item() -> serde_json::Value {
    json!({"items": [{"title": "docs", "body": "document the retry policy"}]})
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn spawning_node_slow_creation_expected_downstream_runs_before_items_land() {
    let llm = ScriptedLlm::new("model-a").outputs("plan", vec![Ok(one_item())]);
    let harness = Harness::new(graph(spawn_then_build()), config(10.0), llm);
    harness.tracker.set_creation_delay(Duration::from_millis(100));
    let run_id = PipelineRunId::new_random();

    let report = run_once(&harness, run_id).await;

    assert_eq!(report.status, RunStatus::Succeeded);
    let build_started = harness.llm.first_call_at("build").expect("build ran");
    let created = harness.tracker.created_at();
    assert_eq!(created.len(), 1);
    assert!(build_started < created[0]);
    let run = stored_run(&harness, run_id);
    assert_eq!(node(&harness, &run, "plan").sub_work_items, vec![SubWorkItemId::new(101)]);
}

#[tokio::test]
async fn spawning_node_creation_fails_expected_downstream_runs_and_error_recorded() {
    let llm = ScriptedLlm::new("model-a").outputs("plan", vec![Ok(one_item())]);
    let harness = Harness::new(graph(spawn_then_build()), config(10.0), llm);
    harness.tracker.fail_creation();
    let run_id = PipelineRunId::new_random();

    let report = run_once(&harness, run_id).await;

    assert_eq!(report.status, RunStatus::Succeeded);
    assert_eq!(harness.llm.calls_for("build"), 1);
    let run = stored_run(&harness, run_id);
    let plan = node(&harness, &run, "plan");
    assert_eq!(plan.status, NodeStatus::Completed);
    assert!(plan.sub_work_items.is_empty());
    assert!(plan.last_error.as_deref().is_some_and(|error| error.contains("docs")));
    assert_eq!(plan.last_output.as_ref().map(|output| output["proposed"].clone()), Some(json!(["docs"])));
}

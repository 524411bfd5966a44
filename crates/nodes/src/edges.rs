//! Edge condition evaluation for a completed node.
//!
//! Deterministic expressions are evaluated synchronously against a
//! [`RunView`]. Judged conditions are delegated to the LLM with a mandatory
//! static fallback: when the delegate is missing, fails, or gives no usable
//! verdict, the fallback decides and a `FallbackApplied` event is recorded.
//! A judged call that cannot get budget is an evaluation failure, never a
//! silent fallback.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use pipeline::budget::{BudgetDenied, NodeBudget};
use pipeline::condition::{Condition, JudgedCondition};
use pipeline::graph::{EdgeIndex, EvaluationMode, NodeIndex, PipelineGraph};
use pipeline::ports::{JudgePurpose, JudgeRequest, LlmProvider};
use pipeline::state::{EdgeEvaluationRecord, EvaluationEvent, PipelineRun, RunView};
use pipeline::{EdgeId, NodeId, Timestamp};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

/// Why an edge evaluation stopped the run.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConditionError {
    /// The budget could not cover a judged condition.
    #[error("judged condition on edge '{edge}' could not reserve budget: {denied}")]
    BudgetDenied { edge: EdgeId, denied: BudgetDenied },

    /// The node output named an edge that does not exist or is not its own.
    #[error("explicit routing from node '{node}' is invalid: {message}")]
    ExplicitRouting { node: NodeId, message: String },
}

/// Edges chosen for one completed node, plus an audit record per evaluated edge.
#[derive(Debug, Clone, PartialEq)]
pub struct EdgeDecision {
    /// Edges to traverse, in evaluation order. Empty means dead end.
    pub taken: Vec<EdgeIndex>,
    /// One record per edge actually evaluated; short-circuited edges have none.
    pub records: Vec<EdgeEvaluationRecord>,
}

/// Everything an evaluation reads. The run must already hold the completed
/// node's final state.
pub struct EdgeContext<'a> {
    pub graph: &'a PipelineGraph,
    pub run: &'a PipelineRun,
    pub node: NodeIndex,
    /// Budget view of the completed node; judged calls are charged to it.
    pub budget: &'a NodeBudget,
}

type EvalFuture<'a> = Pin<Box<dyn Future<Output = Result<bool, ConditionError>> + Send + 'a>>;

/// Decides which outgoing edges of a completed node are taken.
///
/// Expression conditions are evaluated locally. Judged conditions go to the
/// judge and fall back to their configured default when it gives no verdict.
pub struct EdgeEvaluator {
    judge: Option<Arc<dyn LlmProvider>>,
}

impl EdgeEvaluator {
    /// Without a judge every judged condition resolves to its default.
    pub fn new(judge: Option<Arc<dyn LlmProvider>>) -> Self {
        Self { judge }
    }

    /// Evaluates the outgoing edges of `context.node` under the node's group mode.
    pub async fn evaluate(&self, context: &EdgeContext<'_>) -> Result<EdgeDecision, ConditionError> {
        let graph = context.graph;
        let outgoing = graph.outgoing(context.node);
        let mut decision = EdgeDecision {
            taken: Vec::new(),
            records: Vec::with_capacity(outgoing.len()),
        };

        match graph.group_mode(context.node) {
            EvaluationMode::Explicit => self.explicit(context, &mut decision)?,
            mode => {
                for &edge in outgoing {
                    let mut events = Vec::new();
                    let taken = self
                        .condition(context, edge, &graph.edge(edge).condition, &mut events)
                        .await?;
                    decision.records.push(record(context, edge, taken, events));
                    if taken {
                        decision.taken.push(edge);
                        if mode == EvaluationMode::FirstMatching {
                            break;
                        }
                    }
                }
            }
        }

        debug!(
            node = %graph.node(context.node).id,
            mode = graph.group_mode(context.node).as_str(),
            taken = decision.taken.len(),
            evaluated = decision.records.len(),
            "Edges evaluated"
        );
        Ok(decision)
    }

    fn explicit(
        &self,
        context: &EdgeContext<'_>,
        decision: &mut EdgeDecision,
    ) -> Result<(), ConditionError> {
        let graph = context.graph;
        let node = &graph.node(context.node).id;
        let invalid = |message: String| ConditionError::ExplicitRouting {
            node: node.clone(),
            message,
        };

        let listed = context
            .run
            .state(context.node)
            .last_output
            .as_ref()
            .and_then(|output| output.get("next_edges"))
            .and_then(Value::as_array)
            .ok_or_else(|| invalid("output has no 'next_edges' list".into()))?;

        let mut names = Vec::with_capacity(listed.len());
        for entry in listed {
            let name = entry
                .as_str()
                .ok_or_else(|| invalid(format!("'next_edges' entry {entry} is not a string")))?;
            let known = graph
                .outgoing(context.node)
                .iter()
                .any(|edge| graph.edge(*edge).id.as_str() == name);
            if !known {
                return Err(invalid(format!("'{name}' is not an outgoing edge")));
            }
            names.push(name);
        }

        for &edge in graph.outgoing(context.node) {
            let taken = names.contains(&graph.edge(edge).id.as_str());
            decision.records.push(record(
                context,
                edge,
                taken,
                vec![EvaluationEvent::Explicit { listed: taken }],
            ));
            if taken {
                decision.taken.push(edge);
            }
        }
        Ok(())
    }

    fn condition<'s, 'c: 's>(
        &'s self,
        context: &'s EdgeContext<'c>,
        edge: EdgeIndex,
        condition: &'s Condition,
        events: &'s mut Vec<EvaluationEvent>,
    ) -> EvalFuture<'s> {
        Box::pin(async move {
            match condition {
                Condition::Always => Ok(true),
                Condition::Expression(expression) => {
                    let view = RunView {
                        graph: context.graph,
                        run: context.run,
                        current: context.node,
                        cost: context.budget.tracker().committed(),
                    };
                    let result = expression.evaluate(&view);
                    events.push(EvaluationEvent::Expression {
                        expression: expression.source().to_string(),
                        result,
                    });
                    Ok(result)
                }
                Condition::Judged(judged) => self.judged(context, edge, judged, events).await,
                Condition::All(items) => {
                    for item in items {
                        if !self.condition(context, edge, item, events).await? {
                            return Ok(false);
                        }
                    }
                    Ok(true)
                }
                Condition::Any(items) => {
                    let mut first_error = None;
                    for item in items {
                        match self.condition(context, edge, item, events).await {
                            Ok(true) => return Ok(true),
                            Ok(false) => {}
                            Err(error) => {
                                first_error.get_or_insert(error);
                            }
                        }
                    }
                    first_error.map_or(Ok(false), Err)
                }
                Condition::Not(inner) => Ok(!self.condition(context, edge, inner, events).await?),
            }
        })
    }

    async fn judged(
        &self,
        context: &EdgeContext<'_>,
        edge: EdgeIndex,
        judged: &JudgedCondition,
        events: &mut Vec<EvaluationEvent>,
    ) -> Result<bool, ConditionError> {
        let edge_id = context.graph.edge(edge).id.clone();
        let fallback = |events: &mut Vec<EvaluationEvent>, reason: String| {
            warn!(edge = %edge_id, fallback = judged.fallback, %reason, "Judged condition fell back");
            events.push(EvaluationEvent::FallbackApplied {
                prompt: judged.prompt.clone(),
                fallback: judged.fallback,
                reason,
            });
            judged.fallback
        };

        let Some(judge) = &self.judge else {
            return Ok(fallback(events, "no judge delegate configured".into()));
        };

        let reservation = context
            .budget
            .reserve("edge_condition")
            .map_err(|denied| ConditionError::BudgetDenied {
                edge: edge_id.clone(),
                denied,
            })?;

        let state = context.run.state(context.node);
        let request = JudgeRequest {
            run_id: context.run.run_id(),
            node: state.node.clone(),
            purpose: JudgePurpose::EdgeCondition {
                edge: edge_id.clone(),
            },
            instructions: judged.prompt.clone(),
            input: context.run.input().clone(),
            output: state.last_output.clone().unwrap_or(Value::Null),
            cost_ceiling: reservation.amount(),
        };

        let (cost, verdict) = match judge.judge(request).await {
            Ok(judgement) => (judgement.cost, Ok(judgement.verdict)),
            Err(error) => (error.cost(), Err(error.to_string())),
        };
        context
            .budget
            .settle(reservation, cost)
            .map_err(|denied| ConditionError::BudgetDenied {
                edge: edge_id.clone(),
                denied,
            })?;

        match verdict {
            Ok(Some(verdict)) => {
                events.push(EvaluationEvent::Judged {
                    prompt: judged.prompt.clone(),
                    verdict,
                });
                Ok(verdict)
            }
            Ok(None) => Ok(fallback(events, "delegate returned no verdict".into())),
            Err(message) => Ok(fallback(events, message)),
        }
    }
}

fn record(
    context: &EdgeContext<'_>,
    edge: EdgeIndex,
    taken: bool,
    events: Vec<EvaluationEvent>,
) -> EdgeEvaluationRecord {
    EdgeEvaluationRecord {
        edge: context.graph.edge(edge).id.clone(),
        source: context.graph.node(context.node).id.clone(),
        taken,
        events,
        at: Timestamp::now(),
    }
}

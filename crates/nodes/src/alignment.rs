//! Alignment verification of a node output against its input.
//!
//! Structural checks run locally. The semantic check is delegated to a judge
//! framed adversarially ("find what is missing, invented or changed"). A
//! judge with the same identity as the producer marks the result with
//! `bias_risk`; on safety-classified runs the threshold is then raised by the
//! configured uplift. Judge failures are infrastructure failures of the
//! alignment step: they are retried here and never reach the rework budget.

use std::sync::Arc;

use pipeline::alignment::{merge_verdicts, run_structural_checks, AlignmentResult};
use pipeline::budget::{BudgetDenied, NodeBudget};
use pipeline::graph::AlignmentSpec;
use pipeline::ports::{DelegateError, JudgePurpose, JudgeRequest, LlmProvider, Retryable};
use pipeline::{AlignmentScore, DelegateId, NodeId, PipelineRunId, RetryPolicy};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

use crate::retry::{retry_infrastructure, RetryBackoffConfig};

const ADVERSARIAL_FRAMING: &str = "You are an adversarial reviewer. Compare the output against the input and report every requirement that is missing, every element that was invented, every value that was changed, anything ambiguous, and anything beyond the requested scope. Score alignment from 0.0 (unrelated) to 1.0 (faithful).";

/// Verification could not produce a result. Never a low score.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum VerificationError {
    /// Transient judge failures outlasted the retry budget.
    #[error("alignment judge failed after {attempts} attempt(s): {message}")]
    Infrastructure { attempts: u32, message: String },

    /// The judge refused the request outright.
    #[error("alignment judge rejected the request: {message}")]
    Rejected { message: String },

    #[error(transparent)]
    Budget(#[from] BudgetDenied),
}

/// One verification to perform.
pub struct VerificationRequest<'a> {
    pub run_id: PipelineRunId,
    pub node: &'a NodeId,
    pub spec: &'a AlignmentSpec,
    pub input: &'a Value,
    pub output: &'a Value,
    /// Delegate that produced `output`, if any.
    pub producer: Option<&'a DelegateId>,
    pub safety_classified: bool,
    pub budget: &'a NodeBudget,
}

/// Runs the structural checks, then the adversarial semantic check when the
/// node asks for one.
///
/// On safety-classified runs where the judge is also the producer, the
/// acceptance threshold is raised by `bias_uplift`.
pub struct AlignmentVerifier {
    judge: Arc<dyn LlmProvider>,
    retry: RetryBackoffConfig,
    bias_uplift: f64,
}

#[derive(Debug)]
enum JudgeFailure {
    Delegate(DelegateError),
    Budget(BudgetDenied),
    NoScore,
}

impl std::fmt::Display for JudgeFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Delegate(error) => write!(f, "{error}"),
            Self::Budget(denied) => write!(f, "{denied}"),
            Self::NoScore => write!(f, "judge returned no alignment score"),
        }
    }
}

impl Retryable for JudgeFailure {
    fn retry_policy(&self) -> RetryPolicy {
        match self {
            Self::Delegate(DelegateError::InvalidOutput { .. }) | Self::NoScore => {
                RetryPolicy::Retryable { after: None }
            }
            Self::Delegate(error) => error.retry_policy(),
            Self::Budget(_) => RetryPolicy::NonRetryable,
        }
    }
}

impl AlignmentVerifier {
    pub fn new(judge: Arc<dyn LlmProvider>, retry: RetryBackoffConfig, bias_uplift: f64) -> Self {
        Self {
            judge,
            retry,
            bias_uplift,
        }
    }

    /// Scores `request.output` against `request.input`. Structural findings
    /// alone never fail verification; the result says whether it is aligned.
    pub async fn verify(
        &self,
        request: VerificationRequest<'_>,
    ) -> Result<AlignmentResult, VerificationError> {
        let structural = run_structural_checks(&request.spec.structural, request.input, request.output);
        debug!(
            node = %request.node,
            structural_score = %structural.score,
            findings = structural.findings.len(),
            "Structural alignment checks complete"
        );
        if !request.spec.semantic {
            return Ok(merge_verdicts(structural, None, request.spec.threshold));
        }

        let judge_id = self.judge.identity();
        let bias_risk = request.producer == Some(&judge_id);
        let threshold = if bias_risk && request.safety_classified {
            request.spec.threshold.raised_by(self.bias_uplift)
        } else {
            request.spec.threshold
        };

        let judge_request = JudgeRequest {
            run_id: request.run_id,
            node: request.node.clone(),
            purpose: JudgePurpose::Alignment,
            instructions: ADVERSARIAL_FRAMING.to_string(),
            input: request.input.clone(),
            output: request.output.clone(),
            cost_ceiling: pipeline::TokenCost::zero(),
        };
        let budget = request.budget;

        let outcome = retry_infrastructure(&self.retry, "alignment", |_| {
            let judge = Arc::clone(&self.judge);
            let mut judge_request = judge_request.clone();
            async move {
                let reservation = budget.reserve("alignment").map_err(JudgeFailure::Budget)?;
                judge_request.cost_ceiling = reservation.amount();
                match judge.judge(judge_request).await {
                    Ok(judgement) => {
                        budget
                            .settle(reservation, judgement.cost)
                            .map_err(JudgeFailure::Budget)?;
                        let score = judgement.score.ok_or(JudgeFailure::NoScore)?;
                        Ok((AlignmentScore::clamped(score), judgement.findings))
                    }
                    Err(error) => {
                        budget
                            .settle(reservation, error.cost())
                            .map_err(JudgeFailure::Budget)?;
                        Err(JudgeFailure::Delegate(error))
                    }
                }
            }
        })
        .await;

        let semantic = match outcome {
            Ok(semantic) => semantic,
            Err(failure) => {
                return Err(match failure.error {
                    JudgeFailure::Budget(denied) => VerificationError::Budget(denied),
                    JudgeFailure::Delegate(DelegateError::Rejected { message }) => {
                        VerificationError::Rejected { message }
                    }
                    other => VerificationError::Infrastructure {
                        attempts: failure.attempts,
                        message: other.to_string(),
                    },
                })
            }
        };

        let result = merge_verdicts(structural, Some(semantic), threshold).with_judge(judge_id, bias_risk);
        info!(
            node = %request.node,
            aligned = result.aligned(),
            score = %result.score(),
            threshold = %result.threshold(),
            bias_risk,
            "Alignment verified"
        );
        Ok(result)
    }
}

//! Per-node retry and rework accounting.
//!
//! Retries answer "the output was technically invalid" (schema violation,
//! unparseable delegate output, blocking service diagnostics). Reworks answer
//! "the output was valid but not aligned with its input". The two counters are
//! independent, monotonic within a run, and each has its own maximum.

use serde::{Deserialize, Serialize};

use crate::alignment::AlignmentFinding;
use crate::errors::NodeFailure;
use crate::{AlignmentScore, Diagnostic, Timestamp};

/// The error of one invalid attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptError {
    /// 1-based attempt number within the node.
    pub attempt: u32,
    pub message: String,
    /// Diagnostics returned by a domain service, if any.
    #[serde(default)]
    pub diagnostics: Vec<Diagnostic>,
    pub at: Timestamp,
}

/// The alignment outcome of one rework.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReworkRecord {
    /// 1-based rework number within the node.
    pub rework: u32,
    pub score: AlignmentScore,
    pub threshold: AlignmentScore,
    pub findings: Vec<AlignmentFinding>,
    pub at: Timestamp,
}

/// Whether the node may try again after a recorded failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerDecision {
    TryAgain,
    Exhausted,
}

/// Retry and rework counters for one node within one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttemptLedger {
    retries: u32,
    reworks: u32,
    #[serde(default)]
    attempt_errors: Vec<AttemptError>,
    #[serde(default)]
    rework_history: Vec<ReworkRecord>,
}

impl AttemptLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Retries consumed so far.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Reworks consumed so far.
    pub fn reworks(&self) -> u32 {
        self.reworks
    }

    /// Total attempts recorded as invalid or misaligned.
    pub fn attempts(&self) -> u32 {
        self.retries + self.reworks
    }

    pub fn attempt_errors(&self) -> &[AttemptError] {
        &self.attempt_errors
    }

    pub fn rework_history(&self) -> &[ReworkRecord] {
        &self.rework_history
    }

    /// Records an invalid attempt. The retry budget is exhausted once more
    /// retries than `max_retries` have been consumed.
    pub fn record_invalid(
        &mut self,
        message: impl Into<String>,
        diagnostics: Vec<Diagnostic>,
        max_retries: u32,
    ) -> LedgerDecision {
        self.retries += 1;
        self.attempt_errors.push(AttemptError {
            attempt: self.attempts(),
            message: message.into(),
            diagnostics,
            at: Timestamp::now(),
        });
        if self.retries > max_retries {
            LedgerDecision::Exhausted
        } else {
            LedgerDecision::TryAgain
        }
    }

    /// Records a misaligned attempt against the rework budget.
    pub fn record_misaligned(
        &mut self,
        score: AlignmentScore,
        threshold: AlignmentScore,
        findings: Vec<AlignmentFinding>,
        max_reworks: u32,
    ) -> LedgerDecision {
        self.reworks += 1;
        self.rework_history.push(ReworkRecord {
            rework: self.reworks,
            score,
            threshold,
            findings,
            at: Timestamp::now(),
        });
        if self.reworks > max_reworks {
            LedgerDecision::Exhausted
        } else {
            LedgerDecision::TryAgain
        }
    }

    /// Builds the terminal failure for an exhausted retry budget.
    pub fn retry_exhausted(&self) -> NodeFailure {
        NodeFailure::RetryExhausted {
            attempts: self.attempt_errors.clone(),
        }
    }

    /// Builds the terminal failure for an exhausted rework budget.
    pub fn rework_exhausted(&self) -> NodeFailure {
        NodeFailure::ReworkExhausted {
            findings: self
                .rework_history
                .last()
                .map(|record| record.findings.clone())
                .unwrap_or_default(),
            history: self.rework_history.clone(),
        }
    }
}

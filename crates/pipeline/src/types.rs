//! Value types that carry invariants: costs are non-negative, budgets are
//! positive, scores live in `[0, 1]`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ArtifactPath;

const MICROS_PER_USD: f64 = 1_000_000.0;

// ---------------------------------------------------------------------------
// Tokens and money
// ---------------------------------------------------------------------------

/// Tokens reported by a delegate for one call.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct TokenCount(u64);

impl TokenCount {
    pub fn new(count: u64) -> Self {
        Self(count)
    }

    /// Raw token count.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for TokenCount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} tokens", self.0)
    }
}

/// US dollars spent on delegated work.
///
/// Stored as a float for configuration and reporting. Budget accounting works
/// in whole micro-dollars, see [`TokenCost::as_micros`].
#[derive(Debug, Clone, Copy, Default, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct TokenCost(f64);

impl TokenCost {
    /// `None` for negative or non-finite values.
    #[must_use]
    pub fn new(usd: f64) -> Option<Self> {
        (usd.is_finite() && usd >= 0.0).then_some(Self(usd))
    }

    /// No cost. Also what a failed call with no billed tokens reports.
    pub fn zero() -> Self {
        Self(0.0)
    }

    /// Inverse of [`TokenCost::as_micros`].
    pub fn from_micros(micros: u64) -> Self {
        Self(micros as f64 / MICROS_PER_USD)
    }

    /// Rounded to the nearest micro-dollar.
    pub fn as_micros(self) -> u64 {
        (self.0 * MICROS_PER_USD).round() as u64
    }

    /// Amount in US dollars.
    pub fn as_f64(self) -> f64 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0.0
    }

    /// Difference, floored at zero.
    pub fn saturating_sub(self, rhs: TokenCost) -> Self {
        Self((self.0 - rhs.0).max(0.0))
    }
}

impl std::fmt::Display for TokenCost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "${:.6}", self.0)
    }
}

impl std::ops::Add for TokenCost {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self(self.0 + rhs.0)
    }
}

impl std::ops::AddAssign for TokenCost {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl std::iter::Sum for TokenCost {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::zero(), std::ops::Add::add)
    }
}

/// Spending cap of one run, shared by every node in it.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct CostBudget(f64);

impl CostBudget {
    /// `None` unless `usd` is finite and strictly positive.
    #[must_use]
    pub fn new(usd: f64) -> Option<Self> {
        (usd.is_finite() && usd > 0.0).then_some(Self(usd))
    }

    /// Cap in US dollars.
    pub fn as_f64(self) -> f64 {
        self.0
    }

    /// Cap in whole micro-dollars, the unit the budget tracker counts in.
    pub fn as_micros(self) -> u64 {
        (self.0 * MICROS_PER_USD).round() as u64
    }
}

/// Ten dollars per run unless configured otherwise.
impl Default for CostBudget {
    fn default() -> Self {
        Self(10.0)
    }
}

impl std::fmt::Display for CostBudget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "${:.6}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Alignment score
// ---------------------------------------------------------------------------

/// How well an output matches its input, from `0.0` (unrelated) to `1.0`.
/// Also used for acceptance thresholds.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct AlignmentScore(f64);

impl AlignmentScore {
    /// Full alignment; the score of an output with no semantic check.
    pub const PERFECT: AlignmentScore = AlignmentScore(1.0);

    /// `None` outside `[0, 1]` and for NaN.
    #[must_use]
    pub fn new(value: f64) -> Option<Self> {
        (0.0..=1.0).contains(&value).then_some(Self(value))
    }

    /// Forces `value` into range; NaN becomes `0.0`.
    pub fn clamped(value: f64) -> Self {
        if value.is_nan() {
            Self(0.0)
        } else {
            Self(value.clamp(0.0, 1.0))
        }
    }

    /// Raw score.
    pub fn as_f64(self) -> f64 {
        self.0
    }

    /// Saturates at `1.0`. Negative deltas are ignored.
    pub fn raised_by(self, delta: f64) -> Self {
        Self::clamped(self.0 + delta.max(0.0))
    }

    /// The lower of the two scores.
    pub fn min(self, other: AlignmentScore) -> Self {
        if other.0 < self.0 {
            other
        } else {
            self
        }
    }
}

impl std::fmt::Display for AlignmentScore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.4}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Diagnostics
// ---------------------------------------------------------------------------

/// Shared by domain service diagnostics and alignment findings. Only
/// `Blocking` stops a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticSeverity {
    /// Must be fixed; fails the attempt.
    Blocking,
    /// Reported but does not stop the node.
    Warning,
    /// Context only.
    Informational,
}

impl DiagnosticSeverity {
    /// Name as written in condition expressions and on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Blocking => "blocking",
            Self::Warning => "warning",
            Self::Informational => "informational",
        }
    }
}

/// Free-form category tag chosen by the emitting service, such as
/// `"interface_mismatch"` or `"test_failure"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DiagnosticCategory(String);

impl DiagnosticCategory {
    /// `None` for an empty tag.
    pub fn new(category: impl Into<String>) -> Option<Self> {
        let category = category.into();
        (!category.is_empty()).then_some(Self(category))
    }

    /// The tag as emitted.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DiagnosticCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One finding reported by a deterministic domain service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// File the finding is about, if any.
    #[serde(default)]
    pub artifact: Option<ArtifactPath>,
    /// Position inside the artifact, e.g. `"line 42"`.
    #[serde(default)]
    pub location: Option<String>,
    pub severity: DiagnosticSeverity,
    pub category: DiagnosticCategory,
    /// Human-readable description, fed back to the delegate on retry.
    pub message: String,
}

impl Diagnostic {
    /// `true` for [`DiagnosticSeverity::Blocking`].
    pub fn is_blocking(&self) -> bool {
        self.severity == DiagnosticSeverity::Blocking
    }
}

// ---------------------------------------------------------------------------
// Time
// ---------------------------------------------------------------------------

/// UTC wall-clock time, serialised as RFC 3339.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Current wall-clock time.
    pub fn now() -> Self {
        Self(Utc::now())
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.to_rfc3339())
    }
}

//! Alignment verification model: findings, results and structural checks.
//!
//! Alignment asks whether a node's output faithfully reflects its input: no
//! requirement dropped, nothing invented, nothing silently changed. Structural
//! checks are deterministic and run here; the semantic check is delegated and
//! lives in the `nodes` crate. Both families produce [`AlignmentFinding`]s which
//! are merged into one [`AlignmentResult`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::condition::lookup;
use crate::{AlignmentScore, DelegateId, DiagnosticSeverity};

// ---------------------------------------------------------------------------
// Findings
// ---------------------------------------------------------------------------

/// What kind of deviation a finding describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingKind {
    /// Something in the input has no counterpart in the output.
    Missing,
    /// The output contains something the input never asked for.
    Extra,
    /// A value was carried over but changed.
    Modified,
    /// The output can be read in more than one way.
    Ambiguous,
    /// The output goes beyond the permitted scope.
    ScopeExceeded,
}

/// Which check family produced a finding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingSource {
    #[default]
    Structural,
    Semantic,
}

/// One alignment deviation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlignmentFinding {
    pub kind: FindingKind,
    pub severity: DiagnosticSeverity,
    pub description: String,
    /// Where in the input the finding points, e.g. `specification.requirements[2]`.
    #[serde(default)]
    pub input_reference: Option<String>,
    /// Where in the output the finding points.
    #[serde(default)]
    pub output_reference: Option<String>,
    #[serde(default)]
    pub remediation: Option<String>,
    #[serde(default)]
    pub source: FindingSource,
}

impl AlignmentFinding {
    /// Returns `true` if this finding fails the alignment check regardless of score.
    pub fn is_blocking(&self) -> bool {
        self.severity == DiagnosticSeverity::Blocking
    }
}

// ---------------------------------------------------------------------------
// Result
// ---------------------------------------------------------------------------

/// Outcome of one alignment verification.
///
/// `aligned` is always derived from the other fields:
/// `aligned == (score >= threshold && no blocking finding)`. Construction and
/// deserialisation both recompute it, so a stored result can never disagree
/// with its own findings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "AlignmentResultRecord", into = "AlignmentResultRecord")]
pub struct AlignmentResult {
    aligned: bool,
    score: AlignmentScore,
    threshold: AlignmentScore,
    findings: Vec<AlignmentFinding>,
    bias_risk: bool,
    judge: Option<DelegateId>,
}

impl AlignmentResult {
    /// Builds a result, deriving the `aligned` flag.
    pub fn new(
        score: AlignmentScore,
        threshold: AlignmentScore,
        findings: Vec<AlignmentFinding>,
    ) -> Self {
        let aligned = score >= threshold && !findings.iter().any(AlignmentFinding::is_blocking);
        Self {
            aligned,
            score,
            threshold,
            findings,
            bias_risk: false,
            judge: None,
        }
    }

    /// Marks the semantic judge and whether it shares the producer's identity.
    pub fn with_judge(mut self, judge: DelegateId, bias_risk: bool) -> Self {
        self.judge = Some(judge);
        self.bias_risk = bias_risk;
        self
    }

    pub fn aligned(&self) -> bool {
        self.aligned
    }

    pub fn score(&self) -> AlignmentScore {
        self.score
    }

    pub fn threshold(&self) -> AlignmentScore {
        self.threshold
    }

    pub fn findings(&self) -> &[AlignmentFinding] {
        &self.findings
    }

    /// `true` when the semantic judge was the same delegate as the producer.
    pub fn bias_risk(&self) -> bool {
        self.bias_risk
    }

    pub fn judge(&self) -> Option<&DelegateId> {
        self.judge.as_ref()
    }

    /// Returns only the blocking findings.
    pub fn blocking_findings(&self) -> impl Iterator<Item = &AlignmentFinding> {
        self.findings.iter().filter(|f| f.is_blocking())
    }
}

#[derive(Clone, Serialize, Deserialize)]
struct AlignmentResultRecord {
    #[serde(default)]
    aligned: bool,
    score: AlignmentScore,
    threshold: AlignmentScore,
    #[serde(default)]
    findings: Vec<AlignmentFinding>,
    #[serde(default)]
    bias_risk: bool,
    #[serde(default)]
    judge: Option<DelegateId>,
}

impl From<AlignmentResultRecord> for AlignmentResult {
    fn from(record: AlignmentResultRecord) -> Self {
        let mut result = Self::new(record.score, record.threshold, record.findings);
        result.bias_risk = record.bias_risk;
        result.judge = record.judge;
        result
    }
}

impl From<AlignmentResult> for AlignmentResultRecord {
    fn from(result: AlignmentResult) -> Self {
        Self {
            aligned: result.aligned,
            score: result.score,
            threshold: result.threshold,
            findings: result.findings,
            bias_risk: result.bias_risk,
            judge: result.judge,
        }
    }
}

/// Merges the structural verdict with an optional semantic verdict.
///
/// The merged score is the lower of the two; findings are concatenated.
pub fn merge_verdicts(
    structural: StructuralVerdict,
    semantic: Option<(AlignmentScore, Vec<AlignmentFinding>)>,
    threshold: AlignmentScore,
) -> AlignmentResult {
    let mut findings = structural.findings;
    let score = match semantic {
        Some((semantic_score, semantic_findings)) => {
            findings.extend(semantic_findings.into_iter().map(|mut f| {
                f.source = FindingSource::Semantic;
                f
            }));
            structural.score.min(semantic_score)
        }
        None => structural.score,
    };
    AlignmentResult::new(score, threshold, findings)
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

fn default_threshold() -> f64 {
    0.8
}

/// Alignment configuration of one node, as written in the graph description.
///
/// ```toml
/// [nodes.alignment]
/// threshold = 0.85
/// semantic = true
/// structural = [
///   { check = "items_present", input = "specification.requirements", output = "covered", key = "id" },
/// ]
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlignmentConfig {
    #[serde(default)]
    pub structural: Vec<StructuralCheck>,
    /// Whether to run the delegated semantic check.
    #[serde(default)]
    pub semantic: bool,
    #[serde(default = "default_threshold")]
    pub threshold: f64,
}

impl Default for AlignmentConfig {
    fn default() -> Self {
        Self {
            structural: Vec::new(),
            semantic: true,
            threshold: default_threshold(),
        }
    }
}

fn blocking() -> DiagnosticSeverity {
    DiagnosticSeverity::Blocking
}

fn warning() -> DiagnosticSeverity {
    DiagnosticSeverity::Warning
}

/// A deterministic structural check.
///
/// `input` paths are resolved against the node input (an object keyed by
/// upstream node name, plus `work_item`); `output` paths against the node's
/// output. Items are compared by `key` when given and the item is an object,
/// otherwise by value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "check", rename_all = "snake_case")]
pub enum StructuralCheck {
    /// Every input item must appear in the output.
    ItemsPresent {
        input: String,
        output: String,
        #[serde(default)]
        key: Option<String>,
        #[serde(default = "blocking")]
        severity: DiagnosticSeverity,
    },
    /// The output must not contain items absent from the input.
    NoExtraItems {
        input: String,
        output: String,
        #[serde(default)]
        key: Option<String>,
        #[serde(default = "warning")]
        severity: DiagnosticSeverity,
    },
    /// Listed fields of matching items must be carried over unchanged.
    ValuesPreserved {
        input: String,
        output: String,
        key: String,
        fields: Vec<String>,
        #[serde(default = "blocking")]
        severity: DiagnosticSeverity,
    },
    /// The output list must not exceed `max` items.
    MaxItems {
        output: String,
        max: usize,
        #[serde(default = "blocking")]
        severity: DiagnosticSeverity,
    },
}

/// Aggregate of all structural checks for one output.
#[derive(Debug, Clone, PartialEq)]
pub struct StructuralVerdict {
    /// Satisfied items over total items; `1.0` when there was nothing to check.
    pub score: AlignmentScore,
    pub findings: Vec<AlignmentFinding>,
}

#[derive(Default)]
struct Tally {
    satisfied: usize,
    total: usize,
    findings: Vec<AlignmentFinding>,
}

/// Runs every check and aggregates the score.
pub fn run_structural_checks(
    checks: &[StructuralCheck],
    input: &Value,
    output: &Value,
) -> StructuralVerdict {
    let mut tally = Tally::default();
    for check in checks {
        check.run(input, output, &mut tally);
    }
    let score = if tally.total == 0 {
        AlignmentScore::PERFECT
    } else {
        AlignmentScore::clamped(tally.satisfied as f64 / tally.total as f64)
    };
    StructuralVerdict {
        score,
        findings: tally.findings,
    }
}

fn split_path(path: &str) -> Vec<String> {
    path.split('.')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn items_at<'a>(root: &'a Value, path: &str) -> &'a [Value] {
    match lookup(root, &split_path(path)) {
        Some(Value::Array(items)) => items,
        _ => &[],
    }
}

fn identity(item: &Value, key: Option<&str>) -> Value {
    match (item, key) {
        (Value::Object(map), Some(key)) => map.get(key).cloned().unwrap_or(Value::Null),
        _ => item.clone(),
    }
}

fn describe(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn finding(
    kind: FindingKind,
    severity: DiagnosticSeverity,
    description: String,
    input_reference: Option<String>,
    output_reference: Option<String>,
) -> AlignmentFinding {
    AlignmentFinding {
        kind,
        severity,
        description,
        input_reference,
        output_reference,
        remediation: None,
        source: FindingSource::Structural,
    }
}

impl StructuralCheck {
    fn run(&self, input: &Value, output: &Value, tally: &mut Tally) {
        match self {
            Self::ItemsPresent {
                input: in_path,
                output: out_path,
                key,
                severity,
            } => {
                let produced: Vec<Value> = items_at(output, out_path)
                    .iter()
                    .map(|item| identity(item, key.as_deref()))
                    .collect();
                for (index, item) in items_at(input, in_path).iter().enumerate() {
                    tally.total += 1;
                    let id = identity(item, key.as_deref());
                    if produced.contains(&id) {
                        tally.satisfied += 1;
                    } else {
                        let mut f = finding(
                            FindingKind::Missing,
                            *severity,
                            format!("input item '{}' is not present in the output", describe(&id)),
                            Some(format!("{in_path}[{index}]")),
                            Some(out_path.clone()),
                        );
                        f.remediation = Some(format!("address '{}' in {out_path}", describe(&id)));
                        tally.findings.push(f);
                    }
                }
            }
            Self::NoExtraItems {
                input: in_path,
                output: out_path,
                key,
                severity,
            } => {
                let expected: Vec<Value> = items_at(input, in_path)
                    .iter()
                    .map(|item| identity(item, key.as_deref()))
                    .collect();
                for (index, item) in items_at(output, out_path).iter().enumerate() {
                    tally.total += 1;
                    let id = identity(item, key.as_deref());
                    if expected.contains(&id) {
                        tally.satisfied += 1;
                    } else {
                        tally.findings.push(finding(
                            FindingKind::Extra,
                            *severity,
                            format!("output item '{}' has no counterpart in the input", describe(&id)),
                            Some(in_path.clone()),
                            Some(format!("{out_path}[{index}]")),
                        ));
                    }
                }
            }
            Self::ValuesPreserved {
                input: in_path,
                output: out_path,
                key,
                fields,
                severity,
            } => {
                let produced = items_at(output, out_path);
                for (index, item) in items_at(input, in_path).iter().enumerate() {
                    let id = identity(item, Some(key));
                    let Some((out_index, counterpart)) = produced
                        .iter()
                        .enumerate()
                        .find(|(_, candidate)| identity(candidate, Some(key)) == id)
                    else {
                        continue;
                    };
                    for field in fields {
                        tally.total += 1;
                        let before = item.get(field).unwrap_or(&Value::Null);
                        let after = counterpart.get(field).unwrap_or(&Value::Null);
                        if before == after {
                            tally.satisfied += 1;
                        } else {
                            tally.findings.push(finding(
                                FindingKind::Modified,
                                *severity,
                                format!(
                                    "field '{field}' of '{}' changed from {before} to {after}",
                                    describe(&id)
                                ),
                                Some(format!("{in_path}[{index}].{field}")),
                                Some(format!("{out_path}[{out_index}].{field}")),
                            ));
                        }
                    }
                }
            }
            Self::MaxItems {
                output: out_path,
                max,
                severity,
            } => {
                tally.total += 1;
                let count = items_at(output, out_path).len();
                if count <= *max {
                    tally.satisfied += 1;
                } else {
                    tally.findings.push(finding(
                        FindingKind::ScopeExceeded,
                        *severity,
                        format!("{out_path} has {count} items, at most {max} permitted"),
                        None,
                        Some(out_path.clone()),
                    ));
                }
            }
        }
    }
}

//! Pipeline graph: description format, validated model and validator.
//!
//! A [`GraphDescription`] is what a loader produces (TOML or JSON). It is never
//! executed directly: [`PipelineGraph::from_description`] validates it and
//! builds an immutable arena of nodes and edges addressed by [`NodeIndex`] and
//! [`EdgeIndex`]. Validation is pure and total and reports the first defect as
//! a [`GraphValidationError`].
//!
//! The central structural guarantee is that every cycle is bounded: once every
//! edge carrying a `rework.max_traversals` bound is removed, the remaining
//! graph must be acyclic.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::alignment::AlignmentConfig;
use crate::condition::{Condition, ConditionDescription, Expression};
use crate::schema::{FieldType, OutputSchema};
use crate::{AlignmentScore, DomainServiceName, EdgeId, NodeId, PipelineName};

// ---------------------------------------------------------------------------
// Description (serde)
// ---------------------------------------------------------------------------

fn default_max_retries() -> u32 {
    3
}

fn default_max_reworks() -> u32 {
    2
}

/// A graph as written in `.cogworks/pipeline.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphDescription {
    /// Pipeline name, reported in logs and run snapshots.
    pub name: String,
    /// Nodes activated when a run starts. Empty means "every node without an
    /// incoming unbounded edge".
    #[serde(default)]
    pub entry: Vec<String>,
    /// Expression that, once true after any node completes, marks the run as
    /// safety-classified for the rest of its lifetime.
    #[serde(default)]
    pub safety_classification: Option<String>,
    #[serde(default)]
    pub nodes: Vec<NodeDescription>,
    #[serde(default)]
    pub edges: Vec<EdgeDescription>,
}

impl GraphDescription {
    /// BLAKE3 digest of the canonical JSON form, hex encoded. Stored in every
    /// run snapshot so a run is never resumed against a different graph.
    pub fn fingerprint(&self) -> Result<String, serde_json::Error> {
        let canonical = serde_json::to_vec(self)?;
        Ok(blake3::hash(&canonical).to_hex().to_string())
    }
}

/// How a node obtains approval before it runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatePolicy {
    #[default]
    Auto,
    /// Waits for an explicit approval signal from the work-item tracker.
    Human,
}

/// Settings of a node whose output is produced by the LLM delegate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerativeConfig {
    /// Task description sent with every generation request.
    pub instructions: String,
}

/// Settings of a node backed by a domain service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeterministicConfig {
    /// Domain service that validates or simulates the node input.
    pub service: String,
    /// Service-specific operation name, passed through unchanged.
    #[serde(default)]
    pub operation: Option<String>,
}

/// Settings of a node that decides on auxiliary work items.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawningConfig {
    /// What the delegate should split off into separate work items.
    pub instructions: String,
    /// Upper bound on auxiliary work items created per execution.
    #[serde(default)]
    pub max_items: Option<u32>,
}

/// One node as written in the description. Exactly one of `generative`,
/// `deterministic` or `spawning` must be present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDescription {
    /// Unique node name.
    pub name: String,
    #[serde(default)]
    pub generative: Option<GenerativeConfig>,
    #[serde(default)]
    pub deterministic: Option<DeterministicConfig>,
    #[serde(default)]
    pub spawning: Option<SpawningConfig>,
    /// Nodes that must be `completed` before this node may execute.
    #[serde(default)]
    pub required_inputs: Vec<String>,
    #[serde(default)]
    pub gate: GatePolicy,
    /// Re-executions allowed after technically invalid output. Defaults to 3.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Re-executions allowed after misaligned output. Defaults to 2.
    #[serde(default = "default_max_reworks")]
    pub max_reworks: u32,
    /// Alignment checks run on every valid output. `None` skips alignment.
    #[serde(default)]
    pub alignment: Option<AlignmentConfig>,
    /// Shape the output must have before alignment is checked.
    #[serde(default)]
    pub output_schema: Option<OutputSchema>,
    /// Fraction of the pipeline budget this node may consume, in `(0, 1]`.
    #[serde(default)]
    pub cost_share: Option<f64>,
    /// When this node fails, siblings still running are signalled to stop
    /// after their in-flight call.
    #[serde(default)]
    pub abort_siblings_on_failure: bool,
}

/// How the outgoing edges of one node are evaluated as a group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationMode {
    /// Every edge whose condition holds is taken (fan-out).
    #[default]
    AllMatching,
    /// Edges are tried in declared order; the first that holds is taken.
    FirstMatching,
    /// No conditions are evaluated; the node output's `next_edges` list names
    /// the edges to take.
    Explicit,
}

impl EvaluationMode {
    /// Name as written in graph descriptions.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AllMatching => "all_matching",
            Self::FirstMatching => "first_matching",
            Self::Explicit => "explicit",
        }
    }
}

/// What happens to the loop body when a rework edge is retaken.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatePreservation {
    /// Loop body nodes return to `pending` with their outputs discarded.
    #[default]
    Reset,
    /// Loop body nodes return to `pending` but keep their last output, which
    /// is offered to the delegate as the previous attempt.
    PreserveOutputs,
}

/// Policy once a rework edge has been traversed `max_traversals` times.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowDescription {
    /// Fail the run.
    Halt,
    /// Escalate the run to a human.
    #[default]
    Escalate,
    /// Take the named sibling edge instead.
    TakeAlternate(String),
}

/// Marks an edge as a rework back-edge bounded by `max_traversals`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReworkDescription {
    /// Times the edge may be taken in one run. Must be at least 1.
    pub max_traversals: u32,
    #[serde(default)]
    pub preserve: StatePreservation,
    #[serde(default)]
    pub overflow: OverflowDescription,
}

/// One edge as written in the description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeDescription {
    /// Unique edge name.
    pub name: String,
    /// Source node name.
    pub from: String,
    /// Target node name.
    pub to: String,
    /// Defaults to `always`.
    #[serde(default)]
    pub condition: ConditionDescription,
    /// Must agree across all outgoing edges of the source node.
    #[serde(default)]
    pub mode: EvaluationMode,
    /// Present only on back-edges; every cycle needs at least one.
    #[serde(default)]
    pub rework: Option<ReworkDescription>,
}

// ---------------------------------------------------------------------------
// Validation errors
// ---------------------------------------------------------------------------

/// Why a graph description was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GraphValidationError {
    /// The description declares no nodes.
    #[error("graph has no nodes")]
    EmptyGraph,

    /// A pipeline, node, edge or service name is empty.
    #[error("{what} has an empty or invalid name '{value}'")]
    InvalidIdentifier { what: String, value: String },

    /// Two nodes share a name.
    #[error("duplicate node name '{node}'")]
    DuplicateNode { node: String },

    /// Kind, cost share, schema or alignment settings are inconsistent.
    #[error("node '{node}' is misconfigured: {message}")]
    InvalidNodeConfig { node: String, message: String },

    /// A required input names no node.
    #[error("node '{node}' requires unknown input '{input}'")]
    UnknownRequiredInput { node: String, input: String },

    /// Two edges share a name.
    #[error("duplicate edge name '{edge}'")]
    DuplicateEdge { edge: String },

    /// An edge's `from` or `to` names no node.
    #[error("edge '{edge}' references unknown node '{endpoint}'")]
    UnknownEdgeEndpoint { edge: String, endpoint: String },

    /// An expression does not parse or references an unknown node.
    #[error("edge '{edge}' has a malformed condition: {message}")]
    MalformedCondition { edge: String, message: String },

    /// Outgoing edges of one node disagree on their evaluation mode.
    #[error("outgoing edges of node '{node}' declare conflicting evaluation modes")]
    ConflictingEvaluationModes { node: String },

    /// `max_traversals` is zero.
    #[error("edge '{edge}' has an invalid rework policy: {message}")]
    InvalidReworkPolicy { edge: String, message: String },

    /// An overflow alternate is unknown or does not share the source node.
    #[error("edge '{edge}' names invalid alternate edge '{alternate}'")]
    InvalidAlternateEdge { edge: String, alternate: String },

    /// The `entry` list names no node.
    #[error("entry names unknown node '{node}'")]
    UnknownEntryNode { node: String },

    /// No entry was declared and every node has an incoming unbounded edge.
    #[error("graph has no entry node")]
    NoEntryNode,

    /// A cycle remains once every bounded rework edge is removed.
    #[error("cycle through [{}] has no edge bounded by max_traversals", .nodes.join(", "))]
    UnboundedCycle { nodes: Vec<String> },

    /// No path leads from an entry node to this node.
    #[error("node '{node}' is unreachable from every entry node")]
    UnreachableNode { node: String },

    /// The graph-level `safety_classification` expression does not parse.
    #[error("safety classification expression is malformed: {message}")]
    MalformedSafetyClassification { message: String },

    /// The description could not be serialised for hashing.
    #[error("graph description could not be fingerprinted: {message}")]
    Fingerprint { message: String },
}

// ---------------------------------------------------------------------------
// Validated model
// ---------------------------------------------------------------------------

/// Position of a node in the graph arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeIndex(usize);

impl NodeIndex {
    /// Raw arena position.
    pub fn index(self) -> usize {
        self.0
    }
}

/// Position of an edge in the graph arena. Edge order is declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EdgeIndex(usize);

impl EdgeIndex {
    /// Raw arena position.
    pub fn index(self) -> usize {
        self.0
    }
}

/// The closed set of node kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    /// Output produced by the LLM delegate, then schema- and alignment-checked.
    Generative(GenerativeConfig),
    /// Output produced by a domain service; blocking findings count as
    /// invalid output.
    Deterministic {
        service: DomainServiceName,
        operation: Option<String>,
    },
    /// Decides on sub-work-items and always completes.
    Spawning(SpawningConfig),
}

impl NodeKind {
    /// Name used in logs and spans.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Generative(_) => "generative",
            Self::Deterministic { .. } => "deterministic",
            Self::Spawning(_) => "spawning",
        }
    }

    /// Generative and spawning nodes call the LLM delegate and count against
    /// the generative concurrency cap.
    pub fn incurs_cost(&self) -> bool {
        !matches!(self, Self::Deterministic { .. })
    }
}

/// Validated alignment settings of a node.
#[derive(Debug, Clone, PartialEq)]
pub struct AlignmentSpec {
    /// Deterministic checks, run before the semantic judge.
    pub structural: Vec<crate::alignment::StructuralCheck>,
    /// Whether the adversarial judge is consulted.
    pub semantic: bool,
    /// Minimum score for the output to count as aligned.
    pub threshold: AlignmentScore,
}

/// A validated node. Names are resolved to indices.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeDefinition {
    pub id: NodeId,
    pub kind: NodeKind,
    /// Nodes whose outputs this node consumes; all must be `completed`.
    pub required_inputs: Vec<NodeIndex>,
    pub gate: GatePolicy,
    pub max_retries: u32,
    pub max_reworks: u32,
    pub alignment: Option<AlignmentSpec>,
    pub output_schema: Option<OutputSchema>,
    /// Fraction of the run budget this node may commit, in `(0, 1]`.
    pub cost_share: Option<f64>,
    pub abort_siblings_on_failure: bool,
}

/// Validated overflow policy of a rework edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Fail the run with `CycleLimitReached`.
    Halt,
    /// Escalate the run with `CycleLimitReached`.
    Escalate,
    /// Activate the target of this sibling edge instead.
    TakeAlternate(EdgeIndex),
}

/// Validated bound of a rework edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReworkPolicy {
    pub max_traversals: u32,
    pub preserve: StatePreservation,
    pub overflow: OverflowPolicy,
}

/// A validated edge.
#[derive(Debug, Clone, PartialEq)]
pub struct EdgeDefinition {
    pub id: EdgeId,
    pub source: NodeIndex,
    pub target: NodeIndex,
    /// Parsed condition; expressions are already checked for syntax.
    pub condition: Condition,
    pub mode: EvaluationMode,
    /// `Some` marks a bounded back-edge.
    pub rework: Option<ReworkPolicy>,
}

/// A validated, immutable pipeline graph.
#[derive(Debug, Clone)]
pub struct PipelineGraph {
    name: PipelineName,
    fingerprint: String,
    safety_classification: Option<Expression>,
    nodes: Vec<NodeDefinition>,
    edges: Vec<EdgeDefinition>,
    outgoing: Vec<Vec<EdgeIndex>>,
    dependents: Vec<Vec<NodeIndex>>,
    entry: Vec<NodeIndex>,
    by_name: BTreeMap<NodeId, NodeIndex>,
    loop_bodies: Vec<Vec<NodeIndex>>,
}

impl PipelineGraph {
    /// Validates `description` and builds the graph.
    pub fn from_description(description: &GraphDescription) -> Result<Self, GraphValidationError> {
        Validator::new(description).run()
    }

    pub fn name(&self) -> &PipelineName {
        &self.name
    }

    /// Hex BLAKE3 digest of the description the graph was built from.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Expression that marks a run safety-classified once it holds.
    pub fn safety_classification(&self) -> Option<&Expression> {
        self.safety_classification.as_ref()
    }

    /// # Panics
    ///
    /// If `index` came from a different graph.
    pub fn node(&self, index: NodeIndex) -> &NodeDefinition {
        &self.nodes[index.0]
    }

    /// # Panics
    ///
    /// If `index` came from a different graph.
    pub fn edge(&self, index: EdgeIndex) -> &EdgeDefinition {
        &self.edges[index.0]
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Every node index in declaration order.
    pub fn node_indices(&self) -> impl Iterator<Item = NodeIndex> {
        (0..self.nodes.len()).map(NodeIndex)
    }

    /// Nodes with their indices, in declaration order.
    pub fn nodes(&self) -> impl Iterator<Item = (NodeIndex, &NodeDefinition)> {
        self.nodes.iter().enumerate().map(|(i, n)| (NodeIndex(i), n))
    }

    /// Edges with their indices, in declaration order.
    pub fn edges(&self) -> impl Iterator<Item = (EdgeIndex, &EdgeDefinition)> {
        self.edges.iter().enumerate().map(|(i, e)| (EdgeIndex(i), e))
    }

    /// Looks a node up by name.
    pub fn node_index(&self, name: &str) -> Option<NodeIndex> {
        self.by_name.get(name).copied()
    }

    /// Looks an edge up by name.
    pub fn edge_index(&self, name: &str) -> Option<EdgeIndex> {
        self.edges
            .iter()
            .position(|edge| edge.id.as_str() == name)
            .map(EdgeIndex)
    }

    /// Outgoing edges of `node` in declaration order.
    pub fn outgoing(&self, node: NodeIndex) -> &[EdgeIndex] {
        &self.outgoing[node.0]
    }

    /// Nodes that list `node` among their required inputs.
    pub fn dependents(&self, node: NodeIndex) -> &[NodeIndex] {
        &self.dependents[node.0]
    }

    /// Nodes activated when a run starts.
    pub fn entry_nodes(&self) -> &[NodeIndex] {
        &self.entry
    }

    /// A terminal node has no outgoing edges.
    pub fn is_terminal(&self, node: NodeIndex) -> bool {
        self.outgoing[node.0].is_empty()
    }

    /// Evaluation mode of `node`'s outgoing edges.
    pub fn group_mode(&self, node: NodeIndex) -> EvaluationMode {
        self.outgoing[node.0]
            .first()
            .map(|edge| self.edges[edge.0].mode)
            .unwrap_or_default()
    }

    /// Nodes reset when the rework edge `edge` is retaken. Empty for
    /// unbounded edges.
    pub fn loop_body(&self, edge: EdgeIndex) -> &[NodeIndex] {
        &self.loop_bodies[edge.0]
    }
}

// ---------------------------------------------------------------------------
// Validator
// ---------------------------------------------------------------------------

struct Validator<'a> {
    description: &'a GraphDescription,
    by_name: BTreeMap<NodeId, NodeIndex>,
}

impl<'a> Validator<'a> {
    fn new(description: &'a GraphDescription) -> Self {
        Self {
            description,
            by_name: BTreeMap::new(),
        }
    }

    fn run(mut self) -> Result<PipelineGraph, GraphValidationError> {
        let description = self.description;
        if description.nodes.is_empty() {
            return Err(GraphValidationError::EmptyGraph);
        }
        let name = PipelineName::new(description.name.trim()).ok_or_else(|| {
            GraphValidationError::InvalidIdentifier {
                what: "pipeline".into(),
                value: description.name.clone(),
            }
        })?;

        for (index, node) in description.nodes.iter().enumerate() {
            let id = parse_name(&node.name, "node")?;
            if self.by_name.insert(id, NodeIndex(index)).is_some() {
                return Err(GraphValidationError::DuplicateNode {
                    node: node.name.clone(),
                });
            }
        }

        let nodes = description
            .nodes
            .iter()
            .map(|node| self.node_definition(node))
            .collect::<Result<Vec<_>, _>>()?;

        let edges = self.edge_definitions()?;

        let mut outgoing = vec![Vec::new(); nodes.len()];
        for (index, edge) in edges.iter().enumerate() {
            outgoing[edge.source.0].push(EdgeIndex(index));
        }
        check_modes(&nodes, &edges, &outgoing)?;

        let mut dependents = vec![Vec::new(); nodes.len()];
        for (index, node) in nodes.iter().enumerate() {
            for input in &node.required_inputs {
                dependents[input.0].push(NodeIndex(index));
            }
        }

        let entry = self.entry_nodes(&edges)?;
        check_bounded_cycles(&nodes, &edges)?;
        check_reachability(&nodes, &edges, &entry)?;

        let safety_classification = description
            .safety_classification
            .as_deref()
            .map(|source| {
                let expression = Expression::parse(source).map_err(|e| {
                    GraphValidationError::MalformedSafetyClassification { message: e.message }
                })?;
                Ok::<_, GraphValidationError>(expression)
            })
            .transpose()?;

        let loop_bodies = edges
            .iter()
            .map(|edge| match edge.rework {
                Some(_) => loop_body(nodes.len(), &edges, edge),
                None => Vec::new(),
            })
            .collect();

        let fingerprint = description
            .fingerprint()
            .map_err(|e| GraphValidationError::Fingerprint {
                message: e.to_string(),
            })?;

        Ok(PipelineGraph {
            name,
            fingerprint,
            safety_classification,
            nodes,
            edges,
            outgoing,
            dependents,
            entry,
            by_name: self.by_name,
            loop_bodies,
        })
    }

    fn lookup(&self, name: &str) -> Option<NodeIndex> {
        self.by_name.get(name).copied()
    }

    fn node_definition(&self, node: &NodeDescription) -> Result<NodeDefinition, GraphValidationError> {
        let invalid = |message: String| GraphValidationError::InvalidNodeConfig {
            node: node.name.clone(),
            message,
        };

        let kind = match (&node.generative, &node.deterministic, &node.spawning) {
            (Some(config), None, None) => {
                if config.instructions.trim().is_empty() {
                    return Err(invalid("generative instructions are empty".into()));
                }
                NodeKind::Generative(config.clone())
            }
            (None, Some(config), None) => NodeKind::Deterministic {
                service: DomainServiceName::new(config.service.trim())
                    .ok_or_else(|| invalid("deterministic service name is empty".into()))?,
                operation: config.operation.clone(),
            },
            (None, None, Some(config)) => {
                if config.instructions.trim().is_empty() {
                    return Err(invalid("spawning instructions are empty".into()));
                }
                NodeKind::Spawning(config.clone())
            }
            (None, None, None) => {
                return Err(invalid(
                    "one of generative, deterministic or spawning must be configured".into(),
                ))
            }
            _ => return Err(invalid("more than one node kind is configured".into())),
        };

        let mut required_inputs = Vec::with_capacity(node.required_inputs.len());
        for input in &node.required_inputs {
            let index = self.lookup(input).ok_or_else(|| {
                GraphValidationError::UnknownRequiredInput {
                    node: node.name.clone(),
                    input: input.clone(),
                }
            })?;
            if input == &node.name {
                return Err(invalid("a node cannot require itself".into()));
            }
            required_inputs.push(index);
        }

        let alignment = node
            .alignment
            .as_ref()
            .map(|config| {
                let threshold = AlignmentScore::new(config.threshold).ok_or_else(|| {
                    invalid(format!("alignment threshold {} is outside [0, 1]", config.threshold))
                })?;
                Ok::<_, GraphValidationError>(AlignmentSpec {
                    structural: config.structural.clone(),
                    semantic: config.semantic,
                    threshold,
                })
            })
            .transpose()?;

        if let Some(share) = node.cost_share {
            if !(share.is_finite() && share > 0.0 && share <= 1.0) {
                return Err(invalid(format!("cost_share {share} is outside (0, 1]")));
            }
        }

        if let Some(schema) = &node.output_schema {
            if let Some(field) = schema.required.iter().find(|field| field.trim().is_empty()) {
                return Err(invalid(format!("output schema has an empty required field '{field}'")));
            }
        }

        Ok(NodeDefinition {
            id: parse_name(&node.name, "node")?,
            kind,
            required_inputs,
            gate: node.gate,
            max_retries: node.max_retries,
            max_reworks: node.max_reworks,
            alignment,
            output_schema: node.output_schema.clone(),
            cost_share: node.cost_share,
            abort_siblings_on_failure: node.abort_siblings_on_failure,
        })
    }

    fn edge_definitions(&self) -> Result<Vec<EdgeDefinition>, GraphValidationError> {
        let described = &self.description.edges;
        let mut seen = BTreeSet::new();
        let mut edges = Vec::with_capacity(described.len());

        for edge in described {
            let id: EdgeId = parse_name(&edge.name, "edge")?;
            if !seen.insert(id.clone()) {
                return Err(GraphValidationError::DuplicateEdge {
                    edge: edge.name.clone(),
                });
            }
            let endpoint = |name: &str| {
                self.lookup(name)
                    .ok_or_else(|| GraphValidationError::UnknownEdgeEndpoint {
                        edge: edge.name.clone(),
                        endpoint: name.to_string(),
                    })
            };
            let source = endpoint(&edge.from)?;
            let target = endpoint(&edge.to)?;

            let malformed = |message: String| GraphValidationError::MalformedCondition {
                edge: edge.name.clone(),
                message,
            };
            let condition = Condition::from_description(&edge.condition)
                .map_err(|error| malformed(error.message))?;
            if let Some(unknown) = condition
                .referenced_nodes()
                .into_iter()
                .find(|node| self.lookup(node).is_none())
            {
                return Err(malformed(format!("expression references unknown node '{unknown}'")));
            }

            edges.push(EdgeDefinition {
                id,
                source,
                target,
                condition,
                mode: edge.mode,
                rework: None,
            });
        }

        // Rework policies are resolved once every edge has an index, since an
        // overflow alternate may be declared after the edge that names it.
        for (index, edge) in described.iter().enumerate() {
            let Some(rework) = &edge.rework else {
                continue;
            };
            if rework.max_traversals == 0 {
                return Err(GraphValidationError::InvalidReworkPolicy {
                    edge: edge.name.clone(),
                    message: "max_traversals must be at least 1".into(),
                });
            }
            let overflow = match &rework.overflow {
                OverflowDescription::Halt => OverflowPolicy::Halt,
                OverflowDescription::Escalate => OverflowPolicy::Escalate,
                OverflowDescription::TakeAlternate(alternate) => {
                    let invalid = || GraphValidationError::InvalidAlternateEdge {
                        edge: edge.name.clone(),
                        alternate: alternate.clone(),
                    };
                    let position = described
                        .iter()
                        .position(|candidate| &candidate.name == alternate)
                        .ok_or_else(invalid)?;
                    let candidate = &described[position];
                    if position == index || candidate.from != edge.from || candidate.rework.is_some() {
                        return Err(invalid());
                    }
                    OverflowPolicy::TakeAlternate(EdgeIndex(position))
                }
            };
            edges[index].rework = Some(ReworkPolicy {
                max_traversals: rework.max_traversals,
                preserve: rework.preserve,
                overflow,
            });
        }

        Ok(edges)
    }

    fn entry_nodes(&self, edges: &[EdgeDefinition]) -> Result<Vec<NodeIndex>, GraphValidationError> {
        if !self.description.entry.is_empty() {
            return self
                .description
                .entry
                .iter()
                .map(|name| {
                    self.lookup(name)
                        .ok_or_else(|| GraphValidationError::UnknownEntryNode { node: name.clone() })
                })
                .collect();
        }
        let mut has_incoming = vec![false; self.description.nodes.len()];
        for edge in edges.iter().filter(|edge| edge.rework.is_none()) {
            has_incoming[edge.target.0] = true;
        }
        let entry: Vec<NodeIndex> = has_incoming
            .iter()
            .enumerate()
            .filter(|(_, incoming)| !**incoming)
            .map(|(index, _)| NodeIndex(index))
            .collect();
        if entry.is_empty() {
            Err(GraphValidationError::NoEntryNode)
        } else {
            Ok(entry)
        }
    }
}

fn parse_name<T>(value: &str, what: &str) -> Result<T, GraphValidationError>
where
    T: FromName,
{
    let valid = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if !valid {
        return Err(GraphValidationError::InvalidIdentifier {
            what: what.to_string(),
            value: value.to_string(),
        });
    }
    T::from_name(value).ok_or_else(|| GraphValidationError::InvalidIdentifier {
        what: what.to_string(),
        value: value.to_string(),
    })
}

trait FromName: Sized {
    fn from_name(value: &str) -> Option<Self>;
}

impl FromName for NodeId {
    fn from_name(value: &str) -> Option<Self> {
        NodeId::new(value)
    }
}

impl FromName for EdgeId {
    fn from_name(value: &str) -> Option<Self> {
        EdgeId::new(value)
    }
}

fn check_modes(
    nodes: &[NodeDefinition],
    edges: &[EdgeDefinition],
    outgoing: &[Vec<EdgeIndex>],
) -> Result<(), GraphValidationError> {
    for (index, group) in outgoing.iter().enumerate() {
        let mut modes = group.iter().map(|edge| edges[edge.0].mode);
        if let Some(first) = modes.next() {
            if modes.any(|mode| mode != first) {
                return Err(GraphValidationError::ConflictingEvaluationModes {
                    node: nodes[index].id.to_string(),
                });
            }
        }
    }
    Ok(())
}

/// Rejects any strongly connected component that survives removal of every
/// bounded edge.
fn check_bounded_cycles(
    nodes: &[NodeDefinition],
    edges: &[EdgeDefinition],
) -> Result<(), GraphValidationError> {
    let mut adjacency = vec![Vec::new(); nodes.len()];
    for edge in edges.iter().filter(|edge| edge.rework.is_none()) {
        adjacency[edge.source.0].push(edge.target.0);
    }

    for component in strongly_connected_components(&adjacency) {
        let cyclic = component.len() > 1
            || component
                .first()
                .is_some_and(|&node| adjacency[node].contains(&node));
        if cyclic {
            let mut names: Vec<String> = component
                .iter()
                .map(|&node| nodes[node].id.to_string())
                .collect();
            names.sort();
            return Err(GraphValidationError::UnboundedCycle { nodes: names });
        }
    }
    Ok(())
}

/// Tarjan's algorithm over an adjacency list.
fn strongly_connected_components(adjacency: &[Vec<usize>]) -> Vec<Vec<usize>> {
    struct State<'g> {
        adjacency: &'g [Vec<usize>],
        next_index: usize,
        index: Vec<Option<usize>>,
        low_link: Vec<usize>,
        on_stack: Vec<bool>,
        stack: Vec<usize>,
        components: Vec<Vec<usize>>,
    }

    fn visit(state: &mut State<'_>, node: usize) {
        state.index[node] = Some(state.next_index);
        state.low_link[node] = state.next_index;
        state.next_index += 1;
        state.stack.push(node);
        state.on_stack[node] = true;

        for &next in &state.adjacency[node] {
            match state.index[next] {
                None => {
                    visit(state, next);
                    state.low_link[node] = state.low_link[node].min(state.low_link[next]);
                }
                Some(next_index) if state.on_stack[next] => {
                    state.low_link[node] = state.low_link[node].min(next_index);
                }
                Some(_) => {}
            }
        }

        if Some(state.low_link[node]) == state.index[node] {
            let mut component = Vec::new();
            while let Some(member) = state.stack.pop() {
                state.on_stack[member] = false;
                component.push(member);
                if member == node {
                    break;
                }
            }
            state.components.push(component);
        }
    }

    let count = adjacency.len();
    let mut state = State {
        adjacency,
        next_index: 0,
        index: vec![None; count],
        low_link: vec![0; count],
        on_stack: vec![false; count],
        stack: Vec::new(),
        components: Vec::new(),
    };
    for node in 0..count {
        if state.index[node].is_none() {
            visit(&mut state, node);
        }
    }
    state.components
}

fn check_reachability(
    nodes: &[NodeDefinition],
    edges: &[EdgeDefinition],
    entry: &[NodeIndex],
) -> Result<(), GraphValidationError> {
    let reached = reachable_from(nodes.len(), edges, entry.iter().map(|n| n.0), |_| true);
    match reached.iter().position(|seen| !seen) {
        Some(node) => Err(GraphValidationError::UnreachableNode {
            node: nodes[node].id.to_string(),
        }),
        None => Ok(()),
    }
}

fn reachable_from(
    count: usize,
    edges: &[EdgeDefinition],
    start: impl Iterator<Item = usize>,
    include: impl Fn(&EdgeDefinition) -> bool,
) -> Vec<bool> {
    let mut adjacency = vec![Vec::new(); count];
    for edge in edges.iter().filter(|edge| include(edge)) {
        adjacency[edge.source.0].push(edge.target.0);
    }
    let mut seen = vec![false; count];
    let mut queue: VecDeque<usize> = VecDeque::new();
    for node in start {
        if !seen[node] {
            seen[node] = true;
            queue.push_back(node);
        }
    }
    while let Some(node) = queue.pop_front() {
        for &next in &adjacency[node] {
            if !seen[next] {
                seen[next] = true;
                queue.push_back(next);
            }
        }
    }
    seen
}

/// Nodes on some unbounded path from the rework edge's target back to its
/// source, plus the target itself.
fn loop_body(count: usize, edges: &[EdgeDefinition], rework: &EdgeDefinition) -> Vec<NodeIndex> {
    let unbounded = |edge: &EdgeDefinition| edge.rework.is_none();
    let forward = reachable_from(count, edges, std::iter::once(rework.target.0), unbounded);

    let reversed: Vec<EdgeDefinition> = edges
        .iter()
        .filter(|edge| edge.rework.is_none())
        .map(|edge| EdgeDefinition {
            source: edge.target,
            target: edge.source,
            ..edge.clone()
        })
        .collect();
    let backward = reachable_from(count, &reversed, std::iter::once(rework.source.0), |_| true);

    (0..count)
        .filter(|&node| node == rework.target.0 || (forward[node] && backward[node]))
        .map(NodeIndex)
        .collect()
}

// ---------------------------------------------------------------------------
// Default graph
// ---------------------------------------------------------------------------

/// The built-in seven-node linear pipeline used when no description is
/// supplied: intake, specification, interface design, planning, code
/// generation, review and integration, with one bounded rework edge from
/// review back to code generation.
pub fn default_graph_description() -> GraphDescription {
    fn generative(name: &str, instructions: &str, inputs: &[&str]) -> NodeDescription {
        NodeDescription {
            name: name.to_string(),
            generative: Some(GenerativeConfig {
                instructions: instructions.to_string(),
            }),
            deterministic: None,
            spawning: None,
            required_inputs: inputs.iter().map(|s| s.to_string()).collect(),
            gate: GatePolicy::Auto,
            max_retries: default_max_retries(),
            max_reworks: default_max_reworks(),
            alignment: None,
            output_schema: None,
            cost_share: None,
            abort_siblings_on_failure: false,
        }
    }

    fn edge(name: &str, from: &str, to: &str) -> EdgeDescription {
        EdgeDescription {
            name: name.to_string(),
            from: from.to_string(),
            to: to.to_string(),
            condition: ConditionDescription::Always,
            mode: EvaluationMode::AllMatching,
            rework: None,
        }
    }

    let semantic = || {
        Some(AlignmentConfig {
            structural: Vec::new(),
            semantic: true,
            threshold: 0.8,
        })
    };

    let intake = NodeDescription {
        output_schema: Some(OutputSchema {
            required: vec!["summary".into(), "safety_critical".into()],
            fields: BTreeMap::from([
                ("summary".to_string(), FieldType::String),
                ("safety_critical".to_string(), FieldType::Boolean),
            ]),
        }),
        ..generative(
            "intake",
            "Classify the work item: summarise the request and decide whether it is safety critical.",
            &[],
        )
    };
    let specification = NodeDescription {
        alignment: semantic(),
        ..generative(
            "specification",
            "Write a specification with numbered, testable requirements.",
            &["intake"],
        )
    };
    let interface_design = NodeDescription {
        alignment: semantic(),
        ..generative(
            "interface_design",
            "Design the public interfaces needed to satisfy the specification.",
            &["specification"],
        )
    };
    let planning = NodeDescription {
        generative: None,
        spawning: Some(SpawningConfig {
            instructions: "Split the interface design into implementation work items.".into(),
            max_items: Some(10),
        }),
        ..generative("planning", "-", &["interface_design"])
    };
    let code_generation = NodeDescription {
        alignment: semantic(),
        ..generative(
            "code_generation",
            "Implement the planned work against the interface design.",
            &["planning"],
        )
    };
    let review = NodeDescription {
        output_schema: Some(OutputSchema {
            required: vec!["approved".into()],
            fields: BTreeMap::from([
                ("approved".to_string(), FieldType::Boolean),
                ("comments".to_string(), FieldType::Array),
            ]),
        }),
        ..generative(
            "review",
            "Review the generated code against the specification. Approve or request changes.",
            &["code_generation", "specification"],
        )
    };
    let integration = NodeDescription {
        generative: None,
        deterministic: Some(DeterministicConfig {
            service: "integration".into(),
            operation: None,
        }),
        ..generative("integration", "-", &["review"])
    };

    let review_rework = EdgeDescription {
        condition: ConditionDescription::Expression("output.approved == false".into()),
        mode: EvaluationMode::FirstMatching,
        rework: Some(ReworkDescription {
            max_traversals: 3,
            preserve: StatePreservation::PreserveOutputs,
            overflow: OverflowDescription::Escalate,
        }),
        ..edge("review_rework", "review", "code_generation")
    };
    let review_to_integration = EdgeDescription {
        condition: ConditionDescription::Expression("output.approved == true".into()),
        mode: EvaluationMode::FirstMatching,
        ..edge("review_to_integration", "review", "integration")
    };

    GraphDescription {
        name: "default".into(),
        entry: vec!["intake".into()],
        safety_classification: Some("nodes.intake.output.safety_critical == true".into()),
        nodes: vec![
            intake,
            specification,
            interface_design,
            planning,
            code_generation,
            review,
            integration,
        ],
        edges: vec![
            edge("intake_to_specification", "intake", "specification"),
            edge("specification_to_interface_design", "specification", "interface_design"),
            edge("interface_design_to_planning", "interface_design", "planning"),
            edge("planning_to_code_generation", "planning", "code_generation"),
            edge("code_generation_to_review", "code_generation", "review"),
            review_rework,
            review_to_integration,
        ],
    }
}

/// The default graph, passed through the same validator as any other.
pub fn default_graph() -> Result<PipelineGraph, GraphValidationError> {
    PipelineGraph::from_description(&default_graph_description())
}

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique run identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_str(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Workspace a run belongs to.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceId(pub String);

impl WorkspaceId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl std::fmt::Display for WorkspaceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A node in the pipeline graph.
///
/// The declaration order below is the canonical success ordering; loop edges
/// may only point to a node at or before their source in this ordering.
/// `Completed` and `Aborted` are terminals, `Start` is synthetic.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeId {
    Start,
    Research,
    Competitor,
    Ideation,
    Business,
    Tech,
    Validation,
    Export,
    Completed,
    Aborted,
}

impl NodeId {
    /// The seven processing stages, in canonical success order.
    pub fn stages() -> [NodeId; 7] {
        [
            NodeId::Research,
            NodeId::Competitor,
            NodeId::Ideation,
            NodeId::Business,
            NodeId::Tech,
            NodeId::Validation,
            NodeId::Export,
        ]
    }

    /// Position in the canonical success ordering.
    pub fn canonical_order(&self) -> usize {
        match self {
            NodeId::Start => 0,
            NodeId::Research => 1,
            NodeId::Competitor => 2,
            NodeId::Ideation => 3,
            NodeId::Business => 4,
            NodeId::Tech => 5,
            NodeId::Validation => 6,
            NodeId::Export => 7,
            NodeId::Completed => 8,
            NodeId::Aborted => 8,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeId::Completed | NodeId::Aborted)
    }

    pub fn is_stage(&self) -> bool {
        !matches!(self, NodeId::Start | NodeId::Completed | NodeId::Aborted)
    }

    /// Whether this stage generates from evidence and therefore may not run
    /// before at least one Research evidence item exists (facts-first).
    pub fn requires_evidence(&self) -> bool {
        matches!(
            self,
            NodeId::Ideation | NodeId::Business | NodeId::Tech | NodeId::Validation
        )
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            NodeId::Start => "start",
            NodeId::Research => "research",
            NodeId::Competitor => "competitor",
            NodeId::Ideation => "ideation",
            NodeId::Business => "business",
            NodeId::Tech => "tech",
            NodeId::Validation => "validation",
            NodeId::Export => "export",
            NodeId::Completed => "completed",
            NodeId::Aborted => "aborted",
        };
        write!(f, "{}", name)
    }
}

/// Class of a stage outcome, used to key graph edges.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeClass {
    Success,
    InsufficientEvidence,
    LowConfidence,
    GuardrailBreach,
    TransientFailure,
}

impl std::fmt::Display for OutcomeClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            OutcomeClass::Success => "success",
            OutcomeClass::InsufficientEvidence => "insufficient_evidence",
            OutcomeClass::LowConfidence => "low_confidence",
            OutcomeClass::GuardrailBreach => "guardrail_breach",
            OutcomeClass::TransientFailure => "transient_failure",
        };
        write!(f, "{}", name)
    }
}

/// A single evidence item accumulated during a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceItem {
    /// Where the evidence came from (connector, feed, dataset).
    pub source: String,
    /// Short description of the finding.
    pub summary: String,
    /// Stage that produced this item.
    pub node: NodeId,
    /// When the underlying signal was observed.
    pub collected_at: DateTime<Utc>,
}

impl EvidenceItem {
    pub fn new(source: impl Into<String>, summary: impl Into<String>, node: NodeId) -> Self {
        Self {
            source: source.into(),
            summary: summary.into(),
            node,
            collected_at: Utc::now(),
        }
    }
}

/// Tagged result of a single stage invocation.
///
/// A stage that has both too little evidence and low confidence must report
/// `InsufficientEvidence`: gathering more evidence is the more fundamental
/// remediation, and the router's policy is driven by the variant alone.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StageOutcome {
    Success {
        result: serde_json::Value,
        confidence: f64,
        #[serde(default)]
        evidence: Vec<EvidenceItem>,
        /// Guardrail flags raised by the stage; `safety:`-prefixed flags
        /// trigger the safety guardrail.
        #[serde(default)]
        flags: Vec<String>,
    },
    InsufficientEvidence {
        gap: String,
    },
    LowConfidence {
        score: f64,
        threshold: f64,
    },
    TransientFailure {
        cause: String,
    },
}

impl StageOutcome {
    pub fn class(&self) -> OutcomeClass {
        match self {
            StageOutcome::Success { .. } => OutcomeClass::Success,
            StageOutcome::InsufficientEvidence { .. } => OutcomeClass::InsufficientEvidence,
            StageOutcome::LowConfidence { .. } => OutcomeClass::LowConfidence,
            StageOutcome::TransientFailure { .. } => OutcomeClass::TransientFailure,
        }
    }
}

/// Versioned, accumulated state of one run.
///
/// "Mutation" is producing a new version via a `StatePatch`; the store rejects
/// applies against a stale base version, so concurrent-writer bugs fail loud
/// instead of silently losing updates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunState {
    /// Monotonically increasing version, bumped on every apply.
    pub version: u64,
    #[serde(default)]
    pub assumptions: Vec<String>,
    /// Ordered evidence sequence, append-only.
    #[serde(default)]
    pub evidence: Vec<EvidenceItem>,
    /// Per-node outputs, last write overwrites.
    #[serde(default)]
    pub intermediate_results: HashMap<NodeId, serde_json::Value>,
    #[serde(default)]
    pub confidence_by_node: HashMap<NodeId, f64>,
    /// Names of triggered guardrail flags. Stage-reported safety findings
    /// carry a `safety:` prefix.
    #[serde(default)]
    pub guardrail_flags: BTreeSet<String>,
}

impl RunState {
    /// Count of distinct evidence sources.
    pub fn distinct_sources(&self) -> usize {
        self.evidence
            .iter()
            .map(|e| e.source.as_str())
            .collect::<BTreeSet<_>>()
            .len()
    }

    /// Whether at least one evidence item is attributed to the given node.
    pub fn has_evidence_from(&self, node: NodeId) -> bool {
        self.evidence.iter().any(|e| e.node == node)
    }
}

/// A merge-only delta produced by one stage invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatePatch {
    #[serde(default)]
    pub assumptions: Vec<String>,
    #[serde(default)]
    pub evidence: Vec<EvidenceItem>,
    /// Intermediate result for the node that ran.
    #[serde(default)]
    pub result: Option<(NodeId, serde_json::Value)>,
    #[serde(default)]
    pub confidence: Option<(NodeId, f64)>,
    #[serde(default)]
    pub guardrail_flags: Vec<String>,
}

impl StatePatch {
    pub fn is_empty(&self) -> bool {
        self.assumptions.is_empty()
            && self.evidence.is_empty()
            && self.result.is_none()
            && self.confidence.is_none()
            && self.guardrail_flags.is_empty()
    }
}

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Aborted,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Aborted | RunStatus::Failed)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Aborted => "aborted",
            RunStatus::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

/// One end-to-end execution of the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub workspace: WorkspaceId,
    pub current_node: NodeId,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Populated only on aborted/failed.
    pub terminal_reason: Option<String>,
}

impl Run {
    pub fn new(id: RunId, workspace: WorkspaceId) -> Self {
        let now = Utc::now();
        Self {
            id,
            workspace,
            current_node: NodeId::Start,
            status: RunStatus::Pending,
            created_at: now,
            updated_at: now,
            terminal_reason: None,
        }
    }
}

/// A configured transition `(from, outcome class) → to`.
///
/// The serializable form of a graph edge, as stored by persistence backends
/// and shown by the CLI `graph` command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphEdge {
    pub from: NodeId,
    pub outcome: OutcomeClass,
    pub to: NodeId,
}

impl GraphEdge {
    pub fn new(from: NodeId, outcome: OutcomeClass, to: NodeId) -> Self {
        Self { from, outcome, to }
    }
}

/// Phase of a progress event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    RunStarted,
    StageStarted,
    StageCompleted,
    StageRetrying,
    LoopBack,
    GuardrailBreach,
    BudgetDenied,
    RunCompleted,
    RunAborted,
    RunFailed,
}

/// Immutable progress record emitted for every state transition.
///
/// Consumed by external observers only, never read back by the engine.
/// Delivery is at-least-once; consumers de-duplicate by
/// `(run_id, node, phase, timestamp)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineEvent {
    pub run_id: RunId,
    pub node: NodeId,
    pub phase: RunPhase,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl PipelineEvent {
    pub fn new(run_id: &RunId, node: NodeId, phase: RunPhase, payload: serde_json::Value) -> Self {
        Self {
            run_id: run_id.clone(),
            node,
            phase,
            timestamp: Utc::now(),
            payload,
        }
    }
}

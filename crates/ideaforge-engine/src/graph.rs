use std::collections::HashMap;

use ideaforge_core::error::{ForgeError, Result};
use ideaforge_core::types::{GraphEdge, NodeId, OutcomeClass};

/// Immutable description of the pipeline graph.
///
/// Stored as an explicit edge table keyed by `(node, outcome class)` rather
/// than an object graph with back-references, so the engine can run as an
/// iterative loop over plain indices. Immutable after validation and safe
/// for unbounded concurrent reads.
#[derive(Debug, Clone)]
pub struct GraphDefinition {
    edges: HashMap<(NodeId, OutcomeClass), NodeId>,
}

impl GraphDefinition {
    pub fn new() -> Self {
        Self { edges: HashMap::new() }
    }

    /// Build a graph from a persisted edge list. The result must still be
    /// validated before use.
    pub fn from_edges(edges: impl IntoIterator<Item = GraphEdge>) -> Self {
        let mut graph = Self::new();
        for edge in edges {
            graph.add_edge(edge.from, edge.outcome, edge.to);
        }
        graph
    }

    pub fn add_edge(&mut self, from: NodeId, outcome: OutcomeClass, to: NodeId) -> &mut Self {
        self.edges.insert((from, outcome), to);
        self
    }

    /// Resolve the configured transition for `(from, outcome)`.
    ///
    /// Pure and total for a validated graph; `UnknownTransition` here is a
    /// configuration error, fatal at graph-load time, not at run time.
    pub fn resolve(&self, from: NodeId, outcome: OutcomeClass) -> Result<NodeId> {
        self.edges
            .get(&(from, outcome))
            .copied()
            .ok_or(ForgeError::UnknownTransition { node: from, outcome })
    }

    /// Outcome classes a node can feed into the edge table.
    ///
    /// `TransientFailure` is deliberately absent: it is handed to the retry
    /// controller, not routed as a graph transition.
    pub fn producible_classes(node: NodeId) -> &'static [OutcomeClass] {
        if node == NodeId::Start {
            &[OutcomeClass::Success]
        } else if node.is_stage() {
            &[
                OutcomeClass::Success,
                OutcomeClass::InsufficientEvidence,
                OutcomeClass::LowConfidence,
                OutcomeClass::GuardrailBreach,
            ]
        } else {
            &[]
        }
    }

    /// Validate the graph once at startup.
    ///
    /// Checks: every node has an edge for every outcome class it can
    /// produce; the success spine is acyclic (strictly forward in canonical
    /// order) and ends at a terminal; evidence/confidence loop edges only
    /// point at or before their source; breach edges go to Aborted.
    pub fn validate(&self) -> Result<()> {
        let mut all_nodes = vec![NodeId::Start];
        all_nodes.extend(NodeId::stages());

        for &node in &all_nodes {
            for &class in Self::producible_classes(node) {
                let to = self.resolve(node, class)?;

                match class {
                    OutcomeClass::Success => {
                        if to.canonical_order() <= node.canonical_order() {
                            return Err(ForgeError::GraphInvalid(format!(
                                "success edge {} -> {} points backward",
                                node, to
                            )));
                        }
                    }
                    OutcomeClass::InsufficientEvidence | OutcomeClass::LowConfidence => {
                        if to.is_terminal() {
                            return Err(ForgeError::GraphInvalid(format!(
                                "loop edge {} -> {} targets a terminal",
                                node, to
                            )));
                        }
                        if to.canonical_order() > node.canonical_order() {
                            return Err(ForgeError::GraphInvalid(format!(
                                "loop edge {} -> {} points forward",
                                node, to
                            )));
                        }
                    }
                    OutcomeClass::GuardrailBreach => {
                        if to != NodeId::Aborted {
                            return Err(ForgeError::GraphInvalid(format!(
                                "breach edge {} -> {} must target aborted",
                                node, to
                            )));
                        }
                    }
                    OutcomeClass::TransientFailure => {}
                }
            }
        }

        // Walk the success spine; strictly increasing order above already
        // rules out cycles, so this only has to confirm it ends at a terminal.
        let mut current = NodeId::Start;
        for _ in 0..=all_nodes.len() {
            current = self.resolve(current, OutcomeClass::Success)?;
            if current.is_terminal() {
                if current != NodeId::Completed {
                    return Err(ForgeError::GraphInvalid(
                        "success spine must end at completed".into(),
                    ));
                }
                return Ok(());
            }
        }
        Err(ForgeError::GraphInvalid(
            "success spine does not reach a terminal".into(),
        ))
    }

    /// The standard analysis pipeline: research through export, evidence
    /// loops returning to research, confidence loops regenerating in place.
    pub fn standard() -> Self {
        let mut graph = Self::new();
        graph.add_edge(NodeId::Start, OutcomeClass::Success, NodeId::Research);

        let stages = NodeId::stages();
        for (i, &stage) in stages.iter().enumerate() {
            let next = stages.get(i + 1).copied().unwrap_or(NodeId::Completed);
            graph.add_edge(stage, OutcomeClass::Success, next);
            graph.add_edge(stage, OutcomeClass::InsufficientEvidence, NodeId::Research);
            graph.add_edge(stage, OutcomeClass::LowConfidence, stage);
            graph.add_edge(stage, OutcomeClass::GuardrailBreach, NodeId::Aborted);
        }
        graph
    }

    /// Snapshot the edge table as a sorted list (for display and persistence).
    pub fn edges(&self) -> Vec<GraphEdge> {
        let mut edges: Vec<GraphEdge> = self
            .edges
            .iter()
            .map(|(&(from, outcome), &to)| GraphEdge::new(from, outcome, to))
            .collect();
        edges.sort_by_key(|e| (e.from.canonical_order(), e.outcome.to_string()));
        edges
    }
}

impl Default for GraphDefinition {
    fn default() -> Self {
        Self::standard()
    }
}

use thiserror::Error;

use crate::types::{NodeId, OutcomeClass, RunId};

#[derive(Debug, Error)]
pub enum ForgeError {
    // Graph configuration errors — fatal at load time
    #[error("no edge configured for ({node}, {outcome})")]
    UnknownTransition { node: NodeId, outcome: OutcomeClass },

    #[error("invalid graph: {0}")]
    GraphInvalid(String),

    // Invariant violations — the run is marked Failed, not Aborted
    #[error("facts-first violation: {node} invoked with no research evidence")]
    FactsFirstViolation { node: NodeId },

    #[error("stale run state for {run}: applied against version {presented}, store at {current}")]
    StaleRun {
        run: RunId,
        presented: u64,
        current: u64,
    },

    // Run errors
    #[error("run not found: {0}")]
    RunNotFound(RunId),

    #[error("stage not registered for node: {0}")]
    StageNotRegistered(NodeId),

    // Persistence errors
    #[error("store error: {0}")]
    Store(String),

    // Config errors
    #[error("config error: {0}")]
    Config(String),

    #[error("config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ForgeError {
    /// Whether this error indicates a defect (configuration or integration
    /// bug) rather than a normal operational outcome. Defects terminate the
    /// run as `Failed` and are surfaced to operators distinctly from aborts.
    pub fn is_defect(&self) -> bool {
        matches!(
            self,
            ForgeError::UnknownTransition { .. }
                | ForgeError::GraphInvalid(_)
                | ForgeError::FactsFirstViolation { .. }
                | ForgeError::StaleRun { .. }
                | ForgeError::StageNotRegistered(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ForgeError>;

use std::collections::HashMap;
use std::sync::Mutex;

use ideaforge_core::error::{ForgeError, Result};
use ideaforge_core::types::{RunId, RunState, StatePatch};

/// Versioned store for run state.
///
/// `apply` is the only mutator. Writes are linearized per run behind a
/// short, non-suspending critical section; long-running stage work happens
/// against a private snapshot and only the resulting patch is merged back.
/// Presenting a stale base version fails with `StaleRun`, which turns
/// accidental concurrent invocation into a loud failure instead of silent
/// data loss.
pub struct StateStore {
    runs: Mutex<HashMap<RunId, RunState>>,
}

impl StateStore {
    pub fn new() -> Self {
        Self {
            runs: Mutex::new(HashMap::new()),
        }
    }

    /// Initialize state for a new run. Idempotent: an existing run keeps its
    /// current state.
    pub fn create(&self, run_id: &RunId) -> RunState {
        let mut runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
        runs.entry(run_id.clone()).or_default().clone()
    }

    /// Seed a run with previously persisted state (resume path).
    pub fn restore(&self, run_id: &RunId, state: RunState) {
        let mut runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
        runs.insert(run_id.clone(), state);
    }

    /// Snapshot the current state. External readers tolerate staleness.
    pub fn get(&self, run_id: &RunId) -> Result<RunState> {
        let runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
        runs.get(run_id)
            .cloned()
            .ok_or_else(|| ForgeError::RunNotFound(run_id.clone()))
    }

    /// Merge a patch into the run's state, producing the next version.
    ///
    /// The caller presents the version its working copy was taken from; a
    /// mismatch with the store's current version fails with `StaleRun` and
    /// leaves the state untouched.
    pub fn apply(&self, run_id: &RunId, base_version: u64, patch: StatePatch) -> Result<RunState> {
        let mut runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
        let state = runs
            .get_mut(run_id)
            .ok_or_else(|| ForgeError::RunNotFound(run_id.clone()))?;

        if state.version != base_version {
            return Err(ForgeError::StaleRun {
                run: run_id.clone(),
                presented: base_version,
                current: state.version,
            });
        }

        state.assumptions.extend(patch.assumptions);
        state.evidence.extend(patch.evidence);
        if let Some((node, result)) = patch.result {
            state.intermediate_results.insert(node, result);
        }
        if let Some((node, confidence)) = patch.confidence {
            state.confidence_by_node.insert(node, confidence);
        }
        state.guardrail_flags.extend(patch.guardrail_flags);
        state.version += 1;

        Ok(state.clone())
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

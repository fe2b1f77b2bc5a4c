use std::collections::HashMap;
use std::sync::Mutex;

use futures::future::BoxFuture;

use ideaforge_core::error::Result;
use ideaforge_core::traits::RunStore;
use ideaforge_core::types::{GraphEdge, RunId, RunState};

use crate::graph::GraphDefinition;

/// In-memory `RunStore` reference implementation.
///
/// Serves as the default backend for the CLI and for tests; deployments
/// needing durability supply their own `RunStore`.
pub struct MemoryRunStore {
    states: Mutex<HashMap<RunId, RunState>>,
    graph: Vec<GraphEdge>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self {
            states: Mutex::new(HashMap::new()),
            graph: GraphDefinition::standard().edges(),
        }
    }

    pub fn with_graph(graph: &GraphDefinition) -> Self {
        Self {
            states: Mutex::new(HashMap::new()),
            graph: graph.edges(),
        }
    }
}

impl Default for MemoryRunStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RunStore for MemoryRunStore {
    fn load_run_state(&self, run_id: &RunId) -> BoxFuture<'_, Result<Option<RunState>>> {
        let state = {
            let states = self.states.lock().unwrap_or_else(|e| e.into_inner());
            states.get(run_id).cloned()
        };
        Box::pin(async move { Ok(state) })
    }

    fn save_run_state(&self, run_id: &RunId, state: &RunState) -> BoxFuture<'_, Result<()>> {
        {
            let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
            states.insert(run_id.clone(), state.clone());
        }
        Box::pin(async { Ok(()) })
    }

    fn load_graph(&self) -> BoxFuture<'_, Result<Vec<GraphEdge>>> {
        let edges = self.graph.clone();
        Box::pin(async move { Ok(edges) })
    }
}

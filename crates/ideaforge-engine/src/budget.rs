use std::collections::HashMap;
use std::sync::Mutex;

use tracing::warn;

use ideaforge_core::config::BudgetConfig;
use ideaforge_core::types::{NodeId, RunId};

/// Outcome of a budget reservation.
#[derive(Debug, Clone, PartialEq)]
pub enum BudgetDecision {
    Granted {
        /// Remaining units for this node after the reservation
        /// (None = node is uncapped).
        remaining: Option<u64>,
    },
    Denied {
        reason: String,
    },
}

/// Per-run, per-node consumption ledger checked against configured caps.
///
/// Shared across concurrent runs; reserve is a single atomic
/// increment-and-check so runs racing on a shared ceiling can never be
/// double-granted. Consumption is monotonically non-decreasing within a run
/// and is never rolled back — a retried invocation still spends.
pub struct BudgetLedger {
    config: BudgetConfig,
    inner: Mutex<LedgerInner>,
}

#[derive(Default)]
struct LedgerInner {
    node_units: HashMap<(RunId, NodeId), u64>,
    run_units: HashMap<RunId, u64>,
    node_elapsed_ms: HashMap<(RunId, NodeId), u64>,
}

impl BudgetLedger {
    pub fn new(config: BudgetConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(LedgerInner::default()),
        }
    }

    /// Reserve `estimated_cost` units for one stage invocation.
    ///
    /// Denial is treated by the supervisor identically to a guardrail
    /// breach: the run aborts with terminal reason `budget_exceeded`.
    pub fn reserve(&self, run_id: &RunId, node: NodeId, estimated_cost: u64) -> BudgetDecision {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        let node_key = (run_id.clone(), node);
        let node_spent = inner.node_units.get(&node_key).copied().unwrap_or(0);
        let run_spent = inner.run_units.get(run_id).copied().unwrap_or(0);

        if let Some(&cap) = self.config.per_node.get(&node) {
            if node_spent + estimated_cost > cap {
                warn!(run_id = %run_id, node = %node, spent = node_spent, cap, "node budget exhausted");
                return BudgetDecision::Denied { reason: "budget_exceeded".into() };
            }
        }

        if self.config.run_ceiling > 0 && run_spent + estimated_cost > self.config.run_ceiling {
            warn!(run_id = %run_id, spent = run_spent, ceiling = self.config.run_ceiling, "run budget exhausted");
            return BudgetDecision::Denied { reason: "budget_exceeded".into() };
        }

        *inner.node_units.entry(node_key.clone()).or_insert(0) += estimated_cost;
        *inner.run_units.entry(run_id.clone()).or_insert(0) += estimated_cost;

        let remaining = self
            .config
            .per_node
            .get(&node)
            .map(|cap| cap.saturating_sub(inner.node_units[&node_key]));

        BudgetDecision::Granted { remaining }
    }

    /// Record wall-clock consumed by one invocation of a node.
    pub fn record_elapsed(&self, run_id: &RunId, node: NodeId, elapsed_ms: u64) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        *inner
            .node_elapsed_ms
            .entry((run_id.clone(), node))
            .or_insert(0) += elapsed_ms;
    }

    /// Total units consumed by a run so far.
    pub fn run_spend(&self, run_id: &RunId) -> u64 {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.run_units.get(run_id).copied().unwrap_or(0)
    }

    /// Per-node `(units, elapsed_ms)` snapshot for the run report.
    pub fn node_spend(&self, run_id: &RunId) -> HashMap<NodeId, (u64, u64)> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut spend: HashMap<NodeId, (u64, u64)> = HashMap::new();
        for ((run, node), units) in &inner.node_units {
            if run == run_id {
                spend.entry(*node).or_insert((0, 0)).0 = *units;
            }
        }
        for ((run, node), ms) in &inner.node_elapsed_ms {
            if run == run_id {
                spend.entry(*node).or_insert((0, 0)).1 = *ms;
            }
        }
        spend
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger_with(per_node: &[(NodeId, u64)], ceiling: u64) -> BudgetLedger {
        let config = BudgetConfig {
            run_ceiling: ceiling,
            per_node: per_node.iter().copied().collect(),
            ..Default::default()
        };
        BudgetLedger::new(config)
    }

    #[test]
    fn grants_until_node_cap() {
        let ledger = ledger_with(&[(NodeId::Research, 10)], 0);
        let run = RunId::new();

        assert_eq!(
            ledger.reserve(&run, NodeId::Research, 6),
            BudgetDecision::Granted { remaining: Some(4) }
        );
        assert_eq!(
            ledger.reserve(&run, NodeId::Research, 4),
            BudgetDecision::Granted { remaining: Some(0) }
        );
        assert!(matches!(
            ledger.reserve(&run, NodeId::Research, 1),
            BudgetDecision::Denied { .. }
        ));
    }

    #[test]
    fn run_ceiling_spans_nodes() {
        let ledger = ledger_with(&[], 10);
        let run = RunId::new();

        assert!(matches!(
            ledger.reserve(&run, NodeId::Research, 6),
            BudgetDecision::Granted { remaining: None }
        ));
        assert!(matches!(
            ledger.reserve(&run, NodeId::Ideation, 6),
            BudgetDecision::Denied { .. }
        ));
        // A different run has its own allowance.
        assert!(matches!(
            ledger.reserve(&RunId::new(), NodeId::Ideation, 6),
            BudgetDecision::Granted { .. }
        ));
    }

    #[test]
    fn consumption_is_monotonic_across_retries() {
        let ledger = ledger_with(&[], 0);
        let run = RunId::new();

        // Two attempts at the same node both spend; nothing rolls back.
        ledger.reserve(&run, NodeId::Export, 5);
        assert_eq!(ledger.run_spend(&run), 5);
        ledger.reserve(&run, NodeId::Export, 5);
        assert_eq!(ledger.run_spend(&run), 10);
    }

    #[test]
    fn elapsed_accumulates_per_node() {
        let ledger = ledger_with(&[], 0);
        let run = RunId::new();

        ledger.reserve(&run, NodeId::Research, 1);
        ledger.record_elapsed(&run, NodeId::Research, 120);
        ledger.record_elapsed(&run, NodeId::Research, 80);

        let spend = ledger.node_spend(&run);
        assert_eq!(spend.get(&NodeId::Research), Some(&(1, 200)));
    }
}

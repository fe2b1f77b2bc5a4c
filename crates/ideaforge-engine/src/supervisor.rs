use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use ideaforge_core::config::AppConfig;
use ideaforge_core::error::{ForgeError, Result};
use ideaforge_core::event::EventBus;
use ideaforge_core::traits::RunStore;
use ideaforge_core::types::{
    NodeId, OutcomeClass, PipelineEvent, Run, RunId, RunPhase, RunStatus, StageOutcome, StatePatch,
    WorkspaceId,
};

use crate::budget::{BudgetDecision, BudgetLedger};
use crate::executor::StageExecutor;
use crate::graph::GraphDefinition;
use crate::guardrail::{GuardrailMonitor, GuardrailVerdict};
use crate::retry::{RetryAction, RetryController};
use crate::router::{EdgeRouter, RoutingDecision};
use crate::state::StateStore;

/// Units reserved per stage invocation. Budgets are abstract unit pools;
/// the stage timeout bounds wall-clock separately.
const STAGE_COST: u64 = 1;

/// Summary returned when a run reaches a terminal state.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run: Run,
    /// Nodes in the order they were invoked (loops and retries included).
    pub trail: Vec<NodeId>,
    /// Total budget units consumed.
    pub units_spent: u64,
    /// Per-node `(units, elapsed_ms)`.
    pub node_spend: HashMap<NodeId, (u64, u64)>,
    /// Final state version.
    pub state_version: u64,
}

/// Top-level loop driving a run from start to a terminal state.
///
/// Each run executes as one logical sequential task: node invocations within
/// a run are strictly ordered and the state store's `apply` is never held
/// across a suspension point. Multiple supervisors may share the graph
/// (immutable) and the budget ledger (atomic reserve); everything else is
/// per-run.
pub struct RunSupervisor {
    graph: Arc<GraphDefinition>,
    executor: StageExecutor,
    router: EdgeRouter,
    retry: RetryController,
    guardrails: GuardrailMonitor,
    ledger: Arc<BudgetLedger>,
    states: Arc<StateStore>,
    store: Arc<dyn RunStore>,
    events: Arc<EventBus>,
    cancel: CancellationToken,
}

impl RunSupervisor {
    /// Build a supervisor from config. Validates the graph once, up front;
    /// an invalid graph never starts a run.
    pub fn new(
        config: &AppConfig,
        graph: Arc<GraphDefinition>,
        executor: StageExecutor,
        ledger: Arc<BudgetLedger>,
        store: Arc<dyn RunStore>,
        events: Arc<EventBus>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        graph.validate()?;
        Ok(Self {
            router: EdgeRouter::new(graph.clone(), config.guardrails.max_loop_iterations),
            retry: RetryController::new(config.retry.clone()),
            guardrails: GuardrailMonitor::new(config.guardrails.clone()),
            states: Arc::new(StateStore::new()),
            graph,
            executor,
            ledger,
            store,
            events,
            cancel,
        })
    }

    /// Read-only snapshot of a run's state for progress display. Readers
    /// must tolerate staleness; they never mutate.
    pub fn state_snapshot(&self, run_id: &RunId) -> Result<ideaforge_core::types::RunState> {
        self.states.get(run_id)
    }

    /// Drive one run to a terminal status.
    ///
    /// Loop and retry decisions are resolved locally and never surface as
    /// errors; the returned report's status and terminal reason are the
    /// run's externally visible outcome. `Err` is reserved for failures to
    /// even persist that outcome.
    pub async fn execute(&self, run_id: RunId, workspace: WorkspaceId) -> Result<RunReport> {
        let mut run = Run::new(run_id.clone(), workspace);
        let mut trail = Vec::new();

        self.states.create(&run.id);
        if let Some(persisted) = self.store.load_run_state(&run.id).await? {
            self.states.restore(&run.id, persisted);
        }

        run.status = RunStatus::Running;
        self.emit(&run.id, NodeId::Start, RunPhase::RunStarted, serde_json::Value::Null);
        info!(run_id = %run.id, workspace = %run.workspace, "run started");

        let mut current = match self.graph.resolve(NodeId::Start, OutcomeClass::Success) {
            Ok(node) => node,
            Err(e) => return self.fail(run, trail, e).await,
        };

        loop {
            // Cooperative cancellation, checked before each node invocation.
            if self.cancel.is_cancelled() {
                return self.finish(run, trail, RunStatus::Aborted, Some("cancelled".into())).await;
            }

            run.current_node = current;
            run.updated_at = chrono::Utc::now();
            trail.push(current);

            // Budget gate
            let remaining = match self.ledger.reserve(&run.id, current, STAGE_COST) {
                BudgetDecision::Granted { remaining } => remaining,
                BudgetDecision::Denied { reason } => {
                    self.emit(
                        &run.id,
                        current,
                        RunPhase::BudgetDenied,
                        serde_json::json!({ "reason": reason }),
                    );
                    return self.finish(run, trail, RunStatus::Aborted, Some(reason)).await;
                }
            };

            // Invoke the stage against a private snapshot.
            let snapshot = match self.states.get(&run.id) {
                Ok(s) => s,
                Err(e) => return self.fail(run, trail, e).await,
            };
            let attempt = self.retry.attempts(&run.id, current) + 1;
            self.emit(
                &run.id,
                current,
                RunPhase::StageStarted,
                serde_json::json!({ "attempt": attempt }),
            );

            let started = Instant::now();
            let invoked = self
                .executor
                .invoke(&run.id, current, snapshot.clone(), remaining, attempt)
                .await;
            self.ledger
                .record_elapsed(&run.id, current, started.elapsed().as_millis() as u64);

            let outcome = match invoked {
                Ok(outcome) => outcome,
                Err(e) => return self.fail(run, trail, e).await,
            };

            // A cancellation observed while the stage was in flight discards
            // its result; the stage completed naturally.
            if self.cancel.is_cancelled() {
                return self.finish(run, trail, RunStatus::Aborted, Some("cancelled".into())).await;
            }

            self.emit(
                &run.id,
                current,
                RunPhase::StageCompleted,
                serde_json::json!({ "class": outcome.class() }),
            );

            // Merge the outcome and run guardrails on success.
            if let StageOutcome::Success { result, confidence, evidence, flags } = &outcome {
                let patch = StatePatch {
                    evidence: evidence.clone(),
                    result: Some((current, result.clone())),
                    confidence: Some((current, *confidence)),
                    guardrail_flags: flags.clone(),
                    ..Default::default()
                };
                let new_state = match self.states.apply(&run.id, snapshot.version, patch) {
                    Ok(s) => s,
                    Err(e) => return self.fail(run, trail, e).await,
                };
                self.store.save_run_state(&run.id, &new_state).await?;

                if let GuardrailVerdict::Breach { reason } = self.guardrails.evaluate(current, &new_state) {
                    // Overrides whatever the router would have selected.
                    self.emit(
                        &run.id,
                        current,
                        RunPhase::GuardrailBreach,
                        serde_json::json!({ "reason": reason }),
                    );
                    return self.finish(run, trail, RunStatus::Aborted, Some(reason)).await;
                }
            }

            // Route
            let decision = match self.router.route(&run.id, current, &outcome) {
                Ok(d) => d,
                Err(e) => return self.fail(run, trail, e).await,
            };

            match decision {
                RoutingDecision::Advance(next) => {
                    current = next;
                }
                RoutingDecision::LoopBack(target) => {
                    self.emit(
                        &run.id,
                        current,
                        RunPhase::LoopBack,
                        serde_json::json!({
                            "target": target,
                            "iteration": self.router.loop_count(&run.id, current),
                        }),
                    );
                    current = target;
                }
                RoutingDecision::Finished { status, reason } => {
                    return self.finish(run, trail, status, reason).await;
                }
                RoutingDecision::Retry => {
                    match self.retry.on_transient_failure(&run.id, current) {
                        RetryAction::Escalate { reason } => {
                            return self.finish(run, trail, RunStatus::Aborted, Some(reason)).await;
                        }
                        RetryAction::RetryAfter(delay) => {
                            self.emit(
                                &run.id,
                                current,
                                RunPhase::StageRetrying,
                                serde_json::json!({
                                    "delay_ms": delay.as_millis() as u64,
                                    "attempt": attempt,
                                }),
                            );
                            self.backoff(delay).await;
                            // Cancellation re-checked after the backoff delay.
                            if self.cancel.is_cancelled() {
                                return self
                                    .finish(run, trail, RunStatus::Aborted, Some("cancelled".into()))
                                    .await;
                            }
                            // Stay on the same node for the next attempt.
                        }
                    }
                }
            }
        }
    }

    /// Sleep through a backoff delay, waking early on cancellation.
    async fn backoff(&self, delay: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = self.cancel.cancelled() => {}
        }
    }

    /// Terminate a run with an operational outcome.
    async fn finish(
        &self,
        mut run: Run,
        trail: Vec<NodeId>,
        status: RunStatus,
        reason: Option<String>,
    ) -> Result<RunReport> {
        run.status = status;
        run.terminal_reason = reason.clone();
        run.current_node = match status {
            RunStatus::Completed => NodeId::Completed,
            _ => NodeId::Aborted,
        };
        run.updated_at = chrono::Utc::now();

        let phase = match status {
            RunStatus::Completed => RunPhase::RunCompleted,
            _ => RunPhase::RunAborted,
        };
        self.emit(
            &run.id,
            run.current_node,
            phase,
            serde_json::json!({ "reason": reason }),
        );

        match status {
            RunStatus::Completed => info!(run_id = %run.id, "run completed"),
            _ => warn!(run_id = %run.id, reason = reason.as_deref().unwrap_or(""), "run aborted"),
        }

        self.report(run, trail).await
    }

    /// Terminate a run due to a defect. Surfaced to operators distinctly
    /// from normal aborts.
    async fn fail(&self, mut run: Run, trail: Vec<NodeId>, cause: ForgeError) -> Result<RunReport> {
        debug_assert!(cause.is_defect() || matches!(cause, ForgeError::RunNotFound(_)));
        run.status = RunStatus::Failed;
        run.terminal_reason = Some(cause.to_string());
        run.updated_at = chrono::Utc::now();

        error!(run_id = %run.id, error = %cause, "run failed on invariant violation");
        self.emit(
            &run.id,
            run.current_node,
            RunPhase::RunFailed,
            serde_json::json!({ "error": cause.to_string() }),
        );

        self.report(run, trail).await
    }

    async fn report(&self, run: Run, trail: Vec<NodeId>) -> Result<RunReport> {
        let state_version = self.states.get(&run.id).map(|s| s.version).unwrap_or(0);
        Ok(RunReport {
            units_spent: self.ledger.run_spend(&run.id),
            node_spend: self.ledger.node_spend(&run.id),
            trail,
            state_version,
            run,
        })
    }

    fn emit(&self, run_id: &RunId, node: NodeId, phase: RunPhase, payload: serde_json::Value) {
        self.events
            .publish(PipelineEvent::new(run_id, node, phase, payload));
    }
}

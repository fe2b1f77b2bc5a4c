//! End-to-end runs of the supervisor against scripted stages.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use ideaforge_core::config::AppConfig;
use ideaforge_core::error::Result;
use ideaforge_core::event::EventBus;
use ideaforge_core::traits::{Stage, StageContext};
use ideaforge_core::types::{
    EvidenceItem, NodeId, RunId, RunPhase, RunStatus, StageOutcome, WorkspaceId,
};
use ideaforge_engine::{
    BudgetLedger, GraphDefinition, MemoryRunStore, RunSupervisor, StageExecutor,
};

/// A stage that replays a scripted sequence of outcomes, one per invocation.
/// The last outcome repeats once the script is exhausted.
struct ScriptedStage {
    script: Vec<StageOutcome>,
    calls: AtomicUsize,
}

impl ScriptedStage {
    fn new(script: Vec<StageOutcome>) -> Arc<Self> {
        Arc::new(Self {
            script,
            calls: AtomicUsize::new(0),
        })
    }

    fn always(outcome: StageOutcome) -> Arc<Self> {
        Self::new(vec![outcome])
    }
}

impl Stage for ScriptedStage {
    fn invoke(&self, _ctx: StageContext) -> BoxFuture<'_, Result<StageOutcome>> {
        let index = self.calls.fetch_add(1, Ordering::SeqCst);
        let outcome = self
            .script
            .get(index)
            .or_else(|| self.script.last())
            .cloned()
            .expect("script must not be empty");
        Box::pin(async move { Ok(outcome) })
    }
}

/// A stage that sleeps past any reasonable timeout.
struct HangingStage;

impl Stage for HangingStage {
    fn invoke(&self, _ctx: StageContext) -> BoxFuture<'_, Result<StageOutcome>> {
        Box::pin(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(success(1.0))
        })
    }
}

fn success(confidence: f64) -> StageOutcome {
    StageOutcome::Success {
        result: serde_json::json!({"ok": true}),
        confidence,
        evidence: vec![],
        flags: vec![],
    }
}

fn research_success(sources: &[&str]) -> StageOutcome {
    StageOutcome::Success {
        result: serde_json::json!({"signals": sources.len()}),
        confidence: 0.8,
        evidence: sources
            .iter()
            .map(|s| EvidenceItem::new(*s, "market signal", NodeId::Research))
            .collect(),
        flags: vec![],
    }
}

struct Harness {
    config: AppConfig,
    stages: HashMap<NodeId, Arc<dyn Stage>>,
    stage_timeout: Duration,
    cancel: CancellationToken,
    events: Arc<EventBus>,
}

impl Harness {
    fn new() -> Self {
        let mut config = AppConfig::default();
        // Keep tests fast: short backoffs, tight loop/retry budgets.
        config.retry.initial_backoff_ms = 10;
        config.retry.max_backoff_ms = 50;
        config.retry.max_retries = 2;
        config.guardrails.max_loop_iterations = 2;
        config.guardrails.min_source_diversity = 2;

        let mut harness = Self {
            config,
            stages: HashMap::new(),
            stage_timeout: Duration::from_secs(5),
            cancel: CancellationToken::new(),
            events: Arc::new(EventBus::default()),
        };
        // Happy-path defaults; individual tests override per node.
        harness.stage(NodeId::Research, ScriptedStage::always(research_success(&["rss", "github", "forum"])));
        for node in [NodeId::Competitor, NodeId::Ideation, NodeId::Business, NodeId::Tech] {
            harness.stage(node, ScriptedStage::always(success(0.8)));
        }
        harness.stage(NodeId::Validation, ScriptedStage::always(success(0.8)));
        harness.stage(NodeId::Export, ScriptedStage::always(success(1.0)));
        harness
    }

    fn stage(&mut self, node: NodeId, stage: Arc<dyn Stage>) -> &mut Self {
        self.stages.insert(node, stage);
        self
    }

    fn supervisor(&self) -> RunSupervisor {
        let graph = Arc::new(GraphDefinition::standard());
        let mut executor = StageExecutor::new(self.stage_timeout);
        for (&node, stage) in &self.stages {
            executor.register(node, stage.clone());
        }
        RunSupervisor::new(
            &self.config,
            graph.clone(),
            executor,
            Arc::new(BudgetLedger::new(self.config.budget.clone())),
            Arc::new(MemoryRunStore::with_graph(&graph)),
            self.events.clone(),
            self.cancel.clone(),
        )
        .expect("standard graph must validate")
    }

    async fn run(&self) -> ideaforge_engine::RunReport {
        self.supervisor()
            .execute(RunId::new(), WorkspaceId::new("test"))
            .await
            .expect("execute must return a report")
    }
}

// Scenario A: the full pipeline succeeds end to end.
#[tokio::test]
async fn happy_path_completes() {
    let mut harness = Harness::new();
    harness.stage(
        NodeId::Validation,
        ScriptedStage::always(StageOutcome::Success {
            result: serde_json::json!({"validated": 1}),
            confidence: 0.8,
            evidence: vec![],
            flags: vec![],
        }),
    );

    let report = harness.run().await;

    assert_eq!(report.run.status, RunStatus::Completed);
    assert_eq!(report.run.terminal_reason, None);
    assert_eq!(report.run.current_node, NodeId::Completed);
    assert_eq!(
        report.trail,
        vec![
            NodeId::Research,
            NodeId::Competitor,
            NodeId::Ideation,
            NodeId::Business,
            NodeId::Tech,
            NodeId::Validation,
            NodeId::Export,
        ]
    );
    // One unit per invocation, seven invocations.
    assert_eq!(report.units_spent, 7);
}

// Scenario B: evidence from a single source breaches the diversity quota
// immediately after research's successful outcome.
#[tokio::test]
async fn single_source_aborts_on_diversity() {
    let mut harness = Harness::new();
    harness.stage(NodeId::Research, ScriptedStage::always(research_success(&["rss"])));

    let report = harness.run().await;

    assert_eq!(report.run.status, RunStatus::Aborted);
    assert_eq!(report.run.terminal_reason.as_deref(), Some("source_diversity"));
    // The breach fired before any other stage ran.
    assert_eq!(report.trail, vec![NodeId::Research]);
}

// Scenario C: validation reports low confidence three times with
// max_loop_iterations = 2; the third occurrence escalates.
#[tokio::test]
async fn low_confidence_loop_exhaustion_aborts() {
    let mut harness = Harness::new();
    harness.stage(
        NodeId::Validation,
        ScriptedStage::always(StageOutcome::LowConfidence { score: 0.4, threshold: 0.6 }),
    );

    let report = harness.run().await;

    assert_eq!(report.run.status, RunStatus::Aborted);
    assert_eq!(
        report.run.terminal_reason.as_deref(),
        Some("loop_exhausted:Validation")
    );
    // Validation was invoked exactly three times.
    let validations = report.trail.iter().filter(|n| **n == NodeId::Validation).count();
    assert_eq!(validations, 3);
}

// Scenario D: export times out twice with max_retries = 2; the second
// transient failure escalates instead of retrying forever.
#[tokio::test]
async fn export_timeout_retries_then_aborts() {
    let mut harness = Harness::new();
    harness.stage_timeout = Duration::from_millis(30);
    harness.stage(NodeId::Export, Arc::new(HangingStage));

    let report = harness.run().await;

    assert_eq!(report.run.status, RunStatus::Aborted);
    assert_eq!(
        report.run.terminal_reason.as_deref(),
        Some("retries_exhausted:Export")
    );
    let exports = report.trail.iter().filter(|n| **n == NodeId::Export).count();
    assert_eq!(exports, 2);
    // Both attempts spent budget; nothing was rolled back.
    assert_eq!(report.node_spend.get(&NodeId::Export).map(|s| s.0), Some(2));
}

// Scenario E: ideation invoked with zero research-attributed evidence is a
// defect, not an operational abort.
#[tokio::test]
async fn facts_first_violation_fails_the_run() {
    let mut harness = Harness::new();
    // A buggy research stage misattributes its evidence, so the run reaches
    // ideation with zero research-attributed items while still passing the
    // diversity and recency guardrails.
    harness.stage(
        NodeId::Research,
        ScriptedStage::always(StageOutcome::Success {
            result: serde_json::json!({"signals": 2}),
            confidence: 0.9,
            evidence: vec![
                EvidenceItem::new("rss", "signal", NodeId::Competitor),
                EvidenceItem::new("github", "signal", NodeId::Competitor),
            ],
            flags: vec![],
        }),
    );

    let report = harness.run().await;

    assert_eq!(report.run.status, RunStatus::Failed);
    let reason = report.run.terminal_reason.expect("failed runs carry a reason");
    assert!(reason.contains("facts-first"), "unexpected reason: {reason}");
}

// Guardrail verdicts override routing even when the router would advance.
#[tokio::test]
async fn safety_flag_overrides_routing() {
    let mut harness = Harness::new();
    harness.stage(
        NodeId::Ideation,
        ScriptedStage::always(StageOutcome::Success {
            result: serde_json::json!({"ideas": 3}),
            confidence: 0.9,
            evidence: vec![],
            flags: vec!["safety:unsafe_content".into()],
        }),
    );

    let report = harness.run().await;

    assert_eq!(report.run.status, RunStatus::Aborted);
    assert_eq!(
        report.run.terminal_reason.as_deref(),
        Some("safety:unsafe_content")
    );
    assert_eq!(*report.trail.last().unwrap(), NodeId::Ideation);
}

// Budget denial aborts with the budget_exceeded reason.
#[tokio::test]
async fn budget_denial_aborts() {
    let mut harness = Harness::new();
    harness.config.budget.run_ceiling = 3;

    let report = harness.run().await;

    assert_eq!(report.run.status, RunStatus::Aborted);
    assert_eq!(report.run.terminal_reason.as_deref(), Some("budget_exceeded"));
    // Three grants, denial on the fourth node.
    assert_eq!(report.units_spent, 3);
    assert_eq!(report.trail.len(), 4);
}

// An insufficient-evidence loop returns to research, which tops up the
// evidence ledger, and the node then proceeds.
#[tokio::test]
async fn evidence_loop_returns_to_research_then_recovers() {
    let mut harness = Harness::new();
    harness.stage(
        NodeId::Business,
        ScriptedStage::new(vec![
            StageOutcome::InsufficientEvidence { gap: "no pricing signals".into() },
            success(0.8),
        ]),
    );

    let report = harness.run().await;

    assert_eq!(report.run.status, RunStatus::Completed);
    // Research ran twice: once at the start, once for the loop.
    let research_runs = report.trail.iter().filter(|n| **n == NodeId::Research).count();
    assert_eq!(research_runs, 2);
}

// Cancellation observed between nodes aborts cooperatively.
#[tokio::test]
async fn cancellation_aborts_between_nodes() {
    let harness = Harness::new();
    harness.cancel.cancel();

    let report = harness.run().await;

    assert_eq!(report.run.status, RunStatus::Aborted);
    assert_eq!(report.run.terminal_reason.as_deref(), Some("cancelled"));
    assert!(report.trail.is_empty());
}

// Events are emitted in transition order with monotonic timestamps per run.
#[tokio::test]
async fn events_are_ordered_per_run() {
    let harness = Harness::new();
    let mut rx = harness.events.subscribe();

    let report = harness.run().await;
    assert_eq!(report.run.status, RunStatus::Completed);

    let mut phases = Vec::new();
    let mut last_ts = None;
    while let Ok(event) = rx.try_recv() {
        if let Some(prev) = last_ts {
            assert!(event.timestamp >= prev, "timestamps must be monotonic");
        }
        last_ts = Some(event.timestamp);
        phases.push(event.phase);
    }

    assert_eq!(phases.first(), Some(&RunPhase::RunStarted));
    assert_eq!(phases.last(), Some(&RunPhase::RunCompleted));
    assert!(phases.contains(&RunPhase::StageStarted));
    assert!(phases.contains(&RunPhase::StageCompleted));
}

// Concurrent runs do not share loop counters, budgets, or state.
#[tokio::test]
async fn concurrent_runs_are_isolated() {
    let harness = Harness::new();
    let supervisor = Arc::new(harness.supervisor());

    let mut handles = Vec::new();
    for i in 0..4 {
        let supervisor = supervisor.clone();
        handles.push(tokio::spawn(async move {
            supervisor
                .execute(RunId::new(), WorkspaceId::new(format!("ws-{i}")))
                .await
                .unwrap()
        }));
    }

    for handle in handles {
        let report = handle.await.unwrap();
        assert_eq!(report.run.status, RunStatus::Completed);
        assert_eq!(report.units_spent, 7);
    }
}

// A stage that records what it saw: used to check the read-only snapshot and
// budget hint plumbing.
struct ProbingStage {
    seen: Mutex<Vec<(u64, Option<u64>, u32)>>,
}

impl Stage for ProbingStage {
    fn invoke(&self, ctx: StageContext) -> BoxFuture<'_, Result<StageOutcome>> {
        self.seen
            .lock()
            .unwrap()
            .push((ctx.state.version, ctx.budget_remaining, ctx.attempt));
        Box::pin(async move { Ok(success(0.9)) })
    }
}

#[tokio::test]
async fn stages_see_fresh_snapshots_and_budget_hints() {
    let mut harness = Harness::new();
    harness.config.budget.per_node.insert(NodeId::Ideation, 5);
    let probe = Arc::new(ProbingStage { seen: Mutex::new(Vec::new()) });
    harness.stage(NodeId::Ideation, probe.clone());

    let report = harness.run().await;
    assert_eq!(report.run.status, RunStatus::Completed);

    let seen = probe.seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    let (version, remaining, attempt) = seen[0];
    // Research and competitor already applied two versions.
    assert_eq!(version, 2);
    assert_eq!(remaining, Some(4));
    assert_eq!(attempt, 1);
}

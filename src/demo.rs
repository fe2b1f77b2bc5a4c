//! Deterministic offline stage set for the `run` subcommand.
//!
//! These stages exercise the engine end to end without any network or model
//! calls: research fabricates evidence from a fixed set of connectors and the
//! downstream stages derive their outputs from accumulated run state.

use std::sync::Arc;

use futures::future::BoxFuture;

use ideaforge_core::error::Result;
use ideaforge_core::traits::{Stage, StageContext};
use ideaforge_core::types::{EvidenceItem, NodeId, StageOutcome};
use ideaforge_engine::StageExecutor;

struct DemoResearch {
    query: String,
}

impl Stage for DemoResearch {
    fn invoke(&self, _ctx: StageContext) -> BoxFuture<'_, Result<StageOutcome>> {
        let query = self.query.clone();
        Box::pin(async move {
            let sources = ["rss", "github", "product_hunt"];
            let evidence = sources
                .iter()
                .map(|s| {
                    EvidenceItem::new(*s, format!("{s} signal for '{query}'"), NodeId::Research)
                })
                .collect::<Vec<_>>();
            Ok(StageOutcome::Success {
                result: serde_json::json!({
                    "query": query,
                    "signals": evidence.len(),
                    "trend_summary": "steady interest across connectors",
                }),
                confidence: 0.82,
                evidence,
                flags: vec![],
            })
        })
    }
}

struct DemoCompetitor;

impl Stage for DemoCompetitor {
    fn invoke(&self, ctx: StageContext) -> BoxFuture<'_, Result<StageOutcome>> {
        Box::pin(async move {
            Ok(StageOutcome::Success {
                result: serde_json::json!({
                    "competitors": 4,
                    "gaps": ["pricing transparency", "integrations"],
                    "signals_considered": ctx.state.evidence.len(),
                }),
                confidence: 0.7,
                evidence: vec![],
                flags: vec![],
            })
        })
    }
}

struct DemoIdeation;

impl Stage for DemoIdeation {
    fn invoke(&self, ctx: StageContext) -> BoxFuture<'_, Result<StageOutcome>> {
        Box::pin(async move {
            let ideas = ctx.state.evidence.len().min(3);
            Ok(StageOutcome::Success {
                result: serde_json::json!({
                    "ideas": ideas,
                    "positioning": "underserved niche from competitor gaps",
                }),
                confidence: 0.85,
                evidence: vec![],
                flags: vec![],
            })
        })
    }
}

struct DemoBusiness;

impl Stage for DemoBusiness {
    fn invoke(&self, _ctx: StageContext) -> BoxFuture<'_, Result<StageOutcome>> {
        Box::pin(async move {
            Ok(StageOutcome::Success {
                result: serde_json::json!({
                    "revenue_model": "subscription",
                    "viability_score": 0.75,
                }),
                confidence: 0.75,
                evidence: vec![],
                flags: vec![],
            })
        })
    }
}

struct DemoTech;

impl Stage for DemoTech {
    fn invoke(&self, _ctx: StageContext) -> BoxFuture<'_, Result<StageOutcome>> {
        Box::pin(async move {
            Ok(StageOutcome::Success {
                result: serde_json::json!({
                    "complexity": "medium",
                    "feasibility_score": 0.8,
                }),
                confidence: 0.8,
                evidence: vec![],
                flags: vec![],
            })
        })
    }
}

struct DemoValidation;

impl Stage for DemoValidation {
    fn invoke(&self, ctx: StageContext) -> BoxFuture<'_, Result<StageOutcome>> {
        Box::pin(async move {
            // Overall confidence is the mean of what upstream stages reported.
            let scores: Vec<f64> = ctx.state.confidence_by_node.values().copied().collect();
            let overall = if scores.is_empty() {
                0.0
            } else {
                scores.iter().sum::<f64>() / scores.len() as f64
            };
            let threshold = 0.6;
            if overall < threshold {
                Ok(StageOutcome::LowConfidence { score: overall, threshold })
            } else {
                Ok(StageOutcome::Success {
                    result: serde_json::json!({
                        "validated": true,
                        "overall_confidence": overall,
                    }),
                    confidence: overall,
                    evidence: vec![],
                    flags: vec![],
                })
            }
        })
    }
}

struct DemoExport;

impl Stage for DemoExport {
    fn invoke(&self, ctx: StageContext) -> BoxFuture<'_, Result<StageOutcome>> {
        Box::pin(async move {
            Ok(StageOutcome::Success {
                result: serde_json::json!({
                    "export_ready": true,
                    "sections": ctx.state.intermediate_results.len(),
                }),
                confidence: 1.0,
                evidence: vec![],
                flags: vec![],
            })
        })
    }
}

/// Register the demo stage set on an executor.
pub fn register_demo_stages(executor: &mut StageExecutor, query: &str) {
    executor.register(NodeId::Research, Arc::new(DemoResearch { query: query.to_string() }));
    executor.register(NodeId::Competitor, Arc::new(DemoCompetitor));
    executor.register(NodeId::Ideation, Arc::new(DemoIdeation));
    executor.register(NodeId::Business, Arc::new(DemoBusiness));
    executor.register(NodeId::Tech, Arc::new(DemoTech));
    executor.register(NodeId::Validation, Arc::new(DemoValidation));
    executor.register(NodeId::Export, Arc::new(DemoExport));
}

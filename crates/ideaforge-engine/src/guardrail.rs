use chrono::{Duration as ChronoDuration, Utc};
use tracing::warn;

use ideaforge_core::config::GuardrailConfig;
use ideaforge_core::types::{NodeId, RunState};

/// Result of a guardrail evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum GuardrailVerdict {
    Pass,
    Breach { reason: String },
}

/// Cross-cutting policy monitor, run after every successful stage outcome
/// and independent of the edge router.
///
/// Each check is independently sufficient to breach, and a breach forces the
/// run to abort regardless of whatever transition the router selected. The
/// terminal reason records the specific guardrail that triggered.
pub struct GuardrailMonitor {
    config: GuardrailConfig,
}

impl GuardrailMonitor {
    pub fn new(config: GuardrailConfig) -> Self {
        Self { config }
    }

    pub fn evaluate(&self, node: NodeId, state: &RunState) -> GuardrailVerdict {
        // Source diversity quota
        let distinct = state.distinct_sources();
        if distinct < self.config.min_source_diversity {
            warn!(
                node = %node,
                distinct,
                required = self.config.min_source_diversity,
                "source diversity quota not met"
            );
            return GuardrailVerdict::Breach { reason: "source_diversity".into() };
        }

        // Recency gate: at least one evidence item inside the freshness window
        let cutoff = Utc::now() - ChronoDuration::seconds(self.config.recency_window_secs as i64);
        if !state.evidence.iter().any(|e| e.collected_at >= cutoff) {
            warn!(node = %node, window_secs = self.config.recency_window_secs, "no evidence within freshness window");
            return GuardrailVerdict::Breach { reason: "stale_evidence".into() };
        }

        // Stage-reported safety flags
        if let Some(flag) = state.guardrail_flags.iter().find(|f| f.starts_with("safety:")) {
            warn!(node = %node, flag = %flag, "stage-reported safety flag");
            return GuardrailVerdict::Breach { reason: flag.clone() };
        }

        GuardrailVerdict::Pass
    }
}

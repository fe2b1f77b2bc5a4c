use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ForgeError, Result};
use crate::types::NodeId;

/// Top-level ideaforge configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub guardrails: GuardrailConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| ForgeError::ConfigNotFound(path.display().to_string()))?;

        toml::from_str(&content).map_err(|e| ForgeError::Config(e.to_string()))
    }
}

/// Engine-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Workspace label attached to runs.
    #[serde(default = "default_workspace")]
    pub workspace: String,
    /// Capacity of the progress event broadcast channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workspace: default_workspace(),
            event_capacity: default_event_capacity(),
        }
    }
}

/// Cross-cutting guardrail policies, evaluated after every successful stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardrailConfig {
    /// Minimum number of distinct evidence sources.
    #[serde(default = "default_min_source_diversity")]
    pub min_source_diversity: usize,
    /// Freshness window: at least one evidence item must be this recent.
    #[serde(default = "default_recency_window_secs")]
    pub recency_window_secs: u64,
    /// Maximum evidence/confidence loop iterations per node before the loop
    /// is escalated to abort.
    #[serde(default = "default_max_loop_iterations")]
    pub max_loop_iterations: u32,
}

impl Default for GuardrailConfig {
    fn default() -> Self {
        Self {
            min_source_diversity: default_min_source_diversity(),
            recency_window_secs: default_recency_window_secs(),
            max_loop_iterations: default_max_loop_iterations(),
        }
    }
}

/// Retry configuration for transient stage failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

/// Resource budgets, per node and run-wide.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Run-wide ceiling in abstract units (0 = unlimited).
    #[serde(default)]
    pub run_ceiling: u64,
    /// Per-node unit caps (absent node = unlimited).
    #[serde(default)]
    pub per_node: HashMap<NodeId, u64>,
    /// Hard wall-clock timeout for a single stage invocation.
    #[serde(default = "default_stage_timeout_secs")]
    pub stage_timeout_secs: u64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            run_ceiling: 0,
            per_node: HashMap::new(),
            stage_timeout_secs: default_stage_timeout_secs(),
        }
    }
}

fn default_workspace() -> String { "default".to_string() }
fn default_event_capacity() -> usize { 256 }

fn default_min_source_diversity() -> usize { 2 }
fn default_recency_window_secs() -> u64 { 86_400 }
fn default_max_loop_iterations() -> u32 { 2 }

fn default_max_retries() -> u32 { 2 }
fn default_initial_backoff() -> u64 { 1000 }
fn default_max_backoff() -> u64 { 30_000 }

fn default_stage_timeout_secs() -> u64 { 120 }

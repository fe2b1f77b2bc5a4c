use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tracing::warn;

use ideaforge_core::config::RetryConfig;
use ideaforge_core::types::{NodeId, RunId};

/// What to do after a transient failure.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryAction {
    /// Re-invoke the stage after the computed backoff delay.
    RetryAfter(Duration),
    /// Attempts exhausted; the failure is reclassified as fatal.
    Escalate { reason: String },
}

/// Owns per-`(run, node)` attempt counters and backoff computation.
///
/// `max_retries` bounds total failed attempts per node: once that many
/// transient failures have accumulated, the next decision escalates to
/// abort instead of retrying forever. Counters are independent of the edge
/// router's loop counters. Budget accounting is unaffected by retries —
/// every attempt spends.
pub struct RetryController {
    config: RetryConfig,
    attempts: Mutex<HashMap<(RunId, NodeId), u32>>,
}

impl RetryController {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    /// Record a transient failure and decide whether to retry.
    pub fn on_transient_failure(&self, run_id: &RunId, node: NodeId) -> RetryAction {
        let failures = {
            let mut attempts = self.attempts.lock().unwrap_or_else(|e| e.into_inner());
            let count = attempts.entry((run_id.clone(), node)).or_insert(0);
            *count += 1;
            *count
        };

        if failures >= self.config.max_retries {
            warn!(
                run_id = %run_id,
                node = %node,
                failures,
                max_retries = self.config.max_retries,
                "retries exhausted, escalating to abort"
            );
            return RetryAction::Escalate {
                reason: format!("retries_exhausted:{:?}", node),
            };
        }

        RetryAction::RetryAfter(calculate_backoff(failures - 1, &self.config))
    }

    /// Failed attempts recorded so far for a node.
    pub fn attempts(&self, run_id: &RunId, node: NodeId) -> u32 {
        let attempts = self.attempts.lock().unwrap_or_else(|e| e.into_inner());
        attempts.get(&(run_id.clone(), node)).copied().unwrap_or(0)
    }
}

/// Exponential backoff with multiplicative jitter, capped at the configured
/// maximum delay.
fn calculate_backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let ms = (config.initial_backoff_ms * 2u64.pow(attempt)).min(config.max_backoff_ms);
    // Jitter: 1.0x to 1.25x
    let jitter = 1.0 + rand::random::<f64>() * 0.25;
    Duration::from_millis(((ms as f64 * jitter) as u64).min(config.max_backoff_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_backoff_ms: 100,
            max_backoff_ms: 1000,
        }
    }

    #[test]
    fn retries_until_attempts_exhausted() {
        let controller = RetryController::new(config(3));
        let run = RunId::new();

        assert!(matches!(
            controller.on_transient_failure(&run, NodeId::Export),
            RetryAction::RetryAfter(_)
        ));
        assert!(matches!(
            controller.on_transient_failure(&run, NodeId::Export),
            RetryAction::RetryAfter(_)
        ));
        assert_eq!(
            controller.on_transient_failure(&run, NodeId::Export),
            RetryAction::Escalate { reason: "retries_exhausted:Export".into() }
        );
        assert_eq!(controller.attempts(&run, NodeId::Export), 3);
    }

    #[test]
    fn second_failure_escalates_with_two_max_retries() {
        let controller = RetryController::new(config(2));
        let run = RunId::new();

        assert!(matches!(
            controller.on_transient_failure(&run, NodeId::Export),
            RetryAction::RetryAfter(_)
        ));
        assert!(matches!(
            controller.on_transient_failure(&run, NodeId::Export),
            RetryAction::Escalate { .. }
        ));
    }

    #[test]
    fn counters_are_per_node() {
        let controller = RetryController::new(config(2));
        let run = RunId::new();

        controller.on_transient_failure(&run, NodeId::Research);
        assert_eq!(controller.attempts(&run, NodeId::Research), 1);
        assert_eq!(controller.attempts(&run, NodeId::Export), 0);
    }

    #[test]
    fn backoff_grows_and_caps() {
        let config = config(10);

        let first = calculate_backoff(0, &config);
        assert!(first >= Duration::from_millis(100));
        assert!(first <= Duration::from_millis(125));

        let third = calculate_backoff(2, &config);
        assert!(third >= Duration::from_millis(400));
        assert!(third <= Duration::from_millis(500));

        // 100 * 2^6 = 6400 exceeds the 1000ms cap.
        let capped = calculate_backoff(6, &config);
        assert!(capped <= Duration::from_millis(1000));
    }
}

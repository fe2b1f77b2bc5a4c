use crate::types::PipelineEvent;

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events; events for a given run are published
/// in the order its state transitions occur.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<PipelineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: PipelineEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NodeId, RunId, RunPhase};

    #[tokio::test]
    async fn subscribers_receive_events_in_order() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        let run = RunId::new();
        bus.publish(PipelineEvent::new(
            &run,
            NodeId::Research,
            RunPhase::StageStarted,
            serde_json::Value::Null,
        ));
        bus.publish(PipelineEvent::new(
            &run,
            NodeId::Research,
            RunPhase::StageCompleted,
            serde_json::Value::Null,
        ));

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.phase, RunPhase::StageStarted);
        assert_eq!(second.phase, RunPhase::StageCompleted);
        assert!(first.timestamp <= second.timestamp);
    }
}

use crate::types::WorkflowEvent;

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<WorkflowEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: WorkflowEvent) {
        // No receivers is fine
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<WorkflowEvent> {
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
    use crate::types::RunId;

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.publish(WorkflowEvent::RunStarted {
            run_id: RunId::from_str("r1"),
            durable: false,
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.run_id().as_str(), "r1");
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new(4);
        bus.publish(WorkflowEvent::RunError {
            run_id: RunId::new(),
            error: "boom".into(),
        });
    }
}

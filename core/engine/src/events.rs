//! Lifecycle notifications published by the engine.

use tokio::sync::broadcast;

use polyweave_common::{ConflictId, CrudResult, OperationId, OptimisticId, ResourceKey};

use crate::conflict::Resolution;

const DEFAULT_CAPACITY: usize = 1024;

/// Engine lifecycle event.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    ProviderConnected {
        provider: String,
    },
    ProviderFailed {
        provider: String,
        error: String,
    },
    /// Final result of an operation; provisional results are not published.
    OperationCompleted {
        result: CrudResult,
    },
    ConflictDetected {
        conflict_id: ConflictId,
        resource: ResourceKey,
    },
    ConflictResolved {
        conflict_id: ConflictId,
        resolution: Resolution,
    },
    OptimisticApplied {
        id: OptimisticId,
        operation_id: OperationId,
    },
    OptimisticConfirmed {
        id: OptimisticId,
    },
    OptimisticRolledBack {
        id: OptimisticId,
        reason: String,
    },
    ReplicationCompleted {
        operation_id: OperationId,
        target: String,
    },
    ReplicationFailed {
        operation_id: OperationId,
        target: String,
        error: String,
    },
    /// Replica write dropped after exhausting its retry attempts.
    ReplicationAbandoned {
        operation_id: OperationId,
        target: String,
        attempts: u32,
    },
    CacheEvicted {
        key: String,
    },
}

/// Typed publish/subscribe channel for [`EngineEvent`]s.
///
/// Publishing never blocks; slow subscribers lag and miss old events.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn publish(&self, event: EngineEvent) {
        // No subscribers is not an error.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_and_receive() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.publish(EngineEvent::ProviderConnected {
            provider: "pg".to_string(),
        });

        match rx.recv().await.unwrap() {
            EngineEvent::ProviderConnected { provider } => assert_eq!(provider, "pg"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::default();
        bus.publish(EngineEvent::CacheEvicted {
            key: "users:{}".to_string(),
        });
        assert_eq!(bus.subscriber_count(), 0);
    }
}

//! Domain events emitted by the ingestion reconciler.

use relay_core::types::Trade;
use tokio::sync::broadcast;

/// Identity of the master a replication event originates from.
#[derive(Debug, Clone)]
pub struct MasterRef {
    pub id: i64,
    pub username: String,
}

/// Events the replication engine subscribes to.
#[derive(Debug, Clone)]
pub enum DomainEvent {
    /// A master opened a new position.
    MasterPositionOpened {
        master: MasterRef,
        trade: Trade,
        /// Backfill scopes the fan-out to a single reconnecting follower.
        restrict_to_follower: Option<i64>,
    },
    /// A master position disappeared from an authoritative snapshot.
    MasterPositionClosed { master: MasterRef, ticket: String },
    /// An authoritative empty snapshot cleared every open master position.
    MasterPositionsCleared { master: MasterRef },
}

/// Asynchronous in-process queue between ingestion and replication.
///
/// Ingestion publishes after its transaction commits and never waits for
/// replication to finish.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<DomainEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: DomainEvent) {
        if self.tx.send(event).is_err() {
            tracing::warn!("No replication subscriber, domain event dropped");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.publish(DomainEvent::MasterPositionClosed {
            master: MasterRef {
                id: 9,
                username: "mariosat2".to_string(),
            },
            ticket: "11046500".to_string(),
        });

        match rx.recv().await.unwrap() {
            DomainEvent::MasterPositionClosed { master, ticket } => {
                assert_eq!(master.id, 9);
                assert_eq!(ticket, "11046500");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscriber_does_not_panic() {
        let bus = EventBus::new(16);
        bus.publish(DomainEvent::MasterPositionsCleared {
            master: MasterRef {
                id: 9,
                username: "mariosat2".to_string(),
            },
        });
    }
}

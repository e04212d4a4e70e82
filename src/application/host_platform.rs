// Host platform trait for live and historical entity state
use crate::domain::telemetry::{EntityState, StateChangedEvent};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

/// Live state-change subscription. Dropping the feed also unsubscribes it.
#[derive(Debug)]
pub struct StateFeed {
    events: mpsc::Receiver<StateChangedEvent>,
}

impl StateFeed {
    pub fn new(events: mpsc::Receiver<StateChangedEvent>) -> Self {
        Self { events }
    }

    /// Create a feed together with the sender a transport pushes events into.
    pub fn channel(buffer: usize) -> (mpsc::Sender<StateChangedEvent>, Self) {
        let (tx, rx) = mpsc::channel(buffer);
        (tx, Self::new(rx))
    }

    /// Next event, or `None` once the transport has gone away.
    pub async fn recv(&mut self) -> Option<StateChangedEvent> {
        self.events.recv().await
    }

    /// Stop accepting events. Safe to call more than once.
    pub fn unsubscribe(&mut self) {
        self.events.close();
    }
}

#[async_trait]
pub trait HostPlatform: Send + Sync {
    /// Subscribe to state changes for the given entities
    async fn subscribe_state_changes(&self, entity_ids: &[String]) -> anyhow::Result<StateFeed>;

    /// Historical state records for one entity between `start` and `end`, in any order
    async fn fetch_history(
        &self,
        entity_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> anyhow::Result<Vec<EntityState>>;
}

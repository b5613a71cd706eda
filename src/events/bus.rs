use async_trait::async_trait;
use std::collections::VecDeque;
use tokio::sync::{broadcast, Mutex};
use tracing::debug;

use super::{EventEnvelope, PublishError};

const RETAINED_EVENTS: usize = 1024;

/// Outbound port to the platform event bus
#[async_trait]
pub trait EventBus: Send + Sync {
    fn name(&self) -> &str;

    async fn put_event(&self, envelope: EventEnvelope) -> Result<(), PublishError>;
}

/// In-process bus: fans events out to subscribers and keeps a bounded
/// backlog for inspection.
#[derive(Debug)]
pub struct LocalEventBus {
    name: String,
    sender: broadcast::Sender<EventEnvelope>,
    retained: Mutex<VecDeque<EventEnvelope>>,
}

impl LocalEventBus {
    pub fn new(name: impl Into<String>) -> Self {
        let (sender, _) = broadcast::channel(RETAINED_EVENTS);
        Self {
            name: name.into(),
            sender,
            retained: Mutex::new(VecDeque::with_capacity(RETAINED_EVENTS)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.sender.subscribe()
    }

    /// Events put on the bus so far, oldest first.
    pub async fn published(&self) -> Vec<EventEnvelope> {
        self.retained.lock().await.iter().cloned().collect()
    }

    pub async fn published_of(&self, detail_type: &str) -> Vec<EventEnvelope> {
        self.retained
            .lock()
            .await
            .iter()
            .filter(|e| e.detail_type == detail_type)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventBus for LocalEventBus {
    fn name(&self) -> &str {
        &self.name
    }

    async fn put_event(&self, envelope: EventEnvelope) -> Result<(), PublishError> {
        {
            let mut retained = self.retained.lock().await;
            if retained.len() == RETAINED_EVENTS {
                retained.pop_front();
            }
            retained.push_back(envelope.clone());
        }
        // No subscribers is not an error for a fan-out bus.
        if self.sender.send(envelope).is_err() {
            debug!(bus = %self.name, "Event put with no active subscribers");
        }
        Ok(())
    }
}

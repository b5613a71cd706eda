use std::sync::Arc;
use tracing::{info, warn};

use super::{EventBus, EventEnvelope, OnboardingEvent, PublishError};
use crate::config::EventBusConfig;

/// Emits onboarding lifecycle events on behalf of the orchestrator.
///
/// Terminal events are only ever handed to `publish` by the writer that won the
/// terminal transition, which is what makes them exactly-once.
#[derive(Clone)]
pub struct CompletionPublisher {
    bus: Arc<dyn EventBus>,
    config: EventBusConfig,
}

impl CompletionPublisher {
    pub fn new(bus: Arc<dyn EventBus>, config: EventBusConfig) -> Self {
        Self { bus, config }
    }

    pub async fn publish(&self, event: &OnboardingEvent) -> Result<(), PublishError> {
        let envelope = EventEnvelope::new(
            self.config.control_plane_source.clone(),
            event.detail_type(),
            event.detail(),
        );
        let event_id = envelope.id.clone();
        self.bus.put_event(envelope).await?;
        info!(
            bus = %self.bus.name(),
            event_id = %event_id,
            detail_type = event.detail_type(),
            "Published onboarding event"
        );
        Ok(())
    }

    /// Progress events are informational; a publish failure is logged and
    /// does not affect the workflow.
    pub async fn publish_progress(&self, event: &OnboardingEvent) {
        if let Err(e) = self.publish(event).await {
            warn!(detail_type = event.detail_type(), error = %e, "Progress event not published");
        }
    }
}

impl std::fmt::Debug for CompletionPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionPublisher")
            .field("bus", &self.bus.name())
            .field("source", &self.config.control_plane_source)
            .finish()
    }
}

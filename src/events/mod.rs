// Event plumbing between the orchestrator and the rest of the platform
// Transport is out of scope; `EventBus` is the seam and `LocalEventBus` the
// in-process implementation.

pub mod bus;
pub mod listener;
pub mod publisher;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::workflow::types::ExecutionId;

pub use bus::{EventBus, LocalEventBus};
pub use listener::{CallbackListener, EventRouter, ListenerOutcome, OnboardingRequestListener};
pub use publisher::CompletionPublisher;

/// Detail types emitted by the control plane
pub mod detail_types {
    pub const ONBOARDING_INITIATED: &str = "onboarding-initiated";
    pub const ONBOARDING_PROVISIONED: &str = "onboarding-provisioned";
    pub const ONBOARDING_SUCCEEDED: &str = "onboarding-succeeded";
    pub const ONBOARDING_FAILED: &str = "onboarding-failed";
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Event bus {bus} rejected event: {reason}")]
    Rejected { bus: String, reason: String },
}

/// Transport-neutral event: source + detail-type routing with a JSON detail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    #[serde(default = "generate_event_id")]
    pub id: String,
    pub source: String,
    pub detail_type: String,
    pub detail: Value,
    #[serde(default = "Utc::now")]
    pub time: DateTime<Utc>,
}

fn generate_event_id() -> String {
    Uuid::new_v4().to_string()
}

impl EventEnvelope {
    pub fn new(source: impl Into<String>, detail_type: impl Into<String>, detail: Value) -> Self {
        Self {
            id: generate_event_id(),
            source: source.into(),
            detail_type: detail_type.into(),
            detail,
            time: Utc::now(),
        }
    }
}

/// Lifecycle events the control plane publishes about one execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OnboardingEvent {
    Initiated {
        tenant_id: String,
        execution_id: ExecutionId,
    },
    Provisioned {
        tenant_id: String,
        execution_id: ExecutionId,
    },
    Succeeded {
        tenant_id: String,
        execution_id: ExecutionId,
    },
    Failed {
        tenant_id: String,
        execution_id: ExecutionId,
        reason: String,
    },
}

impl OnboardingEvent {
    pub fn detail_type(&self) -> &'static str {
        match self {
            OnboardingEvent::Initiated { .. } => detail_types::ONBOARDING_INITIATED,
            OnboardingEvent::Provisioned { .. } => detail_types::ONBOARDING_PROVISIONED,
            OnboardingEvent::Succeeded { .. } => detail_types::ONBOARDING_SUCCEEDED,
            OnboardingEvent::Failed { .. } => detail_types::ONBOARDING_FAILED,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OnboardingEvent::Succeeded { .. } | OnboardingEvent::Failed { .. }
        )
    }

    pub fn detail(&self) -> Value {
        match self {
            OnboardingEvent::Initiated {
                tenant_id,
                execution_id,
            }
            | OnboardingEvent::Provisioned {
                tenant_id,
                execution_id,
            }
            | OnboardingEvent::Succeeded {
                tenant_id,
                execution_id,
            } => json!({ "tenantId": tenant_id, "executionId": execution_id }),
            OnboardingEvent::Failed {
                tenant_id,
                execution_id,
                reason,
            } => json!({ "tenantId": tenant_id, "executionId": execution_id, "reason": reason }),
        }
    }
}

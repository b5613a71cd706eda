use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

use super::EventEnvelope;
use crate::config::EventBusConfig;
use crate::workflow::errors::OnboardingError;
use crate::workflow::orchestrator::Orchestrator;
use crate::workflow::types::{
    ExecutionId, OnboardingRequest, ResumeResponse, StepOutcome, TokenId,
};

/// Source + detail-type subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventFilter {
    pub source: String,
    pub detail_type: String,
}

impl EventFilter {
    pub fn new(source: impl Into<String>, detail_type: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            detail_type: detail_type.into(),
        }
    }

    pub fn matches(&self, envelope: &EventEnvelope) -> bool {
        envelope.source == self.source && envelope.detail_type == self.detail_type
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ListenerOutcome {
    Started(ExecutionId),
    Resumed(ResumeResponse),
    /// Matched the subscription but the payload was unusable
    Rejected { reason: String },
    /// Not for this listener
    Ignored,
}

/// Turns onboarding-request events into `start` calls.
///
/// Delivery upstream is at-least-once and nothing here deduplicates: a
/// redelivered request starts a second execution.
pub struct OnboardingRequestListener {
    orchestrator: Arc<Orchestrator>,
    filter: EventFilter,
}

impl OnboardingRequestListener {
    pub fn new(orchestrator: Arc<Orchestrator>, config: &EventBusConfig) -> Self {
        Self {
            orchestrator,
            filter: EventFilter::new(
                config.control_plane_source.clone(),
                config.onboarding_detail_type.clone(),
            ),
        }
    }

    pub async fn handle(&self, envelope: &EventEnvelope) -> Result<ListenerOutcome, OnboardingError> {
        if !self.filter.matches(envelope) {
            return Ok(ListenerOutcome::Ignored);
        }

        let request = match OnboardingRequest::from_detail(&envelope.detail) {
            Ok(request) => request,
            Err(OnboardingError::Validation { reason }) => {
                warn!(event_id = %envelope.id, %reason, "Rejected onboarding request");
                return Ok(ListenerOutcome::Rejected { reason });
            }
            Err(e) => return Err(e),
        };

        let execution_id = self.orchestrator.start(request).await?;
        info!(event_id = %envelope.id, %execution_id, "Onboarding request started execution");
        Ok(ListenerOutcome::Started(execution_id))
    }
}

/// Turns provisioning-result events from the application plane into `resume`
/// calls. Detail shape: `{ tenantId, taskToken, result: "success"|"failure", .. }`;
/// everything except the token is handed to the workflow as callback data.
pub struct CallbackListener {
    orchestrator: Arc<Orchestrator>,
    filter: EventFilter,
}

impl CallbackListener {
    pub fn new(orchestrator: Arc<Orchestrator>, config: &EventBusConfig) -> Self {
        Self {
            orchestrator,
            filter: EventFilter::new(
                config.application_plane_source.clone(),
                config.provisioning_result_detail_type.clone(),
            ),
        }
    }

    pub async fn handle(&self, envelope: &EventEnvelope) -> Result<ListenerOutcome, OnboardingError> {
        if !self.filter.matches(envelope) {
            return Ok(ListenerOutcome::Ignored);
        }

        let (token, outcome, data) = match parse_result(&envelope.detail) {
            Ok(parsed) => parsed,
            Err(reason) => {
                warn!(event_id = %envelope.id, %reason, "Rejected provisioning result");
                return Ok(ListenerOutcome::Rejected { reason });
            }
        };

        let response = self.orchestrator.resume(&token, outcome, data).await?;
        Ok(ListenerOutcome::Resumed(response))
    }
}

fn parse_result(detail: &Value) -> Result<(TokenId, StepOutcome, Value), String> {
    let Some(fields) = detail.as_object() else {
        return Err("provisioning result detail must be an object".to_string());
    };
    let token = fields
        .get("taskToken")
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| "provisioning result is missing taskToken".to_string())?;
    let outcome = match fields.get("result").and_then(Value::as_str) {
        Some(r) if r.eq_ignore_ascii_case("success") => StepOutcome::Success,
        Some(r) if r.eq_ignore_ascii_case("failure") => StepOutcome::Failure,
        Some(other) => return Err(format!("unknown provisioning result '{other}'")),
        None => return Err("provisioning result is missing result".to_string()),
    };

    let mut data = fields.clone();
    data.remove("taskToken");
    Ok((TokenId::from(token), outcome, Value::Object(data)))
}

/// Fans one inbound event out to whichever listener subscribes to it.
pub struct EventRouter {
    requests: OnboardingRequestListener,
    callbacks: CallbackListener,
}

impl EventRouter {
    pub fn new(orchestrator: Arc<Orchestrator>, config: &EventBusConfig) -> Self {
        Self {
            requests: OnboardingRequestListener::new(orchestrator.clone(), config),
            callbacks: CallbackListener::new(orchestrator, config),
        }
    }

    pub async fn dispatch(&self, envelope: &EventEnvelope) -> Result<ListenerOutcome, OnboardingError> {
        match self.requests.handle(envelope).await? {
            ListenerOutcome::Ignored => self.callbacks.handle(envelope).await,
            handled => Ok(handled),
        }
    }
}

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[cfg(test)]
use mockall::automock;

use super::{error_detail, StepHandler, StepInput, StepReport};
use crate::config::EventBusConfig;
use crate::events::{EventBus, EventEnvelope};
use crate::workflow::types::{ExecutionId, StepName, TokenId};

#[derive(Debug, Error)]
pub enum ProvisionerError {
    #[error("Provisioning request could not be dispatched: {0}")]
    Dispatch(String),

    #[error("Provisioning request rejected: {0}")]
    Rejected(String),
}

/// What the application plane is asked to build
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisioningRequest {
    pub tenant_id: String,
    pub tenant_name: String,
    pub execution_id: ExecutionId,
    /// Echoed back on the provisioning-result event
    pub task_token: TokenId,
    pub config: Value,
}

/// Port to the external long-running provisioning system.
///
/// Implementations hand off and return; completion arrives later through
/// `Orchestrator::resume`.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn request_provisioning(&self, request: ProvisioningRequest)
        -> Result<(), ProvisionerError>;
}

/// Default provisioner: puts a provisioning-requested event on the bus for the
/// application plane to pick up.
pub struct EventBusProvisioner {
    bus: Arc<dyn EventBus>,
    config: EventBusConfig,
}

impl EventBusProvisioner {
    pub fn new(bus: Arc<dyn EventBus>, config: EventBusConfig) -> Self {
        Self { bus, config }
    }
}

#[async_trait]
impl Provisioner for EventBusProvisioner {
    async fn request_provisioning(
        &self,
        request: ProvisioningRequest,
    ) -> Result<(), ProvisionerError> {
        let detail =
            serde_json::to_value(&request).map_err(|e| ProvisionerError::Dispatch(e.to_string()))?;
        let envelope = EventEnvelope::new(
            self.config.control_plane_source.clone(),
            self.config.provisioning_request_detail_type.clone(),
            detail,
        );
        self.bus
            .put_event(envelope)
            .await
            .map_err(|e| ProvisionerError::Dispatch(e.to_string()))
    }
}

/// Hands the tenant to the provisioner and suspends on the callback token.
pub struct ProvisionHandler {
    provisioner: Arc<dyn Provisioner>,
}

impl ProvisionHandler {
    pub fn new(provisioner: Arc<dyn Provisioner>) -> Self {
        Self { provisioner }
    }
}

#[async_trait]
impl StepHandler for ProvisionHandler {
    fn step(&self) -> StepName {
        StepName::Provision
    }

    async fn invoke(&self, input: StepInput) -> StepReport {
        let Some(token) = input.callback_token else {
            return StepReport::Failure {
                error_detail: error_detail("MissingCallbackToken", "provision invoked without a token"),
            };
        };

        let request = ProvisioningRequest {
            tenant_id: input.tenant_id.clone(),
            tenant_name: input.request.tenant_name.clone(),
            execution_id: input.execution_id.clone(),
            task_token: token.clone(),
            config: input.request.config.clone(),
        };

        match self.provisioner.request_provisioning(request).await {
            Ok(()) => {
                info!(
                    execution_id = %input.execution_id,
                    tenant_id = %input.tenant_id,
                    "Provisioning requested, suspending"
                );
                StepReport::Pending { token }
            }
            Err(e) => {
                warn!(execution_id = %input.execution_id, error = %e, "Provisioning request failed");
                StepReport::Failure {
                    error_detail: error_detail("ProvisioningRequestFailed", e.to_string()),
                }
            }
        }
    }
}

// Step handlers
// Each handler is a stateless, one-shot unit. Everything it needs arrives in
// `StepInput`; everything it produces leaves in `StepReport`. Failures are
// values, never panics or errors crossing into the orchestrator.

pub mod complete;
pub mod error_handler;
pub mod initiate;
pub mod provision;

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use crate::store::TenantStore;
use crate::workflow::types::{ExecutionId, OnboardingRequest, StepName, TokenId};

pub use complete::CompleteHandler;
pub use error_handler::{ErrorHandler, StepFailure};
pub use initiate::InitiateHandler;
pub use provision::{
    EventBusProvisioner, ProvisionHandler, Provisioner, ProvisionerError, ProvisioningRequest,
};

#[derive(Debug, Clone, PartialEq)]
pub struct StepInput {
    pub execution_id: ExecutionId,
    pub tenant_id: String,
    pub request: OnboardingRequest,
    /// Accumulated output of prior steps; `{}` for Initiate
    pub previous_output: Value,
    /// Set only for Provision
    pub callback_token: Option<TokenId>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepReport {
    Success { output: Value },
    Failure { error_detail: Value },
    /// External work was requested; the execution suspends on `token`
    Pending { token: TokenId },
}

#[async_trait]
pub trait StepHandler: Send + Sync {
    fn step(&self) -> StepName;

    async fn invoke(&self, input: StepInput) -> StepReport;
}

/// The three sequenced steps. ErrorHandler is not swappable; it is owned by the
/// orchestrator.
#[derive(Clone)]
pub struct StepHandlers {
    pub initiate: Arc<dyn StepHandler>,
    pub provision: Arc<dyn StepHandler>,
    pub complete: Arc<dyn StepHandler>,
}

impl StepHandlers {
    pub fn standard(tenants: Arc<dyn TenantStore>, provisioner: Arc<dyn Provisioner>) -> Self {
        Self {
            initiate: Arc::new(InitiateHandler::new(tenants.clone())),
            provision: Arc::new(ProvisionHandler::new(provisioner)),
            complete: Arc::new(CompleteHandler::new(tenants)),
        }
    }

    pub fn with_initiate(mut self, handler: Arc<dyn StepHandler>) -> Self {
        self.initiate = handler;
        self
    }

    pub fn with_provision(mut self, handler: Arc<dyn StepHandler>) -> Self {
        self.provision = handler;
        self
    }

    pub fn with_complete(mut self, handler: Arc<dyn StepHandler>) -> Self {
        self.complete = handler;
        self
    }
}

impl std::fmt::Debug for StepHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepHandlers")
            .field("initiate", &self.initiate.step())
            .field("provision", &self.provision.step())
            .field("complete", &self.complete.step())
            .finish()
    }
}

/// Error detail shape shared by the built-in handlers.
pub(crate) fn error_detail(error: &str, message: impl Into<String>) -> Value {
    serde_json::json!({ "error": error, "message": message.into() })
}

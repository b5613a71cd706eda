use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;

use super::{error_detail, StepHandler, StepInput, StepReport};
use crate::store::TenantStore;
use crate::workflow::types::{StepName, TenantStatus};

/// Final check before the workflow succeeds: the tenant must still be PENDING.
/// The ACTIVE flip itself happens when the execution commits SUCCEEDED.
pub struct CompleteHandler {
    tenants: Arc<dyn TenantStore>,
}

impl CompleteHandler {
    pub fn new(tenants: Arc<dyn TenantStore>) -> Self {
        Self { tenants }
    }
}

#[async_trait]
impl StepHandler for CompleteHandler {
    fn step(&self) -> StepName {
        StepName::Complete
    }

    async fn invoke(&self, input: StepInput) -> StepReport {
        let record = match self.tenants.load_tenant(&input.tenant_id).await {
            Ok(record) => record,
            Err(e) => {
                return StepReport::Failure {
                    error_detail: error_detail("TenantStoreUnavailable", e.to_string()),
                }
            }
        };

        match record {
            Some(record) if record.status == TenantStatus::Pending => StepReport::Success {
                output: json!({
                    "tenantId": record.tenant_id,
                    "tenantName": record.name,
                    "provisioned": input.previous_output.get("provisioning").is_some(),
                }),
            },
            Some(record) => StepReport::Failure {
                error_detail: error_detail(
                    "TenantNotPending",
                    format!("tenant {} is {}", record.tenant_id, record.status),
                ),
            },
            None => StepReport::Failure {
                error_detail: error_detail(
                    "TenantNotFound",
                    format!("tenant {} has no record", input.tenant_id),
                ),
            },
        }
    }
}

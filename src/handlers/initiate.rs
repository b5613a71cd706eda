use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

use super::{error_detail, StepHandler, StepInput, StepReport};
use crate::store::{StoreError, TenantStore};
use crate::workflow::types::{StepName, TenantRecord, TenantStatus};

/// Registers the tenant as PENDING.
///
/// A FAILED tenant is a resubmission and is moved back to PENDING. A PENDING
/// tenant is accepted as-is. ACTIVE and DEPROVISIONED tenants are refused.
pub struct InitiateHandler {
    tenants: Arc<dyn TenantStore>,
}

impl InitiateHandler {
    pub fn new(tenants: Arc<dyn TenantStore>) -> Self {
        Self { tenants }
    }

    async fn register(&self, input: &StepInput) -> Result<StepReport, StoreError> {
        let record = TenantRecord {
            tenant_id: input.tenant_id.clone(),
            name: input.request.tenant_name.clone(),
            config: input.request.config.clone(),
            status: TenantStatus::Pending,
        };

        if self.tenants.insert_tenant(&record).await? {
            info!(tenant_id = %input.tenant_id, "Tenant registered as PENDING");
            return Ok(self.registered(input, false));
        }

        let existing = self.tenants.load_tenant(&input.tenant_id).await?;
        let status = existing.map(|r| r.status);
        match status {
            Some(TenantStatus::Pending) => Ok(self.registered(input, false)),
            Some(TenantStatus::Failed) => {
                let reset = self
                    .tenants
                    .compare_and_swap(&input.tenant_id, TenantStatus::Failed, TenantStatus::Pending)
                    .await?;
                if reset {
                    info!(tenant_id = %input.tenant_id, "Resubmitted tenant moved FAILED -> PENDING");
                    Ok(self.registered(input, true))
                } else {
                    Ok(StepReport::Failure {
                        error_detail: error_detail(
                            "TenantStatusConflict",
                            "tenant status changed during resubmission",
                        ),
                    })
                }
            }
            Some(other) => {
                warn!(tenant_id = %input.tenant_id, status = %other, "Tenant cannot be onboarded");
                Ok(StepReport::Failure {
                    error_detail: error_detail(
                        "TenantNotOnboardable",
                        format!("tenant {} is {other}", input.tenant_id),
                    ),
                })
            }
            None => Ok(StepReport::Failure {
                error_detail: error_detail(
                    "TenantStatusConflict",
                    "tenant record vanished during registration",
                ),
            }),
        }
    }

    fn registered(&self, input: &StepInput, resubmitted: bool) -> StepReport {
        StepReport::Success {
            output: json!({
                "tenantId": input.tenant_id,
                "tenantName": input.request.tenant_name,
                "tenantStatus": TenantStatus::Pending,
                "resubmitted": resubmitted,
            }),
        }
    }
}

#[async_trait]
impl StepHandler for InitiateHandler {
    fn step(&self) -> StepName {
        StepName::Initiate
    }

    async fn invoke(&self, input: StepInput) -> StepReport {
        match self.register(&input).await {
            Ok(report) => report,
            Err(e) => StepReport::Failure {
                error_detail: error_detail("TenantStoreUnavailable", e.to_string()),
            },
        }
    }
}

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

use crate::store::{CallbackRegistry, StoreError, TenantStore};
use crate::workflow::types::{
    FailureReason, StepName, StepResult, TenantRecord, TenantStatus, WorkflowExecution,
};

/// Why and where an execution is being failed
#[derive(Debug, Clone, PartialEq)]
pub struct StepFailure {
    /// Step that was running when the failure happened
    pub step: StepName,
    pub reason: FailureReason,
    pub detail: Value,
    pub started_at: DateTime<Utc>,
}

/// Catch-all failure path.
///
/// The orchestrator calls these in order: `invalidate_tokens`, then commits the
/// FAILED execution carrying `failure_record`, and only if that commit won,
/// `mark_tenant_failed`. The terminal-state check plus the version CAS make a
/// second invocation for the same execution a no-op.
#[derive(Clone)]
pub struct ErrorHandler {
    callbacks: Arc<dyn CallbackRegistry>,
    tenants: Arc<dyn TenantStore>,
}

impl ErrorHandler {
    pub fn new(callbacks: Arc<dyn CallbackRegistry>, tenants: Arc<dyn TenantStore>) -> Self {
        Self { callbacks, tenants }
    }

    /// Withdraw every outstanding token of the execution so late callbacks are
    /// rejected without side effect.
    pub async fn invalidate_tokens(&self, execution: &WorkflowExecution) -> Result<usize, StoreError> {
        let mut invalidated = 0;
        if let Some(active) = &execution.active_callback_token_id {
            if self.callbacks.invalidate_token(active).await? {
                invalidated += 1;
            }
        }
        for token in self.callbacks.outstanding_tokens(&execution.id).await? {
            if self.callbacks.invalidate_token(&token.id).await? {
                invalidated += 1;
            }
        }
        if invalidated > 0 {
            info!(execution_id = %execution.id, invalidated, "Invalidated outstanding callback tokens");
        }
        Ok(invalidated)
    }

    /// History entry recording the originating step and its error.
    pub fn failure_record(&self, failure: &StepFailure, now: DateTime<Utc>) -> StepResult {
        StepResult::failure(
            failure.step,
            json!({
                "reason": failure.reason,
                "detail": failure.detail,
                "handledBy": StepName::ErrorHandler.to_string(),
            }),
            failure.started_at,
            now,
        )
    }

    /// PENDING -> FAILED, or a FAILED record when Initiate never registered the
    /// tenant. `false` when the tenant exists in any other status.
    pub async fn mark_tenant_failed(&self, execution: &WorkflowExecution) -> Result<bool, StoreError> {
        let tenant_id = execution.tenant_id.as_str();
        if self
            .tenants
            .compare_and_swap(tenant_id, TenantStatus::Pending, TenantStatus::Failed)
            .await?
        {
            return Ok(true);
        }

        let record = TenantRecord {
            tenant_id: execution.tenant_id.clone(),
            name: execution.request.tenant_name.clone(),
            config: execution.request.config.clone(),
            status: TenantStatus::Failed,
        };
        if self.tenants.insert_tenant(&record).await? {
            info!(tenant_id, "Recorded tenant as FAILED");
            return Ok(true);
        }

        warn!(tenant_id, "Tenant was not PENDING; FAILED status not applied");
        Ok(false)
    }
}

impl std::fmt::Debug for ErrorHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorHandler").finish_non_exhaustive()
    }
}

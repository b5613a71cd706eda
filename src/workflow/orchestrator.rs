use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, error, info, warn, Instrument};

use super::errors::OnboardingError;
use super::state_machine::{is_forward, next_state};
use super::types::{
    merge_output, CallbackToken, ExecutionId, FailureReason, OnboardingRequest, ResumeRejection,
    ResumeResponse, StepName, StepOutcome, StepResult, TenantRecord, TenantStatus, TokenId,
    WorkflowExecution, WorkflowState,
};
use crate::clock::{Clock, SystemClock};
use crate::config::TimeoutConfig;
use crate::events::{CompletionPublisher, OnboardingEvent};
use crate::handlers::{
    error_detail, ErrorHandler, StepFailure, StepHandler, StepHandlers, StepInput, StepReport,
};
use crate::store::{Stores, TokenRedemption};
use crate::telemetry::{create_workflow_span, generate_correlation_id, instance_id};

/// What came back from one bounded step invocation
enum StepRun {
    Report(StepReport),
    TimedOut,
}

/// Interprets the onboarding state machine over persisted executions.
///
/// The orchestrator keeps no per-execution state in memory: every call loads
/// what it needs, and every mutation is a compare-and-swap on the execution's
/// `version`. Any number of instances may share the same stores.
#[derive(Clone, Debug)]
pub struct Orchestrator {
    stores: Stores,
    handlers: StepHandlers,
    error_handler: ErrorHandler,
    publisher: CompletionPublisher,
    timeouts: TimeoutConfig,
    clock: Arc<dyn Clock>,
}

impl Orchestrator {
    pub fn new(
        stores: Stores,
        handlers: StepHandlers,
        publisher: CompletionPublisher,
        timeouts: TimeoutConfig,
    ) -> Self {
        let error_handler = ErrorHandler::new(stores.callbacks.clone(), stores.tenants.clone());
        Self {
            stores,
            handlers,
            error_handler,
            publisher,
            timeouts,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Create an execution for `request` and drive it until it suspends on
    /// Provision or reaches a terminal state.
    ///
    /// Only a structurally invalid request is reported as an error without
    /// anything being persisted; step failures end up as a FAILED execution.
    pub async fn start(&self, request: OnboardingRequest) -> Result<ExecutionId, OnboardingError> {
        request.validate()?;

        let execution = WorkflowExecution::new(request, self.clock.now());
        let id = execution.id.clone();
        let correlation_id = generate_correlation_id();
        let span = create_workflow_span(
            "start",
            Some(&execution.tenant_id),
            Some(id.as_str()),
            &correlation_id,
        );

        self.begin(execution).instrument(span).await?;
        Ok(id)
    }

    async fn begin(&self, execution: WorkflowExecution) -> Result<(), OnboardingError> {
        self.stores.executions.insert_execution(&execution).await?;
        info!(
            execution_id = %execution.id,
            tenant_id = %execution.tenant_id,
            instance = %instance_id(),
            "Workflow execution created"
        );

        let running = self.successor(&execution, StepOutcome::Success, self.clock.now())?;
        if self.commit(&execution, &running).await? {
            self.run_initiate(running).await?;
        }
        Ok(())
    }

    /// Apply an external completion to the execution suspended on `token`.
    pub async fn resume(
        &self,
        token: &TokenId,
        outcome: StepOutcome,
        data: Value,
    ) -> Result<ResumeResponse, OnboardingError> {
        let correlation_id = generate_correlation_id();
        let span = create_workflow_span("resume", None, None, &correlation_id);
        self.apply_callback(token, outcome, data)
            .instrument(span)
            .await
    }

    async fn apply_callback(
        &self,
        token_id: &TokenId,
        outcome: StepOutcome,
        data: Value,
    ) -> Result<ResumeResponse, OnboardingError> {
        let token = match self
            .stores
            .callbacks
            .consume_token(token_id, self.clock.now())
            .await?
        {
            TokenRedemption::Consumed(token) => token,
            TokenRedemption::AlreadyConsumed => {
                info!("Callback rejected: token already consumed");
                return Ok(ResumeResponse::rejected(ResumeRejection::AlreadyConsumed));
            }
            TokenRedemption::Invalid => {
                info!("Callback rejected: token unknown, expired or invalidated");
                return Ok(ResumeResponse::rejected(ResumeRejection::TokenInvalid));
            }
        };

        let Some(execution) = self
            .stores
            .executions
            .load_execution(&token.execution_id)
            .await?
        else {
            warn!(execution_id = %token.execution_id, "Consumed token points at a missing execution");
            return self.retract_redemption(&token.id).await;
        };

        if execution.state != WorkflowState::RunningProvision
            || execution.active_callback_token_id.as_ref() != Some(&token.id)
        {
            info!(
                execution_id = %execution.id,
                state = %execution.state,
                "Callback rejected: execution no longer waiting on this token"
            );
            return self.retract_redemption(&token.id).await;
        }

        info!(
            execution_id = %execution.id,
            tenant_id = %execution.tenant_id,
            outcome = ?outcome,
            instance = %instance_id(),
            "Resuming suspended execution"
        );

        let applied = match outcome {
            StepOutcome::Success => self.complete_provision(execution, data).await?,
            StepOutcome::Failure => {
                let failure = StepFailure {
                    step: StepName::Provision,
                    reason: FailureReason::StepFailure,
                    detail: data,
                    started_at: execution.state_entered_at,
                };
                self.fail(&execution, failure).await?
            }
        };

        if applied {
            Ok(ResumeResponse::accepted())
        } else {
            self.retract_redemption(&token.id).await
        }
    }

    /// A redeemed token whose resume was not applied ends up invalidated, so
    /// every later delivery sees `TokenInvalid` rather than `AlreadyConsumed`.
    async fn retract_redemption(
        &self,
        token_id: &TokenId,
    ) -> Result<ResumeResponse, OnboardingError> {
        if self.stores.callbacks.void_token(token_id).await? {
            debug!("Consumed token voided; resume was not applied");
        }
        Ok(ResumeResponse::rejected(ResumeRejection::TokenInvalid))
    }

    /// Fail the execution with `StepTimeout` if its current state's deadline
    /// has passed. Returns whether this call applied the failure.
    pub async fn fire_timeout(&self, id: &ExecutionId) -> Result<bool, OnboardingError> {
        let execution = self.execution(id).await?;
        if execution.is_terminal() {
            return Ok(false);
        }
        let Some(deadline) = self.deadline(&execution) else {
            return Ok(false);
        };
        if self.clock.now() < deadline {
            debug!(execution_id = %id, %deadline, "Deadline not reached");
            return Ok(false);
        }

        let failure = StepFailure {
            step: execution.state.step().unwrap_or(StepName::Initiate),
            reason: FailureReason::StepTimeout,
            detail: json!({
                "error": FailureReason::StepTimeout,
                "state": execution.state,
                "deadline": deadline,
            }),
            started_at: execution.state_entered_at,
        };
        self.fail(&execution, failure).await
    }

    /// Sweep every running execution and time out the overdue ones.
    pub async fn expire_overdue(&self) -> Result<Vec<ExecutionId>, OnboardingError> {
        let now = self.clock.now();
        let mut expired = Vec::new();

        for execution in self.stores.executions.running_executions().await? {
            match self.deadline(&execution) {
                Some(deadline) if now >= deadline => {}
                _ => continue,
            }
            match self.fire_timeout(&execution.id).await {
                Ok(true) => expired.push(execution.id),
                Ok(false) => {}
                Err(e) => error!(
                    execution_id = %execution.id,
                    error = %e,
                    "Timeout could not be applied; execution needs operator attention"
                ),
            }
        }

        if !expired.is_empty() {
            info!(count = expired.len(), "Expired overdue executions");
        }
        Ok(expired)
    }

    pub async fn execution(&self, id: &ExecutionId) -> Result<WorkflowExecution, OnboardingError> {
        self.stores
            .executions
            .load_execution(id)
            .await?
            .ok_or_else(|| OnboardingError::ExecutionNotFound(id.clone()))
    }

    pub async fn executions_for_tenant(
        &self,
        tenant_id: &str,
    ) -> Result<Vec<WorkflowExecution>, OnboardingError> {
        Ok(self.stores.executions.executions_for_tenant(tenant_id).await?)
    }

    pub async fn tenant(&self, tenant_id: &str) -> Result<Option<TenantRecord>, OnboardingError> {
        Ok(self.stores.tenants.load_tenant(tenant_id).await?)
    }

    /// Persisted deadline of the execution's current state.
    pub fn deadline(&self, execution: &WorkflowExecution) -> Option<DateTime<Utc>> {
        self.timeouts
            .for_state(execution.state)
            .map(|window| execution.state_entered_at + window)
    }

    async fn run_initiate(&self, execution: WorkflowExecution) -> Result<(), OnboardingError> {
        let started_at = execution.state_entered_at;
        let handler = self.handlers.initiate.clone();
        match self.invoke_bounded(&handler, &execution, None).await {
            StepRun::Report(StepReport::Success { output }) => {
                let record =
                    StepResult::success(StepName::Initiate, output.clone(), started_at, self.clock.now());
                self.enter_provision(execution, record, output).await
            }
            other => {
                let failure = unsuccessful(StepName::Initiate, started_at, other);
                self.fail(&execution, failure).await.map(|_| ())
            }
        }
    }

    /// Issue the callback token, commit RUNNING_PROVISION with it, then hand
    /// off to Provision.
    async fn enter_provision(
        &self,
        current: WorkflowExecution,
        initiate_record: StepResult,
        initiate_output: Value,
    ) -> Result<(), OnboardingError> {
        let now = self.clock.now();
        let token = CallbackToken::issue(
            current.id.clone(),
            now,
            self.window(WorkflowState::RunningProvision),
        );
        self.stores.callbacks.issue_token(&token).await?;
        debug!(execution_id = %current.id, expires_at = %token.expires_at, "Callback token issued");

        let mut suspended = self.successor(&current, StepOutcome::Success, now)?;
        suspended.history.push(initiate_record);
        suspended.output = merge_output(&current.output, initiate_output);
        suspended.active_callback_token_id = Some(token.id.clone());
        if !self.commit(&current, &suspended).await? {
            self.stores.callbacks.invalidate_token(&token.id).await?;
            return Ok(());
        }

        self.publisher
            .publish_progress(&OnboardingEvent::Initiated {
                tenant_id: suspended.tenant_id.clone(),
                execution_id: suspended.id.clone(),
            })
            .await;

        let started_at = suspended.state_entered_at;
        let handler = self.handlers.provision.clone();
        match self
            .invoke_bounded(&handler, &suspended, Some(token.id.clone()))
            .await
        {
            StepRun::Report(StepReport::Pending { token: pending }) if pending == token.id => {
                info!(
                    execution_id = %suspended.id,
                    tenant_id = %suspended.tenant_id,
                    deadline = %token.expires_at,
                    "Execution suspended awaiting provisioning callback"
                );
                Ok(())
            }
            StepRun::Report(StepReport::Pending { .. }) => {
                let failure = StepFailure {
                    step: StepName::Provision,
                    reason: FailureReason::StepFailure,
                    detail: error_detail(
                        "CallbackTokenMismatch",
                        "provision suspended on a token it was not given",
                    ),
                    started_at,
                };
                self.fail(&suspended, failure).await.map(|_| ())
            }
            StepRun::Report(StepReport::Success { output }) => {
                // Completed synchronously: redeem our own token like a callback.
                match self
                    .stores
                    .callbacks
                    .consume_token(&token.id, self.clock.now())
                    .await?
                {
                    TokenRedemption::Consumed(_) => {
                        self.complete_provision(suspended, output).await.map(|_| ())
                    }
                    _ => {
                        debug!(execution_id = %suspended.id, "Token already settled elsewhere");
                        Ok(())
                    }
                }
            }
            other => {
                let failure = unsuccessful(StepName::Provision, started_at, other);
                self.fail(&suspended, failure).await.map(|_| ())
            }
        }
    }

    /// RUNNING_PROVISION -> RUNNING_COMPLETE carrying the callback data, then
    /// run Complete. `false` when another writer moved the execution first.
    async fn complete_provision(
        &self,
        current: WorkflowExecution,
        data: Value,
    ) -> Result<bool, OnboardingError> {
        let now = self.clock.now();
        let mut next = self.successor(&current, StepOutcome::Success, now)?;
        next.history.push(StepResult::success(
            StepName::Provision,
            data.clone(),
            current.state_entered_at,
            now,
        ));
        next.output = merge_output(&current.output, json!({ "provisioning": data }));
        next.active_callback_token_id = None;
        if !self.commit(&current, &next).await? {
            return Ok(false);
        }

        self.publisher
            .publish_progress(&OnboardingEvent::Provisioned {
                tenant_id: next.tenant_id.clone(),
                execution_id: next.id.clone(),
            })
            .await;

        self.run_complete(next).await?;
        Ok(true)
    }

    async fn run_complete(&self, execution: WorkflowExecution) -> Result<(), OnboardingError> {
        let started_at = execution.state_entered_at;
        let handler = self.handlers.complete.clone();
        match self.invoke_bounded(&handler, &execution, None).await {
            StepRun::Report(StepReport::Success { output }) => {
                let now = self.clock.now();
                let mut done = self.successor(&execution, StepOutcome::Success, now)?;
                done.history.push(StepResult::success(
                    StepName::Complete,
                    output.clone(),
                    started_at,
                    now,
                ));
                done.output = merge_output(&execution.output, output);
                if self.commit(&execution, &done).await? {
                    self.finish_succeeded(&done).await?;
                }
                Ok(())
            }
            other => {
                let failure = unsuccessful(StepName::Complete, started_at, other);
                self.fail(&execution, failure).await.map(|_| ())
            }
        }
    }

    async fn finish_succeeded(&self, execution: &WorkflowExecution) -> Result<(), OnboardingError> {
        let activated = self
            .stores
            .tenants
            .compare_and_swap(&execution.tenant_id, TenantStatus::Pending, TenantStatus::Active)
            .await
            .inspect_err(|e| {
                error!(
                    execution_id = %execution.id,
                    error = %e,
                    "Execution SUCCEEDED but tenant could not be activated"
                )
            })?;
        if !activated {
            warn!(tenant_id = %execution.tenant_id, "Tenant was not PENDING; ACTIVE status not applied");
        }

        self.publisher
            .publish(&OnboardingEvent::Succeeded {
                tenant_id: execution.tenant_id.clone(),
                execution_id: execution.id.clone(),
            })
            .await
            .inspect_err(|e| {
                error!(execution_id = %execution.id, error = %e, "Success event not published")
            })?;

        info!(
            execution_id = %execution.id,
            tenant_id = %execution.tenant_id,
            version = execution.version,
            "Onboarding succeeded"
        );
        Ok(())
    }

    /// Catch-all: route `current` to FAILED.
    ///
    /// Returns `false` without side effects on the execution when it is already
    /// terminal or another writer won the version.
    async fn fail(
        &self,
        current: &WorkflowExecution,
        failure: StepFailure,
    ) -> Result<bool, OnboardingError> {
        if current.is_terminal() {
            debug!(execution_id = %current.id, "Already terminal; failure ignored");
            return Ok(false);
        }

        self.error_handler.invalidate_tokens(current).await?;

        let now = self.clock.now();
        let mut failed = self.successor(current, StepOutcome::Failure, now)?;
        failed.history.push(self.error_handler.failure_record(&failure, now));
        failed.failure_reason = Some(failure.reason);
        failed.active_callback_token_id = None;
        if !self.commit(current, &failed).await? {
            info!(execution_id = %current.id, "Failure not applied; execution already moved on");
            return Ok(false);
        }

        warn!(
            execution_id = %failed.id,
            tenant_id = %failed.tenant_id,
            step = %failure.step,
            reason = %failure.reason,
            "Onboarding failed"
        );

        self.error_handler
            .mark_tenant_failed(&failed)
            .await
            .inspect_err(|e| {
                error!(
                    execution_id = %failed.id,
                    error = %e,
                    "Execution FAILED but tenant status could not be updated"
                )
            })?;

        self.publisher
            .publish(&OnboardingEvent::Failed {
                tenant_id: failed.tenant_id.clone(),
                execution_id: failed.id.clone(),
                reason: failure.reason.to_string(),
            })
            .await
            .inspect_err(|e| {
                error!(execution_id = %failed.id, error = %e, "Failure event not published")
            })?;
        Ok(true)
    }

    /// Call a step handler, bounded by what is left of the state's deadline.
    async fn invoke_bounded(
        &self,
        handler: &Arc<dyn StepHandler>,
        execution: &WorkflowExecution,
        callback_token: Option<TokenId>,
    ) -> StepRun {
        let remaining = self
            .deadline(execution)
            .and_then(|deadline| (deadline - self.clock.now()).to_std().ok())
            .unwrap_or_default();
        if remaining.is_zero() {
            return StepRun::TimedOut;
        }

        let input = StepInput {
            execution_id: execution.id.clone(),
            tenant_id: execution.tenant_id.clone(),
            request: execution.request.clone(),
            previous_output: execution.output.clone(),
            callback_token,
        };
        debug!(execution_id = %execution.id, step = %handler.step(), "Invoking step handler");

        match tokio::time::timeout(remaining, handler.invoke(input)).await {
            Ok(report) => StepRun::Report(report),
            Err(_) => {
                warn!(execution_id = %execution.id, step = %handler.step(), "Step exceeded its deadline");
                StepRun::TimedOut
            }
        }
    }

    fn successor(
        &self,
        current: &WorkflowExecution,
        outcome: StepOutcome,
        now: DateTime<Utc>,
    ) -> Result<WorkflowExecution, OnboardingError> {
        let mut next = current.clone();
        next.state = next_state(current.state, outcome)?;
        next.version = current.version + 1;
        next.updated_at = now;
        next.state_entered_at = now;
        Ok(next)
    }

    /// Version CAS; the only place executions are written after creation.
    async fn commit(
        &self,
        current: &WorkflowExecution,
        next: &WorkflowExecution,
    ) -> Result<bool, OnboardingError> {
        debug_assert!(
            is_forward(current.state, next.state),
            "backward transition {} -> {}",
            current.state,
            next.state
        );
        let won = self
            .stores
            .executions
            .swap_execution(current.version, next)
            .await?;
        if won {
            info!(
                execution_id = %next.id,
                tenant_id = %next.tenant_id,
                from = %current.state,
                to = %next.state,
                version = next.version,
                "Execution transitioned"
            );
        } else {
            info!(
                execution_id = %next.id,
                from = %current.state,
                attempted = %next.state,
                expected_version = current.version,
                "Lost transition race"
            );
        }
        Ok(won)
    }

    fn window(&self, state: WorkflowState) -> Duration {
        self.timeouts.for_state(state).unwrap_or_else(Duration::zero)
    }
}

/// Map a non-success step run onto the failure routed to the catch-all.
fn unsuccessful(step: StepName, started_at: DateTime<Utc>, run: StepRun) -> StepFailure {
    let (reason, detail) = match run {
        StepRun::TimedOut => (
            FailureReason::StepTimeout,
            json!({ "error": FailureReason::StepTimeout }),
        ),
        StepRun::Report(StepReport::Failure { error_detail }) => {
            (FailureReason::StepFailure, error_detail)
        }
        StepRun::Report(StepReport::Pending { .. }) => (
            FailureReason::StepFailure,
            error_detail("UnexpectedSuspension", format!("{step} cannot suspend")),
        ),
        StepRun::Report(StepReport::Success { .. }) => (
            FailureReason::StepFailure,
            error_detail("UnexpectedSuccess", format!("{step} success was not applied")),
        ),
    };
    StepFailure {
        step,
        reason,
        detail,
        started_at,
    }
}

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

use super::errors::OnboardingError;

/// Unique identifier of one workflow execution
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(pub String);

impl ExecutionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ExecutionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Opaque single-use credential handed to the external provisioner
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenId(pub String);

impl TokenId {
    /// Mint a fresh token from 128 random bits.
    pub fn generate() -> Self {
        let bytes: [u8; 16] = rand::random();
        let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
        Self(format!("cbt_{hex}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TokenId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowState {
    Initiated,
    RunningInitiate,
    RunningProvision,
    RunningComplete,
    Succeeded,
    Failed,
}

impl WorkflowState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkflowState::Succeeded | WorkflowState::Failed)
    }

    /// Step whose deadline governs this state. `Initiated` is transient and is
    /// charged to Initiate.
    pub fn step(&self) -> Option<StepName> {
        match self {
            WorkflowState::Initiated | WorkflowState::RunningInitiate => Some(StepName::Initiate),
            WorkflowState::RunningProvision => Some(StepName::Provision),
            WorkflowState::RunningComplete => Some(StepName::Complete),
            WorkflowState::Succeeded | WorkflowState::Failed => None,
        }
    }

    /// Position in the step sequence; `Failed` sorts last.
    pub fn ordinal(&self) -> u8 {
        match self {
            WorkflowState::Initiated => 0,
            WorkflowState::RunningInitiate => 1,
            WorkflowState::RunningProvision => 2,
            WorkflowState::RunningComplete => 3,
            WorkflowState::Succeeded => 4,
            WorkflowState::Failed => 5,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowState::Initiated => "INITIATED",
            WorkflowState::RunningInitiate => "RUNNING_INITIATE",
            WorkflowState::RunningProvision => "RUNNING_PROVISION",
            WorkflowState::RunningComplete => "RUNNING_COMPLETE",
            WorkflowState::Succeeded => "SUCCEEDED",
            WorkflowState::Failed => "FAILED",
        }
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StepName {
    Initiate,
    Provision,
    Complete,
    ErrorHandler,
}

impl fmt::Display for StepName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StepName::Initiate => "Initiate",
            StepName::Provision => "Provision",
            StepName::Complete => "Complete",
            StepName::ErrorHandler => "ErrorHandler",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepOutcome {
    Success,
    Failure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    StepTimeout,
    StepFailure,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::StepTimeout => "StepTimeout",
            FailureReason::StepFailure => "StepFailure",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One appended entry of an execution's audit history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub step_name: StepName,
    pub outcome: StepOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<Value>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl StepResult {
    pub fn success(
        step_name: StepName,
        payload: Value,
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            step_name,
            outcome: StepOutcome::Success,
            payload: Some(payload),
            error_detail: None,
            started_at,
            completed_at,
        }
    }

    pub fn failure(
        step_name: StepName,
        error_detail: Value,
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            step_name,
            outcome: StepOutcome::Failure,
            payload: None,
            error_detail: Some(error_detail),
            started_at,
            completed_at,
        }
    }
}

/// Inbound onboarding request, as carried in the request event's detail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnboardingRequest {
    pub tenant_id: String,
    pub tenant_name: String,
    #[serde(default = "empty_object")]
    pub config: Value,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

impl OnboardingRequest {
    pub fn new(tenant_id: impl Into<String>, tenant_name: impl Into<String>, config: Value) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            tenant_name: tenant_name.into(),
            config,
        }
    }

    /// Parse and validate a raw event detail.
    pub fn from_detail(detail: &Value) -> Result<Self, OnboardingError> {
        let request: OnboardingRequest =
            serde_json::from_value(detail.clone()).map_err(|e| OnboardingError::Validation {
                reason: format!("malformed onboarding request: {e}"),
            })?;
        request.validate()?;
        Ok(request)
    }

    pub fn validate(&self) -> Result<(), OnboardingError> {
        if self.tenant_id.trim().is_empty() {
            return Err(OnboardingError::Validation {
                reason: "tenantId must not be empty".to_string(),
            });
        }
        if self.tenant_name.trim().is_empty() {
            return Err(OnboardingError::Validation {
                reason: "tenantName must not be empty".to_string(),
            });
        }
        if !self.config.is_object() {
            return Err(OnboardingError::Validation {
                reason: "config must be a JSON object".to_string(),
            });
        }
        Ok(())
    }
}

/// Persisted record of one run of the onboarding state machine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowExecution {
    pub id: ExecutionId,
    pub tenant_id: String,
    pub state: WorkflowState,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Start of the current state's deadline window
    pub state_entered_at: DateTime<Utc>,
    pub request: OnboardingRequest,
    /// Accumulated output of completed steps
    pub output: Value,
    pub history: Vec<StepResult>,
    pub active_callback_token_id: Option<TokenId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<FailureReason>,
}

impl WorkflowExecution {
    pub fn new(request: OnboardingRequest, now: DateTime<Utc>) -> Self {
        Self {
            id: ExecutionId::generate(),
            tenant_id: request.tenant_id.clone(),
            state: WorkflowState::Initiated,
            version: 0,
            created_at: now,
            updated_at: now,
            state_entered_at: now,
            request,
            output: empty_object(),
            history: Vec::new(),
            active_callback_token_id: None,
            failure_reason: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TokenStatus {
    Outstanding,
    Consumed,
    /// Withdrawn by timeout, failure routing, or expiry
    Invalidated,
}

/// Persisted continuation: the only thing that exists while Provision is suspended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackToken {
    pub id: TokenId,
    pub execution_id: ExecutionId,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: TokenStatus,
}

impl CallbackToken {
    pub fn issue(execution_id: ExecutionId, issued_at: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            id: TokenId::generate(),
            execution_id,
            issued_at,
            expires_at: issued_at + ttl,
            status: TokenStatus::Outstanding,
        }
    }

    pub fn consumed(&self) -> bool {
        self.status == TokenStatus::Consumed
    }

    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        self.status == TokenStatus::Outstanding && now < self.expires_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TenantStatus {
    Pending,
    Active,
    Failed,
    Deprovisioned,
}

impl fmt::Display for TenantStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TenantStatus::Pending => "PENDING",
            TenantStatus::Active => "ACTIVE",
            TenantStatus::Failed => "FAILED",
            TenantStatus::Deprovisioned => "DEPROVISIONED",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantRecord {
    pub tenant_id: String,
    pub name: String,
    pub config: Value,
    pub status: TenantStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResumeRejection {
    TokenInvalid,
    AlreadyConsumed,
}

/// Answer returned to the external actor calling `resume`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeResponse {
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<ResumeRejection>,
}

impl ResumeResponse {
    pub fn accepted() -> Self {
        Self {
            accepted: true,
            reason: None,
        }
    }

    pub fn rejected(reason: ResumeRejection) -> Self {
        Self {
            accepted: false,
            reason: Some(reason),
        }
    }
}

/// Shallow-merge `addition` into the accumulated step output.
pub fn merge_output(accumulated: &Value, addition: Value) -> Value {
    match (accumulated, addition) {
        (Value::Object(base), Value::Object(extra)) => {
            let mut merged = base.clone();
            merged.extend(extra);
            Value::Object(merged)
        }
        (Value::Object(base), other) if other.is_null() => Value::Object(base.clone()),
        (_, other) => other,
    }
}

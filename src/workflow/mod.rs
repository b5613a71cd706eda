pub mod errors;
pub mod orchestrator;
pub mod state_machine;
pub mod types;
pub mod watchdog;

pub use errors::{OnboardingError, TransitionError};
pub use orchestrator::Orchestrator;
pub use state_machine::next_state;
pub use types::{
    CallbackToken, ExecutionId, FailureReason, OnboardingRequest, ResumeRejection,
    ResumeResponse, StepName, StepOutcome, StepResult, TenantRecord, TenantStatus, TokenId,
    TokenStatus, WorkflowExecution, WorkflowState,
};
pub use watchdog::TimeoutWatchdog;

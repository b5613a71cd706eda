use thiserror::Error;

use super::types::{ExecutionId, StepOutcome, WorkflowState};
use crate::events::PublishError;
use crate::store::StoreError;

/// Errors surfaced across the orchestrator boundary
///
/// Step failures and timeouts never appear here: they are absorbed by the
/// catch-all and only show up as a FAILED execution plus an
/// `onboarding-failed` event.
#[derive(Debug, Error)]
pub enum OnboardingError {
    #[error("Validation error: {reason}")]
    Validation { reason: String },

    #[error("Execution not found: {0}")]
    ExecutionNotFound(ExecutionId),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Event publish error: {0}")]
    Publish(#[from] PublishError),

    #[error("Transition error: {0}")]
    Transition(#[from] TransitionError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("{state} is terminal; {outcome:?} cannot be applied")]
    Terminal {
        state: WorkflowState,
        outcome: StepOutcome,
    },
}

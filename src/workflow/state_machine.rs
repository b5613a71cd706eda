// Onboarding state machine
// The next state is a pure function of (current state, step outcome).

use super::errors::TransitionError;
use super::types::{StepOutcome, WorkflowState};

/// Compute the successor of `state` given the outcome of the step running in it.
///
/// `Initiated` is the transient creation state: `Success` there means the
/// execution was accepted and Initiate may run. Every non-terminal state sends
/// `Failure` straight to `Failed`.
pub fn next_state(
    state: WorkflowState,
    outcome: StepOutcome,
) -> Result<WorkflowState, TransitionError> {
    use StepOutcome::*;
    use WorkflowState::*;

    let next = match (state, outcome) {
        (Initiated, Success) => RunningInitiate,
        (RunningInitiate, Success) => RunningProvision,
        (RunningProvision, Success) => RunningComplete,
        (RunningComplete, Success) => Succeeded,
        (Initiated | RunningInitiate | RunningProvision | RunningComplete, Failure) => Failed,
        (Succeeded | Failed, outcome) => {
            return Err(TransitionError::Terminal { state, outcome });
        }
    };
    Ok(next)
}

/// True when `to` is a legal successor of `from`: the next state in sequence or `Failed`.
pub fn is_forward(from: WorkflowState, to: WorkflowState) -> bool {
    !from.is_terminal() && (to == WorkflowState::Failed || to.ordinal() == from.ordinal() + 1)
}

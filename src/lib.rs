// Tenant onboarding control plane
// Workflow orchestrator, step handlers, persistence ports and event adapters.

pub mod app;
pub mod clock;
pub mod config;
pub mod events;
pub mod handlers;
pub mod shutdown;
pub mod store;
pub mod telemetry;
pub mod workflow;

// Re-export key types for easy access
pub use app::OnboardingRuntime;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::OnboardingConfig;
pub use events::{
    CompletionPublisher, EventBus, EventEnvelope, EventRouter, LocalEventBus, OnboardingEvent,
};
pub use handlers::{StepHandler, StepHandlers, StepInput, StepReport};
pub use shutdown::ShutdownCoordinator;
pub use store::{FileStore, MemoryStore, StoreError, Stores};
pub use telemetry::{create_workflow_span, generate_correlation_id, init_telemetry};
pub use workflow::{
    ExecutionId, OnboardingError, OnboardingRequest, Orchestrator, ResumeResponse, StepOutcome,
    TimeoutWatchdog, TokenId, WorkflowExecution, WorkflowState,
};

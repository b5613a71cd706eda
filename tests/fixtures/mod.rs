// Shared test harness for workflow integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::{json, Value};
use std::sync::Arc;

use tenant_onboarding::clock::ManualClock;
use tenant_onboarding::config::{EventBusConfig, TimeoutConfig};
use tenant_onboarding::events::{CompletionPublisher, LocalEventBus};
use tenant_onboarding::handlers::{
    EventBusProvisioner, StepHandler, StepHandlers, StepInput, StepReport,
};
use tenant_onboarding::store::{MemoryStore, Stores};
use tenant_onboarding::workflow::{
    ExecutionId, OnboardingRequest, Orchestrator, StepName, TokenId, WorkflowExecution,
};
use tenant_onboarding::EventEnvelope;

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
}

pub fn request(tenant_id: &str) -> OnboardingRequest {
    OnboardingRequest::new(tenant_id, format!("{tenant_id} Corp"), json!({ "tier": "premium" }))
}

pub fn provision_window() -> Duration {
    Duration::seconds(TimeoutConfig::default().provision_secs as i64)
}

/// One orchestrator over in-memory stores, a local bus and a manual clock
pub struct Harness {
    pub stores: Stores,
    pub bus: Arc<LocalEventBus>,
    pub clock: ManualClock,
    pub handlers: StepHandlers,
    pub orchestrator: Orchestrator,
    pub event_config: EventBusConfig,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_handlers(|handlers| handlers)
    }

    pub fn with_handlers(customize: impl FnOnce(StepHandlers) -> StepHandlers) -> Self {
        Self::over(Stores::shared(Arc::new(MemoryStore::new())), customize)
    }

    /// Build on existing stores, e.g. a file store reopened after a restart.
    pub fn over(stores: Stores, customize: impl FnOnce(StepHandlers) -> StepHandlers) -> Self {
        let event_config = EventBusConfig::default();
        let bus = Arc::new(LocalEventBus::new("test-bus"));
        let clock = ManualClock::new(t0());

        let provisioner = Arc::new(EventBusProvisioner::new(bus.clone(), event_config.clone()));
        let handlers = customize(StepHandlers::standard(stores.tenants.clone(), provisioner));
        let orchestrator = Orchestrator::new(
            stores.clone(),
            handlers.clone(),
            CompletionPublisher::new(bus.clone(), event_config.clone()),
            TimeoutConfig::default(),
        )
        .with_clock(Arc::new(clock.clone()));

        Self {
            stores,
            bus,
            clock,
            handlers,
            orchestrator,
            event_config,
        }
    }

    /// A second instance sharing stores and bus but reading its own clock.
    pub fn sibling(&self, clock: ManualClock) -> Orchestrator {
        Orchestrator::new(
            self.stores.clone(),
            self.handlers.clone(),
            CompletionPublisher::new(self.bus.clone(), self.event_config.clone()),
            TimeoutConfig::default(),
        )
        .with_clock(Arc::new(clock))
    }

    pub async fn execution(&self, id: &ExecutionId) -> WorkflowExecution {
        self.orchestrator.execution(id).await.unwrap()
    }

    /// Token the execution is currently suspended on.
    pub async fn token(&self, id: &ExecutionId) -> TokenId {
        self.execution(id)
            .await
            .active_callback_token_id
            .expect("execution should be suspended on a token")
    }

    pub async fn events(&self, detail_type: &str) -> Vec<EventEnvelope> {
        self.bus.published_of(detail_type).await
    }
}

/// Step that always reports the same thing
pub struct ScriptedStep {
    step: StepName,
    report: StepReport,
}

impl ScriptedStep {
    pub fn succeeding(step: StepName, output: Value) -> Arc<Self> {
        Arc::new(Self {
            step,
            report: StepReport::Success { output },
        })
    }

    pub fn failing(step: StepName, error: &str) -> Arc<Self> {
        Arc::new(Self {
            step,
            report: StepReport::Failure {
                error_detail: json!({ "error": error }),
            },
        })
    }
}

#[async_trait]
impl StepHandler for ScriptedStep {
    fn step(&self) -> StepName {
        self.step
    }

    async fn invoke(&self, _input: StepInput) -> StepReport {
        self.report.clone()
    }
}

/// Step that never returns
pub struct HangingStep(pub StepName);

#[async_trait]
impl StepHandler for HangingStep {
    fn step(&self) -> StepName {
        self.0
    }

    async fn invoke(&self, _input: StepInput) -> StepReport {
        std::future::pending().await
    }
}

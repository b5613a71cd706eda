use anyhow::Result;
use std::sync::Arc;
use tracing::info;

use crate::config::{OnboardingConfig, StorageBackend};
use crate::events::{CompletionPublisher, EventRouter, LocalEventBus};
use crate::handlers::{EventBusProvisioner, StepHandlers};
use crate::store::{FileStore, MemoryStore, Stores};
use crate::workflow::{Orchestrator, TimeoutWatchdog};

/// Everything a process needs, wired from configuration
pub struct OnboardingRuntime {
    pub config: OnboardingConfig,
    pub bus: Arc<LocalEventBus>,
    pub orchestrator: Arc<Orchestrator>,
}

impl OnboardingRuntime {
    pub fn from_config(config: OnboardingConfig) -> Result<Self> {
        let stores = match config.storage.backend {
            StorageBackend::Memory => Stores::shared(Arc::new(MemoryStore::new())),
            StorageBackend::File => {
                std::fs::create_dir_all(&config.storage.directory)?;
                Stores::shared(Arc::new(FileStore::new(&config.storage)))
            }
        };
        info!(
            backend = ?config.storage.backend,
            directory = %config.storage.directory.display(),
            "Storage configured"
        );

        let bus = Arc::new(LocalEventBus::new(config.event_bus.name.clone()));
        let provisioner = Arc::new(EventBusProvisioner::new(
            bus.clone(),
            config.event_bus.clone(),
        ));
        let handlers = StepHandlers::standard(stores.tenants.clone(), provisioner);
        let publisher = CompletionPublisher::new(bus.clone(), config.event_bus.clone());
        let orchestrator = Orchestrator::new(stores, handlers, publisher, config.timeouts.clone());

        Ok(Self {
            config,
            bus,
            orchestrator: Arc::new(orchestrator),
        })
    }

    pub fn router(&self) -> EventRouter {
        EventRouter::new(self.orchestrator.clone(), &self.config.event_bus)
    }

    pub fn watchdog(&self) -> TimeoutWatchdog {
        TimeoutWatchdog::new(self.orchestrator.clone(), &self.config.watchdog)
    }
}

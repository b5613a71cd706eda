use anyhow::Result;
use chrono::Duration;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::workflow::types::WorkflowState;

const CONFIG_FILE: &str = "tenant-onboarding.toml";
const ENV_PREFIX: &str = "ONBOARDING";
// chrono::Duration holds milliseconds in an i64
const MAX_TIMEOUT_SECS: u64 = (i64::MAX / 1000) as u64;

/// Main configuration structure for the onboarding control plane
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct OnboardingConfig {
    /// Event bus identity and routing
    pub event_bus: EventBusConfig,
    /// Persistence backend and table identity
    pub storage: StorageConfig,
    /// Per-step deadlines
    pub timeouts: TimeoutConfig,
    /// Timeout firer settings
    pub watchdog: WatchdogConfig,
    /// Logging settings
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EventBusConfig {
    /// Name of the bus events are put on
    pub name: String,
    /// Source stamped on control-plane events
    pub control_plane_source: String,
    /// Detail type of inbound onboarding requests
    pub onboarding_detail_type: String,
    /// Source of events coming back from the application plane
    pub application_plane_source: String,
    /// Detail type of the outbound provisioning request
    pub provisioning_request_detail_type: String,
    /// Detail type of the inbound provisioning result
    pub provisioning_result_detail_type: String,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            name: "saas-control-plane".to_string(),
            control_plane_source: "saas.control-plane".to_string(),
            onboarding_detail_type: "onboarding-request".to_string(),
            application_plane_source: "saas.application-plane".to_string(),
            provisioning_request_detail_type: "provisioning-requested".to_string(),
            provisioning_result_detail_type: "provisioning-result".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    File,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Root directory of the file backend
    pub directory: PathBuf,
    pub executions_table: String,
    pub tokens_table: String,
    pub tenants_table: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::File,
            directory: PathBuf::from(".tenant-onboarding"),
            executions_table: "executions".to_string(),
            tokens_table: "tokens".to_string(),
            tenants_table: "tenants".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TimeoutConfig {
    pub initiate_secs: u64,
    pub provision_secs: u64,
    pub complete_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            initiate_secs: 300,   // 5 minutes
            provision_secs: 7200, // 2 hours
            complete_secs: 1800,  // 30 minutes
        }
    }
}

impl TimeoutConfig {
    /// Deadline window for a running state; `None` for terminal states.
    pub fn for_state(&self, state: WorkflowState) -> Option<Duration> {
        let secs = match state {
            WorkflowState::Initiated | WorkflowState::RunningInitiate => self.initiate_secs,
            WorkflowState::RunningProvision => self.provision_secs,
            WorkflowState::RunningComplete => self.complete_secs,
            WorkflowState::Succeeded | WorkflowState::Failed => return None,
        };
        let capped = secs.min(MAX_TIMEOUT_SECS) as i64;
        Some(Duration::seconds(capped))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WatchdogConfig {
    /// How often persisted deadlines are swept
    pub sweep_interval_secs: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Default filter when RUST_LOG is unset
    pub log_level: String,
    /// JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json: true,
        }
    }
}

impl OnboardingConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Default values
    /// 2. tenant-onboarding.toml in the working directory
    /// 3. Environment variables (ONBOARDING_SECTION__FIELD)
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Same as [`load`](Self::load) but with an explicit config file.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);

        match path {
            Some(path) => {
                builder = builder.add_source(File::from(path).required(true));
            }
            None if Path::new(CONFIG_FILE).exists() => {
                builder = builder.add_source(File::with_name(CONFIG_FILE));
            }
            None => {}
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        Ok(config.try_deserialize()?)
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_content = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }

    /// Load .env file if it exists
    pub fn load_env_file() -> Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
            tracing::info!("Loaded environment variables from .env file");
        }
        Ok(())
    }
}

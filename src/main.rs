use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

use tenant_onboarding::events::{EventRouter, ListenerOutcome};
use tenant_onboarding::shutdown::wait_for_shutdown;
use tenant_onboarding::workflow::{ExecutionId, OnboardingRequest, StepOutcome, TokenId};
use tenant_onboarding::{
    init_telemetry, EventEnvelope, OnboardingConfig, OnboardingRuntime, ShutdownCoordinator,
};

#[derive(Parser)]
#[command(name = "tenant-onboarding")]
#[command(about = "Tenant onboarding workflow orchestrator")]
#[command(long_about = "Sequences tenant onboarding through Initiate, Provision and Complete, \
                       suspends durably while the application plane provisions, and routes every \
                       failure or timeout through a single error path.")]
struct Cli {
    /// Configuration file (defaults to tenant-onboarding.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Read events as JSON lines on stdin, print published events on stdout, run the timeout watchdog
    Serve,
    /// Start onboarding a tenant
    Start {
        #[arg(long)]
        tenant_id: String,
        #[arg(long)]
        tenant_name: String,
        /// Tenant configuration as a JSON object
        #[arg(long, default_value = "{}")]
        tenant_config: String,
    },
    /// Deliver a provisioning result for a suspended execution
    Resume {
        #[arg(long)]
        token: String,
        #[arg(long, value_enum)]
        outcome: OutcomeArg,
        /// Callback data as a JSON object
        #[arg(long, default_value = "{}")]
        data: String,
    },
    /// Show an execution, or every execution and the record of a tenant
    Status {
        #[arg(long, conflicts_with = "tenant_id", required_unless_present = "tenant_id")]
        execution_id: Option<String>,
        #[arg(long)]
        tenant_id: Option<String>,
    },
    /// Fail every execution whose step deadline has passed
    Sweep,
}

#[derive(Clone, Copy, ValueEnum)]
enum OutcomeArg {
    Success,
    Failure,
}

impl From<OutcomeArg> for StepOutcome {
    fn from(value: OutcomeArg) -> Self {
        match value {
            OutcomeArg::Success => StepOutcome::Success,
            OutcomeArg::Failure => StepOutcome::Failure,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    OnboardingConfig::load_env_file()?;
    let config = OnboardingConfig::load_from(cli.config.as_deref())?;
    init_telemetry(&config.observability)?;

    let runtime = OnboardingRuntime::from_config(config)?;
    tokio::runtime::Runtime::new()?.block_on(async {
        match cli.command {
            Commands::Serve => serve_command(&runtime).await,
            Commands::Start {
                tenant_id,
                tenant_name,
                tenant_config,
            } => start_command(&runtime, tenant_id, tenant_name, &tenant_config).await,
            Commands::Resume {
                token,
                outcome,
                data,
            } => resume_command(&runtime, token, outcome.into(), &data).await,
            Commands::Status {
                execution_id,
                tenant_id,
            } => status_command(&runtime, execution_id, tenant_id).await,
            Commands::Sweep => sweep_command(&runtime).await,
        }
    })
}

fn parse_json_object(raw: &str, what: &str) -> Result<Value> {
    let value: Value =
        serde_json::from_str(raw).with_context(|| format!("{what} is not valid JSON"))?;
    anyhow::ensure!(value.is_object(), "{what} must be a JSON object");
    Ok(value)
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn start_command(
    runtime: &OnboardingRuntime,
    tenant_id: String,
    tenant_name: String,
    tenant_config: &str,
) -> Result<()> {
    let config = parse_json_object(tenant_config, "--tenant-config")?;
    let request = OnboardingRequest::new(tenant_id, tenant_name, config);
    let execution_id = runtime.orchestrator.start(request).await?;
    let execution = runtime.orchestrator.execution(&execution_id).await?;

    print_json(&json!({
        "execution": execution,
        "events": runtime.bus.published().await,
    }))
}

async fn resume_command(
    runtime: &OnboardingRuntime,
    token: String,
    outcome: StepOutcome,
    data: &str,
) -> Result<()> {
    let data = parse_json_object(data, "--data")?;
    let response = runtime
        .orchestrator
        .resume(&TokenId(token), outcome, data)
        .await?;

    print_json(&json!({
        "response": response,
        "events": runtime.bus.published().await,
    }))
}

async fn status_command(
    runtime: &OnboardingRuntime,
    execution_id: Option<String>,
    tenant_id: Option<String>,
) -> Result<()> {
    if let Some(id) = execution_id {
        let execution = runtime.orchestrator.execution(&ExecutionId(id)).await?;
        let deadline = runtime.orchestrator.deadline(&execution);
        return print_json(&json!({ "execution": execution, "deadline": deadline }));
    }

    let tenant_id = tenant_id.context("either --execution-id or --tenant-id is required")?;
    let executions = runtime.orchestrator.executions_for_tenant(&tenant_id).await?;
    let tenant = runtime.orchestrator.tenant(&tenant_id).await?;
    print_json(&json!({ "tenant": tenant, "executions": executions }))
}

async fn sweep_command(runtime: &OnboardingRuntime) -> Result<()> {
    let expired = runtime.orchestrator.expire_overdue().await?;
    print_json(&json!({
        "expired": expired,
        "events": runtime.bus.published().await,
    }))
}

async fn serve_command(runtime: &OnboardingRuntime) -> Result<()> {
    let shutdown = ShutdownCoordinator::new();
    let watchdog = tokio::spawn(runtime.watchdog().run(shutdown.subscribe()));
    let signal_listener = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = shutdown.wait_for_signal().await {
                warn!(error = %e, "Signal handler unavailable");
            }
        })
    };

    let router = runtime.router();
    let mut published = runtime.bus.subscribe();
    let mut stop = shutdown.subscribe();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    info!("Serving; reading events from stdin");

    loop {
        tokio::select! {
            biased;
            event = published.recv() => match event {
                Ok(event) => println!("{}", serde_json::to_string(&event)?),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Dropped published events"),
                Err(RecvError::Closed) => break,
            },
            line = lines.next_line() => match line? {
                Some(line) => dispatch_line(&router, &line).await,
                None => break,
            },
            _ = wait_for_shutdown(&mut stop) => break,
        }
    }

    while let Ok(event) = published.try_recv() {
        println!("{}", serde_json::to_string(&event)?);
    }

    shutdown.trigger();
    signal_listener.abort();
    watchdog.await?;
    info!("Serve loop stopped");
    Ok(())
}

async fn dispatch_line(router: &EventRouter, line: &str) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    let envelope: EventEnvelope = match serde_json::from_str(line) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(error = %e, "Skipping malformed event line");
            return;
        }
    };

    match router.dispatch(&envelope).await {
        Ok(ListenerOutcome::Ignored) => {
            info!(source = %envelope.source, detail_type = %envelope.detail_type, "No listener for event")
        }
        Ok(outcome) => info!(event_id = %envelope.id, ?outcome, "Event handled"),
        Err(e) => error!(event_id = %envelope.id, error = %e, "Event handling failed"),
    }
}

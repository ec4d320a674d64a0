//! # AgentBus Echo Worker
//!
//! Runs a single worker agent that echoes task payloads back as results, against
//! the configured transport, until Ctrl-C or a `shutdown_request` system event
//! addressed to it. Useful for smoke-testing a deployment end to end.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use serde_json::Value;
use tracing::{error, info};

use agentbus_core::config::{AgentBusConfig, ConfigLoader, TransportProvider};
use agentbus_core::logging::init_structured_logging;
use agentbus_core::messaging::{InMemoryLogStream, LogStreamTransport, MessageBus, Payload};
use agentbus_core::worker::{TaskOutcome, TaskProcessor, WorkerAgent, WorkerCapability};
use agentbus_core::{AgentBusError, AgentBusResult};

#[derive(Parser)]
#[command(name = "agentbus-worker")]
#[command(about = "Run an echo worker agent on the agent bus")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Environment name selecting `<config-dir>/<environment>.toml`
    #[arg(short, long, env = "AGENTBUS_ENV")]
    environment: Option<String>,

    /// Configuration directory (default: config/agentbus)
    #[arg(short, long, env = "AGENTBUS_CONFIG_DIR")]
    config_dir: Option<String>,

    /// Fixed worker id instead of a generated one
    #[arg(long)]
    worker_id: Option<String>,

    /// Artificial processing delay per task, in milliseconds
    #[arg(long, default_value_t = 0)]
    delay_ms: u64,
}

struct EchoProcessor {
    delay: Duration,
}

#[async_trait]
impl TaskProcessor for EchoProcessor {
    fn worker_type(&self) -> &str {
        "echo"
    }

    fn capabilities(&self) -> Vec<WorkerCapability> {
        vec![WorkerCapability::new("echo", "Returns the task payload unchanged")
            .with_input_types(["object"])
            .with_output_types(["object"])]
    }

    async fn process_task(&self, payload: &Payload) -> anyhow::Result<TaskOutcome> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(TaskOutcome::success(Value::Object(payload.clone())))
    }
}

async fn build_transport(config: &AgentBusConfig) -> AgentBusResult<Arc<dyn LogStreamTransport>> {
    match config.transport.provider {
        TransportProvider::InMemory => Ok(Arc::new(InMemoryLogStream::new())),
        #[cfg(feature = "redis-streams")]
        TransportProvider::Redis => {
            let url = config.transport.redis_url.as_deref().ok_or_else(|| {
                AgentBusError::Internal("redis provider selected without redis_url".to_string())
            })?;
            let transport = agentbus_core::messaging::RedisLogStream::connect(url).await?;
            Ok(Arc::new(transport))
        }
        #[cfg(not(feature = "redis-streams"))]
        TransportProvider::Redis => Err(AgentBusError::Internal(
            "built without the redis-streams feature".to_string(),
        )),
    }
}

async fn run(cli: Cli) -> AgentBusResult<()> {
    let mut loader = ConfigLoader::new();
    if let Some(environment) = cli.environment {
        loader = loader.with_environment(environment);
    }
    if let Some(dir) = cli.config_dir {
        loader = loader.with_config_dir(dir);
    }
    let config = loader.load()?;

    let transport = build_transport(&config).await?;
    let bus = Arc::new(MessageBus::new(transport, config.bus.clone()));
    let processor = Arc::new(EchoProcessor {
        delay: Duration::from_millis(cli.delay_ms),
    });

    let worker = match cli.worker_id {
        Some(id) => WorkerAgent::with_id(id, processor, bus.clone(), config.worker.clone()),
        None => WorkerAgent::new(processor, bus.clone(), config.worker.clone()),
    };
    worker.start().await?;
    info!(worker_id = %worker.worker_id(), "Echo worker running, press Ctrl-C to stop");

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!(error = %e, "Failed to listen for Ctrl-C");
            }
            info!(worker_id = %worker.worker_id(), "Stopping worker");
            worker.stop().await?;
        }
        _ = worker.wait_stopped() => {
            info!(worker_id = %worker.worker_id(), "Worker stopped on request");
        }
    }
    bus.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() {
    init_structured_logging();
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        error!(error = %e, "Worker exited with error");
        std::process::exit(1);
    }
}

//! CLI command definitions and dispatch.

pub mod enqueue;
pub mod failed;
pub mod status;

use std::time::Duration;

use clap::{Parser, Subcommand};

use crate::output::OutputFormat;
use relay_core::config::AppConfig;
use relay_core::error::AppError;
use relay_queue::{ConnectionEvents, QueueManager};

/// How long the CLI waits for the broker before giving up.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Inbound relay queue inspection and manual enqueue
#[derive(Debug, Parser)]
#[command(name = "relay-cli", version, about, long_about = None)]
pub struct Cli {
    /// Configuration environment (`config/{env}.toml`)
    #[arg(long, env = "RELAY_ENV", default_value = "development")]
    pub config_env: String,

    /// Output format
    #[arg(short, long, value_enum, default_value = "table")]
    pub format: OutputFormat,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level commands
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Build a job and add it to the queue
    Enqueue(enqueue::EnqueueArgs),
    /// Show queue counts and worker settings
    Status,
    /// List the most recent failed jobs
    Failed(failed::FailedArgs),
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(&self) -> Result<(), AppError> {
        let config = AppConfig::load(&self.config_env)?;
        match &self.command {
            Commands::Enqueue(args) => enqueue::execute(args, &config).await,
            Commands::Status => status::execute(&config, self.format).await,
            Commands::Failed(args) => failed::execute(args, &config, self.format).await,
        }
    }
}

/// Helper: connect to the configured broker.
pub async fn connect_queue(config: &AppConfig) -> Result<QueueManager, AppError> {
    if config.broker.provider == "memory" {
        crate::output::print_warning(
            "broker.provider is 'memory': this process sees its own empty queue",
        );
    }

    tokio::time::timeout(
        CONNECT_TIMEOUT,
        QueueManager::new(config, &ConnectionEvents::new()),
    )
    .await
    .map_err(|_| {
        AppError::broker(format!(
            "Broker not reachable within {}s",
            CONNECT_TIMEOUT.as_secs()
        ))
    })?
}

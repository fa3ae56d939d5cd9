//! Queue status command.

use serde::Serialize;

use crate::output::{self, OutputFormat};
use relay_core::config::AppConfig;
use relay_core::error::AppError;
use relay_core::traits::broker::QueueBroker;
use relay_core::types::queue::QueueCounts;

/// Status report printed by the command.
#[derive(Debug, Serialize)]
struct StatusReport<'a> {
    queue: &'a str,
    provider: &'a str,
    healthy: bool,
    counts: QueueCounts,
    concurrency: usize,
    completed_retention: usize,
    failed_retention: usize,
}

/// Execute the status command
pub async fn execute(config: &AppConfig, format: OutputFormat) -> Result<(), AppError> {
    let queue = super::connect_queue(config).await?;
    let report = StatusReport {
        queue: queue.queue_name(),
        provider: &config.broker.provider,
        healthy: queue.health_check().await?,
        counts: queue.counts().await?,
        concurrency: config.worker.concurrency,
        completed_retention: config.retention.completed_count,
        failed_retention: config.retention.failed_count,
    };

    match format {
        OutputFormat::Json => output::print_json(&report),
        OutputFormat::Table => {
            println!("Queue Status:");
            output::print_kv("Queue", report.queue);
            output::print_kv("Provider", report.provider);
            output::print_kv("Healthy", &report.healthy.to_string());
            output::print_kv("Waiting", &report.counts.waiting.to_string());
            output::print_kv("Active", &report.counts.active.to_string());
            output::print_kv("Delayed", &report.counts.delayed.to_string());
            output::print_kv("Completed", &report.counts.completed.to_string());
            output::print_kv("Failed", &report.counts.failed.to_string());
            output::print_kv("Concurrency", &report.concurrency.to_string());
            output::print_kv(
                "Retention",
                &format!(
                    "{} completed / {} failed",
                    report.completed_retention, report.failed_retention
                ),
            );
        }
    }
    Ok(())
}

//! Failed job listing.

use clap::Args;
use serde::Serialize;
use tabled::Tabled;

use crate::output::{self, OutputFormat};
use relay_core::config::AppConfig;
use relay_core::error::AppError;
use relay_core::traits::broker::QueueBroker;
use relay_core::types::queue::{JobRecord, RetentionSet};

/// Width of the reason column in table output.
const REASON_WIDTH: usize = 60;

/// Arguments for the failed command
#[derive(Debug, Args)]
pub struct FailedArgs {
    /// Number of records to show, newest first
    #[arg(long, default_value_t = 20)]
    pub limit: usize,
}

/// One row of the listing.
#[derive(Debug, Serialize, Tabled)]
struct FailedRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Company")]
    company: String,
    #[tabled(rename = "Attempts")]
    attempts: u32,
    #[tabled(rename = "Finished")]
    finished: String,
    #[tabled(rename = "Reason")]
    reason: String,
}

impl FailedRow {
    fn from_record(record: JobRecord, format: OutputFormat) -> Self {
        let reason = record.failed_reason.unwrap_or_default();
        Self {
            company: record
                .payload
                .get("company_id")
                .and_then(|v| v.as_str())
                .unwrap_or("-")
                .to_string(),
            attempts: record.attempts_made,
            finished: record
                .finished_at
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "-".to_string()),
            reason: match format {
                OutputFormat::Table => output::truncate(&reason, REASON_WIDTH),
                OutputFormat::Json => reason,
            },
            id: record.id,
        }
    }
}

/// Execute the failed command
pub async fn execute(
    args: &FailedArgs,
    config: &AppConfig,
    format: OutputFormat,
) -> Result<(), AppError> {
    let queue = super::connect_queue(config).await?;
    let rows: Vec<FailedRow> = queue
        .records(RetentionSet::Failed, args.limit)
        .await?
        .into_iter()
        .map(|record| FailedRow::from_record(record, format))
        .collect();

    output::print_list(&rows, format);
    Ok(())
}

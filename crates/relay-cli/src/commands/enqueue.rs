//! Manual enqueue of an inbound-message job.

use clap::Args;
use serde_json::{Map, Value};

use crate::output;
use relay_core::config::AppConfig;
use relay_core::error::AppError;
use relay_core::traits::broker::QueueBroker;
use relay_core::types::job::{DEFAULT_CHANNEL, Job};
use relay_core::types::queue::{BackoffPolicy, JobOptions};

/// Base delay of the producer's exponential backoff, in milliseconds.
const PRODUCER_BACKOFF_MS: u64 = 2000;

/// Arguments for the enqueue command
#[derive(Debug, Args)]
pub struct EnqueueArgs {
    /// Tenant identifier
    #[arg(long)]
    pub company: String,
    /// Conversation identifier
    #[arg(long)]
    pub conversation: String,
    /// Message text
    #[arg(long)]
    pub message: String,
    /// Job id (random when omitted); also the broker id
    #[arg(long)]
    pub job_id: Option<String>,
    /// Origin channel
    #[arg(long, default_value = DEFAULT_CHANNEL)]
    pub channel: String,
    /// Metadata as a JSON object
    #[arg(long)]
    pub metadata: Option<String>,
    /// Total attempts allowed
    #[arg(long, default_value_t = 3)]
    pub attempts: u32,
}

/// Execute the enqueue command
pub async fn execute(args: &EnqueueArgs, config: &AppConfig) -> Result<(), AppError> {
    let (job, options) = build_job(args)?;
    let queue = super::connect_queue(config).await?;

    match queue.enqueue_job(&job, &options).await? {
        Some(id) => output::print_success(&format!(
            "Enqueued job '{id}' on '{}'",
            queue.queue_name()
        )),
        None => output::print_warning(&format!(
            "A job with id '{}' already exists; nothing enqueued",
            job.job_id
        )),
    }
    Ok(())
}

/// Build the job and its retry options from the arguments.
fn build_job(args: &EnqueueArgs) -> Result<(Job, JobOptions), AppError> {
    if args.attempts == 0 {
        return Err(AppError::validation("--attempts must be at least 1"));
    }

    let job_id = args
        .job_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let mut job = Job::new(job_id, &args.company, &args.conversation, &args.message)
        .with_channel(&args.channel);

    if let Some(raw) = &args.metadata {
        job = job.with_metadata(parse_metadata(raw)?);
    }

    let options = JobOptions {
        attempts: args.attempts,
        backoff: Some(BackoffPolicy::Exponential {
            delay: PRODUCER_BACKOFF_MS,
        }),
    };
    Ok((job, options))
}

fn parse_metadata(raw: &str) -> Result<Map<String, Value>, AppError> {
    match serde_json::from_str(raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(AppError::validation("--metadata must be a JSON object")),
        Err(e) => Err(AppError::validation(format!("Invalid --metadata JSON: {e}"))),
    }
}

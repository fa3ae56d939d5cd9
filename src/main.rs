//! Inbound relay worker entry point.
//!
//! Consumes the inbound-message queue and forwards each job to the
//! downstream processing service.

use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::{EnvFilter, fmt};

use relay_core::config::AppConfig;
use relay_core::error::AppError;
use relay_core::traits::broker::QueueBroker;
use relay_queue::{ConnectionEvents, QueueManager, spawn_event_logger};
use relay_worker::{
    DrainState, HttpProcessor, JobDispatcher, LifecycleController, shutdown_signal,
};

#[tokio::main]
async fn main() {
    let env = std::env::var("RELAY_ENV").unwrap_or_else(|_| "development".to_string());
    let config = match AppConfig::load(&env) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    init_logging(&config);

    match run(config).await {
        Ok(state) if state.is_clean() => {}
        Ok(state) => {
            tracing::warn!(state = %state, "Worker exited with jobs still in flight");
            std::process::exit(1);
        }
        Err(e) => {
            tracing::error!(error = %e, "Worker error");
            std::process::exit(1);
        }
    }
}

/// Initialize the tracing subscriber.
fn init_logging(config: &AppConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match config.logging.format.as_str() {
        "json" => {
            fmt()
                .json()
                .with_env_filter(filter)
                .with_target(true)
                .with_thread_ids(true)
                .init();
        }
        _ => {
            fmt()
                .pretty()
                .with_env_filter(filter)
                .with_target(true)
                .init();
        }
    }
}

/// Main worker run function.
async fn run(config: AppConfig) -> Result<DrainState, AppError> {
    tracing::info!("Starting inbound relay v{}", env!("CARGO_PKG_VERSION"));

    // ── Step 1: Validate before touching the broker ──────────────
    config.validate()?;
    let processor = HttpProcessor::from_config(&config.downstream)?;
    tracing::info!(
        endpoint = %processor.endpoint(),
        timeout_ms = config.downstream.timeout_ms,
        "Downstream configured"
    );

    // ── Step 2: Broker connection ────────────────────────────────
    let events = ConnectionEvents::new();
    let event_logger = spawn_event_logger(events.subscribe());
    let queue = QueueManager::new(&config, &events).await?;

    // ── Step 3: Dispatcher ───────────────────────────────────────
    let broker: Arc<dyn QueueBroker> = Arc::new(queue.clone());
    let dispatcher = JobDispatcher::new(broker, Arc::new(processor), config.worker.clone())
        .with_stalled_interval(Duration::from_secs(config.broker.stalled_interval_seconds));

    let mut controller =
        LifecycleController::new(dispatcher.in_flight(), config.worker.drain_timeout());

    let health_monitor = queue.spawn_health_monitor(
        Duration::from_secs(config.broker.health_check_interval_seconds),
        controller.subscribe(),
    );

    let cancel = controller.subscribe();
    let dispatcher_handle = tokio::spawn(async move { dispatcher.run(cancel).await });

    tracing::info!(
        queue = %config.worker.queue,
        concurrency = config.worker.concurrency,
        "Worker ready"
    );

    // ── Step 4: Wait for a signal, then drain ────────────────────
    shutdown_signal().await;
    tracing::info!("Shutdown signal received, starting graceful shutdown...");

    let state = controller.drain(dispatcher_handle, shutdown_signal()).await;

    if let Some(handle) = health_monitor {
        let _ = tokio::time::timeout(Duration::from_secs(1), handle).await;
    }
    drop(queue);
    drop(events);
    event_logger.abort();

    tracing::info!(state = %state, "Inbound relay shut down");
    Ok(state)
}

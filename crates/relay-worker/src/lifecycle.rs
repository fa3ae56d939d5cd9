//! Termination signals and the drain state machine.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::drain::{DrainState, InFlightTracker};

/// Resolve on Ctrl+C or SIGTERM.
///
/// A handler that cannot be installed is logged and never fires, so the
/// other signal still works.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Drives `Running → Draining → {Drained | TimedOut | Forced}`.
#[derive(Debug)]
pub struct LifecycleController {
    cancel: watch::Sender<bool>,
    in_flight: InFlightTracker,
    drain_timeout: Duration,
    state: DrainState,
}

impl LifecycleController {
    /// Create a controller in the running state.
    pub fn new(in_flight: InFlightTracker, drain_timeout: Duration) -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            cancel,
            in_flight,
            drain_timeout,
            state: DrainState::Running,
        }
    }

    /// Cancellation flag for the dispatcher and background tasks.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.cancel.subscribe()
    }

    /// Current state.
    pub fn state(&self) -> DrainState {
        self.state
    }

    /// Stop fetching, then wait for the dispatcher loop and every in-flight
    /// delivery, up to the drain timeout. `second_signal` cuts the wait
    /// short.
    pub async fn drain<F>(&mut self, dispatcher: JoinHandle<()>, second_signal: F) -> DrainState
    where
        F: Future<Output = ()>,
    {
        self.state = DrainState::Draining;
        info!(
            in_flight = self.in_flight.count(),
            timeout_seconds = self.drain_timeout.as_secs(),
            "Draining in-flight jobs"
        );
        self.cancel.send_replace(true);

        let in_flight = self.in_flight.clone();
        let settled = async move {
            if let Err(e) = dispatcher.await {
                error!(error = %e, "Dispatcher task ended abnormally");
            }
            in_flight.wait_idle().await;
        };

        let state = tokio::select! {
            result = tokio::time::timeout(self.drain_timeout, settled) => match result {
                Ok(()) => DrainState::Drained,
                Err(_) => DrainState::TimedOut {
                    remaining: self.in_flight.count(),
                },
            },
            _ = second_signal => DrainState::Forced {
                remaining: self.in_flight.count(),
            },
        };

        match state {
            DrainState::Drained => info!("All in-flight jobs finished"),
            DrainState::TimedOut { remaining } => warn!(
                remaining,
                "Drain timed out; remaining jobs will be redelivered after their lock expires"
            ),
            DrainState::Forced { remaining } => warn!(
                remaining,
                "Second shutdown signal received, exiting immediately"
            ),
            DrainState::Running | DrainState::Draining => {}
        }

        self.state = state;
        state
    }
}

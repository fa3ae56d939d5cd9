//! In-flight accounting for graceful shutdown.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Notify;

#[derive(Debug, Default)]
struct Inner {
    count: AtomicUsize,
    idle: Notify,
}

/// Counts deliveries between fetch and broker report, and wakes waiters
/// when the count returns to zero.
#[derive(Debug, Clone, Default)]
pub struct InFlightTracker {
    inner: Arc<Inner>,
}

impl InFlightTracker {
    /// Create a tracker with nothing in flight.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one delivery; it is released when the guard drops.
    pub fn begin(&self) -> InFlightGuard {
        self.inner.count.fetch_add(1, Ordering::AcqRel);
        InFlightGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Deliveries currently in flight.
    pub fn count(&self) -> usize {
        self.inner.count.load(Ordering::Acquire)
    }

    /// Resolve once nothing is in flight.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.count() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Releases its delivery from the tracker on drop.
#[derive(Debug)]
pub struct InFlightGuard {
    inner: Arc<Inner>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.inner.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}

/// Shutdown state of the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainState {
    /// Fetching and processing.
    Running,
    /// No new fetches; waiting for in-flight deliveries.
    Draining,
    /// Every in-flight delivery was reported.
    Drained,
    /// The grace period elapsed with deliveries still in flight.
    TimedOut {
        /// Deliveries abandoned to stalled recovery.
        remaining: usize,
    },
    /// A second signal cut the drain short.
    Forced {
        /// Deliveries abandoned to stalled recovery.
        remaining: usize,
    },
}

impl DrainState {
    /// Whether every delivery was reported before exit.
    pub fn is_clean(&self) -> bool {
        matches!(self, Self::Drained)
    }
}

impl fmt::Display for DrainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Draining => write!(f, "draining"),
            Self::Drained => write!(f, "drained"),
            Self::TimedOut { .. } => write!(f, "timed_out"),
            Self::Forced { .. } => write!(f, "forced"),
        }
    }
}

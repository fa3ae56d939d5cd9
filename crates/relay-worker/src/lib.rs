//! Job handling for the inbound relay.
//!
//! This crate provides:
//! - The structural validator for dequeued payloads
//! - The HTTP processor that forwards jobs downstream
//! - The dispatch loop with its concurrency ceiling and stalled sweeps
//! - In-flight tracking and the drain state machine used on shutdown

pub mod dispatcher;
pub mod drain;
pub mod error;
pub mod lifecycle;
pub mod processor;
pub mod validator;

pub use dispatcher::JobDispatcher;
pub use drain::{DrainState, InFlightTracker};
pub use error::JobFailure;
pub use lifecycle::{LifecycleController, shutdown_signal};
pub use processor::{HttpProcessor, JobProcessor};

//! # relay-queue
//!
//! Queue broker implementations for the inbound relay. Supports two modes:
//!
//! - **redis**: Redis-backed queue with a BullMQ-compatible key layout, so
//!   BullMQ producers can keep enqueueing unchanged
//! - **memory**: In-process queue for local runs and tests
//!
//! The backend is selected at runtime based on configuration.

pub mod keys;
pub mod lifecycle;
#[cfg(feature = "memory")]
pub mod memory;
pub mod provider;
#[cfg(feature = "redis-backend")]
pub mod redis;

pub use lifecycle::{ConnectionEvent, ConnectionEvents, spawn_event_logger};
pub use provider::QueueManager;

//! # relay-core
//!
//! Core crate for the inbound relay. Contains the configuration schema,
//! the job and queue types, the [`QueueBroker`](traits::QueueBroker) trait
//! implemented by the queue backends, and the unified error system.
//!
//! This crate has **no** internal dependencies on other relay crates.

pub mod config;
pub mod error;
pub mod result;
pub mod traits;
pub mod types;

pub use error::AppError;
pub use result::AppResult;

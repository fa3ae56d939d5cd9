//! Core traits defined in `relay-core` and implemented by other crates.

pub mod broker;

pub use broker::QueueBroker;

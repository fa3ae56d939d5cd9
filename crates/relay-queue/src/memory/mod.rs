//! In-memory queue broker.

pub mod store;

pub use store::MemoryQueue;

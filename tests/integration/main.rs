//! End-to-end tests: in-memory broker, real dispatcher, mocked downstream.

mod config_test;
mod helpers;
mod relay_test;

pub mod aggregator;
pub mod analyzer;
pub mod config;
pub mod dead_letter;
pub mod delegator;
pub mod engine;
pub mod errors;
pub mod metrics;
pub mod models;
pub mod platform;
pub mod registry;
pub mod server;
pub mod tasks;
pub mod telemetry;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;
pub mod webhook;

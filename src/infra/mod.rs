//! Infrastructure - configuration, metrics, retry driver, embedded broker

pub mod broker;
pub mod config;
pub mod metrics;
pub mod retry;

pub use config::{Config, DoorConfig, LockMode};
pub use metrics::Metrics;
pub use retry::{execute_with_retry, RetryOutcome, RetryPolicy};

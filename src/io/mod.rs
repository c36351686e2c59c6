//! I/O adapters - MQTT ingest, lock actuation, notifications, HTTP surface

pub mod http;
pub mod lock;
pub mod mqtt;
pub mod notify;

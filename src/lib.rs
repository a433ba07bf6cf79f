//! Minimal publish/subscribe relay with a managed auto-reconnecting client

pub mod broker;
pub mod client;
pub mod config;
pub mod protocol;
pub mod telemetry;

//! # taskline
//!
//! Task lifecycle event pipeline on Postgres.
//!
//! Consumes partitioned task events (pgmq), validates them, persists task
//! state with atomic conditional transitions, publishes crawl requests for
//! new tasks, and carries W3C trace context end to end (OpenTelemetry).

pub mod bus;
pub mod config;
pub mod db;
pub mod error;
pub mod model;
pub mod pipeline;
pub mod store;
pub mod telemetry;
pub mod validation;

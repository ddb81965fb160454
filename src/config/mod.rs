//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing or
//! malformed. The database URL is wrapped in `secrecy::SecretString` so it
//! never reaches a log line.

pub mod secrets;

use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};
use secrets::SecretString;

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    pub max_connections: u32,
    pub pipeline: PipelineConfig,
}

/// Settings consumed by the message pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Topic carrying task lifecycle events.
    pub inbound_topic: String,
    /// Topic receiving crawl requests for newly created tasks.
    pub outbound_topic: String,
    /// Partitions per topic. One worker runs per inbound partition.
    pub partitions: u32,
    /// Upper bound on a single store call.
    pub store_timeout: Duration,
    /// Upper bound on a single downstream publish.
    pub publish_timeout: Duration,
    /// How long a read message stays invisible before redelivery.
    pub visibility_timeout: Duration,
    /// Sleep between reads of an empty partition.
    pub poll_interval: Duration,
    /// Pause before re-reading a message after an infrastructure error.
    pub retry_backoff: Duration,
    /// `source` header on downstream messages.
    pub source: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            inbound_topic: "task_events".to_string(),
            outbound_topic: "crawl_requests".to_string(),
            partitions: 4,
            store_timeout: Duration::from_secs(5),
            publish_timeout: Duration::from_secs(5),
            visibility_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(500),
            retry_backoff: Duration::from_secs(1),
            source: "taskline".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let defaults = PipelineConfig::default();
        let partitions = parsed_var("TASKLINE_PARTITIONS", defaults.partitions)?;
        if partitions == 0 {
            return Err(Error::Config(
                "TASKLINE_PARTITIONS must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            max_connections: parsed_var("TASKLINE_MAX_CONNECTIONS", 10)?,
            pipeline: PipelineConfig {
                inbound_topic: std::env::var("TASKLINE_INBOUND_TOPIC")
                    .unwrap_or(defaults.inbound_topic),
                outbound_topic: std::env::var("TASKLINE_OUTBOUND_TOPIC")
                    .unwrap_or(defaults.outbound_topic),
                partitions,
                store_timeout: millis_var("TASKLINE_STORE_TIMEOUT_MS", defaults.store_timeout)?,
                publish_timeout: millis_var(
                    "TASKLINE_PUBLISH_TIMEOUT_MS",
                    defaults.publish_timeout,
                )?,
                visibility_timeout: Duration::from_secs(parsed_var(
                    "TASKLINE_VISIBILITY_TIMEOUT_SECS",
                    defaults.visibility_timeout.as_secs(),
                )?),
                poll_interval: millis_var("TASKLINE_POLL_INTERVAL_MS", defaults.poll_interval)?,
                retry_backoff: millis_var("TASKLINE_RETRY_BACKOFF_MS", defaults.retry_backoff)?,
                source: std::env::var("TASKLINE_SOURCE").unwrap_or(defaults.source),
            },
        })
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn parsed_var<T: FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Err(_) => Ok(default),
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("{name} has an invalid value: {raw:?}"))),
    }
}

fn millis_var(name: &str, default: Duration) -> Result<Duration> {
    let ms = parsed_var(name, u64::try_from(default.as_millis()).unwrap_or(u64::MAX))?;
    Ok(Duration::from_millis(ms))
}

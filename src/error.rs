//! Error types for taskline.
//!
//! Validation and business-rule failures (`Validation`, `NotFound`,
//! `Conflict`) are terminal outcomes for a message. Everything else is
//! infrastructure and leads to redelivery.

use std::time::Duration;

use thiserror::Error;

use crate::model::{TaskId, TaskStatus};
use crate::validation::ValidationError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Validation(#[from] ValidationError),

    #[error("task not found: {0}")]
    NotFound(TaskId),

    #[error("task {id} is already {status}")]
    Conflict { id: TaskId, status: TaskStatus },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("message bus error: {0}")]
    Bus(String),

    #[error("{operation} timed out after {}ms", timeout.as_millis())]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether the message that produced this error should be redelivered.
    ///
    /// Only infrastructure failures are retriable; a rejected, unknown, or
    /// duplicate message will never succeed on replay.
    pub fn is_retriable(&self) -> bool {
        !matches!(
            self,
            Error::Validation(_) | Error::NotFound(_) | Error::Conflict { .. } | Error::Config(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

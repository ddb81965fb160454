//! Core data model.
//!
//! A task is a request to crawl `base_url` on behalf of `user_email`. It is
//! created once in `NEW` and resolved at most once, into `COMPLETED` or
//! `ERROR`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// A task as persisted by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Store-assigned identifier. Never supplied by the caller.
    pub id: TaskId,

    pub user_email: String,
    pub user_query: String,
    pub base_url: String,

    /// Current lifecycle status.
    pub status: TaskStatus,

    /// Set only on transition to `COMPLETED`.
    pub crawl_result: Option<String>,

    /// Set only on transition to `ERROR`.
    pub error_message: Option<String>,

    /// Timestamp carried by the inbound message, not processing time.
    pub received_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// The immutable business payload of this task.
    pub fn payload(&self) -> TaskPayload {
        TaskPayload {
            user_email: self.user_email.clone(),
            user_query: self.user_query.clone(),
            base_url: self.base_url.clone(),
        }
    }
}

/// Newtype for task IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s).map(TaskId)
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Created, waiting for its crawl outcome. The only initial state.
    New,
    /// Crawl finished successfully. Terminal.
    Completed,
    /// Crawl failed. Terminal.
    Error,
}

impl TaskStatus {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!((self, to), (New, Completed) | (New, Error))
    }

    /// Is this a terminal state?
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::New => "NEW",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Error => "ERROR",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "NEW" => Ok(TaskStatus::New),
            "COMPLETED" => Ok(TaskStatus::Completed),
            "ERROR" => Ok(TaskStatus::Error),
            other => Err(Error::Other(format!("unknown task status: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// The business payload shared by every inbound message and the downstream
/// crawl request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPayload {
    pub user_email: String,
    pub user_query: String,
    pub base_url: String,
}

/// Everything the store needs to create a task. Carries no id; the store assigns it.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub payload: TaskPayload,
    pub received_at: DateTime<Utc>,
}

/// The resolution applied to a `NEW` task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskTransition {
    Complete { crawl_result: String },
    Fail { error_message: String },
}

impl TaskTransition {
    /// The status this transition moves the task into.
    pub fn target(&self) -> TaskStatus {
        match self {
            TaskTransition::Complete { .. } => TaskStatus::Completed,
            TaskTransition::Fail { .. } => TaskStatus::Error,
        }
    }

    pub fn crawl_result(&self) -> Option<&str> {
        match self {
            TaskTransition::Complete { crawl_result } => Some(crawl_result),
            TaskTransition::Fail { .. } => None,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            TaskTransition::Fail { error_message } => Some(error_message),
            TaskTransition::Complete { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_new_can_transition() {
        use TaskStatus::*;
        assert!(New.can_transition_to(Completed));
        assert!(New.can_transition_to(Error));
        assert!(!New.can_transition_to(New));
        for terminal in [Completed, Error] {
            assert!(terminal.is_terminal());
            for to in [New, Completed, Error] {
                assert!(!terminal.can_transition_to(to));
            }
        }
    }

    #[test]
    fn status_parses_wire_names() {
        assert_eq!("COMPLETED".parse::<TaskStatus>().unwrap(), TaskStatus::Completed);
        assert!("completed".parse::<TaskStatus>().is_err());
        assert_eq!(serde_json::to_string(&TaskStatus::New).unwrap(), "\"NEW\"");
    }
}

//! Task persistence port.
//!
//! The store is the only component that assigns task ids and the only one
//! that mutates a task. Postgres implements it on [`crate::db::Db`];
//! [`memory::InMemoryTaskStore`] implements it in-process.

pub mod memory;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{NewTask, Task, TaskId, TaskStatus, TaskTransition};

pub use memory::InMemoryTaskStore;

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a `NEW` task. The id is generated by the store atomically with
    /// the insert.
    async fn create(&self, new: &NewTask) -> Result<Task>;

    /// Apply `transition` only if the task is currently in `from`, as one
    /// atomic conditional update.
    ///
    /// Returns `None` when no row matched: the task either does not exist
    /// or is no longer in `from`. Callers must not read-then-write to tell
    /// these apart before the update.
    async fn transition(
        &self,
        id: TaskId,
        from: TaskStatus,
        transition: &TaskTransition,
    ) -> Result<Option<Task>>;

    /// Look up a task by id.
    async fn get(&self, id: TaskId) -> Result<Option<Task>>;
}

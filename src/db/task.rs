//! Task persistence on Postgres.
//!
//! Ids come from the column default (`gen_random_uuid()`) and are returned
//! by the same INSERT. Transitions are a single conditional UPDATE with
//! `RETURNING`, so concurrent duplicates for one task serialize on the row
//! and exactly one of them matches.

use async_trait::async_trait;
use opentelemetry::KeyValue;
use uuid::Uuid;

use crate::error::Result;
use crate::model::{NewTask, Task, TaskId, TaskStatus, TaskTransition};
use crate::store::TaskStore;
use crate::telemetry::metrics;

const TASK_COLUMNS: &str = "id, user_email, user_query, base_url, status, crawl_result, error_message, received_at, created_at, updated_at";

#[async_trait]
impl TaskStore for super::Db {
    async fn create(&self, new: &NewTask) -> Result<Task> {
        let row: TaskRow = sqlx::query_as(&format!(
            "INSERT INTO tasks (user_email, user_query, base_url, status, received_at)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING {TASK_COLUMNS}"
        ))
        .bind(&new.payload.user_email)
        .bind(&new.payload.user_query)
        .bind(&new.payload.base_url)
        .bind(TaskStatus::New.as_str())
        .bind(new.received_at)
        .fetch_one(self.pool())
        .await?;

        metrics::tasks_created().add(1, &[]);
        row.try_into_task()
    }

    async fn transition(
        &self,
        id: TaskId,
        from: TaskStatus,
        transition: &TaskTransition,
    ) -> Result<Option<Task>> {
        let to = transition.target();
        let row: Option<TaskRow> = sqlx::query_as(&format!(
            "UPDATE tasks
             SET status = $1,
                 crawl_result = COALESCE($2, crawl_result),
                 error_message = COALESCE($3, error_message),
                 updated_at = now()
             WHERE id = $4 AND status = $5
             RETURNING {TASK_COLUMNS}"
        ))
        .bind(to.as_str())
        .bind(transition.crawl_result())
        .bind(transition.error_message())
        .bind(id.0)
        .bind(from.as_str())
        .fetch_optional(self.pool())
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        metrics::task_transitions().add(
            1,
            &[
                KeyValue::new("from", from.as_str()),
                KeyValue::new("to", to.as_str()),
            ],
        );

        row.try_into_task().map(Some)
    }

    async fn get(&self, id: TaskId) -> Result<Option<Task>> {
        let row: Option<TaskRow> =
            sqlx::query_as(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1"))
                .bind(id.0)
                .fetch_optional(self.pool())
                .await?;

        row.map(TaskRow::try_into_task).transpose()
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct TaskRow {
    id: Uuid,
    user_email: String,
    user_query: String,
    base_url: String,
    status: String,
    crawl_result: Option<String>,
    error_message: Option<String>,
    received_at: chrono::DateTime<chrono::Utc>,
    created_at: chrono::DateTime<chrono::Utc>,
    updated_at: chrono::DateTime<chrono::Utc>,
}

impl TaskRow {
    fn try_into_task(self) -> Result<Task> {
        Ok(Task {
            id: TaskId(self.id),
            user_email: self.user_email,
            user_query: self.user_query,
            base_url: self.base_url,
            status: self.status.parse()?,
            crawl_result: self.crawl_result,
            error_message: self.error_message,
            received_at: self.received_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

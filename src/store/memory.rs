//! In-memory implementation of the `TaskStore` port.
//!
//! Thread-safe and linearizable: each operation holds the map lock for its
//! whole duration, so a conditional transition behaves like a single
//! `UPDATE ... WHERE status = $from`. Intended for tests and embedding.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::{NewTask, Task, TaskId, TaskStatus, TaskTransition};
use crate::store::TaskStore;

#[derive(Debug, Default, Clone)]
pub struct InMemoryTaskStore {
    tasks: Arc<Mutex<HashMap<TaskId, Task>>>,
    unavailable: Arc<AtomicBool>,
    latency_ms: Arc<AtomicU64>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a database outage: every call fails with a pool timeout.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        let ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.latency_ms.store(ms, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().map(|guard| guard.len()).unwrap_or(0)
    }

    pub fn ids(&self) -> Vec<TaskId> {
        self.tasks
            .lock()
            .map(|guard| guard.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn enter(&self) -> Result<()> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::Database(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<TaskId, Task>>> {
        self.tasks
            .lock()
            .map_err(|e| Error::Other(format!("task store lock poisoned: {e}")))
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn create(&self, new: &NewTask) -> Result<Task> {
        self.enter().await?;
        let mut tasks = self.lock()?;

        let mut id = TaskId(Uuid::new_v4());
        while tasks.contains_key(&id) {
            id = TaskId(Uuid::new_v4());
        }

        let now = Utc::now();
        let task = Task {
            id,
            user_email: new.payload.user_email.clone(),
            user_query: new.payload.user_query.clone(),
            base_url: new.payload.base_url.clone(),
            status: TaskStatus::New,
            crawl_result: None,
            error_message: None,
            received_at: new.received_at,
            created_at: now,
            updated_at: now,
        };
        tasks.insert(id, task.clone());
        Ok(task)
    }

    async fn transition(
        &self,
        id: TaskId,
        from: TaskStatus,
        transition: &TaskTransition,
    ) -> Result<Option<Task>> {
        self.enter().await?;
        let mut tasks = self.lock()?;

        let Some(task) = tasks.get_mut(&id).filter(|t| t.status == from) else {
            return Ok(None);
        };

        task.status = transition.target();
        if let Some(result) = transition.crawl_result() {
            task.crawl_result = Some(result.to_string());
        }
        if let Some(message) = transition.error_message() {
            task.error_message = Some(message.to_string());
        }
        task.updated_at = Utc::now();
        Ok(Some(task.clone()))
    }

    async fn get(&self, id: TaskId) -> Result<Option<Task>> {
        self.enter().await?;
        Ok(self.lock()?.get(&id).cloned())
    }
}

//! Task lifecycle service: create tasks, resolve them, and kick off the
//! downstream crawl request for new ones.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use tracing::{Instrument, debug, info};

use crate::error::{Error, Result};
use crate::model::{NewTask, Task, TaskId, TaskPayload, TaskStatus, TaskTransition};
use crate::pipeline::publisher::DownstreamPublisher;
use crate::store::TaskStore;
use crate::telemetry::metrics;
use crate::telemetry::propagation::TraceContext;
use crate::telemetry::task::{record_state_transition, record_task_id, start_task_span};

#[derive(Clone)]
pub struct TaskService {
    store: Arc<dyn TaskStore>,
    publisher: DownstreamPublisher,
    store_timeout: Duration,
}

impl TaskService {
    pub fn new(
        store: Arc<dyn TaskStore>,
        publisher: DownstreamPublisher,
        store_timeout: Duration,
    ) -> Self {
        Self {
            store,
            publisher,
            store_timeout,
        }
    }

    /// Persist a `NEW` task, then publish its crawl request.
    ///
    /// A failed publish is logged by the publisher and does not fail the
    /// call: the task stays `NEW` and its request must be replayed.
    pub async fn create_task(
        &self,
        payload: TaskPayload,
        received_at: DateTime<Utc>,
        trace: &TraceContext,
    ) -> Result<Task> {
        let span = start_task_span("create", None);
        async {
            let new = NewTask {
                payload,
                received_at,
            };
            let task = self.timed("store.create", self.store.create(&new)).await?;
            record_task_id(&tracing::Span::current(), task.id);
            info!(task_id = %task.id, "task created");

            let published = self
                .publisher
                .publish(task.id, &new.payload, trace)
                .await;
            debug!(task_id = %task.id, published = published.success, "crawl request attempted");
            Ok::<_, Error>(task)
        }
        .instrument(span)
        .await
    }

    /// Move a `NEW` task to `COMPLETED`.
    pub async fn complete_task(
        &self,
        task_id: TaskId,
        crawl_result: String,
        trace: &TraceContext,
    ) -> Result<Task> {
        self.resolve(task_id, TaskTransition::Complete { crawl_result }, trace)
            .await
    }

    /// Move a `NEW` task to `ERROR`.
    pub async fn error_task(
        &self,
        task_id: TaskId,
        error_message: String,
        trace: &TraceContext,
    ) -> Result<Task> {
        self.resolve(task_id, TaskTransition::Fail { error_message }, trace)
            .await
    }

    /// Look up a task without changing it.
    pub async fn get_task(&self, task_id: TaskId) -> Result<Option<Task>> {
        self.timed("store.get", self.store.get(task_id)).await
    }

    async fn resolve(
        &self,
        task_id: TaskId,
        transition: TaskTransition,
        trace: &TraceContext,
    ) -> Result<Task> {
        let span = start_task_span("resolve", Some(task_id));
        async {
            let target = transition.target();
            debug!(trace_id = %trace.trace_id, to = target.as_str(), "resolving task");
            let updated = self
                .timed(
                    "store.transition",
                    self.store.transition(task_id, TaskStatus::New, &transition),
                )
                .await?;

            if let Some(task) = updated {
                record_state_transition(
                    &tracing::Span::current(),
                    TaskStatus::New.as_str(),
                    target.as_str(),
                );
                return Ok(task);
            }

            // Nothing matched: tell a missing task from a resolved one.
            match self.timed("store.get", self.store.get(task_id)).await? {
                None => Err(Error::NotFound(task_id)),
                Some(task) => Err(Error::Conflict {
                    id: task_id,
                    status: task.status,
                }),
            }
        }
        .instrument(span)
        .await
    }

    async fn timed<T>(
        &self,
        operation: &'static str,
        call: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let start = Instant::now();
        let outcome = tokio::time::timeout(self.store_timeout, call).await;
        metrics::operation_duration_ms().record(
            start.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new("operation", operation)],
        );
        outcome.map_err(|_| Error::Timeout {
            operation,
            timeout: self.store_timeout,
        })?
    }
}

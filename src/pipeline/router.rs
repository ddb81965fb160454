//! Inbound message router.
//!
//! Binds the message's trace context, validates it, and dispatches on the
//! `status` header. Every business outcome, including rejection, comes back
//! as `Ok` so the caller commits it. Only infrastructure failures come back
//! as `Err`, and those must not be committed.

use std::sync::Arc;

use opentelemetry::KeyValue;
use tracing::{Instrument, error, info, warn};

use crate::error::{Error, Result};
use crate::model::{Task, TaskId, TaskStatus, TaskTransition};
use crate::pipeline::service::TaskService;
use crate::telemetry::metrics;
use crate::telemetry::propagation::{ScopedContext, TracingAdapter};
use crate::validation::{self, Headers, STATUS_HEADER, TaskCommand, ValidationError};

/// How a message was settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessingOutcome {
    Created(Task),
    Completed(Task),
    Errored(Task),
    /// Failed validation. Never retried.
    Rejected(ValidationError),
    /// A `COMPLETED`/`ERROR` event for a task that does not exist.
    NotFound(TaskId),
    /// A `COMPLETED`/`ERROR` event for a task that is no longer `NEW`.
    Conflict { task_id: TaskId, status: TaskStatus },
}

impl ProcessingOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            ProcessingOutcome::Created(_) => "created",
            ProcessingOutcome::Completed(_) => "completed",
            ProcessingOutcome::Errored(_) => "errored",
            ProcessingOutcome::Rejected(_) => "rejected",
            ProcessingOutcome::NotFound(_) => "not_found",
            ProcessingOutcome::Conflict { .. } => "conflict",
        }
    }

    pub fn task(&self) -> Option<&Task> {
        match self {
            ProcessingOutcome::Created(task)
            | ProcessingOutcome::Completed(task)
            | ProcessingOutcome::Errored(task) => Some(task),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct MessageRouter {
    service: TaskService,
    tracer: Arc<dyn TracingAdapter>,
}

impl MessageRouter {
    pub fn new(service: TaskService, tracer: Arc<dyn TracingAdapter>) -> Self {
        Self { service, tracer }
    }

    pub fn service(&self) -> &TaskService {
        &self.service
    }

    /// Process one inbound message.
    pub async fn route(&self, headers: &Headers, body: &[u8]) -> Result<ProcessingOutcome> {
        let parent = self.tracer.extract(headers);
        let scope = self.tracer.bind(parent.as_ref());
        let span = scope.span().clone();

        let status = status_label(headers);
        let result = self.dispatch(headers, body, &scope).instrument(span).await;

        let outcome = match &result {
            Ok(outcome) => outcome.label(),
            Err(_) => "retry",
        };
        metrics::messages_processed().add(
            1,
            &[
                KeyValue::new("status", status),
                KeyValue::new("outcome", outcome),
            ],
        );
        result
    }

    async fn dispatch(
        &self,
        headers: &Headers,
        body: &[u8],
        scope: &ScopedContext,
    ) -> Result<ProcessingOutcome> {
        let message = match validation::validate_message(headers, body) {
            Ok(message) => message,
            Err(rejected) => {
                error!(
                    status = headers.get(STATUS_HEADER).map(String::as_str),
                    errors = %rejected,
                    "rejecting invalid message"
                );
                return Ok(ProcessingOutcome::Rejected(rejected));
            }
        };

        for warning in &message.headers.warnings {
            warn!(
                field = %warning.field,
                reason = %warning.message,
                "dropping malformed trace header"
            );
        }

        let trace = scope.context();
        let received_at = message.headers.received_at;
        let result = match message.command {
            TaskCommand::Create { payload } => self
                .service
                .create_task(payload, received_at, trace)
                .await
                .map(ProcessingOutcome::Created),
            TaskCommand::Transition {
                task_id,
                transition: TaskTransition::Complete { crawl_result },
                ..
            } => self
                .service
                .complete_task(task_id, crawl_result, trace)
                .await
                .map(ProcessingOutcome::Completed),
            TaskCommand::Transition {
                task_id,
                transition: TaskTransition::Fail { error_message },
                ..
            } => self
                .service
                .error_task(task_id, error_message, trace)
                .await
                .map(ProcessingOutcome::Errored),
        };

        match result {
            Ok(outcome) => {
                if let Some(task) = outcome.task() {
                    info!(task_id = %task.id, status = %task.status, "message processed");
                }
                Ok(outcome)
            }
            Err(Error::NotFound(task_id)) => {
                warn!(task_id = %task_id, "update for unknown task");
                Ok(ProcessingOutcome::NotFound(task_id))
            }
            Err(Error::Conflict { id, status }) => {
                warn!(task_id = %id, current = %status, "update for task that is no longer NEW");
                Ok(ProcessingOutcome::Conflict {
                    task_id: id,
                    status,
                })
            }
            Err(Error::Validation(rejected)) => {
                error!(errors = %rejected, "rejecting invalid message");
                Ok(ProcessingOutcome::Rejected(rejected))
            }
            Err(e) => {
                error!(error = %e, "processing failed; message will be redelivered");
                Err(e)
            }
        }
    }
}

/// Metric label for the `status` header: a known status or `"invalid"`.
fn status_label(headers: &Headers) -> &'static str {
    headers
        .get(STATUS_HEADER)
        .and_then(|raw| raw.parse::<TaskStatus>().ok())
        .map_or("invalid", TaskStatus::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(status: Option<&str>) -> Headers {
        status
            .map(|s| (STATUS_HEADER.to_string(), s.to_string()))
            .into_iter()
            .collect()
    }

    #[test]
    fn status_label_is_bounded() {
        assert_eq!(status_label(&headers(Some("COMPLETED"))), "COMPLETED");
        assert_eq!(status_label(&headers(Some("NEW"))), "NEW");
        assert_eq!(status_label(&headers(Some("x-random-7f3a"))), "invalid");
        assert_eq!(status_label(&headers(Some(""))), "invalid");
        assert_eq!(status_label(&headers(None)), "invalid");
    }
}

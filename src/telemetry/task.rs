//! Task lifecycle span helpers.

use tracing::Span;

use crate::model::TaskId;

/// Start a span around one store or publish operation on a task.
///
/// `task.id` is empty for creation and recorded once the store assigns it.
pub fn start_task_span(operation: &'static str, task_id: Option<TaskId>) -> Span {
    let span = tracing::info_span!(
        "task.operation",
        "task.operation" = operation,
        "task.id" = tracing::field::Empty,
        "task.status" = tracing::field::Empty,
    );
    if let Some(id) = task_id {
        record_task_id(&span, id);
    }
    span
}

pub fn record_task_id(span: &Span, task_id: TaskId) {
    span.record("task.id", tracing::field::display(task_id));
}

/// Record a status transition on the given span.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.record("task.status", to);
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "state_transition");
    });
}

//! Metric instrument factories for taskline.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments come from the `"taskline"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("taskline")
}

/// Counter: tasks inserted by the store.
pub fn tasks_created() -> Counter<u64> {
    meter()
        .u64_counter("taskline.tasks.created")
        .with_description("Number of tasks created")
        .build()
}

/// Counter: successful status transitions.
/// Labels: `from`, `to`.
pub fn task_transitions() -> Counter<u64> {
    meter()
        .u64_counter("taskline.tasks.transitions")
        .with_description("Number of task status transitions")
        .build()
}

/// Counter: inbound messages by terminal outcome.
/// Labels: `status`, `outcome` ("created" | "completed" | "errored" |
/// "rejected" | "not_found" | "conflict" | "retry").
pub fn messages_processed() -> Counter<u64> {
    meter()
        .u64_counter("taskline.messages.processed")
        .with_description("Number of inbound messages processed")
        .build()
}

/// Counter: downstream publish attempts.
/// Labels: `result` ("ok" | "error").
pub fn publish_results() -> Counter<u64> {
    meter()
        .u64_counter("taskline.publish.results")
        .with_description("Downstream crawl request publish attempts")
        .build()
}

/// Counter: queue-level operations (send, read, archive, release).
/// Labels: `queue`, `operation`.
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("taskline.queue.operations")
        .with_description("Number of queue operations")
        .build()
}

/// Histogram: operation duration in milliseconds.
/// Labels: `operation`.
pub fn operation_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("taskline.operation.duration_ms")
        .with_description("Operation duration in milliseconds")
        .with_unit("ms")
        .build()
}

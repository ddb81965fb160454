//! Integration tests for telemetry initialization and span helpers.

use opentelemetry::propagation::TextMapPropagator as _;
use taskline::model::TaskId;
use taskline::telemetry::propagation::{TraceContext, TracingAdapter, W3cPropagator};
use taskline::validation::{Headers, TRACEPARENT_HEADER, TRACESTATE_HEADER};
use uuid::Uuid;

#[test]
fn telemetry_initializes_without_endpoint() {
    // A global subscriber can only be installed once per process, so this
    // may return Err if another test got there first.
    let config = taskline::telemetry::TelemetryConfig {
        endpoint: None,
        service_name: "taskline-test".to_string(),
        log_level: "debug".to_string(),
    };
    let _guard = taskline::telemetry::init_telemetry(config);

    // Trace headers go through `W3cPropagator`; no global propagator is set.
    opentelemetry::global::get_text_map_propagator(|propagator| {
        assert_eq!(propagator.fields().count(), 0);
    });
}

#[test]
fn task_span_creates_and_records_transition() {
    let span = taskline::telemetry::task::start_task_span("resolve", Some(TaskId(Uuid::new_v4())));
    taskline::telemetry::task::record_state_transition(&span, "NEW", "COMPLETED");
}

#[test]
fn trace_context_survives_a_hop() {
    let propagator = W3cPropagator;
    let upstream = TraceContext::new_root();

    let mut headers = Headers::new();
    propagator.inject(&upstream, &mut headers);
    headers.insert(TRACESTATE_HEADER.to_string(), "vendor=abc".to_string());

    let extracted = propagator.extract(&headers).unwrap();
    let scope = propagator.bind(Some(&extracted));
    assert_eq!(scope.context().trace_id, upstream.trace_id);
    assert_eq!(scope.context().trace_state.as_deref(), Some("vendor=abc"));

    let mut outbound = Headers::new();
    propagator.inject(&scope.context().child(), &mut outbound);
    let downstream = TraceContext::parse(&outbound[TRACEPARENT_HEADER], None).unwrap();
    assert_eq!(downstream.trace_id, upstream.trace_id);
    assert_eq!(outbound[TRACESTATE_HEADER], "vendor=abc");
}

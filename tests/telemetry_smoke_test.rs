//! Smoke tests for the full observability stack.
//!
//! These tests require an OTLP collector with Tempo, Prometheus and Loki
//! behind it on their default local ports.
//!
//! Run with:
//! ```sh
//! cargo test --test telemetry_smoke_test -- --ignored --nocapture
//! ```

use std::sync::OnceLock;
use std::time::Duration;

use opentelemetry::KeyValue;
use taskline::model::TaskId;
use taskline::telemetry::propagation::{TraceContext, TracingAdapter, W3cPropagator};
use taskline::telemetry::{TelemetryConfig, TelemetryGuard, init_telemetry, metrics, task};

static TELEMETRY: OnceLock<TelemetryGuard> = OnceLock::new();

fn ensure_telemetry() -> &'static TelemetryGuard {
    TELEMETRY.get_or_init(|| {
        init_telemetry(TelemetryConfig {
            endpoint: Some("http://localhost:4317".to_string()),
            service_name: "taskline-smoke-test".to_string(),
            log_level: "info".to_string(),
        })
        .expect("failed to init telemetry")
    })
}

/// Force-flush all providers and give backends time to ingest.
async fn flush_and_wait(guard: &TelemetryGuard) {
    guard.force_flush();
    tokio::time::sleep(Duration::from_secs(8)).await;
}

async fn get_json(url: &str, query: &[(&str, &str)]) -> serde_json::Value {
    let resp = reqwest::Client::new()
        .get(url)
        .query(query)
        .send()
        .await
        .unwrap_or_else(|e| panic!("failed to query {url}: {e}"));
    assert!(
        resp.status().is_success(),
        "{url} returned {}",
        resp.status()
    );
    resp.json().await.expect("response is not JSON")
}

#[test]
#[ignore]
fn smoke_traces_continue_upstream_trace() {
    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async {
        let guard = ensure_telemetry();
        let upstream = TraceContext::new_root();

        {
            let scope = W3cPropagator.bind(Some(&upstream));
            let _message = scope.span().enter();
            let span = task::start_task_span("resolve", Some(TaskId(uuid::Uuid::new_v4())));
            let _enter = span.enter();
            task::record_state_transition(&span, "NEW", "COMPLETED");
        }

        flush_and_wait(guard).await;

        let body = get_json(
            &format!("http://localhost:3200/api/traces/{}", upstream.trace_id),
            &[],
        )
        .await;
        assert!(
            body["batches"].as_array().is_some_and(|b| !b.is_empty()),
            "expected spans under the upstream trace id, got: {body}"
        );
    });
}

#[test]
#[ignore]
fn smoke_metrics() {
    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async {
        let guard = ensure_telemetry();

        metrics::messages_processed().add(
            1,
            &[
                KeyValue::new("status", "NEW"),
                KeyValue::new("outcome", "created"),
            ],
        );
        metrics::publish_results().add(1, &[KeyValue::new("result", "ok")]);
        metrics::operation_duration_ms().record(42.5, &[KeyValue::new("operation", "smoke")]);

        flush_and_wait(guard).await;

        let body = get_json(
            "http://localhost:9090/api/v1/query",
            &[("query", "taskline_messages_processed_total")],
        )
        .await;
        let results = body["data"]["result"].as_array();
        assert!(
            results.is_some_and(|r| !r.is_empty()),
            "expected metric results in Prometheus, got: {body}"
        );
    });
}

#[test]
#[ignore]
fn smoke_logs() {
    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async {
        let guard = ensure_telemetry();

        tracing::info!(component = "smoke-test", "smoke test info log");
        tracing::warn!(component = "smoke-test", "smoke test warning log");

        flush_and_wait(guard).await;

        let body = get_json(
            "http://localhost:3100/loki/api/v1/query_range",
            &[
                ("query", r#"{service_name="taskline-smoke-test"}"#),
                ("limit", "10"),
            ],
        )
        .await;
        let streams = body["data"]["result"].as_array();
        assert!(
            streams.is_some_and(|s| !s.is_empty()),
            "expected log streams in Loki, got: {body}"
        );
    });
}

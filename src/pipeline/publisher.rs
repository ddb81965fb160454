//! Downstream crawl request publisher.
//!
//! Fire-and-forget: one attempt per created task, bounded by the publish
//! timeout. Failures are logged and counted but never retried, and never
//! undo the task that was just created.

use std::sync::Arc;
use std::time::{Duration, Instant};

use opentelemetry::KeyValue;
use tracing::{info, warn};

use crate::bus::{MessageBus, OutboundMessage};
use crate::model::{TaskId, TaskPayload};
use crate::telemetry::metrics;
use crate::telemetry::propagation::{TraceContext, TracingAdapter};
use crate::validation::{Headers, TASK_ID_HEADER};

/// `version` header on every downstream message.
pub const MESSAGE_VERSION: &str = "1.0";
pub const SOURCE_HEADER: &str = "source";
pub const VERSION_HEADER: &str = "version";

/// What happened to one publish attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishResult {
    pub success: bool,
    pub error: Option<String>,
    /// Bus-assigned id when the publish succeeded.
    pub message_id: Option<i64>,
}

impl PublishResult {
    fn ok(message_id: i64) -> Self {
        Self {
            success: true,
            error: None,
            message_id: Some(message_id),
        }
    }

    fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            message_id: None,
        }
    }
}

#[derive(Clone)]
pub struct DownstreamPublisher {
    bus: Arc<dyn MessageBus>,
    tracer: Arc<dyn TracingAdapter>,
    topic: String,
    source: String,
    timeout: Duration,
}

impl DownstreamPublisher {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        tracer: Arc<dyn TracingAdapter>,
        topic: impl Into<String>,
        source: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            bus,
            tracer,
            topic: topic.into(),
            source: source.into(),
            timeout,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Publish a crawl request for `task_id`, keyed by the task id so every
    /// request for one task lands on one partition.
    pub async fn publish(
        &self,
        task_id: TaskId,
        payload: &TaskPayload,
        trace: &TraceContext,
    ) -> PublishResult {
        let start = Instant::now();
        let result = self.attempt(task_id, payload, trace).await;

        metrics::operation_duration_ms().record(
            start.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new("operation", "publish")],
        );
        metrics::publish_results().add(
            1,
            &[KeyValue::new(
                "result",
                if result.success { "ok" } else { "error" },
            )],
        );

        match &result.error {
            None => info!(task_id = %task_id, topic = %self.topic, "crawl request published"),
            Some(error) => warn!(
                task_id = %task_id,
                topic = %self.topic,
                error = %error,
                "downstream publish failed"
            ),
        }
        result
    }

    async fn attempt(
        &self,
        task_id: TaskId,
        payload: &TaskPayload,
        trace: &TraceContext,
    ) -> PublishResult {
        let body = match serde_json::to_string(payload) {
            Ok(body) => body,
            Err(e) => return PublishResult::failed(format!("encode payload: {e}")),
        };

        let mut headers = Headers::new();
        headers.insert(TASK_ID_HEADER.to_string(), task_id.to_string());
        headers.insert(SOURCE_HEADER.to_string(), self.source.clone());
        headers.insert(VERSION_HEADER.to_string(), MESSAGE_VERSION.to_string());
        self.tracer.inject(&trace.child(), &mut headers);

        let message = OutboundMessage {
            key: Some(task_id.to_string()),
            headers,
            body,
        };

        match tokio::time::timeout(self.timeout, self.bus.produce(&self.topic, message)).await {
            Ok(Ok(id)) => PublishResult::ok(id),
            Ok(Err(e)) => PublishResult::failed(e.to_string()),
            Err(_) => PublishResult::failed(format!("timed out after {:?}", self.timeout)),
        }
    }
}

//! W3C trace-context propagation across message hops.
//!
//! Each consumed message gets its own [`ScopedContext`]: a trace context
//! plus a `tracing` span carrying `trace_id`, `span_id`, `parent_span_id`
//! and `trace_state`. Processing futures are instrumented with that span, so
//! every log line emitted while handling the message carries those fields.
//! Contexts are passed explicitly; there is no per-process current trace.

use std::str::FromStr;

use opentelemetry::trace::{
    SpanContext, SpanId, TraceContextExt as _, TraceFlags, TraceId, TraceState,
};
use tracing::{Level, Span, debug};
use tracing_opentelemetry::OpenTelemetrySpanExt as _;
use uuid::Uuid;

use crate::validation::{Headers, TRACEPARENT_HEADER, TRACESTATE_HEADER};

/// Upper bound on an accepted `tracestate` header.
pub const MAX_TRACESTATE_LEN: usize = 512;

/// Check `traceparent` against `^00-[0-9a-f]{32}-[0-9a-f]{16}-[0-9a-f]{2}$`.
pub fn is_valid_traceparent(value: &str) -> bool {
    let parts: Vec<&str> = value.split('-').collect();
    let lower_hex = |s: &str, len: usize| {
        s.len() == len && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
    };
    parts.len() == 4
        && parts[0] == "00"
        && lower_hex(parts[1], 32)
        && lower_hex(parts[2], 16)
        && lower_hex(parts[3], 2)
}

// ---------------------------------------------------------------------------
// TraceContext
// ---------------------------------------------------------------------------

/// Trace identity of one hop. Transient: never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceContext {
    pub trace_id: TraceId,
    pub span_id: SpanId,
    pub parent_span_id: Option<SpanId>,
    pub trace_flags: TraceFlags,
    pub trace_state: Option<String>,
}

impl TraceContext {
    /// Start a fresh, sampled trace.
    pub fn new_root() -> Self {
        Self {
            trace_id: TraceId::from_bytes(*Uuid::new_v4().as_bytes()),
            span_id: random_span_id(),
            parent_span_id: None,
            trace_flags: TraceFlags::SAMPLED,
            trace_state: None,
        }
    }

    /// Same trace, new span, parented on this one.
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id,
            span_id: random_span_id(),
            parent_span_id: Some(self.span_id),
            trace_flags: self.trace_flags,
            trace_state: self.trace_state.clone(),
        }
    }

    /// Parse W3C headers. Returns `None` for anything malformed, including
    /// all-zero trace or span ids.
    pub fn parse(traceparent: &str, tracestate: Option<&str>) -> Option<Self> {
        if !is_valid_traceparent(traceparent) {
            return None;
        }
        let mut parts = traceparent.split('-').skip(1);
        let trace_id = TraceId::from_hex(parts.next()?).ok()?;
        let span_id = SpanId::from_hex(parts.next()?).ok()?;
        let flags = u8::from_str_radix(parts.next()?, 16).ok()?;
        if trace_id == TraceId::INVALID || span_id == SpanId::INVALID {
            return None;
        }
        let trace_state = tracestate
            .map(str::trim)
            .filter(|s| !s.is_empty() && s.chars().count() <= MAX_TRACESTATE_LEN)
            .map(str::to_string);
        Some(Self {
            trace_id,
            span_id,
            parent_span_id: None,
            trace_flags: TraceFlags::new(flags),
            trace_state,
        })
    }

    /// Render as a `traceparent` header value.
    pub fn traceparent(&self) -> String {
        format!(
            "00-{}-{}-{:02x}",
            self.trace_id,
            self.span_id,
            self.trace_flags.to_u8()
        )
    }

    /// This hop as a remote OpenTelemetry parent.
    pub fn as_remote_parent(&self) -> opentelemetry::Context {
        let state = self
            .trace_state
            .as_deref()
            .and_then(|s| TraceState::from_str(s).ok())
            .unwrap_or_default();
        let span_context =
            SpanContext::new(self.trace_id, self.span_id, self.trace_flags, true, state);
        opentelemetry::Context::new().with_remote_span_context(span_context)
    }
}

fn random_span_id() -> SpanId {
    loop {
        let bytes = Uuid::new_v4().into_bytes();
        let mut id = [0u8; 8];
        id.copy_from_slice(&bytes[..8]);
        let span_id = SpanId::from_bytes(id);
        if span_id != SpanId::INVALID {
            return span_id;
        }
    }
}

// ---------------------------------------------------------------------------
// ScopedContext
// ---------------------------------------------------------------------------

/// A trace context bound to a `tracing` span for the duration of one
/// message. Instrument the processing future with [`ScopedContext::span`].
#[derive(Debug, Clone)]
pub struct ScopedContext {
    context: TraceContext,
    span: Span,
}

impl ScopedContext {
    pub fn context(&self) -> &TraceContext {
        &self.context
    }

    pub fn span(&self) -> &Span {
        &self.span
    }
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

/// The three capabilities the pipeline needs from a tracing backend.
pub trait TracingAdapter: Send + Sync {
    /// Read trace context from inbound headers. Malformed values count as
    /// absent.
    fn extract(&self, headers: &Headers) -> Option<TraceContext>;

    /// Open the per-message scope. Continues `parent` when given, otherwise
    /// starts a fresh trace.
    fn bind(&self, parent: Option<&TraceContext>) -> ScopedContext;

    /// Write `context` onto outgoing headers.
    fn inject(&self, context: &TraceContext, headers: &mut Headers);
}

/// W3C trace-context propagation backed by `tracing` spans, linked into
/// OpenTelemetry when an OTel layer is installed.
#[derive(Debug, Clone, Copy, Default)]
pub struct W3cPropagator;

impl TracingAdapter for W3cPropagator {
    fn extract(&self, headers: &Headers) -> Option<TraceContext> {
        let traceparent = headers.get(TRACEPARENT_HEADER)?;
        let tracestate = headers.get(TRACESTATE_HEADER).map(String::as_str);
        let parsed = TraceContext::parse(traceparent, tracestate);
        if parsed.is_none() {
            debug!(traceparent = %traceparent, "discarding malformed trace context");
        }
        parsed
    }

    fn bind(&self, parent: Option<&TraceContext>) -> ScopedContext {
        // ERROR level so the span survives any log filter and warn/error
        // lines keep their trace fields.
        let span = tracing::span!(
            Level::ERROR,
            "task.message",
            trace_id = tracing::field::Empty,
            span_id = tracing::field::Empty,
            parent_span_id = tracing::field::Empty,
            trace_state = tracing::field::Empty,
        );

        if let Some(parent) = parent {
            let _ = span.set_parent(parent.as_remote_parent());
        }

        // Prefer the ids OpenTelemetry assigned so log lines and exported
        // spans agree; without an OTel layer the span context is invalid.
        let otel = span.context().span().span_context().clone();
        let context = if otel.is_valid() {
            TraceContext {
                trace_id: otel.trace_id(),
                span_id: otel.span_id(),
                parent_span_id: parent.map(|p| p.span_id),
                trace_flags: otel.trace_flags(),
                trace_state: parent.and_then(|p| p.trace_state.clone()),
            }
        } else {
            parent.map_or_else(TraceContext::new_root, TraceContext::child)
        };

        span.record("trace_id", tracing::field::display(context.trace_id));
        span.record("span_id", tracing::field::display(context.span_id));
        if let Some(parent_span_id) = context.parent_span_id {
            span.record("parent_span_id", tracing::field::display(parent_span_id));
        }
        if let Some(state) = &context.trace_state {
            span.record("trace_state", state.as_str());
        }

        ScopedContext { context, span }
    }

    fn inject(&self, context: &TraceContext, headers: &mut Headers) {
        headers.insert(TRACEPARENT_HEADER.to_string(), context.traceparent());
        match &context.trace_state {
            Some(state) => {
                headers.insert(TRACESTATE_HEADER.to_string(), state.clone());
            }
            None => {
                headers.remove(TRACESTATE_HEADER);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PARENT: &str = "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01";

    fn headers(pairs: &[(&str, &str)]) -> Headers {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn traceparent_pattern() {
        assert!(is_valid_traceparent(PARENT));
        assert!(!is_valid_traceparent(
            "00-4BF92F3577B34DA6A3CE929D0E0E4736-00f067aa0ba902b7-01"
        ));
        assert!(!is_valid_traceparent(
            "01-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01"
        ));
        assert!(!is_valid_traceparent("00-4bf92f35-00f067aa0ba902b7-01"));
        assert!(!is_valid_traceparent(&format!("{PARENT}-extra")));
    }

    #[test]
    fn extract_reads_ids_and_state() {
        let ctx = W3cPropagator
            .extract(&headers(&[("traceparent", PARENT), ("tracestate", "vendor=abc")]))
            .unwrap();
        assert_eq!(ctx.trace_id.to_string(), "4bf92f3577b34da6a3ce929d0e0e4736");
        assert_eq!(ctx.span_id.to_string(), "00f067aa0ba902b7");
        assert_eq!(ctx.trace_state.as_deref(), Some("vendor=abc"));
        assert_eq!(ctx.traceparent(), PARENT);
    }

    #[test]
    fn malformed_or_zero_ids_are_absent() {
        assert!(W3cPropagator.extract(&headers(&[("traceparent", "garbage")])).is_none());
        let zero_trace = "00-00000000000000000000000000000000-00f067aa0ba902b7-01";
        assert!(W3cPropagator.extract(&headers(&[("traceparent", zero_trace)])).is_none());
        assert!(W3cPropagator.extract(&headers(&[])).is_none());
    }

    #[test]
    fn bind_continues_parent_trace() {
        let parent = TraceContext::parse(PARENT, None).unwrap();
        let scope = W3cPropagator.bind(Some(&parent));
        assert_eq!(scope.context().trace_id, parent.trace_id);
        assert_ne!(scope.context().span_id, parent.span_id);
        assert_eq!(scope.context().parent_span_id, Some(parent.span_id));
    }

    #[test]
    fn bind_without_parent_starts_fresh_trace() {
        let a = W3cPropagator.bind(None);
        let b = W3cPropagator.bind(None);
        assert_ne!(a.context().trace_id, b.context().trace_id);
        assert!(a.context().parent_span_id.is_none());
        assert!(is_valid_traceparent(&a.context().traceparent()));
    }

    #[test]
    fn inject_writes_continued_context() {
        let parent = TraceContext::parse(PARENT, Some("vendor=abc")).unwrap();
        let outgoing = parent.child();
        let mut out = Headers::new();
        W3cPropagator.inject(&outgoing, &mut out);

        let read_back = W3cPropagator.extract(&out).unwrap();
        assert_eq!(read_back.trace_id, parent.trace_id);
        assert_eq!(read_back.span_id, outgoing.span_id);
        assert_eq!(out.get("tracestate").map(String::as_str), Some("vendor=abc"));
    }
}

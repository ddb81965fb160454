//! Schema checks for inbound task messages.
//!
//! Headers are a flat string map and are checked by hand. Bodies are JSON
//! and deserialize into one DTO per status, checked with `validator`.
//! Every failing field is reported; nothing is fail-fast.
//!
//! `traceparent` and `tracestate` are advisory: a malformed value is
//! returned as a warning and dropped, never as a rejection.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;
use validator::{Validate, ValidationErrors, ValidationErrorsKind};

use crate::model::{TaskId, TaskPayload, TaskStatus, TaskTransition};
use crate::telemetry::propagation::{MAX_TRACESTATE_LEN, is_valid_traceparent};

/// Message headers as delivered by the bus.
pub type Headers = HashMap<String, String>;

pub const STATUS_HEADER: &str = "status";
pub const TIMESTAMP_HEADER: &str = "timestamp";
pub const TASK_ID_HEADER: &str = "task_id";
pub const TRACEPARENT_HEADER: &str = "traceparent";
pub const TRACESTATE_HEADER: &str = "tracestate";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// One failing field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub code: String,
    pub message: String,
}

impl FieldError {
    pub fn new(
        field: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            field: field.into(),
            code: code.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// A message failed its schema. Carries every field-level failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("validation failed: {}", format_errors(.errors))]
pub struct ValidationError {
    pub errors: Vec<FieldError>,
}

fn format_errors(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl ValidationError {
    pub fn single(field: &str, code: &str, message: impl Into<String>) -> Self {
        Self {
            errors: vec![FieldError::new(field, code, message)],
        }
    }

    /// Whether `field` is among the failures.
    pub fn has_field(&self, field: &str) -> bool {
        self.errors.iter().any(|e| e.field == field)
    }
}

// ---------------------------------------------------------------------------
// Body DTOs
// ---------------------------------------------------------------------------

/// Fields common to every status.
#[derive(Debug, Default, Deserialize, Validate)]
pub struct TaskBody {
    #[validate(required, email, length(max = 255))]
    pub user_email: Option<String>,
    #[validate(required, length(min = 1, max = 1000))]
    pub user_query: Option<String>,
    #[validate(required, url, custom(function = "http_scheme"), length(max = 2048))]
    pub base_url: Option<String>,
}

impl TaskBody {
    fn into_payload(self) -> TaskPayload {
        TaskPayload {
            user_email: self.user_email.unwrap_or_default(),
            user_query: self.user_query.unwrap_or_default(),
            base_url: self.base_url.unwrap_or_default(),
        }
    }
}

/// Body of a `COMPLETED` message.
#[derive(Debug, Deserialize, Validate)]
pub struct CompletedTaskBody {
    #[serde(flatten)]
    #[validate(nested)]
    pub base: TaskBody,
    #[validate(required, length(min = 1, max = 10000))]
    pub crawl_result: Option<String>,
}

/// Body of an `ERROR` message.
#[derive(Debug, Deserialize, Validate)]
pub struct ErrorTaskBody {
    #[serde(flatten)]
    #[validate(nested)]
    pub base: TaskBody,
    #[validate(required, length(min = 1, max = 10000))]
    pub error_message: Option<String>,
}

// ---------------------------------------------------------------------------
// Validated output
// ---------------------------------------------------------------------------

/// Headers that passed validation.
#[derive(Debug, Clone)]
pub struct MessageHeaders {
    pub status: TaskStatus,
    pub received_at: DateTime<Utc>,
    /// Present only for `COMPLETED`/`ERROR`. Ignored on `NEW`.
    pub task_id: Option<TaskId>,
    pub traceparent: Option<String>,
    pub tracestate: Option<String>,
    /// Trace headers that were malformed and dropped.
    pub warnings: Vec<FieldError>,
}

/// What a valid message asks the lifecycle service to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskCommand {
    Create {
        payload: TaskPayload,
    },
    Transition {
        task_id: TaskId,
        payload: TaskPayload,
        transition: TaskTransition,
    },
}

/// A fully validated inbound message.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub headers: MessageHeaders,
    pub command: TaskCommand,
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Read the dispatch key. Missing or unknown values are validation failures.
pub fn parse_status(headers: &Headers) -> Result<TaskStatus, ValidationError> {
    match headers.get(STATUS_HEADER) {
        None => Err(ValidationError::single(
            STATUS_HEADER,
            "required",
            "is required",
        )),
        Some(raw) => raw.parse().map_err(|_| {
            ValidationError::single(
                STATUS_HEADER,
                "enum",
                format!("must be one of NEW, COMPLETED, ERROR (got {raw:?})"),
            )
        }),
    }
}

/// Validate the header shape declared by `status`.
pub fn validate_headers(
    status: TaskStatus,
    headers: &Headers,
) -> Result<MessageHeaders, ValidationError> {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    let received_at = match headers.get(TIMESTAMP_HEADER) {
        None => {
            errors.push(FieldError::new(TIMESTAMP_HEADER, "required", "is required"));
            None
        }
        Some(raw) => {
            let parsed = parse_timestamp(raw);
            if parsed.is_none() {
                errors.push(FieldError::new(
                    TIMESTAMP_HEADER,
                    "timestamp",
                    "must be an ISO-8601 timestamp",
                ));
            }
            parsed
        }
    };

    let task_id = if status == TaskStatus::New {
        None
    } else {
        match headers.get(TASK_ID_HEADER) {
            None => {
                errors.push(FieldError::new(TASK_ID_HEADER, "required", "is required"));
                None
            }
            Some(raw) => {
                let parsed = parse_uuid_v4(raw);
                if parsed.is_none() {
                    errors.push(FieldError::new(TASK_ID_HEADER, "uuid", "must be a UUID v4"));
                }
                parsed
            }
        }
    };

    let traceparent = headers.get(TRACEPARENT_HEADER).and_then(|raw| {
        if is_valid_traceparent(raw) {
            Some(raw.clone())
        } else {
            warnings.push(FieldError::new(
                TRACEPARENT_HEADER,
                "traceparent",
                "must match 00-<32 hex>-<16 hex>-<2 hex>",
            ));
            None
        }
    });

    let tracestate = headers.get(TRACESTATE_HEADER).and_then(|raw| {
        if raw.chars().count() <= MAX_TRACESTATE_LEN {
            Some(raw.clone())
        } else {
            warnings.push(FieldError::new(
                TRACESTATE_HEADER,
                "length",
                format!("must be at most {MAX_TRACESTATE_LEN} characters"),
            ));
            None
        }
    });

    match received_at {
        Some(received_at) if errors.is_empty() => Ok(MessageHeaders {
            status,
            received_at,
            task_id,
            traceparent,
            tracestate,
            warnings,
        }),
        _ => Err(ValidationError { errors }),
    }
}

/// Validate the body shape declared by `headers.status` and build the command.
pub fn validate_body(headers: &MessageHeaders, raw: &[u8]) -> Result<TaskCommand, ValidationError> {
    match headers.status {
        TaskStatus::New => {
            let body: TaskBody = parse_json(raw)?;
            check(&body)?;
            Ok(TaskCommand::Create {
                payload: body.into_payload(),
            })
        }
        TaskStatus::Completed => {
            let body: CompletedTaskBody = parse_json(raw)?;
            check(&body)?;
            Ok(TaskCommand::Transition {
                task_id: require_task_id(headers)?,
                payload: body.base.into_payload(),
                transition: TaskTransition::Complete {
                    crawl_result: body.crawl_result.unwrap_or_default(),
                },
            })
        }
        TaskStatus::Error => {
            let body: ErrorTaskBody = parse_json(raw)?;
            check(&body)?;
            Ok(TaskCommand::Transition {
                task_id: require_task_id(headers)?,
                payload: body.base.into_payload(),
                transition: TaskTransition::Fail {
                    error_message: body.error_message.unwrap_or_default(),
                },
            })
        }
    }
}

/// Validate a whole message. Header and body failures are reported together.
pub fn validate_message(headers: &Headers, body: &[u8]) -> Result<InboundMessage, ValidationError> {
    let status = parse_status(headers)?;
    match validate_headers(status, headers) {
        Ok(headers) => {
            let command = validate_body(&headers, body)?;
            Ok(InboundMessage { headers, command })
        }
        Err(mut header_errors) => {
            // Still report body problems alongside the header ones.
            if let Err(body_errors) = validate_body_shape(status, body) {
                header_errors.errors.extend(body_errors.errors);
            }
            Err(header_errors)
        }
    }
}

fn validate_body_shape(status: TaskStatus, raw: &[u8]) -> Result<(), ValidationError> {
    match status {
        TaskStatus::New => check(&parse_json::<TaskBody>(raw)?),
        TaskStatus::Completed => check(&parse_json::<CompletedTaskBody>(raw)?),
        TaskStatus::Error => check(&parse_json::<ErrorTaskBody>(raw)?),
    }
}

fn require_task_id(headers: &MessageHeaders) -> Result<TaskId, ValidationError> {
    headers
        .task_id
        .ok_or_else(|| ValidationError::single(TASK_ID_HEADER, "required", "is required"))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Parse an ISO-8601 timestamp. Offsetless values are taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let with_offset = DateTime::parse_from_rfc3339(raw)
        .or_else(|_| DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f%z"));
    if let Ok(ts) = with_offset {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Crawl targets are web pages.
fn http_scheme(url: &str) -> Result<(), validator::ValidationError> {
    let scheme = url.split_once(':').map(|(scheme, _)| scheme.to_ascii_lowercase());
    match scheme.as_deref() {
        Some("http" | "https") => Ok(()),
        _ => Err(validator::ValidationError::new("url_scheme")),
    }
}

fn parse_uuid_v4(raw: &str) -> Option<TaskId> {
    let id = Uuid::parse_str(raw).ok()?;
    let is_v4 = id.get_version() == Some(uuid::Version::Random)
        && id.get_variant() == uuid::Variant::RFC4122;
    is_v4.then_some(TaskId(id))
}

fn parse_json<T: for<'de> Deserialize<'de>>(raw: &[u8]) -> Result<T, ValidationError> {
    serde_json::from_slice(raw)
        .map_err(|e| ValidationError::single("body", "json", format!("is not a valid body: {e}")))
}

fn check<T: Validate>(dto: &T) -> Result<(), ValidationError> {
    dto.validate().map_err(|errors| {
        let mut out = Vec::new();
        flatten_errors(&errors, &mut out);
        out.sort_by(|a, b| a.field.cmp(&b.field));
        ValidationError { errors: out }
    })
}

/// Nested DTOs are `#[serde(flatten)]`ed, so nested field names are reported
/// without a prefix.
fn flatten_errors(errors: &ValidationErrors, out: &mut Vec<FieldError>) {
    for (field, kind) in errors.errors() {
        match kind {
            ValidationErrorsKind::Field(list) => {
                for err in list {
                    out.push(FieldError::new(
                        field.to_string(),
                        err.code.to_string(),
                        describe(err),
                    ));
                }
            }
            ValidationErrorsKind::Struct(inner) => flatten_errors(inner, out),
            ValidationErrorsKind::List(items) => {
                for inner in items.values() {
                    flatten_errors(inner, out);
                }
            }
        }
    }
}

fn describe(err: &validator::ValidationError) -> String {
    if let Some(message) = &err.message {
        return message.to_string();
    }
    let param = |name: &str| err.params.get(name).map(ToString::to_string);
    match &*err.code {
        "required" => "is required".to_string(),
        "email" => "must be a valid email address".to_string(),
        "url" => "must be an absolute URL".to_string(),
        "url_scheme" => "must use the http or https scheme".to_string(),
        "length" => match (param("min"), param("max")) {
            (Some(min), Some(max)) => format!("length must be between {min} and {max}"),
            (None, Some(max)) => format!("length must be at most {max}"),
            (Some(min), None) => format!("length must be at least {min}"),
            (None, None) => "has an invalid length".to_string(),
        },
        other => format!("failed `{other}` check"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn headers(pairs: &[(&str, &str)]) -> Headers {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn base_body() -> serde_json::Value {
        json!({
            "user_email": "a@b.com",
            "user_query": "find X",
            "base_url": "https://x.com"
        })
    }

    const TS: &str = "2026-03-01T12:00:00.000Z";
    const ID: &str = "00000000-0000-4000-8000-000000000000";

    #[test]
    fn new_message_ignores_task_id() {
        let h = headers(&[("status", "NEW"), ("timestamp", TS), ("task_id", "not-a-uuid")]);
        let msg = validate_message(&h, base_body().to_string().as_bytes()).unwrap();
        assert!(msg.headers.task_id.is_none());
        assert_eq!(
            msg.command,
            TaskCommand::Create {
                payload: TaskPayload {
                    user_email: "a@b.com".to_string(),
                    user_query: "find X".to_string(),
                    base_url: "https://x.com".to_string(),
                }
            }
        );
    }

    #[test]
    fn received_at_comes_from_header() {
        let h = headers(&[("status", "NEW"), ("timestamp", TS)]);
        let msg = validate_message(&h, base_body().to_string().as_bytes()).unwrap();
        assert_eq!(msg.headers.received_at.to_rfc3339(), "2026-03-01T12:00:00+00:00");
    }

    #[test]
    fn missing_or_unknown_status_is_rejected() {
        let err = validate_message(&headers(&[("timestamp", TS)]), b"{}").unwrap_err();
        assert!(err.has_field("status"));

        let h = headers(&[("status", "RUNNING"), ("timestamp", TS)]);
        let err = validate_message(&h, b"{}").unwrap_err();
        assert_eq!(err.errors[0].code, "enum");
    }

    #[test]
    fn update_requires_v4_task_id() {
        let mut body = base_body();
        body["crawl_result"] = json!("done");
        let raw = body.to_string();

        let h = headers(&[("status", "COMPLETED"), ("timestamp", TS)]);
        let err = validate_message(&h, raw.as_bytes()).unwrap_err();
        assert!(err.has_field("task_id"));

        // v1 UUID
        let h = headers(&[
            ("status", "COMPLETED"),
            ("timestamp", TS),
            ("task_id", "6ba7b810-9dad-11d1-80b4-00c04fd430c8"),
        ]);
        let err = validate_message(&h, raw.as_bytes()).unwrap_err();
        assert_eq!(err.errors[0].code, "uuid");

        let h = headers(&[("status", "COMPLETED"), ("timestamp", TS), ("task_id", ID)]);
        let msg = validate_message(&h, raw.as_bytes()).unwrap();
        match msg.command {
            TaskCommand::Transition {
                task_id,
                transition,
                ..
            } => {
                assert_eq!(task_id.to_string(), ID);
                assert_eq!(
                    transition,
                    TaskTransition::Complete {
                        crawl_result: "done".to_string()
                    }
                );
            }
            other => panic!("expected transition, got {other:?}"),
        }
    }

    #[test]
    fn body_errors_are_reported_per_field() {
        let h = headers(&[("status", "ERROR"), ("timestamp", TS), ("task_id", ID)]);
        let body = json!({
            "user_email": "not-an-email",
            "user_query": "",
            "base_url": "/relative/path"
        });
        let err = validate_message(&h, body.to_string().as_bytes()).unwrap_err();
        for field in ["user_email", "user_query", "base_url", "error_message"] {
            assert!(err.has_field(field), "missing error for {field}: {err}");
        }
    }

    #[test]
    fn header_and_body_errors_are_combined() {
        let h = headers(&[("status", "NEW")]);
        let err = validate_message(&h, b"{\"user_query\":\"q\"}").unwrap_err();
        assert!(err.has_field("timestamp"));
        assert!(err.has_field("user_email"));
        assert!(err.has_field("base_url"));
    }

    #[test]
    fn length_limits_count_characters() {
        let h = headers(&[("status", "NEW"), ("timestamp", TS)]);
        let mut body = base_body();
        body["user_query"] = json!("é".repeat(1000));
        assert!(validate_message(&h, body.to_string().as_bytes()).is_ok());

        body["user_query"] = json!("q".repeat(1001));
        let err = validate_message(&h, body.to_string().as_bytes()).unwrap_err();
        assert_eq!(err.errors[0].field, "user_query");
        assert_eq!(err.errors[0].code, "length");
    }

    fn new_headers() -> Headers {
        headers(&[("status", "NEW"), ("timestamp", TS)])
    }

    fn update_headers(status: &str) -> Headers {
        headers(&[("status", status), ("timestamp", TS), ("task_id", ID)])
    }

    fn rejected_fields(h: &Headers, body: &serde_json::Value) -> Vec<String> {
        match validate_message(h, body.to_string().as_bytes()) {
            Ok(_) => Vec::new(),
            Err(err) => err.errors.into_iter().map(|e| e.field).collect(),
        }
    }

    #[test]
    fn email_is_limited_to_255_characters() {
        let mut body = base_body();
        // Local parts stop at 64 characters, so the length comes from the domain.
        let domain = format!(
            "{}.{}.{}.{}.com",
            "b".repeat(63),
            "c".repeat(63),
            "d".repeat(63),
            "e".repeat(57)
        );
        let at_limit = format!("a@{domain}");
        assert_eq!(at_limit.len(), 255);
        body["user_email"] = json!(at_limit);
        assert!(rejected_fields(&new_headers(), &body).is_empty());

        body["user_email"] = json!(format!("a{at_limit}"));
        assert!(rejected_fields(&new_headers(), &body).contains(&"user_email".to_string()));
    }

    #[test]
    fn base_url_is_limited_to_2048_characters() {
        let mut body = base_body();
        let prefix = "https://x.com/";
        let at_limit = format!("{prefix}{}", "p".repeat(2048 - prefix.len()));
        body["base_url"] = json!(at_limit);
        assert!(rejected_fields(&new_headers(), &body).is_empty());

        body["base_url"] = json!(format!("{at_limit}p"));
        assert_eq!(rejected_fields(&new_headers(), &body), vec!["base_url"]);
    }

    #[test]
    fn base_url_must_be_http_or_https() {
        let mut body = base_body();
        body["base_url"] = json!("HTTP://x.com/a");
        assert!(rejected_fields(&new_headers(), &body).is_empty());

        for url in ["foo:bar", "ftp://x.com/file", "mailto:a@b.com"] {
            body["base_url"] = json!(url);
            let err = validate_message(&new_headers(), body.to_string().as_bytes()).unwrap_err();
            assert!(err.has_field("base_url"), "{url} accepted");
        }
    }

    #[test]
    fn crawl_result_and_error_message_are_1_to_10000_characters() {
        for (status, field) in [("COMPLETED", "crawl_result"), ("ERROR", "error_message")] {
            let h = update_headers(status);
            let mut body = base_body();

            body[field] = json!("r".repeat(10000));
            assert!(rejected_fields(&h, &body).is_empty(), "{field} at limit");

            body[field] = json!("r".repeat(10001));
            assert_eq!(rejected_fields(&h, &body), vec![field]);

            body[field] = json!("");
            assert_eq!(rejected_fields(&h, &body), vec![field]);
        }
    }

    #[test]
    fn non_json_body_is_rejected() {
        let h = headers(&[("status", "NEW"), ("timestamp", TS)]);
        let err = validate_message(&h, b"user_email=a@b.com").unwrap_err();
        assert!(err.has_field("body"));
    }

    #[test]
    fn malformed_trace_headers_are_warnings() {
        let h = headers(&[
            ("status", "NEW"),
            ("timestamp", TS),
            ("traceparent", "01-XYZ-bad"),
            ("tracestate", &"k=v,".repeat(200)),
        ]);
        let msg = validate_message(&h, base_body().to_string().as_bytes()).unwrap();
        assert!(msg.headers.traceparent.is_none());
        assert!(msg.headers.tracestate.is_none());
        assert_eq!(msg.headers.warnings.len(), 2);
    }

    #[test]
    fn offsetless_timestamps_are_utc() {
        let ts = parse_timestamp("2026-03-01T12:00:00").unwrap();
        assert_eq!(ts.to_rfc3339(), "2026-03-01T12:00:00+00:00");
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn basic_format_offsets_are_accepted() {
        let ts = parse_timestamp("2026-03-01T12:00:00+0000").unwrap();
        assert_eq!(ts.to_rfc3339(), "2026-03-01T12:00:00+00:00");
        let ts = parse_timestamp("2026-03-01T14:00:00.250+0200").unwrap();
        assert_eq!(ts.to_rfc3339(), "2026-03-01T12:00:00.250+00:00");
    }
}

//! Span and trace records kept by the [`Tracer`](super::Tracer).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Correlation context handed back to callers and passed into every span call.
///
/// An unsampled trace is represented by [`TraceContext::NONE`]; every tracer
/// operation treats it as a no-op. The type is `Copy` so passing it around
/// never allocates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TraceContext {
    ids: Option<(Uuid, Uuid)>,
}

impl TraceContext {
    /// The context of an unsampled or unknown trace.
    pub const NONE: TraceContext = TraceContext { ids: None };

    pub(crate) fn new(trace_id: Uuid, span_id: Uuid) -> Self {
        Self {
            ids: Some((trace_id, span_id)),
        }
    }

    /// Whether this context points at a recorded trace.
    pub fn is_sampled(&self) -> bool {
        self.ids.is_some()
    }

    /// Trace id, if sampled.
    pub fn trace_id(&self) -> Option<Uuid> {
        self.ids.map(|(trace, _)| trace)
    }

    /// Current span id, if sampled.
    pub fn span_id(&self) -> Option<Uuid> {
        self.ids.map(|(_, span)| span)
    }
}

impl fmt::Display for TraceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ids {
            Some((trace, span)) => write!(f, "{}/{}", trace, span),
            None => f.write_str("unsampled"),
        }
    }
}

/// Outcome of a span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpanStatus {
    /// Still open.
    Pending,
    /// Finished without error.
    Success,
    /// Finished with an error, or force-closed by the sweep.
    Error,
}

/// Lifecycle of a trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceStatus {
    /// Root span still open.
    Active,
    /// Root finished and no span ended in error.
    Completed,
    /// Root finished and at least one span ended in error, or the trace expired.
    Failed,
}

/// A timestamped line attached to a span.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpanLog {
    /// When the line was logged.
    pub timestamp: DateTime<Utc>,
    /// Message text.
    pub message: String,
    /// Structured fields.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub fields: HashMap<String, String>,
}

/// One unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Span {
    /// Span id.
    pub id: Uuid,
    /// Trace this span belongs to.
    pub trace_id: Uuid,
    /// Parent span, `None` for the root.
    pub parent_id: Option<Uuid>,
    /// Operation name.
    pub name: String,
    /// Start time.
    pub start_time: DateTime<Utc>,
    /// End time, set once at finish.
    pub end_time: Option<DateTime<Utc>>,
    /// `end_time - start_time` in milliseconds, set once at finish.
    pub duration_ms: Option<f64>,
    /// Tags.
    pub tags: HashMap<String, String>,
    /// Ordered log lines.
    pub logs: Vec<SpanLog>,
    /// Status.
    pub status: SpanStatus,
    /// Error message recorded at finish.
    pub error: Option<String>,
}

impl Span {
    pub(crate) fn open(
        trace_id: Uuid,
        parent_id: Option<Uuid>,
        name: &str,
        start_time: DateTime<Utc>,
        tags: HashMap<String, String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            trace_id,
            parent_id,
            name: name.to_string(),
            start_time,
            end_time: None,
            duration_ms: None,
            tags,
            logs: Vec::new(),
            status: SpanStatus::Pending,
            error: None,
        }
    }

    /// Whether the span has been finished.
    pub fn is_finished(&self) -> bool {
        self.end_time.is_some()
    }

    /// Closes the span. A finished span is left untouched.
    pub(crate) fn close(&mut self, at: DateTime<Utc>, status: SpanStatus, error: Option<String>) -> bool {
        if self.is_finished() {
            return false;
        }
        let end = at.max(self.start_time);
        self.end_time = Some(end);
        self.duration_ms = Some(crate::clock::elapsed_ms(self.start_time, end));
        self.status = match status {
            SpanStatus::Pending => SpanStatus::Success,
            other => other,
        };
        if let Some(error) = error {
            self.tags.insert("error".to_string(), "true".to_string());
            self.error = Some(error);
        }
        true
    }
}

/// Host-supplied attributes of a trace.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraceMetadata {
    /// Logical operation category.
    pub category: Option<String>,
    /// Id of the entity the operation works on.
    pub subject_id: Option<String>,
    /// Upstream correlation id.
    pub correlation_id: Option<String>,
}

/// A causally linked span tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trace {
    /// Trace id.
    pub id: Uuid,
    /// Root span id.
    pub root_span_id: Uuid,
    /// Operation name of the root span.
    pub operation: String,
    /// Spans by id.
    pub spans: HashMap<Uuid, Span>,
    /// Status.
    pub status: TraceStatus,
    /// Metadata.
    pub metadata: TraceMetadata,
    /// When the root span started.
    pub started_at: DateTime<Utc>,
    /// When the trace became completed or failed.
    pub finished_at: Option<DateTime<Utc>>,
}

impl Trace {
    /// Root span.
    pub fn root(&self) -> Option<&Span> {
        self.spans.get(&self.root_span_id)
    }

    /// Status derived from the contained spans.
    pub(crate) fn derived_status(&self) -> TraceStatus {
        if self.spans.values().any(|s| s.status == SpanStatus::Error) {
            TraceStatus::Failed
        } else {
            TraceStatus::Completed
        }
    }

    /// Duration of the root span in milliseconds, once finished.
    pub fn duration_ms(&self) -> Option<f64> {
        self.root().and_then(|root| root.duration_ms)
    }

    /// Exports the trace in the Jaeger JSON trace format.
    pub fn to_jaeger_json(&self) -> serde_json::Value {
        let mut spans: Vec<&Span> = self.spans.values().collect();
        spans.sort_by_key(|s| s.start_time);

        serde_json::json!({
            "traceID": self.id.simple().to_string(),
            "spans": spans.iter().map(|span| {
                let references = span.parent_id.map(|parent| vec![serde_json::json!({
                    "refType": "CHILD_OF",
                    "traceID": self.id.simple().to_string(),
                    "spanID": parent.simple().to_string(),
                })]).unwrap_or_default();
                let mut tags: Vec<serde_json::Value> = span.tags.iter().map(|(k, v)| {
                    serde_json::json!({ "key": k, "value": v, "type": "string" })
                }).collect();
                tags.push(serde_json::json!({
                    "key": "status",
                    "value": serde_json::to_value(span.status).unwrap_or_default(),
                    "type": "string"
                }));

                serde_json::json!({
                    "traceID": self.id.simple().to_string(),
                    "spanID": span.id.simple().to_string(),
                    "operationName": span.name,
                    "references": references,
                    "startTime": span.start_time.timestamp_micros(),
                    "duration": span.duration_ms.map(|ms| (ms * 1000.0) as i64).unwrap_or(0),
                    "tags": tags,
                    "logs": span.logs.iter().map(|log| {
                        let mut fields = vec![serde_json::json!({ "key": "event", "value": log.message })];
                        fields.extend(log.fields.iter().map(|(k, v)| serde_json::json!({ "key": k, "value": v })));
                        serde_json::json!({
                            "timestamp": log.timestamp.timestamp_micros(),
                            "fields": fields
                        })
                    }).collect::<Vec<_>>()
                })
            }).collect::<Vec<_>>()
        })
    }
}

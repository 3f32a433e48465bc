//! `tracing` layer that forwards host events into the log index.

use super::entry::{LogContext, LogEntry, LogLevel};
use super::LogIndex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::{Event, Subscriber};
use tracing_subscriber::{layer::Context, registry::LookupSpan, Layer};
use uuid::Uuid;

const OWN_TARGET: &str = "zola_telemetry";

/// Forwards every `tracing` event of the host into a [`LogIndex`].
///
/// Events emitted by the pipeline itself are skipped so indexing never feeds
/// back into the index. Entries are stamped by the index clock. The layer
/// holds a weak handle and stops forwarding once the index is dropped.
pub struct LogIndexLayer {
    index: Weak<LogIndex>,
}

impl LogIndexLayer {
    /// Create a layer feeding `index`
    pub fn new(index: &Arc<LogIndex>) -> Self {
        Self {
            index: Arc::downgrade(index),
        }
    }
}

impl<S> Layer<S> for LogIndexLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if metadata.target().starts_with(OWN_TARGET) {
            return;
        }
        let Some(index) = self.index.upgrade() else {
            return;
        };

        let mut visitor = FieldVisitor::new();
        event.record(&mut visitor);

        let mut context = LogContext::new();
        let mut fields = visitor.fields;
        if let Some(value) = fields.remove("trace_id") {
            context.trace_id = value.as_str().and_then(|s| Uuid::parse_str(s).ok());
        }
        for (key, slot) in [
            ("correlation_id", &mut context.correlation_id),
            ("category", &mut context.category),
            ("operation", &mut context.operation),
            ("subject_id", &mut context.subject_id),
        ] {
            if let Some(value) = fields.remove(key) {
                *slot = Some(match value {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                });
            }
        }
        fields.insert("target".to_string(), serde_json::Value::String(metadata.target().to_string()));
        if let Some(span) = ctx.lookup_current() {
            fields.insert("span".to_string(), serde_json::Value::String(span.name().to_string()));
        }
        context.fields = fields;

        let entry = LogEntry::new(
            LogLevel::from(metadata.level()),
            visitor.message.unwrap_or_default(),
            index.now(),
        )
        .with_context(context)
        .with_tag("tracing");
        index.ingest(entry);
    }
}

/// Visitor for extracting fields from tracing events
struct FieldVisitor {
    message: Option<String>,
    fields: HashMap<String, serde_json::Value>,
}

impl FieldVisitor {
    fn new() -> Self {
        Self {
            message: None,
            fields: HashMap::new(),
        }
    }
}

impl tracing::field::Visit for FieldVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        let value_str = format!("{:?}", value);

        if field.name() == "message" {
            self.message = Some(value_str);
        } else {
            self.fields.insert(field.name().to_string(), serde_json::Value::String(value_str));
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.fields.insert(field.name().to_string(), serde_json::Value::String(value.to_string()));
        }
    }

    fn record_i64(&mut self, field: &tracing::field::Field, value: i64) {
        self.fields.insert(field.name().to_string(), serde_json::Value::Number(value.into()));
    }

    fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
        self.fields.insert(field.name().to_string(), serde_json::Value::Number(value.into()));
    }

    fn record_f64(&mut self, field: &tracing::field::Field, value: f64) {
        if let Some(num) = serde_json::Number::from_f64(value) {
            self.fields.insert(field.name().to_string(), serde_json::Value::Number(num));
        }
    }

    fn record_bool(&mut self, field: &tracing::field::Field, value: bool) {
        self.fields.insert(field.name().to_string(), serde_json::Value::Bool(value));
    }
}

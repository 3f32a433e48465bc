//! Structured log entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Log level, ordered by importance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Very fine-grained diagnostics.
    Trace,
    /// Diagnostics.
    Debug,
    /// Normal operation.
    Info,
    /// Something unexpected that was handled.
    Warn,
    /// A failed operation.
    Error,
    /// A failure that needs attention now.
    Critical,
}

impl LogLevel {
    /// Every level, lowest first.
    pub const ALL: [LogLevel; 6] = [
        LogLevel::Trace,
        LogLevel::Debug,
        LogLevel::Info,
        LogLevel::Warn,
        LogLevel::Error,
        LogLevel::Critical,
    ];

    /// Returns a static string representation of the level.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Critical => "critical",
        }
    }

    /// Whether the level counts as an error in window statistics.
    pub fn is_error(&self) -> bool {
        *self >= LogLevel::Error
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&tracing::Level> for LogLevel {
    fn from(level: &tracing::Level) -> Self {
        match *level {
            tracing::Level::TRACE => LogLevel::Trace,
            tracing::Level::DEBUG => LogLevel::Debug,
            tracing::Level::INFO => LogLevel::Info,
            tracing::Level::WARN => LogLevel::Warn,
            _ => LogLevel::Error,
        }
    }
}

/// Identifiers and attributes of the operation that emitted an entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogContext {
    /// Trace the entry belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<Uuid>,
    /// Span the entry was emitted in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span_id: Option<Uuid>,
    /// Upstream correlation id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Operation category.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// Operation name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    /// Id of the entity the operation works on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_id: Option<String>,
    /// When the operation started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_started_at: Option<DateTime<Utc>>,
    /// Additional fields.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub fields: HashMap<String, serde_json::Value>,
}

impl LogContext {
    /// Create new empty log context
    pub fn new() -> Self {
        Self::default()
    }

    /// Set trace and span ids
    pub fn with_trace(mut self, trace_id: Option<Uuid>, span_id: Option<Uuid>) -> Self {
        self.trace_id = trace_id;
        self.span_id = span_id;
        self
    }

    /// Set correlation ID
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Set category
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    /// Set operation name
    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }

    /// Set subject id
    pub fn with_subject(mut self, subject_id: impl Into<String>) -> Self {
        self.subject_id = Some(subject_id.into());
        self
    }

    /// Add custom field
    pub fn with_field(mut self, key: &str, value: serde_json::Value) -> Self {
        self.fields.insert(key.to_string(), value);
        self
    }
}

/// Error details attached to an entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogError {
    /// Error kind.
    pub kind: String,
    /// Error message.
    pub message: String,
    /// Tracked error fingerprint, when the error tracker saw it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    /// Stack or backtrace text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

/// Timing details attached to an entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogPerformance {
    /// Elapsed time (ms).
    pub duration_ms: f64,
    /// Process memory change.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_delta_bytes: Option<i64>,
}

/// One log line. Immutable once ingested.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// Sequence number assigned at ingestion.
    #[serde(default)]
    pub id: u64,
    /// When the entry was emitted.
    pub timestamp: DateTime<Utc>,
    /// Level.
    pub level: LogLevel,
    /// Message.
    pub message: String,
    /// Context.
    #[serde(default)]
    pub context: LogContext,
    /// Error block.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<LogError>,
    /// Performance block.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub performance: Option<LogPerformance>,
    /// Tags.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl LogEntry {
    /// A new entry with an empty context.
    pub fn new(level: LogLevel, message: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: 0,
            timestamp,
            level,
            message: message.into(),
            context: LogContext::default(),
            error: None,
            performance: None,
            tags: Vec::new(),
        }
    }

    /// Sets the context.
    pub fn with_context(mut self, context: LogContext) -> Self {
        self.context = context;
        self
    }

    /// Sets the error block.
    pub fn with_error(mut self, kind: impl Into<String>, message: impl Into<String>) -> Self {
        self.error = Some(LogError {
            kind: kind.into(),
            message: message.into(),
            fingerprint: None,
            stack: None,
        });
        self
    }

    /// Sets the performance block.
    pub fn with_performance(mut self, duration_ms: f64, memory_delta_bytes: Option<i64>) -> Self {
        self.performance = Some(LogPerformance {
            duration_ms,
            memory_delta_bytes,
        });
        self
    }

    /// Adds a tag.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Correlation keys the entry is indexed under: the trace id and the correlation id.
    pub(crate) fn correlation_keys(&self) -> impl Iterator<Item = String> + '_ {
        self.context
            .trace_id
            .map(|id| id.to_string())
            .into_iter()
            .chain(self.context.correlation_id.clone())
    }

    /// Case-insensitive substring match over the message and error text.
    pub(crate) fn contains_text(&self, needle_lower: &str) -> bool {
        self.message.to_lowercase().contains(needle_lower)
            || self
                .error
                .as_ref()
                .is_some_and(|e| e.message.to_lowercase().contains(needle_lower) || e.kind.to_lowercase().contains(needle_lower))
    }
}

/// Hour bucket of a timestamp: whole hours since the Unix epoch.
pub(crate) fn hour_bucket(timestamp: DateTime<Utc>) -> i64 {
    timestamp.timestamp().div_euclid(3_600)
}

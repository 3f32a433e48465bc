//! Typed notification templates.
//!
//! A template is text with `{{field}}` placeholders. Placeholders are parsed
//! once into a closed set of [`Field`]s; unknown names are rejected when the
//! template is registered, so rendering cannot fail.

use super::channel::ChannelKind;
use super::NotifyEvent;
use crate::error::{Error, Result};
use crate::events::{EventKind, Severity};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

/// A value a placeholder can refer to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    /// `alert` or `error`.
    Kind,
    /// Highest severity.
    Severity,
    /// Title of the first event.
    Title,
    /// Message of the first event.
    Message,
    /// Alert rule id or error kind.
    Source,
    /// Operation category.
    Category,
    /// Operation name.
    Operation,
    /// Id of the first event.
    EventId,
    /// Render time, RFC 3339.
    Timestamp,
    /// Observed value of an alert.
    Value,
    /// Threshold of an alert.
    Threshold,
    /// Condition of an alert.
    Condition,
    /// Occurrence count of an error.
    Occurrences,
    /// Events in the notification.
    Count,
    /// One line per event.
    Events,
    /// Escalation level.
    EscalationLevel,
}

impl Field {
    const ALL: [(&'static str, Field); 16] = [
        ("kind", Field::Kind),
        ("severity", Field::Severity),
        ("title", Field::Title),
        ("message", Field::Message),
        ("source", Field::Source),
        ("category", Field::Category),
        ("operation", Field::Operation),
        ("event_id", Field::EventId),
        ("timestamp", Field::Timestamp),
        ("value", Field::Value),
        ("threshold", Field::Threshold),
        ("condition", Field::Condition),
        ("occurrences", Field::Occurrences),
        ("count", Field::Count),
        ("events", Field::Events),
        ("escalation_level", Field::EscalationLevel),
    ];

    /// Looks up a placeholder name.
    pub fn from_name(name: &str) -> Option<Field> {
        Self::ALL.iter().find(|(n, _)| *n == name).map(|(_, f)| *f)
    }

    /// Placeholder name.
    pub fn name(&self) -> &'static str {
        Self::ALL
            .iter()
            .find(|(_, f)| f == self)
            .map(|(n, _)| *n)
            .unwrap_or("unknown")
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Text(String),
    Field(Field),
}

/// A parsed template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Template {
    source: String,
    segments: Vec<Segment>,
}

impl Template {
    /// Parses `{{field}}` placeholders.
    pub fn parse(source: &str) -> Result<Self> {
        let mut segments = Vec::new();
        let mut rest = source;
        while let Some(open) = rest.find("{{") {
            if open > 0 {
                segments.push(Segment::Text(rest[..open].to_string()));
            }
            let after = &rest[open + 2..];
            let close = after
                .find("}}")
                .ok_or_else(|| Error::template(format!("unterminated placeholder in '{}'", source)))?;
            let name = after[..close].trim();
            let field = Field::from_name(name)
                .ok_or_else(|| Error::template(format!("unknown placeholder '{{{{{}}}}}'", name)))?;
            segments.push(Segment::Field(field));
            rest = &after[close + 2..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Text(rest.to_string()));
        }
        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    /// Template text as registered.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Renders against `context`.
    pub fn render(&self, context: &TemplateContext) -> String {
        let mut out = String::with_capacity(self.source.len() + 64);
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => out.push_str(text),
                Segment::Field(field) => out.push_str(&context.value(*field)),
            }
        }
        out
    }
}

impl TryFrom<String> for Template {
    type Error = Error;

    fn try_from(source: String) -> Result<Self> {
        Template::parse(&source)
    }
}

impl From<Template> for String {
    fn from(template: Template) -> Self {
        template.source
    }
}

/// Subject and body templates for one (event kind, channel kind) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationTemplate {
    /// Event kind the template applies to.
    pub event_kind: EventKind,
    /// Channel kind, or `None` for every channel without a more specific template.
    #[serde(default)]
    pub channel_kind: Option<ChannelKind>,
    /// Subject template.
    pub subject: Template,
    /// Body template.
    pub body: Template,
}

impl NotificationTemplate {
    /// Parses both parts.
    pub fn new(event_kind: EventKind, channel_kind: Option<ChannelKind>, subject: &str, body: &str) -> Result<Self> {
        Ok(Self {
            event_kind,
            channel_kind,
            subject: Template::parse(subject)?,
            body: Template::parse(body)?,
        })
    }
}

/// Everything a template can refer to.
#[derive(Debug, Clone)]
pub struct TemplateContext {
    kind: EventKind,
    severity: Severity,
    title: String,
    message: String,
    source: String,
    category: Option<String>,
    operation: Option<String>,
    event_id: String,
    timestamp: DateTime<Utc>,
    value: Option<f64>,
    threshold: Option<f64>,
    condition: Option<String>,
    occurrences: Option<u64>,
    lines: Vec<String>,
    escalation_level: u32,
}

impl TemplateContext {
    /// Builds the context of a notification from its events. The first event
    /// supplies the single-event fields.
    pub(crate) fn new(events: &[NotifyEvent], escalation_level: u32, timestamp: DateTime<Utc>) -> Self {
        let first = events.first();
        Self {
            kind: first.map_or(EventKind::Alert, |e| e.kind),
            severity: events.iter().map(|e| e.severity).max().unwrap_or_default(),
            title: first.map(|e| e.title.clone()).unwrap_or_default(),
            message: first.map(|e| e.message.clone()).unwrap_or_default(),
            source: first.map(|e| e.source.clone()).unwrap_or_default(),
            category: first.and_then(|e| e.category.clone()),
            operation: first.and_then(|e| e.operation.clone()),
            event_id: first.map(|e| e.id.clone()).unwrap_or_default(),
            timestamp,
            value: first.and_then(|e| e.value),
            threshold: first.and_then(|e| e.threshold),
            condition: first.and_then(|e| e.condition.clone()),
            occurrences: first.and_then(|e| e.occurrences),
            lines: events
                .iter()
                .map(|e| format!("- [{}] {}: {}", e.severity, e.title, e.message))
                .collect(),
            escalation_level,
        }
    }

    /// Kind of the first event.
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Number of events.
    pub fn count(&self) -> usize {
        self.lines.len()
    }

    /// Highest severity.
    pub fn severity(&self) -> Severity {
        self.severity
    }

    fn value(&self, field: Field) -> String {
        fn opt(value: &Option<String>) -> String {
            value.clone().unwrap_or_else(|| "-".to_string())
        }
        match field {
            Field::Kind => self.kind.as_str().to_string(),
            Field::Severity => self.severity.to_string(),
            Field::Title => self.title.clone(),
            Field::Message => self.message.clone(),
            Field::Source => self.source.clone(),
            Field::Category => opt(&self.category),
            Field::Operation => opt(&self.operation),
            Field::EventId => self.event_id.clone(),
            Field::Timestamp => self.timestamp.to_rfc3339(),
            Field::Value => self.value.map_or_else(|| "-".to_string(), |v| format!("{:.2}", v)),
            Field::Threshold => self.threshold.map_or_else(|| "-".to_string(), |v| format!("{}", v)),
            Field::Condition => opt(&self.condition),
            Field::Occurrences => self.occurrences.map_or_else(|| "-".to_string(), |v| v.to_string()),
            Field::Count => self.count().to_string(),
            Field::Events => self.lines.join("\n"),
            Field::EscalationLevel => self.escalation_level.to_string(),
        }
    }

    /// Subject used when no template is registered.
    pub fn default_subject(&self) -> String {
        let mut subject = format!("[{}] ", self.severity.as_str().to_uppercase());
        if self.count() > 1 {
            let _ = write!(subject, "{} grouped {}s: {}", self.count(), self.kind.as_str(), self.title);
        } else {
            let _ = write!(subject, "{}: {}", self.kind.as_str(), self.title);
        }
        subject
    }

    /// Body used when no template is registered.
    pub fn default_body(&self) -> String {
        if self.count() > 1 {
            return format!("{} events between detection and flush:\n{}", self.count(), self.lines.join("\n"));
        }
        let mut body = self.message.clone();
        if let Some(operation) = &self.operation {
            let _ = write!(body, "\noperation: {}", operation);
        }
        if let Some(category) = &self.category {
            let _ = write!(body, "\ncategory: {}", category);
        }
        let _ = write!(body, "\nsource: {}\nid: {}", self.source, self.event_id);
        body
    }
}

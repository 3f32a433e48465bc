//! Events exchanged between producers and the notification engine.
//!
//! Producers (alert evaluation, error tracking) never call the notification
//! engine directly. They push a [`PipelineEvent`] into a bounded queue through
//! an [`EventSink`], and one dispatcher task drains the queue in order.

use crate::error_tracker::ErrorCategory;
use async_channel::{bounded, Receiver, Sender, TrySendError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Severity shared by alert rules, tracked errors and channel filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational, no action expected.
    Low,
    /// Default severity.
    Medium,
    /// Needs attention soon.
    High,
    /// Needs attention now.
    Critical,
}

impl Severity {
    /// Returns a static string representation of the severity.
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl Default for Severity {
    fn default() -> Self {
        Severity::Medium
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of source event a notification was created for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A threshold alert from the metric aggregator.
    Alert,
    /// A tracked error from the error tracker.
    Error,
}

impl EventKind {
    /// Returns a static string representation of the event kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Alert => "alert",
            EventKind::Error => "error",
        }
    }
}

/// A fired alert rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertEvent {
    /// Unique id of this firing; acknowledgment and escalation key on it.
    pub id: String,
    /// Rule that fired.
    pub rule_id: String,
    /// Human-readable rule name.
    pub rule_name: String,
    /// Rule severity.
    pub severity: Severity,
    /// Condition that was evaluated, e.g. `mean_duration`.
    pub condition: String,
    /// Comparison operator, e.g. `>`.
    pub operator: String,
    /// Threshold the value was compared against.
    pub threshold: f64,
    /// Observed value.
    pub value: f64,
    /// Evaluation window in seconds.
    pub window_secs: u64,
    /// Operation scope of the rule, if any.
    pub operation: Option<String>,
    /// Category scope of the rule, if any.
    pub category: Option<String>,
    /// Samples that contributed to the value.
    pub sample_count: usize,
    /// When the rule fired.
    pub fired_at: DateTime<Utc>,
}

impl AlertEvent {
    /// One-line description used by generic templates.
    pub fn summary(&self) -> String {
        format!(
            "{}: {} {} {} (observed {:.2} over {}s, {} samples)",
            self.rule_name,
            self.condition,
            self.operator,
            self.threshold,
            self.value,
            self.window_secs,
            self.sample_count
        )
    }
}

/// Why the error tracker emitted an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorEventReason {
    /// First occurrence of a fingerprint.
    New,
    /// A resolved error occurred again.
    Reopened,
    /// Occurrences inside the burst window crossed the threshold.
    Burst,
}

/// A tracked error worth notifying about.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEvent {
    /// Tracked error id; acknowledgment and escalation key on it.
    pub error_id: String,
    /// Deduplication fingerprint.
    pub fingerprint: String,
    /// Reason for emission.
    pub reason: ErrorEventReason,
    /// Error kind (type name).
    pub kind: String,
    /// Latest message.
    pub message: String,
    /// Classified category.
    pub category: ErrorCategory,
    /// Classified severity.
    pub severity: Severity,
    /// Operation the error occurred in, if known.
    pub operation: Option<String>,
    /// Operation category, if known.
    pub operation_category: Option<String>,
    /// Occurrence count at emission time.
    pub occurrence_count: u64,
    /// When the triggering occurrence happened.
    pub occurred_at: DateTime<Utc>,
}

/// Everything the dispatcher consumes.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// An alert rule fired.
    Alert(AlertEvent),
    /// An error needs notification.
    Error(ErrorEvent),
    /// A tracked error was resolved; pending escalations for it must stop.
    ErrorResolved {
        /// Tracked error id.
        error_id: String,
        /// Who resolved it.
        by: String,
    },
}

/// Producer handle onto the bounded event queue.
///
/// Emitting never blocks: a full queue drops the event and counts it.
#[derive(Clone)]
pub struct EventSink {
    sender: Option<Sender<PipelineEvent>>,
    dropped: Arc<AtomicU64>,
}

impl EventSink {
    /// Creates a bounded queue and returns both ends.
    pub fn channel(capacity: usize) -> (Self, Receiver<PipelineEvent>) {
        let (sender, receiver) = bounded(capacity.max(1));
        (
            Self {
                sender: Some(sender),
                dropped: Arc::new(AtomicU64::new(0)),
            },
            receiver,
        )
    }

    /// A sink that discards everything; used by components running standalone.
    pub fn disconnected() -> Self {
        Self {
            sender: None,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Pushes an event without waiting. Returns whether it was queued.
    pub fn emit(&self, event: PipelineEvent) -> bool {
        let Some(sender) = &self.sender else {
            return false;
        };
        match sender.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                crate::utils::metrics::record_event_dropped(event_label(&event));
                warn!(event = event_label(&event), "Event queue full, dropping event");
                false
            }
            Err(TrySendError::Closed(event)) => {
                debug!(event = event_label(&event), "Event queue closed, discarding event");
                false
            }
        }
    }

    /// Events dropped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Current queue depth and capacity, if connected.
    pub fn depth(&self) -> Option<(usize, usize)> {
        self.sender
            .as_ref()
            .map(|s| (s.len(), s.capacity().unwrap_or(usize::MAX)))
    }
}

fn event_label(event: &PipelineEvent) -> &'static str {
    match event {
        PipelineEvent::Alert(_) => "alert",
        PipelineEvent::Error(_) => "error",
        PipelineEvent::ErrorResolved { .. } => "error_resolved",
    }
}

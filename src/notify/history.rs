//! Append-only audit trail of notification actions.

use crate::events::EventKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryAction {
    /// An event entered the engine.
    Triggered,
    /// A suppression rule dropped the event.
    Suppressed,
    /// The event was buffered into a group.
    Grouped,
    /// A group was sent as one notification.
    GroupFlushed,
    /// A channel accepted a notification.
    Delivered,
    /// A channel failed after the last attempt.
    DeliveryFailed,
    /// A channel was skipped because of its rate limit.
    RateLimited,
    /// An escalation was sent.
    Escalated,
    /// Someone acknowledged the event.
    Acknowledged,
    /// The event was resolved.
    Resolved,
}

/// One immutable history record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Monotonic sequence number.
    pub seq: u64,
    /// When it happened.
    pub at: DateTime<Utc>,
    /// Action.
    pub action: HistoryAction,
    /// Alert or error id.
    pub event_id: String,
    /// Event kind.
    pub event_kind: EventKind,
    /// Person or component that acted.
    pub actor: Option<String>,
    /// Channel involved.
    pub channel_id: Option<String>,
    /// Notification involved.
    pub notification_id: Option<String>,
    /// Rule or group involved.
    pub rule_id: Option<String>,
    /// Trigger-to-acknowledgment time, on acknowledgments.
    pub response_ms: Option<u64>,
    /// Free text.
    pub details: Option<String>,
}

impl HistoryEntry {
    pub(crate) fn new(action: HistoryAction, event_id: &str, event_kind: EventKind, at: DateTime<Utc>) -> Self {
        Self {
            seq: 0,
            at,
            action,
            event_id: event_id.to_string(),
            event_kind,
            actor: None,
            channel_id: None,
            notification_id: None,
            rule_id: None,
            response_ms: None,
            details: None,
        }
    }

    pub(crate) fn actor(mut self, actor: &str) -> Self {
        self.actor = Some(actor.to_string());
        self
    }

    pub(crate) fn channel(mut self, channel_id: &str) -> Self {
        self.channel_id = Some(channel_id.to_string());
        self
    }

    pub(crate) fn notification(mut self, notification_id: &str) -> Self {
        self.notification_id = Some(notification_id.to_string());
        self
    }

    pub(crate) fn rule(mut self, rule_id: &str) -> Self {
        self.rule_id = Some(rule_id.to_string());
        self
    }

    pub(crate) fn details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// Acknowledgment response times.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseStats {
    /// Acknowledged events in the retained history.
    pub acknowledged: usize,
    /// Mean trigger-to-acknowledgment time.
    pub avg_response_ms: Option<f64>,
    /// Fastest response.
    pub min_response_ms: Option<u64>,
    /// Slowest response.
    pub max_response_ms: Option<u64>,
}

/// Bounded history. Entries are shared, never mutated; the oldest fall off.
pub(crate) struct History {
    entries: VecDeque<Arc<HistoryEntry>>,
    capacity: usize,
    next_seq: u64,
}

impl History {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: capacity.max(1),
            next_seq: 1,
        }
    }

    pub(crate) fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        self.trim();
    }

    fn trim(&mut self) {
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
    }

    pub(crate) fn push(&mut self, mut entry: HistoryEntry) {
        entry.seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push_back(Arc::new(entry));
        self.trim();
    }

    /// Newest first, optionally for one event.
    pub(crate) fn query(&self, event_id: Option<&str>, limit: usize) -> Vec<HistoryEntry> {
        self.entries
            .iter()
            .rev()
            .filter(|e| event_id.map_or(true, |id| e.event_id == id))
            .take(limit)
            .map(|e| HistoryEntry::clone(e))
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn response_stats(&self) -> ResponseStats {
        let times: Vec<u64> = self
            .entries
            .iter()
            .filter(|e| e.action == HistoryAction::Acknowledged)
            .filter_map(|e| e.response_ms)
            .collect();
        if times.is_empty() {
            return ResponseStats::default();
        }
        ResponseStats {
            acknowledged: times.len(),
            avg_response_ms: Some(times.iter().sum::<u64>() as f64 / times.len() as f64),
            min_response_ms: times.iter().min().copied(),
            max_response_ms: times.iter().max().copied(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ack(event_id: &str, response_ms: u64) -> HistoryEntry {
        let mut entry = HistoryEntry::new(HistoryAction::Acknowledged, event_id, EventKind::Alert, Utc::now()).actor("ops");
        entry.response_ms = Some(response_ms);
        entry
    }

    #[test]
    fn test_bounded_and_sequenced() {
        let mut history = History::new(3);
        for i in 0..5 {
            history.push(HistoryEntry::new(HistoryAction::Triggered, &format!("a-{}", i), EventKind::Alert, Utc::now()));
        }
        assert_eq!(history.len(), 3);
        let newest = history.query(None, 10);
        assert_eq!(newest[0].event_id, "a-4");
        assert_eq!(newest[0].seq, 5);
        assert_eq!(newest[2].event_id, "a-2");
        assert_eq!(history.query(Some("a-3"), 10).len(), 1);
    }

    #[test]
    fn test_response_stats_average() {
        let mut history = History::new(10);
        assert_eq!(history.response_stats(), ResponseStats::default());
        history.push(ack("a-1", 1_000));
        history.push(ack("a-2", 3_000));
        let stats = history.response_stats();
        assert_eq!(stats.acknowledged, 2);
        assert_eq!(stats.avg_response_ms, Some(2_000.0));
        assert_eq!(stats.min_response_ms, Some(1_000));
        assert_eq!(stats.max_response_ms, Some(3_000));
    }
}

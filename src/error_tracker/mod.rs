//! Error tracker.
//!
//! Failures reported by the host are classified, fingerprinted and folded into
//! one [`TrackedError`] per fingerprint. Repeats bump the occurrence count of
//! the existing group instead of creating a new one. New, reopened and bursting
//! errors are announced on the pipeline event queue; a periodic sweep resolves
//! quiet errors and purges old resolved ones.

mod classify;
mod fingerprint;

pub use classify::{classify_category, classify_severity, ErrorCategory};
pub use fingerprint::{normalize_message, stack_signature, Fingerprinter};

use crate::clock::{to_chrono, SharedClock};
use crate::config::ErrorTrackingConfig;
use crate::error::{Error, Result};
use crate::events::{ErrorEvent, ErrorEventReason, EventSink, PipelineEvent, Severity};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tracing::{debug, info};
use uuid::Uuid;

const RESOLVED_BY_SYSTEM: &str = "system";
const MAX_RECENT_TIMESTAMPS: usize = 10_000;
const DASHBOARD_LIST_LEN: usize = 10;

/// A failure as reported by the host.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorReport {
    /// Error type name.
    pub kind: String,
    /// Error message.
    pub message: String,
    /// Stack or backtrace text.
    #[serde(default)]
    pub stack: Option<String>,
}

impl ErrorReport {
    /// A report without a stack.
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            stack: None,
        }
    }

    /// Builds a report from any error, using its type name as the kind.
    pub fn from_error<E: std::error::Error>(error: &E) -> Self {
        let type_name = std::any::type_name::<E>();
        let kind = type_name.rsplit("::").next().unwrap_or(type_name);
        Self::new(kind, error.to_string())
    }

    /// Attaches a stack.
    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}

/// Where a failure happened.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorContext {
    /// Operation name.
    #[serde(default)]
    pub operation: Option<String>,
    /// Operation category.
    #[serde(default)]
    pub category: Option<String>,
    /// Entity the operation worked on.
    #[serde(default)]
    pub subject_id: Option<String>,
    /// Acting user.
    #[serde(default)]
    pub user_id: Option<String>,
    /// Trace the operation ran under.
    #[serde(default)]
    pub trace_id: Option<Uuid>,
    /// Upstream correlation id.
    #[serde(default)]
    pub correlation_id: Option<String>,
}

/// Resolution state of a tracked error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorStatus {
    /// Still occurring or not yet looked at.
    Open,
    /// Marked resolved by a person or by the sweep.
    Resolved,
}

/// Who resolved an error and when.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resolution {
    /// Resolver.
    pub by: String,
    /// Resolution time.
    pub at: DateTime<Utc>,
    /// Free-form notes.
    pub notes: Option<String>,
}

/// One recorded occurrence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Occurrence {
    /// When it happened.
    pub at: DateTime<Utc>,
    /// Message as reported.
    pub message: String,
    /// Entity the operation worked on.
    pub subject_id: Option<String>,
    /// Acting user.
    pub user_id: Option<String>,
    /// Trace id.
    pub trace_id: Option<Uuid>,
    /// Correlation id.
    pub correlation_id: Option<String>,
}

/// Hour-over-hour direction of occurrences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorTrend {
    /// More occurrences in the last hour.
    Increasing,
    /// Within the band.
    Stable,
    /// Fewer occurrences in the last hour.
    Decreasing,
}

/// A deduplicated error group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedError {
    /// Tracked error id.
    pub id: String,
    /// Fingerprint.
    pub fingerprint: String,
    /// Error kind.
    pub kind: String,
    /// Latest message.
    pub message: String,
    /// Normalized message the fingerprint was built from.
    pub normalized_message: String,
    /// Category.
    pub category: ErrorCategory,
    /// Severity.
    pub severity: Severity,
    /// Resolution state.
    pub status: ErrorStatus,
    /// First occurrence.
    pub first_seen: DateTime<Utc>,
    /// Latest occurrence.
    pub last_seen: DateTime<Utc>,
    /// Total occurrences.
    pub occurrence_count: u64,
    /// Operation category the error was first seen in.
    pub operation_category: Option<String>,
    /// Operations the error occurred in.
    pub operations: BTreeSet<String>,
    /// Entities affected.
    pub affected_subjects: BTreeSet<String>,
    /// Users affected.
    pub affected_users: BTreeSet<String>,
    /// Reports whose operation, subject or user was not remembered because
    /// the matching set was full.
    #[serde(default)]
    pub affected_overflow: AffectedOverflow,
    /// Latest occurrences, oldest first.
    pub occurrences: VecDeque<Occurrence>,
    /// Resolution, while resolved.
    pub resolution: Option<Resolution>,
    /// Times the error came back after being resolved.
    pub reopen_count: u32,
    /// Last time a burst was announced.
    pub last_burst_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    recent: VecDeque<DateTime<Utc>>,
}

impl TrackedError {
    fn prune_recent(&mut self, now: DateTime<Utc>, keep: ChronoDuration) {
        let cutoff = now - keep;
        while self.recent.front().is_some_and(|t| *t < cutoff) {
            self.recent.pop_front();
        }
        while self.recent.len() > MAX_RECENT_TIMESTAMPS {
            self.recent.pop_front();
        }
    }

    fn count_since(&self, since: DateTime<Utc>) -> usize {
        self.recent.iter().rev().take_while(|t| **t >= since).count()
    }

    fn count_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> usize {
        self.recent.iter().filter(|t| **t >= from && **t < to).count()
    }

    fn summary(&self) -> ErrorSummary {
        ErrorSummary {
            id: self.id.clone(),
            kind: self.kind.clone(),
            message: self.message.clone(),
            category: self.category,
            severity: self.severity,
            status: self.status,
            occurrence_count: self.occurrence_count,
            last_seen: self.last_seen,
        }
    }
}

/// Values left out of the bounded affected sets of a [`TrackedError`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AffectedOverflow {
    /// Operations not remembered.
    pub operations: u64,
    /// Subjects not remembered.
    pub subjects: u64,
    /// Users not remembered.
    pub users: u64,
}

/// Filter for [`ErrorTracker::get_errors`]. Unset fields match everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorFilter {
    /// Resolution state.
    pub status: Option<ErrorStatus>,
    /// Category.
    pub category: Option<ErrorCategory>,
    /// Lowest severity.
    pub min_severity: Option<Severity>,
    /// Operation the error occurred in.
    pub operation: Option<String>,
    /// Seen at or after.
    pub since: Option<DateTime<Utc>>,
    /// Maximum results.
    pub limit: Option<usize>,
}

impl ErrorFilter {
    fn matches(&self, error: &TrackedError) -> bool {
        self.status.map_or(true, |s| s == error.status)
            && self.category.map_or(true, |c| c == error.category)
            && self.min_severity.map_or(true, |s| error.severity >= s)
            && self.operation.as_ref().map_or(true, |op| error.operations.contains(op))
            && self.since.map_or(true, |since| error.last_seen >= since)
    }
}

/// Compact row for dashboards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorSummary {
    /// Tracked error id.
    pub id: String,
    /// Kind.
    pub kind: String,
    /// Latest message.
    pub message: String,
    /// Category.
    pub category: ErrorCategory,
    /// Severity.
    pub severity: Severity,
    /// Status.
    pub status: ErrorStatus,
    /// Occurrences.
    pub occurrence_count: u64,
    /// Latest occurrence.
    pub last_seen: DateTime<Utc>,
}

/// Aggregated error overview.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorDashboard {
    /// Tracked groups.
    pub total: usize,
    /// Open groups.
    pub open: usize,
    /// Resolved groups.
    pub resolved: usize,
    /// Open groups per category.
    pub by_category: BTreeMap<ErrorCategory, usize>,
    /// Open groups per severity.
    pub by_severity: BTreeMap<Severity, usize>,
    /// Occurrences across all groups in the last hour.
    pub occurrences_last_hour: usize,
    /// Open groups with the most occurrences.
    pub top_errors: Vec<ErrorSummary>,
    /// Most recently seen groups.
    pub recent: Vec<ErrorSummary>,
    /// Open groups trending upward.
    pub increasing: Vec<ErrorSummary>,
}

/// Result of one lifecycle sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Errors resolved for being quiet.
    pub auto_resolved: usize,
    /// Resolved errors purged past retention.
    pub purged: usize,
}

/// Error tracker.
pub struct ErrorTracker {
    config: RwLock<ErrorTrackingConfig>,
    fingerprinter: RwLock<Fingerprinter>,
    clock: SharedClock,
    errors: DashMap<String, TrackedError>,
    by_id: DashMap<String, String>,
    // Eviction order: resolved groups by resolution time, then least recently seen
    resolved_order: Mutex<BTreeSet<(DateTime<Utc>, String)>>,
    recency: Mutex<LruCache<String, ()>>,
    sink: EventSink,
}

impl ErrorTracker {
    /// Creates a tracker that announces errors into `sink`.
    pub fn new(config: ErrorTrackingConfig, clock: SharedClock, sink: EventSink) -> Self {
        let fingerprinter = Fingerprinter::new(&config.fingerprint_salt);
        Self {
            config: RwLock::new(config),
            fingerprinter: RwLock::new(fingerprinter),
            clock,
            errors: DashMap::new(),
            by_id: DashMap::new(),
            resolved_order: Mutex::new(BTreeSet::new()),
            recency: Mutex::new(LruCache::unbounded()),
            sink,
        }
    }

    /// Replaces the configuration. A new salt changes fingerprints of future reports only.
    pub fn update_config(&self, config: ErrorTrackingConfig) {
        let salt_changed = config.fingerprint_salt != self.config.read().fingerprint_salt;
        if salt_changed {
            *self.fingerprinter.write() = Fingerprinter::new(&config.fingerprint_salt);
        }
        *self.config.write() = config;
    }

    /// Current configuration.
    pub fn config(&self) -> ErrorTrackingConfig {
        self.config.read().clone()
    }

    /// Computes the fingerprint a report would be grouped under.
    pub fn fingerprint(&self, report: &ErrorReport, context: &ErrorContext) -> String {
        let frames = self.config.read().stack_frames;
        let signature = report
            .stack
            .as_deref()
            .map(|s| stack_signature(s, frames))
            .unwrap_or_default();
        self.fingerprinter.read().fingerprint(
            &report.kind,
            &normalize_message(&report.message),
            &signature,
            context.operation.as_deref(),
            context.category.as_deref(),
        )
    }

    /// Records one failure. Returns the id of the tracked error group, or
    /// `None` while tracking is disabled.
    pub fn track_error(&self, report: &ErrorReport, context: &ErrorContext) -> Option<String> {
        let config = self.config.read().clone();
        if !config.enabled {
            return None;
        }
        let now = self.clock.now();
        let fingerprint = self.fingerprint(report, context);
        let category = classify_category(&report.kind, &report.message);
        let severity = classify_severity(&report.kind, &report.message);

        if !self.errors.contains_key(&fingerprint) && self.errors.len() >= config.max_errors {
            self.evict_one();
        }

        let occurrence = Occurrence {
            at: now,
            message: report.message.clone(),
            subject_id: context.subject_id.clone(),
            user_id: context.user_id.clone(),
            trace_id: context.trace_id,
            correlation_id: context.correlation_id.clone(),
        };
        let burst_window = to_chrono(config.burst_window());
        let keep = burst_window.max(ChronoDuration::hours(2));

        let mut reopened_from = None;
        let (id, event_reason, new_group) = match self.errors.entry(fingerprint.clone()) {
            Entry::Occupied(mut slot) => {
                let error = slot.get_mut();
                let mut reason = None;
                if error.status == ErrorStatus::Resolved {
                    error.status = ErrorStatus::Open;
                    reopened_from = error.resolution.take().map(|r| r.at);
                    error.reopen_count += 1;
                    reason = Some(ErrorEventReason::Reopened);
                }
                error.occurrence_count += 1;
                error.last_seen = now;
                error.message = report.message.clone();
                record_affected(error, context, config.max_affected_per_error);
                error.occurrences.push_back(occurrence);
                while error.occurrences.len() > config.max_occurrences_per_error {
                    error.occurrences.pop_front();
                }
                error.recent.push_back(now);
                error.prune_recent(now, keep);

                let in_window = error.count_since(now - burst_window);
                let burst_due = error
                    .last_burst_at
                    .map_or(true, |last| now - last >= burst_window);
                if reason.is_none() && in_window >= config.burst_threshold && burst_due {
                    error.last_burst_at = Some(now);
                    reason = Some(ErrorEventReason::Burst);
                }
                (error.id.clone(), reason, false)
            }
            Entry::Vacant(slot) => {
                let id = Uuid::new_v4().to_string();
                let mut error = TrackedError {
                    id: id.clone(),
                    fingerprint: fingerprint.clone(),
                    kind: report.kind.clone(),
                    message: report.message.clone(),
                    normalized_message: normalize_message(&report.message),
                    category,
                    severity,
                    status: ErrorStatus::Open,
                    first_seen: now,
                    last_seen: now,
                    occurrence_count: 1,
                    operation_category: context.category.clone(),
                    operations: BTreeSet::new(),
                    affected_subjects: BTreeSet::new(),
                    affected_users: BTreeSet::new(),
                    affected_overflow: AffectedOverflow::default(),
                    occurrences: VecDeque::from([occurrence]),
                    resolution: None,
                    reopen_count: 0,
                    last_burst_at: None,
                    recent: VecDeque::from([now]),
                };
                record_affected(&mut error, context, config.max_affected_per_error);
                slot.insert(error);
                self.by_id.insert(id.clone(), fingerprint.clone());
                let reason = (severity >= config.notify_min_severity).then_some(ErrorEventReason::New);
                (id, reason, true)
            }
        };

        if let Some(at) = reopened_from {
            self.resolved_order.lock().remove(&(at, fingerprint.clone()));
        }
        self.recency.lock().put(fingerprint.clone(), ());
        crate::utils::metrics::record_error_tracked(category.as_str(), new_group);
        if new_group {
            info!(error_id = %id, %fingerprint, category = category.as_str(), severity = %severity, "New error group");
        }

        if let Some(reason) = event_reason {
            if let Some(error) = self.errors.get(&fingerprint) {
                let event = ErrorEvent {
                    error_id: error.id.clone(),
                    fingerprint: error.fingerprint.clone(),
                    reason,
                    kind: error.kind.clone(),
                    message: error.message.clone(),
                    category: error.category,
                    severity: error.severity,
                    operation: context.operation.clone(),
                    operation_category: context.category.clone(),
                    occurrence_count: error.occurrence_count,
                    occurred_at: now,
                };
                drop(error);
                debug!(error_id = %id, ?reason, "Error event emitted");
                self.sink.emit(PipelineEvent::Error(event));
            }
        }
        Some(id)
    }

    /// Evicts the resolved group resolved longest ago, or else the group
    /// seen least recently.
    fn evict_one(&self) {
        let resolved = self.resolved_order.lock().pop_first().map(|(_, fingerprint)| fingerprint);
        let victim = resolved.or_else(|| self.recency.lock().pop_lru().map(|(fingerprint, _)| fingerprint));
        if let Some(fingerprint) = victim {
            if let Some(error) = self.remove_group(&fingerprint) {
                debug!(error_id = %error.id, status = ?error.status, "Error group evicted at capacity");
            }
        }
    }

    fn remove_group(&self, fingerprint: &str) -> Option<TrackedError> {
        let (_, error) = self.errors.remove(fingerprint)?;
        self.by_id.remove(&error.id);
        if let Some(resolution) = &error.resolution {
            self.resolved_order.lock().remove(&(resolution.at, fingerprint.to_string()));
        }
        self.recency.lock().pop(fingerprint);
        Some(error)
    }

    /// Marks an error resolved. Resolving an already resolved error is a no-op.
    pub fn resolve_error(&self, id: &str, by: &str, notes: Option<&str>) -> Result<TrackedError> {
        let fingerprint = self
            .by_id
            .get(id)
            .map(|f| f.value().clone())
            .ok_or_else(|| Error::not_found("error", id))?;
        let mut error = self
            .errors
            .get_mut(&fingerprint)
            .ok_or_else(|| Error::not_found("error", id))?;
        if error.status == ErrorStatus::Resolved {
            return Ok(error.clone());
        }
        let at = self.clock.now();
        error.status = ErrorStatus::Resolved;
        error.resolution = Some(Resolution {
            by: by.to_string(),
            at,
            notes: notes.map(str::to_string),
        });
        let resolved = error.clone();
        drop(error);
        self.resolved_order.lock().insert((at, fingerprint));

        info!(error_id = id, by, "Error resolved");
        self.sink.emit(PipelineEvent::ErrorResolved {
            error_id: id.to_string(),
            by: by.to_string(),
        });
        Ok(resolved)
    }

    /// One tracked error by id.
    pub fn get_error(&self, id: &str) -> Option<TrackedError> {
        let fingerprint = self.by_id.get(id)?.value().clone();
        self.errors.get(&fingerprint).map(|e| e.clone())
    }

    /// Tracked errors matching `filter`, most recently seen first.
    pub fn get_errors(&self, filter: &ErrorFilter) -> Vec<TrackedError> {
        let mut errors: Vec<TrackedError> = self
            .errors
            .iter()
            .filter(|e| filter.matches(e))
            .map(|e| e.value().clone())
            .collect();
        errors.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        if let Some(limit) = filter.limit {
            errors.truncate(limit);
        }
        errors
    }

    /// Case-insensitive search over message, kind, fingerprint and operations.
    pub fn search_errors(&self, text: &str) -> Vec<TrackedError> {
        let needle = text.trim().to_lowercase();
        if needle.is_empty() {
            return Vec::new();
        }
        let mut errors: Vec<TrackedError> = self
            .errors
            .iter()
            .filter(|e| {
                e.message.to_lowercase().contains(&needle)
                    || e.kind.to_lowercase().contains(&needle)
                    || e.fingerprint.starts_with(&needle)
                    || e.operations.iter().any(|op| op.to_lowercase().contains(&needle))
            })
            .map(|e| e.value().clone())
            .collect();
        errors.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        errors
    }

    /// Hour-over-hour trend of one error.
    pub fn trend(&self, id: &str) -> Option<ErrorTrend> {
        let fingerprint = self.by_id.get(id)?.value().clone();
        let error = self.errors.get(&fingerprint)?;
        Some(self.trend_of(&error))
    }

    fn trend_of(&self, error: &TrackedError) -> ErrorTrend {
        let band = self.config.read().trend_band_pct;
        let now = self.clock.now();
        let hour = ChronoDuration::hours(1);
        let last_hour = error.count_between(now - hour, now + ChronoDuration::milliseconds(1)) as f64;
        let prior_hour = error.count_between(now - hour - hour, now - hour) as f64;
        if prior_hour == 0.0 {
            return if last_hour > 0.0 {
                ErrorTrend::Increasing
            } else {
                ErrorTrend::Stable
            };
        }
        let change_pct = (last_hour - prior_hour) / prior_hour * 100.0;
        if change_pct > band {
            ErrorTrend::Increasing
        } else if change_pct < -band {
            ErrorTrend::Decreasing
        } else {
            ErrorTrend::Stable
        }
    }

    /// Aggregated overview for dashboards.
    pub fn dashboard(&self) -> ErrorDashboard {
        let now = self.clock.now();
        let errors: Vec<TrackedError> = self.errors.iter().map(|e| e.value().clone()).collect();
        let mut dashboard = ErrorDashboard {
            total: errors.len(),
            ..ErrorDashboard::default()
        };

        for error in &errors {
            dashboard.occurrences_last_hour += error.count_since(now - ChronoDuration::hours(1));
            match error.status {
                ErrorStatus::Open => {
                    dashboard.open += 1;
                    *dashboard.by_category.entry(error.category).or_insert(0) += 1;
                    *dashboard.by_severity.entry(error.severity).or_insert(0) += 1;
                    if self.trend_of(error) == ErrorTrend::Increasing {
                        dashboard.increasing.push(error.summary());
                    }
                }
                ErrorStatus::Resolved => dashboard.resolved += 1,
            }
        }

        let mut open: Vec<&TrackedError> = errors.iter().filter(|e| e.status == ErrorStatus::Open).collect();
        open.sort_by(|a, b| b.occurrence_count.cmp(&a.occurrence_count).then(b.last_seen.cmp(&a.last_seen)));
        dashboard.top_errors = open.iter().take(DASHBOARD_LIST_LEN).map(|e| e.summary()).collect();

        let mut recent: Vec<&TrackedError> = errors.iter().collect();
        recent.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        dashboard.recent = recent.iter().take(DASHBOARD_LIST_LEN).map(|e| e.summary()).collect();
        dashboard.increasing.truncate(DASHBOARD_LIST_LEN);
        dashboard
    }

    /// Resolves quiet errors and purges resolved errors past retention.
    pub fn sweep(&self) -> SweepReport {
        let (quiet_after, retention) = {
            let config = self.config.read();
            (to_chrono(config.auto_resolve_after()), to_chrono(config.retention()))
        };
        let now = self.clock.now();

        let quiet: Vec<String> = self
            .errors
            .iter()
            .filter(|e| e.status == ErrorStatus::Open && e.last_seen < now - quiet_after)
            .map(|e| e.id.clone())
            .collect();
        let mut report = SweepReport::default();
        for id in quiet {
            if let Ok(error) = self.resolve_error(&id, RESOLVED_BY_SYSTEM, Some("no occurrences within auto-resolve window")) {
                if error.resolution.as_ref().is_some_and(|r| r.by == RESOLVED_BY_SYSTEM) {
                    report.auto_resolved += 1;
                }
            }
        }

        let expired: Vec<String> = self
            .errors
            .iter()
            .filter(|e| {
                e.status == ErrorStatus::Resolved
                    && e.resolution.as_ref().map_or(e.last_seen, |r| r.at) < now - retention
            })
            .map(|e| e.key().clone())
            .collect();
        for fingerprint in expired {
            if self.remove_group(&fingerprint).is_some() {
                report.purged += 1;
            }
        }

        if report != SweepReport::default() {
            info!(auto_resolved = report.auto_resolved, purged = report.purged, "Error sweep complete");
        }
        report
    }

    /// Tracked error groups.
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// Whether nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Drops every tracked error.
    pub fn clear(&self) {
        self.errors.clear();
        self.by_id.clear();
        self.resolved_order.lock().clear();
        self.recency.lock().clear();
    }
}

fn record_affected(error: &mut TrackedError, context: &ErrorContext, cap: usize) {
    let overflow = &mut error.affected_overflow;
    if let Some(operation) = &context.operation {
        insert_bounded(&mut error.operations, operation, cap, &mut overflow.operations);
    }
    if let Some(subject) = &context.subject_id {
        insert_bounded(&mut error.affected_subjects, subject, cap, &mut overflow.subjects);
    }
    if let Some(user) = &context.user_id {
        insert_bounded(&mut error.affected_users, user, cap, &mut overflow.users);
    }
}

fn insert_bounded(set: &mut BTreeSet<String>, value: &str, cap: usize, overflow: &mut u64) {
    if set.contains(value) {
        return;
    }
    if set.len() < cap {
        set.insert(value.to_string());
    } else {
        *overflow += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use async_channel::Receiver;
    use std::sync::Arc;
    use std::time::Duration;

    fn tracker_with(config: ErrorTrackingConfig) -> (ErrorTracker, ManualClock, Receiver<PipelineEvent>) {
        let clock = ManualClock::at_epoch_2024();
        let (sink, receiver) = EventSink::channel(64);
        (ErrorTracker::new(config, Arc::new(clock.clone()), sink), clock, receiver)
    }

    fn tracker() -> (ErrorTracker, ManualClock, Receiver<PipelineEvent>) {
        tracker_with(ErrorTrackingConfig {
            fingerprint_salt: "test-salt".to_string(),
            notify_min_severity: Severity::Low,
            ..ErrorTrackingConfig::default()
        })
    }

    fn context(operation: &str, subject: &str) -> ErrorContext {
        ErrorContext {
            operation: Some(operation.to_string()),
            category: Some("users".to_string()),
            subject_id: Some(subject.to_string()),
            ..ErrorContext::default()
        }
    }

    fn reasons(receiver: &Receiver<PipelineEvent>) -> Vec<ErrorEventReason> {
        let mut reasons = Vec::new();
        while let Ok(event) = receiver.try_recv() {
            if let PipelineEvent::Error(event) = event {
                reasons.push(event.reason);
            }
        }
        reasons
    }

    #[test]
    fn test_same_error_twice_is_one_group() {
        let (tracker, _clock, receiver) = tracker();
        let first = tracker
            .track_error(&ErrorReport::new("NotFound", "user 42 not found"), &context("load_user", "42"))
            .unwrap();
        let second = tracker
            .track_error(&ErrorReport::new("NotFound", "user 7 not found"), &context("load_user", "7"))
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(tracker.len(), 1);
        let error = tracker.get_error(&first).unwrap();
        assert_eq!(error.occurrence_count, 2);
        assert_eq!(error.affected_subjects.len(), 2);
        assert_eq!(error.occurrences.len(), 2);
        assert_eq!(reasons(&receiver), vec![ErrorEventReason::New]);
    }

    #[test]
    fn test_new_error_below_notify_severity_is_silent() {
        let (tracker, _clock, receiver) = tracker_with(ErrorTrackingConfig {
            fingerprint_salt: "s".to_string(),
            notify_min_severity: Severity::High,
            ..ErrorTrackingConfig::default()
        });
        tracker.track_error(&ErrorReport::new("Odd", "something odd"), &ErrorContext::default());
        tracker.track_error(&ErrorReport::new("Upload", "upload failed"), &ErrorContext::default());
        assert_eq!(reasons(&receiver), vec![ErrorEventReason::New]);
    }

    #[test]
    fn test_burst_emitted_once_per_window() {
        let (tracker, clock, receiver) = tracker();
        let report = ErrorReport::new("Timeout", "request timed out");
        for _ in 0..7 {
            tracker.track_error(&report, &ErrorContext::default());
            clock.advance(Duration::from_secs(1));
        }
        assert_eq!(reasons(&receiver), vec![ErrorEventReason::New, ErrorEventReason::Burst]);

        clock.advance(Duration::from_secs(60));
        for _ in 0..5 {
            tracker.track_error(&report, &ErrorContext::default());
        }
        assert_eq!(reasons(&receiver), vec![ErrorEventReason::Burst]);
    }

    #[test]
    fn test_resolve_and_reopen() {
        let (tracker, _clock, receiver) = tracker();
        let report = ErrorReport::new("DbError", "deadlock detected");
        let id = tracker.track_error(&report, &ErrorContext::default()).unwrap();
        let resolved = tracker.resolve_error(&id, "alice", Some("index added")).unwrap();
        assert_eq!(resolved.status, ErrorStatus::Resolved);
        assert!(matches!(
            receiver.try_recv(),
            Ok(PipelineEvent::Error(_))
        ));
        assert!(matches!(
            receiver.try_recv(),
            Ok(PipelineEvent::ErrorResolved { ref by, .. }) if by == "alice"
        ));

        tracker.track_error(&report, &ErrorContext::default());
        let error = tracker.get_error(&id).unwrap();
        assert_eq!(error.status, ErrorStatus::Open);
        assert_eq!(error.reopen_count, 1);
        assert_eq!(error.occurrence_count, 2);
        assert_eq!(reasons(&receiver), vec![ErrorEventReason::Reopened]);

        assert!(matches!(tracker.resolve_error("missing", "bob", None), Err(Error::NotFound { .. })));
    }

    #[test]
    fn test_sweep_auto_resolves_then_purges() {
        let (tracker, clock, _receiver) = tracker();
        let id = tracker
            .track_error(&ErrorReport::new("Io", "disk full"), &ErrorContext::default())
            .unwrap();
        clock.advance(Duration::from_secs(8 * 24 * 3_600));

        let report = tracker.sweep();
        assert_eq!(report.auto_resolved, 1);
        let error = tracker.get_error(&id).unwrap();
        assert_eq!(error.resolution.unwrap().by, "system");

        clock.advance(Duration::from_secs(31 * 24 * 3_600));
        assert_eq!(tracker.sweep().purged, 1);
        assert!(tracker.get_error(&id).is_none());
    }

    #[test]
    fn test_capacity_evicts_resolved_first() {
        let (tracker, clock, _receiver) = tracker_with(ErrorTrackingConfig {
            fingerprint_salt: "s".to_string(),
            max_errors: 2,
            ..ErrorTrackingConfig::default()
        });
        let a = tracker.track_error(&ErrorReport::new("A", "alpha"), &ErrorContext::default()).unwrap();
        clock.advance(Duration::from_secs(1));
        let b = tracker.track_error(&ErrorReport::new("B", "beta"), &ErrorContext::default()).unwrap();
        tracker.resolve_error(&b, "ops", None).unwrap();
        clock.advance(Duration::from_secs(1));
        let c = tracker.track_error(&ErrorReport::new("C", "gamma"), &ErrorContext::default()).unwrap();

        assert_eq!(tracker.len(), 2);
        assert!(tracker.get_error(&a).is_some());
        assert!(tracker.get_error(&b).is_none());
        assert!(tracker.get_error(&c).is_some());
    }

    #[test]
    fn test_capacity_evicts_least_recently_seen_open_group() {
        let (tracker, clock, _receiver) = tracker_with(ErrorTrackingConfig {
            fingerprint_salt: "s".to_string(),
            max_errors: 3,
            ..ErrorTrackingConfig::default()
        });
        let a = tracker.track_error(&ErrorReport::new("A", "alpha"), &ErrorContext::default()).unwrap();
        clock.advance(Duration::from_secs(1));
        let b = tracker.track_error(&ErrorReport::new("B", "beta"), &ErrorContext::default()).unwrap();
        clock.advance(Duration::from_secs(1));
        let c = tracker.track_error(&ErrorReport::new("C", "gamma"), &ErrorContext::default()).unwrap();
        clock.advance(Duration::from_secs(1));
        // Seeing alpha again makes beta the least recently seen
        tracker.track_error(&ErrorReport::new("A", "alpha"), &ErrorContext::default());
        let d = tracker.track_error(&ErrorReport::new("D", "delta"), &ErrorContext::default()).unwrap();

        assert_eq!(tracker.len(), 3);
        assert!(tracker.get_error(&b).is_none());
        for kept in [&a, &c, &d] {
            assert!(tracker.get_error(kept).is_some());
        }

        // A reopened group leaves the resolved eviction order
        tracker.resolve_error(&c, "ops", None).unwrap();
        tracker.track_error(&ErrorReport::new("C", "gamma"), &ErrorContext::default());
        tracker.track_error(&ErrorReport::new("E", "epsilon"), &ErrorContext::default());
        assert!(tracker.get_error(&c).is_some());
        assert!(tracker.get_error(&a).is_none());
    }

    #[test]
    fn test_affected_sets_are_bounded() {
        let (tracker, _clock, _receiver) = tracker_with(ErrorTrackingConfig {
            fingerprint_salt: "s".to_string(),
            max_affected_per_error: 100,
            ..ErrorTrackingConfig::default()
        });
        let mut id = None;
        let single = ErrorContext {
            operation: Some("load_user".to_string()),
            ..ErrorContext::default()
        };
        for n in 0..5_000 {
            let context = ErrorContext {
                subject_id: Some(n.to_string()),
                user_id: Some(format!("u{}", n)),
                ..single.clone()
            };
            id = tracker.track_error(&ErrorReport::new("NotFound", format!("user {} not found", n)), &context);
        }
        let error = tracker.get_error(&id.unwrap()).unwrap();
        assert_eq!(error.occurrence_count, 5_000);
        assert_eq!(error.occurrences.len(), 50);
        assert_eq!(error.affected_subjects.len(), 100);
        assert_eq!(error.affected_users.len(), 100);
        assert_eq!(error.affected_overflow.subjects, 4_900);
        assert_eq!(error.affected_overflow.users, 4_900);
        assert_eq!(error.operations.len(), 1);
    }

    #[test]
    fn test_filters_search_and_dashboard() {
        let (tracker, clock, _receiver) = tracker();
        tracker.track_error(&ErrorReport::new("Net", "connection refused"), &context("sync", "1"));
        clock.advance(Duration::from_secs(1));
        let timeout = tracker
            .track_error(&ErrorReport::new("Timeout", "fatal timeout in export"), &context("export", "2"))
            .unwrap();
        tracker.track_error(&ErrorReport::new("Timeout", "fatal timeout in export"), &context("export", "3"));

        let network = tracker.get_errors(&ErrorFilter {
            category: Some(ErrorCategory::Network),
            ..ErrorFilter::default()
        });
        assert_eq!(network.len(), 1);
        let critical = tracker.get_errors(&ErrorFilter {
            min_severity: Some(Severity::Critical),
            ..ErrorFilter::default()
        });
        assert_eq!(critical[0].id, timeout);

        assert_eq!(tracker.search_errors("EXPORT").len(), 1);
        assert!(tracker.search_errors("  ").is_empty());

        let dashboard = tracker.dashboard();
        assert_eq!(dashboard.total, 2);
        assert_eq!(dashboard.open, 2);
        assert_eq!(dashboard.occurrences_last_hour, 3);
        assert_eq!(dashboard.top_errors[0].id, timeout);
        assert_eq!(dashboard.increasing.len(), 2);
    }

    #[test]
    fn test_hourly_trend() {
        let (tracker, clock, _receiver) = tracker();
        let report = ErrorReport::new("Net", "connection reset");
        let id = tracker.track_error(&report, &ErrorContext::default()).unwrap();
        for _ in 0..9 {
            tracker.track_error(&report, &ErrorContext::default());
        }
        clock.advance(Duration::from_secs(3_601));
        for _ in 0..5 {
            tracker.track_error(&report, &ErrorContext::default());
        }
        assert_eq!(tracker.trend(&id), Some(ErrorTrend::Decreasing));
    }

    #[test]
    fn test_disabled_tracker_returns_none() {
        let (tracker, _clock, _receiver) = tracker_with(ErrorTrackingConfig {
            enabled: false,
            ..ErrorTrackingConfig::default()
        });
        assert!(tracker.track_error(&ErrorReport::new("A", "b"), &ErrorContext::default()).is_none());
    }
}

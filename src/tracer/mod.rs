//! Trace recorder.
//!
//! Records span trees for host operations. Traces are sampled once at start;
//! an unsampled trace hands back [`TraceContext::NONE`] and every later call
//! with it returns immediately. Active traces live in a concurrent map, and
//! finished ones move into a bounded LRU buffer.

mod span;

pub use span::{Span, SpanLog, SpanStatus, Trace, TraceContext, TraceMetadata, TraceStatus};

use crate::clock::{to_chrono, SharedClock};
use crate::config::TracingConfig;
use dashmap::DashMap;
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};
use uuid::Uuid;

/// Counters describing tracer activity.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TracerStats {
    /// Traces whose root span is still open.
    pub active: usize,
    /// Traces held in the completed buffer.
    pub completed: usize,
    /// Traces recorded since start.
    pub sampled: u64,
    /// Traces skipped by sampling.
    pub unsampled: u64,
    /// `start_span` calls refused by the span cap.
    pub capped_spans: u64,
    /// Traces force-failed by expiry or active-trace eviction.
    pub forced_failures: u64,
}

/// Trace recorder.
pub struct Tracer {
    config: RwLock<TracingConfig>,
    clock: SharedClock,
    active: DashMap<Uuid, Trace>,
    completed: Mutex<LruCache<Uuid, Trace>>,
    sampled: AtomicU64,
    unsampled: AtomicU64,
    capped_spans: AtomicU64,
    forced_failures: AtomicU64,
}

fn capacity(n: usize) -> NonZeroUsize {
    NonZeroUsize::new(n).unwrap_or(NonZeroUsize::MIN)
}

impl Tracer {
    /// Creates a tracer.
    pub fn new(config: TracingConfig, clock: SharedClock) -> Self {
        let completed = LruCache::new(capacity(config.completed_capacity));
        Self {
            config: RwLock::new(config),
            clock,
            active: DashMap::new(),
            completed: Mutex::new(completed),
            sampled: AtomicU64::new(0),
            unsampled: AtomicU64::new(0),
            capped_spans: AtomicU64::new(0),
            forced_failures: AtomicU64::new(0),
        }
    }

    /// Replaces the configuration. The completed buffer is resized in place.
    pub fn update_config(&self, config: TracingConfig) {
        self.completed.lock().resize(capacity(config.completed_capacity));
        *self.config.write() = config;
    }

    /// Starts a trace and its root span.
    pub fn start_trace(&self, operation: &str, metadata: TraceMetadata) -> TraceContext {
        let (enabled, sample_rate, max_active) = {
            let config = self.config.read();
            (config.enabled, config.sample_rate, config.max_active_traces)
        };
        if !enabled || !(sample_rate >= 1.0 || fastrand::f64() < sample_rate) {
            self.unsampled.fetch_add(1, Ordering::Relaxed);
            return TraceContext::NONE;
        }

        while self.active.len() >= max_active {
            if !self.evict_oldest_active() {
                break;
            }
        }

        let now = self.clock.now();
        let trace_id = Uuid::new_v4();
        let mut tags = HashMap::new();
        if let Some(category) = &metadata.category {
            tags.insert("category".to_string(), category.clone());
        }
        if let Some(subject) = &metadata.subject_id {
            tags.insert("subject_id".to_string(), subject.clone());
        }
        let root = Span::open(trace_id, None, operation, now, tags);
        let root_id = root.id;

        let mut spans = HashMap::new();
        spans.insert(root_id, root);
        self.active.insert(
            trace_id,
            Trace {
                id: trace_id,
                root_span_id: root_id,
                operation: operation.to_string(),
                spans,
                status: TraceStatus::Active,
                metadata,
                started_at: now,
                finished_at: None,
            },
        );
        self.sampled.fetch_add(1, Ordering::Relaxed);
        TraceContext::new(trace_id, root_id)
    }

    /// Starts a child span of `parent`.
    ///
    /// Returns `parent` unchanged once the trace holds `max_spans_per_trace`
    /// spans, and [`TraceContext::NONE`] when the trace is no longer active.
    pub fn start_span(&self, parent: TraceContext, name: &str, tags: HashMap<String, String>) -> TraceContext {
        let (Some(trace_id), Some(parent_id)) = (parent.trace_id(), parent.span_id()) else {
            return TraceContext::NONE;
        };
        let max_spans = self.config.read().max_spans_per_trace;
        let Some(mut trace) = self.active.get_mut(&trace_id) else {
            return TraceContext::NONE;
        };
        if trace.spans.len() >= max_spans {
            self.capped_spans.fetch_add(1, Ordering::Relaxed);
            return parent;
        }
        let span = Span::open(trace_id, Some(parent_id), name, self.clock.now(), tags);
        let span_id = span.id;
        trace.spans.insert(span_id, span);
        TraceContext::new(trace_id, span_id)
    }

    /// Finishes the span of `ctx`. Finishing the root completes the trace.
    ///
    /// Spans of a trace that already completed are ignored, so late children
    /// never reopen it.
    pub fn finish_span(&self, ctx: TraceContext, status: SpanStatus, error: Option<&str>) {
        let (Some(trace_id), Some(span_id)) = (ctx.trace_id(), ctx.span_id()) else {
            return;
        };
        let now = self.clock.now();
        let is_root = {
            let Some(mut trace) = self.active.get_mut(&trace_id) else {
                return;
            };
            let is_root = trace.root_span_id == span_id;
            match trace.spans.get_mut(&span_id) {
                Some(span) => {
                    if !span.close(now, status, error.map(str::to_string)) {
                        return;
                    }
                }
                None => return,
            }
            is_root
        };

        if is_root {
            if let Some((_, mut trace)) = self.active.remove(&trace_id) {
                trace.status = trace.derived_status();
                trace.finished_at = Some(now);
                debug!(trace_id = %trace.id, status = ?trace.status, spans = trace.spans.len(), "Trace finished");
                self.completed.lock().put(trace_id, trace);
            }
        }
    }

    /// Adds tags to an open span.
    pub fn set_tags(&self, ctx: TraceContext, tags: HashMap<String, String>) {
        self.with_open_span(ctx, |span| span.tags.extend(tags));
    }

    /// Appends a log line to an open span.
    pub fn log_to_span(&self, ctx: TraceContext, message: &str, fields: HashMap<String, String>) {
        let timestamp = self.clock.now();
        self.with_open_span(ctx, |span| {
            span.logs.push(SpanLog {
                timestamp,
                message: message.to_string(),
                fields,
            })
        });
    }

    fn with_open_span(&self, ctx: TraceContext, f: impl FnOnce(&mut Span)) {
        let (Some(trace_id), Some(span_id)) = (ctx.trace_id(), ctx.span_id()) else {
            return;
        };
        if let Some(mut trace) = self.active.get_mut(&trace_id) {
            if let Some(span) = trace.spans.get_mut(&span_id) {
                if !span.is_finished() {
                    f(span);
                }
            }
        }
    }

    /// Force-fails every active trace older than `max_trace_age`. Returns how many expired.
    pub fn sweep(&self) -> usize {
        let max_age = to_chrono(self.config.read().max_trace_age());
        let cutoff = self.clock.now() - max_age;
        let expired: Vec<Uuid> = self
            .active
            .iter()
            .filter(|entry| entry.started_at < cutoff)
            .map(|entry| *entry.key())
            .collect();

        for trace_id in &expired {
            self.force_fail(trace_id, "trace expired");
        }
        if !expired.is_empty() {
            warn!(expired = expired.len(), "Expired traces force-failed");
        }
        crate::utils::metrics::set_active_traces(self.active.len());
        expired.len()
    }

    fn evict_oldest_active(&self) -> bool {
        let oldest = self
            .active
            .iter()
            .min_by_key(|entry| entry.started_at)
            .map(|entry| *entry.key());
        match oldest {
            Some(trace_id) => {
                debug!(%trace_id, "Active trace limit reached, evicting oldest");
                self.force_fail(&trace_id, "evicted by active trace limit")
            }
            None => false,
        }
    }

    fn force_fail(&self, trace_id: &Uuid, reason: &str) -> bool {
        let Some((_, mut trace)) = self.active.remove(trace_id) else {
            return false;
        };
        let now = self.clock.now();
        for span in trace.spans.values_mut() {
            span.close(now, SpanStatus::Error, Some(reason.to_string()));
        }
        trace.status = TraceStatus::Failed;
        trace.finished_at = Some(now);
        self.forced_failures.fetch_add(1, Ordering::Relaxed);
        self.completed.lock().put(*trace_id, trace);
        true
    }

    /// Looks up an active or completed trace.
    pub fn get_trace(&self, trace_id: &Uuid) -> Option<Trace> {
        if let Some(trace) = self.active.get(trace_id) {
            return Some(trace.clone());
        }
        self.completed.lock().peek(trace_id).cloned()
    }

    /// Most recently finished traces, newest first.
    pub fn recent_traces(&self, limit: usize) -> Vec<Trace> {
        self.completed.lock().iter().take(limit).map(|(_, t)| t.clone()).collect()
    }

    /// Activity counters.
    pub fn stats(&self) -> TracerStats {
        TracerStats {
            active: self.active.len(),
            completed: self.completed.lock().len(),
            sampled: self.sampled.load(Ordering::Relaxed),
            unsampled: self.unsampled.load(Ordering::Relaxed),
            capped_spans: self.capped_spans.load(Ordering::Relaxed),
            forced_failures: self.forced_failures.load(Ordering::Relaxed),
        }
    }

    /// Drops every active and completed trace.
    pub fn clear(&self) {
        self.active.clear();
        self.completed.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;
    use std::time::Duration;

    fn tracer_with(config: TracingConfig) -> (Tracer, ManualClock) {
        let clock = ManualClock::at_epoch_2024();
        (Tracer::new(config, Arc::new(clock.clone())), clock)
    }

    fn tracer() -> (Tracer, ManualClock) {
        tracer_with(TracingConfig::default())
    }

    #[test]
    fn test_span_duration_is_end_minus_start() {
        let (tracer, clock) = tracer();
        let root = tracer.start_trace("publish", TraceMetadata::default());
        let child = tracer.start_span(root, "render", HashMap::new());
        clock.advance(Duration::from_millis(40));
        tracer.finish_span(child, SpanStatus::Success, None);
        clock.advance(Duration::from_millis(10));
        tracer.finish_span(root, SpanStatus::Success, None);

        let trace = tracer.get_trace(&root.trace_id().unwrap()).unwrap();
        assert_eq!(trace.status, TraceStatus::Completed);
        let span = &trace.spans[&child.span_id().unwrap()];
        assert!(span.end_time.unwrap() >= span.start_time);
        assert_eq!(span.duration_ms, Some(40.0));
        assert_eq!(trace.duration_ms(), Some(50.0));
    }

    #[test]
    fn test_trace_failed_iff_some_span_errored() {
        let (tracer, _clock) = tracer();
        let root = tracer.start_trace("import", TraceMetadata::default());
        let child = tracer.start_span(root, "parse", HashMap::new());
        tracer.finish_span(child, SpanStatus::Error, Some("bad row"));
        tracer.finish_span(root, SpanStatus::Success, None);

        let trace = tracer.get_trace(&root.trace_id().unwrap()).unwrap();
        assert_eq!(trace.status, TraceStatus::Failed);
        assert_eq!(trace.spans[&child.span_id().unwrap()].error.as_deref(), Some("bad row"));
    }

    #[test]
    fn test_unsampled_context_is_noop() {
        let config = TracingConfig {
            sample_rate: 0.0,
            ..TracingConfig::default()
        };
        let (tracer, _clock) = tracer_with(config);
        let ctx = tracer.start_trace("op", TraceMetadata::default());
        assert_eq!(ctx, TraceContext::NONE);
        assert_eq!(tracer.start_span(ctx, "child", HashMap::new()), TraceContext::NONE);
        tracer.finish_span(ctx, SpanStatus::Success, None);
        assert_eq!(tracer.stats().unsampled, 1);
        assert_eq!(tracer.stats().active, 0);
    }

    #[test]
    fn test_span_cap_returns_parent() {
        let config = TracingConfig {
            max_spans_per_trace: 2,
            ..TracingConfig::default()
        };
        let (tracer, _clock) = tracer_with(config);
        let root = tracer.start_trace("op", TraceMetadata::default());
        let first = tracer.start_span(root, "a", HashMap::new());
        assert_ne!(first, root);
        let second = tracer.start_span(root, "b", HashMap::new());
        assert_eq!(second, root);
        assert_eq!(tracer.stats().capped_spans, 1);
    }

    #[test]
    fn test_late_child_does_not_reopen_trace() {
        let (tracer, _clock) = tracer();
        let root = tracer.start_trace("op", TraceMetadata::default());
        let child = tracer.start_span(root, "slow", HashMap::new());
        tracer.finish_span(root, SpanStatus::Success, None);
        tracer.finish_span(child, SpanStatus::Error, Some("late"));

        let trace = tracer.get_trace(&root.trace_id().unwrap()).unwrap();
        assert_eq!(trace.status, TraceStatus::Completed);
        assert_eq!(trace.spans[&child.span_id().unwrap()].status, SpanStatus::Pending);
        assert_eq!(tracer.stats().active, 0);
    }

    #[test]
    fn test_sweep_fails_expired_traces() {
        let (tracer, clock) = tracer();
        let old = tracer.start_trace("stuck", TraceMetadata::default());
        let child = tracer.start_span(old, "io", HashMap::new());
        clock.advance(Duration::from_secs(200));
        let fresh = tracer.start_trace("fresh", TraceMetadata::default());
        clock.advance(Duration::from_secs(200));

        assert_eq!(tracer.sweep(), 1);
        let trace = tracer.get_trace(&old.trace_id().unwrap()).unwrap();
        assert_eq!(trace.status, TraceStatus::Failed);
        assert_eq!(trace.spans[&child.span_id().unwrap()].status, SpanStatus::Error);
        assert_eq!(
            tracer.get_trace(&fresh.trace_id().unwrap()).unwrap().status,
            TraceStatus::Active
        );
    }

    #[test]
    fn test_active_limit_evicts_oldest() {
        let config = TracingConfig {
            max_active_traces: 2,
            ..TracingConfig::default()
        };
        let (tracer, clock) = tracer_with(config);
        let first = tracer.start_trace("a", TraceMetadata::default());
        clock.advance(Duration::from_millis(1));
        tracer.start_trace("b", TraceMetadata::default());
        clock.advance(Duration::from_millis(1));
        tracer.start_trace("c", TraceMetadata::default());

        let stats = tracer.stats();
        assert_eq!(stats.active, 2);
        assert_eq!(stats.forced_failures, 1);
        assert_eq!(
            tracer.get_trace(&first.trace_id().unwrap()).unwrap().status,
            TraceStatus::Failed
        );
    }

    #[test]
    fn test_tags_logs_and_jaeger_export() {
        let (tracer, _clock) = tracer();
        let metadata = TraceMetadata {
            category: Some("content".to_string()),
            ..TraceMetadata::default()
        };
        let root = tracer.start_trace("save_page", metadata);
        let mut tags = HashMap::new();
        tags.insert("page".to_string(), "home".to_string());
        tracer.set_tags(root, tags);
        tracer.log_to_span(root, "validated", HashMap::new());
        tracer.finish_span(root, SpanStatus::Success, None);

        let trace = tracer.recent_traces(1).pop().unwrap();
        let root_span = trace.root().unwrap();
        assert_eq!(root_span.tags.get("page").map(String::as_str), Some("home"));
        assert_eq!(root_span.tags.get("category").map(String::as_str), Some("content"));
        assert_eq!(root_span.logs.len(), 1);

        let json = trace.to_jaeger_json();
        assert_eq!(json["spans"].as_array().unwrap().len(), 1);
        assert_eq!(json["spans"][0]["operationName"], "save_page");
    }
}

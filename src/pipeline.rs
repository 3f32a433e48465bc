//! Pipeline facade.
//!
//! [`Pipeline`] owns one instance of every component, the event queue between
//! the producers and the notification engine, and the background tasks. Host
//! code talks to it through an [`OperationMonitor`] per operation category.
//!
//! Inline calls are fail-open: an internal panic is caught, logged and counted,
//! and the host operation carries on as if telemetry were disabled.

use crate::clock::{SharedClock, SystemClock};
use crate::config::PipelineConfig;
use crate::error::{Error, Result};
use crate::error_tracker::{ErrorContext, ErrorDashboard, ErrorFilter, ErrorReport, ErrorTracker, TrackedError};
use crate::events::{EventSink, PipelineEvent};
use crate::health::{
    DeliveryChecker, DroppedEventsChecker, HealthMonitor, HealthReport, HealthStatus, LogBacklogChecker,
    QueueSaturationChecker, TaskLivenessChecker,
};
use crate::logs::{LogContext, LogEntry, LogIndex, LogIndexStats, LogLevel, LogQuery, SearchResult};
use crate::notify::{AlertState, EngineStats, HistoryEntry, NotificationEngine};
use crate::perf::{MetricAggregator, PerfStats, Timer, TimerIds};
use crate::scheduler::TaskRegistry;
use crate::tracer::{SpanStatus, Trace, TraceContext, TraceMetadata, Tracer, TracerStats};
use async_channel::Receiver;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const QUEUE_DEGRADED_RATIO: f64 = 0.8;
const DELIVERY_FAILURE_RATIO: f64 = 0.5;
const DELIVERY_MIN_SAMPLE: u64 = 10;
const LOG_BACKLOG_BATCHES: usize = 10;

/// Query answer with an indication of how trustworthy it is.
#[derive(Debug, Clone, Serialize)]
pub struct DashboardResponse<T> {
    /// The answer, possibly partial.
    pub data: T,
    /// Whether the pipeline was not fully healthy when answering.
    pub degraded: bool,
    /// Why the answer is degraded.
    pub warnings: Vec<String>,
}

/// Result of a monitored operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The operation did what it was asked.
    Success,
    /// The operation failed.
    Failure,
}

/// Counters across all components.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    /// Master switch.
    pub enabled: bool,
    /// Whether background tasks run.
    pub running: bool,
    /// Tracer counters.
    pub tracer: TracerStats,
    /// Log index counters.
    pub logs: LogIndexStats,
    /// Retained metric samples.
    pub metric_samples: usize,
    /// Tracked error groups.
    pub tracked_errors: usize,
    /// Notification engine counters.
    pub notifications: EngineStats,
    /// Events dropped on a full queue.
    pub dropped_events: u64,
    /// Internal panics caught at the facade.
    pub internal_failures: u64,
}

/// The telemetry pipeline.
pub struct Pipeline {
    config: RwLock<PipelineConfig>,
    enabled: AtomicBool,
    running: AtomicBool,
    clock: SharedClock,
    scheduler: TaskRegistry,
    sink: EventSink,
    receiver: Receiver<PipelineEvent>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    tracer: Arc<Tracer>,
    metrics: Arc<MetricAggregator>,
    logs: Arc<LogIndex>,
    errors: Arc<ErrorTracker>,
    notifications: Arc<NotificationEngine>,
    health: Arc<HealthMonitor>,
    internal_failures: AtomicU64,
}

impl Pipeline {
    /// Builds a pipeline on the system clock. Background tasks start with [`Pipeline::start`].
    pub fn new(config: PipelineConfig) -> Result<Arc<Self>> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Builds a pipeline reading time from `clock`.
    pub fn with_clock(config: PipelineConfig, clock: SharedClock) -> Result<Arc<Self>> {
        config.validate()?;
        let scheduler = TaskRegistry::new();
        let (sink, receiver) = EventSink::channel(config.dispatcher.queue_capacity);

        let tracer = Arc::new(Tracer::new(config.tracing.clone(), Arc::clone(&clock)));
        let metrics = Arc::new(MetricAggregator::new(config.metrics.clone(), Arc::clone(&clock), sink.clone()));
        let logs = Arc::new(LogIndex::new(config.logs.clone(), Arc::clone(&clock)));
        let errors = Arc::new(ErrorTracker::new(config.errors.clone(), Arc::clone(&clock), sink.clone()));
        let notifications = Arc::new(NotificationEngine::new(
            config.notifications.clone(),
            Arc::clone(&clock),
            scheduler.clone(),
        ));

        let mut health = HealthMonitor::new(Arc::clone(&clock));
        health.add_checker(Arc::new(QueueSaturationChecker::new(sink.clone(), QUEUE_DEGRADED_RATIO)));
        health.add_checker(Arc::new(DroppedEventsChecker::new(sink.clone())));
        health.add_checker(Arc::new(DeliveryChecker::new(
            Arc::clone(&notifications),
            DELIVERY_FAILURE_RATIO,
            DELIVERY_MIN_SAMPLE,
        )));
        health.add_checker(Arc::new(TaskLivenessChecker::new(scheduler.clone())));
        health.add_checker(Arc::new(LogBacklogChecker::new(
            Arc::clone(&logs),
            config.logs.batch_size.saturating_mul(LOG_BACKLOG_BATCHES),
        )));

        Ok(Arc::new(Self {
            enabled: AtomicBool::new(config.enabled),
            running: AtomicBool::new(false),
            config: RwLock::new(config),
            clock,
            scheduler,
            sink,
            receiver,
            dispatcher: Mutex::new(None),
            tracer,
            metrics,
            logs,
            errors,
            notifications,
            health: Arc::new(health),
            internal_failures: AtomicU64::new(0),
        }))
    }

    /// Starts the dispatcher and the periodic tasks. Does nothing while disabled
    /// or already running.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(Error::other("pipeline background tasks need a tokio runtime"));
        }
        if !self.is_enabled() {
            info!("Pipeline disabled, background tasks not started");
            return Ok(());
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.spawn_dispatcher();
        self.spawn_periodic_tasks();
        info!(
            periodic_tasks = self.scheduler.periodic_status().len(),
            checkers = ?self.health.checker_names(),
            "Pipeline started"
        );
        Ok(())
    }

    fn spawn_dispatcher(&self) {
        let receiver = self.receiver.clone();
        let engine = Arc::clone(&self.notifications);
        let handle = tokio::spawn(async move {
            while let Ok(event) = receiver.recv().await {
                let handled = AssertUnwindSafe(engine.handle_event(event)).catch_unwind().await;
                if handled.is_err() {
                    error!("Notification engine panicked while handling an event; event dropped");
                }
            }
            debug!("Event queue closed, dispatcher stopped");
        });
        *self.dispatcher.lock() = Some(handle);
    }

    fn spawn_periodic_tasks(&self) {
        let config = self.config.read().clone();

        let metrics = Arc::clone(&self.metrics);
        self.scheduler.spawn_periodic(
            "metrics.aggregate",
            Duration::from_secs(config.metrics.aggregation_interval_secs),
            move || {
                let metrics = Arc::clone(&metrics);
                async move {
                    metrics.aggregate();
                }
            },
        );

        let metrics = Arc::clone(&self.metrics);
        self.scheduler.spawn_periodic(
            "metrics.alerts",
            Duration::from_secs(config.metrics.alert_interval_secs),
            move || {
                let metrics = Arc::clone(&metrics);
                async move {
                    let fired = metrics.evaluate_alerts();
                    if !fired.is_empty() {
                        debug!(fired = fired.len(), "Alert evaluation cycle fired rules");
                    }
                }
            },
        );

        let logs = Arc::clone(&self.logs);
        let flusher = self.scheduler.spawn_periodic_with_wake(
            "logs.flush",
            Duration::from_millis(config.logs.flush_interval_ms),
            self.logs.batch_signal(),
            move || {
                let logs = Arc::clone(&logs);
                async move {
                    logs.flush();
                    logs.enforce_retention();
                }
            },
        );
        self.logs.set_background_flush(flusher);

        let tracer = Arc::clone(&self.tracer);
        self.scheduler.spawn_periodic(
            "tracer.sweep",
            Duration::from_secs(config.tracing.sweep_interval_secs),
            move || {
                let tracer = Arc::clone(&tracer);
                async move {
                    tracer.sweep();
                }
            },
        );

        let errors = Arc::clone(&self.errors);
        self.scheduler.spawn_periodic(
            "errors.sweep",
            Duration::from_secs(config.errors.sweep_interval_secs),
            move || {
                let errors = Arc::clone(&errors);
                async move {
                    errors.sweep();
                }
            },
        );

        let health = Arc::clone(&self.health);
        self.scheduler.spawn_periodic(
            "health",
            Duration::from_secs(config.dispatcher.health_interval_secs),
            move || {
                let health = Arc::clone(&health);
                async move {
                    health.check_health().await;
                }
            },
        );
    }

    fn stop_background(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.logs.set_background_flush(false);
        let stopped = self.scheduler.stop_periodic();
        if let Some(handle) = self.dispatcher.lock().take() {
            handle.abort();
        }
        let cancelled = self.scheduler.cancel_all();
        info!(stopped, cancelled, "Pipeline background work stopped");
    }

    /// Turns inline calls into no-ops, stops periodic tasks and cancels pending
    /// timers. Collected data and notification history stay queryable.
    pub fn disable(&self) {
        if self.enabled.swap(false, Ordering::SeqCst) {
            self.config.write().enabled = false;
            self.stop_background();
            warn!("Pipeline disabled");
        }
    }

    /// Re-enables a disabled pipeline and restarts its background tasks.
    pub fn enable(self: &Arc<Self>) -> Result<()> {
        if !self.enabled.swap(true, Ordering::SeqCst) {
            self.config.write().enabled = true;
            info!("Pipeline enabled");
        }
        self.start()
    }

    /// Whether inline calls record anything.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Whether background tasks run.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Validates and applies a new configuration. Interval changes restart the
    /// periodic tasks; the queue capacity only applies to a new pipeline.
    pub fn update_config(self: &Arc<Self>, config: PipelineConfig) -> Result<()> {
        config.validate()?;
        self.tracer.update_config(config.tracing.clone());
        self.metrics.update_config(config.metrics.clone());
        self.logs.update_config(config.logs.clone());
        self.errors.update_config(config.errors.clone());
        self.notifications.update_config(config.notifications.clone());

        let enabled = config.enabled;
        *self.config.write() = config;
        info!(enabled, "Pipeline configuration updated");

        if !enabled {
            self.disable();
            return Ok(());
        }
        self.enabled.store(true, Ordering::SeqCst);
        if self.is_running() {
            self.scheduler.stop_periodic();
            self.spawn_periodic_tasks();
            Ok(())
        } else {
            self.start()
        }
    }

    /// Current configuration.
    pub fn config(&self) -> PipelineConfig {
        self.config.read().clone()
    }

    /// Flushes pending groups and log entries, then stops all background work.
    pub async fn shutdown(&self) {
        let groups = self.notifications.flush_all_groups().await;
        let logs = self.logs.flush();
        self.stop_background();
        self.scheduler.shutdown();
        info!(flushed_groups = groups, flushed_logs = logs, "Pipeline shut down");
    }

    /// Facade for operations of `category`.
    pub fn monitor(self: &Arc<Self>, category: impl Into<String>) -> OperationMonitor {
        OperationMonitor {
            pipeline: Arc::clone(self),
            category: category.into(),
        }
    }

    /// Runs `f`, turning a panic into `None`.
    fn guarded<T>(&self, call: &'static str, f: impl FnOnce() -> T) -> Option<T> {
        match std::panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(value) => Some(value),
            Err(payload) => {
                self.internal_failures.fetch_add(1, Ordering::Relaxed);
                let reason = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(call, reason = %reason, "Telemetry call panicked, continuing without it");
                None
            }
        }
    }

    fn respond<T: Default>(&self, call: &'static str, f: impl FnOnce() -> T) -> DashboardResponse<T> {
        let mut warnings = Vec::new();
        if !self.is_enabled() {
            warnings.push("pipeline is disabled, data may be stale".to_string());
        }
        if let Some(report) = self.health.last_report() {
            if report.status != HealthStatus::Healthy {
                warnings.extend(report.warnings());
            }
        }
        let data = match self.guarded(call, f) {
            Some(data) => data,
            None => {
                warnings.push(format!("{} failed internally, returning an empty result", call));
                T::default()
            }
        };
        DashboardResponse {
            degraded: !warnings.is_empty(),
            data,
            warnings,
        }
    }

    // Inline producers outside an operation

    /// Logs one entry into the index.
    pub fn log(&self, level: LogLevel, message: impl Into<String>, context: LogContext) {
        if !self.is_enabled() {
            return;
        }
        let message = message.into();
        self.guarded("log", || self.logs.log(level, message, context));
    }

    /// Tracks a failure that happened outside a monitored operation.
    pub fn track_error(&self, report: &ErrorReport, context: &ErrorContext) -> Option<String> {
        if !self.is_enabled() {
            return None;
        }
        self.guarded("track_error", || self.errors.track_error(report, context)).flatten()
    }

    // Queries

    /// Aggregates of one operation.
    pub fn perf_stats(&self, operation: &str) -> DashboardResponse<Option<PerfStats>> {
        self.respond("perf_stats", || self.metrics.perf_stats(operation))
    }

    /// Aggregates of every operation.
    pub fn all_perf_stats(&self) -> DashboardResponse<Vec<PerfStats>> {
        self.respond("all_perf_stats", || self.metrics.all_perf_stats())
    }

    /// Searches indexed log entries.
    pub fn search_logs(&self, query: &LogQuery) -> DashboardResponse<SearchResult> {
        self.respond("search_logs", || self.logs.search(query))
    }

    /// Tracked errors matching `filter`.
    pub fn errors(&self, filter: &ErrorFilter) -> DashboardResponse<Vec<TrackedError>> {
        self.respond("errors", || self.errors.get_errors(filter))
    }

    /// Error overview.
    pub fn error_dashboard(&self) -> DashboardResponse<ErrorDashboard> {
        self.respond("error_dashboard", || self.errors.dashboard())
    }

    /// Notification history, newest first.
    pub fn alert_history(&self, alert_id: Option<&str>, limit: usize) -> DashboardResponse<Vec<HistoryEntry>> {
        self.respond("alert_history", || self.notifications.alert_history(alert_id, limit))
    }

    /// One trace, active or completed.
    pub fn trace(&self, id: &Uuid) -> DashboardResponse<Option<Trace>> {
        self.respond("trace", || self.tracer.get_trace(id))
    }

    /// Runs every health check now.
    pub async fn health(&self) -> HealthReport {
        self.health.check_health().await
    }

    /// Counters across all components.
    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            enabled: self.is_enabled(),
            running: self.is_running(),
            tracer: self.tracer.stats(),
            logs: self.logs.stats(),
            metric_samples: self.metrics.sample_count(),
            tracked_errors: self.errors.len(),
            notifications: self.notifications.stats(),
            dropped_events: self.sink.dropped(),
            internal_failures: self.internal_failures.load(Ordering::Relaxed),
        }
    }

    // Admin

    /// Acknowledges an alert or error, stopping its escalations.
    pub fn acknowledge(&self, id: &str, who: &str) -> Result<AlertState> {
        self.notifications.acknowledge_alert(id, who)
    }

    /// Resolves a tracked error and the notification state of `id`.
    pub fn resolve(&self, id: &str, who: &str, notes: Option<&str>) -> Result<()> {
        let tracked = self.errors.get_error(id).is_some();
        if tracked {
            self.errors.resolve_error(id, who, notes)?;
        }
        match self.notifications.resolve_alert(id, who) {
            Ok(_) => Ok(()),
            Err(Error::NotFound { .. }) if tracked => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Trace recorder.
    pub fn tracer(&self) -> &Arc<Tracer> {
        &self.tracer
    }

    /// Metric aggregator.
    pub fn metrics(&self) -> &Arc<MetricAggregator> {
        &self.metrics
    }

    /// Log index.
    pub fn logs(&self) -> &Arc<LogIndex> {
        &self.logs
    }

    /// Error tracker.
    pub fn error_tracker(&self) -> &Arc<ErrorTracker> {
        &self.errors
    }

    /// Notification engine.
    pub fn notifications(&self) -> &Arc<NotificationEngine> {
        &self.notifications
    }

    /// Health monitor.
    pub fn health_monitor(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    /// Clock the pipeline reads.
    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }
}

/// One in-flight operation. Finish it with [`OperationMonitor::end`]; a handle
/// dropped without `end` records a failed ("abandoned") sample.
pub struct OperationHandle {
    id: Uuid,
    operation: String,
    category: String,
    subject_id: Option<String>,
    correlation_id: Option<String>,
    trace: TraceContext,
    timer: Option<Timer>,
    started: Instant,
    started_at: DateTime<Utc>,
    checkpoints: Vec<(String, f64)>,
}

impl OperationHandle {
    fn inert(operation: &str, category: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            operation: operation.to_string(),
            category: category.to_string(),
            subject_id: None,
            correlation_id: None,
            trace: TraceContext::NONE,
            timer: None,
            started: Instant::now(),
            started_at: now,
            checkpoints: Vec::new(),
        }
    }

    /// Handle id.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Operation name.
    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// Trace context; [`TraceContext::NONE`] when unsampled or disabled.
    pub fn trace(&self) -> TraceContext {
        self.trace
    }

    /// When the operation began.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Time since `begin`.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Checkpoint labels with their offset from `begin` in milliseconds.
    pub fn checkpoints(&self) -> &[(String, f64)] {
        &self.checkpoints
    }

    fn is_recording(&self) -> bool {
        self.timer.is_some()
    }

    fn log_context(&self) -> LogContext {
        let mut context = LogContext::new()
            .with_trace(self.trace.trace_id(), self.trace.span_id())
            .with_category(self.category.clone())
            .with_operation(self.operation.clone());
        if let Some(subject) = &self.subject_id {
            context = context.with_subject(subject.clone());
        }
        if let Some(correlation) = &self.correlation_id {
            context = context.with_correlation_id(correlation.clone());
        }
        context
    }
}

/// Entry point for operations of one category.
#[derive(Clone)]
pub struct OperationMonitor {
    pipeline: Arc<Pipeline>,
    category: String,
}

impl OperationMonitor {
    /// Category of the monitored operations.
    pub fn category(&self) -> &str {
        &self.category
    }

    /// Starts a trace, a timer and a log line for `operation`.
    ///
    /// A sampled `parent` records the operation as a child span of the
    /// parent's trace, and an unsampled one keeps the operation unsampled. A
    /// parent whose trace already completed starts a new trace.
    pub fn begin(
        &self,
        operation: &str,
        subject_id: Option<&str>,
        correlation_id: Option<&str>,
        parent: Option<&TraceContext>,
    ) -> OperationHandle {
        let pipeline = &self.pipeline;
        let now = pipeline.clock.now();
        if !pipeline.is_enabled() {
            return OperationHandle::inert(operation, &self.category, now);
        }
        pipeline
            .guarded("begin", || {
                let trace = self.open_trace(operation, subject_id, correlation_id, parent);
                let timer = pipeline.metrics.create_timer(
                    operation,
                    &self.category,
                    TimerIds {
                        trace_id: trace.trace_id(),
                        correlation_id: correlation_id.map(str::to_string),
                    },
                );
                let handle = OperationHandle {
                    id: Uuid::new_v4(),
                    operation: operation.to_string(),
                    category: self.category.clone(),
                    subject_id: subject_id.map(str::to_string),
                    correlation_id: correlation_id.map(str::to_string),
                    trace,
                    timer: Some(timer),
                    started: Instant::now(),
                    started_at: now,
                    checkpoints: Vec::new(),
                };
                pipeline.logs.log(
                    LogLevel::Debug,
                    format!("{} started", operation),
                    handle.log_context().with_field("handle_id", handle.id.to_string().into()),
                );
                handle
            })
            .unwrap_or_else(|| OperationHandle::inert(operation, &self.category, now))
    }

    fn open_trace(
        &self,
        operation: &str,
        subject_id: Option<&str>,
        correlation_id: Option<&str>,
        parent: Option<&TraceContext>,
    ) -> TraceContext {
        let tracer = &self.pipeline.tracer;
        if let Some(parent) = parent {
            if !parent.is_sampled() {
                return TraceContext::NONE;
            }
            let mut tags = HashMap::new();
            tags.insert("category".to_string(), self.category.clone());
            if let Some(subject) = subject_id {
                tags.insert("subject_id".to_string(), subject.to_string());
            }
            if let Some(correlation) = correlation_id {
                tags.insert("correlation_id".to_string(), correlation.to_string());
            }
            let child = tracer.start_span(*parent, operation, tags);
            if child == *parent {
                // Span cap reached: this handle must never finish the parent's span
                return TraceContext::NONE;
            }
            if child.is_sampled() {
                return child;
            }
        }
        tracer.start_trace(
            operation,
            TraceMetadata {
                category: Some(self.category.clone()),
                subject_id: subject_id.map(str::to_string),
                correlation_id: correlation_id.map(str::to_string),
            },
        )
    }

    /// Records an intermediate step of the operation.
    pub fn checkpoint(&self, handle: &mut OperationHandle, label: &str, data: Option<serde_json::Value>) {
        if !handle.is_recording() || !self.pipeline.is_enabled() {
            return;
        }
        let offset_ms = handle.started.elapsed().as_secs_f64() * 1000.0;
        handle.checkpoints.push((label.to_string(), offset_ms));
        let pipeline = &self.pipeline;
        pipeline.guarded("checkpoint", || {
            let mut fields = HashMap::new();
            fields.insert("offset_ms".to_string(), format!("{:.3}", offset_ms));
            if let Some(serde_json::Value::Object(map)) = &data {
                for (key, value) in map {
                    let text = match value {
                        serde_json::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    fields.insert(key.clone(), text);
                }
            }
            pipeline.tracer.log_to_span(handle.trace, label, fields);

            let mut context = handle.log_context().with_field("offset_ms", offset_ms.into());
            if let Some(data) = data {
                context = context.with_field("data", data);
            }
            pipeline.logs.log(LogLevel::Debug, format!("{}: {}", handle.operation, label), context);
        });
    }

    /// Finishes the operation: records the sample, closes the trace, logs the
    /// result and, on failure, tracks the error. Returns the elapsed time.
    pub fn end(
        &self,
        mut handle: OperationHandle,
        outcome: Outcome,
        error: Option<&ErrorReport>,
        result_summary: Option<&str>,
    ) -> Duration {
        let Some(timer) = handle.timer.take() else {
            return handle.started.elapsed();
        };
        let pipeline = &self.pipeline;
        let elapsed = pipeline.guarded("end", || {
            let now = pipeline.clock.now();
            let mut context = handle
                .log_context()
                .with_field("checkpoints", handle.checkpoints.len().into());
            if let Some(summary) = result_summary {
                context = context.with_field("result", summary.into());
            }

            match outcome {
                Outcome::Success => {
                    let elapsed = timer.success();
                    pipeline.tracer.finish_span(handle.trace, SpanStatus::Success, None);
                    let entry = LogEntry::new(LogLevel::Info, format!("{} completed", handle.operation), now)
                        .with_context(context)
                        .with_performance(elapsed.as_secs_f64() * 1000.0, None);
                    pipeline.logs.ingest(entry);
                    elapsed
                }
                Outcome::Failure => {
                    let report = error
                        .cloned()
                        .unwrap_or_else(|| ErrorReport::new("OperationFailed", format!("{} failed", handle.operation)));
                    let elapsed = timer.failure(&report.message);
                    pipeline
                        .tracer
                        .finish_span(handle.trace, SpanStatus::Error, Some(&report.message));

                    let error_context = ErrorContext {
                        operation: Some(handle.operation.clone()),
                        category: Some(handle.category.clone()),
                        subject_id: handle.subject_id.clone(),
                        user_id: None,
                        trace_id: handle.trace.trace_id(),
                        correlation_id: handle.correlation_id.clone(),
                    };
                    let mut entry = LogEntry::new(LogLevel::Error, format!("{} failed", handle.operation), now)
                        .with_error(report.kind.clone(), report.message.clone())
                        .with_performance(elapsed.as_secs_f64() * 1000.0, None);
                    if let Some(error_id) = pipeline.errors.track_error(&report, &error_context) {
                        context = context.with_field("error_id", error_id.into());
                    }
                    entry = entry.with_context(context);
                    pipeline.logs.ingest(entry);
                    elapsed
                }
            }
        });
        elapsed.unwrap_or_else(|| handle.started.elapsed())
    }
}

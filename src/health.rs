//! Health monitoring of the pipeline itself.
//!
//! Each [`HealthChecker`] inspects one internal concern and reports a
//! [`ComponentHealth`]. The [`HealthMonitor`] combines them into a
//! [`HealthReport`] and caches the latest one; dashboard queries read that
//! cache to decide whether their answer is degraded.

use crate::clock::SharedClock;
use crate::events::EventSink;
use crate::logs::LogIndex;
use crate::notify::NotificationEngine;
use crate::scheduler::TaskRegistry;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, warn};

/// Overall health status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// All systems operational
    Healthy,
    /// Minor issues, service degraded but functional
    Degraded,
    /// Critical issues, the pipeline may not function properly
    Unhealthy,
}

/// Health of one internal concern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    /// Component name
    pub name: String,
    /// Status
    pub status: HealthStatus,
    /// Check time
    pub last_check: DateTime<Utc>,
    /// Check duration in milliseconds
    pub response_time_ms: Option<f64>,
    /// Figures the status was derived from
    pub details: HashMap<String, serde_json::Value>,
    /// Problem description when not healthy
    pub error: Option<String>,
}

impl ComponentHealth {
    fn new(name: &str, now: DateTime<Utc>) -> Self {
        Self {
            name: name.to_string(),
            status: HealthStatus::Healthy,
            last_check: now,
            response_time_ms: None,
            details: HashMap::new(),
            error: None,
        }
    }

    fn detail(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    fn problem(mut self, status: HealthStatus, error: impl Into<String>) -> Self {
        self.status = status;
        self.error = Some(error.into());
        self
    }
}

/// Combined health report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    /// Overall status
    pub status: HealthStatus,
    /// Crate version
    pub version: String,
    /// Seconds since the monitor was created
    pub uptime_seconds: u64,
    /// Report time
    pub timestamp: DateTime<Utc>,
    /// Per-component health
    pub components: BTreeMap<String, ComponentHealth>,
}

impl HealthReport {
    /// One line per component that is not healthy.
    pub fn warnings(&self) -> Vec<String> {
        self.components
            .values()
            .filter(|c| c.status != HealthStatus::Healthy)
            .map(|c| match &c.error {
                Some(error) => format!("{}: {}", c.name, error),
                None => format!("{}: {:?}", c.name, c.status),
            })
            .collect()
    }
}

/// One health check.
#[async_trait]
pub trait HealthChecker: Send + Sync {
    /// Component name
    fn name(&self) -> &str;

    /// Perform the check
    async fn check_health(&self, now: DateTime<Utc>) -> ComponentHealth;

    /// Whether an unhealthy result makes the whole pipeline unhealthy
    fn is_critical(&self) -> bool {
        true
    }
}

/// Fill level of the producer → dispatcher queue.
pub struct QueueSaturationChecker {
    sink: EventSink,
    degraded_ratio: f64,
}

impl QueueSaturationChecker {
    /// Degraded above `degraded_ratio` of capacity, unhealthy when full.
    pub fn new(sink: EventSink, degraded_ratio: f64) -> Self {
        Self { sink, degraded_ratio }
    }
}

#[async_trait]
impl HealthChecker for QueueSaturationChecker {
    fn name(&self) -> &str {
        "event_queue"
    }

    async fn check_health(&self, now: DateTime<Utc>) -> ComponentHealth {
        let health = ComponentHealth::new(self.name(), now);
        let Some((len, capacity)) = self.sink.depth() else {
            return health.problem(HealthStatus::Unhealthy, "event queue is closed");
        };
        let ratio = if capacity == 0 { 1.0 } else { len as f64 / capacity as f64 };
        let health = health
            .detail("depth", len)
            .detail("capacity", capacity)
            .detail("fill_ratio", ratio);
        if len >= capacity {
            health.problem(HealthStatus::Unhealthy, format!("event queue full ({}/{})", len, capacity))
        } else if ratio > self.degraded_ratio {
            health.problem(HealthStatus::Degraded, format!("event queue {:.0}% full", ratio * 100.0))
        } else {
            health
        }
    }
}

/// Events dropped since the previous check.
pub struct DroppedEventsChecker {
    sink: EventSink,
    seen: AtomicU64,
}

impl DroppedEventsChecker {
    /// Create a checker for `sink`
    pub fn new(sink: EventSink) -> Self {
        let seen = AtomicU64::new(sink.dropped());
        Self { sink, seen }
    }
}

#[async_trait]
impl HealthChecker for DroppedEventsChecker {
    fn name(&self) -> &str {
        "dropped_events"
    }

    fn is_critical(&self) -> bool {
        false
    }

    async fn check_health(&self, now: DateTime<Utc>) -> ComponentHealth {
        let total = self.sink.dropped();
        let previous = self.seen.swap(total, Ordering::Relaxed);
        let recent = total.saturating_sub(previous);
        let health = ComponentHealth::new(self.name(), now)
            .detail("dropped_total", total)
            .detail("dropped_since_last_check", recent);
        if recent > 0 {
            health.problem(HealthStatus::Degraded, format!("{} events dropped since last check", recent))
        } else {
            health
        }
    }
}

/// Share of deliveries that failed after every retry.
pub struct DeliveryChecker {
    engine: Arc<NotificationEngine>,
    max_failure_ratio: f64,
    min_deliveries: u64,
}

impl DeliveryChecker {
    /// Degraded once at least `min_deliveries` finished and more than
    /// `max_failure_ratio` of them failed.
    pub fn new(engine: Arc<NotificationEngine>, max_failure_ratio: f64, min_deliveries: u64) -> Self {
        Self {
            engine,
            max_failure_ratio,
            min_deliveries,
        }
    }
}

#[async_trait]
impl HealthChecker for DeliveryChecker {
    fn name(&self) -> &str {
        "notification_delivery"
    }

    fn is_critical(&self) -> bool {
        false
    }

    async fn check_health(&self, now: DateTime<Utc>) -> ComponentHealth {
        let stats = self.engine.stats();
        let finished = stats.delivered + stats.failed;
        let ratio = if finished == 0 { 0.0 } else { stats.failed as f64 / finished as f64 };
        let health = ComponentHealth::new(self.name(), now)
            .detail("delivered", stats.delivered)
            .detail("failed", stats.failed)
            .detail("retries", stats.retries)
            .detail("failure_ratio", ratio)
            .detail("channels", stats.channels);
        if finished >= self.min_deliveries && ratio > self.max_failure_ratio {
            health.problem(
                HealthStatus::Degraded,
                format!("{:.0}% of deliveries failed", ratio * 100.0),
            )
        } else {
            health
        }
    }
}

/// Liveness of the periodic background tasks.
pub struct TaskLivenessChecker {
    scheduler: TaskRegistry,
}

impl TaskLivenessChecker {
    /// Create a checker over `scheduler`
    pub fn new(scheduler: TaskRegistry) -> Self {
        Self { scheduler }
    }
}

#[async_trait]
impl HealthChecker for TaskLivenessChecker {
    fn name(&self) -> &str {
        "background_tasks"
    }

    async fn check_health(&self, now: DateTime<Utc>) -> ComponentHealth {
        let tasks = self.scheduler.periodic_status();
        let dead: Vec<String> = tasks.iter().filter(|t| !t.alive).map(|t| t.name.clone()).collect();
        let health = ComponentHealth::new(self.name(), now)
            .detail("periodic_tasks", tasks.len())
            .detail("pending_timers", self.scheduler.pending());
        if dead.is_empty() {
            health
        } else {
            health
                .detail("dead", dead.clone())
                .problem(HealthStatus::Unhealthy, format!("stopped tasks: {}", dead.join(", ")))
        }
    }
}

/// Entries waiting to be indexed.
pub struct LogBacklogChecker {
    index: Arc<LogIndex>,
    max_pending: usize,
}

impl LogBacklogChecker {
    /// Degraded when more than `max_pending` entries wait for a batch.
    pub fn new(index: Arc<LogIndex>, max_pending: usize) -> Self {
        Self { index, max_pending }
    }
}

#[async_trait]
impl HealthChecker for LogBacklogChecker {
    fn name(&self) -> &str {
        "log_index"
    }

    fn is_critical(&self) -> bool {
        false
    }

    async fn check_health(&self, now: DateTime<Utc>) -> ComponentHealth {
        let stats = self.index.stats();
        let health = ComponentHealth::new(self.name(), now)
            .detail("entries", stats.entries)
            .detail("pending", stats.pending)
            .detail("evicted", stats.evicted);
        if stats.pending > self.max_pending {
            health.problem(
                HealthStatus::Degraded,
                format!("{} entries waiting to be indexed", stats.pending),
            )
        } else {
            health
        }
    }
}

/// Runs every checker and caches the combined report.
pub struct HealthMonitor {
    checkers: Vec<Arc<dyn HealthChecker>>,
    clock: SharedClock,
    started: Instant,
    last_report: RwLock<Option<HealthReport>>,
}

impl HealthMonitor {
    /// Create a monitor without checkers
    pub fn new(clock: SharedClock) -> Self {
        Self {
            checkers: Vec::new(),
            clock,
            started: Instant::now(),
            last_report: RwLock::new(None),
        }
    }

    /// Add a checker
    pub fn add_checker(&mut self, checker: Arc<dyn HealthChecker>) {
        self.checkers.push(checker);
    }

    /// Names of the registered checkers
    pub fn checker_names(&self) -> Vec<String> {
        self.checkers.iter().map(|c| c.name().to_string()).collect()
    }

    /// Run every check and cache the report
    pub async fn check_health(&self) -> HealthReport {
        let now = self.clock.now();
        let mut components = BTreeMap::new();
        let mut overall = HealthStatus::Healthy;

        for checker in &self.checkers {
            let started = Instant::now();
            let mut health = checker.check_health(now).await;
            health.response_time_ms = Some(started.elapsed().as_secs_f64() * 1000.0);

            // Non-critical components can only degrade the pipeline.
            let contributes = match (health.status, checker.is_critical()) {
                (HealthStatus::Unhealthy, false) => HealthStatus::Degraded,
                (status, _) => status,
            };
            overall = overall.max(contributes);
            components.insert(checker.name().to_string(), health);
        }

        let report = HealthReport {
            status: overall,
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: self.started.elapsed().as_secs(),
            timestamp: now,
            components,
        };
        *self.last_report.write() = Some(report.clone());

        match overall {
            HealthStatus::Healthy => debug!("Health check completed: all components healthy"),
            HealthStatus::Degraded => warn!(warnings = ?report.warnings(), "Health check completed: pipeline degraded"),
            HealthStatus::Unhealthy => error!(warnings = ?report.warnings(), "Health check completed: pipeline unhealthy"),
        }
        report
    }

    /// Latest cached report
    pub fn last_report(&self) -> Option<HealthReport> {
        self.last_report.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{LogIndexConfig, NotificationConfig};
    use crate::events::PipelineEvent;
    use crate::logs::{LogContext, LogLevel};

    fn clock() -> SharedClock {
        Arc::new(ManualClock::at_epoch_2024())
    }

    fn resolved(id: &str) -> PipelineEvent {
        PipelineEvent::ErrorResolved {
            error_id: id.to_string(),
            by: "test".to_string(),
        }
    }

    #[tokio::test]
    async fn test_queue_saturation() {
        let (sink, _rx) = EventSink::channel(4);
        let checker = QueueSaturationChecker::new(sink.clone(), 0.5);
        assert_eq!(checker.check_health(Utc::now()).await.status, HealthStatus::Healthy);

        for i in 0..3 {
            sink.emit(resolved(&format!("e-{}", i)));
        }
        let health = checker.check_health(Utc::now()).await;
        assert_eq!(health.status, HealthStatus::Degraded);
        assert_eq!(health.details["depth"], 3);

        sink.emit(resolved("e-3"));
        assert_eq!(checker.check_health(Utc::now()).await.status, HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_dropped_events_only_counts_new_drops() {
        let (sink, _rx) = EventSink::channel(1);
        let checker = DroppedEventsChecker::new(sink.clone());
        sink.emit(resolved("a"));
        sink.emit(resolved("b"));
        assert_eq!(checker.check_health(Utc::now()).await.status, HealthStatus::Degraded);
        assert_eq!(checker.check_health(Utc::now()).await.status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_log_backlog() {
        let index = Arc::new(LogIndex::new(
            LogIndexConfig {
                batch_size: 1_000,
                ..LogIndexConfig::default()
            },
            clock(),
        ));
        let checker = LogBacklogChecker::new(Arc::clone(&index), 2);
        for i in 0..3 {
            index.log(LogLevel::Info, format!("entry {}", i), LogContext::new());
        }
        assert_eq!(checker.check_health(Utc::now()).await.status, HealthStatus::Degraded);
        index.flush();
        assert_eq!(checker.check_health(Utc::now()).await.status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_monitor_combines_and_caches() {
        let (sink, _rx) = EventSink::channel(1);
        let engine = Arc::new(NotificationEngine::new(NotificationConfig::default(), clock(), TaskRegistry::new()));
        let mut monitor = HealthMonitor::new(clock());
        monitor.add_checker(Arc::new(QueueSaturationChecker::new(sink.clone(), 0.8)));
        monitor.add_checker(Arc::new(DroppedEventsChecker::new(sink.clone())));
        monitor.add_checker(Arc::new(DeliveryChecker::new(engine, 0.5, 10)));
        monitor.add_checker(Arc::new(TaskLivenessChecker::new(TaskRegistry::new())));
        assert!(monitor.last_report().is_none());

        let report = monitor.check_health().await;
        assert_eq!(report.status, HealthStatus::Healthy);
        assert_eq!(report.components.len(), 4);
        assert!(report.warnings().is_empty());

        // Full queue is critical, the drop is not
        sink.emit(resolved("first"));
        sink.emit(resolved("overflow"));
        let report = monitor.check_health().await;
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert_eq!(report.warnings().len(), 2);
        assert_eq!(monitor.last_report().unwrap().status, HealthStatus::Unhealthy);
    }

    #[test]
    fn test_health_status_serialization() {
        let json = serde_json::to_string(&HealthStatus::Degraded).unwrap();
        assert_eq!(json, "\"degraded\"");
        let back: HealthStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back, HealthStatus::Degraded);
        assert!(HealthStatus::Unhealthy > HealthStatus::Degraded);
    }
}

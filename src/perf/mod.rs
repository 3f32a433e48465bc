//! Metric aggregator.
//!
//! Host operations record [`MetricSample`]s inline through a [`Timer`]. Two
//! periodic cycles do the heavy work: [`MetricAggregator::aggregate`] purges
//! samples past retention and rebuilds every [`PerfStats`] from a snapshot of
//! the window, and [`MetricAggregator::evaluate_alerts`] checks alert rules and
//! emits an [`AlertEvent`] for each firing.
//!
//! Aggregates are never updated in place. A fresh map is built and swapped in,
//! so readers always see one complete generation.

mod alerts;
mod stats;
mod timer;

pub use alerts::{AlertCondition, AlertRule, AlertScope, ComparisonOperator};
pub use stats::{export_prometheus, percentile, MetricSample, PerfStats, Trend};
pub use timer::{Timer, TimerIds};

use crate::clock::{secs_to_chrono, to_chrono, SharedClock};
use crate::config::MetricsConfig;
use crate::error::{Error, Result};
use crate::events::{AlertEvent, EventSink, PipelineEvent};
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use timer::ResourceSampler;
use tracing::{debug, info};
use uuid::Uuid;

/// Metric aggregator.
pub struct MetricAggregator {
    config: RwLock<MetricsConfig>,
    clock: SharedClock,
    samples: Mutex<VecDeque<MetricSample>>,
    stats: ArcSwap<HashMap<String, PerfStats>>,
    last_aggregated: RwLock<Option<DateTime<Utc>>>,
    rules: DashMap<String, AlertRule>,
    last_fired: DashMap<String, DateTime<Utc>>,
    sampler: ResourceSampler,
    sink: EventSink,
}

impl MetricAggregator {
    /// Creates an aggregator that emits alert events into `sink`.
    pub fn new(config: MetricsConfig, clock: SharedClock, sink: EventSink) -> Self {
        Self {
            config: RwLock::new(config),
            clock,
            samples: Mutex::new(VecDeque::new()),
            stats: ArcSwap::from_pointee(HashMap::new()),
            last_aggregated: RwLock::new(None),
            rules: DashMap::new(),
            last_fired: DashMap::new(),
            sampler: ResourceSampler::new(),
            sink,
        }
    }

    /// Replaces the configuration; applies from the next recorded sample or cycle.
    pub fn update_config(&self, config: MetricsConfig) {
        *self.config.write() = config;
    }

    /// Current configuration.
    pub fn config(&self) -> MetricsConfig {
        self.config.read().clone()
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub(crate) fn sample_memory(&self) -> Option<u64> {
        if self.config.read().capture_resource_usage {
            self.sampler.memory_bytes()
        } else {
            None
        }
    }

    /// Starts timing one operation.
    pub fn create_timer(self: &Arc<Self>, operation: &str, category: &str, ids: TimerIds) -> Timer {
        let memory_before = self.sample_memory();
        Timer::start(Arc::clone(self), operation, category, ids, memory_before)
    }

    /// Records one finished operation. The oldest sample is evicted at capacity.
    pub fn record(&self, sample: MetricSample) {
        let (enabled, max_samples) = {
            let config = self.config.read();
            (config.enabled, config.max_samples)
        };
        if !enabled {
            return;
        }
        crate::utils::metrics::record_operation(&sample.category, sample.success);
        let mut samples = self.samples.lock();
        samples.push_back(sample);
        while samples.len() > max_samples {
            samples.pop_front();
        }
    }

    /// Samples currently retained.
    pub fn sample_count(&self) -> usize {
        self.samples.lock().len()
    }

    /// Purges samples past retention and rebuilds all aggregates. Returns the
    /// number of operations aggregated.
    pub fn aggregate(&self) -> usize {
        let started = Instant::now();
        let (retention, threshold_pct, min_samples) = {
            let config = self.config.read();
            (config.retention(), config.trend_threshold_pct, config.trend_min_samples)
        };
        let now = self.clock.now();
        let cutoff = now - to_chrono(retention);

        let snapshot: Vec<MetricSample> = {
            let mut samples = self.samples.lock();
            let before = samples.len();
            samples.retain(|s| s.timestamp >= cutoff);
            let purged = before - samples.len();
            if purged > 0 {
                debug!(purged, "Purged samples past retention");
            }
            samples.iter().cloned().collect()
        };

        let mut grouped: HashMap<&str, Vec<&MetricSample>> = HashMap::new();
        for sample in &snapshot {
            grouped.entry(sample.operation.as_str()).or_default().push(sample);
        }

        let mut next = HashMap::with_capacity(grouped.len());
        for (operation, mut window) in grouped {
            window.sort_by_key(|s| s.timestamp);
            if let Some(stats) = stats::compute(operation, &window, threshold_pct, min_samples, now) {
                next.insert(operation.to_string(), stats);
            }
        }

        let operations = next.len();
        self.stats.store(Arc::new(next));
        *self.last_aggregated.write() = Some(now);

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        crate::utils::metrics::record_aggregation(elapsed_ms, operations);
        debug!(operations, samples = snapshot.len(), elapsed_ms, "Aggregation cycle complete");
        operations
    }

    /// Latest aggregate of one operation.
    pub fn perf_stats(&self, operation: &str) -> Option<PerfStats> {
        self.stats.load().get(operation).cloned()
    }

    /// Latest aggregates of every operation, sorted by name.
    pub fn all_perf_stats(&self) -> Vec<PerfStats> {
        let mut all: Vec<PerfStats> = self.stats.load().values().cloned().collect();
        all.sort_by(|a, b| a.operation.cmp(&b.operation));
        all
    }

    /// When the last aggregation cycle ran.
    pub fn last_aggregated(&self) -> Option<DateTime<Utc>> {
        *self.last_aggregated.read()
    }

    /// Adds or replaces an alert rule.
    pub fn add_rule(&self, rule: AlertRule) -> Result<()> {
        rule.validate()?;
        info!(rule_id = %rule.id, condition = rule.condition.as_str(), "Alert rule registered");
        self.rules.insert(rule.id.clone(), rule);
        Ok(())
    }

    /// Removes an alert rule and its cooldown state.
    pub fn remove_rule(&self, rule_id: &str) -> Result<AlertRule> {
        self.last_fired.remove(rule_id);
        self.rules
            .remove(rule_id)
            .map(|(_, rule)| rule)
            .ok_or_else(|| Error::not_found("alert rule", rule_id))
    }

    /// Enables or disables a rule.
    pub fn set_rule_enabled(&self, rule_id: &str, enabled: bool) -> Result<()> {
        let mut rule = self
            .rules
            .get_mut(rule_id)
            .ok_or_else(|| Error::not_found("alert rule", rule_id))?;
        rule.enabled = enabled;
        Ok(())
    }

    /// All rules, sorted by id.
    pub fn rules(&self) -> Vec<AlertRule> {
        let mut rules: Vec<AlertRule> = self.rules.iter().map(|r| r.value().clone()).collect();
        rules.sort_by(|a, b| a.id.cmp(&b.id));
        rules
    }

    /// When a rule last fired.
    pub fn last_fired(&self, rule_id: &str) -> Option<DateTime<Utc>> {
        self.last_fired.get(rule_id).map(|t| *t)
    }

    /// Evaluates every enabled rule and emits an event for each firing.
    ///
    /// A rule still inside its cooldown is skipped before its window is read.
    pub fn evaluate_alerts(&self) -> Vec<AlertEvent> {
        let now = self.clock.now();
        let rules: Vec<AlertRule> = self
            .rules
            .iter()
            .filter(|r| r.enabled)
            .map(|r| r.value().clone())
            .collect();

        let mut fired = Vec::new();
        for rule in rules {
            if let Some(last) = self.last_fired(&rule.id) {
                if now < last + secs_to_chrono(rule.cooldown_secs) {
                    continue;
                }
            }

            let window_start = now - secs_to_chrono(rule.window_secs);
            let value = {
                let samples = self.samples.lock();
                let in_window: Vec<&MetricSample> = samples
                    .iter()
                    .filter(|s| s.timestamp >= window_start && s.timestamp <= now && rule.scope.matches(s))
                    .collect();
                rule.reduce(&in_window).map(|v| (v, in_window.len()))
            };
            let Some((value, sample_count)) = value else {
                continue;
            };
            if !rule.operator.compare(value, rule.threshold) {
                continue;
            }

            self.last_fired.insert(rule.id.clone(), now);
            let event = AlertEvent {
                id: Uuid::new_v4().to_string(),
                rule_id: rule.id.clone(),
                rule_name: rule.name.clone(),
                severity: rule.severity,
                condition: rule.condition.as_str().to_string(),
                operator: rule.operator.as_str().to_string(),
                threshold: rule.threshold,
                value,
                window_secs: rule.window_secs,
                operation: rule.scope.operation.clone(),
                category: rule.scope.category.clone(),
                sample_count,
                fired_at: now,
            };
            crate::utils::metrics::record_alert_fired(&rule.id);
            info!(
                rule_id = %rule.id,
                alert_id = %event.id,
                value,
                threshold = rule.threshold,
                severity = %rule.severity,
                "Alert rule fired"
            );
            self.sink.emit(PipelineEvent::Alert(event.clone()));
            fired.push(event);
        }
        fired
    }

    /// Drops every sample and aggregate.
    pub fn clear(&self) {
        self.samples.lock().clear();
        self.stats.store(Arc::new(HashMap::new()));
    }
}

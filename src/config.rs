use crate::error::{Error, Result};
use crate::events::Severity;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

/// Main pipeline configuration, aggregating configurations for the different components.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Master switch. When false, inline calls are no-ops and no background task runs.
    pub enabled: bool,
    /// Trace recorder settings.
    pub tracing: TracingConfig,
    /// Metric aggregation and alert evaluation settings.
    pub metrics: MetricsConfig,
    /// Log index batching and retention.
    pub logs: LogIndexConfig,
    /// Error classification, deduplication and lifecycle settings.
    pub errors: ErrorTrackingConfig,
    /// Notification delivery, retry and history settings.
    pub notifications: NotificationConfig,
    /// Internal event queue between producers and the notification engine.
    pub dispatcher: DispatcherConfig,
}

impl PipelineConfig {
    /// Validates the entire configuration.
    pub fn validate(&self) -> Result<()> {
        self.tracing.validate()?;
        self.metrics.validate()?;
        self.logs.validate()?;
        self.errors.validate()?;
        self.notifications.validate()?;
        self.dispatcher.validate()?;
        Ok(())
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tracing: TracingConfig::default(),
            metrics: MetricsConfig::default(),
            logs: LogIndexConfig::default(),
            errors: ErrorTrackingConfig::default(),
            notifications: NotificationConfig::default(),
            dispatcher: DispatcherConfig::default(),
        }
    }
}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<PipelineConfig> {
    let content = std::fs::read_to_string(path)?;
    let config: PipelineConfig = toml::from_str(&content)?;
    config.validate()?;
    Ok(config)
}

/// Applies `ZOLA_TELEMETRY_*` environment variables on top of a loaded configuration.
///
/// Unparseable values are ignored and reported in the returned list so the caller can log them.
pub fn apply_env_overrides(config: &mut PipelineConfig) -> Vec<String> {
    let mut rejected = Vec::new();

    let read = |key: &str| -> Option<String> {
        std::env::var(key).ok().filter(|v| !v.trim().is_empty())
    };

    if let Some(v) = read("ZOLA_TELEMETRY_ENABLED") {
        match v.parse::<bool>() {
            Ok(b) => config.enabled = b,
            Err(_) => rejected.push(format!("ZOLA_TELEMETRY_ENABLED={}", v)),
        }
    }
    if let Some(v) = read("ZOLA_TELEMETRY_SAMPLE_RATE") {
        match v.parse::<f64>() {
            Ok(rate) => config.tracing.sample_rate = rate,
            Err(_) => rejected.push(format!("ZOLA_TELEMETRY_SAMPLE_RATE={}", v)),
        }
    }
    if let Some(v) = read("ZOLA_TELEMETRY_LOG_MAX_ENTRIES") {
        match v.parse::<usize>() {
            Ok(n) => config.logs.max_entries = n,
            Err(_) => rejected.push(format!("ZOLA_TELEMETRY_LOG_MAX_ENTRIES={}", v)),
        }
    }
    if let Some(v) = read("ZOLA_TELEMETRY_FINGERPRINT_SALT") {
        config.errors.fingerprint_salt = v;
    }
    rejected
}

/// Trace recorder configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TracingConfig {
    /// Whether traces are recorded at all.
    pub enabled: bool,
    /// Probability in `[0, 1]` that a new trace is recorded.
    pub sample_rate: f64,
    /// Maximum spans in one trace; further `start_span` calls return the parent context.
    pub max_spans_per_trace: usize,
    /// Maximum concurrently active traces.
    pub max_active_traces: usize,
    /// Age after which an unfinished trace is force-failed by the sweep.
    pub max_trace_age_secs: u64,
    /// Capacity of the completed-trace buffer.
    pub completed_capacity: usize,
    /// Interval of the expiry sweep.
    pub sweep_interval_secs: u64,
}

impl TracingConfig {
    /// Validates tracing configuration.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.sample_rate) {
            return Err(Error::config("tracing.sample_rate must be between 0.0 and 1.0."));
        }
        if self.max_spans_per_trace == 0 {
            return Err(Error::config("tracing.max_spans_per_trace must be at least 1."));
        }
        if self.max_active_traces == 0 || self.completed_capacity == 0 {
            return Err(Error::config("tracing trace capacities must be positive."));
        }
        if self.sweep_interval_secs == 0 {
            return Err(Error::config("tracing.sweep_interval_secs must be positive."));
        }
        Ok(())
    }

    /// Age limit of an active trace.
    pub fn max_trace_age(&self) -> Duration {
        Duration::from_secs(self.max_trace_age_secs)
    }
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sample_rate: 1.0,
            max_spans_per_trace: 256,
            max_active_traces: 10_000,
            max_trace_age_secs: 300,
            completed_capacity: 1_000,
            sweep_interval_secs: 30,
        }
    }
}

/// Metric aggregation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Whether operation samples are recorded.
    pub enabled: bool,
    /// Samples older than this are purged on the aggregation cycle.
    pub retention_secs: u64,
    /// Hard cap on retained samples; oldest are evicted first.
    pub max_samples: usize,
    /// Period of the aggregation cycle.
    pub aggregation_interval_secs: u64,
    /// Period of the alert evaluation cycle.
    pub alert_interval_secs: u64,
    /// Percentage change between window halves that flags a trend.
    pub trend_threshold_pct: f64,
    /// Minimum samples before a trend other than stable is reported.
    pub trend_min_samples: usize,
    /// Capture process memory before/after each timed operation.
    pub capture_resource_usage: bool,
}

impl MetricsConfig {
    /// Validates metrics configuration.
    pub fn validate(&self) -> Result<()> {
        if self.max_samples == 0 {
            return Err(Error::config("metrics.max_samples must be positive."));
        }
        if self.aggregation_interval_secs == 0 || self.alert_interval_secs == 0 {
            return Err(Error::config("metrics cycle intervals must be positive."));
        }
        if self.trend_threshold_pct < 0.0 {
            return Err(Error::config("metrics.trend_threshold_pct cannot be negative."));
        }
        Ok(())
    }

    /// Retention window of samples.
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            retention_secs: 3_600,
            max_samples: 100_000,
            aggregation_interval_secs: 60,
            alert_interval_secs: 30,
            trend_threshold_pct: 10.0,
            trend_min_samples: 10,
            capture_resource_usage: false,
        }
    }
}

/// Log index configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogIndexConfig {
    /// Whether entries are ingested.
    pub enabled: bool,
    /// Entries queued before a batch is indexed.
    pub batch_size: usize,
    /// Period of the background flush.
    pub flush_interval_ms: u64,
    /// Maximum retained entries.
    pub max_entries: usize,
    /// Maximum age of a retained entry.
    pub max_age_secs: u64,
    /// Default page size for searches that do not set a limit.
    pub default_page_size: usize,
    /// Forward host `tracing` events into the index.
    pub capture_tracing_events: bool,
}

impl LogIndexConfig {
    /// Validates log index configuration.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::config("logs.batch_size must be at least 1."));
        }
        if self.max_entries == 0 {
            return Err(Error::config("logs.max_entries must be positive."));
        }
        if self.flush_interval_ms == 0 {
            return Err(Error::config("logs.flush_interval_ms must be positive."));
        }
        if self.default_page_size == 0 {
            return Err(Error::config("logs.default_page_size must be positive."));
        }
        Ok(())
    }

    /// Age limit of a retained entry.
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }
}

impl Default for LogIndexConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            batch_size: 100,
            flush_interval_ms: 1_000,
            max_entries: 50_000,
            max_age_secs: 24 * 3_600,
            default_page_size: 50,
            capture_tracing_events: false,
        }
    }
}

/// Error tracker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorTrackingConfig {
    /// Whether failures are tracked.
    pub enabled: bool,
    /// Installation-specific key mixed into every fingerprint.
    pub fingerprint_salt: String,
    /// Stack frames kept in the stack signature.
    pub stack_frames: usize,
    /// Occurrences kept per tracked error.
    pub max_occurrences_per_error: usize,
    /// Distinct operations, subjects and users remembered per tracked error.
    pub max_affected_per_error: usize,
    /// Maximum tracked error groups.
    pub max_errors: usize,
    /// Rolling window of burst detection.
    pub burst_window_secs: u64,
    /// Occurrences inside the burst window that flag a burst.
    pub burst_threshold: usize,
    /// Percentage band for hour-over-hour trend.
    pub trend_band_pct: f64,
    /// Unresolved errors quiet for this long are resolved by `system`.
    pub auto_resolve_after_secs: u64,
    /// Resolved errors older than this are purged.
    pub retention_secs: u64,
    /// Lowest severity that produces a notification event for a new error.
    pub notify_min_severity: Severity,
    /// Period of the lifecycle sweep.
    pub sweep_interval_secs: u64,
}

impl ErrorTrackingConfig {
    /// Validates error tracking configuration.
    pub fn validate(&self) -> Result<()> {
        if self.fingerprint_salt.is_empty() {
            return Err(Error::config("errors.fingerprint_salt cannot be empty."));
        }
        if self.max_errors == 0 || self.max_occurrences_per_error == 0 || self.max_affected_per_error == 0 {
            return Err(Error::config("errors capacities must be positive."));
        }
        if self.burst_threshold == 0 {
            return Err(Error::config("errors.burst_threshold must be at least 1."));
        }
        if self.sweep_interval_secs == 0 {
            return Err(Error::config("errors.sweep_interval_secs must be positive."));
        }
        Ok(())
    }

    /// Burst detection window.
    pub fn burst_window(&self) -> Duration {
        Duration::from_secs(self.burst_window_secs)
    }

    /// Quiet period before auto-resolution.
    pub fn auto_resolve_after(&self) -> Duration {
        Duration::from_secs(self.auto_resolve_after_secs)
    }

    /// Retention of resolved errors.
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

impl Default for ErrorTrackingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fingerprint_salt: Uuid::new_v4().to_string(),
            stack_frames: 5,
            max_occurrences_per_error: 50,
            max_affected_per_error: 1_000,
            max_errors: 5_000,
            burst_window_secs: 60,
            burst_threshold: 5,
            trend_band_pct: 20.0,
            auto_resolve_after_secs: 7 * 24 * 3_600,
            retention_secs: 30 * 24 * 3_600,
            notify_min_severity: Severity::High,
            sweep_interval_secs: 300,
        }
    }
}

/// Notification engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Whether notifications are delivered at all.
    pub enabled: bool,
    /// Maximum delivery attempts per channel, including the first.
    pub max_attempts: u32,
    /// Base delay of the exponential backoff.
    pub retry_base_delay_ms: u64,
    /// Upper bound of one backoff delay.
    pub retry_max_delay_ms: u64,
    /// Add up to 10% random jitter to each backoff delay.
    pub retry_jitter: bool,
    /// Maximum history entries kept.
    pub max_history: usize,
    /// Maximum notifications kept for lookup.
    pub max_notifications: usize,
    /// Timeout applied to a single HTTP delivery.
    pub delivery_timeout_secs: u64,
}

impl NotificationConfig {
    /// Validates notification configuration.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::config("notifications.max_attempts must be at least 1."));
        }
        if self.retry_base_delay_ms > self.retry_max_delay_ms {
            return Err(Error::config(
                "notifications.retry_base_delay_ms cannot exceed retry_max_delay_ms.",
            ));
        }
        if self.max_history == 0 || self.max_notifications == 0 {
            return Err(Error::config("notification capacities must be positive."));
        }
        Ok(())
    }

    /// Base backoff delay.
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    /// Backoff cap.
    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }

    /// Per-delivery timeout.
    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_secs(self.delivery_timeout_secs.max(1))
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
            retry_base_delay_ms: 1_000,
            retry_max_delay_ms: 60_000,
            retry_jitter: true,
            max_history: 10_000,
            max_notifications: 5_000,
            delivery_timeout_secs: 10,
        }
    }
}

/// Internal event queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Capacity of the bounded producer → notification queue.
    pub queue_capacity: usize,
    /// Period of the health evaluation.
    pub health_interval_secs: u64,
}

impl DispatcherConfig {
    /// Validates dispatcher configuration.
    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(Error::config("dispatcher.queue_capacity must be positive."));
        }
        if self.health_interval_secs == 0 {
            return Err(Error::config("dispatcher.health_interval_secs must be positive."));
        }
        Ok(())
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1_024,
            health_interval_secs: 30,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.metrics.trend_threshold_pct, 10.0);
        assert_eq!(config.errors.burst_threshold, 5);
        assert_eq!(config.errors.trend_band_pct, 20.0);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = PipelineConfig::default();
        config.tracing.sample_rate = 1.5;
        assert!(matches!(config.validate(), Err(Error::Config(msg)) if msg.contains("sample_rate")));

        let mut config = PipelineConfig::default();
        config.notifications.max_attempts = 0;
        assert!(matches!(config.validate(), Err(Error::Config(msg)) if msg.contains("max_attempts")));

        let mut config = PipelineConfig::default();
        config.errors.fingerprint_salt.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_partial_toml_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(
            file,
            "enabled = true\n[tracing]\nsample_rate = 0.25\n[logs]\nmax_entries = 100\n[errors]\nfingerprint_salt = \"site-a\""
        )
        .expect("write config");

        let config = load_config(file.path()).expect("config loads");
        assert_eq!(config.tracing.sample_rate, 0.25);
        assert_eq!(config.logs.max_entries, 100);
        assert_eq!(config.errors.fingerprint_salt, "site-a");
        // Untouched sections keep their defaults
        assert_eq!(config.logs.batch_size, 100);
    }

    #[test]
    fn test_load_invalid_toml_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "[tracing]\nsample_rate = 4.0").expect("write config");
        assert!(load_config(file.path()).is_err());
    }
}

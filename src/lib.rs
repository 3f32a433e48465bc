//! Zola Telemetry
//!
//! In-process telemetry pipeline for a content platform backend: distributed
//! traces, operation metrics with threshold alerts, an indexed structured log
//! store, deduplicated error tracking and a notification engine with retries,
//! suppression, grouping and escalation. Host code reaches all of it through the
//! [`Pipeline`] facade, whose inline calls never fail the host operation.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(unused_imports)]
#![warn(unused_variables)]
#![warn(dead_code)]

/// Time source abstraction shared by every component
pub mod clock;
/// Pipeline configuration, file loading and environment overrides
pub mod config;
/// Error types and error handling utilities
pub mod error;
/// Error tracking: fingerprinting, classification, trends and resolution
pub mod error_tracker;
/// Events flowing from producers to the notification engine
pub mod events;
/// Component health checks and the aggregated health report
pub mod health;
/// HTTP server for dashboard and admin endpoints
pub mod http_server;
/// Indexed structured log store
pub mod logs;
/// Notification engine: channels, templates, suppression, grouping, escalation
pub mod notify;
/// Operation metrics, aggregation and threshold alerts
pub mod perf;
/// The pipeline facade
pub mod pipeline;
/// Registry of one-shot timers and periodic tasks
pub mod scheduler;
/// Trace recorder
pub mod tracer;
/// Utility functions and helper modules
pub mod utils;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{load_config, PipelineConfig};
pub use error::{Error, Result};
pub use error_tracker::{ErrorContext, ErrorFilter, ErrorReport, ErrorTracker, TrackedError};
pub use events::{AlertEvent, ErrorEvent, EventKind, PipelineEvent, Severity};
pub use health::{HealthMonitor, HealthReport, HealthStatus};
pub use http_server::TelemetryServer;
pub use logs::{LogContext, LogEntry, LogIndex, LogIndexLayer, LogLevel, LogQuery};
pub use notify::{ChannelConfig, ChannelTarget, NotificationChannel, NotificationEngine, NotificationPayload};
pub use perf::{AlertRule, MetricAggregator, PerfStats};
pub use pipeline::{DashboardResponse, OperationHandle, OperationMonitor, Outcome, Pipeline, PipelineStats};
pub use tracer::{Trace, TraceContext, Tracer};

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// The current version of the crate, sourced from `Cargo.toml` at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Process-wide logging and metrics setup.
#[derive(Debug, Clone)]
pub struct InitConfig {
    /// Logging filter string, compatible with `tracing_subscriber::EnvFilter`.
    /// Example: "info,zola_telemetry=debug"
    pub log_filter: String,
    /// Install a Prometheus recorder for the crate's own `metrics` counters.
    pub enable_metrics: bool,
}

impl Default for InitConfig {
    fn default() -> Self {
        Self {
            log_filter: "info".to_string(),
            enable_metrics: true,
        }
    }
}

/// Installs the global `tracing` subscriber and, when enabled, the Prometheus
/// recorder.
///
/// Logs are written as JSON lines. When `log_index` is given, host events are
/// also indexed through a [`LogIndexLayer`]. Returns the Prometheus handle for
/// the `/metrics` endpoint.
///
/// Call once per process; a second call fails because a subscriber is already set.
pub fn init_with_config(config: InitConfig, log_index: Option<&Arc<LogIndex>>) -> Result<Option<PrometheusHandle>> {
    let filter = EnvFilter::try_new(&config.log_filter).unwrap_or_else(|e| {
        eprintln!("Invalid log filter '{}': {}; falling back to 'info'", config.log_filter, e);
        EnvFilter::new("info")
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json())
        .with(log_index.map(LogIndexLayer::new))
        .try_init()
        .map_err(|e| Error::config(format!("Failed to initialize global tracing subscriber: {}", e)))?;

    let handle = if config.enable_metrics {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .map_err(|e| Error::config(format!("Failed to install Prometheus recorder: {}", e)))?;
        info!("Prometheus recorder installed");
        Some(handle)
    } else {
        info!("Metrics recorder disabled by InitConfig");
        None
    };

    info!(version = VERSION, log_filter = %config.log_filter, index_host_logs = log_index.is_some(), "Zola telemetry initialized");
    Ok(handle)
}

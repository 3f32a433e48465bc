//! Self-metrics using the `metrics` facade.
//!
//! These record what the pipeline itself is doing (queue drops, deliveries,
//! suppressions, index sizes). They are exported by whatever recorder the
//! application installs, typically `metrics-exporter-prometheus` through
//! [`crate::init_with_config`]. Without a recorder every call is a no-op.

/// Records an event dropped because the dispatcher queue was full.
///
/// Metric name: `zola_telemetry_events_dropped_total` (counter)
pub fn record_event_dropped(event: &'static str) {
    metrics::counter!("zola_telemetry_events_dropped_total", "event" => event).increment(1);
}

/// Records one finished host operation.
///
/// Metric name: `zola_telemetry_operations_total` (counter)
/// Labels:
///   - `category`: operation category
///   - `status`: "success" or "failure"
pub fn record_operation(category: &str, success: bool) {
    metrics::counter!(
        "zola_telemetry_operations_total",
        "category" => category.to_string(),
        "status" => if success { "success" } else { "failure" }
    )
    .increment(1);
}

/// Records an alert rule firing.
pub fn record_alert_fired(rule_id: &str) {
    metrics::counter!("zola_telemetry_alerts_fired_total", "rule" => rule_id.to_string()).increment(1);
}

/// Records a tracked error occurrence.
pub fn record_error_tracked(category: &'static str, new_group: bool) {
    metrics::counter!(
        "zola_telemetry_errors_tracked_total",
        "category" => category,
        "new" => if new_group { "true" } else { "false" }
    )
    .increment(1);
}

/// Records a delivery outcome for one channel.
///
/// Metric name: `zola_telemetry_deliveries_total` (counter)
/// Labels:
///   - `channel`: channel kind
///   - `outcome`: "sent", "retry" or "failed"
pub fn record_delivery(channel_kind: &'static str, outcome: &'static str) {
    metrics::counter!(
        "zola_telemetry_deliveries_total",
        "channel" => channel_kind,
        "outcome" => outcome
    )
    .increment(1);
}

/// Records an event dropped by a suppression rule.
pub fn record_suppressed() {
    metrics::counter!("zola_telemetry_notifications_suppressed_total").increment(1);
}

/// Records the size of the log index after a flush or eviction.
pub fn set_log_index_size(entries: usize) {
    metrics::gauge!("zola_telemetry_log_index_entries").set(entries as f64);
}

/// Records the number of active traces after a sweep.
pub fn set_active_traces(traces: usize) {
    metrics::gauge!("zola_telemetry_active_traces").set(traces as f64);
}

/// Records a periodic task tick that panicked.
pub fn record_task_panic(task: &str) {
    metrics::counter!("zola_telemetry_task_panics_total", "task" => task.to_string()).increment(1);
}

/// Records how long an aggregation cycle took.
pub fn record_aggregation(duration_ms: f64, operations: usize) {
    metrics::histogram!("zola_telemetry_aggregation_duration_ms").record(duration_ms);
    metrics::gauge!("zola_telemetry_tracked_operations").set(operations as f64);
}

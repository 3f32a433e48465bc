//! Rolling statistics computed from the retained sample window.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One completed operation measurement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSample {
    /// Operation name.
    pub operation: String,
    /// Logical operation category.
    pub category: String,
    /// Elapsed time in milliseconds.
    pub duration_ms: f64,
    /// Whether the operation succeeded.
    pub success: bool,
    /// Failure description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Process memory change across the operation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_delta_bytes: Option<i64>,
    /// CPU time consumed, when the caller measured it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_delta_ms: Option<f64>,
    /// Trace the operation ran under.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<Uuid>,
    /// Upstream correlation id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// When the operation finished.
    pub timestamp: DateTime<Utc>,
}

impl MetricSample {
    /// A sample finishing at `timestamp` with no optional data.
    pub fn new(
        operation: impl Into<String>,
        category: impl Into<String>,
        duration_ms: f64,
        success: bool,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            operation: operation.into(),
            category: category.into(),
            duration_ms,
            success,
            error: None,
            memory_delta_bytes: None,
            cpu_delta_ms: None,
            trace_id: None,
            correlation_id: None,
            timestamp,
        }
    }
}

/// Direction of mean duration between the older and the recent half of the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    /// Recent operations are faster.
    Improving,
    /// No significant change, or too few samples.
    Stable,
    /// Recent operations are slower.
    Degrading,
}

/// Rolling aggregate for one operation name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerfStats {
    /// Operation name.
    pub operation: String,
    /// Category of the most recent sample.
    pub category: String,
    /// Samples in the window.
    pub count: usize,
    /// Successful samples.
    pub success_count: usize,
    /// Failed samples.
    pub failure_count: usize,
    /// Fastest duration (ms).
    pub min_ms: f64,
    /// Slowest duration (ms).
    pub max_ms: f64,
    /// Mean duration (ms).
    pub avg_ms: f64,
    /// Median duration (ms).
    pub p50_ms: f64,
    /// 95th percentile duration (ms).
    pub p95_ms: f64,
    /// 99th percentile duration (ms).
    pub p99_ms: f64,
    /// `failure_count / count`.
    pub error_rate: f64,
    /// Operations per second across the window.
    pub throughput_per_sec: f64,
    /// Duration trend.
    pub trend: Trend,
    /// Mean memory delta of samples that captured it.
    pub avg_memory_delta_bytes: Option<f64>,
    /// Oldest sample timestamp.
    pub window_start: DateTime<Utc>,
    /// Newest sample timestamp.
    pub window_end: DateTime<Utc>,
    /// When this aggregate was computed.
    pub computed_at: DateTime<Utc>,
}

/// Percentile by sorted-duration indexing: `sorted[floor(n·q)]`, clamped to the last element.
pub fn percentile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let index = ((sorted.len() as f64) * q).floor() as usize;
    sorted[index.min(sorted.len() - 1)]
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values.fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
    if count == 0 {
        None
    } else {
        Some(sum / count as f64)
    }
}

/// Compares the mean duration of the recent half against the older half.
///
/// `samples` must be ordered oldest first.
pub fn trend(samples: &[&MetricSample], threshold_pct: f64, min_samples: usize) -> Trend {
    if samples.len() < min_samples.max(2) {
        return Trend::Stable;
    }
    let (older, recent) = samples.split_at(samples.len() / 2);
    let (Some(older_mean), Some(recent_mean)) = (
        mean(older.iter().map(|s| s.duration_ms)),
        mean(recent.iter().map(|s| s.duration_ms)),
    ) else {
        return Trend::Stable;
    };
    if older_mean <= 0.0 {
        return Trend::Stable;
    }
    let change_pct = (recent_mean - older_mean) / older_mean * 100.0;
    if change_pct > threshold_pct {
        Trend::Degrading
    } else if change_pct < -threshold_pct {
        Trend::Improving
    } else {
        Trend::Stable
    }
}

/// Builds the aggregate of one operation. `samples` must be non-empty and ordered oldest first.
pub fn compute(
    operation: &str,
    samples: &[&MetricSample],
    threshold_pct: f64,
    min_samples: usize,
    computed_at: DateTime<Utc>,
) -> Option<PerfStats> {
    let first = samples.first()?;
    let last = samples.last()?;

    let mut durations: Vec<f64> = samples.iter().map(|s| s.duration_ms).collect();
    durations.sort_by(|a, b| a.total_cmp(b));
    let count = durations.len();
    let failure_count = samples.iter().filter(|s| !s.success).count();

    let span_secs = (last.timestamp - first.timestamp)
        .num_milliseconds()
        .max(0) as f64
        / 1000.0;
    let throughput = if span_secs > 0.0 {
        count as f64 / span_secs
    } else {
        count as f64
    };

    Some(PerfStats {
        operation: operation.to_string(),
        category: last.category.clone(),
        count,
        success_count: count - failure_count,
        failure_count,
        min_ms: durations[0],
        max_ms: durations[count - 1],
        avg_ms: durations.iter().sum::<f64>() / count as f64,
        p50_ms: percentile(&durations, 0.50),
        p95_ms: percentile(&durations, 0.95),
        p99_ms: percentile(&durations, 0.99),
        error_rate: failure_count as f64 / count as f64,
        throughput_per_sec: throughput,
        trend: trend(samples, threshold_pct, min_samples),
        avg_memory_delta_bytes: mean(samples.iter().filter_map(|s| s.memory_delta_bytes.map(|b| b as f64))),
        window_start: first.timestamp,
        window_end: last.timestamp,
        computed_at,
    })
}

/// Renders aggregates in the Prometheus text exposition format.
pub fn export_prometheus(stats: &[PerfStats]) -> String {
    let mut output = String::new();
    let gauges: [(&str, &str, fn(&PerfStats) -> f64); 6] = [
        ("zola_operation_duration_avg_ms", "Mean duration", |s| s.avg_ms),
        ("zola_operation_duration_p50_ms", "Median duration", |s| s.p50_ms),
        ("zola_operation_duration_p95_ms", "95th percentile duration", |s| s.p95_ms),
        ("zola_operation_duration_p99_ms", "99th percentile duration", |s| s.p99_ms),
        ("zola_operation_error_rate", "Failed share of operations", |s| s.error_rate),
        ("zola_operation_throughput_per_sec", "Operations per second", |s| s.throughput_per_sec),
    ];

    for (name, help, value) in gauges {
        output.push_str(&format!("# HELP {} {}\n", name, help));
        output.push_str(&format!("# TYPE {} gauge\n", name));
        for s in stats {
            output.push_str(&format!(
                "{}{{operation=\"{}\",category=\"{}\"}} {}\n",
                name,
                escape_label(&s.operation),
                escape_label(&s.category),
                value(s)
            ));
        }
    }

    output.push_str("# TYPE zola_operation_samples gauge\n");
    for s in stats {
        output.push_str(&format!(
            "zola_operation_samples{{operation=\"{}\",category=\"{}\"}} {}\n",
            escape_label(&s.operation),
            escape_label(&s.category),
            s.count
        ));
    }
    output
}

fn escape_label(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"").replace('\n', "\\n")
}

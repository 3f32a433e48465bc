//! Operation timer.
//!
//! A [`Timer`] is created when an operation starts and records exactly one
//! [`MetricSample`] when it is finished with [`Timer::success`] or
//! [`Timer::failure`]. A timer dropped without being finished records a
//! failure, so an early return or a panic in the host still counts.

use super::stats::MetricSample;
use super::MetricAggregator;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use sysinfo::{Pid, ProcessesToUpdate, System};
use uuid::Uuid;

/// Correlation identifiers attached to a sample.
#[derive(Debug, Clone, Default)]
pub struct TimerIds {
    /// Trace the operation runs under.
    pub trace_id: Option<Uuid>,
    /// Upstream correlation id.
    pub correlation_id: Option<String>,
}

/// Reads the resident memory of this process.
pub(crate) struct ResourceSampler {
    system: Mutex<System>,
    pid: Option<Pid>,
}

impl ResourceSampler {
    pub(crate) fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
            pid: sysinfo::get_current_pid().ok(),
        }
    }

    /// Resident memory in bytes, if the platform reports it.
    pub(crate) fn memory_bytes(&self) -> Option<u64> {
        let pid = self.pid?;
        let mut system = self.system.lock();
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]));
        system.process(pid).map(|p| p.memory())
    }
}

/// In-flight measurement of one operation.
pub struct Timer {
    aggregator: Arc<MetricAggregator>,
    operation: String,
    category: String,
    ids: TimerIds,
    start: Instant,
    memory_before: Option<u64>,
    cpu_delta_ms: Option<f64>,
    finished: bool,
}

impl Timer {
    pub(crate) fn start(
        aggregator: Arc<MetricAggregator>,
        operation: &str,
        category: &str,
        ids: TimerIds,
        memory_before: Option<u64>,
    ) -> Self {
        Self {
            aggregator,
            operation: operation.to_string(),
            category: category.to_string(),
            ids,
            start: Instant::now(),
            memory_before,
            cpu_delta_ms: None,
            finished: false,
        }
    }

    /// Attaches CPU time measured by the caller.
    pub fn set_cpu_delta(&mut self, cpu_ms: f64) {
        self.cpu_delta_ms = Some(cpu_ms);
    }

    /// Elapsed time so far.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Records a successful outcome and returns the elapsed time.
    pub fn success(mut self) -> Duration {
        self.finish(true, None)
    }

    /// Records a failed outcome and returns the elapsed time.
    pub fn failure(mut self, error: &str) -> Duration {
        self.finish(false, Some(error.to_string()))
    }

    fn finish(&mut self, success: bool, error: Option<String>) -> Duration {
        let elapsed = self.start.elapsed();
        if self.finished {
            return elapsed;
        }
        self.finished = true;

        let memory_delta_bytes = match (self.memory_before, self.aggregator.sample_memory()) {
            (Some(before), Some(after)) => Some(after as i64 - before as i64),
            _ => None,
        };
        let mut sample = MetricSample::new(
            self.operation.clone(),
            self.category.clone(),
            elapsed.as_secs_f64() * 1000.0,
            success,
            self.aggregator.now(),
        );
        sample.error = error;
        sample.memory_delta_bytes = memory_delta_bytes;
        sample.cpu_delta_ms = self.cpu_delta_ms;
        sample.trace_id = self.ids.trace_id;
        sample.correlation_id = self.ids.correlation_id.take();
        self.aggregator.record(sample);
        elapsed
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        if !self.finished {
            self.finish(false, Some("abandoned".to_string()));
        }
    }
}

//! Registry of every background task the pipeline owns.
//!
//! One-shot timers (delivery retries, escalations, group flushes) are keyed by
//! the id of the alert, error or group that owns them, so acknowledging an
//! alert cancels all of its timers with a single map removal. Periodic cycles
//! (aggregation, alert evaluation, log flush, sweeps) are registered by name and
//! stopped together when the pipeline is disabled.

use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, warn};

/// Identifier of one scheduled one-shot timer.
pub type TimerId = u64;

/// Snapshot of one periodic task for liveness checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeriodicTaskStatus {
    /// Registered name.
    pub name: String,
    /// Whether the task is still running.
    pub alive: bool,
}

/// Scheduled-task registry.
///
/// Cloning yields another handle onto the same registry.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    timers: Arc<DashMap<String, HashMap<TimerId, AbortHandle>>>,
    periodic: Arc<Mutex<Vec<(String, JoinHandle<()>)>>>,
    next_id: Arc<AtomicU64>,
}

impl TaskRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `task` once after `delay`, owned by `owner`.
    ///
    /// Returns `None` when called outside a tokio runtime. A timer that has
    /// started running its task is no longer cancellable.
    pub fn schedule_once<F>(&self, owner: &str, delay: Duration, task: F) -> Option<TimerId>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Ok(runtime) = Handle::try_current() else {
            warn!(owner, "No async runtime available, timer not scheduled");
            return None;
        };
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let timers = Arc::clone(&self.timers);
        let owner_key = owner.to_string();

        // The entry guard holds the shard lock until the abort handle is stored,
        // so a zero-delay timer cannot try to deregister before it is registered.
        let mut slot = self.timers.entry(owner.to_string()).or_default();
        let handle = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let fired = {
                let mut fired = false;
                if let Some(mut entry) = timers.get_mut(&owner_key) {
                    fired = entry.remove(&id).is_some();
                }
                timers.remove_if(&owner_key, |_, pending| pending.is_empty());
                fired
            };
            if fired {
                task.await;
            }
        });
        slot.insert(id, handle.abort_handle());
        drop(slot);

        debug!(owner, timer_id = id, delay_ms = delay.as_millis() as u64, "Timer scheduled");
        Some(id)
    }

    /// Cancels every pending timer owned by `owner`. Returns how many were cancelled.
    pub fn cancel_owner(&self, owner: &str) -> usize {
        match self.timers.remove(owner) {
            Some((_, pending)) => {
                for handle in pending.values() {
                    handle.abort();
                }
                if !pending.is_empty() {
                    debug!(owner, cancelled = pending.len(), "Timers cancelled");
                }
                pending.len()
            }
            None => 0,
        }
    }

    /// Cancels one timer.
    pub fn cancel(&self, owner: &str, id: TimerId) -> bool {
        let removed = self
            .timers
            .get_mut(owner)
            .and_then(|mut pending| pending.remove(&id));
        self.timers.remove_if(owner, |_, pending| pending.is_empty());
        match removed {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Number of pending timers owned by `owner`.
    pub fn pending_for(&self, owner: &str) -> usize {
        self.timers.get(owner).map(|p| p.len()).unwrap_or(0)
    }

    /// Number of pending timers across all owners.
    pub fn pending(&self) -> usize {
        self.timers.iter().map(|entry| entry.value().len()).sum()
    }

    /// Cancels every pending one-shot timer.
    pub fn cancel_all(&self) -> usize {
        let owners: Vec<String> = self.timers.iter().map(|e| e.key().clone()).collect();
        owners.iter().map(|owner| self.cancel_owner(owner)).sum()
    }

    /// Runs `tick` every `period` until stopped. The first run happens one
    /// period after registration. A panicking tick is logged and the task
    /// keeps its schedule.
    pub fn spawn_periodic<F, Fut>(&self, name: &str, period: Duration, tick: F) -> bool
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.spawn_periodic_inner(name, period, None, tick)
    }

    /// Like [`TaskRegistry::spawn_periodic`], but `wake` also triggers a run
    /// without waiting for the next period.
    pub fn spawn_periodic_with_wake<F, Fut>(&self, name: &str, period: Duration, wake: Arc<Notify>, tick: F) -> bool
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.spawn_periodic_inner(name, period, Some(wake), tick)
    }

    fn spawn_periodic_inner<F, Fut>(&self, name: &str, period: Duration, wake: Option<Arc<Notify>>, mut tick: F) -> bool
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let Ok(runtime) = Handle::try_current() else {
            warn!(task = name, "No async runtime available, periodic task not started");
            return false;
        };
        let period = period.max(Duration::from_millis(1));
        let task_name = name.to_string();
        let task_label = task_name.clone();
        let handle = runtime.spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                match &wake {
                    Some(wake) => {
                        tokio::select! {
                            _ = interval.tick() => {}
                            _ = wake.notified() => {}
                        }
                    }
                    None => {
                        interval.tick().await;
                    }
                }
                if AssertUnwindSafe(async { tick().await }).catch_unwind().await.is_err() {
                    crate::utils::metrics::record_task_panic(&task_label);
                    error!(task = %task_label, "Periodic task panicked, continuing on the next tick");
                }
            }
        });
        debug!(task = %task_name, period_ms = period.as_millis() as u64, "Periodic task started");
        self.periodic.lock().push((task_name, handle));
        true
    }

    /// Stops all periodic tasks.
    pub fn stop_periodic(&self) -> usize {
        let tasks: Vec<(String, JoinHandle<()>)> = std::mem::take(&mut *self.periodic.lock());
        for (name, handle) in &tasks {
            handle.abort();
            debug!(task = %name, "Periodic task stopped");
        }
        tasks.len()
    }

    /// Liveness of every registered periodic task.
    pub fn periodic_status(&self) -> Vec<PeriodicTaskStatus> {
        self.periodic
            .lock()
            .iter()
            .map(|(name, handle)| PeriodicTaskStatus {
                name: name.clone(),
                alive: !handle.is_finished(),
            })
            .collect()
    }

    /// Stops periodic tasks and cancels every timer.
    pub fn shutdown(&self) {
        let stopped = self.stop_periodic();
        let cancelled = self.cancel_all();
        debug!(stopped, cancelled, "Task registry shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_and_deregisters() {
        let registry = TaskRegistry::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        registry.schedule_once("alert-1", Duration::from_secs(5), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(registry.pending_for("alert-1"), 1);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(registry.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_owner_prevents_firing() {
        let registry = TaskRegistry::new();
        let fired = Arc::new(AtomicUsize::new(0));
        for delay in [1, 2] {
            let counter = Arc::clone(&fired);
            registry.schedule_once("alert-2", Duration::from_secs(delay), async move {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(registry.cancel_owner("alert-2"), 2);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(registry.cancel_owner("alert-2"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_ticks_until_stopped() {
        let registry = TaskRegistry::new();
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        registry.spawn_periodic("aggregate", Duration::from_secs(10), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
        assert!(registry.periodic_status()[0].alive);

        assert_eq!(registry.stop_periodic(), 1);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
        assert!(registry.periodic_status().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wake_runs_tick_before_the_period() {
        let registry = TaskRegistry::new();
        let wake = Arc::new(Notify::new());
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        registry.spawn_periodic_with_wake("flush", Duration::from_secs(60), Arc::clone(&wake), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        wake.notify_one();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 1);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 2);
        registry.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_tick_keeps_task_alive() {
        let registry = TaskRegistry::new();
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        registry.spawn_periodic("evaluate", Duration::from_secs(10), move || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("first tick fails");
                }
            }
        });

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 2);
        assert!(registry.periodic_status()[0].alive);
        registry.shutdown();
    }

    #[test]
    fn test_schedule_without_runtime_is_rejected() {
        let registry = TaskRegistry::new();
        assert!(registry.schedule_once("x", Duration::from_secs(1), async {}).is_none());
        assert_eq!(registry.pending(), 0);
    }
}

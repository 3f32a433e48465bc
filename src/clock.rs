//! Injectable wall-clock time.
//!
//! Every time-window decision in the pipeline (cooldowns, suppression windows,
//! retention, auto-resolve ages) reads a [`Clock`] instead of calling
//! `Utc::now()` directly. Production uses [`SystemClock`]; tests drive a
//! [`ManualClock`] forward explicitly.

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Source of wall-clock timestamps.
pub trait Clock: Send + Sync + 'static {
    /// Current time.
    fn now(&self) -> DateTime<Utc>;
}

/// Shared clock handle passed to every component.
pub type SharedClock = Arc<dyn Clock>;

/// Real time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[inline]
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock with millisecond resolution.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now_ms: Arc<AtomicI64>,
}

impl ManualClock {
    /// Creates a clock frozen at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now_ms: Arc::new(AtomicI64::new(start.timestamp_millis())),
        }
    }

    /// Creates a clock frozen at 2024-01-01T00:00:00Z.
    pub fn at_epoch_2024() -> Self {
        Self::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().unwrap_or_else(Utc::now))
    }

    /// Moves the clock forward.
    pub fn advance(&self, by: Duration) {
        self.now_ms.fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }

    /// Jumps to an absolute time.
    pub fn set(&self, to: DateTime<Utc>) {
        self.now_ms.store(to.timestamp_millis(), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        let ms = self.now_ms.load(Ordering::SeqCst);
        Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
    }
}

/// Longest window, cooldown or retention any rule may configure: 366 days.
pub const MAX_WINDOW_SECS: u64 = 366 * 24 * 60 * 60;

/// Upper bound of every converted duration, far enough from the `DateTime`
/// limits that adding it to or subtracting it from a current timestamp never
/// overflows.
const MAX_CHRONO_SECS: u64 = 100 * 365 * 24 * 60 * 60;

/// Converts a std duration to a chrono duration, saturating at one hundred years.
pub fn to_chrono(duration: Duration) -> ChronoDuration {
    let capped = duration.min(Duration::from_secs(MAX_CHRONO_SECS));
    ChronoDuration::from_std(capped).unwrap_or_else(|_| ChronoDuration::days(36_500))
}

/// Converts whole seconds to a chrono duration, saturating like [`to_chrono`].
pub fn secs_to_chrono(secs: u64) -> ChronoDuration {
    to_chrono(Duration::from_secs(secs))
}

/// Milliseconds between two timestamps as `f64`, never negative.
pub fn elapsed_ms(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    let micros = (to - from).num_microseconds().unwrap_or(i64::MAX);
    (micros.max(0) as f64) / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::at_epoch_2024();
        let start = clock.now();
        clock.advance(Duration::from_millis(1500));
        assert_eq!((clock.now() - start).num_milliseconds(), 1500);
    }

    #[test]
    fn test_elapsed_ms_never_negative() {
        let clock = ManualClock::at_epoch_2024();
        let later = clock.now() + ChronoDuration::seconds(2);
        assert_eq!(elapsed_ms(clock.now(), later), 2000.0);
        assert_eq!(elapsed_ms(later, clock.now()), 0.0);
    }

    #[test]
    fn test_huge_durations_saturate() {
        let clock = ManualClock::at_epoch_2024();
        let hundred_years = ChronoDuration::days(36_500);
        assert_eq!(secs_to_chrono(u64::MAX), hundred_years);
        assert_eq!(to_chrono(Duration::from_secs(10_000_000_000_000_000)), hundred_years);
        assert_eq!(secs_to_chrono(90), ChronoDuration::seconds(90));
        // Subtracting the saturated value from a current timestamp stays in range
        assert!(clock.now() - secs_to_chrono(u64::MAX) < clock.now());
    }
}

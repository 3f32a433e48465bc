//! Exponential backoff for notification retries.

use std::time::Duration;

/// Delay before retry number `attempt` (1-based): `base · 2^(attempt-1)`, capped at `max`.
///
/// With `jitter` enabled up to 10% is added on top, still capped at `max`.
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration, jitter: bool) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }

    let factor = 2u32.saturating_pow(attempt - 1);
    let capped = base.saturating_mul(factor).min(max);

    if !jitter {
        return capped;
    }
    let jitter_range = capped.as_secs_f64() * 0.1 * fastrand::f64();
    capped
        .saturating_add(Duration::from_secs_f64(jitter_range))
        .min(max)
}

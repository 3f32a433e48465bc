//! Utility modules shared by the pipeline components.

/// Self-metrics recorded through the `metrics` facade
pub mod metrics;

/// Exponential backoff with jitter
pub mod backoff;

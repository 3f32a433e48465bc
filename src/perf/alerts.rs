//! Threshold alert rules evaluated against the sample window.

use super::stats::MetricSample;
use crate::clock::MAX_WINDOW_SECS;
use crate::error::{Error, Result};
use crate::events::Severity;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Value a rule reduces its window to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertCondition {
    /// Mean duration in milliseconds.
    MeanDuration,
    /// Failed samples divided by all samples.
    FailureRatio,
    /// Samples per second over the rule window.
    Throughput,
    /// Mean memory delta in bytes, over samples that captured it.
    MeanMemoryDelta,
}

impl AlertCondition {
    /// Returns a static string representation of the condition.
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertCondition::MeanDuration => "mean_duration",
            AlertCondition::FailureRatio => "failure_ratio",
            AlertCondition::Throughput => "throughput",
            AlertCondition::MeanMemoryDelta => "mean_memory_delta",
        }
    }
}

/// Comparison between the observed value and the threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComparisonOperator {
    /// `>`
    #[serde(rename = ">")]
    Gt,
    /// `>=`
    #[serde(rename = ">=")]
    Gte,
    /// `<`
    #[serde(rename = "<")]
    Lt,
    /// `<=`
    #[serde(rename = "<=")]
    Lte,
    /// `==`
    #[serde(rename = "==")]
    Eq,
}

impl ComparisonOperator {
    /// Applies the comparison.
    pub fn compare(&self, value: f64, threshold: f64) -> bool {
        match self {
            ComparisonOperator::Gt => value > threshold,
            ComparisonOperator::Gte => value >= threshold,
            ComparisonOperator::Lt => value < threshold,
            ComparisonOperator::Lte => value <= threshold,
            ComparisonOperator::Eq => (value - threshold).abs() < f64::EPSILON,
        }
    }

    /// Returns the operator symbol.
    pub fn as_str(&self) -> &'static str {
        match self {
            ComparisonOperator::Gt => ">",
            ComparisonOperator::Gte => ">=",
            ComparisonOperator::Lt => "<",
            ComparisonOperator::Lte => "<=",
            ComparisonOperator::Eq => "==",
        }
    }
}

impl fmt::Display for ComparisonOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optional restriction of a rule to one operation and/or category.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertScope {
    /// Only samples of this operation.
    #[serde(default)]
    pub operation: Option<String>,
    /// Only samples of this category.
    #[serde(default)]
    pub category: Option<String>,
}

impl AlertScope {
    /// Whether a sample falls inside the scope.
    pub fn matches(&self, sample: &MetricSample) -> bool {
        self.operation.as_deref().map_or(true, |op| op == sample.operation)
            && self.category.as_deref().map_or(true, |cat| cat == sample.category)
    }
}

/// Threshold definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRule {
    /// Unique id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Whether the rule is evaluated.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Reduced value.
    pub condition: AlertCondition,
    /// Comparison.
    pub operator: ComparisonOperator,
    /// Threshold.
    pub threshold: f64,
    /// Evaluation window.
    pub window_secs: u64,
    /// Severity of the emitted alert.
    #[serde(default)]
    pub severity: Severity,
    /// Minimum time between two firings.
    #[serde(default)]
    pub cooldown_secs: u64,
    /// Scope filter.
    #[serde(default)]
    pub scope: AlertScope,
    /// Samples required before the rule is evaluated.
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
}

fn default_true() -> bool {
    true
}

fn default_min_samples() -> usize {
    1
}

impl AlertRule {
    /// A rule with no scope, medium severity, no cooldown and a minimum of one sample.
    pub fn new(
        id: impl Into<String>,
        condition: AlertCondition,
        operator: ComparisonOperator,
        threshold: f64,
        window_secs: u64,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            enabled: true,
            condition,
            operator,
            threshold,
            window_secs,
            severity: Severity::default(),
            cooldown_secs: 0,
            scope: AlertScope::default(),
            min_samples: 1,
        }
    }

    /// Sets the severity.
    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    /// Sets the cooldown.
    pub fn with_cooldown_secs(mut self, cooldown_secs: u64) -> Self {
        self.cooldown_secs = cooldown_secs;
        self
    }

    /// Sets the scope.
    pub fn with_scope(mut self, scope: AlertScope) -> Self {
        self.scope = scope;
        self
    }

    /// Sets the minimum sample count.
    pub fn with_min_samples(mut self, min_samples: usize) -> Self {
        self.min_samples = min_samples;
        self
    }

    /// Checks the rule can be evaluated.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::invalid_rule("alert rule id cannot be empty"));
        }
        if !self.threshold.is_finite() {
            return Err(Error::invalid_rule(format!("alert rule '{}' has a non-finite threshold", self.id)));
        }
        if self.window_secs == 0 {
            return Err(Error::invalid_rule(format!("alert rule '{}' needs a positive window", self.id)));
        }
        if self.window_secs > MAX_WINDOW_SECS || self.cooldown_secs > MAX_WINDOW_SECS {
            return Err(Error::invalid_rule(format!(
                "alert rule '{}': window and cooldown must be <= {} seconds",
                self.id, MAX_WINDOW_SECS
            )));
        }
        Ok(())
    }

    /// Reduces the in-window, in-scope samples to the condition value.
    ///
    /// Returns `None` when there are fewer than `min_samples` samples, or when
    /// no sample carries the measured quantity.
    pub fn reduce(&self, samples: &[&MetricSample]) -> Option<f64> {
        if samples.is_empty() || samples.len() < self.min_samples {
            return None;
        }
        let count = samples.len() as f64;
        match self.condition {
            AlertCondition::MeanDuration => Some(samples.iter().map(|s| s.duration_ms).sum::<f64>() / count),
            AlertCondition::FailureRatio => Some(samples.iter().filter(|s| !s.success).count() as f64 / count),
            AlertCondition::Throughput => Some(count / self.window_secs as f64),
            AlertCondition::MeanMemoryDelta => {
                let deltas: Vec<f64> = samples
                    .iter()
                    .filter_map(|s| s.memory_delta_bytes.map(|b| b as f64))
                    .collect();
                if deltas.is_empty() {
                    None
                } else {
                    Some(deltas.iter().sum::<f64>() / deltas.len() as f64)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample(duration_ms: f64, success: bool) -> MetricSample {
        MetricSample::new("render", "content", duration_ms, success, Utc::now())
    }

    #[test]
    fn test_reduce_conditions() {
        let samples = [sample(100.0, true), sample(300.0, false)];
        let refs: Vec<&MetricSample> = samples.iter().collect();

        let mean = AlertRule::new("r", AlertCondition::MeanDuration, ComparisonOperator::Gt, 150.0, 60);
        assert_eq!(mean.reduce(&refs), Some(200.0));

        let ratio = AlertRule::new("r", AlertCondition::FailureRatio, ComparisonOperator::Gt, 0.1, 60);
        assert_eq!(ratio.reduce(&refs), Some(0.5));

        let throughput = AlertRule::new("r", AlertCondition::Throughput, ComparisonOperator::Lt, 1.0, 10);
        assert_eq!(throughput.reduce(&refs), Some(0.2));

        let memory = AlertRule::new("r", AlertCondition::MeanMemoryDelta, ComparisonOperator::Gt, 0.0, 60);
        assert_eq!(memory.reduce(&refs), None);
    }

    #[test]
    fn test_min_samples_gate() {
        let samples = [sample(100.0, true)];
        let refs: Vec<&MetricSample> = samples.iter().collect();
        let rule = AlertRule::new("r", AlertCondition::MeanDuration, ComparisonOperator::Gt, 1.0, 60).with_min_samples(2);
        assert_eq!(rule.reduce(&refs), None);
    }

    #[test]
    fn test_operator_serde_uses_symbols() {
        assert_eq!(serde_json::to_string(&ComparisonOperator::Gte).unwrap(), "\">=\"");
        let op: ComparisonOperator = serde_json::from_str("\"<\"").unwrap();
        assert!(op.compare(1.0, 2.0));
    }

    #[test]
    fn test_scope_and_validation() {
        let scope = AlertScope {
            operation: Some("render".to_string()),
            category: None,
        };
        assert!(scope.matches(&sample(1.0, true)));
        let mut other = sample(1.0, true);
        other.operation = "save".to_string();
        assert!(!scope.matches(&other));

        let rule = AlertRule::new("", AlertCondition::MeanDuration, ComparisonOperator::Gt, 1.0, 60);
        assert!(rule.validate().is_err());
        let rule = AlertRule::new("r", AlertCondition::MeanDuration, ComparisonOperator::Gt, f64::NAN, 60);
        assert!(rule.validate().is_err());
    }

    #[test]
    fn test_window_and_cooldown_upper_bound() {
        let at_limit = AlertRule::new("r", AlertCondition::MeanDuration, ComparisonOperator::Gt, 1.0, MAX_WINDOW_SECS)
            .with_cooldown_secs(MAX_WINDOW_SECS);
        assert!(at_limit.validate().is_ok());

        let wide = AlertRule::new("wide", AlertCondition::MeanDuration, ComparisonOperator::Gt, 1.0, 10_000_000_000_000_000);
        assert!(matches!(wide.validate(), Err(Error::InvalidRule(_))));
        let sticky = AlertRule::new("sticky", AlertCondition::MeanDuration, ComparisonOperator::Gt, 1.0, 60)
            .with_cooldown_secs(u64::MAX);
        assert!(sticky.validate().is_err());
    }
}

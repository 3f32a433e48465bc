//! Suppression, grouping and escalation policies.

use super::NotifyEvent;
use crate::clock::{secs_to_chrono, MAX_WINDOW_SECS};
use crate::error::{Error, Result};
use crate::events::{EventKind, Severity};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Selects the events a policy applies to. Unset fields match everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EventMatcher {
    /// Event kind.
    pub event_kind: Option<EventKind>,
    /// Lowest severity.
    pub min_severity: Option<Severity>,
    /// Alert rule id or error kind.
    pub source: Option<String>,
    /// Operation category.
    pub category: Option<String>,
    /// Operation name.
    pub operation: Option<String>,
}

impl EventMatcher {
    /// Whether `event` is selected.
    pub fn matches(&self, event: &NotifyEvent) -> bool {
        self.event_kind.map_or(true, |k| k == event.kind)
            && self.min_severity.map_or(true, |s| event.severity >= s)
            && self.source.as_ref().map_or(true, |s| *s == event.source)
            && self.category.as_ref().map_or(true, |c| event.category.as_ref() == Some(c))
            && self.operation.as_ref().map_or(true, |o| event.operation.as_ref() == Some(o))
    }
}

fn default_true() -> bool {
    true
}

/// Lets through at most `max_occurrences` matching events per window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuppressionRule {
    /// Rule id.
    pub id: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Disabled rules are ignored.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Selected events.
    #[serde(default)]
    pub matcher: EventMatcher,
    /// Events allowed through per window.
    pub max_occurrences: u32,
    /// Window length in seconds.
    pub duration_secs: u64,
}

impl SuppressionRule {
    /// An enabled rule.
    pub fn new(id: impl Into<String>, matcher: EventMatcher, max_occurrences: u32, duration_secs: u64) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            enabled: true,
            matcher,
            max_occurrences,
            duration_secs,
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::invalid_rule("suppression rule id must not be empty"));
        }
        if self.duration_secs == 0 {
            return Err(Error::invalid_rule(format!("suppression rule '{}': duration must be > 0", self.id)));
        }
        if self.duration_secs > MAX_WINDOW_SECS {
            return Err(Error::invalid_rule(format!(
                "suppression rule '{}': duration must be <= {} seconds",
                self.id, MAX_WINDOW_SECS
            )));
        }
        Ok(())
    }
}

/// Counter of one suppression rule.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SuppressionWindow {
    started: DateTime<Utc>,
    allowed: u32,
}

impl SuppressionWindow {
    pub(crate) fn new(now: DateTime<Utc>) -> Self {
        Self { started: now, allowed: 0 }
    }

    fn roll(&mut self, rule: &SuppressionRule, now: DateTime<Utc>) {
        if now - self.started >= secs_to_chrono(rule.duration_secs) {
            self.started = now;
            self.allowed = 0;
        }
    }

    /// Whether the rule has used up its budget for the current window.
    pub(crate) fn exhausted(&mut self, rule: &SuppressionRule, now: DateTime<Utc>) -> bool {
        self.roll(rule, now);
        self.allowed >= rule.max_occurrences
    }

    pub(crate) fn record_allowed(&mut self) {
        self.allowed += 1;
    }
}

/// How buffered events are split into groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupBy {
    /// One group per config.
    #[default]
    Config,
    /// One group per source.
    Source,
    /// One group per operation category.
    Category,
}

/// Buffers matching events and sends them as one notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    /// Config id.
    pub id: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Disabled configs are ignored.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Selected events.
    #[serde(default)]
    pub matcher: EventMatcher,
    /// Seconds after the first buffered event before the group is flushed.
    pub window_secs: u64,
    /// Buffer size that flushes the group immediately.
    pub max_group_size: usize,
    /// Group key.
    #[serde(default)]
    pub group_by: GroupBy,
}

impl GroupConfig {
    /// An enabled config grouping everything it matches together.
    pub fn new(id: impl Into<String>, matcher: EventMatcher, window_secs: u64, max_group_size: usize) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            enabled: true,
            matcher,
            window_secs,
            max_group_size,
            group_by: GroupBy::Config,
        }
    }

    /// Window as a `Duration`.
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    /// Key of the buffer `event` goes into.
    pub(crate) fn group_key(&self, event: &NotifyEvent) -> String {
        match self.group_by {
            GroupBy::Config => format!("group:{}", self.id),
            GroupBy::Source => format!("group:{}:{}", self.id, event.source),
            GroupBy::Category => format!("group:{}:{}", self.id, event.category.as_deref().unwrap_or("-")),
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::invalid_rule("group id must not be empty"));
        }
        if self.window_secs == 0 {
            return Err(Error::invalid_rule(format!("group '{}': window must be > 0", self.id)));
        }
        if self.window_secs > MAX_WINDOW_SECS {
            return Err(Error::invalid_rule(format!("group '{}': window must be <= {} seconds", self.id, MAX_WINDOW_SECS)));
        }
        if self.max_group_size < 2 {
            return Err(Error::invalid_rule(format!("group '{}': max_group_size must be >= 2", self.id)));
        }
        Ok(())
    }
}

/// When an armed escalation actually fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationCondition {
    /// Neither acknowledged nor resolved.
    #[default]
    Unacknowledged,
    /// Not resolved, acknowledged or not.
    Unresolved,
}

/// Re-notifies target channels while an event stays unhandled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationRule {
    /// Rule id.
    pub id: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Disabled rules are ignored.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Selected events.
    #[serde(default)]
    pub matcher: EventMatcher,
    /// Seconds from trigger to the first escalation.
    pub delay_secs: u64,
    /// Channels escalations go to.
    pub target_channels: Vec<String>,
    /// Re-check before each escalation.
    #[serde(default)]
    pub condition: EscalationCondition,
    /// Minimum seconds between two armings of this rule.
    #[serde(default)]
    pub cooldown_secs: u64,
    /// Further escalations after the first.
    #[serde(default)]
    pub max_repeats: u32,
    /// Seconds between repeats, defaulting to the delay.
    #[serde(default)]
    pub repeat_interval_secs: Option<u64>,
}

impl EscalationRule {
    /// An enabled single-shot rule.
    pub fn new(id: impl Into<String>, matcher: EventMatcher, delay_secs: u64, target_channels: Vec<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            enabled: true,
            matcher,
            delay_secs,
            target_channels,
            condition: EscalationCondition::Unacknowledged,
            cooldown_secs: 0,
            max_repeats: 0,
            repeat_interval_secs: None,
        }
    }

    /// Sets the repeat count and interval.
    pub fn with_repeats(mut self, max_repeats: u32, interval_secs: u64) -> Self {
        self.max_repeats = max_repeats;
        self.repeat_interval_secs = Some(interval_secs);
        self
    }

    /// Sets the arming cooldown.
    pub fn with_cooldown_secs(mut self, cooldown_secs: u64) -> Self {
        self.cooldown_secs = cooldown_secs;
        self
    }

    /// Delay before the first escalation.
    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay_secs)
    }

    /// Delay between repeats.
    pub fn repeat_interval(&self) -> Duration {
        Duration::from_secs(self.repeat_interval_secs.unwrap_or(self.delay_secs))
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::invalid_rule("escalation rule id must not be empty"));
        }
        if self.target_channels.is_empty() {
            return Err(Error::invalid_rule(format!("escalation rule '{}' has no target channels", self.id)));
        }
        if self.delay_secs == 0 {
            return Err(Error::invalid_rule(format!("escalation rule '{}': delay must be > 0", self.id)));
        }
        if self.repeat_interval_secs == Some(0) {
            return Err(Error::invalid_rule(format!("escalation rule '{}': repeat interval must be > 0", self.id)));
        }
        let longest = self.delay_secs.max(self.cooldown_secs).max(self.repeat_interval_secs.unwrap_or(0));
        if longest > MAX_WINDOW_SECS {
            return Err(Error::invalid_rule(format!(
                "escalation rule '{}': delay, cooldown and repeat interval must be <= {} seconds",
                self.id, MAX_WINDOW_SECS
            )));
        }
        Ok(())
    }
}

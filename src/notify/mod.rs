//! Notification engine.
//!
//! Every alert or error event runs through the same stages:
//!
//! 1. suppression rules may drop it,
//! 2. a group config may buffer it until the group is full or its window ends,
//! 3. enabled channels whose filter accepts it and whose rate limit has room
//!    are selected,
//! 4. one payload per channel is rendered and delivered, failed deliveries
//!    are retried with exponential backoff,
//! 5. matching escalation rules arm timers that re-notify their target
//!    channels while the event stays unacknowledged.
//!
//! Retry, group and escalation timers live in the shared [`TaskRegistry`].
//! Escalation timers are owned by the event id, so acknowledging or resolving
//! an event cancels them in one call; group timers are owned by the buffer
//! key. Every action lands in a bounded, append-only history.

mod channel;
mod history;
mod rules;
mod template;

pub use channel::{
    CallbackChannel, ChannelCallback, ChannelConfig, ChannelFilter, ChannelKind, ChannelTarget, ChatHookChannel,
    ConsoleChannel, EmailChannel, LogChannel, NotificationChannel, NotificationPayload, RateLimit, WebhookChannel,
};
pub use history::{HistoryAction, HistoryEntry, ResponseStats};
pub use rules::{EscalationCondition, EscalationRule, EventMatcher, GroupBy, GroupConfig, SuppressionRule};
pub use template::{Field, NotificationTemplate, Template, TemplateContext};

#[cfg(test)]
pub use channel::MockNotificationChannel;

use crate::clock::{secs_to_chrono, SharedClock};
use crate::config::NotificationConfig;
use crate::error::{Error, Result};
use crate::events::{AlertEvent, ErrorEvent, ErrorEventReason, EventKind, PipelineEvent, Severity};
use crate::scheduler::TaskRegistry;
use crate::utils::backoff::backoff_delay;
use channel::RateWindow;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{join_all, BoxFuture};
use history::History;
use parking_lot::{Mutex, RwLock};
use rules::SuppressionWindow;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Alert or error event as seen by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyEvent {
    /// Alert firing id or tracked error id.
    pub id: String,
    /// Event kind.
    pub kind: EventKind,
    /// Severity.
    pub severity: Severity,
    /// Short title.
    pub title: String,
    /// Description.
    pub message: String,
    /// Alert rule id or error kind.
    pub source: String,
    /// Operation category.
    pub category: Option<String>,
    /// Operation name.
    pub operation: Option<String>,
    /// Observed value of an alert.
    pub value: Option<f64>,
    /// Threshold of an alert.
    pub threshold: Option<f64>,
    /// Condition of an alert.
    pub condition: Option<String>,
    /// Occurrence count of an error.
    pub occurrences: Option<u64>,
    /// When the source event happened.
    pub occurred_at: DateTime<Utc>,
    /// Source event as JSON.
    pub raw: serde_json::Value,
}

impl NotifyEvent {
    /// View of a fired alert.
    pub fn from_alert(alert: &AlertEvent) -> Self {
        Self {
            id: alert.id.clone(),
            kind: EventKind::Alert,
            severity: alert.severity,
            title: alert.rule_name.clone(),
            message: alert.summary(),
            source: alert.rule_id.clone(),
            category: alert.category.clone(),
            operation: alert.operation.clone(),
            value: Some(alert.value),
            threshold: Some(alert.threshold),
            condition: Some(alert.condition.clone()),
            occurrences: None,
            occurred_at: alert.fired_at,
            raw: serde_json::to_value(alert).unwrap_or_default(),
        }
    }

    /// View of a tracked error event.
    pub fn from_error(event: &ErrorEvent) -> Self {
        let reason = match event.reason {
            ErrorEventReason::New => "new",
            ErrorEventReason::Reopened => "reopened",
            ErrorEventReason::Burst => "burst",
        };
        Self {
            id: event.error_id.clone(),
            kind: EventKind::Error,
            severity: event.severity,
            title: format!("{} ({}, {})", event.kind, event.category, reason),
            message: event.message.clone(),
            source: event.kind.clone(),
            category: event.operation_category.clone(),
            operation: event.operation.clone(),
            value: None,
            threshold: None,
            condition: None,
            occurrences: Some(event.occurrence_count),
            occurred_at: event.occurred_at,
            raw: serde_json::to_value(event).unwrap_or_default(),
        }
    }
}

/// What happened to one processed event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ProcessOutcome {
    /// A notification was created and its first delivery attempts made.
    Delivered {
        /// Notification id.
        notification_id: String,
    },
    /// A suppression rule dropped the event.
    Suppressed {
        /// Rule that dropped it.
        rule_id: String,
    },
    /// The event waits in a group buffer.
    Grouped {
        /// Buffer key.
        group_key: String,
        /// Events buffered so far.
        size: usize,
    },
    /// The engine is disabled.
    Disabled,
}

/// Overall state of a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    /// First attempts outstanding.
    Pending,
    /// At least one channel is waiting for a retry.
    Retrying,
    /// Every channel accepted it.
    Sent,
    /// Some channels accepted it, the others failed for good.
    PartiallySent,
    /// Every channel failed for good.
    Failed,
    /// No channel was selected.
    Skipped,
}

/// State of the delivery to one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Not attempted yet.
    Pending,
    /// Failed, retry scheduled.
    Retrying,
    /// Accepted.
    Sent,
    /// Failed on the last attempt.
    Failed,
}

/// Delivery to one channel.
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryRecord {
    /// Channel id.
    pub channel_id: String,
    /// Channel kind.
    pub channel_kind: ChannelKind,
    /// Status.
    pub status: DeliveryStatus,
    /// Attempts made.
    pub attempts: u32,
    /// Backoff delay before each retry.
    pub retry_delays_ms: Vec<u64>,
    /// Latest failure.
    pub last_error: Option<String>,
    /// Latest attempt.
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Acceptance time.
    pub delivered_at: Option<DateTime<Utc>>,
    /// Rendered subject.
    pub subject: String,
    #[serde(skip)]
    payload: NotificationPayload,
}

/// One outbound message and its deliveries.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    /// Notification id.
    pub id: String,
    /// Source alert or error ids.
    pub event_ids: Vec<String>,
    /// Kind of the source events.
    pub event_kind: EventKind,
    /// Highest source severity.
    pub priority: Severity,
    /// Generic subject.
    pub subject: String,
    /// Generic body.
    pub body: String,
    /// Per-channel deliveries.
    pub deliveries: Vec<DeliveryRecord>,
    /// Overall status.
    pub status: NotificationStatus,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// 0 for first notifications, the escalation level otherwise.
    pub escalation_level: u32,
    /// Escalation rule, for escalations.
    pub escalation_rule: Option<String>,
    /// Group buffer key, for batched notifications.
    pub group_key: Option<String>,
}

impl Notification {
    fn refresh_status(&mut self) {
        if self.deliveries.is_empty() {
            self.status = NotificationStatus::Skipped;
            return;
        }
        let sent = self.deliveries.iter().filter(|d| d.status == DeliveryStatus::Sent).count();
        let failed = self.deliveries.iter().filter(|d| d.status == DeliveryStatus::Failed).count();
        let retrying = self.deliveries.iter().any(|d| d.status == DeliveryStatus::Retrying);
        self.status = if sent + failed < self.deliveries.len() {
            if retrying {
                NotificationStatus::Retrying
            } else {
                NotificationStatus::Pending
            }
        } else if failed == 0 {
            NotificationStatus::Sent
        } else if sent == 0 {
            NotificationStatus::Failed
        } else {
            NotificationStatus::PartiallySent
        };
    }
}

/// Who handled an event and when.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Acknowledgment {
    /// Person or component.
    pub by: String,
    /// Time.
    pub at: DateTime<Utc>,
}

/// Lifecycle of one alert or error id inside the engine.
#[derive(Debug, Clone, Serialize)]
pub struct AlertState {
    /// Latest event for the id.
    pub event: NotifyEvent,
    /// Latest trigger time.
    pub triggered_at: DateTime<Utc>,
    /// Times the id was triggered.
    pub trigger_count: u32,
    /// Acknowledgment since the latest trigger.
    pub acknowledged: Option<Acknowledgment>,
    /// Resolution since the latest trigger.
    pub resolved: Option<Acknowledgment>,
    /// Highest escalation level reached.
    pub escalation_level: u32,
    /// Notifications sent for the id.
    pub notification_ids: Vec<String>,
}

impl AlertState {
    fn is_closed(&self) -> bool {
        self.acknowledged.is_some() || self.resolved.is_some()
    }
}

/// Engine counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineStats {
    /// Notifications created.
    pub notifications: u64,
    /// Successful deliveries.
    pub delivered: u64,
    /// Deliveries that failed for good.
    pub failed: u64,
    /// Retries scheduled.
    pub retries: u64,
    /// Events dropped by suppression rules.
    pub suppressed: u64,
    /// Events buffered into groups.
    pub grouped: u64,
    /// Escalations sent.
    pub escalated: u64,
    /// Channels skipped for their rate limit.
    pub rate_limited: u64,
    /// Registered channels.
    pub channels: usize,
    /// Tracked alert and error ids.
    pub tracked_events: usize,
    /// Tracked ids neither acknowledged nor resolved.
    pub open_events: usize,
    /// History entries kept.
    pub history_len: usize,
}

#[derive(Default)]
struct Counters {
    notifications: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    retries: AtomicU64,
    suppressed: AtomicU64,
    grouped: AtomicU64,
    escalated: AtomicU64,
    rate_limited: AtomicU64,
}

struct RegisteredChannel {
    config: ChannelConfig,
    channel: Arc<dyn NotificationChannel>,
}

struct GroupBuffer {
    config_id: String,
    events: Vec<NotifyEvent>,
}

struct NotificationStore {
    by_id: HashMap<String, Notification>,
    order: VecDeque<String>,
    capacity: usize,
}

impl NotificationStore {
    fn new(capacity: usize) -> Self {
        Self {
            by_id: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    fn insert(&mut self, notification: Notification) {
        self.order.push_back(notification.id.clone());
        self.by_id.insert(notification.id.clone(), notification);
        self.trim();
    }

    fn trim(&mut self) {
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.by_id.remove(&oldest);
            }
        }
    }
}

/// Where a notification goes.
enum Route<'a> {
    /// Channels whose filter and rate limit accept the events.
    Matching { group_key: Option<String> },
    /// The target channels of an escalation rule.
    Escalation { rule: &'a EscalationRule, level: u32 },
}

/// Notification engine. Held in an `Arc`; timers keep clones of it.
pub struct NotificationEngine {
    config: RwLock<NotificationConfig>,
    clock: SharedClock,
    scheduler: TaskRegistry,
    channels: DashMap<String, RegisteredChannel>,
    rate_windows: DashMap<String, RateWindow>,
    suppressions: DashMap<String, SuppressionRule>,
    suppression_windows: DashMap<String, SuppressionWindow>,
    groups: DashMap<String, GroupConfig>,
    buffers: Mutex<HashMap<String, GroupBuffer>>,
    escalations: DashMap<String, EscalationRule>,
    escalation_armed: DashMap<String, DateTime<Utc>>,
    templates: DashMap<(EventKind, Option<ChannelKind>), NotificationTemplate>,
    alerts: DashMap<String, AlertState>,
    notifications: Mutex<NotificationStore>,
    history: Mutex<History>,
    counters: Counters,
}

impl NotificationEngine {
    /// Creates an engine whose timers run on `scheduler`.
    pub fn new(config: NotificationConfig, clock: SharedClock, scheduler: TaskRegistry) -> Self {
        Self {
            history: Mutex::new(History::new(config.max_history)),
            notifications: Mutex::new(NotificationStore::new(config.max_notifications)),
            config: RwLock::new(config),
            clock,
            scheduler,
            channels: DashMap::new(),
            rate_windows: DashMap::new(),
            suppressions: DashMap::new(),
            suppression_windows: DashMap::new(),
            groups: DashMap::new(),
            buffers: Mutex::new(HashMap::new()),
            escalations: DashMap::new(),
            escalation_armed: DashMap::new(),
            templates: DashMap::new(),
            alerts: DashMap::new(),
            counters: Counters::default(),
        }
    }

    /// Replaces the configuration. Capacities shrink immediately.
    pub fn update_config(&self, config: NotificationConfig) {
        self.history.lock().set_capacity(config.max_history);
        {
            let mut store = self.notifications.lock();
            store.capacity = config.max_notifications.max(1);
            store.trim();
        }
        *self.config.write() = config;
    }

    /// Current configuration.
    pub fn config(&self) -> NotificationConfig {
        self.config.read().clone()
    }

    // Channels

    /// Registers or replaces a channel.
    pub fn register_channel(&self, config: ChannelConfig, channel: Arc<dyn NotificationChannel>) -> Result<()> {
        config.validate()?;
        info!(channel_id = %config.id, kind = %channel.kind(), "Channel registered");
        self.rate_windows.remove(&config.id);
        self.channels.insert(config.id.clone(), RegisteredChannel { config, channel });
        Ok(())
    }

    /// Builds and registers one of the built-in channels.
    pub fn register_channel_target(&self, config: ChannelConfig, target: &ChannelTarget) -> Result<()> {
        let timeout = self.config.read().delivery_timeout();
        let channel = target.build(timeout)?;
        self.register_channel(config, channel)
    }

    /// Removes a channel. Pending retries to it fail on their next attempt.
    pub fn unregister_channel(&self, id: &str) -> Result<ChannelConfig> {
        let (_, registered) = self.channels.remove(id).ok_or_else(|| Error::not_found("channel", id))?;
        self.rate_windows.remove(id);
        info!(channel_id = id, "Channel unregistered");
        Ok(registered.config)
    }

    /// Enables or disables a channel.
    pub fn set_channel_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        let mut registered = self.channels.get_mut(id).ok_or_else(|| Error::not_found("channel", id))?;
        registered.config.enabled = enabled;
        Ok(())
    }

    /// Registered channel settings, by id.
    pub fn channels(&self) -> Vec<ChannelConfig> {
        let mut channels: Vec<ChannelConfig> = self.channels.iter().map(|c| c.config.clone()).collect();
        channels.sort_by(|a, b| a.id.cmp(&b.id));
        channels
    }

    // Policies

    /// Adds or replaces a suppression rule.
    pub fn add_suppression_rule(&self, rule: SuppressionRule) -> Result<()> {
        rule.validate()?;
        self.suppression_windows.remove(&rule.id);
        self.suppressions.insert(rule.id.clone(), rule);
        Ok(())
    }

    /// Removes a suppression rule.
    pub fn remove_suppression_rule(&self, id: &str) -> Result<SuppressionRule> {
        self.suppression_windows.remove(id);
        self.suppressions
            .remove(id)
            .map(|(_, rule)| rule)
            .ok_or_else(|| Error::not_found("suppression rule", id))
    }

    /// Suppression rules, by id.
    pub fn suppression_rules(&self) -> Vec<SuppressionRule> {
        let mut rules: Vec<SuppressionRule> = self.suppressions.iter().map(|r| r.value().clone()).collect();
        rules.sort_by(|a, b| a.id.cmp(&b.id));
        rules
    }

    /// Adds or replaces a group config.
    pub fn add_group(&self, config: GroupConfig) -> Result<()> {
        config.validate()?;
        self.groups.insert(config.id.clone(), config);
        Ok(())
    }

    /// Removes a group config. Events already buffered are still flushed by their timer.
    pub fn remove_group(&self, id: &str) -> Result<GroupConfig> {
        self.groups
            .remove(id)
            .map(|(_, config)| config)
            .ok_or_else(|| Error::not_found("group", id))
    }

    /// Group configs, by id.
    pub fn groups(&self) -> Vec<GroupConfig> {
        let mut groups: Vec<GroupConfig> = self.groups.iter().map(|g| g.value().clone()).collect();
        groups.sort_by(|a, b| a.id.cmp(&b.id));
        groups
    }

    /// Adds or replaces an escalation rule.
    pub fn add_escalation_rule(&self, rule: EscalationRule) -> Result<()> {
        rule.validate()?;
        self.escalation_armed.remove(&rule.id);
        self.escalations.insert(rule.id.clone(), rule);
        Ok(())
    }

    /// Removes an escalation rule. Armed timers for it become no-ops.
    pub fn remove_escalation_rule(&self, id: &str) -> Result<EscalationRule> {
        self.escalation_armed.remove(id);
        self.escalations
            .remove(id)
            .map(|(_, rule)| rule)
            .ok_or_else(|| Error::not_found("escalation rule", id))
    }

    /// Escalation rules, by id.
    pub fn escalation_rules(&self) -> Vec<EscalationRule> {
        let mut rules: Vec<EscalationRule> = self.escalations.iter().map(|r| r.value().clone()).collect();
        rules.sort_by(|a, b| a.id.cmp(&b.id));
        rules
    }

    /// Registers or replaces the template for its (event kind, channel kind) pair.
    pub fn register_template(&self, template: NotificationTemplate) {
        self.templates.insert((template.event_kind, template.channel_kind), template);
    }

    /// Removes a template.
    pub fn remove_template(&self, event_kind: EventKind, channel_kind: Option<ChannelKind>) -> Result<NotificationTemplate> {
        self.templates
            .remove(&(event_kind, channel_kind))
            .map(|(_, template)| template)
            .ok_or_else(|| Error::not_found("template", format!("{}/{:?}", event_kind.as_str(), channel_kind)))
    }

    /// Registered templates.
    pub fn templates(&self) -> Vec<NotificationTemplate> {
        self.templates.iter().map(|t| t.value().clone()).collect()
    }

    // Processing

    /// Routes one queued pipeline event.
    pub async fn handle_event(self: &Arc<Self>, event: PipelineEvent) -> Option<ProcessOutcome> {
        match event {
            PipelineEvent::Alert(alert) => Some(self.process_alert(&alert).await),
            PipelineEvent::Error(error) => Some(self.process_error(&error).await),
            PipelineEvent::ErrorResolved { error_id, by } => {
                if self.alerts.contains_key(&error_id) {
                    if let Err(e) = self.resolve_alert(&error_id, &by) {
                        debug!(error_id = %error_id, error = %e, "Resolution not applied");
                    }
                }
                None
            }
        }
    }

    /// Processes a fired alert.
    pub async fn process_alert(self: &Arc<Self>, alert: &AlertEvent) -> ProcessOutcome {
        self.process(NotifyEvent::from_alert(alert)).await
    }

    /// Processes a tracked error event.
    pub async fn process_error(self: &Arc<Self>, event: &ErrorEvent) -> ProcessOutcome {
        self.process(NotifyEvent::from_error(event)).await
    }

    /// Runs one event through suppression, grouping, delivery and escalation.
    pub async fn process(self: &Arc<Self>, event: NotifyEvent) -> ProcessOutcome {
        if !self.config.read().enabled {
            return ProcessOutcome::Disabled;
        }
        let now = self.clock.now();
        self.track_state(&event, now);
        self.record(HistoryEntry::new(HistoryAction::Triggered, &event.id, event.kind, now).details(event.title.clone()));

        if let Some(rule_id) = self.check_suppression(&event, now) {
            self.counters.suppressed.fetch_add(1, Ordering::Relaxed);
            crate::utils::metrics::record_suppressed();
            self.record(HistoryEntry::new(HistoryAction::Suppressed, &event.id, event.kind, now).rule(&rule_id));
            debug!(event_id = %event.id, rule_id = %rule_id, "Event suppressed");
            return ProcessOutcome::Suppressed { rule_id };
        }

        if let Some((group_key, size, full)) = self.buffer_into_group(&event, now) {
            if !full {
                return ProcessOutcome::Grouped { group_key, size };
            }
            if let Some(notification_id) = self.flush_group(&group_key).await {
                return ProcessOutcome::Delivered { notification_id };
            }
            return ProcessOutcome::Grouped { group_key, size };
        }

        let notification_id = self.dispatch(vec![event], Route::Matching { group_key: None }).await;
        ProcessOutcome::Delivered { notification_id }
    }

    fn track_state(&self, event: &NotifyEvent, now: DateTime<Utc>) {
        match self.alerts.entry(event.id.clone()) {
            Entry::Occupied(mut slot) => {
                let state = slot.get_mut();
                state.event = event.clone();
                state.triggered_at = now;
                state.trigger_count += 1;
                state.acknowledged = None;
                state.resolved = None;
            }
            Entry::Vacant(slot) => {
                slot.insert(AlertState {
                    event: event.clone(),
                    triggered_at: now,
                    trigger_count: 1,
                    acknowledged: None,
                    resolved: None,
                    escalation_level: 0,
                    notification_ids: Vec::new(),
                });
            }
        }

        let capacity = self.config.read().max_notifications;
        while self.alerts.len() > capacity {
            let victim = self
                .alerts
                .iter()
                .filter(|s| s.is_closed())
                .min_by_key(|s| s.triggered_at)
                .map(|s| s.key().clone())
                .or_else(|| self.alerts.iter().min_by_key(|s| s.triggered_at).map(|s| s.key().clone()));
            let Some(id) = victim else { break };
            self.alerts.remove(&id);
            self.scheduler.cancel_owner(&id);
        }
    }

    fn check_suppression(&self, event: &NotifyEvent, now: DateTime<Utc>) -> Option<String> {
        let matching: Vec<SuppressionRule> = self
            .suppressions
            .iter()
            .filter(|r| r.enabled && r.matcher.matches(event))
            .map(|r| r.value().clone())
            .collect();
        for rule in &matching {
            let mut window = self
                .suppression_windows
                .entry(rule.id.clone())
                .or_insert_with(|| SuppressionWindow::new(now));
            if window.exhausted(rule, now) {
                return Some(rule.id.clone());
            }
        }
        for rule in &matching {
            if let Some(mut window) = self.suppression_windows.get_mut(&rule.id) {
                window.record_allowed();
            }
        }
        None
    }

    /// Buffers `event` if a group config matches. Returns the buffer key, its
    /// size and whether it just became full.
    fn buffer_into_group(self: &Arc<Self>, event: &NotifyEvent, now: DateTime<Utc>) -> Option<(String, usize, bool)> {
        let config = self
            .groups
            .iter()
            .filter(|g| g.enabled && g.matcher.matches(event))
            .min_by(|a, b| a.id.cmp(&b.id))
            .map(|g| g.value().clone())?;
        let key = config.group_key(event);

        let size = {
            let mut buffers = self.buffers.lock();
            let buffer = buffers.entry(key.clone()).or_insert_with(|| GroupBuffer {
                config_id: config.id.clone(),
                events: Vec::new(),
            });
            buffer.events.push(event.clone());
            buffer.events.len()
        };
        self.counters.grouped.fetch_add(1, Ordering::Relaxed);
        self.record(
            HistoryEntry::new(HistoryAction::Grouped, &event.id, event.kind, now)
                .rule(&config.id)
                .details(key.clone()),
        );

        if size >= config.max_group_size {
            self.scheduler.cancel_owner(&key);
            return Some((key, size, true));
        }
        if size == 1 {
            let engine = Arc::clone(self);
            self.scheduler
                .schedule_once(&key, config.window(), engine.flush_task(key.clone()));
        }
        debug!(group_key = %key, size, "Event buffered into group");
        Some((key, size, false))
    }

    fn flush_task(self: Arc<Self>, key: String) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            self.flush_group(&key).await;
        })
    }

    /// Sends a buffered group now. Returns the notification id if the group had events.
    pub async fn flush_group(self: &Arc<Self>, key: &str) -> Option<String> {
        let buffer = self.buffers.lock().remove(key)?;
        self.scheduler.cancel_owner(key);
        let first = buffer.events.first()?;
        let now = self.clock.now();
        self.record(
            HistoryEntry::new(HistoryAction::GroupFlushed, &first.id, first.kind, now)
                .rule(&buffer.config_id)
                .details(format!("{} events", buffer.events.len())),
        );
        let notification_id = self
            .dispatch(buffer.events, Route::Matching { group_key: Some(key.to_string()) })
            .await;
        Some(notification_id)
    }

    /// Sends every buffered group now.
    pub async fn flush_all_groups(self: &Arc<Self>) -> usize {
        let keys: Vec<String> = self.buffers.lock().keys().cloned().collect();
        let mut flushed = 0;
        for key in keys {
            if self.flush_group(&key).await.is_some() {
                flushed += 1;
            }
        }
        flushed
    }

    fn render(&self, context: &TemplateContext, channel_kind: Option<ChannelKind>) -> (String, String) {
        let template = channel_kind
            .and_then(|kind| self.templates.get(&(context.kind(), Some(kind))).map(|t| t.value().clone()))
            .or_else(|| self.templates.get(&(context.kind(), None)).map(|t| t.value().clone()));
        match template {
            Some(template) => (template.subject.render(context), template.body.render(context)),
            None => (context.default_subject(), context.default_body()),
        }
    }

    fn take_rate_slot(&self, config: &ChannelConfig, now: DateTime<Utc>) -> bool {
        let Some(limit) = &config.rate_limit else {
            return true;
        };
        self.rate_windows
            .entry(config.id.clone())
            .or_insert_with(|| RateWindow::new(now))
            .try_acquire(limit, now)
    }

    fn select_channels(&self, events: &[NotifyEvent], route: &Route<'_>, now: DateTime<Utc>) -> Vec<(String, Arc<dyn NotificationChannel>)> {
        let candidates: Vec<(ChannelConfig, Arc<dyn NotificationChannel>)> = match route {
            Route::Matching { .. } => self
                .channels
                .iter()
                .filter(|c| c.config.enabled)
                .filter(|c| {
                    events
                        .iter()
                        .any(|e| c.config.filter.accepts(e.kind, e.severity, e.category.as_deref(), &e.source))
                })
                .map(|c| (c.config.clone(), Arc::clone(&c.channel)))
                .collect(),
            Route::Escalation { rule, .. } => rule
                .target_channels
                .iter()
                .filter_map(|id| self.channels.get(id))
                .filter(|c| c.config.enabled)
                .map(|c| (c.config.clone(), Arc::clone(&c.channel)))
                .collect(),
        };

        let mut selected = Vec::with_capacity(candidates.len());
        for (config, channel) in candidates {
            if !self.take_rate_slot(&config, now) {
                self.counters.rate_limited.fetch_add(1, Ordering::Relaxed);
                if let Some(first) = events.first() {
                    self.record(
                        HistoryEntry::new(HistoryAction::RateLimited, &first.id, first.kind, now).channel(&config.id),
                    );
                }
                debug!(channel_id = %config.id, "Channel over rate limit, skipped");
                continue;
            }
            selected.push((config.id, channel));
        }
        selected.sort_by(|a, b| a.0.cmp(&b.0));
        selected
    }

    /// Creates a notification for `events`, makes the first delivery attempts
    /// and arms escalations. Returns the notification id.
    async fn dispatch(self: &Arc<Self>, events: Vec<NotifyEvent>, route: Route<'_>) -> String {
        let now = self.clock.now();
        let level = match &route {
            Route::Matching { .. } => 0,
            Route::Escalation { level, .. } => *level,
        };
        let context = TemplateContext::new(&events, level, now);
        let notification_id = Uuid::new_v4().to_string();
        let event_ids: Vec<String> = events.iter().map(|e| e.id.clone()).collect();
        let raw = match events.as_slice() {
            [single] => single.raw.clone(),
            many => serde_json::Value::Array(many.iter().map(|e| e.raw.clone()).collect()),
        };
        let escalation_prefix = |subject: String| {
            if level > 0 {
                format!("[ESCALATED x{}] {}", level, subject)
            } else {
                subject
            }
        };

        let selected = self.select_channels(&events, &route, now);
        let deliveries: Vec<DeliveryRecord> = selected
            .iter()
            .map(|(channel_id, channel)| {
                let kind = channel.kind();
                let (subject, body) = self.render(&context, Some(kind));
                let subject = escalation_prefix(subject);
                DeliveryRecord {
                    channel_id: channel_id.clone(),
                    channel_kind: kind,
                    status: DeliveryStatus::Pending,
                    attempts: 0,
                    retry_delays_ms: Vec::new(),
                    last_error: None,
                    last_attempt_at: None,
                    delivered_at: None,
                    subject: subject.clone(),
                    payload: NotificationPayload {
                        notification_id: notification_id.clone(),
                        subject,
                        body,
                        priority: context.severity(),
                        timestamp: now,
                        event_kind: context.kind(),
                        source_ids: event_ids.clone(),
                        escalation_level: level,
                        event: raw.clone(),
                    },
                }
            })
            .collect();

        let (subject, body) = self.render(&context, None);
        let mut notification = Notification {
            id: notification_id.clone(),
            event_ids: event_ids.clone(),
            event_kind: context.kind(),
            priority: context.severity(),
            subject: escalation_prefix(subject),
            body,
            deliveries,
            status: NotificationStatus::Pending,
            created_at: now,
            escalation_level: level,
            escalation_rule: match &route {
                Route::Escalation { rule, .. } => Some(rule.id.clone()),
                Route::Matching { .. } => None,
            },
            group_key: match &route {
                Route::Matching { group_key } => group_key.clone(),
                Route::Escalation { .. } => None,
            },
        };
        notification.refresh_status();
        if notification.status == NotificationStatus::Skipped {
            debug!(notification_id = %notification_id, events = event_ids.len(), "No channel selected");
        }
        self.notifications.lock().insert(notification);
        self.counters.notifications.fetch_add(1, Ordering::Relaxed);
        for id in &event_ids {
            if let Some(mut state) = self.alerts.get_mut(id) {
                state.notification_ids.push(notification_id.clone());
            }
        }

        let attempts = selected
            .iter()
            .map(|(channel_id, _)| self.attempt_delivery(&notification_id, channel_id, 1));
        join_all(attempts).await;

        if matches!(route, Route::Matching { .. }) {
            for event in &events {
                self.arm_escalations(event, now);
            }
        }
        notification_id
    }

    /// Marks an attempt as started and returns the payload to send.
    fn begin_attempt(&self, notification_id: &str, channel_id: &str, attempt: u32) -> Option<(NotificationPayload, ChannelKind)> {
        let mut store = self.notifications.lock();
        let notification = store.by_id.get_mut(notification_id)?;
        let record = notification.deliveries.iter_mut().find(|d| d.channel_id == channel_id)?;
        record.attempts = attempt;
        record.last_attempt_at = Some(self.clock.now());
        Some((record.payload.clone(), record.channel_kind))
    }

    fn update_delivery(&self, notification_id: &str, channel_id: &str, apply: impl FnOnce(&mut DeliveryRecord)) -> Option<Vec<String>> {
        let mut store = self.notifications.lock();
        let notification = store.by_id.get_mut(notification_id)?;
        let record = notification.deliveries.iter_mut().find(|d| d.channel_id == channel_id)?;
        apply(record);
        notification.refresh_status();
        Some(notification.event_ids.clone())
    }

    async fn attempt_delivery(self: &Arc<Self>, notification_id: &str, channel_id: &str, attempt: u32) {
        let Some((payload, kind)) = self.begin_attempt(notification_id, channel_id, attempt) else {
            return;
        };
        let (max_attempts, base, max_delay, jitter, timeout) = {
            let config = self.config.read();
            (
                config.max_attempts,
                config.retry_base_delay(),
                config.retry_max_delay(),
                config.retry_jitter,
                config.delivery_timeout(),
            )
        };
        let channel = self.channels.get(channel_id).map(|c| Arc::clone(&c.channel));

        let result = match &channel {
            None => Err(Error::not_found("channel", channel_id)),
            Some(channel) => match tokio::time::timeout(timeout, channel.deliver(&payload)).await {
                Ok(result) => result,
                Err(_) => Err(Error::delivery(channel_id, "delivery timed out")),
            },
        };
        let now = self.clock.now();
        let event_kind = payload.event_kind;

        match result {
            Ok(()) => {
                let event_ids = self.update_delivery(notification_id, channel_id, |record| {
                    record.status = DeliveryStatus::Sent;
                    record.delivered_at = Some(now);
                    record.last_error = None;
                });
                self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                crate::utils::metrics::record_delivery(kind.as_str(), "sent");
                for event_id in event_ids.unwrap_or_default() {
                    self.record(
                        HistoryEntry::new(HistoryAction::Delivered, &event_id, event_kind, now)
                            .channel(channel_id)
                            .notification(notification_id),
                    );
                }
                debug!(notification_id, channel_id, attempt, "Notification delivered");
            }
            Err(err) if attempt < max_attempts && channel.is_some() => {
                let delay = backoff_delay(attempt, base, max_delay, jitter);
                let reason = err.to_string();
                self.update_delivery(notification_id, channel_id, |record| {
                    record.status = DeliveryStatus::Retrying;
                    record.retry_delays_ms.push(delay.as_millis() as u64);
                    record.last_error = Some(reason);
                });
                self.counters.retries.fetch_add(1, Ordering::Relaxed);
                crate::utils::metrics::record_delivery(kind.as_str(), "retry");
                warn!(
                    notification_id,
                    channel_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Delivery failed, retry scheduled"
                );
                let engine = Arc::clone(self);
                let task = engine.retry_task(notification_id.to_string(), channel_id.to_string(), attempt + 1);
                if self.scheduler.schedule_once(notification_id, delay, task).is_none() {
                    self.fail_delivery(notification_id, channel_id, kind, event_kind, attempt, "no runtime for retry".to_string());
                }
            }
            Err(err) => {
                self.fail_delivery(notification_id, channel_id, kind, event_kind, attempt, err.to_string());
            }
        }
    }

    fn fail_delivery(
        &self,
        notification_id: &str,
        channel_id: &str,
        kind: ChannelKind,
        event_kind: EventKind,
        attempts: u32,
        reason: String,
    ) {
        let now = self.clock.now();
        let final_error = Error::retry_exhausted(attempts, Error::delivery(channel_id, reason.clone()));
        let event_ids = self.update_delivery(notification_id, channel_id, |record| {
            record.status = DeliveryStatus::Failed;
            record.last_error = Some(reason);
        });
        self.counters.failed.fetch_add(1, Ordering::Relaxed);
        crate::utils::metrics::record_delivery(kind.as_str(), "failed");
        for event_id in event_ids.unwrap_or_default() {
            self.record(
                HistoryEntry::new(HistoryAction::DeliveryFailed, &event_id, event_kind, now)
                    .channel(channel_id)
                    .notification(notification_id)
                    .details(final_error.to_string()),
            );
        }
        error!(notification_id, channel_id, error = %final_error, "Notification delivery failed");
    }

    fn retry_task(self: Arc<Self>, notification_id: String, channel_id: String, attempt: u32) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            self.attempt_delivery(&notification_id, &channel_id, attempt).await;
        })
    }

    fn arm_escalations(self: &Arc<Self>, event: &NotifyEvent, now: DateTime<Utc>) {
        let rules: Vec<EscalationRule> = self
            .escalations
            .iter()
            .filter(|r| r.enabled && r.matcher.matches(event))
            .map(|r| r.value().clone())
            .collect();
        for rule in rules {
            let cooling = rule.cooldown_secs > 0
                && self
                    .escalation_armed
                    .get(&rule.id)
                    .is_some_and(|last| now - *last < secs_to_chrono(rule.cooldown_secs));
            if cooling {
                debug!(rule_id = %rule.id, event_id = %event.id, "Escalation rule cooling down");
                continue;
            }
            self.escalation_armed.insert(rule.id.clone(), now);
            let engine = Arc::clone(self);
            let task = engine.escalation_task(event.id.clone(), rule.id.clone(), 1);
            self.scheduler.schedule_once(&event.id, rule.delay(), task);
            debug!(rule_id = %rule.id, event_id = %event.id, delay_secs = rule.delay_secs, "Escalation armed");
        }
    }

    fn escalation_task(self: Arc<Self>, event_id: String, rule_id: String, level: u32) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            self.escalate(&event_id, &rule_id, level).await;
        })
    }

    async fn escalate(self: &Arc<Self>, event_id: &str, rule_id: &str, level: u32) {
        let Some(rule) = self.escalations.get(rule_id).map(|r| r.value().clone()) else {
            return;
        };
        if !rule.enabled {
            return;
        }
        let event = {
            let Some(state) = self.alerts.get(event_id) else {
                return;
            };
            let due = match rule.condition {
                EscalationCondition::Unacknowledged => !state.is_closed(),
                EscalationCondition::Unresolved => state.resolved.is_none(),
            };
            if !due {
                debug!(event_id, rule_id, "Escalation no longer needed");
                return;
            }
            state.event.clone()
        };
        if let Some(mut state) = self.alerts.get_mut(event_id) {
            state.escalation_level = state.escalation_level.max(level);
        }

        self.counters.escalated.fetch_add(1, Ordering::Relaxed);
        info!(event_id, rule_id, level, "Escalating unacknowledged event");
        let kind = event.kind;
        let notification_id = self.dispatch(vec![event], Route::Escalation { rule: &rule, level }).await;
        self.record(
            HistoryEntry::new(HistoryAction::Escalated, event_id, kind, self.clock.now())
                .rule(rule_id)
                .notification(&notification_id)
                .details(format!("level {}", level)),
        );

        if level <= rule.max_repeats {
            let engine = Arc::clone(self);
            let task = engine.escalation_task(event_id.to_string(), rule_id.to_string(), level + 1);
            self.scheduler.schedule_once(event_id, rule.repeat_interval(), task);
        }
    }

    // Acknowledgment

    /// Acknowledges an alert or error id, stopping its escalations and group timers.
    pub fn acknowledge_alert(&self, id: &str, who: &str) -> Result<AlertState> {
        self.close(id, who, HistoryAction::Acknowledged)
    }

    /// Resolves an alert or error id, stopping its escalations and group timers.
    pub fn resolve_alert(&self, id: &str, who: &str) -> Result<AlertState> {
        self.close(id, who, HistoryAction::Resolved)
    }

    fn close(&self, id: &str, who: &str, action: HistoryAction) -> Result<AlertState> {
        let now = self.clock.now();
        let state = {
            let mut state = self.alerts.get_mut(id).ok_or_else(|| Error::not_found("alert", id))?;
            let slot = match action {
                HistoryAction::Acknowledged => &mut state.acknowledged,
                _ => &mut state.resolved,
            };
            if slot.is_some() {
                return Ok(state.value().clone());
            }
            *slot = Some(Acknowledgment {
                by: who.to_string(),
                at: now,
            });
            state.value().clone()
        };

        let cancelled = self.scheduler.cancel_owner(id);
        self.remove_from_groups(id);

        let mut entry = HistoryEntry::new(action, id, state.event.kind, now).actor(who);
        if action == HistoryAction::Acknowledged {
            entry.response_ms = Some((now - state.triggered_at).num_milliseconds().max(0) as u64);
        }
        self.record(entry);
        info!(event_id = id, by = who, action = ?action, cancelled_timers = cancelled, "Event closed");
        Ok(state)
    }

    fn remove_from_groups(&self, event_id: &str) {
        let emptied: Vec<String> = {
            let mut buffers = self.buffers.lock();
            for buffer in buffers.values_mut() {
                buffer.events.retain(|e| e.id != event_id);
            }
            let emptied: Vec<String> = buffers
                .iter()
                .filter(|(_, b)| b.events.is_empty())
                .map(|(k, _)| k.clone())
                .collect();
            for key in &emptied {
                buffers.remove(key);
            }
            emptied
        };
        for key in emptied {
            self.scheduler.cancel_owner(&key);
        }
    }

    // Queries

    /// One notification.
    pub fn notification(&self, id: &str) -> Option<Notification> {
        self.notifications.lock().by_id.get(id).cloned()
    }

    /// Latest notifications, newest first.
    pub fn notifications(&self, limit: usize) -> Vec<Notification> {
        let store = self.notifications.lock();
        store
            .order
            .iter()
            .rev()
            .filter_map(|id| store.by_id.get(id))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Lifecycle of one alert or error id.
    pub fn alert_state(&self, id: &str) -> Option<AlertState> {
        self.alerts.get(id).map(|s| s.value().clone())
    }

    /// History, newest first, optionally for one id.
    pub fn alert_history(&self, event_id: Option<&str>, limit: usize) -> Vec<HistoryEntry> {
        self.history.lock().query(event_id, limit)
    }

    /// Acknowledgment response times over the retained history.
    pub fn response_stats(&self) -> ResponseStats {
        self.history.lock().response_stats()
    }

    /// Counters and sizes.
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            notifications: self.counters.notifications.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            retries: self.counters.retries.load(Ordering::Relaxed),
            suppressed: self.counters.suppressed.load(Ordering::Relaxed),
            grouped: self.counters.grouped.load(Ordering::Relaxed),
            escalated: self.counters.escalated.load(Ordering::Relaxed),
            rate_limited: self.counters.rate_limited.load(Ordering::Relaxed),
            channels: self.channels.len(),
            tracked_events: self.alerts.len(),
            open_events: self.alerts.iter().filter(|s| !s.is_closed()).count(),
            history_len: self.history.lock().len(),
        }
    }

    fn record(&self, entry: HistoryEntry) {
        self.history.lock().push(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use mockall::Sequence;
    use std::time::Duration;

    fn config() -> NotificationConfig {
        NotificationConfig {
            retry_jitter: false,
            ..NotificationConfig::default()
        }
    }

    fn engine() -> (Arc<NotificationEngine>, ManualClock) {
        let clock = ManualClock::at_epoch_2024();
        let engine = NotificationEngine::new(config(), Arc::new(clock.clone()), TaskRegistry::new());
        (Arc::new(engine), clock)
    }

    fn alert(id: &str, severity: Severity) -> AlertEvent {
        AlertEvent {
            id: id.to_string(),
            rule_id: "slow-checkout".to_string(),
            rule_name: "Slow checkout".to_string(),
            severity,
            condition: "mean_duration".to_string(),
            operator: ">".to_string(),
            threshold: 500.0,
            value: 812.0,
            window_secs: 300,
            operation: Some("checkout".to_string()),
            category: Some("orders".to_string()),
            sample_count: 40,
            fired_at: Utc::now(),
        }
    }

    fn recording_channel() -> (Arc<CallbackChannel>, Arc<Mutex<Vec<NotificationPayload>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let channel = CallbackChannel::new(move |payload| {
            sink.lock().push(payload.clone());
            Ok(())
        });
        (Arc::new(channel), seen)
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_until_third_attempt_succeeds() {
        let (engine, _clock) = engine();
        let mut mock = MockNotificationChannel::new();
        let mut seq = Sequence::new();
        mock.expect_kind().return_const(ChannelKind::Webhook);
        mock.expect_deliver()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_| Err(Error::delivery("ops-webhook", "connection refused")));
        mock.expect_deliver().times(1).in_sequence(&mut seq).returning(|_| Ok(()));
        engine.register_channel(ChannelConfig::new("ops-webhook"), Arc::new(mock)).unwrap();

        let outcome = engine.process_alert(&alert("a-1", Severity::High)).await;
        let ProcessOutcome::Delivered { notification_id } = outcome else {
            panic!("expected delivery, got {:?}", outcome);
        };
        assert_eq!(engine.notification(&notification_id).unwrap().status, NotificationStatus::Retrying);

        tokio::time::sleep(Duration::from_secs(10)).await;

        let notification = engine.notification(&notification_id).unwrap();
        assert_eq!(notification.status, NotificationStatus::Sent);
        let delivery = &notification.deliveries[0];
        assert_eq!(delivery.attempts, 3);
        assert_eq!(delivery.retry_delays_ms, vec![1_000, 2_000]);
        assert_eq!(engine.stats().retries, 2);
        assert_eq!(engine.stats().delivered, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_is_recorded() {
        let (engine, _clock) = engine();
        let mut mock = MockNotificationChannel::new();
        mock.expect_kind().return_const(ChannelKind::Email);
        mock.expect_deliver()
            .times(3)
            .returning(|_| Err(Error::delivery("mail", "relay unreachable")));
        engine.register_channel(ChannelConfig::new("mail"), Arc::new(mock)).unwrap();

        let outcome = engine.process_alert(&alert("a-1", Severity::High)).await;
        tokio::time::sleep(Duration::from_secs(10)).await;

        let ProcessOutcome::Delivered { notification_id } = outcome else {
            panic!("expected delivery");
        };
        let notification = engine.notification(&notification_id).unwrap();
        assert_eq!(notification.status, NotificationStatus::Failed);
        let failures = engine
            .alert_history(Some("a-1"), 50)
            .into_iter()
            .filter(|e| e.action == HistoryAction::DeliveryFailed)
            .count();
        assert_eq!(failures, 1);
    }

    #[tokio::test]
    async fn test_suppression_window() {
        let (engine, clock) = engine();
        let (channel, seen) = recording_channel();
        engine.register_channel(ChannelConfig::new("cb"), channel).unwrap();
        engine
            .add_suppression_rule(SuppressionRule::new("flood", EventMatcher::default(), 2, 60))
            .unwrap();

        assert!(matches!(engine.process_alert(&alert("a-1", Severity::High)).await, ProcessOutcome::Delivered { .. }));
        assert!(matches!(engine.process_alert(&alert("a-2", Severity::High)).await, ProcessOutcome::Delivered { .. }));
        assert_eq!(
            engine.process_alert(&alert("a-3", Severity::High)).await,
            ProcessOutcome::Suppressed {
                rule_id: "flood".to_string()
            }
        );

        clock.advance(Duration::from_secs(61));
        assert!(matches!(engine.process_alert(&alert("a-4", Severity::High)).await, ProcessOutcome::Delivered { .. }));
        assert_eq!(seen.lock().len(), 3);
        assert_eq!(engine.alert_history(Some("a-3"), 10)[0].action, HistoryAction::Suppressed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acknowledge_prevents_escalation() {
        let (engine, clock) = engine();
        let (channel, seen) = recording_channel();
        engine.register_channel(ChannelConfig::new("pager"), channel).unwrap();
        engine
            .add_escalation_rule(EscalationRule::new("page", EventMatcher::default(), 60, vec!["pager".into()]))
            .unwrap();

        engine.process_alert(&alert("a-1", Severity::Critical)).await;
        clock.advance(Duration::from_secs(30));
        tokio::time::sleep(Duration::from_secs(30)).await;
        let state = engine.acknowledge_alert("a-1", "alice").unwrap();
        assert_eq!(state.acknowledged.unwrap().by, "alice");

        tokio::time::sleep(Duration::from_secs(120)).await;
        let escalations = seen.lock().iter().filter(|p| p.escalation_level > 0).count();
        assert_eq!(escalations, 0);
        assert_eq!(engine.stats().escalated, 0);
        assert_eq!(engine.response_stats().avg_response_ms, Some(30_000.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_escalation_repeats_until_acknowledged() {
        let (engine, _clock) = engine();
        let (channel, seen) = recording_channel();
        engine.register_channel(ChannelConfig::new("pager"), channel).unwrap();
        engine
            .add_escalation_rule(
                EscalationRule::new("page", EventMatcher::default(), 60, vec!["pager".into()]).with_repeats(2, 30),
            )
            .unwrap();

        engine.process_alert(&alert("a-1", Severity::Critical)).await;
        tokio::time::sleep(Duration::from_secs(200)).await;

        let levels: Vec<u32> = seen.lock().iter().map(|p| p.escalation_level).collect();
        assert_eq!(levels, vec![0, 1, 2, 3]);
        assert!(seen.lock()[1].subject.starts_with("[ESCALATED x1]"));
        assert_eq!(engine.alert_state("a-1").unwrap().escalation_level, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_group_flushes_on_size_and_timer() {
        let (engine, _clock) = engine();
        let (channel, seen) = recording_channel();
        engine.register_channel(ChannelConfig::new("cb"), channel).unwrap();
        engine.add_group(GroupConfig::new("burst", EventMatcher::default(), 30, 3)).unwrap();

        assert!(matches!(engine.process_alert(&alert("a-1", Severity::Low)).await, ProcessOutcome::Grouped { size: 1, .. }));
        assert!(matches!(engine.process_alert(&alert("a-2", Severity::High)).await, ProcessOutcome::Grouped { size: 2, .. }));
        let ProcessOutcome::Delivered { notification_id } = engine.process_alert(&alert("a-3", Severity::Low)).await else {
            panic!("third event should flush the group");
        };
        let notification = engine.notification(&notification_id).unwrap();
        assert_eq!(notification.event_ids.len(), 3);
        assert_eq!(notification.priority, Severity::High);
        assert_eq!(seen.lock().len(), 1);

        engine.process_alert(&alert("a-4", Severity::Low)).await;
        engine.process_alert(&alert("a-5", Severity::Low)).await;
        tokio::time::sleep(Duration::from_secs(31)).await;
        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].source_ids, vec!["a-4".to_string(), "a-5".to_string()]);
    }

    #[tokio::test]
    async fn test_rate_limited_channel_is_skipped() {
        let (engine, _clock) = engine();
        let (channel, seen) = recording_channel();
        engine
            .register_channel(ChannelConfig::new("cb").with_rate_limit(1, 60), channel)
            .unwrap();

        engine.process_alert(&alert("a-1", Severity::High)).await;
        let ProcessOutcome::Delivered { notification_id } = engine.process_alert(&alert("a-2", Severity::High)).await else {
            panic!("expected a notification");
        };
        assert_eq!(engine.notification(&notification_id).unwrap().status, NotificationStatus::Skipped);
        assert_eq!(seen.lock().len(), 1);
        assert_eq!(engine.stats().rate_limited, 1);
    }

    #[tokio::test]
    async fn test_filters_and_templates() {
        let (engine, _clock) = engine();
        let (all, all_seen) = recording_channel();
        let (critical, critical_seen) = recording_channel();
        engine.register_channel(ChannelConfig::new("all"), all).unwrap();
        engine
            .register_channel(
                ChannelConfig::new("critical").with_filter(ChannelFilter {
                    min_severity: Some(Severity::Critical),
                    ..ChannelFilter::default()
                }),
                critical,
            )
            .unwrap();
        engine.register_template(
            NotificationTemplate::new(
                EventKind::Alert,
                Some(ChannelKind::Callback),
                "{{severity}}: {{title}} ({{value}})",
                "{{message}}",
            )
            .unwrap(),
        );

        engine.process_alert(&alert("a-1", Severity::High)).await;
        assert_eq!(all_seen.lock()[0].subject, "high: Slow checkout (812.00)");
        assert!(critical_seen.lock().is_empty());

        engine.set_channel_enabled("all", false).unwrap();
        engine.process_alert(&alert("a-2", Severity::Critical)).await;
        assert_eq!(all_seen.lock().len(), 1);
        assert_eq!(critical_seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_error_events_and_resolution() {
        let (engine, _clock) = engine();
        let (channel, seen) = recording_channel();
        engine.register_channel(ChannelConfig::new("cb"), channel).unwrap();

        let event = ErrorEvent {
            error_id: "err-1".to_string(),
            fingerprint: "abc".to_string(),
            reason: ErrorEventReason::New,
            kind: "DbError".to_string(),
            message: "deadlock detected".to_string(),
            category: crate::error_tracker::ErrorCategory::Storage,
            severity: Severity::High,
            operation: Some("save_page".to_string()),
            operation_category: Some("pages".to_string()),
            occurrence_count: 1,
            occurred_at: Utc::now(),
        };
        engine.handle_event(PipelineEvent::Error(event)).await;
        assert_eq!(seen.lock()[0].event_kind, EventKind::Error);
        assert_eq!(seen.lock()[0].event["fingerprint"], "abc");

        engine
            .handle_event(PipelineEvent::ErrorResolved {
                error_id: "err-1".to_string(),
                by: "bob".to_string(),
            })
            .await;
        assert_eq!(engine.alert_state("err-1").unwrap().resolved.unwrap().by, "bob");
        assert!(matches!(engine.acknowledge_alert("missing", "x"), Err(Error::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_disabled_engine() {
        let clock = ManualClock::at_epoch_2024();
        let engine = Arc::new(NotificationEngine::new(
            NotificationConfig {
                enabled: false,
                ..config()
            },
            Arc::new(clock),
            TaskRegistry::new(),
        ));
        assert_eq!(engine.process_alert(&alert("a-1", Severity::High)).await, ProcessOutcome::Disabled);
        assert!(engine.alert_history(None, 10).is_empty());
    }
}

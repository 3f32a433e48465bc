//! Delivery channels.
//!
//! A channel turns a rendered [`NotificationPayload`] into an outbound side
//! effect. Console, log, webhook, chat hook, mail relay and callback channels
//! ship with the crate; hosts can implement [`NotificationChannel`] for anything
//! else.

use crate::clock::{secs_to_chrono, MAX_WINDOW_SECS};
use crate::error::{Error, Result};
use crate::events::{EventKind, Severity};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Kind of delivery target. Templates are registered per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    /// Standard output.
    Console,
    /// The crate's own `tracing` output.
    Log,
    /// JSON POST to an HTTP endpoint.
    Webhook,
    /// Mail relay accepting JSON messages.
    Email,
    /// Chat incoming-webhook (`{"text": ...}`).
    ChatHook,
    /// In-process callback.
    Callback,
}

impl ChannelKind {
    /// Returns a static string representation of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Console => "console",
            ChannelKind::Log => "log",
            ChannelKind::Webhook => "webhook",
            ChannelKind::Email => "email",
            ChannelKind::ChatHook => "chat_hook",
            ChannelKind::Callback => "callback",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What every channel receives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationPayload {
    /// Notification id.
    pub notification_id: String,
    /// Rendered subject.
    pub subject: String,
    /// Rendered body.
    pub body: String,
    /// Highest severity among the source events.
    pub priority: Severity,
    /// Render time.
    pub timestamp: DateTime<Utc>,
    /// Kind of the source events.
    pub event_kind: EventKind,
    /// Alert or error ids the notification was built from.
    pub source_ids: Vec<String>,
    /// Escalation level, 0 for the first notification.
    pub escalation_level: u32,
    /// Raw structured source events, forwarded by machine-facing channels.
    pub event: serde_json::Value,
}

/// A pluggable delivery target.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationChannel: Send + Sync + 'static {
    /// Kind used for template selection.
    fn kind(&self) -> ChannelKind;

    /// Delivers one payload. Errors are retried by the engine.
    async fn deliver(&self, payload: &NotificationPayload) -> Result<()>;
}

/// Writes notifications to standard output.
#[derive(Debug, Default)]
pub struct ConsoleChannel;

#[async_trait]
impl NotificationChannel for ConsoleChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Console
    }

    async fn deliver(&self, payload: &NotificationPayload) -> Result<()> {
        println!(
            "[{}] {} {}\n{}",
            payload.timestamp.to_rfc3339(),
            payload.priority.as_str().to_uppercase(),
            payload.subject,
            payload.body
        );
        Ok(())
    }
}

/// Emits notifications as `tracing` events, with the level following priority.
#[derive(Debug, Default)]
pub struct LogChannel;

#[async_trait]
impl NotificationChannel for LogChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Log
    }

    async fn deliver(&self, payload: &NotificationPayload) -> Result<()> {
        let id = payload.notification_id.as_str();
        match payload.priority {
            Severity::Critical | Severity::High => {
                error!(notification_id = id, priority = %payload.priority, body = %payload.body, "{}", payload.subject)
            }
            Severity::Medium => {
                warn!(notification_id = id, priority = %payload.priority, body = %payload.body, "{}", payload.subject)
            }
            Severity::Low => {
                info!(notification_id = id, priority = %payload.priority, body = %payload.body, "{}", payload.subject)
            }
        }
        Ok(())
    }
}

fn http_client(timeout: Duration) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder().timeout(timeout).build()?)
}

async fn post_json(
    client: &reqwest::Client,
    url: &str,
    headers: &BTreeMap<String, String>,
    body: &serde_json::Value,
) -> Result<()> {
    let mut request = client.post(url).json(body);
    for (name, value) in headers {
        request = request.header(name.as_str(), value.as_str());
    }
    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(Error::delivery(url, format!("HTTP {}", status)));
    }
    Ok(())
}

/// POSTs `{"notification": payload, "event": raw}` as JSON.
pub struct WebhookChannel {
    client: reqwest::Client,
    url: String,
    headers: BTreeMap<String, String>,
}

impl WebhookChannel {
    /// Creates a webhook channel with a per-request timeout.
    pub fn new(url: impl Into<String>, headers: BTreeMap<String, String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: http_client(timeout)?,
            url: url.into(),
            headers,
        })
    }
}

#[async_trait]
impl NotificationChannel for WebhookChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Webhook
    }

    async fn deliver(&self, payload: &NotificationPayload) -> Result<()> {
        let body = serde_json::json!({
            "notification": {
                "id": payload.notification_id,
                "subject": payload.subject,
                "body": payload.body,
                "priority": payload.priority,
                "timestamp": payload.timestamp,
                "event_kind": payload.event_kind,
                "source_ids": payload.source_ids,
                "escalation_level": payload.escalation_level,
            },
            "event": payload.event,
        });
        post_json(&self.client, &self.url, &self.headers, &body).await
    }
}

/// Posts to chat incoming-webhooks: a `text` field plus the raw event.
pub struct ChatHookChannel {
    client: reqwest::Client,
    url: String,
}

impl ChatHookChannel {
    /// Creates a chat hook channel with a per-request timeout.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: http_client(timeout)?,
            url: url.into(),
        })
    }
}

#[async_trait]
impl NotificationChannel for ChatHookChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::ChatHook
    }

    async fn deliver(&self, payload: &NotificationPayload) -> Result<()> {
        let body = serde_json::json!({
            "text": format!("*{}*\n{}", payload.subject, payload.body),
            "priority": payload.priority,
            "event": payload.event,
        });
        post_json(&self.client, &self.url, &BTreeMap::new(), &body).await
    }
}

/// Hands messages to an HTTP mail relay as `{from, to, subject, text}`.
pub struct EmailChannel {
    client: reqwest::Client,
    relay_url: String,
    from: String,
    to: Vec<String>,
}

impl EmailChannel {
    /// Creates a mail relay channel. At least one recipient is required.
    pub fn new(relay_url: impl Into<String>, from: impl Into<String>, to: Vec<String>, timeout: Duration) -> Result<Self> {
        if to.is_empty() {
            return Err(Error::config("email channel needs at least one recipient"));
        }
        Ok(Self {
            client: http_client(timeout)?,
            relay_url: relay_url.into(),
            from: from.into(),
            to,
        })
    }
}

#[async_trait]
impl NotificationChannel for EmailChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Email
    }

    async fn deliver(&self, payload: &NotificationPayload) -> Result<()> {
        let body = serde_json::json!({
            "from": self.from,
            "to": self.to,
            "subject": payload.subject,
            "text": payload.body,
            "priority": payload.priority,
        });
        post_json(&self.client, &self.relay_url, &BTreeMap::new(), &body).await
    }
}

/// Callback signature for [`CallbackChannel`].
pub type ChannelCallback = dyn Fn(&NotificationPayload) -> Result<()> + Send + Sync;

/// Runs a host-supplied closure.
pub struct CallbackChannel {
    callback: Arc<ChannelCallback>,
}

impl CallbackChannel {
    /// Wraps a closure.
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(&NotificationPayload) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            callback: Arc::new(callback),
        }
    }
}

#[async_trait]
impl NotificationChannel for CallbackChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Callback
    }

    async fn deliver(&self, payload: &NotificationPayload) -> Result<()> {
        (self.callback)(payload)
    }
}

/// Serializable description of a built-in channel, used by the admin API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChannelTarget {
    /// [`ConsoleChannel`].
    Console,
    /// [`LogChannel`].
    Log,
    /// [`WebhookChannel`].
    Webhook {
        /// Endpoint.
        url: String,
        /// Extra request headers.
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },
    /// [`ChatHookChannel`].
    ChatHook {
        /// Incoming-webhook URL.
        url: String,
    },
    /// [`EmailChannel`].
    Email {
        /// Mail relay endpoint.
        relay_url: String,
        /// Sender address.
        from: String,
        /// Recipients.
        to: Vec<String>,
    },
}

impl ChannelTarget {
    /// Builds the channel.
    pub fn build(&self, timeout: Duration) -> Result<Arc<dyn NotificationChannel>> {
        Ok(match self {
            ChannelTarget::Console => Arc::new(ConsoleChannel),
            ChannelTarget::Log => Arc::new(LogChannel),
            ChannelTarget::Webhook { url, headers } => Arc::new(WebhookChannel::new(url, headers.clone(), timeout)?),
            ChannelTarget::ChatHook { url } => Arc::new(ChatHookChannel::new(url, timeout)?),
            ChannelTarget::Email { relay_url, from, to } => {
                Arc::new(EmailChannel::new(relay_url, from, to.clone(), timeout)?)
            }
        })
    }
}

/// Which events a channel accepts. Empty lists match everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelFilter {
    /// Lowest accepted severity.
    pub min_severity: Option<Severity>,
    /// Accepted operation categories.
    pub categories: Vec<String>,
    /// Accepted sources (alert rule ids or error kinds).
    pub sources: Vec<String>,
    /// Accepted event kinds.
    pub event_kinds: Vec<EventKind>,
}

impl ChannelFilter {
    pub(crate) fn accepts(
        &self,
        kind: EventKind,
        severity: Severity,
        category: Option<&str>,
        source: &str,
    ) -> bool {
        self.min_severity.map_or(true, |min| severity >= min)
            && (self.event_kinds.is_empty() || self.event_kinds.contains(&kind))
            && (self.sources.is_empty() || self.sources.iter().any(|s| s == source))
            && (self.categories.is_empty()
                || category.is_some_and(|c| self.categories.iter().any(|allowed| allowed == c)))
    }
}

/// At most `max` deliveries per fixed window.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimit {
    /// Deliveries allowed per window.
    pub max: u32,
    /// Window length in seconds.
    pub window_secs: u64,
}

/// Channel registration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Channel id.
    pub id: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Disabled channels are skipped.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Event filter.
    #[serde(default)]
    pub filter: ChannelFilter,
    /// Optional rate limit.
    #[serde(default)]
    pub rate_limit: Option<RateLimit>,
}

fn default_true() -> bool {
    true
}

impl ChannelConfig {
    /// An enabled channel accepting everything.
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            enabled: true,
            filter: ChannelFilter::default(),
            rate_limit: None,
        }
    }

    /// Sets the filter.
    pub fn with_filter(mut self, filter: ChannelFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Sets a rate limit.
    pub fn with_rate_limit(mut self, max: u32, window_secs: u64) -> Self {
        self.rate_limit = Some(RateLimit { max, window_secs });
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::config("channel id must not be empty"));
        }
        if let Some(limit) = &self.rate_limit {
            if limit.window_secs == 0 {
                return Err(Error::config(format!("channel '{}': rate limit window must be > 0", self.id)));
            }
            if limit.window_secs > MAX_WINDOW_SECS {
                return Err(Error::config(format!(
                    "channel '{}': rate limit window must be <= {} seconds",
                    self.id, MAX_WINDOW_SECS
                )));
            }
        }
        Ok(())
    }
}

/// Fixed-window delivery counter of one channel.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RateWindow {
    started: DateTime<Utc>,
    count: u32,
}

impl RateWindow {
    pub(crate) fn new(now: DateTime<Utc>) -> Self {
        Self { started: now, count: 0 }
    }

    /// Takes one slot, resetting the counter once the window has elapsed.
    pub(crate) fn try_acquire(&mut self, limit: &RateLimit, now: DateTime<Utc>) -> bool {
        if now - self.started >= secs_to_chrono(limit.window_secs) {
            self.started = now;
            self.count = 0;
        }
        if self.count >= limit.max {
            return false;
        }
        self.count += 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn payload() -> NotificationPayload {
        NotificationPayload {
            notification_id: "n-1".to_string(),
            subject: "subject".to_string(),
            body: "body".to_string(),
            priority: Severity::High,
            timestamp: Utc::now(),
            event_kind: EventKind::Alert,
            source_ids: vec!["a-1".to_string()],
            escalation_level: 0,
            event: serde_json::Value::Null,
        }
    }

    #[test]
    fn test_filter_matching() {
        let filter = ChannelFilter {
            min_severity: Some(Severity::High),
            categories: vec!["orders".to_string()],
            ..ChannelFilter::default()
        };
        assert!(filter.accepts(EventKind::Alert, Severity::Critical, Some("orders"), "rule-1"));
        assert!(!filter.accepts(EventKind::Alert, Severity::Medium, Some("orders"), "rule-1"));
        assert!(!filter.accepts(EventKind::Alert, Severity::High, Some("users"), "rule-1"));
        assert!(!filter.accepts(EventKind::Alert, Severity::High, None, "rule-1"));
        assert!(ChannelFilter::default().accepts(EventKind::Error, Severity::Low, None, "x"));
    }

    #[test]
    fn test_rate_window_resets_after_window() {
        let limit = RateLimit { max: 2, window_secs: 60 };
        let start = Utc::now();
        let mut window = RateWindow::new(start);
        assert!(window.try_acquire(&limit, start));
        assert!(window.try_acquire(&limit, start));
        assert!(!window.try_acquire(&limit, start + chrono::Duration::seconds(59)));
        assert!(window.try_acquire(&limit, start + chrono::Duration::seconds(60)));
    }

    #[tokio::test]
    async fn test_callback_channel_invokes_closure() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let channel = CallbackChannel::new(move |p| {
            assert_eq!(p.subject, "subject");
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        channel.deliver(&payload()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(channel.kind(), ChannelKind::Callback);
    }

    #[test]
    fn test_channel_target_from_json() {
        let target: ChannelTarget =
            serde_json::from_str(r#"{"kind":"webhook","url":"http://localhost:9/hook"}"#).unwrap();
        assert!(matches!(target, ChannelTarget::Webhook { ref url, .. } if url.ends_with("/hook")));
        let built = target.build(Duration::from_secs(1)).unwrap();
        assert_eq!(built.kind(), ChannelKind::Webhook);

        let email: std::result::Result<ChannelTarget, _> =
            serde_json::from_str(r#"{"kind":"email","relay_url":"http://r","from":"a@b","to":[]}"#);
        assert!(email.unwrap().build(Duration::from_secs(1)).is_err());
    }

    #[test]
    fn test_channel_config_validation() {
        assert!(ChannelConfig::new("").validate().is_err());
        assert!(ChannelConfig::new("ops").with_rate_limit(5, 0).validate().is_err());
        assert!(ChannelConfig::new("ops").with_rate_limit(5, 60).validate().is_ok());
    }
}

//! HTTP server for dashboard and admin endpoints
//!
//! Provides REST endpoints for:
//! - Health checks (`/health`, `/ready`, `/live`)
//! - Metrics export (`/metrics`)
//! - Queries over traces, logs, operation metrics, errors and alert history (`/api/...`)
//! - Administration of channels, rules, templates and configuration (`/api/...`)

use crate::config::PipelineConfig;
use crate::error::Error;
use crate::health::HealthStatus;
use crate::logs::LogQuery;
use crate::error_tracker::ErrorFilter;
use crate::notify::{
    ChannelConfig, ChannelTarget, EscalationRule, GroupConfig, NotificationTemplate, SuppressionRule,
};
use crate::perf::{export_prometheus, AlertRule};
use crate::pipeline::Pipeline;
use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;
use warp::http::StatusCode;
use warp::reply::Response;
use warp::{Filter, Rejection, Reply};

const MAX_BODY_BYTES: u64 = 256 * 1024;
const DEFAULT_HISTORY_LIMIT: usize = 100;

/// HTTP server exposing a [`Pipeline`].
pub struct TelemetryServer {
    pipeline: Arc<Pipeline>,
    prometheus: Option<PrometheusHandle>,
    addr: SocketAddr,
}

impl TelemetryServer {
    /// Create a new server listening on `addr`.
    pub fn new(pipeline: Arc<Pipeline>, addr: SocketAddr) -> Self {
        Self {
            pipeline,
            prometheus: None,
            addr,
        }
    }

    /// Append the process-wide `metrics` registry to `/metrics`.
    pub fn with_prometheus(mut self, handle: PrometheusHandle) -> Self {
        self.prometheus = Some(handle);
        self
    }

    /// All routes, for serving or for `warp::test`.
    pub fn routes(&self) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
        routes(Arc::clone(&self.pipeline), self.prometheus.clone())
    }

    /// Serve until the future is dropped.
    pub async fn run(self) {
        info!(addr = %self.addr, "Starting telemetry HTTP server");
        let routes = self.routes();
        warp::serve(routes).run(self.addr).await;
    }

    /// Serve until `shutdown` resolves.
    pub async fn run_until<F>(self, shutdown: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let routes = self.routes();
        let (addr, server) = warp::serve(routes).bind_with_graceful_shutdown(self.addr, shutdown);
        info!(%addr, "Telemetry HTTP server listening");
        server.await;
        info!("Telemetry HTTP server stopped");
    }
}

/// Every endpoint, with CORS and request logging.
pub fn routes(
    pipeline: Arc<Pipeline>,
    prometheus: Option<PrometheusHandle>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    health_routes(Arc::clone(&pipeline), prometheus)
        .or(query_routes(Arc::clone(&pipeline)))
        .or(admin_routes(pipeline))
        .with(warp::cors().allow_any_origin().allow_methods(vec!["GET", "POST", "PUT", "DELETE"]))
        .with(warp::log("telemetry_http"))
}

/// Warp filter to inject the pipeline
fn with_pipeline(pipeline: Arc<Pipeline>) -> impl Filter<Extract = (Arc<Pipeline>,), Error = Infallible> + Clone {
    warp::any().map(move || Arc::clone(&pipeline))
}

fn json_body<T>() -> impl Filter<Extract = (T,), Error = Rejection> + Clone
where
    T: for<'de> Deserialize<'de> + Send,
{
    warp::body::content_length_limit(MAX_BODY_BYTES).and(warp::body::json())
}

fn health_routes(
    pipeline: Arc<Pipeline>,
    prometheus: Option<PrometheusHandle>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let health = warp::path!("health")
        .and(warp::get())
        .and(with_pipeline(Arc::clone(&pipeline)))
        .and_then(health_handler);

    let ready = warp::path!("ready")
        .and(warp::get())
        .and(with_pipeline(Arc::clone(&pipeline)))
        .and_then(readiness_handler);

    let live = warp::path!("live")
        .and(warp::get())
        .and(with_pipeline(Arc::clone(&pipeline)))
        .and_then(liveness_handler);

    let metrics = warp::path!("metrics")
        .and(warp::get())
        .and(with_pipeline(pipeline))
        .and(warp::any().map(move || prometheus.clone()))
        .and_then(metrics_handler);

    let version = warp::path!("version").and(warp::get()).and_then(version_handler);

    health.or(ready).or(live).or(metrics).or(version)
}

fn query_routes(pipeline: Arc<Pipeline>) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let all_perf = warp::path!("api" / "perf")
        .and(warp::get())
        .and(with_pipeline(Arc::clone(&pipeline)))
        .map(|p: Arc<Pipeline>| warp::reply::json(&p.all_perf_stats()));

    let perf = warp::path!("api" / "perf" / String)
        .and(warp::get())
        .and(with_pipeline(Arc::clone(&pipeline)))
        .map(|operation: String, p: Arc<Pipeline>| {
            let response = p.perf_stats(&operation);
            if response.data.is_none() {
                return not_found("operation", &operation);
            }
            warp::reply::json(&response).into_response()
        });

    let search_logs = warp::path!("api" / "logs" / "search")
        .and(warp::post())
        .and(json_body::<LogQuery>())
        .and(with_pipeline(Arc::clone(&pipeline)))
        .map(|query: LogQuery, p: Arc<Pipeline>| warp::reply::json(&p.search_logs(&query)));

    let log_buckets = warp::path!("api" / "logs" / "buckets")
        .and(warp::get())
        .and(warp::query::<BucketParams>())
        .and(with_pipeline(Arc::clone(&pipeline)))
        .map(|params: BucketParams, p: Arc<Pipeline>| {
            let bucket = Duration::from_secs(params.bucket_secs.unwrap_or(60));
            match p.logs().time_window_stats(params.start, params.end, bucket) {
                Ok(buckets) => warp::reply::json(&buckets).into_response(),
                Err(e) => error_reply(e),
            }
        });

    let errors = warp::path!("api" / "errors")
        .and(warp::get())
        .and(warp::query::<ErrorFilter>())
        .and(with_pipeline(Arc::clone(&pipeline)))
        .map(|filter: ErrorFilter, p: Arc<Pipeline>| warp::reply::json(&p.errors(&filter)));

    let error_dashboard = warp::path!("api" / "errors" / "dashboard")
        .and(warp::get())
        .and(with_pipeline(Arc::clone(&pipeline)))
        .map(|p: Arc<Pipeline>| warp::reply::json(&p.error_dashboard()));

    let error = warp::path!("api" / "errors" / String)
        .and(warp::get())
        .and(with_pipeline(Arc::clone(&pipeline)))
        .map(|id: String, p: Arc<Pipeline>| match p.error_tracker().get_error(&id) {
            Some(error) => warp::reply::json(&error).into_response(),
            None => not_found("error", &id),
        });

    let history = warp::path!("api" / "alerts" / "history")
        .and(warp::get())
        .and(warp::query::<HistoryParams>())
        .and(with_pipeline(Arc::clone(&pipeline)))
        .map(|params: HistoryParams, p: Arc<Pipeline>| {
            let limit = params.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
            warp::reply::json(&p.alert_history(params.alert_id.as_deref(), limit))
        });

    let trace = warp::path!("api" / "traces" / Uuid)
        .and(warp::get())
        .and(warp::query::<TraceParams>())
        .and(with_pipeline(Arc::clone(&pipeline)))
        .map(|id: Uuid, params: TraceParams, p: Arc<Pipeline>| {
            let response = p.trace(&id);
            match (&response.data, params.format.as_deref()) {
                (None, _) => not_found("trace", &id.to_string()),
                (Some(trace), Some("jaeger")) => warp::reply::json(&trace.to_jaeger_json()).into_response(),
                _ => warp::reply::json(&response).into_response(),
            }
        });

    let stats = warp::path!("api" / "stats")
        .and(warp::get())
        .and(with_pipeline(pipeline))
        .map(|p: Arc<Pipeline>| warp::reply::json(&p.stats()));

    all_perf
        .or(perf)
        .or(search_logs)
        .or(log_buckets)
        .or(error_dashboard)
        .or(errors)
        .or(error)
        .or(history)
        .or(trace)
        .or(stats)
}

fn admin_routes(pipeline: Arc<Pipeline>) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let add_channel = warp::path!("api" / "channels")
        .and(warp::post())
        .and(json_body::<ChannelRegistration>())
        .and(with_pipeline(Arc::clone(&pipeline)))
        .map(|body: ChannelRegistration, p: Arc<Pipeline>| {
            let id = body.config.id.clone();
            created(p.notifications().register_channel_target(body.config, &body.target), &id)
        });

    let list_channels = warp::path!("api" / "channels")
        .and(warp::get())
        .and(with_pipeline(Arc::clone(&pipeline)))
        .map(|p: Arc<Pipeline>| warp::reply::json(&p.notifications().channels()));

    let remove_channel = warp::path!("api" / "channels" / String)
        .and(warp::delete())
        .and(with_pipeline(Arc::clone(&pipeline)))
        .map(|id: String, p: Arc<Pipeline>| removed(p.notifications().unregister_channel(&id)));

    let add_alert_rule = warp::path!("api" / "alert-rules")
        .and(warp::post())
        .and(json_body::<AlertRule>())
        .and(with_pipeline(Arc::clone(&pipeline)))
        .map(|rule: AlertRule, p: Arc<Pipeline>| {
            let id = rule.id.clone();
            created(p.metrics().add_rule(rule), &id)
        });

    let list_alert_rules = warp::path!("api" / "alert-rules")
        .and(warp::get())
        .and(with_pipeline(Arc::clone(&pipeline)))
        .map(|p: Arc<Pipeline>| warp::reply::json(&p.metrics().rules()));

    let remove_alert_rule = warp::path!("api" / "alert-rules" / String)
        .and(warp::delete())
        .and(with_pipeline(Arc::clone(&pipeline)))
        .map(|id: String, p: Arc<Pipeline>| removed(p.metrics().remove_rule(&id)));

    let add_suppression = warp::path!("api" / "suppression-rules")
        .and(warp::post())
        .and(json_body::<SuppressionRule>())
        .and(with_pipeline(Arc::clone(&pipeline)))
        .map(|rule: SuppressionRule, p: Arc<Pipeline>| {
            let id = rule.id.clone();
            created(p.notifications().add_suppression_rule(rule), &id)
        });

    let remove_suppression = warp::path!("api" / "suppression-rules" / String)
        .and(warp::delete())
        .and(with_pipeline(Arc::clone(&pipeline)))
        .map(|id: String, p: Arc<Pipeline>| removed(p.notifications().remove_suppression_rule(&id)));

    let add_group = warp::path!("api" / "groups")
        .and(warp::post())
        .and(json_body::<GroupConfig>())
        .and(with_pipeline(Arc::clone(&pipeline)))
        .map(|group: GroupConfig, p: Arc<Pipeline>| {
            let id = group.id.clone();
            created(p.notifications().add_group(group), &id)
        });

    let remove_group = warp::path!("api" / "groups" / String)
        .and(warp::delete())
        .and(with_pipeline(Arc::clone(&pipeline)))
        .map(|id: String, p: Arc<Pipeline>| removed(p.notifications().remove_group(&id)));

    let add_escalation = warp::path!("api" / "escalation-rules")
        .and(warp::post())
        .and(json_body::<EscalationRule>())
        .and(with_pipeline(Arc::clone(&pipeline)))
        .map(|rule: EscalationRule, p: Arc<Pipeline>| {
            let id = rule.id.clone();
            created(p.notifications().add_escalation_rule(rule), &id)
        });

    let remove_escalation = warp::path!("api" / "escalation-rules" / String)
        .and(warp::delete())
        .and(with_pipeline(Arc::clone(&pipeline)))
        .map(|id: String, p: Arc<Pipeline>| removed(p.notifications().remove_escalation_rule(&id)));

    let add_template = warp::path!("api" / "templates")
        .and(warp::post())
        .and(json_body::<NotificationTemplate>())
        .and(with_pipeline(Arc::clone(&pipeline)))
        .map(|template: NotificationTemplate, p: Arc<Pipeline>| {
            let id = template.event_kind.as_str().to_string();
            p.notifications().register_template(template);
            created(Ok(()), &id)
        });

    let acknowledge = warp::path!("api" / "alerts" / String / "ack")
        .and(warp::post())
        .and(json_body::<AckRequest>())
        .and(with_pipeline(Arc::clone(&pipeline)))
        .map(|id: String, body: AckRequest, p: Arc<Pipeline>| match p.acknowledge(&id, &body.by) {
            Ok(state) => warp::reply::json(&state).into_response(),
            Err(e) => error_reply(e),
        });

    let resolve = warp::path!("api" / "alerts" / String / "resolve")
        .and(warp::post())
        .and(json_body::<ResolveRequest>())
        .and(with_pipeline(Arc::clone(&pipeline)))
        .map(|id: String, body: ResolveRequest, p: Arc<Pipeline>| {
            match p.resolve(&id, &body.by, body.notes.as_deref()) {
                Ok(()) => warp::reply::json(&json!({ "resolved": id })).into_response(),
                Err(e) => error_reply(e),
            }
        });

    let get_config = warp::path!("api" / "config")
        .and(warp::get())
        .and(with_pipeline(Arc::clone(&pipeline)))
        .map(|p: Arc<Pipeline>| warp::reply::json(&p.config()));

    let put_config = warp::path!("api" / "config")
        .and(warp::put())
        .and(json_body::<PipelineConfig>())
        .and(with_pipeline(pipeline))
        .map(|config: PipelineConfig, p: Arc<Pipeline>| match p.update_config(config) {
            Ok(()) => warp::reply::json(&p.config()).into_response(),
            Err(e) => error_reply(e),
        });

    add_channel
        .or(list_channels)
        .or(remove_channel)
        .or(add_alert_rule)
        .or(list_alert_rules)
        .or(remove_alert_rule)
        .or(add_suppression)
        .or(remove_suppression)
        .or(add_group)
        .or(remove_group)
        .or(add_escalation)
        .or(remove_escalation)
        .or(add_template)
        .or(acknowledge)
        .or(resolve)
        .or(get_config)
        .or(put_config)
}

#[derive(Debug, Deserialize)]
struct ChannelRegistration {
    config: ChannelConfig,
    target: ChannelTarget,
}

#[derive(Debug, Deserialize)]
struct AckRequest {
    by: String,
}

#[derive(Debug, Deserialize)]
struct ResolveRequest {
    by: String,
    #[serde(default)]
    notes: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HistoryParams {
    alert_id: Option<String>,
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct TraceParams {
    format: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BucketParams {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    bucket_secs: Option<u64>,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: String,
    code: &'a str,
}

fn status_for(error: &Error) -> (StatusCode, &'static str) {
    match error {
        Error::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
        Error::Config(_) => (StatusCode::BAD_REQUEST, "invalid_config"),
        Error::InvalidRule(_) => (StatusCode::BAD_REQUEST, "invalid_rule"),
        Error::Template(_) => (StatusCode::BAD_REQUEST, "invalid_template"),
        Error::Serialization(_) => (StatusCode::BAD_REQUEST, "invalid_body"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
    }
}

fn error_reply(error: Error) -> Response {
    let (status, code) = status_for(&error);
    if status.is_server_error() {
        warn!(error = %error, "Admin request failed");
    } else {
        debug!(error = %error, "Admin request rejected");
    }
    let body = ErrorBody {
        error: error.to_string(),
        code,
    };
    warp::reply::with_status(warp::reply::json(&body), status).into_response()
}

fn not_found(kind: &'static str, id: &str) -> Response {
    error_reply(Error::not_found(kind, id))
}

fn created(result: crate::error::Result<()>, id: &str) -> Response {
    match result {
        Ok(()) => warp::reply::with_status(warp::reply::json(&json!({ "id": id })), StatusCode::CREATED).into_response(),
        Err(e) => error_reply(e),
    }
}

fn removed<T: Serialize>(result: crate::error::Result<T>) -> Response {
    match result {
        Ok(value) => warp::reply::json(&value).into_response(),
        Err(e) => error_reply(e),
    }
}

/// Health check handler
async fn health_handler(pipeline: Arc<Pipeline>) -> Result<impl Reply, Rejection> {
    debug!("Health endpoint requested");
    let report = pipeline.health().await;

    let status_code = match report.status {
        HealthStatus::Healthy => StatusCode::OK,
        HealthStatus::Degraded => StatusCode::OK, // Still serving traffic
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    Ok(warp::reply::with_status(warp::reply::json(&report), status_code))
}

/// Readiness check handler
async fn readiness_handler(pipeline: Arc<Pipeline>) -> Result<impl Reply, Rejection> {
    debug!("Readiness endpoint requested");
    let report = match pipeline.health_monitor().last_report() {
        Some(report) => report,
        None => pipeline.health().await,
    };

    // Ready means inline calls record and the report is not unhealthy
    let is_ready = pipeline.is_enabled() && report.status != HealthStatus::Unhealthy;
    let status_code = if is_ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let response = json!({
        "ready": is_ready,
        "enabled": pipeline.is_enabled(),
        "status": report.status,
        "timestamp": report.timestamp,
        "version": report.version,
    });
    Ok(warp::reply::with_status(warp::reply::json(&response), status_code))
}

/// Liveness check handler
async fn liveness_handler(pipeline: Arc<Pipeline>) -> Result<impl Reply, Rejection> {
    debug!("Liveness endpoint requested");
    let report = pipeline.health_monitor().last_report();

    // A disabled pipeline is still alive; only a failed critical check is not
    let is_alive = report.as_ref().map_or(true, |r| r.status != HealthStatus::Unhealthy);
    let status_code = if is_alive {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let response = json!({
        "alive": is_alive,
        "running": pipeline.is_running(),
        "uptime_seconds": report.as_ref().map(|r| r.uptime_seconds),
        "version": crate::VERSION,
    });
    Ok(warp::reply::with_status(warp::reply::json(&response), status_code))
}

/// Metrics handler (Prometheus format)
async fn metrics_handler(
    pipeline: Arc<Pipeline>,
    prometheus: Option<PrometheusHandle>,
) -> Result<impl Reply, Rejection> {
    debug!("Metrics endpoint requested");
    let mut text = export_prometheus(&pipeline.all_perf_stats().data);
    if let Some(handle) = prometheus {
        text.push_str(&handle.render());
    }
    Ok(warp::reply::with_header(
        text,
        "content-type",
        "text/plain; version=0.0.4; charset=utf-8",
    ))
}

/// Version handler
async fn version_handler() -> Result<impl Reply, Rejection> {
    debug!("Version endpoint requested");
    let response = json!({
        "service": "zola-telemetry",
        "version": crate::VERSION,
        "description": env!("CARGO_PKG_DESCRIPTION"),
    });
    Ok(warp::reply::json(&response))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::pipeline::Outcome;

    fn pipeline() -> Arc<Pipeline> {
        let mut config = PipelineConfig::default();
        config.tracing.sample_rate = 1.0;
        Pipeline::with_clock(config, Arc::new(ManualClock::at_epoch_2024())).unwrap()
    }

    #[tokio::test]
    async fn test_health_and_version() {
        let api = routes(pipeline(), None);

        let res = warp::test::request().method("GET").path("/health").reply(&api).await;
        assert_eq!(res.status(), StatusCode::OK);
        let body: serde_json::Value = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(body["status"], "healthy");

        let res = warp::test::request().method("GET").path("/version").reply(&api).await;
        let body: serde_json::Value = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(body["service"], "zola-telemetry");

        let res = warp::test::request().method("GET").path("/ready").reply(&api).await;
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_metrics_exports_perf_stats() {
        let pipeline = pipeline();
        let monitor = pipeline.monitor("pages");
        let handle = monitor.begin("render_page", None, None, None);
        monitor.end(handle, Outcome::Success, None, None);
        pipeline.metrics().aggregate();

        let api = routes(pipeline, None);
        let res = warp::test::request().method("GET").path("/metrics").reply(&api).await;
        assert_eq!(res.status(), StatusCode::OK);
        assert!(res.headers()["content-type"].to_str().unwrap().starts_with("text/plain"));
        let text = String::from_utf8(res.body().to_vec()).unwrap();
        assert!(text.contains("render_page"));
    }

    #[tokio::test]
    async fn test_trace_lookup() {
        let pipeline = pipeline();
        let monitor = pipeline.monitor("pages");
        let handle = monitor.begin("render_page", None, None, None);
        let trace_id = handle.trace().trace_id().unwrap();
        monitor.end(handle, Outcome::Success, None, None);
        let api = routes(pipeline, None);

        let res = warp::test::request()
            .method("GET")
            .path(&format!("/api/traces/{}", trace_id))
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::OK);
        let body: serde_json::Value = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(body["degraded"], false);

        let res = warp::test::request()
            .method("GET")
            .path(&format!("/api/traces/{}", Uuid::new_v4()))
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_admin_errors_map_to_status() {
        let api = routes(pipeline(), None);

        let res = warp::test::request()
            .method("POST")
            .path("/api/alerts/missing/ack")
            .json(&json!({ "by": "ops" }))
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);

        let res = warp::test::request()
            .method("POST")
            .path("/api/templates")
            .json(&json!({ "event_kind": "alert", "subject": "{{nope}}", "body": "{{title}}" }))
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        let mut config = PipelineConfig::default();
        config.tracing.sample_rate = 3.0;
        let res = warp::test::request()
            .method("PUT")
            .path("/api/config")
            .json(&config)
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_out_of_range_windows_are_handled() {
        use crate::perf::{AlertCondition, AlertRule, ComparisonOperator};
        let pipeline = pipeline();
        let api = routes(Arc::clone(&pipeline), None);

        let wide = AlertRule::new("wide", AlertCondition::MeanDuration, ComparisonOperator::Gt, 1.0, 10_000_000_000_000_000);
        let res = warp::test::request()
            .method("POST")
            .path("/api/alert-rules")
            .json(&wide)
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert!(pipeline.metrics().rules().is_empty());

        let res = warp::test::request()
            .method("GET")
            .path("/api/logs/buckets?start=2024-01-01T00:00:00Z&end=2024-01-01T01:00:00Z&bucket_secs=18446744073709551615")
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::OK);
        let body: serde_json::Value = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(body.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_register_and_remove_channel() {
        let pipeline = pipeline();
        let api = routes(Arc::clone(&pipeline), None);

        let res = warp::test::request()
            .method("POST")
            .path("/api/channels")
            .json(&json!({ "config": ChannelConfig::new("console"), "target": { "kind": "console" } }))
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::CREATED);
        assert_eq!(pipeline.notifications().channels().len(), 1);

        let res = warp::test::request().method("DELETE").path("/api/channels/console").reply(&api).await;
        assert_eq!(res.status(), StatusCode::OK);
        let res = warp::test::request().method("DELETE").path("/api/channels/console").reply(&api).await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_log_search_and_error_queries() {
        let pipeline = pipeline();
        let monitor = pipeline.monitor("billing");
        let handle = monitor.begin("charge", None, Some("req-9"), None);
        let report = crate::error_tracker::ErrorReport::new("CardDeclined", "card declined by issuer");
        monitor.end(handle, Outcome::Failure, Some(&report), None);
        pipeline.logs().flush();
        let api = routes(pipeline, None);

        let res = warp::test::request()
            .method("POST")
            .path("/api/logs/search")
            .json(&json!({ "correlation_id": "req-9" }))
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::OK);
        let body: serde_json::Value = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(body["data"]["total"], 2);

        let res = warp::test::request().method("GET").path("/api/errors?limit=5").reply(&api).await;
        let body: serde_json::Value = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(body["data"].as_array().unwrap().len(), 1);

        let res = warp::test::request().method("GET").path("/api/errors/dashboard").reply(&api).await;
        assert_eq!(res.status(), StatusCode::OK);
    }
}

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use zola_telemetry::error_tracker::{ErrorContext, ErrorFilter, ErrorReport};
use zola_telemetry::logs::{LogContext, LogLevel, LogQuery};
use zola_telemetry::notify::{CallbackChannel, ChannelConfig, ChannelFilter, HistoryAction, NotificationPayload};
use zola_telemetry::perf::{AlertCondition, AlertRule, ComparisonOperator};
use zola_telemetry::{EventKind, ManualClock, Outcome, Pipeline, PipelineConfig, Severity, TraceContext};

fn config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.tracing.sample_rate = 1.0;
    config
}

fn recording_channel(pipeline: &Pipeline, id: &str, filter: ChannelFilter) -> Arc<Mutex<Vec<NotificationPayload>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    pipeline
        .notifications()
        .register_channel(
            ChannelConfig::new(id).with_filter(filter),
            Arc::new(CallbackChannel::new(move |payload| {
                sink.lock().push(payload.clone());
                Ok(())
            })),
        )
        .unwrap();
    seen
}

async fn wait_for(seen: &Mutex<Vec<NotificationPayload>>, count: usize) {
    for _ in 0..100 {
        if seen.lock().len() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_alert_rule_reaches_channel() {
    let clock = ManualClock::at_epoch_2024();
    let pipeline = Pipeline::with_clock(config(), Arc::new(clock.clone())).unwrap();
    let seen = recording_channel(
        &pipeline,
        "oncall",
        ChannelFilter {
            event_kinds: vec![EventKind::Alert],
            ..ChannelFilter::default()
        },
    );
    pipeline.start().unwrap();

    pipeline
        .metrics()
        .add_rule(
            AlertRule::new("checkout-failures", AlertCondition::FailureRatio, ComparisonOperator::Gt, 0.5, 300)
                .with_severity(Severity::Critical)
                .with_cooldown_secs(600),
        )
        .unwrap();

    let monitor = pipeline.monitor("orders");
    for attempt in 0..4 {
        let handle = monitor.begin("checkout", Some(&format!("order-{}", attempt)), None, None);
        let outcome = if attempt == 0 { Outcome::Success } else { Outcome::Failure };
        monitor.end(handle, outcome, None, None);
    }

    let fired = pipeline.metrics().evaluate_alerts();
    assert_eq!(fired.len(), 1);
    assert_eq!(fired[0].value, 0.75);

    // Inside the cooldown the rule stays quiet even though it is still breached
    clock.advance(Duration::from_secs(60));
    assert!(pipeline.metrics().evaluate_alerts().is_empty());

    wait_for(&seen, 1).await;
    let payloads = seen.lock().clone();
    assert_eq!(payloads.len(), 1);
    let alert = &payloads[0];
    assert_eq!(alert.source_ids, vec![fired[0].id.clone()]);
    assert_eq!(alert.priority, Severity::Critical);
    assert!(alert.subject.contains("CRITICAL"));

    let state = pipeline.acknowledge(&fired[0].id, "ops").unwrap();
    assert_eq!(state.acknowledged.unwrap().by, "ops");
    let history = pipeline.alert_history(Some(&fired[0].id), 10).data;
    assert!(history.iter().any(|e| e.action == HistoryAction::Acknowledged));

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_repeated_errors_are_deduplicated() {
    let pipeline = Pipeline::with_clock(config(), Arc::new(ManualClock::at_epoch_2024())).unwrap();
    let seen = recording_channel(
        &pipeline,
        "errors-only",
        ChannelFilter {
            event_kinds: vec![EventKind::Error],
            ..ChannelFilter::default()
        },
    );
    pipeline.start().unwrap();

    let monitor = pipeline.monitor("media");
    for id in [17, 42] {
        let handle = monitor.begin("upload_image", Some(&format!("img-{}", id)), None, None);
        let report = ErrorReport::new("StorageError", format!("upload of object {} failed", id));
        monitor.end(handle, Outcome::Failure, Some(&report), None);
    }

    let errors = pipeline.errors(&ErrorFilter::default()).data;
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].occurrence_count, 2);
    assert_eq!(errors[0].affected_subjects.len(), 2);
    assert_eq!(errors[0].severity, Severity::High);

    // Only the first occurrence notifies
    wait_for(&seen, 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(seen.lock().len(), 1);

    let dashboard = pipeline.error_dashboard().data;
    assert_eq!(dashboard.total, 1);

    pipeline.resolve(&errors[0].id, "dev", Some("bucket policy fixed")).unwrap();
    assert!(pipeline.error_tracker().get_error(&errors[0].id).unwrap().resolution.is_some());
    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_logs_are_searchable_by_correlation() {
    let pipeline = Pipeline::with_clock(config(), Arc::new(ManualClock::at_epoch_2024())).unwrap();
    let monitor = pipeline.monitor("pages");

    let mut handle = monitor.begin("publish", Some("page-1"), Some("req-abc"), None);
    monitor.checkpoint(&mut handle, "rendered", None);
    monitor.end(handle, Outcome::Success, None, Some("published"));
    pipeline.log(
        LogLevel::Warn,
        "cache miss on publish",
        LogContext::new().with_correlation_id("req-abc").with_category("pages"),
    );
    pipeline.log(LogLevel::Info, "unrelated", LogContext::new().with_correlation_id("req-other"));
    pipeline.logs().flush();

    let result = pipeline.search_logs(&LogQuery::new().correlation("req-abc")).data;
    assert_eq!(result.total, 4);
    let warnings = pipeline
        .search_logs(&LogQuery::new().correlation("req-abc").min_level(LogLevel::Warn))
        .data;
    assert_eq!(warnings.total, 1);
    assert!(pipeline.logs().check_consistency().is_empty());
}

#[tokio::test]
async fn test_nested_operation_is_a_child_span() {
    let pipeline = Pipeline::with_clock(config(), Arc::new(ManualClock::at_epoch_2024())).unwrap();
    let pages = pipeline.monitor("pages");
    let media = pipeline.monitor("media");

    let parent = pages.begin("publish", Some("page-1"), Some("req-1"), None);
    let child = media.begin("resize_image", Some("img-9"), Some("req-1"), Some(&parent.trace()));
    assert_eq!(child.trace().trace_id(), parent.trace().trace_id());
    assert_ne!(child.trace().span_id(), parent.trace().span_id());

    let trace_id = parent.trace().trace_id().unwrap();
    let root_span = parent.trace().span_id().unwrap();
    let child_span = child.trace().span_id().unwrap();
    media.end(child, Outcome::Success, None, None);
    // The trace stays open until its root finishes
    let open = pipeline.trace(&trace_id).data.expect("active trace");
    assert!(open.finished_at.is_none());
    pages.end(parent, Outcome::Success, None, None);

    let trace = pipeline.trace(&trace_id).data.expect("completed trace");
    assert!(trace.finished_at.is_some());
    assert_eq!(trace.spans.len(), 2);
    assert_eq!(trace.root_span_id, root_span);
    let span = &trace.spans[&child_span];
    assert_eq!(span.parent_id, Some(root_span));
    assert_eq!(span.tags.get("category").map(String::as_str), Some("media"));
    assert_eq!(pipeline.stats().tracer.completed, 1);

    // An unsampled parent keeps the nested operation unsampled, but it is still measured
    let unsampled = media.begin("resize_image", None, None, Some(&TraceContext::NONE));
    assert!(!unsampled.trace().is_sampled());
    media.end(unsampled, Outcome::Success, None, None);
    assert_eq!(pipeline.metrics().sample_count(), 3);
}

#[tokio::test]
async fn test_disable_stops_recording_but_keeps_data() {
    let pipeline = Pipeline::with_clock(config(), Arc::new(ManualClock::at_epoch_2024())).unwrap();
    pipeline.start().unwrap();
    let monitor = pipeline.monitor("pages");

    let handle = monitor.begin("save", None, None, None);
    monitor.end(handle, Outcome::Success, None, None);
    assert_eq!(pipeline.metrics().sample_count(), 1);

    pipeline.disable();
    assert!(!pipeline.is_running());
    let handle = monitor.begin("save", None, None, None);
    monitor.end(handle, Outcome::Success, None, None);
    assert!(pipeline
        .track_error(&ErrorReport::new("Ignored", "not recorded"), &ErrorContext::default())
        .is_none());
    assert_eq!(pipeline.metrics().sample_count(), 1);

    let stats = pipeline.stats();
    assert!(!stats.enabled);
    assert_eq!(stats.tracer.completed, 1);

    pipeline.enable().unwrap();
    assert!(pipeline.is_running());
    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_health_reports_component_checks() {
    let pipeline = Pipeline::with_clock(config(), Arc::new(ManualClock::at_epoch_2024())).unwrap();
    pipeline.start().unwrap();

    let report = pipeline.health().await;
    assert_eq!(report.status, zola_telemetry::HealthStatus::Healthy);
    for name in ["event_queue", "background_tasks", "log_index"] {
        assert!(report.components.contains_key(name), "missing component {}", name);
    }
    assert!(!pipeline.all_perf_stats().degraded);
    pipeline.shutdown().await;
}

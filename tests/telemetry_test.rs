//! Integration tests for telemetry initialization and span helpers.

use commons_refresh::telemetry::refresh::{record_task_result, start_query_span, start_task_span};
use uuid::Uuid;

#[test]
fn telemetry_initializes_without_endpoint() {
    // A global subscriber can only be set once per process; a second
    // init in the same test binary returns Err, which is fine here.
    let config = commons_refresh::telemetry::TelemetryConfig {
        endpoint: None,
        service_name: "commons-refresh-test".to_string(),
        log_level: "debug".to_string(),
    };
    let _guard = commons_refresh::telemetry::init_telemetry(config);
}

#[test]
fn task_span_creates_and_records_result() {
    let span = start_task_span("labels.refresh", &Uuid::new_v4(), "wdqs");
    record_task_result(&span, "ok");
}

#[test]
fn query_span_creates() {
    let span = start_query_span("members", "wdqs");
    let _enter = span.enter();
}

#[test]
fn metric_instruments_are_usable_without_a_provider() {
    use commons_refresh::telemetry::metrics;
    use opentelemetry::KeyValue;

    metrics::records_claimed().add(
        3,
        &[
            KeyValue::new("operation", "labels"),
            KeyValue::new("kind", "country"),
            KeyValue::new("trigger", "periodic"),
        ],
    );
    metrics::stale_dispatches().add(1, &[KeyValue::new("operation", "members")]);
    metrics::operation_duration_ms().record(12.5, &[KeyValue::new("operation", "labels")]);
}

#[test]
fn resource_names_the_service_and_its_version() {
    use opentelemetry::{Key, Value};
    use opentelemetry_semantic_conventions::resource::{SERVICE_NAME, SERVICE_VERSION};

    let resource = commons_refresh::telemetry::resource("commons-refresh-test".to_string());

    assert_eq!(
        resource.get(&Key::from_static_str(SERVICE_NAME)),
        Some(Value::from("commons-refresh-test"))
    );
    assert_eq!(
        resource.get(&Key::from_static_str(SERVICE_VERSION)),
        Some(Value::from(env!("CARGO_PKG_VERSION")))
    );
}

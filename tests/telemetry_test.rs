//! Integration tests for telemetry initialization and span helpers.

use uuid::Uuid;

#[test]
fn telemetry_writes_to_log_file() {
    let dir = tempfile::tempdir().unwrap();
    let log_file = dir.path().join("claimq.log");

    // The global subscriber can be installed once per process; this is the
    // only test in this binary that installs one.
    let guard = claimq::telemetry::init_telemetry(claimq::telemetry::TelemetryConfig {
        endpoint: None,
        service_name: "claimq-test".to_string(),
        log_level: "info".to_string(),
        log_file: Some(log_file.clone()),
    })
    .unwrap();

    tracing::info!(key = "acct-1", "telemetry smoke line");
    drop(guard);

    let written = std::fs::read_to_string(&log_file).unwrap();
    assert!(written.contains("telemetry smoke line"), "{written}");
    assert!(written.contains("acct-1"));
}

#[test]
fn task_span_creates_and_records_transition() {
    let id = Uuid::new_v4();
    let span = claimq::telemetry::work::start_task_span("acct-1", "0", &id);
    claimq::telemetry::work::record_state_transition(&span, "pending", "in-progress");
    claimq::telemetry::work::record_state_transition(&span, "in-progress", "done");
}

#[test]
fn metric_instruments_work_without_provider() {
    use opentelemetry::KeyValue;

    claimq::telemetry::metrics::cycles().add(1, &[]);
    claimq::telemetry::metrics::tasks_dispatched().add(1, &[]);
    claimq::telemetry::metrics::task_outcomes().add(1, &[KeyValue::new("outcome", "success")]);
    claimq::telemetry::metrics::units_claimed().add(1, &[KeyValue::new("pool", "0")]);
    claimq::telemetry::metrics::units_provisioned().add(1, &[KeyValue::new("pool", "0")]);
    claimq::telemetry::metrics::units_exhausted().add(1, &[KeyValue::new("pool", "0")]);
    claimq::telemetry::metrics::lock_wait_ms()
        .record(1.5, &[KeyValue::new("lock", "tasks.csv.lock")]);
}

#[test]
fn unwritable_log_file_is_a_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let result = claimq::telemetry::init_telemetry(claimq::telemetry::TelemetryConfig {
        endpoint: None,
        service_name: "claimq-test".to_string(),
        log_level: "info".to_string(),
        log_file: Some(dir.path().join("missing-dir").join("claimq.log")),
    });
    assert!(matches!(result, Err(claimq::error::Error::Config(_))));
}

use cn_telemetry::logging::{self, LogFormat};

#[test]
fn init_logging_human_twice_is_noop() {
    logging::init_logging("test-service", "debug");
    logging::init_logging("test-service", "info");

    tracing::info!(key = "value", "human-readable log line");
}

#[test]
fn init_logging_json_after_human_is_noop() {
    // The global subscriber may already be set by another test.
    logging::init_logging_json("test-service-json", "info");

    tracing::info!(key = "value", "json log line");
}

#[test]
fn format_from_name() {
    assert_eq!(LogFormat::from_name("json"), LogFormat::Json);
    assert_eq!(LogFormat::from_name("JSON"), LogFormat::Json);
    assert_eq!(LogFormat::from_name("human"), LogFormat::Human);
    assert_eq!(LogFormat::from_name("anything"), LogFormat::Human);
    logging::init("fallback-test", "warn", LogFormat::from_name("human"));
}

use std::io::Write;

use cn_core::config::{BarrierMode, Config};

#[test]
fn default_config() {
    let cfg = Config::default();
    assert_eq!(cfg.general.project_name, "conductor");
    assert_eq!(cfg.general.log_level, "info");
    assert_eq!(cfg.general.log_format, "human");
    assert_eq!(cfg.planner.primary.provider, "openai");
    assert_eq!(cfg.planner.timeout_secs, 60);
    assert_eq!(cfg.dispatch.max_retries, 1);
    assert_eq!(cfg.scheduler.barrier, BarrierMode::Dispatch);
    assert!(cfg.scheduler.enforce_concurrency);
    assert!(cfg.validation.enforce_stage_budgets);
    assert!(cfg.agents.endpoints.is_empty());
}

#[test]
fn config_roundtrip() {
    let cfg = Config::default();
    let toml_str = cfg.to_toml().expect("serialize to toml");
    assert!(toml_str.contains("conductor"));

    let parsed: Config = toml::from_str(&toml_str).expect("parse toml back");
    assert_eq!(parsed.general.project_name, cfg.general.project_name);
    assert_eq!(parsed.planner.primary, cfg.planner.primary);
    assert_eq!(parsed.planner.fallback, cfg.planner.fallback);
    assert_eq!(parsed.dispatch.timeout_ms, cfg.dispatch.timeout_ms);
    parsed.validate().expect("config validates");
}

#[test]
fn config_partial_toml() {
    let partial = r#"
[scheduler]
barrier = "completion"

[agents.endpoints]
frontend = "http://localhost:7001"
"#;
    let cfg = Config::from_toml(partial).expect("parse partial");
    assert_eq!(cfg.scheduler.barrier, BarrierMode::Completion);
    assert_eq!(
        cfg.agents.endpoints.get("frontend").map(String::as_str),
        Some("http://localhost:7001")
    );
    // defaults should fill in the rest
    assert_eq!(cfg.general.log_level, "info");
    assert_eq!(cfg.scheduler.poll_interval_ms, 500);
}

#[test]
fn load_from_file() {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    writeln!(
        file,
        r#"
[planner.primary]
provider = "anthropic"
model = "claude-sonnet-4-20250514"
api_key_env = "ANTHROPIC_API_KEY"

[validation]
resource_tolerance = 0.5
"#
    )
    .expect("write config");

    let cfg = Config::load_from(file.path()).expect("load config");
    assert_eq!(cfg.planner.primary.provider, "anthropic");
    assert_eq!(cfg.planner.primary.max_tokens, 4096);
    let opts = cfg.validation.options();
    assert_eq!(opts.resource_tolerance, 0.5);
    assert!(opts.enforce_stage_budgets);
}

#[test]
fn missing_file_is_io_error() {
    let err = Config::load_from("/definitely/not/here/config.toml").expect_err("should fail");
    assert!(err.to_string().starts_with("io:"));
}

#[test]
fn unknown_provider_fails_validation() {
    let mut cfg = Config::default();
    cfg.planner.primary.provider = "carrier-pigeon".into();
    let err = cfg.validate().expect_err("validation should fail");
    assert!(err.to_string().contains("planner.primary.provider"));
}

#[test]
fn negative_tolerance_fails_validation() {
    let mut cfg = Config::default();
    cfg.validation.resource_tolerance = -1.0;
    let err = cfg.validate().expect_err("validation should fail");
    assert!(err.to_string().contains("resource_tolerance"));
}

#[test]
fn malformed_toml_is_parse_error() {
    let err = Config::from_toml("[general\nproject_name = 1").expect_err("should fail");
    assert!(err.to_string().starts_with("parse:"));
}

#[path = "common/mod.rs"]
mod common;

use std::time::Duration;

use common::EnvGuard;
use once_cell::sync::Lazy;
use pharmaguard::pipeline::{PipelineTarget, DEFAULT_PIPELINE_COMMAND};
use pharmaguard::{AppConfig, CorsOrigins};
use std::sync::Mutex;

static ENV_MUTEX: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

const VARS: [&str; 6] = [
    "CORS_ORIGINS",
    "PHARMAGUARD_STAGING_DIR",
    "PHARMAGUARD_MAX_UPLOAD_BYTES",
    "PIPELINE_URL",
    "PIPELINE_COMMAND",
    "PIPELINE_PROBE_TIMEOUT_MS",
];

fn clear(env: &mut EnvGuard) {
    for var in VARS {
        env.remove(var);
    }
}

#[test]
fn parses_environment_defaults() {
    let _guard = ENV_MUTEX.lock().unwrap();
    let mut env = EnvGuard::new();
    clear(&mut env);

    let cfg = AppConfig::from_env().unwrap();
    assert_eq!(cfg.cors_origins, CorsOrigins::Any);
    assert_eq!(cfg.staging_dir, std::env::temp_dir());
    assert!(cfg.max_upload_bytes.is_none());
    assert_eq!(
        cfg.pipeline,
        PipelineTarget::Command {
            program: DEFAULT_PIPELINE_COMMAND.to_string()
        }
    );
    assert_eq!(cfg.probe_timeout, Duration::from_millis(2000));
}

#[test]
fn parses_full_configuration() {
    let _guard = ENV_MUTEX.lock().unwrap();
    let mut env = EnvGuard::new();
    clear(&mut env);
    env.set_many(&[
        ("CORS_ORIGINS", "http://localhost:5173, https://pharmaguard.example"),
        ("PHARMAGUARD_STAGING_DIR", "/srv/pharmaguard/uploads"),
        ("PHARMAGUARD_MAX_UPLOAD_BYTES", "1048576"),
        ("PIPELINE_URL", "http://pipeline:9000"),
        ("PIPELINE_COMMAND", "/opt/pipeline/bin/run"),
        ("PIPELINE_PROBE_TIMEOUT_MS", "750"),
    ]);

    let cfg = AppConfig::from_env().unwrap();
    match &cfg.cors_origins {
        CorsOrigins::List(list) => assert_eq!(list.len(), 2),
        other => panic!("expected origin list, got {other:?}"),
    }
    assert_eq!(cfg.staging_dir, std::path::PathBuf::from("/srv/pharmaguard/uploads"));
    assert_eq!(cfg.max_upload_bytes, Some(1_048_576));
    // PIPELINE_URL wins over PIPELINE_COMMAND.
    assert_eq!(
        cfg.pipeline,
        PipelineTarget::Http {
            base_url: "http://pipeline:9000".to_string()
        }
    );
    assert_eq!(cfg.probe_timeout, Duration::from_millis(750));
}

#[test]
fn explicit_command_is_used_without_url() {
    let _guard = ENV_MUTEX.lock().unwrap();
    let mut env = EnvGuard::new();
    clear(&mut env);
    env.set("PIPELINE_COMMAND", " /opt/pipeline/bin/run ");

    let cfg = AppConfig::from_env().unwrap();
    assert_eq!(
        cfg.pipeline,
        PipelineTarget::Command {
            program: "/opt/pipeline/bin/run".to_string()
        }
    );
}

#[test]
fn rejects_invalid_numeric_env_values() {
    let _guard = ENV_MUTEX.lock().unwrap();
    let mut env = EnvGuard::new();
    clear(&mut env);
    env.set("PHARMAGUARD_MAX_UPLOAD_BYTES", "lots");
    let err = AppConfig::from_env().expect_err("expected invalid integer to error");
    assert!(format!("{}", err).contains("PHARMAGUARD_MAX_UPLOAD_BYTES"));
}

#[test]
fn empty_cors_origins_allow_any() {
    let _guard = ENV_MUTEX.lock().unwrap();
    let mut env = EnvGuard::new();
    clear(&mut env);
    env.set("CORS_ORIGINS", "");
    assert_eq!(AppConfig::from_env().unwrap().cors_origins, CorsOrigins::Any);
}

#[test]
fn zero_limits_are_rejected() {
    let _guard = ENV_MUTEX.lock().unwrap();
    for var in ["PHARMAGUARD_MAX_UPLOAD_BYTES", "PIPELINE_PROBE_TIMEOUT_MS"] {
        let mut env = EnvGuard::new();
        clear(&mut env);
        env.set(var, "0");
        let err = AppConfig::from_env().expect_err("zero should be rejected");
        assert_eq!(err.to_string(), format!("{} must be a positive integer", var));
    }
}

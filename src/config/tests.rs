use super::{PartialSettings, Settings, load_config_from};
use crate::publisher::WindowFullPolicy;
use serial_test::serial;
use std::fs;
use tempfile::TempDir;

#[test]
fn test_default_settings() {
    let settings = Settings::default();
    assert_eq!(settings.client.broker_url, "ws://localhost:8084/mqtt");
    assert_eq!(settings.client.id, None);
    assert!(!settings.client.clean_start);
    assert_eq!(settings.session.backend, "sled");
    assert_eq!(settings.reconnect.min_backoff_ms, 500);
    assert_eq!(settings.reconnect.max_backoff_ms, 30_000);
    assert_eq!(settings.publisher.max_inflight, 16);
    assert_eq!(settings.publisher.window_full, WindowFullPolicy::Block);
    assert_eq!(settings.logging.level, "info");
}

#[test]
fn test_empty_partial_keeps_defaults() {
    let merged = PartialSettings::default().merge_onto(Settings::default());
    assert_eq!(merged, Settings::default());
}

fn write_config(dir: &TempDir, body: &str) -> String {
    let path = dir.path().join("sharedsub.toml");
    fs::write(&path, body).expect("write config file");
    dir.path()
        .join("sharedsub")
        .to_str()
        .expect("utf-8 path")
        .to_string()
}

#[test]
#[serial]
fn test_load_config_from_file_overrides_defaults() {
    let tmp = TempDir::new().expect("create tempdir");
    let stem = write_config(
        &tmp,
        r#"
            [client]
            id = "consumer-42"
            broker_url = "ws://broker.internal:8084/mqtt"

            [publisher]
            max_inflight = 4
            window_full = "queue"

            [reconnect]
            jitter = 0.0
        "#,
    );

    let cfg = load_config_from(&stem).expect("load_config failed");
    assert_eq!(cfg.client.id.as_deref(), Some("consumer-42"));
    assert_eq!(cfg.client.broker_url, "ws://broker.internal:8084/mqtt");
    assert_eq!(cfg.publisher.max_inflight, 4);
    assert_eq!(cfg.publisher.window_full, WindowFullPolicy::Queue);
    assert_eq!(cfg.reconnect.jitter, 0.0);
    // untouched sections fall back to defaults
    assert_eq!(cfg.session, Settings::default().session);
}

#[test]
#[serial]
fn test_environment_overrides_file() {
    let tmp = TempDir::new().expect("create tempdir");
    let stem = write_config(
        &tmp,
        r#"
            [session]
            backend = "sled"
            path = "from_file"
        "#,
    );

    temp_env::with_vars(
        [
            ("SHAREDSUB_SESSION__PATH", Some("from_env")),
            ("SHAREDSUB_CLIENT__CLEAN_START", Some("true")),
            ("SHAREDSUB_PUBLISHER__MAX_INFLIGHT", Some("2")),
        ],
        || {
            let cfg = load_config_from(&stem).expect("load_config failed");
            assert_eq!(cfg.session.path, "from_env");
            assert!(cfg.client.clean_start);
            assert_eq!(cfg.publisher.max_inflight, 2);
        },
    );
}

#[test]
#[serial]
fn test_invalid_values_are_rejected() {
    let tmp = TempDir::new().expect("create tempdir");

    let stem = write_config(&tmp, "[publisher]\nmax_inflight = 0\n");
    assert!(load_config_from(&stem).is_err());

    let stem = write_config(&tmp, "[session]\nbackend = \"postgres\"\n");
    assert!(load_config_from(&stem).is_err());

    let stem = write_config(
        &tmp,
        "[reconnect]\nmin_backoff_ms = 5000\nmax_backoff_ms = 100\n",
    );
    assert!(load_config_from(&stem).is_err());
}

#[test]
#[serial]
fn test_missing_file_yields_defaults() {
    let tmp = TempDir::new().expect("create tempdir");
    let stem = tmp.path().join("absent").to_str().unwrap().to_string();
    let cfg = load_config_from(&stem).expect("load_config failed");
    assert_eq!(cfg.client.broker_url, Settings::default().client.broker_url);
}

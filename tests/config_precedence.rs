#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Document → environment precedence (§9) exercised against a real YAML
//! file on disk, mirroring how a deployed sidecar actually loads config.

use gunicorn_sidecar_exporter::multiproc::config::CoreConfig;
use std::io::Write;

#[test]
fn environment_overrides_document_values() {
    let mut file = tempfile::NamedTempFile::new().expect("tempfile");
    writeln!(file, "metrics_port: 9432\nbind_address: 0.0.0.0\nworkers: 4\nmultiproc_dir: /tmp/gunicorn-sidecar").expect("write document");

    temp_env::with_var("GUNICORN_SIDECAR_METRICS_PORT", Some("7000"), || {
        let config = CoreConfig::load(Some(file.path())).expect("load config");
        assert_eq!(config.metrics_port, Some(7000));
        assert_eq!(config.bind_address.as_deref(), Some("0.0.0.0"));
        assert_eq!(config.workers, Some(4));
    });
}

#[test]
fn missing_document_falls_back_to_environment_only() {
    temp_env::with_var("GUNICORN_SIDECAR_WORKERS", Some("16"), || {
        let config = CoreConfig::load(None).expect("load config");
        assert_eq!(config.workers, Some(16));
        assert!(config.metrics_port.is_none());
    });
}

#[test]
fn validate_rejects_partial_configuration() {
    let config = CoreConfig {
        metrics_port: Some(9432),
        bind_address: Some("0.0.0.0".to_string()),
        ..Default::default()
    };
    assert!(config.validate().is_err());
}

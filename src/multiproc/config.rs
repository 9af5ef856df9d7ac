//! Configuration surface (C6 support, §4.6, §9): the merged view of a
//! structured document, environment variables, and host CLI flags.
//!
//! Precedence, lowest to highest: the document (if any) → environment
//! variables → values the host supplies after `post_fork` (§9). Lookups
//! are lazy and validated once via [`std::sync::OnceLock`], populating
//! configuration exactly once at startup.

use crate::error::CoreError;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

const ENV_PREFIX: &str = "GUNICORN_SIDECAR_";

/// Back-end selection and connection parameters plus the host-facing knobs.
/// All fields are optional at the document/env layer;
/// [`CoreConfig::validate`] enforces the production-required ones.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub multiproc_dir: Option<PathBuf>,
    pub metrics_port: Option<u16>,
    pub bind_address: Option<String>,
    pub workers: Option<u32>,
    pub redis_enabled: bool,
    pub redis_host: Option<String>,
    pub redis_port: Option<u16>,
    pub redis_db: Option<u32>,
    pub redis_password: Option<String>,
    pub redis_key_prefix: Option<String>,
    pub redis_ttl_seconds: Option<u64>,
    pub redis_ttl_disabled: bool,
    pub ssl_cert: Option<PathBuf>,
    pub ssl_key: Option<PathBuf>,
    pub ssl_client_ca: Option<PathBuf>,
    pub ssl_client_auth_required: bool,
    pub cleanup_db_files: bool,
}

impl CoreConfig {
    /// Loads a YAML document from `path`, if given, then overlays
    /// `GUNICORN_SIDECAR_*` environment variables on top of it (§9:
    /// document first, then environment).
    pub fn load(document_path: Option<&Path>) -> Result<Self, CoreError> {
        let mut config = match document_path {
            Some(path) => {
                let contents = std::fs::read_to_string(path).map_err(|e| CoreError::ConfigurationInvalid {
                    option: "config".to_string(),
                    message: format!("could not read {}: {e}", path.display()),
                    example: "--config /etc/gunicorn-sidecar/config.yaml".to_string(),
                })?;
                serde_yaml::from_str(&contents).map_err(|e| CoreError::ConfigurationInvalid {
                    option: "config".to_string(),
                    message: format!("invalid YAML: {e}"),
                    example: "multiproc_dir: /var/run/gunicorn-sidecar".to_string(),
                })?
            }
            None => Self::default(),
        };

        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        // Explicit per-field overlay avoids pulling in a generic
        // deserialize-from-env crate for a handful of fields (§10.3).
        if let Ok(v) = std::env::var(env_name("MULTIPROC_DIR")) {
            self.multiproc_dir = Some(PathBuf::from(v));
        }
        if let Ok(v) = std::env::var(env_name("METRICS_PORT")) {
            self.metrics_port = v.parse().ok();
        }
        if let Ok(v) = std::env::var(env_name("BIND_ADDRESS")) {
            self.bind_address = Some(v);
        }
        if let Ok(v) = std::env::var(env_name("WORKERS")) {
            self.workers = v.parse().ok();
        }
        if let Ok(v) = std::env::var(env_name("REDIS_ENABLED")) {
            self.redis_enabled = parse_bool(&v);
        }
        if let Ok(v) = std::env::var(env_name("REDIS_HOST")) {
            self.redis_host = Some(v);
        }
        if let Ok(v) = std::env::var(env_name("REDIS_PORT")) {
            self.redis_port = v.parse().ok();
        }
        if let Ok(v) = std::env::var(env_name("REDIS_DB")) {
            self.redis_db = v.parse().ok();
        }
        if let Ok(v) = std::env::var(env_name("REDIS_PASSWORD")) {
            self.redis_password = Some(v);
        }
        if let Ok(v) = std::env::var(env_name("REDIS_KEY_PREFIX")) {
            self.redis_key_prefix = Some(v);
        }
        if let Ok(v) = std::env::var(env_name("REDIS_TTL_SECONDS")) {
            self.redis_ttl_seconds = v.parse().ok();
        }
        if let Ok(v) = std::env::var(env_name("REDIS_TTL_DISABLED")) {
            self.redis_ttl_disabled = parse_bool(&v);
        }
        if let Ok(v) = std::env::var(env_name("CLEANUP_DB_FILES")) {
            self.cleanup_db_files = parse_bool(&v);
        }
        if let Ok(v) = std::env::var(env_name("SSL_CERT")) {
            self.ssl_cert = Some(PathBuf::from(v));
        }
        if let Ok(v) = std::env::var(env_name("SSL_KEY")) {
            self.ssl_key = Some(PathBuf::from(v));
        }
        if let Ok(v) = std::env::var(env_name("SSL_CLIENT_CA")) {
            self.ssl_client_ca = Some(PathBuf::from(v));
        }
        if let Ok(v) = std::env::var(env_name("SSL_CLIENT_AUTH_REQUIRED")) {
            self.ssl_client_auth_required = parse_bool(&v);
        }
    }

    /// Validates the fields required "in production":
    /// `metrics_port`, `bind_address`, `workers`, and `multiproc_dir` when
    /// the file back-end is selected. Called once, eagerly, from
    /// [`super::hooks::on_starting`].
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.metrics_port.is_none() {
            return Err(missing("metrics_port", "9432"));
        }
        if self.bind_address.is_none() {
            return Err(missing("bind_address", "0.0.0.0"));
        }
        if self.workers.is_none() {
            return Err(missing("workers", "4"));
        }
        if !self.redis_enabled && self.multiproc_dir.is_none() {
            return Err(missing("multiproc_dir", "/var/run/gunicorn-sidecar"));
        }
        Ok(())
    }

    pub fn redis_key_prefix_or_default(&self) -> String {
        self.redis_key_prefix.clone().unwrap_or_else(|| "gunicorn_sidecar".to_string())
    }

    pub fn redis_url(&self) -> Option<String> {
        if !self.redis_enabled {
            return None;
        }
        let host = self.redis_host.as_deref().unwrap_or("127.0.0.1");
        let port = self.redis_port.unwrap_or(6379);
        let db = self.redis_db.unwrap_or(0);
        match &self.redis_password {
            Some(password) => Some(format!("redis://:{password}@{host}:{port}/{db}")),
            None => Some(format!("redis://{host}:{port}/{db}")),
        }
    }
}

fn missing(option: &str, example_value: &str) -> CoreError {
    CoreError::ConfigurationInvalid {
        option: option.to_string(),
        message: "required in production but not set".to_string(),
        example: format!("--{} {example_value} (or {}{})", option.replace('_', "-"), ENV_PREFIX, option.to_uppercase()),
    }
}

fn env_name(suffix: &str) -> String {
    format!("{ENV_PREFIX}{suffix}")
}

fn parse_bool(v: &str) -> bool {
    matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

/// Process-wide configuration cell, populated once by
/// [`super::hooks::on_starting`] and read thereafter without re-validation
/// (§9: "the core must not re-read configuration after setup").
static GLOBAL: OnceLock<CoreConfig> = OnceLock::new();

/// Installs the global configuration. Returns `false` if configuration was
/// already installed (matches the storage manager's initialize-once
/// semantics, §4.5).
pub fn install(config: CoreConfig) -> bool {
    GLOBAL.set(config).is_ok()
}

pub fn global() -> Option<&'static CoreConfig> {
    GLOBAL.get()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_missing_port() {
        let config = CoreConfig::default();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, CoreError::ConfigurationInvalid { option, .. } if option == "metrics_port"));
    }

    #[test]
    fn validate_accepts_complete_file_backend_config() {
        let config = CoreConfig {
            metrics_port: Some(9432),
            bind_address: Some("0.0.0.0".to_string()),
            workers: Some(4),
            multiproc_dir: Some(PathBuf::from("/tmp/gunicorn-sidecar")),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn redis_enabled_does_not_require_multiproc_dir() {
        let config = CoreConfig {
            metrics_port: Some(9432),
            bind_address: Some("0.0.0.0".to_string()),
            workers: Some(4),
            redis_enabled: true,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn env_overrides_document_values() {
        temp_env::with_var(env_name("METRICS_PORT"), Some("9999"), || {
            let mut config = CoreConfig {
                metrics_port: Some(9432),
                ..Default::default()
            };
            config.apply_env_overrides();
            assert_eq!(config.metrics_port, Some(9999));
        });
    }

    #[test]
    fn redis_url_includes_password_when_set() {
        let config = CoreConfig {
            redis_enabled: true,
            redis_host: Some("cache.internal".to_string()),
            redis_port: Some(6380),
            redis_password: Some("hunter2".to_string()),
            ..Default::default()
        };
        assert_eq!(config.redis_url().as_deref(), Some("redis://:hunter2@cache.internal:6380/0"));
    }
}

//! Command-line entry point: parses flags and merges them over the
//! document/environment-derived [`CoreConfig`] (§9 precedence: document →
//! environment → CLI).
//!
//! Telemetry is deliberately *not* initialized here. [`telemetry::init`]
//! registers an OTLP batch exporter that, under the `rt-tokio` feature,
//! spawns its worker task onto whatever Tokio runtime is current — but
//! [`parse`] runs from `main` before the master has forked its workers or
//! built any runtime at all (see [`crate::server`]'s fork-safety docs).
//! Each process (master, and every worker after it) calls
//! [`telemetry::init`] itself, from inside its own `block_on`.

pub mod commands;
pub mod telemetry;

use crate::multiproc::config::CoreConfig;
use anyhow::Result;
use std::path::PathBuf;

/// Map verbosity count to tracing level.
pub const fn verbosity_level(verbose_count: u8) -> Option<tracing::Level> {
    match verbose_count {
        0 => None,
        1 => Some(tracing::Level::INFO),
        2 => Some(tracing::Level::DEBUG),
        _ => Some(tracing::Level::TRACE),
    }
}

/// Parses CLI flags and loads/merges [`CoreConfig`]. Returns the resolved
/// config alongside the verbosity level each process should later pass to
/// [`telemetry::init`].
///
/// # Errors
/// Returns an error if the configuration document is unreadable/invalid.
pub fn parse() -> Result<(CoreConfig, Option<tracing::Level>)> {
    let matches = commands::new().get_matches();

    let verbosity = verbosity_level(matches.get_count("verbose"));

    let document_path = matches.get_one::<String>("config").map(PathBuf::from);
    let mut config = CoreConfig::load(document_path.as_deref())?;

    apply_overrides(&mut config, &matches);
    Ok((config, verbosity))
}

/// Overlays explicitly-given CLI flags onto `config` (§9: CLI is the
/// highest-precedence layer). Flags left unset by the user leave the
/// document/environment value untouched.
fn apply_overrides(config: &mut CoreConfig, matches: &clap::ArgMatches) {
    if let Some(v) = matches.get_one::<u16>("metrics-port") {
        config.metrics_port = Some(*v);
    }
    if let Some(v) = matches.get_one::<String>("bind-address") {
        config.bind_address = Some(v.clone());
    }
    if let Some(v) = matches.get_one::<u32>("workers") {
        config.workers = Some(*v);
    }
    if let Some(v) = matches.get_one::<String>("multiproc-dir") {
        config.multiproc_dir = Some(PathBuf::from(v));
    }
    if matches.get_flag("redis-enabled") {
        config.redis_enabled = true;
    }
    if let Some(v) = matches.get_one::<String>("redis-host") {
        config.redis_host = Some(v.clone());
    }
    if let Some(v) = matches.get_one::<u16>("redis-port") {
        config.redis_port = Some(*v);
    }
    if let Some(v) = matches.get_one::<u32>("redis-db") {
        config.redis_db = Some(*v);
    }
    if let Some(v) = matches.get_one::<String>("redis-password") {
        config.redis_password = Some(v.clone());
    }
    if let Some(v) = matches.get_one::<String>("redis-key-prefix") {
        config.redis_key_prefix = Some(v.clone());
    }
    if let Some(v) = matches.get_one::<u64>("redis-ttl-seconds") {
        config.redis_ttl_seconds = Some(*v);
    }
    if matches.get_flag("redis-ttl-disabled") {
        config.redis_ttl_disabled = true;
    }
    if let Some(v) = matches.get_one::<String>("ssl-cert") {
        config.ssl_cert = Some(PathBuf::from(v));
    }
    if let Some(v) = matches.get_one::<String>("ssl-key") {
        config.ssl_key = Some(PathBuf::from(v));
    }
    if let Some(v) = matches.get_one::<String>("ssl-client-ca") {
        config.ssl_client_ca = Some(PathBuf::from(v));
    }
    if matches.get_flag("ssl-client-auth-required") {
        config.ssl_client_auth_required = true;
    }
    if matches.get_flag("cleanup-db-files") {
        config.cleanup_db_files = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_mapping() {
        assert_eq!(verbosity_level(0), None);
        assert_eq!(verbosity_level(1), Some(tracing::Level::INFO));
        assert_eq!(verbosity_level(2), Some(tracing::Level::DEBUG));
        assert_eq!(verbosity_level(5), Some(tracing::Level::TRACE));
    }

    #[test]
    fn overrides_apply_only_when_given() {
        let mut config = CoreConfig {
            metrics_port: Some(1111),
            ..Default::default()
        };
        let matches = commands::new().get_matches_from(vec!["gunicorn-sidecar-exporter"]);
        apply_overrides(&mut config, &matches);
        assert_eq!(config.metrics_port, Some(1111));
    }

    #[test]
    fn explicit_flag_overrides_document_value() {
        let mut config = CoreConfig {
            metrics_port: Some(1111),
            ..Default::default()
        };
        let matches = commands::new().get_matches_from(vec!["gunicorn-sidecar-exporter", "--metrics-port", "2222"]);
        apply_overrides(&mut config, &matches);
        assert_eq!(config.metrics_port, Some(2222));
    }
}

//! Scrape HTTP server (§4.6 "scrape-server contract", §6): binds
//! `GET /metrics` and `GET /health` on the address/port the master owns,
//! with an optional mutual-TLS listener per the `ssl_*` configuration
//! surface (§4.6).

pub mod handlers;

use crate::multiproc::collector::MultiProcessCollector;
use crate::multiproc::config::CoreConfig;
use anyhow::{Context, Result};
use axum::{Extension, Router, routing::get};
use axum_server::Handle;
use axum_server::tls_rustls::RustlsConfig;
use rustls::RootCertStore;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

fn router(collector: Arc<MultiProcessCollector>) -> Router {
    Router::new()
        .route("/metrics", get(handlers::metrics::metrics))
        .route("/health", get(handlers::health::health).options(handlers::health::health))
        .layer(Extension(collector))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<std::result::Result<Vec<_>, _>>()
        .with_context(|| format!("failed to parse certificates from {}", path.display()))
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .with_context(|| format!("failed to parse private key from {}", path.display()))?
        .with_context(|| format!("no private key found in {}", path.display()))
}

/// Builds the server's Rustls config, enforcing mutual TLS when
/// `ssl_client_ca` is configured (§4.6/§6). `ssl_client_auth_required`
/// toggles between rejecting unauthenticated clients outright and merely
/// offering client-cert verification.
fn build_tls_config(config: &CoreConfig, cert: &Path, key: &Path) -> Result<RustlsConfig> {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let certs = load_certs(cert)?;
    let key = load_key(key)?;

    let builder = rustls::ServerConfig::builder();
    let server_config = if let Some(ca_path) = &config.ssl_client_ca {
        let mut store = RootCertStore::empty();
        for ca_cert in load_certs(ca_path)? {
            store.add(ca_cert).context("invalid client CA certificate")?;
        }
        let verifier_builder = WebPkiClientVerifier::builder(Arc::new(store));
        let verifier = if config.ssl_client_auth_required {
            verifier_builder.build().context("failed to build client certificate verifier")?
        } else {
            verifier_builder
                .allow_unauthenticated()
                .build()
                .context("failed to build client certificate verifier")?
        };
        builder.with_client_cert_verifier(verifier).with_single_cert(certs, key)
    } else {
        builder.with_no_client_auth().with_single_cert(certs, key)
    }
    .context("invalid TLS certificate/key pair")?;

    Ok(RustlsConfig::from_config(Arc::new(server_config)))
}

/// Serves the scrape endpoint until `shutdown` fires. Binding itself
/// (retry on `AddrInUse`) is [`crate::multiproc::hooks::when_ready`]'s job;
/// this takes the already-bound listener and hands it to `axum_server` so
/// the TLS and plaintext paths share one graceful-shutdown mechanism.
///
/// # Errors
/// Returns an error if the TLS bundle is configured but unreadable, or if
/// the server exits with an I/O error.
pub async fn serve(config: &CoreConfig, listener: tokio::net::TcpListener, collector: Arc<MultiProcessCollector>, handle: Handle) -> Result<()> {
    let addr: SocketAddr = listener.local_addr().context("scrape listener has no local address")?;
    let std_listener = listener.into_std().context("failed to convert scrape listener to std")?;
    std_listener.set_nonblocking(true).context("failed to set scrape listener non-blocking")?;

    let app = router(collector);

    match (&config.ssl_cert, &config.ssl_key) {
        (Some(cert), Some(key)) => {
            info!(%addr, mutual_tls = config.ssl_client_ca.is_some(), "scrape endpoint serving TLS");
            let tls_config = build_tls_config(config, cert, key)?;
            axum_server::from_tcp_rustls(std_listener, tls_config)
                .handle(handle)
                .serve(app.into_make_service())
                .await
                .context("scrape server (tls) exited with an error")?;
        }
        _ => {
            info!(%addr, "scrape endpoint serving plaintext");
            axum_server::from_tcp(std_listener)
                .handle(handle)
                .serve(app.into_make_service())
                .await
                .context("scrape server exited with an error")?;
        }
    }

    Ok(())
}

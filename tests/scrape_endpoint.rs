#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

//! End-to-end exercise of the real scrape HTTP server (§6): a value cell
//! writes a sample against the file-backed storage dict, and a request
//! through the actual bound listener must expose it in Prometheus text
//! exposition.

use anyhow::Result;
use axum_server::Handle;
use dashmap::DashSet;
use gunicorn_sidecar_exporter::exporter;
use gunicorn_sidecar_exporter::multiproc::collector::MultiProcessCollector;
use gunicorn_sidecar_exporter::multiproc::config::CoreConfig;
use gunicorn_sidecar_exporter::multiproc::dict::{CellLockMap, StorageDict};
use gunicorn_sidecar_exporter::multiproc::file_dict::FileStorageDict;
use gunicorn_sidecar_exporter::multiproc::value::ValueCell;
use gunicorn_sidecar_exporter::multiproc::{AggregationMode, MetricFamily, MetricType, SampleIdentity};
use std::sync::Arc;

mod common;

#[tokio::test]
async fn scrape_exposes_written_sample() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let dict: Arc<dyn StorageDict> = Arc::new(FileStorageDict::open(tmp.path(), 4242)?);

    let lock_map = CellLockMap::new();
    let cell = ValueCell::new(
        dict.clone(),
        &lock_map,
        4242,
        SampleIdentity::new("requests_total", "requests_total", vec![("route".to_string(), "/".to_string())], "Total requests handled."),
        MetricType::Counter,
        AggregationMode::Sum,
    );
    cell.inc(3.0).await;

    let families = vec![MetricFamily {
        name: "requests_total".to_string(),
        metric_type: MetricType::Counter,
        aggregation_mode: AggregationMode::Sum,
        help_text: "Total requests handled.".to_string(),
        label_names: vec!["route".to_string()],
    }];
    let live_pids = Arc::new(DashSet::new());
    live_pids.insert(4242);
    let collector = Arc::new(MultiProcessCollector::new(dict, families, live_pids));

    let port = common::get_available_port();
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await?;
    let config = CoreConfig {
        metrics_port: Some(port),
        bind_address: Some("127.0.0.1".to_string()),
        workers: Some(1),
        ..Default::default()
    };
    let handle = Handle::new();
    let server_handle = handle.clone();
    let serve_task = tokio::spawn(async move { exporter::serve(&config, listener, collector, server_handle).await });

    assert!(common::wait_for_server(port, 50).await, "server failed to start");

    let response = reqwest::get(format!("{}/metrics", common::get_test_url(port))).await?;
    assert_eq!(response.status(), 200);
    let text = response.text().await?;
    assert!(text.contains("requests_total"), "exposition missing family: {text}");
    assert!(text.contains("route=\"/\""), "exposition missing label: {text}");

    handle.shutdown();
    serve_task.abort();
    Ok(())
}

#[tokio::test]
async fn health_endpoint_reports_package_metadata() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let dict: Arc<dyn StorageDict> = Arc::new(FileStorageDict::open(tmp.path(), 9001)?);
    let collector = Arc::new(MultiProcessCollector::new(dict, vec![], Arc::new(DashSet::new())));

    let port = common::get_available_port();
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await?;
    let config = CoreConfig {
        metrics_port: Some(port),
        bind_address: Some("127.0.0.1".to_string()),
        workers: Some(1),
        ..Default::default()
    };
    let handle = Handle::new();
    let server_handle = handle.clone();
    let serve_task = tokio::spawn(async move { exporter::serve(&config, listener, collector, server_handle).await });

    assert!(common::wait_for_server(port, 50).await, "server failed to start");

    let response = reqwest::get(format!("{}/health", common::get_test_url(port))).await?;
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await?;
    assert_eq!(body["name"], env!("CARGO_PKG_NAME"));
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));

    handle.shutdown();
    serve_task.abort();
    Ok(())
}

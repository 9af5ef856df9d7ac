//! Worker-process entry point: builds this process's own [`StorageManager`],
//! registers the demo application's [`SampleIdentity`]s behind [`ValueCell`]s
//! and [`HistogramCells`], and simulates a request-handling hot path so the
//! storage layer and collector have real multi-process data to aggregate.

use crate::multiproc::config::CoreConfig;
use crate::multiproc::manager::StorageManager;
use crate::multiproc::value::{HistogramCells, ValueCell};
use crate::multiproc::{AggregationMode, MetricType, Pid, SampleIdentity};
use std::time::Duration;
use tracing::info;

const LATENCY_BUCKETS: &[f64] = &[0.1, 0.5, 1.0, f64::INFINITY];

/// Runs one worker process until it receives `SIGTERM`/`SIGINT` (graceful
/// shutdown, `worker_int` per §4.6) or its demo workload completes.
///
/// # Errors
/// Returns an error if this process's storage back-end fails to initialize.
pub async fn run(config: &CoreConfig, pid: Pid, verbosity: Option<tracing::Level>) -> anyhow::Result<()> {
    crate::cli::telemetry::init(verbosity)?;

    let manager = StorageManager::setup(config, pid).await?;
    let dict = manager.get_client();

    let requests = ValueCell::new(
        dict.clone(),
        lock_map(),
        pid,
        SampleIdentity::new("requests_total", "requests_total", vec![("route".to_string(), "/".to_string())], "Total requests handled."),
        MetricType::Counter,
        AggregationMode::Sum,
    );
    let memory = ValueCell::new(
        dict.clone(),
        lock_map(),
        pid,
        SampleIdentity::new("worker_memory_bytes", "worker_memory_bytes", vec![], "Resident memory observed by the worker."),
        MetricType::Gauge,
        AggregationMode::All,
    );
    let latency = HistogramCells::new(
        dict,
        lock_map(),
        pid,
        "request_latency_seconds",
        &[],
        "Request latency distribution.",
        LATENCY_BUCKETS,
    );

    info!(pid, "worker ready");

    let mut shutdown = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut tick = tokio::time::interval(Duration::from_millis(250));

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                info!(pid, "worker received shutdown signal");
                break;
            }
            _ = tick.tick() => {
                requests.inc(1.0).await;
                memory.set(simulated_memory_bytes(pid)).await;
                latency.observe(simulated_latency_seconds(pid)).await;
            }
        }
    }

    manager.teardown().await;
    Ok(())
}

/// Process-local lock map, one per worker: each worker only ever mutates
/// its own pid's cells, so there is no need to share this across workers.
fn lock_map() -> &'static crate::multiproc::dict::CellLockMap {
    use std::sync::OnceLock;
    static LOCKS: OnceLock<crate::multiproc::dict::CellLockMap> = OnceLock::new();
    LOCKS.get_or_init(crate::multiproc::dict::CellLockMap::new)
}

/// Deterministic stand-in for a real resident-memory reading, varied by
/// pid so `worker_memory_bytes{pid=...}` series are distinguishable in a
/// demo scrape.
#[allow(clippy::cast_precision_loss)]
fn simulated_memory_bytes(pid: Pid) -> f64 {
    (50 * 1024 * 1024 + (pid % 16) * 1024 * 1024) as f64
}

fn simulated_latency_seconds(pid: Pid) -> f64 {
    0.05 + f64::from(pid % 10) / 20.0
}

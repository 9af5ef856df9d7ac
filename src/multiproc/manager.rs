//! Storage manager (C5, §4.5): selects and owns one [`StorageDict`]
//! implementation for the process, exposes the collector bound to it, and
//! is a process-wide singleton with initialize-once semantics.

use super::collector::MultiProcessCollector;
use super::config::CoreConfig;
use super::dict::StorageDict;
use super::file_dict::FileStorageDict;
use super::redis_dict::RedisStorageDict;
use super::{MetricFamily, Pid};
use dashmap::DashSet;
use std::sync::{Arc, OnceLock};
use tracing::{info, warn};

enum Backend {
    File,
    Redis,
}

/// Owns the active [`StorageDict`] and the live-pid set the collector
/// consults for `liveall` (§4.4 step 4).
pub struct StorageManager {
    dict: Arc<dyn StorageDict>,
    backend: Backend,
    live_pids: Arc<DashSet<Pid>>,
}

impl StorageManager {
    /// Attempts to initialize the configured back-end. For the network
    /// back-end, performs a liveness probe (`PING`); on failure, falls back
    /// to the file back-end and logs the degradation (§4.5 failure policy).
    pub async fn setup(config: &CoreConfig, pid: Pid) -> Result<Self, crate::error::CoreError> {
        let live_pids = Arc::new(DashSet::new());
        live_pids.insert(pid);

        if let Some(url) = config.redis_url() {
            let prefix = config.redis_key_prefix_or_default();
            match RedisStorageDict::connect(&url, prefix).await {
                Ok(redis_dict) if redis_dict.is_alive().await => {
                    info!("network storage back-end selected and reachable");
                    return Ok(Self {
                        dict: Arc::new(redis_dict),
                        backend: Backend::Redis,
                        live_pids,
                    });
                }
                Ok(_) => warn!("network storage back-end unreachable, falling back to file back-end"),
                Err(err) => warn!(error = %err, "network storage back-end setup failed, falling back to file back-end"),
            }
        }

        let dir = config
            .multiproc_dir
            .clone()
            .ok_or_else(|| crate::error::CoreError::ConfigurationInvalid {
                option: "multiproc_dir".to_string(),
                message: "required when the file back-end is active".to_string(),
                example: "--multiproc-dir /var/run/gunicorn-sidecar".to_string(),
            })?;

        let file_dict = FileStorageDict::open(dir, pid)?;
        Ok(Self {
            dict: Arc::new(file_dict),
            backend: Backend::File,
            live_pids,
        })
    }

    pub fn get_client(&self) -> Arc<dyn StorageDict> {
        self.dict.clone()
    }

    pub fn get_collector(&self, families: Vec<MetricFamily>) -> MultiProcessCollector {
        MultiProcessCollector::new(self.dict.clone(), families, self.live_pids.clone())
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self.backend, Backend::Redis)
    }

    pub fn live_pids(&self) -> &Arc<DashSet<Pid>> {
        &self.live_pids
    }

    /// Closes the back-end connection / unmaps files.
    pub async fn teardown(&self) {
        self.dict.close().await;
    }
}

/// Process-wide singleton slot. [`initialize`] is a no-op if already
/// populated, matching §4.5's "re-initialization is a no-op".
static SINGLETON: OnceLock<Arc<StorageManager>> = OnceLock::new();

/// Installs `manager` as the process-wide singleton if none exists yet,
/// returning the winning instance either way.
pub fn initialize(manager: StorageManager) -> Arc<StorageManager> {
    let manager = Arc::new(manager);
    match SINGLETON.set(manager.clone()) {
        Ok(()) => manager,
        Err(_) => SINGLETON.get().cloned().unwrap_or(manager),
    }
}

pub fn instance() -> Option<Arc<StorageManager>> {
    SINGLETON.get().cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn setup_falls_back_to_file_backend_without_redis() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let config = CoreConfig {
            multiproc_dir: Some(tmp.path().to_path_buf()),
            ..Default::default()
        };

        let manager = StorageManager::setup(&config, 1001).await.expect("setup");
        assert!(!manager.is_enabled());
    }

    #[tokio::test]
    async fn setup_falls_back_to_file_backend_when_redis_unreachable() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let config = CoreConfig {
            multiproc_dir: Some(tmp.path().to_path_buf()),
            redis_enabled: true,
            redis_host: Some("127.0.0.1".to_string()),
            redis_port: Some(1), // nothing listens here
            ..Default::default()
        };

        let manager = StorageManager::setup(&config, 1001).await.expect("setup falls back");
        assert!(!manager.is_enabled());
    }
}

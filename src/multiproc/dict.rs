//! Storage dict (C2): the `StorageDict` trait shared by the file- and
//! network-backed implementations, plus the per-cell lock map both use to
//! serialize same-process writes to one cell (§9).

use super::{AggregationMode, MetadataRecord, MetricType, Pid, SampleIdentity};
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;

/// One cell surfaced by [`StorageDict::read_all`], reconstructed enough for
/// the collector to group and aggregate it (§4.4 step 1).
#[derive(Debug, Clone)]
pub struct ReadAllItem {
    pub pid: Pid,
    pub metric_type: MetricType,
    pub aggregation_mode: AggregationMode,
    pub encoded_sid: Vec<u8>,
    pub value: f64,
    pub sample_timestamp: f64,
    pub written_at: f64,
    /// `None` when a cell's metadata record is missing or unreadable; the
    /// collector skips such cells and counts a corruption event (§4.4 edge
    /// cases). Gauges can still be typed purely from the storage key
    /// (invariant 4) even without metadata.
    pub metadata: Option<MetadataRecord>,
}

/// Associative map from sample keys to `(value, timestamp)` pairs, scoped
/// by `(pid, metric_type, aggregation_mode)`. Implemented by
/// [`super::file_dict::FileStorageDict`] and
/// [`super::redis_dict::RedisStorageDict`].
pub trait StorageDict: Send + Sync {
    /// Current `(value, sample_timestamp)` for `(pid, encoded_sid)`, or
    /// `None` if no cell exists (read paths never error on a missing cell,
    /// §4.2). The file back-end resolves this immediately; the network
    /// back-end suspends on one request to the store (§5).
    fn read_value<'a>(
        &'a self,
        pid: Pid,
        encoded_sid: &'a [u8],
        metric_type: MetricType,
        aggregation_mode: AggregationMode,
    ) -> BoxFuture<'a, (Option<f64>, Option<f64>)>;

    /// Writes `value`/`sample_timestamp` for `(pid, encoded_sid)`, stamping
    /// `written_at` with the current time. `sid` carries the metric name,
    /// labels and help text a network back-end needs to refresh the cell's
    /// metadata record alongside the value (§4.2.2); the file back-end
    /// ignores it since its on-disk key is self-describing. Never raises
    /// (§4.3, §7): failures are logged and counted by the implementation.
    fn write_value<'a>(
        &'a self,
        pid: Pid,
        encoded_sid: &'a [u8],
        sid: &'a SampleIdentity,
        value: f64,
        sample_timestamp: f64,
        metric_type: MetricType,
        aggregation_mode: AggregationMode,
    ) -> BoxFuture<'a, ()>;

    /// Lazily enumerates every sample cell across every pid (live and
    /// dead). Must not materialize the whole store at once (§9).
    fn read_all(&self) -> BoxStream<'_, ReadAllItem>;

    /// Deletes every sample cell (and, for the network back-end, metadata
    /// record) owned by `pid` (invariant 5).
    fn purge_process(&self, pid: Pid) -> BoxFuture<'_, ()>;

    /// Releases the backend connection / unmaps files.
    fn close(&self) -> BoxFuture<'_, ()>;

    /// Shared degradation counters for this backend instance.
    fn error_counters(&self) -> &ErrorCounters;
}

/// A map `encoded_sid -> lock` so concurrent call sites in one process
/// cannot race on the same cell, without needing a single global lock for
/// the whole store (§9). Entry creation is guarded by the map's own
/// sharded locking; the entry's own mutex then serializes cell access.
#[derive(Default)]
pub struct CellLockMap {
    locks: DashMap<Vec<u8>, Arc<Mutex<()>>>,
}

impl CellLockMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the lock for `key`, creating it if this is the first time
    /// the key has been seen.
    pub fn lock_for(&self, key: &[u8]) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.to_vec())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// Internal degradation counters (§7): every "logged and counted" error
/// path bumps one of these, and [`super::collector`] exposes them as a
/// small fixed metric family so the degraded paths are independently
/// observable from `/metrics`.
#[derive(Default)]
pub struct ErrorCounters {
    corrupt_records: AtomicU64,
    backend_errors: AtomicU64,
    capacity_exceeded: AtomicU64,
    scrape_truncated: AtomicU64,
}

impl ErrorCounters {
    pub fn record_corrupt_record(&self) {
        self.corrupt_records.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_backend_error(&self) {
        self.backend_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_capacity_exceeded(&self) {
        self.capacity_exceeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_scrape_truncated(&self) {
        self.scrape_truncated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn corrupt_records(&self) -> u64 {
        self.corrupt_records.load(Ordering::Relaxed)
    }

    pub fn backend_errors(&self) -> u64 {
        self.backend_errors.load(Ordering::Relaxed)
    }

    pub fn capacity_exceeded(&self) -> u64 {
        self.capacity_exceeded.load(Ordering::Relaxed)
    }

    pub fn scrape_truncated(&self) -> u64 {
        self.scrape_truncated.load(Ordering::Relaxed)
    }
}

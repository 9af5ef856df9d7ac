//! Value cell (C3): the per-worker, per-`(metric family, sample identity)`
//! object request-handling hot paths call into. All mutation is delegated
//! to the storage dict under the cell's own lock (§4.3).

use super::dict::{CellLockMap, StorageDict};
use super::key::encode_sid;
use super::{local_wall_time, AggregationMode, MetricType, Pid, SampleIdentity};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::trace;

/// One labeled sample observed by this process. Cheap to clone: the
/// encoded sample identity is computed once and shared via `Arc`.
#[derive(Clone)]
pub struct ValueCell {
    dict: Arc<dyn StorageDict>,
    pid: Pid,
    encoded_sid: Arc<[u8]>,
    sid: Arc<SampleIdentity>,
    metric_type: MetricType,
    aggregation_mode: AggregationMode,
    lock: Arc<Mutex<()>>,
}

impl ValueCell {
    /// Encodes `sid` and resolves its per-cell lock from `lock_map` (keyed
    /// by the encoded SID, not `(pid, encoded_sid)`, so the same logical
    /// cell shares a lock across the pids that write it).
    pub fn new(
        dict: Arc<dyn StorageDict>,
        lock_map: &CellLockMap,
        pid: Pid,
        sid: SampleIdentity,
        metric_type: MetricType,
        aggregation_mode: AggregationMode,
    ) -> Self {
        let encoded = encode_sid(&sid);
        let lock = lock_map.lock_for(&encoded);

        Self {
            dict,
            pid,
            encoded_sid: Arc::from(encoded.into_boxed_slice()),
            sid: Arc::new(sid),
            metric_type,
            aggregation_mode,
            lock,
        }
    }

    /// Counter increment: `new = old + delta`, written with the current
    /// wall-clock time. Negative deltas are clamped to zero (counters are
    /// monotonic by contract).
    pub async fn inc(&self, delta: f64) {
        let delta = delta.max(0.0);
        let _guard = self.lock.lock().await;

        let (old, _) = self
            .dict
            .read_value(self.pid, &self.encoded_sid, self.metric_type, self.aggregation_mode)
            .await;
        let new_value = old.unwrap_or(0.0) + delta;
        let now = local_wall_time();

        trace!(new_value, "counter inc");
        self.dict
            .write_value(
                self.pid,
                &self.encoded_sid,
                &self.sid,
                new_value,
                now,
                self.metric_type,
                self.aggregation_mode,
            )
            .await;
    }

    /// Gauge overwrite. `sample_timestamp` is only meaningful for
    /// `mostrecent`: every other mode stores `0.0` (§4.3).
    pub async fn set(&self, value: f64) {
        let _guard = self.lock.lock().await;

        let sample_timestamp = if self.aggregation_mode == AggregationMode::MostRecent {
            local_wall_time()
        } else {
            0.0
        };

        self.dict
            .write_value(
                self.pid,
                &self.encoded_sid,
                &self.sid,
                value,
                sample_timestamp,
                self.metric_type,
                self.aggregation_mode,
            )
            .await;
    }

    /// Gauge overwrite with an explicit, caller-supplied sample timestamp
    /// (used when the timestamp carries semantic meaning from the caller,
    /// e.g. "when this config was last reloaded", rather than "now").
    pub async fn set_at(&self, value: f64, sample_timestamp: f64) {
        let _guard = self.lock.lock().await;
        self.dict
            .write_value(
                self.pid,
                &self.encoded_sid,
                &self.sid,
                value,
                sample_timestamp,
                self.metric_type,
                self.aggregation_mode,
            )
            .await;
    }

    /// Current value, preferring the storage's view over any cached state
    /// (the storage dict is the source of truth, §4.3).
    pub async fn get(&self) -> f64 {
        let (value, _) = self
            .dict
            .read_value(self.pid, &self.encoded_sid, self.metric_type, self.aggregation_mode)
            .await;
        value.unwrap_or(0.0)
    }
}

/// Builds the set of counter-style cells a histogram observation touches:
/// one per bucket boundary, plus `_sum` and `_count`. Each decomposed cell
/// is addressed by its own [`SampleIdentity`] carrying the `le` label for
/// buckets (§4.3).
pub struct HistogramCells {
    buckets: Vec<(f64, ValueCell)>,
    sum: ValueCell,
    count: ValueCell,
}

impl HistogramCells {
    pub fn new(
        dict: Arc<dyn StorageDict>,
        lock_map: &CellLockMap,
        pid: Pid,
        metric_name: &str,
        labels: &[(String, String)],
        help_text: &str,
        bucket_bounds: &[f64],
    ) -> Self {
        let buckets = bucket_bounds
            .iter()
            .map(|&bound| {
                let mut bucket_labels = labels.to_vec();
                let le = if bound.is_infinite() { "+Inf".to_string() } else { bound.to_string() };
                bucket_labels.push(("le".to_string(), le));

                let sid = SampleIdentity::new(metric_name, format!("{metric_name}_bucket"), bucket_labels, help_text);
                let cell = ValueCell::new(
                    dict.clone(),
                    lock_map,
                    pid,
                    sid,
                    MetricType::Histogram,
                    AggregationMode::Sum,
                );
                (bound, cell)
            })
            .collect();

        let sum_sid = SampleIdentity::new(metric_name, format!("{metric_name}_sum"), labels.to_vec(), help_text);
        let count_sid = SampleIdentity::new(metric_name, format!("{metric_name}_count"), labels.to_vec(), help_text);

        Self {
            buckets,
            sum: ValueCell::new(dict.clone(), lock_map, pid, sum_sid, MetricType::Histogram, AggregationMode::Sum),
            count: ValueCell::new(dict, lock_map, pid, count_sid, MetricType::Histogram, AggregationMode::Sum),
        }
    }

    /// Records one observation: increments every bucket whose bound is
    /// `>= value`, plus `_sum` and `_count`. The three writes land on
    /// independent cells with no cross-cell ordering guarantee; the
    /// collector's monotonicity clamp (§4.4.5) absorbs any interleaving
    /// with a concurrent observation in this process.
    pub async fn observe(&self, value: f64) {
        for (bound, cell) in &self.buckets {
            if value <= *bound {
                cell.inc(1.0).await;
            }
        }
        self.sum.inc(value).await;
        self.count.inc(1.0).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::multiproc::file_dict::FileStorageDict;

    fn rt() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread().enable_all().build().expect("rt")
    }

    #[test]
    fn counter_inc_accumulates() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dict: Arc<dyn StorageDict> = Arc::new(FileStorageDict::open(tmp.path(), 1001).expect("open"));
        let lock_map = CellLockMap::new();
        let sid = SampleIdentity::new("requests_total", "requests_total", vec![], "help");
        let cell = ValueCell::new(dict, &lock_map, 1001, sid, MetricType::Counter, AggregationMode::Sum);

        rt().block_on(async {
            cell.inc(3.0).await;
            cell.inc(5.0).await;
            assert_eq!(cell.get().await, 8.0);
        });
    }

    #[test]
    fn negative_delta_is_clamped() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dict: Arc<dyn StorageDict> = Arc::new(FileStorageDict::open(tmp.path(), 1001).expect("open"));
        let lock_map = CellLockMap::new();
        let sid = SampleIdentity::new("requests_total", "requests_total", vec![], "help");
        let cell = ValueCell::new(dict, &lock_map, 1001, sid, MetricType::Counter, AggregationMode::Sum);

        rt().block_on(async {
            cell.inc(3.0).await;
            cell.inc(-100.0).await;
            assert_eq!(cell.get().await, 3.0);
        });
    }

    #[test]
    fn gauge_set_overwrites() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dict: Arc<dyn StorageDict> = Arc::new(FileStorageDict::open(tmp.path(), 1001).expect("open"));
        let lock_map = CellLockMap::new();
        let sid = SampleIdentity::new("worker_memory_bytes", "worker_memory_bytes", vec![], "help");
        let cell = ValueCell::new(dict, &lock_map, 1001, sid, MetricType::Gauge, AggregationMode::All);

        rt().block_on(async {
            cell.set(100.0).await;
            assert_eq!(cell.get().await, 100.0);
            cell.set(200.0).await;
            assert_eq!(cell.get().await, 200.0);
        });
    }

    #[test]
    fn histogram_observe_buckets_monotonically() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dict: Arc<dyn StorageDict> = Arc::new(FileStorageDict::open(tmp.path(), 1001).expect("open"));
        let lock_map = CellLockMap::new();
        let cells = HistogramCells::new(
            dict,
            &lock_map,
            1001,
            "request_latency",
            &[],
            "help",
            &[0.1, 0.5, 1.0, f64::INFINITY],
        );

        rt().block_on(async {
            cells.observe(0.2).await;
            cells.observe(0.6).await;
            cells.observe(1.2).await;

            let bucket_values: Vec<f64> = futures::future::join_all(cells.buckets.iter().map(|(_, c)| c.get())).await;
            assert_eq!(bucket_values, vec![0.0, 1.0, 2.0, 3.0]);
            assert_eq!(cells.sum.get().await, 2.0);
            assert_eq!(cells.count.get().await, 3.0);
        });
    }
}

//! Network-backed storage dict (§4.2.2, §5): one hash record per sample
//! cell, keyed by [`super::key::storage_key`] so every process addresses
//! the same cell through the same opaque key regardless of which process
//! wrote it first. A parallel `meta:`-kind key carries the
//! [`MetadataRecord`] the collector needs to reconstruct a family without
//! reading any value cell.
//!
//! Unlike the file back-end, a dead process's keys do not disappear on
//! their own: every write refreshes a TTL, and [`RedisStorageDict::purge_process`]
//! still exists for the liveness sweep, but staleness of a process's keys
//! is also bounded by that TTL expiring server-side if purge is skipped.

use super::dict::{ErrorCounters, ReadAllItem, StorageDict};
use super::key::{encode_sid, storage_key, KeyKind};
use super::{local_wall_time, AggregationMode, MetadataRecord, MetricType, Pid, SampleIdentity};
use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, StreamExt};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;
use tracing::warn;

const DEFAULT_TTL_SECS: u64 = 24 * 60 * 60;
const SCAN_BATCH: usize = 500;

/// Storage dict implementation backed by a Redis (or Redis-protocol
/// compatible) server. `prefix` namespaces every key this instance writes,
/// letting several exporters share a server (§4.1).
pub struct RedisStorageDict {
    conn: ConnectionManager,
    prefix: String,
    ttl: Duration,
    errors: ErrorCounters,
}

impl RedisStorageDict {
    pub async fn connect(url: &str, prefix: impl Into<String>) -> Result<Self, crate::error::CoreError> {
        let client = redis::Client::open(url)
            .map_err(|e| crate::error::CoreError::BackendUnavailable(format!("invalid redis url: {e}")))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| crate::error::CoreError::BackendUnavailable(format!("redis connect: {e}")))?;

        Ok(Self {
            conn,
            prefix: prefix.into(),
            ttl: Duration::from_secs(DEFAULT_TTL_SECS),
            errors: ErrorCounters::default(),
        })
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Pings the server; used by the storage manager to decide whether to
    /// fall back to the file back-end (§5 edge cases).
    pub async fn is_alive(&self) -> bool {
        let mut conn = self.conn.clone();
        redis::cmd("PING").query_async::<String>(&mut conn).await.is_ok()
    }

    fn metric_key(&self, pid: Pid, metric_type: MetricType, aggregation_mode: AggregationMode, encoded_sid: &[u8]) -> Vec<u8> {
        storage_key(&self.prefix, pid, metric_type, aggregation_mode, KeyKind::Metric, encoded_sid)
    }

    fn meta_key(&self, pid: Pid, metric_type: MetricType, aggregation_mode: AggregationMode, encoded_sid: &[u8]) -> Vec<u8> {
        storage_key(&self.prefix, pid, metric_type, aggregation_mode, KeyKind::Meta, encoded_sid)
    }

    /// Current server time, falling back to local wall-clock if the `TIME`
    /// command is unavailable (proxies, some Redis-protocol servers, §4.2.2).
    async fn server_time(&self) -> f64 {
        let mut conn = self.conn.clone();
        match redis::cmd("TIME").query_async::<(i64, i64)>(&mut conn).await {
            Ok((secs, micros)) => secs as f64 + (micros as f64 / 1_000_000.0),
            Err(_) => local_wall_time(),
        }
    }
}

impl StorageDict for RedisStorageDict {
    fn read_value<'a>(
        &'a self,
        pid: Pid,
        encoded_sid: &'a [u8],
        metric_type: MetricType,
        aggregation_mode: AggregationMode,
    ) -> BoxFuture<'a, (Option<f64>, Option<f64>)> {
        Box::pin(async move {
            let key = self.metric_key(pid, metric_type, aggregation_mode, encoded_sid);
            let mut conn = self.conn.clone();
            let result: Result<(Option<String>, Option<String>), redis::RedisError> =
                conn.hget(&key, &["value", "timestamp"]).await;

            match result {
                Ok((value, ts)) => (
                    value.and_then(|v| v.parse().ok()),
                    ts.and_then(|t| t.parse().ok()),
                ),
                Err(err) => {
                    warn!(error = %err, "redis read failed");
                    self.errors.record_backend_error();
                    (None, None)
                }
            }
        })
    }

    fn write_value<'a>(
        &'a self,
        pid: Pid,
        encoded_sid: &'a [u8],
        sid: &'a SampleIdentity,
        value: f64,
        sample_timestamp: f64,
        metric_type: MetricType,
        aggregation_mode: AggregationMode,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let key = self.metric_key(pid, metric_type, aggregation_mode, encoded_sid);
            let meta_key = self.meta_key(pid, metric_type, aggregation_mode, encoded_sid);
            let written_at = self.server_time().await;
            let ttl_secs = self.ttl.as_secs();

            let mut conn = self.conn.clone();
            let pipeline_result: Result<(), redis::RedisError> = redis::pipe()
                .atomic()
                .hset(&key, "value", value)
                .hset(&key, "timestamp", sample_timestamp)
                .hset(&key, "written_at", written_at)
                .expire(&key, ttl_secs as i64)
                .hset(&meta_key, "aggregation_mode", aggregation_mode.as_str())
                .hset(&meta_key, "metric_name", sid.metric_name.as_str())
                .hset(
                    &meta_key,
                    "label_names",
                    sid.label_set_without_pid()
                        .into_iter()
                        .map(|(name, _)| name)
                        .collect::<Vec<_>>()
                        .join(","),
                )
                .hset(&meta_key, "help_text", sid.help_text.as_str())
                .hset(&meta_key, "original_sid", encoded_sid)
                .expire(&meta_key, ttl_secs as i64)
                .query_async(&mut conn)
                .await;

            if let Err(err) = pipeline_result {
                warn!(error = %err, "redis write failed");
                self.errors.record_backend_error();
            }
        })
    }

    fn read_all(&self) -> BoxStream<'_, ReadAllItem> {
        let prefix = self.prefix.clone();
        Box::pin(
            stream::unfold(
                (self.conn.clone(), 0u64, false),
                move |(mut conn, cursor, done)| {
                    let pattern = format!("{prefix}:*:*:metric:*");
                    async move {
                        if done {
                            return None;
                        }
                        let result: Result<(u64, Vec<String>), redis::RedisError> = redis::cmd("SCAN")
                            .arg(cursor)
                            .arg("MATCH")
                            .arg(&pattern)
                            .arg("COUNT")
                            .arg(SCAN_BATCH)
                            .query_async(&mut conn)
                            .await;

                        match result {
                            Ok((next_cursor, keys)) => {
                                let next_done = next_cursor == 0;
                                Some((keys, (conn, next_cursor, next_done)))
                            }
                            Err(err) => {
                                warn!(error = %err, "redis scan failed");
                                None
                            }
                        }
                    }
                },
            )
            .flat_map(stream::iter)
            .then(move |key| {
                let conn = self.conn.clone();
                let errors = &self.errors;
                async move { fetch_item(conn, key, errors).await }
            })
            .filter_map(futures::future::ready),
        )
    }

    fn purge_process(&self, pid: Pid) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let pattern = format!("{}:*:{pid}:*", self.prefix);
            let mut conn = self.conn.clone();
            let mut cursor = 0u64;

            loop {
                let result: Result<(u64, Vec<String>), redis::RedisError> = redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(&pattern)
                    .arg("COUNT")
                    .arg(SCAN_BATCH)
                    .query_async(&mut conn)
                    .await;

                let Ok((next_cursor, keys)) = result else {
                    self.errors.record_backend_error();
                    break;
                };

                if !keys.is_empty()
                    && let Err(err) = conn.unlink::<_, ()>(&keys).await
                {
                    warn!(error = %err, "redis purge unlink failed");
                    self.errors.record_backend_error();
                }

                cursor = next_cursor;
                if cursor == 0 {
                    break;
                }
            }
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {})
    }

    fn error_counters(&self) -> &ErrorCounters {
        &self.errors
    }
}

/// Loads one `metric:` key's value fields plus its sibling `meta:` record,
/// recovering `pid`/`metric_type`/`aggregation_mode` from the key's own
/// `type_suffix` component rather than trusting the metadata record for
/// those (a corrupt metadata record should not hide a gauge's encoded
/// aggregation mode, invariant 4).
async fn fetch_item(mut conn: ConnectionManager, metric_key: String, errors: &ErrorCounters) -> Option<ReadAllItem> {
    let parts: Vec<&str> = metric_key.split(':').collect();
    let [_prefix, type_suffix, pid_str, _kind, _hash] = parts.as_slice() else {
        errors.record_corrupt_record();
        return None;
    };

    let pid: Pid = pid_str.parse().ok()?;
    let (metric_type, aggregation_mode) = super::key::parse_type_suffix(type_suffix).or_else(|| {
        type_suffix.parse::<MetricType>().ok().map(|t| (t, AggregationMode::Sum))
    })?;

    let fields: Result<(Option<f64>, Option<f64>, Option<f64>), redis::RedisError> = conn
        .hget(&metric_key, &["value", "timestamp", "written_at"])
        .await;
    let (value, sample_timestamp, written_at) = match fields {
        Ok((Some(v), Some(t), w)) => (v, t, w.unwrap_or(t)),
        Ok(_) => {
            errors.record_corrupt_record();
            return None;
        }
        Err(err) => {
            warn!(error = %err, "redis hget failed during scan");
            errors.record_backend_error();
            return None;
        }
    };

    let meta_key = metric_key.replacen(":metric:", ":meta:", 1);
    let meta_fields: Result<(Option<String>, Option<String>, Option<String>, Option<Vec<u8>>), redis::RedisError> = conn
        .hget(&meta_key, &["metric_name", "label_names", "help_text", "original_sid"])
        .await;

    let metadata = match meta_fields {
        Ok((Some(metric_name), Some(label_names), Some(help_text), Some(original_sid))) => Some(MetadataRecord {
            aggregation_mode,
            metric_name,
            label_names: label_names.split(',').filter(|s| !s.is_empty()).map(String::from).collect(),
            help_text,
            original_sid,
        }),
        _ => None,
    };

    let encoded_sid = metadata
        .as_ref()
        .map(|m| m.original_sid.clone())
        .unwrap_or_else(|| encode_sid(&SampleIdentity::new("", "", vec![], "")));

    Some(ReadAllItem {
        pid,
        metric_type,
        aggregation_mode,
        encoded_sid,
        value,
        sample_timestamp,
        written_at,
        metadata,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use testcontainers::runners::AsyncRunner;
    use testcontainers_modules::redis::Redis;

    async fn test_dict() -> (RedisStorageDict, testcontainers::ContainerAsync<Redis>) {
        let container = Redis::default().start().await.expect("start redis");
        let port = container.get_host_port_ipv4(6379).await.expect("port");
        let dict = RedisStorageDict::connect(&format!("redis://127.0.0.1:{port}"), "gunicorn_sidecar")
            .await
            .expect("connect");
        (dict, container)
    }

    #[tokio::test]
    async fn round_trip_write_then_read() {
        let (dict, _container) = test_dict().await;
        let sid = SampleIdentity::new("requests_total", "requests_total", vec![], "total requests");
        let encoded = encode_sid(&sid);

        dict.write_value(1001, &encoded, &sid, 3.0, 100.0, MetricType::Counter, AggregationMode::Sum)
            .await;
        let (value, ts) = dict
            .read_value(1001, &encoded, MetricType::Counter, AggregationMode::Sum)
            .await;
        assert_eq!(value, Some(3.0));
        assert_eq!(ts, Some(100.0));
    }

    #[tokio::test]
    async fn read_all_recovers_metadata() {
        let (dict, _container) = test_dict().await;
        let sid = SampleIdentity::new(
            "requests_total",
            "requests_total",
            vec![("route".to_string(), "/a".to_string())],
            "total requests",
        );
        let encoded = encode_sid(&sid);

        dict.write_value(1001, &encoded, &sid, 7.0, 1.0, MetricType::Counter, AggregationMode::Sum)
            .await;

        let items: Vec<_> = dict.read_all().collect().await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].value, 7.0);
        assert_eq!(items[0].metadata.as_ref().unwrap().metric_name, "requests_total");
    }

    #[tokio::test]
    async fn purge_removes_process_keys() {
        let (dict, _container) = test_dict().await;
        let sid = SampleIdentity::new("requests_total", "requests_total", vec![], "help");
        let encoded = encode_sid(&sid);

        dict.write_value(1001, &encoded, &sid, 1.0, 1.0, MetricType::Counter, AggregationMode::Sum)
            .await;
        dict.purge_process(1001).await;

        let items: Vec<_> = dict.read_all().collect().await;
        assert!(items.is_empty());
    }

    #[tokio::test]
    async fn is_alive_reports_true_for_live_server() {
        let (dict, _container) = test_dict().await;
        assert!(dict.is_alive().await);
    }
}

//! File-backed storage dict (§4.2.1): one memory-mapped file per
//! `(metric_type, aggregation_mode)` per process in the multiprocess
//! directory, named so the pid is recoverable from the filename.
//!
//! Entries are keyed by the raw `encode_sid` output rather than the hashed
//! `storage_key` scheme from [`super::key`] — that scheme exists so
//! network-backend keys are fixed-length and collector-addressable by
//! prefix scan, but the file back-end's key is self-describing (a reader
//! can `decode_sid` it straight back into metric name/labels/help text),
//! so it never needs the network back-end's sidecar metadata record
//! (invariant 3 only binds the network back-end).
//!
//! Byte-level entry framing requires direct slice indexing into the mmap;
//! every index used here is bounds-checked against a watermark or a
//! `get(..)` first.
#![allow(clippy::indexing_slicing)]

use super::dict::{ErrorCounters, ReadAllItem, StorageDict};
use super::key::parse_type_suffix;
use super::{AggregationMode, MetricType, Pid, SampleIdentity};
use crate::error::CoreError;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, StreamExt};
use memmap2::MmapMut;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

const INITIAL_CAPACITY: u64 = 64 * 1024;
const HEADER_LEN: usize = 8;

const fn align8(n: usize) -> usize {
    (n + 7) & !7
}

const fn entry_len(key_len: usize) -> usize {
    align8(4 + key_len) + 16
}

/// One growable memory-mapped file plus the in-memory index that lets the
/// owning process resolve an encoded SID to its value-field offset without
/// a linear scan on every write (§4.2.1).
struct MmapFile {
    file: File,
    mmap: MmapMut,
    index: std::collections::HashMap<Vec<u8>, usize>,
}

impl MmapFile {
    fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let existing_len = file.metadata()?.len();
        if existing_len < INITIAL_CAPACITY {
            file.set_len(INITIAL_CAPACITY)?;
        }

        let mut mmap = unsafe { MmapMut::map_mut(&file)? };
        if existing_len == 0 {
            mmap[0..HEADER_LEN].copy_from_slice(&(HEADER_LEN as u64).to_le_bytes());
        }

        let mut dict = Self {
            file,
            mmap,
            index: std::collections::HashMap::new(),
        };
        dict.rebuild_index();
        Ok(dict)
    }

    fn watermark(&self) -> usize {
        let bytes: [u8; 8] = self.mmap[0..HEADER_LEN]
            .try_into()
            .unwrap_or([0u8; HEADER_LEN]);
        u64::from_le_bytes(bytes) as usize
    }

    fn set_watermark(&mut self, value: usize) {
        #[allow(clippy::cast_possible_truncation)]
        self.mmap[0..HEADER_LEN].copy_from_slice(&(value as u64).to_le_bytes());
    }

    /// Re-derives the index from file content, for reopening a file that
    /// already has entries (process restart reusing a pid, or a crashed
    /// writer resuming).
    fn rebuild_index(&mut self) {
        let watermark = self.watermark();
        let mut offset = HEADER_LEN;

        while offset + 4 <= watermark {
            let Some(key_len) = read_u32(&self.mmap, offset) else {
                break;
            };
            let key_len = key_len as usize;
            let value_offset = offset + align8(4 + key_len);
            let next = value_offset + 16;
            if next > watermark {
                break;
            }
            if let Some(key) = self.mmap.get(offset + 4..offset + 4 + key_len) {
                self.index.insert(key.to_vec(), value_offset);
            }
            offset = next;
        }
    }

    fn ensure_capacity(&mut self, additional: usize) -> Result<(), CoreError> {
        let needed = self.watermark() + additional;
        if needed <= self.mmap.len() {
            return Ok(());
        }

        let mut new_len = self.mmap.len() as u64;
        while (new_len as usize) < needed {
            new_len = new_len.saturating_mul(2);
        }

        self.file
            .set_len(new_len)
            .map_err(|e| CoreError::CapacityExceeded(format!("failed to grow file: {e}")))?;
        self.mmap = unsafe {
            MmapMut::map_mut(&self.file)
                .map_err(|e| CoreError::CapacityExceeded(format!("failed to remap file: {e}")))?
        };
        Ok(())
    }

    fn write_value(&mut self, key: &[u8], value: f64, timestamp: f64) -> Result<(), CoreError> {
        if let Some(&value_offset) = self.index.get(key) {
            write_f64(&mut self.mmap, value_offset, value);
            write_f64(&mut self.mmap, value_offset + 8, timestamp);
            return Ok(());
        }

        let needed = entry_len(key.len());
        self.ensure_capacity(needed)?;

        let offset = self.watermark();
        #[allow(clippy::cast_possible_truncation)]
        write_u32(&mut self.mmap, offset, key.len() as u32);
        self.mmap[offset + 4..offset + 4 + key.len()].copy_from_slice(key);

        let value_offset = offset + align8(4 + key.len());
        write_f64(&mut self.mmap, value_offset, value);
        write_f64(&mut self.mmap, value_offset + 8, timestamp);

        // Watermark bump is last: a concurrent lock-free reader observes
        // either the pre-write watermark (entry invisible) or the
        // post-write one (entry fully present), never a torn key (§6).
        self.set_watermark(value_offset + 16);
        self.index.insert(key.to_vec(), value_offset);
        Ok(())
    }
}

fn read_u32(mmap: &MmapMut, offset: usize) -> Option<u32> {
    mmap.get(offset..offset + 4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_le_bytes)
}

fn read_f64(mmap: &MmapMut, offset: usize) -> Option<f64> {
    mmap.get(offset..offset + 8)
        .and_then(|b| b.try_into().ok())
        .map(f64::from_le_bytes)
}

fn write_u32(mmap: &mut MmapMut, offset: usize, value: u32) {
    mmap[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn write_f64(mmap: &mut MmapMut, offset: usize, value: f64) {
    mmap[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

fn type_suffix(metric_type: MetricType, aggregation_mode: AggregationMode) -> String {
    if metric_type == MetricType::Gauge {
        format!("{metric_type}_{aggregation_mode}")
    } else {
        metric_type.to_string()
    }
}

/// Parses `{type_suffix}_{pid}.db`, where `type_suffix` may itself contain
/// underscores (e.g. `gauge_mostrecent`).
fn parse_filename(name: &str) -> Option<(String, Pid)> {
    let stem = name.strip_suffix(".db")?;
    let (suffix, pid) = stem.rsplit_once('_')?;
    let pid = pid.parse().ok()?;
    Some((suffix.to_string(), pid))
}

/// Storage dict implementation backed by one memory-mapped file per
/// `(type_suffix, pid)` under `dir`.
pub struct FileStorageDict {
    dir: PathBuf,
    pid: Pid,
    files: DashMap<String, Mutex<MmapFile>>,
    errors: ErrorCounters,
}

impl FileStorageDict {
    /// Opens (creating if needed) the multiprocess directory for the
    /// calling process's own writes; `read_all`/`purge_process` operate
    /// across every pid's files found in `dir`.
    pub fn open(dir: impl Into<PathBuf>, pid: Pid) -> Result<Self, CoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .map_err(|e| CoreError::BackendUnavailable(format!("multiprocess dir: {e}")))?;

        Ok(Self {
            dir,
            pid,
            files: DashMap::new(),
            errors: ErrorCounters::default(),
        })
    }

    fn file_for(&self, suffix: &str) -> Result<(), CoreError> {
        if self.files.contains_key(suffix) {
            return Ok(());
        }
        let path = self.dir.join(format!("{suffix}_{}.db", self.pid));
        let mmap_file = MmapFile::open(&path)
            .map_err(|e| CoreError::BackendUnavailable(format!("{}: {e}", path.display())))?;
        self.files.insert(suffix.to_string(), Mutex::new(mmap_file));
        Ok(())
    }

    fn with_local_file<R>(
        &self,
        metric_type: MetricType,
        aggregation_mode: AggregationMode,
        f: impl FnOnce(&mut MmapFile) -> R,
    ) -> Option<R> {
        let suffix = type_suffix(metric_type, aggregation_mode);
        if let Err(err) = self.file_for(&suffix) {
            warn!(error = %err, suffix, "file-backed storage dict unavailable");
            self.errors.record_backend_error();
            return None;
        }
        self.files.get(&suffix).map(|entry| {
            let mut locked = match entry.value().lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            f(&mut locked)
        })
    }
}

impl StorageDict for FileStorageDict {
    fn read_value<'a>(
        &'a self,
        _pid: Pid,
        encoded_sid: &'a [u8],
        metric_type: MetricType,
        aggregation_mode: AggregationMode,
    ) -> BoxFuture<'a, (Option<f64>, Option<f64>)> {
        Box::pin(async move {
            self.with_local_file(metric_type, aggregation_mode, |f| {
                f.index.get(encoded_sid).and_then(|&offset| {
                    let value = read_f64(&f.mmap, offset);
                    let ts = read_f64(&f.mmap, offset + 8);
                    value.zip(ts)
                })
            })
            .flatten()
            .map_or((None, None), |(v, t)| (Some(v), Some(t)))
        })
    }

    fn write_value<'a>(
        &'a self,
        _pid: Pid,
        encoded_sid: &'a [u8],
        _sid: &'a SampleIdentity,
        value: f64,
        sample_timestamp: f64,
        metric_type: MetricType,
        aggregation_mode: AggregationMode,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let result = self.with_local_file(metric_type, aggregation_mode, |f| {
                f.write_value(encoded_sid, value, sample_timestamp)
            });
            match result {
                Some(Ok(())) => {}
                Some(Err(err)) => {
                    warn!(error = %err, "dropping write after file growth failure");
                    self.errors.record_capacity_exceeded();
                }
                None => {}
            }
        })
    }

    fn read_all(&self) -> BoxStream<'_, ReadAllItem> {
        let entries = std::fs::read_dir(&self.dir)
            .into_iter()
            .flatten()
            .filter_map(Result::ok)
            .collect::<Vec<_>>();

        let items: Vec<ReadAllItem> = entries
            .into_iter()
            .filter_map(|entry| {
                let name = entry.file_name();
                let name = name.to_str()?;
                let (suffix, pid) = parse_filename(name)?;
                let (metric_type, aggregation_mode) = parse_type_suffix(&suffix)?;
                Some((entry.path(), metric_type, aggregation_mode, pid))
            })
            .flat_map(|(path, metric_type, aggregation_mode, pid)| {
                read_file_entries(&path, &self.errors)
                    .into_iter()
                    .map(move |(encoded_sid, value, sample_timestamp)| ReadAllItem {
                        pid,
                        metric_type,
                        aggregation_mode,
                        encoded_sid,
                        value,
                        sample_timestamp,
                        written_at: sample_timestamp,
                        metadata: None,
                    })
            })
            .collect();

        stream::iter(items).boxed()
    }

    fn purge_process(&self, pid: Pid) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.files.retain(|suffix, _| {
                let path = self.dir.join(format!("{suffix}_{pid}.db"));
                let _ = std::fs::remove_file(&path);
                true
            });

            if let Ok(entries) = std::fs::read_dir(&self.dir) {
                for entry in entries.filter_map(Result::ok) {
                    let name = entry.file_name();
                    let Some(name) = name.to_str() else { continue };
                    if let Some((_, file_pid)) = parse_filename(name)
                        && file_pid == pid
                        && let Err(err) = std::fs::remove_file(entry.path())
                    {
                        debug!(error = %err, path = %entry.path().display(), "purge: file already gone");
                    }
                }
            }
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.files.clear();
        })
    }

    fn error_counters(&self) -> &ErrorCounters {
        &self.errors
    }
}

/// Reads every entry out of one metric-type file, tolerating the watermark
/// advancing mid-scan (re-read each iteration) and skipping corrupt tails
/// rather than failing the whole scrape.
fn read_file_entries(path: &Path, errors: &ErrorCounters) -> Vec<(Vec<u8>, f64, f64)> {
    let Ok(file) = File::open(path) else {
        return Vec::new();
    };
    let Ok(mmap) = (unsafe { memmap2::Mmap::map(&file) }) else {
        return Vec::new();
    };

    let mut out = Vec::new();
    let mut offset = HEADER_LEN;

    loop {
        let watermark = mmap
            .get(0..HEADER_LEN)
            .and_then(|b| b.try_into().ok())
            .map_or(0, |b: [u8; 8]| u64::from_le_bytes(b) as usize);

        if offset + 4 > watermark {
            break;
        }

        let Some(key_len) = mmap
            .get(offset..offset + 4)
            .and_then(|b| b.try_into().ok())
            .map(u32::from_le_bytes)
        else {
            errors.record_corrupt_record();
            break;
        };
        let key_len = key_len as usize;
        let value_offset = offset + align8(4 + key_len);
        let next = value_offset + 16;

        if next > watermark {
            break;
        }

        let key = mmap.get(offset + 4..offset + 4 + key_len).map(<[u8]>::to_vec);
        let value = mmap
            .get(value_offset..value_offset + 8)
            .and_then(|b| b.try_into().ok())
            .map(f64::from_le_bytes);
        let ts = mmap
            .get(value_offset + 8..value_offset + 16)
            .and_then(|b| b.try_into().ok())
            .map(f64::from_le_bytes);

        match (key, value, ts) {
            (Some(key), Some(value), Some(ts)) => out.push((key, value, ts)),
            _ => {
                errors.record_corrupt_record();
                break;
            }
        }

        offset = next;
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::multiproc::key::encode_sid;
    use crate::multiproc::SampleIdentity as Sid;

    fn sid(name: &str) -> (Sid, Vec<u8>) {
        let sid = Sid::new(name, name, vec![], "help");
        let encoded = encode_sid(&sid);
        (sid, encoded)
    }

    #[test]
    fn round_trip_write_then_read() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dict = FileStorageDict::open(tmp.path(), 1001).expect("open");
        let (sid, encoded) = sid("requests_total");

        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("rt")
            .block_on(async {
                dict.write_value(1001, &encoded, &sid, 3.0, 100.0, MetricType::Counter, AggregationMode::Sum)
                    .await;
                let (value, ts) = dict
                    .read_value(1001, &encoded, MetricType::Counter, AggregationMode::Sum)
                    .await;
                assert_eq!(value, Some(3.0));
                assert_eq!(ts, Some(100.0));
            });
    }

    #[test]
    fn read_all_sees_other_processes_files() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("rt");

        let (sid, encoded) = sid("requests_total");
        let dict_a = FileStorageDict::open(tmp.path(), 1001).expect("open a");
        let dict_b = FileStorageDict::open(tmp.path(), 1002).expect("open b");

        rt.block_on(async {
            dict_a
                .write_value(1001, &encoded, &sid, 3.0, 1.0, MetricType::Counter, AggregationMode::Sum)
                .await;
            dict_b
                .write_value(1002, &encoded, &sid, 5.0, 1.0, MetricType::Counter, AggregationMode::Sum)
                .await;

            let items: Vec<_> = dict_a.read_all().collect().await;
            let pids: Vec<Pid> = items.iter().map(|i| i.pid).collect();
            assert!(pids.contains(&1001));
            assert!(pids.contains(&1002));
        });
    }

    #[test]
    fn purge_removes_pid_files() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("rt");
        let (sid, encoded) = sid("requests_total");
        let dict = FileStorageDict::open(tmp.path(), 1001).expect("open");

        rt.block_on(async {
            dict.write_value(1001, &encoded, &sid, 3.0, 1.0, MetricType::Counter, AggregationMode::Sum)
                .await;
            dict.purge_process(1001).await;
            let items: Vec<_> = dict.read_all().collect().await;
            assert!(items.is_empty());
        });
    }

    #[test]
    fn file_grows_past_initial_capacity() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("rt");
        let dict = FileStorageDict::open(tmp.path(), 1001).expect("open");

        rt.block_on(async {
            for i in 0..5000u32 {
                let (sid, encoded) = sid(&format!("metric_{i}"));
                dict.write_value(1001, &encoded, &sid, f64::from(i), 1.0, MetricType::Counter, AggregationMode::Sum)
                    .await;
            }
            let items: Vec<_> = dict.read_all().collect().await;
            assert_eq!(items.len(), 5000);
        });
    }

    #[test]
    fn decode_sid_recovers_labels_from_file_key() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("rt");
        let dict = FileStorageDict::open(tmp.path(), 1001).expect("open");
        let sid = Sid::new(
            "requests_total",
            "requests_total",
            vec![("route".to_string(), "/a".to_string())],
            "total requests",
        );
        let encoded = encode_sid(&sid);

        rt.block_on(async {
            dict.write_value(1001, &encoded, &sid, 8.0, 1.0, MetricType::Counter, AggregationMode::Sum)
                .await;
            let items: Vec<_> = dict.read_all().collect().await;
            assert_eq!(items.len(), 1);
            let decoded = crate::multiproc::key::decode_sid(&items[0].encoded_sid).expect("decode");
            assert_eq!(decoded.labels, vec![("route".to_string(), "/a".to_string())]);
        });
    }
}

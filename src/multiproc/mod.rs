//! Storage layer and collector substrate for the multi-process metric store.
//!
//! Module boundaries mirror the component split of the storage layer:
//! [`key`] (sample key codec), [`dict`] (the `StorageDict` trait shared by
//! [`file_dict`] and [`redis_dict`]), [`value`] (per-worker value cells),
//! [`collector`] (the multi-process aggregating collector), [`manager`]
//! (back-end lifecycle singleton) and [`hooks`]/[`config`] (server-lifecycle
//! integration and the configuration surface).

pub mod collector;
pub mod config;
pub mod dict;
pub mod file_dict;
pub mod hooks;
pub mod key;
pub mod manager;
pub mod redis_dict;
pub mod value;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque stable identifier for a worker process. The file back-end uses
/// the OS pid directly; the network back-end embeds the same value in its
/// storage keys.
pub type Pid = u32;

/// Wall-clock seconds, the `f64` timestamp representation used
/// throughout (`sample_timestamp`, `written_at`).
pub type Timestamp = f64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MetricType {
    Counter,
    Gauge,
    Histogram,
    Summary,
}

impl MetricType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Counter => "counter",
            Self::Gauge => "gauge",
            Self::Histogram => "histogram",
            Self::Summary => "summary",
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MetricType {
    type Err = crate::error::CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "counter" => Ok(Self::Counter),
            "gauge" => Ok(Self::Gauge),
            "histogram" => Ok(Self::Histogram),
            "summary" => Ok(Self::Summary),
            other => Err(crate::error::CoreError::MalformedKey(format!(
                "unknown metric type `{other}`"
            ))),
        }
    }
}

/// Per-metric-family policy governing how per-process samples combine at
/// scrape time. Default is `sum` for counters/histograms/summaries; gauges
/// pick their mode explicitly at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AggregationMode {
    Sum,
    Max,
    Min,
    MostRecent,
    All,
    LiveAll,
}

impl AggregationMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sum => "sum",
            Self::Max => "max",
            Self::Min => "min",
            Self::MostRecent => "mostrecent",
            Self::All => "all",
            Self::LiveAll => "liveall",
        }
    }

    /// Whether this mode groups by pid in addition to the label set
    /// (§4.4.3): `all`/`liveall` keep one series per process.
    pub const fn groups_by_pid(self) -> bool {
        matches!(self, Self::All | Self::LiveAll)
    }
}

impl fmt::Display for AggregationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AggregationMode {
    type Err = crate::error::CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sum" => Ok(Self::Sum),
            "max" => Ok(Self::Max),
            "min" => Ok(Self::Min),
            "mostrecent" => Ok(Self::MostRecent),
            "all" => Ok(Self::All),
            "liveall" => Ok(Self::LiveAll),
            other => Err(crate::error::CoreError::MalformedKey(format!(
                "unknown aggregation mode `{other}`"
            ))),
        }
    }
}

/// `(metric_name, sample_name, label_name->label_value, help_text)`, treated
/// as order-independent in its label map (§3).
#[derive(Debug, Clone, PartialEq)]
pub struct SampleIdentity {
    pub metric_name: String,
    pub sample_name: String,
    pub labels: Vec<(String, String)>,
    pub help_text: String,
}

impl SampleIdentity {
    pub fn new(
        metric_name: impl Into<String>,
        sample_name: impl Into<String>,
        labels: Vec<(String, String)>,
        help_text: impl Into<String>,
    ) -> Self {
        Self {
            metric_name: metric_name.into(),
            sample_name: sample_name.into(),
            labels,
            help_text: help_text.into(),
        }
    }

    /// Label value for `le`, if this sample carries a histogram bucket bound.
    pub fn bucket_bound(&self) -> Option<&str> {
        self.labels
            .iter()
            .find(|(name, _)| name == "le")
            .map(|(_, value)| value.as_str())
    }

    /// The label set with `le` and `pid` stripped, for family grouping.
    pub fn label_set_without_pid(&self) -> Vec<(String, String)> {
        let mut labels: Vec<(String, String)> = self
            .labels
            .iter()
            .filter(|(name, _)| name != "pid")
            .cloned()
            .collect();
        labels.sort_by(|a, b| a.0.cmp(&b.0));
        labels
    }
}

/// `(metric_name, metric_type, aggregation_mode, help_text, label_schema)`.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricFamily {
    pub name: String,
    pub metric_type: MetricType,
    pub aggregation_mode: AggregationMode,
    pub help_text: String,
    pub label_names: Vec<String>,
}

/// One stored `(value, sample_timestamp, written_at)` triple, uniquely
/// identified by `(pid, metric_family, sample_identity)` (invariant 1).
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SampleCell {
    pub value: f64,
    pub sample_timestamp: Timestamp,
    pub written_at: Timestamp,
}

/// Sidecar record describing a stored cell so the collector can reconstruct
/// families without consulting live value cells (§3).
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataRecord {
    pub aggregation_mode: AggregationMode,
    pub metric_name: String,
    pub label_names: Vec<String>,
    pub help_text: String,
    pub original_sid: Vec<u8>,
}

/// Current wall-clock time in fractional seconds, the local fallback used
/// when the network back-end's time-of-server primitive is unavailable
/// (§4.2.2).
pub fn local_wall_time() -> Timestamp {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

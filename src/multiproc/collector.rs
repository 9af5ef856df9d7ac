//! Multi-process aggregating collector (C4): turns every live and dead
//! worker's Sample Cells into one Prometheus exposition, per §4.4.

use super::dict::{ReadAllItem, StorageDict};
use super::hooks::MasterSignalCounters;
use super::key::decode_sid;
use super::{AggregationMode, MetricFamily, MetricType, Pid};
use dashmap::DashSet;
use futures::StreamExt;
use prometheus::proto::{self, MetricType as ProtoMetricType};
use prometheus::{Encoder, TextEncoder, TEXT_FORMAT};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

/// One reconstructed sample, ready for grouping within its family.
struct Sample {
    pid: Pid,
    sample_name: String,
    label_set: Vec<(String, String)>,
    value: f64,
    sample_timestamp: f64,
    written_at: f64,
}

/// Aggregates [`StorageDict::read_all`] across every metric family
/// registered with it and renders Prometheus text exposition.
pub struct MultiProcessCollector {
    dict: Arc<dyn StorageDict>,
    families: Vec<MetricFamily>,
    live_pids: Arc<DashSet<Pid>>,
    scrape_deadline: Duration,
    signal_counters: Option<Arc<MasterSignalCounters>>,
}

impl MultiProcessCollector {
    pub fn new(dict: Arc<dyn StorageDict>, families: Vec<MetricFamily>, live_pids: Arc<DashSet<Pid>>) -> Self {
        Self {
            dict,
            families,
            live_pids,
            scrape_deadline: Duration::from_secs(10),
            signal_counters: None,
        }
    }

    pub fn with_scrape_deadline(mut self, deadline: Duration) -> Self {
        self.scrape_deadline = deadline;
        self
    }

    /// Binds the master's signal-to-reason counters (§4.6, §11) so a scrape
    /// includes `master_worker_restart_total{reason=...}` alongside the
    /// application families reconstructed from storage. The master harness
    /// is the only caller that has one; worker-only collectors omit it.
    pub fn with_signal_counters(mut self, counters: Arc<MasterSignalCounters>) -> Self {
        self.signal_counters = Some(counters);
        self
    }

    /// Runs one collection pass, returning Prometheus text-exposition bytes
    /// (v0.0.4) plus the content-type header value for the caller to set.
    pub async fn collect(&self) -> (Vec<u8>, &'static str) {
        let start = Instant::now();
        let mut by_family: BTreeMap<usize, Vec<Sample>> = BTreeMap::new();
        let mut truncated = false;

        let mut stream = self.dict.read_all();
        while let Some(item) = stream.next().await {
            if start.elapsed() > self.scrape_deadline {
                truncated = true;
                break;
            }
            let Some((family_idx, sample)) = self.reconstruct(&item) else {
                continue;
            };
            by_family.entry(family_idx).or_default().push(sample);
        }

        if truncated {
            self.dict.error_counters().record_scrape_truncated();
            warn!("scrape exceeded deadline, returning partial exposition");
        }

        let mut proto_families: Vec<proto::MetricFamily> = self
            .families
            .iter()
            .enumerate()
            .filter_map(|(idx, family)| {
                by_family
                    .get(&idx)
                    .map(|samples| render_family(family, samples))
            })
            .collect();

        proto_families.push(self.internal_metrics_family());
        if let Some(counters) = &self.signal_counters {
            proto_families.push(signal_counters_family(counters));
        }

        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if let Err(err) = encoder.encode(&proto_families, &mut buffer) {
            warn!(error = %err, "exposition encoding failed");
            return (Vec::new(), TEXT_FORMAT);
        }

        (buffer, TEXT_FORMAT)
    }

    /// Maps a raw cell onto its registered family (by name + type) and
    /// reconstructs the label set the collector groups by. The file back-end
    /// never populates `metadata` (its on-disk key is already
    /// self-describing), so the common path decodes `item.encoded_sid`
    /// directly; only a genuinely undecodable key counts as corruption
    /// (§4.4 edge cases).
    fn reconstruct(&self, item: &ReadAllItem) -> Option<(usize, Sample)> {
        let (metric_name, sample_name, label_set) = if let Some(meta) = &item.metadata {
            let sid = decode_sid(&meta.original_sid).ok()?;
            let label_set = sid.label_set_without_pid();
            (meta.metric_name.clone(), sid.sample_name, label_set)
        } else {
            let Ok(sid) = decode_sid(&item.encoded_sid) else {
                self.dict.error_counters().record_corrupt_record();
                return None;
            };
            let label_set = sid.label_set_without_pid();
            (sid.metric_name.clone(), sid.sample_name, label_set)
        };

        let family_idx = self.families.iter().position(|f| {
            f.name == metric_name && f.metric_type == item.metric_type && f.aggregation_mode == item.aggregation_mode
        })?;

        let family_mode = self.families[family_idx].aggregation_mode;
        // `liveall` is `all` restricted to pids the manager still considers
        // live at scrape time; a dead pid's sample is treated as if absent
        // rather than zeroed (§4.4 step 4).
        if family_mode == AggregationMode::LiveAll && !self.live_pids.contains(&item.pid) {
            return None;
        }

        let mut label_set = label_set;
        if family_mode.groups_by_pid() {
            label_set.push(("pid".to_string(), item.pid.to_string()));
        }

        Some((
            family_idx,
            Sample {
                pid: item.pid,
                sample_name,
                label_set,
                value: item.value,
                sample_timestamp: item.sample_timestamp,
                written_at: item.written_at,
            },
        ))
    }

    fn internal_metrics_family(&self) -> proto::MetricFamily {
        let errors = self.dict.error_counters();
        let samples = [
            ("corrupt_records", errors.corrupt_records() as f64),
            ("backend_errors", errors.backend_errors() as f64),
            ("capacity_exceeded", errors.capacity_exceeded() as f64),
            ("scrape_truncated", errors.scrape_truncated() as f64),
        ];

        let mut family = proto::MetricFamily::default();
        family.set_name("gunicorn_sidecar_internal_total".to_string());
        family.set_help("Internal degradation counters for the multiprocess storage layer.".to_string());
        family.set_field_type(ProtoMetricType::COUNTER);

        let metrics = samples
            .into_iter()
            .map(|(reason, value)| {
                let mut label = proto::LabelPair::default();
                label.set_name("reason".to_string());
                label.set_value(reason.to_string());

                let mut counter = proto::Counter::default();
                counter.set_value(value);

                let mut metric = proto::Metric::default();
                metric.set_label(vec![label]);
                metric.set_counter(counter);
                metric
            })
            .collect::<Vec<_>>();
        family.set_metric(metrics);
        family
    }
}

/// Renders `master_worker_restart_total{reason=...}` straight from the
/// in-memory signal counters (§4.6): these never pass through a storage
/// cell because only the master process ever observes a master signal.
fn signal_counters_family(counters: &MasterSignalCounters) -> proto::MetricFamily {
    let mut family = proto::MetricFamily::default();
    family.set_name("master_worker_restart_total".to_string());
    family.set_help("Count of master-observed signals that led to (or could lead to) a worker restart.".to_string());
    family.set_field_type(ProtoMetricType::COUNTER);

    let metrics = counters
        .families_and_samples()
        .into_iter()
        .map(|(reason, count)| {
            let mut label = proto::LabelPair::default();
            label.set_name("reason".to_string());
            label.set_value(reason.to_string());

            let mut counter = proto::Counter::default();
            #[allow(clippy::cast_precision_loss)]
            counter.set_value(count as f64);

            let mut metric = proto::Metric::default();
            metric.set_label(vec![label]);
            metric.set_counter(counter);
            metric
        })
        .collect::<Vec<_>>();
    family.set_metric(metrics);
    family
}

fn render_family(family: &MetricFamily, samples: &[Sample]) -> proto::MetricFamily {
    let mut grouped: BTreeMap<Vec<(String, String)>, Vec<&Sample>> = BTreeMap::new();
    for sample in samples {
        grouped.entry(sample.label_set.clone()).or_default().push(sample);
    }

    // Summaries are decomposed and rendered the same way as histograms
    // (bucket/_sum/_count cells, no quantile computation); see DESIGN.md.
    let proto_type = match family.metric_type {
        MetricType::Counter => ProtoMetricType::COUNTER,
        MetricType::Gauge => ProtoMetricType::GAUGE,
        MetricType::Histogram | MetricType::Summary => ProtoMetricType::HISTOGRAM,
    };

    let mut proto_family = proto::MetricFamily::default();
    proto_family.set_name(family.name.clone());
    proto_family.set_help(family.help_text.clone());
    proto_family.set_field_type(proto_type);

    let metrics = if matches!(family.metric_type, MetricType::Histogram | MetricType::Summary) {
        render_histogram_groups(&grouped)
    } else {
        grouped
            .into_iter()
            .map(|(label_set, group)| render_scalar(&label_set, &group, family.metric_type, family.aggregation_mode))
            .collect()
    };

    proto_family.set_metric(metrics);
    proto_family
}

fn render_scalar(label_set: &[(String, String)], group: &[&Sample], metric_type: MetricType, mode: AggregationMode) -> proto::Metric {
    let value = aggregate(group, mode);
    let mut metric = proto::Metric::default();
    metric.set_label(labels_to_proto(label_set));

    match metric_type {
        MetricType::Gauge => {
            let mut gauge = proto::Gauge::default();
            gauge.set_value(value);
            metric.set_gauge(gauge);
        }
        _ => {
            let mut counter = proto::Counter::default();
            counter.set_value(value);
            metric.set_counter(counter);
        }
    }
    metric
}

fn aggregate(group: &[&Sample], mode: AggregationMode) -> f64 {
    match mode {
        AggregationMode::Sum => group.iter().map(|s| s.value).sum(),
        AggregationMode::Max => group.iter().map(|s| s.value).fold(f64::NEG_INFINITY, f64::max),
        AggregationMode::Min => group.iter().map(|s| s.value).fold(f64::INFINITY, f64::min),
        AggregationMode::MostRecent => most_recent(group).map_or(0.0, |s| s.value),
        AggregationMode::All | AggregationMode::LiveAll => group.first().map_or(0.0, |s| s.value),
    }
}

/// Picks the winning sample for `mostrecent`: greatest `sample_timestamp`,
/// ties broken by greatest `written_at`, then by greatest pid (§4.4.4).
fn most_recent<'a>(group: &[&'a Sample]) -> Option<&'a Sample> {
    group.iter().copied().max_by(|a, b| {
        a.sample_timestamp
            .partial_cmp(&b.sample_timestamp)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.written_at.partial_cmp(&b.written_at).unwrap_or(std::cmp::Ordering::Equal))
            .then_with(|| a.pid.cmp(&b.pid))
    })
}

/// Histogram families decompose into three kinds of cell sharing the
/// family's base label set: `_bucket` cells (carrying an extra `le`
/// label), `_sum`, and `_count`. Grouping must first split by the base
/// label set (with `le` removed), then classify each sample by its
/// `sample_name` suffix, aggregate per bucket, and apply the monotonicity
/// clamp (§4.4.5). Missing `_sum`/`_count` are tolerated, never synthesized
/// (§4.4 edge cases).
fn render_histogram_groups(grouped: &BTreeMap<Vec<(String, String)>, Vec<&Sample>>) -> Vec<proto::Metric> {
    struct HistogramGroup<'a> {
        buckets: BTreeMap<String, Vec<&'a Sample>>,
        sum: Vec<&'a Sample>,
        count: Vec<&'a Sample>,
    }

    let mut by_base: BTreeMap<Vec<(String, String)>, HistogramGroup<'_>> = BTreeMap::new();

    for (label_set, group) in grouped {
        let le = label_set.iter().find(|(name, _)| name == "le").map(|(_, v)| v.clone());
        let base: Vec<(String, String)> = label_set.iter().filter(|(name, _)| name != "le").cloned().collect();
        let entry = by_base.entry(base).or_insert_with(|| HistogramGroup {
            buckets: BTreeMap::new(),
            sum: Vec::new(),
            count: Vec::new(),
        });

        for sample in group {
            if let Some(le) = &le {
                entry.buckets.entry(le.clone()).or_default().push(sample);
            } else if sample.sample_name.ends_with("_sum") {
                entry.sum.push(sample);
            } else if sample.sample_name.ends_with("_count") {
                entry.count.push(sample);
            }
        }
    }

    by_base
        .into_iter()
        .map(|(base, group)| render_histogram_metric(&base, &group.buckets, &group.sum, &group.count))
        .collect()
}

fn render_histogram_metric(
    base: &[(String, String)],
    buckets: &BTreeMap<String, Vec<&Sample>>,
    sum: &[&Sample],
    count: &[&Sample],
) -> proto::Metric {
    let mut sorted_bounds: Vec<(f64, f64)> = buckets
        .iter()
        .filter_map(|(le, samples)| {
            let bound = if le == "+Inf" { f64::INFINITY } else { le.parse().ok()? };
            let value: f64 = samples.iter().map(|s| s.value).sum();
            Some((bound, value))
        })
        .collect();
    sorted_bounds.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

    let mut running_max = 0.0f64;
    let proto_buckets: Vec<proto::Bucket> = sorted_bounds
        .into_iter()
        .map(|(bound, value)| {
            running_max = running_max.max(value);
            let mut bucket = proto::Bucket::default();
            bucket.set_upper_bound(bound);
            #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
            bucket.set_cumulative_count(running_max as u64);
            bucket
        })
        .collect();

    let mut metric = proto::Metric::default();
    metric.set_label(labels_to_proto(base));

    let mut histogram = proto::Histogram::default();
    histogram.set_bucket(proto_buckets);
    if !sum.is_empty() {
        histogram.set_sample_sum(sum.iter().map(|s| s.value).sum());
    }
    if !count.is_empty() {
        #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
        histogram.set_sample_count(count.iter().map(|s| s.value).sum::<f64>() as u64);
    }
    metric.set_histogram(histogram);
    metric
}

fn labels_to_proto(label_set: &[(String, String)]) -> Vec<proto::LabelPair> {
    label_set
        .iter()
        .map(|(name, value)| {
            let mut label = proto::LabelPair::default();
            label.set_name(name.clone());
            label.set_value(value.clone());
            label
        })
        .collect()
}

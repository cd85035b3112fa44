// Multiprocess metric store
// Each worker process periodically writes a JSON snapshot of its registry
// into a shared directory; the exposition endpoint merges all snapshots so
// any worker can answer a scrape for the whole fleet.
//
// Numan Thabit 2025 Nov

use crate::errors::Result;
use parking_lot::Mutex;
use prometheus::proto::{
    Bucket, Counter, Gauge, Histogram, LabelPair, Metric, MetricFamily, MetricType, Summary,
};
use prometheus::Registry;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const SNAPSHOT_PREFIX: &str = "metrics_";
const SNAPSHOT_SUFFIX: &str = ".json";

// stores sharing a directory never share a temp file
static WRITE_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotKind {
    Counter,
    Gauge,
    Histogram,
    Summary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeriesSnapshot {
    pub labels: Vec<(String, String)>,
    /// Counter or gauge value.
    #[serde(default)]
    pub value: f64,
    #[serde(default)]
    pub count: u64,
    #[serde(default)]
    pub sum: f64,
    /// Cumulative `(upper_bound, count)` pairs of a histogram.
    #[serde(default)]
    pub buckets: Vec<(f64, u64)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FamilySnapshot {
    pub name: String,
    pub help: String,
    pub kind: SnapshotKind,
    pub series: Vec<SeriesSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessSnapshot {
    pub pid: u32,
    pub families: Vec<FamilySnapshot>,
}

impl ProcessSnapshot {
    pub fn capture(pid: u32, families: &[MetricFamily]) -> Self {
        Self {
            pid,
            families: families.iter().filter_map(family_snapshot).collect(),
        }
    }
}

fn family_snapshot(family: &MetricFamily) -> Option<FamilySnapshot> {
    let kind = match family.get_field_type() {
        MetricType::COUNTER => SnapshotKind::Counter,
        MetricType::GAUGE => SnapshotKind::Gauge,
        MetricType::HISTOGRAM => SnapshotKind::Histogram,
        MetricType::SUMMARY => SnapshotKind::Summary,
        MetricType::UNTYPED => return None,
    };

    let series = family
        .get_metric()
        .iter()
        .map(|metric| {
            let labels = metric
                .get_label()
                .iter()
                .map(|pair| (pair.get_name().to_string(), pair.get_value().to_string()))
                .collect();
            let mut series = SeriesSnapshot {
                labels,
                value: 0.0,
                count: 0,
                sum: 0.0,
                buckets: Vec::new(),
            };
            match kind {
                SnapshotKind::Counter => series.value = metric.get_counter().get_value(),
                SnapshotKind::Gauge => series.value = metric.get_gauge().get_value(),
                SnapshotKind::Histogram => {
                    let h = metric.get_histogram();
                    series.count = h.get_sample_count();
                    series.sum = h.get_sample_sum();
                    series.buckets = h
                        .get_bucket()
                        .iter()
                        .filter(|b| b.get_upper_bound().is_finite())
                        .map(|b| (b.get_upper_bound(), b.get_cumulative_count()))
                        .collect();
                }
                SnapshotKind::Summary => {
                    let s = metric.get_summary();
                    series.count = s.get_sample_count();
                    series.sum = s.get_sample_sum();
                }
            }
            series
        })
        .collect();

    Some(FamilySnapshot {
        name: family.get_name().to_string(),
        help: family.get_help().to_string(),
        kind,
        series,
    })
}

/// Shared snapshot directory, one file per process id. Clones share the
/// flush lock.
#[derive(Debug, Clone)]
pub struct MultiProcessStore {
    dir: PathBuf,
    flush_lock: Arc<Mutex<()>>,
}

impl MultiProcessStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            flush_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn snapshot_path(&self, pid: u32) -> PathBuf {
        self.dir.join(format!("{SNAPSHOT_PREFIX}{pid}{SNAPSHOT_SUFFIX}"))
    }

    /// Atomically replace the snapshot of `snapshot.pid`.
    pub fn write_snapshot(&self, snapshot: &ProcessSnapshot) -> Result<()> {
        let target = self.snapshot_path(snapshot.pid);
        let seq = WRITE_SEQ.fetch_add(1, Ordering::Relaxed);
        let tmp = self.dir.join(format!(".{SNAPSHOT_PREFIX}{}.{seq}.tmp", snapshot.pid));
        fs::write(&tmp, serde_json::to_vec(snapshot)?)?;
        fs::rename(&tmp, &target)?;
        Ok(())
    }

    /// Write this process's current registry state. Gather and rename happen
    /// under one lock, so the file never goes back to an older capture.
    pub fn flush(&self, registry: &Registry) -> Result<()> {
        let _guard = self.flush_lock.lock();
        let snapshot = ProcessSnapshot::capture(std::process::id(), &registry.gather());
        self.write_snapshot(&snapshot)
    }

    pub fn read_snapshots(&self) -> Result<Vec<ProcessSnapshot>> {
        let mut snapshots = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let is_snapshot = path
                .file_name()
                .and_then(|name| name.to_str())
                .map(|name| name.starts_with(SNAPSHOT_PREFIX) && name.ends_with(SNAPSHOT_SUFFIX))
                .unwrap_or(false);
            if !is_snapshot {
                continue;
            }
            match read_snapshot(&path) {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping unreadable metrics snapshot");
                }
            }
        }
        snapshots.sort_by_key(|snapshot| snapshot.pid);
        Ok(snapshots)
    }

    /// Drop the gauges a finished worker left behind; its counters and
    /// observations keep contributing to the totals.
    pub fn mark_process_dead(&self, pid: u32) -> Result<()> {
        let path = self.snapshot_path(pid);
        if !path.exists() {
            return Ok(());
        }
        let mut snapshot = read_snapshot(&path)?;
        snapshot.families.retain(|family| family.kind != SnapshotKind::Gauge);
        if snapshot.families.is_empty() {
            fs::remove_file(&path)?;
        } else {
            self.write_snapshot(&snapshot)?;
        }
        debug!(pid, "removed gauges of dead process");
        Ok(())
    }

    /// Merge every snapshot into one set of families. Counters, histograms and
    /// summaries with identical labels are summed; gauges are kept per process
    /// under an extra `pid` label unless they already carry one.
    pub fn merged_families(&self) -> Result<Vec<MetricFamily>> {
        Ok(merge(&self.read_snapshots()?))
    }
}

fn read_snapshot(path: &Path) -> Result<ProcessSnapshot> {
    Ok(serde_json::from_slice(&fs::read(path)?)?)
}

struct MergedFamily {
    help: String,
    kind: SnapshotKind,
    series: BTreeMap<Vec<(String, String)>, SeriesSnapshot>,
}

fn merge(snapshots: &[ProcessSnapshot]) -> Vec<MetricFamily> {
    let mut merged: BTreeMap<String, MergedFamily> = BTreeMap::new();

    for snapshot in snapshots {
        for family in &snapshot.families {
            let entry = merged.entry(family.name.clone()).or_insert_with(|| MergedFamily {
                help: family.help.clone(),
                kind: family.kind,
                series: BTreeMap::new(),
            });
            if entry.kind != family.kind {
                warn!(family = %family.name, pid = snapshot.pid, "metric type differs between processes");
                continue;
            }

            for series in &family.series {
                let mut labels = series.labels.clone();
                let has_pid = labels.iter().any(|(name, _)| name == "pid");
                if family.kind == SnapshotKind::Gauge && !has_pid {
                    labels.push(("pid".to_string(), snapshot.pid.to_string()));
                }
                labels.sort();

                match entry.series.get_mut(&labels) {
                    Some(existing) => accumulate(existing, series),
                    None => {
                        let mut series = series.clone();
                        series.labels = labels.clone();
                        entry.series.insert(labels, series);
                    }
                }
            }
        }
    }

    merged
        .into_iter()
        .map(|(name, family)| into_proto(name, family))
        .collect()
}

fn accumulate(into: &mut SeriesSnapshot, from: &SeriesSnapshot) {
    into.value += from.value;
    into.count += from.count;
    into.sum += from.sum;
    for (bound, count) in &from.buckets {
        match into.buckets.iter_mut().find(|(b, _)| b == bound) {
            Some((_, total)) => *total += count,
            None => into.buckets.push((*bound, *count)),
        }
    }
    into.buckets.sort_by(|a, b| a.0.total_cmp(&b.0));
}

fn into_proto(name: String, family: MergedFamily) -> MetricFamily {
    let mut proto = MetricFamily::default();
    proto.set_name(name);
    proto.set_help(family.help);
    proto.set_field_type(match family.kind {
        SnapshotKind::Counter => MetricType::COUNTER,
        SnapshotKind::Gauge => MetricType::GAUGE,
        SnapshotKind::Histogram => MetricType::HISTOGRAM,
        SnapshotKind::Summary => MetricType::SUMMARY,
    });

    for (_, series) in family.series {
        let mut metric = Metric::default();
        for (name, value) in series.labels {
            let mut pair = LabelPair::default();
            pair.set_name(name);
            pair.set_value(value);
            metric.mut_label().push(pair);
        }
        match family.kind {
            SnapshotKind::Counter => {
                let mut counter = Counter::default();
                counter.set_value(series.value);
                metric.set_counter(counter);
            }
            SnapshotKind::Gauge => {
                let mut gauge = Gauge::default();
                gauge.set_value(series.value);
                metric.set_gauge(gauge);
            }
            SnapshotKind::Histogram => {
                let mut histogram = Histogram::default();
                histogram.set_sample_count(series.count);
                histogram.set_sample_sum(series.sum);
                for (bound, count) in series.buckets {
                    let mut bucket = Bucket::default();
                    bucket.set_upper_bound(bound);
                    bucket.set_cumulative_count(count);
                    histogram.mut_bucket().push(bucket);
                }
                metric.set_histogram(histogram);
            }
            SnapshotKind::Summary => {
                let mut summary = Summary::default();
                summary.set_sample_count(series.count);
                summary.set_sample_sum(series.sum);
                metric.set_summary(summary);
            }
        }
        proto.mut_metric().push(metric);
    }
    proto
}

/// Periodically flush `registry` into the store until the runtime shuts down.
pub fn spawn_writer(store: MultiProcessStore, registry: Registry, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let store = store.clone();
            let registry = registry.clone();
            match tokio::task::spawn_blocking(move || store.flush(&registry)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(error = %err, "failed to write metrics snapshot"),
                Err(err) => warn!(error = %err, "metrics snapshot task failed"),
            }
        }
    })
}

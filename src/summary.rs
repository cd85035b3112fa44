// Summary metric collector
// The prometheus crate ships counters, gauges and histograms only. This
// collector exposes labelled sum/count summaries (no quantiles) through the
// same registry and text encoder.
//
// Numan Thabit 2025 Nov

use parking_lot::RwLock;
use prometheus::core::{Atomic, AtomicF64, Collector, Desc};
use prometheus::proto::{LabelPair, Metric, MetricFamily, MetricType, Summary as SummaryProto};
use prometheus::{Error as PromError, Opts};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// One labelled summary series.
#[derive(Clone, Default)]
pub struct Summary {
    core: Arc<SummaryCore>,
}

struct SummaryCore {
    sum: AtomicF64,
    count: AtomicU64,
}

impl Default for SummaryCore {
    fn default() -> Self {
        Self {
            sum: AtomicF64::new(0.0),
            count: AtomicU64::new(0),
        }
    }
}

impl fmt::Debug for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Summary")
            .field("sum", &self.get_sample_sum())
            .field("count", &self.get_sample_count())
            .finish()
    }
}

impl Summary {
    pub fn observe(&self, v: f64) {
        self.core.sum.inc_by(v);
        self.core.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_sample_sum(&self) -> f64 {
        self.core.sum.get()
    }

    pub fn get_sample_count(&self) -> u64 {
        self.core.count.load(Ordering::Relaxed)
    }
}

/// Summary family partitioned by label values.
#[derive(Clone)]
pub struct SummaryVec {
    desc: Arc<Desc>,
    children: Arc<RwLock<HashMap<Vec<String>, Summary>>>,
}

impl SummaryVec {
    pub fn new(opts: Opts, label_names: &[&str]) -> Result<Self, PromError> {
        let variable_labels = label_names.iter().map(|name| name.to_string()).collect();
        let desc = Desc::new(
            opts.fq_name(),
            opts.help.clone(),
            variable_labels,
            opts.const_labels.clone(),
        )?;
        Ok(Self {
            desc: Arc::new(desc),
            children: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// Child for the given label values, created on first use. The lock only
    /// guards the lookup; observations go straight to the child's atomics.
    pub fn get_metric_with_label_values(&self, vals: &[&str]) -> Result<Summary, PromError> {
        let expected = self.desc.variable_labels.len();
        if vals.len() != expected {
            return Err(PromError::InconsistentCardinality {
                expect: expected,
                got: vals.len(),
            });
        }

        let key: Vec<String> = vals.iter().map(|v| v.to_string()).collect();
        if let Some(child) = self.children.read().get(&key) {
            return Ok(child.clone());
        }
        let mut children = self.children.write();
        Ok(children.entry(key).or_default().clone())
    }
}

impl Collector for SummaryVec {
    fn desc(&self) -> Vec<&Desc> {
        vec![self.desc.as_ref()]
    }

    fn collect(&self) -> Vec<MetricFamily> {
        let mut family = MetricFamily::default();
        family.set_name(self.desc.fq_name.clone());
        family.set_help(self.desc.help.clone());
        family.set_field_type(MetricType::SUMMARY);

        let children = self.children.read();
        for (values, child) in children.iter() {
            let mut pairs: Vec<LabelPair> = self.desc.const_label_pairs.clone();
            for (name, value) in self.desc.variable_labels.iter().zip(values) {
                let mut pair = LabelPair::default();
                pair.set_name(name.clone());
                pair.set_value(value.clone());
                pairs.push(pair);
            }
            pairs.sort_by(|a, b| a.get_name().cmp(b.get_name()));

            let mut metric = Metric::default();
            for pair in pairs {
                metric.mut_label().push(pair);
            }

            let mut summary = SummaryProto::default();
            summary.set_sample_count(child.get_sample_count());
            summary.set_sample_sum(child.get_sample_sum());
            metric.set_summary(summary);
            family.mut_metric().push(metric);
        }

        vec![family]
    }
}

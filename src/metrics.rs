// Metric registration and label binding
// Creates the four metric kinds against a prometheus registry with a fixed
// label schema, and binds label values to concrete children at observation
// time.
//
// Numan Thabit 2025 Nov

use crate::errors::Result;
use crate::summary::{Summary, SummaryVec};
use prometheus::{
    Counter, CounterVec, Gauge, GaugeVec, Histogram, HistogramOpts, HistogramVec, Opts, Registry,
};
use std::fmt;
use std::time::Duration;

/// Kind of a declared metric, carrying its kind-specific options.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricKind {
    Counter,
    Gauge,
    /// `None` keeps the registry's default buckets.
    Histogram { buckets: Option<Vec<f64>> },
    Summary,
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
            MetricKind::Histogram { .. } => "histogram",
            MetricKind::Summary => "summary",
        };
        f.write_str(kind)
    }
}

/// Registered parent metric. Cheap to clone; clones share storage.
#[derive(Clone)]
pub enum MetricHandle {
    Counter(CounterVec),
    Gauge(GaugeVec),
    Histogram(HistogramVec),
    Summary(SummaryVec),
}

/// A parent metric bound to one set of label values.
#[derive(Debug, Clone)]
pub enum BoundMetric {
    Counter(Counter),
    Gauge(Gauge),
    Histogram(Histogram),
    Summary(Summary),
}

/// Update applied to a bound metric once a call finishes (or before it starts).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Record the elapsed seconds.
    Observe,
    Inc,
    Dec,
}

/// Create `name` of the given kind and register it. Must run once per declared
/// metric; collisions and invalid buckets surface as the registry's own error.
pub fn register(
    registry: &Registry,
    kind: MetricKind,
    name: &str,
    description: &str,
    label_names: &[String],
) -> Result<MetricHandle> {
    let labels: Vec<&str> = label_names.iter().map(String::as_str).collect();
    let opts = Opts::new(name, description);

    let handle = match kind {
        MetricKind::Counter => {
            let vec = CounterVec::new(opts, &labels)?;
            registry.register(Box::new(vec.clone()))?;
            MetricHandle::Counter(vec)
        }
        MetricKind::Gauge => {
            let vec = GaugeVec::new(opts, &labels)?;
            registry.register(Box::new(vec.clone()))?;
            MetricHandle::Gauge(vec)
        }
        MetricKind::Histogram { buckets } => {
            let mut opts = HistogramOpts::from(opts);
            if let Some(buckets) = buckets {
                opts = opts.buckets(buckets);
            }
            // bucket layout is only validated when a child is created; check it now
            Histogram::with_opts(opts.clone())?;
            let vec = HistogramVec::new(opts, &labels)?;
            registry.register(Box::new(vec.clone()))?;
            MetricHandle::Histogram(vec)
        }
        MetricKind::Summary => {
            let vec = SummaryVec::new(opts, &labels)?;
            registry.register(Box::new(vec.clone()))?;
            MetricHandle::Summary(vec)
        }
    };
    Ok(handle)
}

impl MetricHandle {
    pub fn kind(&self) -> &'static str {
        match self {
            MetricHandle::Counter(_) => "counter",
            MetricHandle::Gauge(_) => "gauge",
            MetricHandle::Histogram(_) => "histogram",
            MetricHandle::Summary(_) => "summary",
        }
    }

    /// Child for `values`; the registry rejects a value count that differs
    /// from the declared label schema.
    pub fn bind(&self, values: &[String]) -> Result<BoundMetric, prometheus::Error> {
        let values: Vec<&str> = values.iter().map(String::as_str).collect();
        let bound = match self {
            MetricHandle::Counter(vec) => BoundMetric::Counter(vec.get_metric_with_label_values(&values)?),
            MetricHandle::Gauge(vec) => BoundMetric::Gauge(vec.get_metric_with_label_values(&values)?),
            MetricHandle::Histogram(vec) => {
                BoundMetric::Histogram(vec.get_metric_with_label_values(&values)?)
            }
            MetricHandle::Summary(vec) => BoundMetric::Summary(vec.get_metric_with_label_values(&values)?),
        };
        Ok(bound)
    }
}

impl fmt::Debug for MetricHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("MetricHandle").field(&self.kind()).finish()
    }
}

impl BoundMetric {
    pub fn apply(&self, action: Action, elapsed: Duration) {
        let secs = elapsed.as_secs_f64();
        match (self, action) {
            (BoundMetric::Counter(c), Action::Observe) => c.inc_by(secs),
            (BoundMetric::Counter(c), _) => c.inc(),
            (BoundMetric::Gauge(g), Action::Observe) => g.set(secs),
            (BoundMetric::Gauge(g), Action::Inc) => g.inc(),
            (BoundMetric::Gauge(g), Action::Dec) => g.dec(),
            (BoundMetric::Histogram(h), _) => h.observe(secs),
            (BoundMetric::Summary(s), _) => s.observe(secs),
        }
    }
}

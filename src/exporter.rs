// Metrics exporter
// Entry point of the crate: owns the registry and runtime environment,
// installs the default request metrics and the metrics endpoint on an axum
// router, and hands out tracking layers for individual routes.
//
// Numan Thabit 2025 Nov

use crate::config::{GroupBy, MetricsOptions, Prefix, RuntimeEnv};
use crate::defaults::{DefaultMetrics, DefaultMetricsLayer};
use crate::errors::{ExporterError, Result};
use crate::exposition::{metrics_handler, Exposition};
use crate::labels::Labels;
use crate::metrics::MetricKind;
use crate::multiprocess::{self, MultiProcessStore};
use crate::request::MarkLayer;
use crate::server::{self, MetricsServer};
use crate::track::{TrackLayer, Tracker};
use axum::routing::get;
use axum::Router;
use once_cell::sync::OnceCell;
use prometheus::{Gauge, GaugeVec, Opts, Registry};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// How often a worker writes its multiprocess snapshot.
const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(5);

/// Request metrics for an axum application. Cheap to clone; clones share the
/// registry and all declared metrics.
#[derive(Clone)]
pub struct MetricsExporter {
    inner: Arc<ExporterInner>,
}

struct ExporterInner {
    registry: Registry,
    env: RuntimeEnv,
    path: Option<String>,
    export_defaults: bool,
    prefix: Prefix,
    group_by: GroupBy,
    buckets: Option<Vec<f64>>,
    exposition: Arc<Exposition>,
    multiprocess: Option<MultiProcessStore>,
    defaults: OnceCell<DefaultMetricsLayer>,
    writer_started: AtomicBool,
}

impl MetricsExporter {
    pub fn new(options: MetricsOptions) -> Result<Self> {
        let multiprocess = options
            .env
            .multiprocess_dir()
            .map(MultiProcessStore::new)
            .transpose()?;
        if let Some(store) = &multiprocess {
            info!(dir = %store.dir().display(), "multiprocess metrics enabled");
        }
        let exposition = Arc::new(Exposition::new(options.registry.clone(), multiprocess.clone()));

        Ok(Self {
            inner: Arc::new(ExporterInner {
                registry: options.registry,
                env: options.env,
                path: options.path,
                export_defaults: options.export_defaults,
                prefix: options.prefix,
                group_by: options.group_by,
                buckets: options.buckets,
                exposition,
                multiprocess,
                defaults: OnceCell::new(),
                writer_started: AtomicBool::new(false),
            }),
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn env(&self) -> &RuntimeEnv {
        &self.inner.env
    }

    pub fn exposition(&self) -> Arc<Exposition> {
        self.inner.exposition.clone()
    }

    /// Install the metrics endpoint and the default metrics on `router`.
    /// Routes added to the router afterwards are not covered by the default
    /// metrics, so attach last.
    pub fn attach<S>(&self, router: Router<S>) -> Result<Router<S>>
    where
        S: Clone + Send + Sync + 'static,
    {
        let mut router = router;
        if let Some(path) = &self.inner.path {
            router = self.register_endpoint(router, path);
        }
        if self.inner.export_defaults {
            let layer = self.export_defaults(
                self.inner.buckets.clone(),
                self.inner.group_by.clone(),
                self.inner.prefix.clone(),
            )?;
            router = router.layer(layer);
        }
        self.start_snapshot_writer();
        Ok(router)
    }

    /// Serve the metrics at `path` on `router`. Skipped inside the
    /// auto-reloader child unless `DEBUG_METRICS` is set. One exporter can
    /// serve any number of routers; axum itself rejects a second `GET` route
    /// for the same path on one router.
    pub fn register_endpoint<S>(&self, router: Router<S>, path: &str) -> Router<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        if self.inner.env.is_running_from_reloader() && !self.inner.env.debug_metrics() {
            debug!(path, "running from reloader; metrics endpoint not registered");
            return router;
        }
        info!(path, "metrics endpoint registered");
        router.route(path, self.endpoint_route())
    }

    pub(crate) fn endpoint_route<S>(&self) -> axum::routing::MethodRouter<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        get(metrics_handler)
            .with_state(self.exposition())
            .layer(MarkLayer::do_not_track())
    }

    /// Register the default request metrics and return the layer recording
    /// them. Later calls return the first layer.
    pub fn export_defaults(
        &self,
        buckets: Option<Vec<f64>>,
        group_by: GroupBy,
        prefix: Prefix,
    ) -> Result<DefaultMetricsLayer> {
        self.inner
            .defaults
            .get_or_try_init(|| {
                let prefix = prefix.render();
                let metrics = DefaultMetrics::register(
                    &self.inner.registry,
                    &prefix,
                    group_by,
                    buckets,
                    self.inner.env.hostname(),
                )?;
                self.info(
                    &format!("{prefix}exporter_info"),
                    "Information about the request metrics exporter",
                    None,
                    None,
                    &[("version", VERSION)],
                )?;
                info!(prefix = %prefix, "default request metrics exported");
                Ok(Arc::new(metrics).layer())
            })
            .cloned()
    }

    /// Tracker for `kind`, usable around nested calls with `Tracker::call`.
    pub fn tracker(
        &self,
        kind: MetricKind,
        name: &str,
        description: &str,
        labels: Labels,
    ) -> Result<Tracker> {
        Tracker::new(&self.inner.registry, kind, name, description, &labels)
    }

    /// Count invocations.
    pub fn counter(&self, name: &str, description: &str, labels: Labels) -> Result<TrackLayer> {
        Ok(self.tracker(MetricKind::Counter, name, description, labels)?.layer())
    }

    /// Track invocations in flight.
    pub fn gauge(&self, name: &str, description: &str, labels: Labels) -> Result<TrackLayer> {
        Ok(self.tracker(MetricKind::Gauge, name, description, labels)?.layer())
    }

    /// Observe execution time into buckets; `None` keeps the default buckets.
    pub fn histogram(
        &self,
        name: &str,
        description: &str,
        labels: Labels,
        buckets: Option<Vec<f64>>,
    ) -> Result<TrackLayer> {
        Ok(self
            .tracker(MetricKind::Histogram { buckets }, name, description, labels)?
            .layer())
    }

    /// Observe execution time as a sum/count summary.
    pub fn summary(&self, name: &str, description: &str, labels: Labels) -> Result<TrackLayer> {
        Ok(self.tracker(MetricKind::Summary, name, description, labels)?.layer())
    }

    /// Exclude a route from the default metrics.
    pub fn do_not_track(&self) -> MarkLayer {
        MarkLayer::do_not_track()
    }

    /// Name the endpoint of a route, used by `GroupBy::Endpoint`.
    pub fn endpoint(&self, name: &str) -> MarkLayer {
        MarkLayer::endpoint(name)
    }

    /// Publish a constant gauge set to 1 carrying static information in its
    /// labels. Labels come either as parallel `label_names`/`label_values` or
    /// as `labels` pairs, never both.
    pub fn info(
        &self,
        name: &str,
        description: &str,
        label_names: Option<&[&str]>,
        label_values: Option<&[&str]>,
        labels: &[(&str, &str)],
    ) -> Result<Gauge> {
        if label_names.is_some() && !labels.is_empty() {
            return Err(ExporterError::config(
                "cannot have labels both as pairs and as names with values",
            ));
        }

        let (names, values): (Vec<&str>, Vec<&str>) = match label_names {
            Some(names) => {
                let values = label_values.ok_or_else(|| {
                    ExporterError::config("label values are required with label names")
                })?;
                if names.len() != values.len() {
                    return Err(ExporterError::config(format!(
                        "{} label names but {} label values",
                        names.len(),
                        values.len()
                    )));
                }
                (names.to_vec(), values.to_vec())
            }
            None => labels.iter().copied().unzip(),
        };

        let vec = GaugeVec::new(Opts::new(name, description), &names)?;
        self.inner.registry.register(Box::new(vec.clone()))?;
        let gauge = vec.get_metric_with_label_values(&values)?;
        gauge.set(1.0);
        Ok(gauge)
    }

    /// Serve the metrics on a separate listener. Returns `None` inside the
    /// auto-reloader child.
    pub async fn start_http_server(
        &self,
        port: u16,
        host: &str,
        endpoint: &str,
    ) -> Result<Option<MetricsServer>> {
        server::start_http_server(self, port, host, endpoint).await
    }

    fn start_snapshot_writer(&self) {
        let store = match &self.inner.multiprocess {
            Some(store) => store.clone(),
            None => return,
        };
        if tokio::runtime::Handle::try_current().is_err() {
            warn!("no tokio runtime; multiprocess snapshots are only written on scrape");
            return;
        }
        if self.inner.writer_started.swap(true, Ordering::SeqCst) {
            return;
        }
        multiprocess::spawn_writer(store, self.inner.registry.clone(), SNAPSHOT_INTERVAL);
    }
}

// Default request metrics
// Application-wide layer that times every request and records the default
// duration histogram, request counter and average gauge, grouped by the
// configured request property.
//
// Numan Thabit 2025 Nov

use crate::config::GroupBy;
use crate::errors::Result;
use crate::request::{self, RequestInfo};
use crate::track::{attempt, Attempt};
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::future::BoxFuture;
use prometheus::{CounterVec, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry};
use std::panic;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};
use tracing::{debug, error};

/// The three default series and what they are labelled with.
pub struct DefaultMetrics {
    duration: HistogramVec,
    total: CounterVec,
    average: GaugeVec,
    group_by: GroupBy,
    hostname: String,
    pid: String,
}

impl DefaultMetrics {
    pub fn register(
        registry: &Registry,
        prefix: &str,
        group_by: GroupBy,
        buckets: Option<Vec<f64>>,
        hostname: &str,
    ) -> Result<Self> {
        let group = group_by.label_name().to_string();

        let mut duration_opts = HistogramOpts::new(
            format!("{prefix}http_request_duration_seconds"),
            "HTTP request duration in seconds",
        );
        if let Some(buckets) = buckets {
            duration_opts = duration_opts.buckets(buckets);
        }
        prometheus::Histogram::with_opts(duration_opts.clone())?;
        let duration = HistogramVec::new(
            duration_opts,
            &["method", group.as_str(), "pid", "hostname", "status"],
        )?;

        let total = CounterVec::new(
            Opts::new(format!("{prefix}http_request_total"), "Total number of HTTP requests"),
            &["method", group.as_str(), "hostname", "status"],
        )?;

        let average = GaugeVec::new(
            Opts::new(
                format!("{prefix}http_request_average"),
                "Average response time of HTTP requests",
            ),
            &["method", group.as_str(), "hostname", "status"],
        )?;

        registry.register(Box::new(duration.clone()))?;
        registry.register(Box::new(total.clone()))?;
        registry.register(Box::new(average.clone()))?;

        Ok(Self {
            duration,
            total,
            average,
            group_by,
            hostname: hostname.to_string(),
            pid: std::process::id().to_string(),
        })
    }

    pub fn layer(self: &Arc<Self>) -> DefaultMetricsLayer {
        DefaultMetricsLayer {
            metrics: Arc::clone(self),
        }
    }

    /// After-hook for one finished request.
    pub fn record(&self, info: &RequestInfo, status: StatusCode) {
        let state = match info.state() {
            Some(state) => state,
            None => return,
        };
        if state.is_untracked() {
            debug!(path = %info.path(), "request excluded from default metrics");
            return;
        }

        let elapsed = state.elapsed().as_secs_f64();
        let method = info.method().as_str();
        let group = self.group_by.value(info);
        let status = status.as_u16().to_string();

        let histogram = match self.duration.get_metric_with_label_values(&[
            method,
            group.as_str(),
            self.pid.as_str(),
            self.hostname.as_str(),
            status.as_str(),
        ]) {
            Ok(histogram) => histogram,
            Err(err) => {
                error!(error = %err, "failed to bind default duration histogram");
                return;
            }
        };
        histogram.observe(elapsed);

        let series = [method, group.as_str(), self.hostname.as_str(), status.as_str()];
        self.total.with_label_values(&series).inc();

        // this process and host only: the histogram child is already keyed by both
        let count = histogram.get_sample_count();
        if count > 0 {
            let average = histogram.get_sample_sum() / count as f64;
            self.average.with_label_values(&series).set(average);
        }
    }
}

/// Router-wide layer installing the default before/after hooks. Apply with
/// `Router::layer` so the matched route is known.
#[derive(Clone)]
pub struct DefaultMetricsLayer {
    metrics: Arc<DefaultMetrics>,
}

impl<S> Layer<S> for DefaultMetricsLayer {
    type Service = DefaultMetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        DefaultMetricsService {
            inner,
            metrics: self.metrics.clone(),
        }
    }
}

#[derive(Clone)]
pub struct DefaultMetricsService<S> {
    inner: S,
    metrics: Arc<DefaultMetrics>,
}

impl<S, B> Service<Request<B>> for DefaultMetricsService<S>
where
    S: Service<Request<B>> + Clone + Send + 'static,
    S::Response: IntoResponse,
    S::Error: Send + 'static,
    S::Future: Send + 'static,
    B: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, std::result::Result<Response, S::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<B>) -> Self::Future {
        request::ensure_state(&mut req);
        let info = RequestInfo::from_request(&req);
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let metrics = self.metrics.clone();

        Box::pin(request::scope(info.clone(), async move {
            match attempt(inner.call(req)).await {
                Attempt::Done(response) => {
                    let response = response.into_response();
                    metrics.record(&info, response.status());
                    Ok(response)
                }
                Attempt::Failed(err) => {
                    metrics.record(&info, StatusCode::INTERNAL_SERVER_ERROR);
                    Err(err)
                }
                Attempt::Panicked(payload) => {
                    metrics.record(&info, StatusCode::INTERNAL_SERVER_ERROR);
                    panic::resume_unwind(payload)
                }
            }
        }))
    }
}

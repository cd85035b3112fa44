// Invocation tracker
// Wraps handler calls so timing, label resolution and the metric update
// happen around every invocation, including failed and panicking ones.
// Failures are recorded first and then handed back unchanged to the
// surrounding framework.
//
// Numan Thabit 2025 Nov

use crate::errors::Result;
use crate::labels::{LabelResolver, Labels, Outcome};
use crate::metrics::{self, Action, BoundMetric, MetricHandle, MetricKind};
use crate::request::{self, RequestInfo};
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::future::BoxFuture;
use futures::FutureExt;
use prometheus::Registry;
use std::any::Any;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tower::{Layer, Service};
use tracing::{debug, error};

/// How a single wrapped call ended.
pub(crate) enum Attempt<T, E> {
    Done(T),
    Failed(E),
    Panicked(Box<dyn Any + Send + 'static>),
}

/// Run `fut`, capturing both `Err` results and panics.
pub(crate) async fn attempt<F, T, E>(fut: F) -> Attempt<T, E>
where
    F: Future<Output = std::result::Result<T, E>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(value)) => Attempt::Done(value),
        Ok(Err(err)) => Attempt::Failed(err),
        Err(payload) => Attempt::Panicked(payload),
    }
}

/// Response used for measurement when a handler produced none.
pub(crate) fn internal_error_response(detail: &str) -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, format!("Exception: {detail}")).into_response()
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "handler panicked"
    }
}

/// Strategy for turning a handler error into a normal response before it is
/// treated as a failure (the "soft" error path).
pub trait Recover<E> {
    fn recover(&self, err: E) -> std::result::Result<Response, E>;
}

/// Hand every error back to the framework untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct Propagate;

impl<E> Recover<E> for Propagate {
    fn recover(&self, err: E) -> std::result::Result<Response, E> {
        Err(err)
    }
}

/// Recovery through a closure; returning `Err` declines the error.
#[derive(Clone)]
pub struct RecoverFn<F>(F);

impl<E, F> Recover<E> for RecoverFn<F>
where
    F: Fn(E) -> std::result::Result<Response, E>,
{
    fn recover(&self, err: E) -> std::result::Result<Response, E> {
        (self.0)(err)
    }
}

/// A declared metric plus the way each call updates it. Cheap to clone.
#[derive(Clone)]
pub struct Tracker {
    inner: Arc<TrackerInner>,
}

struct TrackerInner {
    name: String,
    metric: MetricHandle,
    labels: LabelResolver,
    action: Action,
    before: Option<Action>,
}

impl Tracker {
    /// Register the metric and freeze its label schema. Runs once per
    /// declaration, never per call.
    pub fn new(
        registry: &Registry,
        kind: MetricKind,
        name: &str,
        description: &str,
        labels: &Labels,
    ) -> Result<Self> {
        let resolver = labels.resolve()?;
        let (action, before) = match kind {
            MetricKind::Counter => (Action::Inc, None),
            MetricKind::Gauge => (Action::Dec, Some(Action::Inc)),
            MetricKind::Histogram { .. } | MetricKind::Summary => (Action::Observe, None),
        };
        let metric = metrics::register(registry, kind, name, description, resolver.names())?;
        debug!(metric = %name, kind = metric.kind(), labels = ?resolver.names(), "tracked metric registered");

        Ok(Self {
            inner: Arc::new(TrackerInner {
                name: name.to_string(),
                metric,
                labels: resolver,
                action,
                before,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn metric(&self) -> &MetricHandle {
        &self.inner.metric
    }

    /// Wrap this tracker into a route-level tower layer.
    pub fn layer(&self) -> TrackLayer {
        TrackLayer::new(self.clone())
    }

    fn bind(&self, outcome: &Outcome<'_>) -> Option<BoundMetric> {
        let values = self.inner.labels.values(outcome);
        match self.inner.metric.bind(&values) {
            Ok(bound) => Some(bound),
            Err(err) => {
                error!(metric = %self.inner.name, error = %err, "failed to bind metric labels");
                None
            }
        }
    }

    /// Step 1: in-flight style metrics are bound and updated before the call.
    fn start(&self) -> Option<BoundMetric> {
        let before = self.inner.before?;
        let bound = self.bind(&Outcome::Pending)?;
        bound.apply(before, Duration::ZERO);
        Some(bound)
    }

    fn finish(&self, started: Option<BoundMetric>, elapsed: Duration, outcome: &Outcome<'_>) {
        let bound = match started {
            Some(bound) => Some(bound),
            None if self.inner.before.is_some() => None,
            None => self.bind(outcome),
        };
        if let Some(bound) = bound {
            bound.apply(self.inner.action, elapsed);
        }
    }

    /// Track a handler-level call. The return value is coerced into a full
    /// `Response` so status and header extractors behave; errors are offered
    /// to `recover` first. Unrecovered errors and panics are recorded against
    /// a synthesized 500 and then re-signalled.
    pub async fn handle<F, T, E, R>(&self, fut: F, recover: &R) -> std::result::Result<Response, E>
    where
        F: Future<Output = std::result::Result<T, E>>,
        T: IntoResponse,
        R: Recover<E> + ?Sized,
    {
        let started = self.start();
        let start = Instant::now();

        let result = attempt(fut).await;
        let elapsed = Instant::now().saturating_duration_since(start);

        let (response, failure): (Response, Option<Attempt<(), E>>) = match result {
            Attempt::Done(value) => (value.into_response(), None),
            Attempt::Failed(err) => match recover.recover(err) {
                Ok(response) => (response, None),
                Err(err) => (internal_error_response("handler error"), Some(Attempt::Failed(err))),
            },
            Attempt::Panicked(payload) => {
                let response = internal_error_response(panic_message(payload.as_ref()));
                (response, Some(Attempt::Panicked(payload)))
            }
        };

        self.finish(started, elapsed, &Outcome::Response(&response));

        match failure {
            Some(Attempt::Failed(err)) => Err(err),
            Some(Attempt::Panicked(payload)) => panic::resume_unwind(payload),
            _ => Ok(response),
        }
    }

    /// Track a nested call. Label extractors see the raw return value; a
    /// failure is measured as a synthesized 500 and then re-signalled.
    pub async fn call<F, T, E>(&self, fut: F) -> std::result::Result<T, E>
    where
        F: Future<Output = std::result::Result<T, E>>,
        T: Any + Send + Sync,
    {
        let started = self.start();
        let start = Instant::now();
        let result = attempt(fut).await;
        let elapsed = Instant::now().saturating_duration_since(start);

        match result {
            Attempt::Done(value) => {
                self.finish(started, elapsed, &Outcome::Value(&value));
                Ok(value)
            }
            Attempt::Failed(err) => {
                let response = internal_error_response("call failed");
                self.finish(started, elapsed, &Outcome::Response(&response));
                Err(err)
            }
            Attempt::Panicked(payload) => {
                let response = internal_error_response(panic_message(payload.as_ref()));
                self.finish(started, elapsed, &Outcome::Response(&response));
                panic::resume_unwind(payload)
            }
        }
    }
}

/// Route-level tracking layer, the Rust counterpart of a metric decorator.
/// Apply it to the handler's `MethodRouter` (or any service) so it sits
/// closest to the route registration.
///
/// Several layers on one route go through a single `ServiceBuilder`, outermost
/// first; chained `MethodRouter::layer` calls leave the intermediate error
/// type ambiguous.
///
/// ```ignore
/// get(handler).layer(
///     ServiceBuilder::new()
///         .layer(metrics.endpoint("orders"))
///         .layer(metrics.counter("orders_total", "orders", Labels::new())?),
/// )
/// ```
#[derive(Clone)]
pub struct TrackLayer<R = Propagate> {
    tracker: Tracker,
    recover: R,
}

impl TrackLayer {
    pub fn new(tracker: Tracker) -> Self {
        Self {
            tracker,
            recover: Propagate,
        }
    }
}

impl<R> TrackLayer<R> {
    /// Give handler errors a chance to become a response before they count
    /// as failures.
    pub fn recover_with<E, F>(self, f: F) -> TrackLayer<RecoverFn<F>>
    where
        F: Fn(E) -> std::result::Result<Response, E>,
    {
        TrackLayer {
            tracker: self.tracker,
            recover: RecoverFn(f),
        }
    }
}

impl<S, R: Clone> Layer<S> for TrackLayer<R> {
    type Service = TrackService<S, R>;

    fn layer(&self, inner: S) -> Self::Service {
        TrackService {
            inner,
            tracker: self.tracker.clone(),
            recover: self.recover.clone(),
        }
    }
}

#[derive(Clone)]
pub struct TrackService<S, R = Propagate> {
    inner: S,
    tracker: Tracker,
    recover: R,
}

impl<S, R, B> Service<Request<B>> for TrackService<S, R>
where
    S: Service<Request<B>> + Clone + Send + 'static,
    S::Response: IntoResponse,
    S::Error: Send + 'static,
    S::Future: Send + 'static,
    R: Recover<S::Error> + Clone + Send + Sync + 'static,
    B: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, std::result::Result<Response, S::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let info = RequestInfo::from_request(&req);
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let tracker = self.tracker.clone();
        let recover = self.recover.clone();

        Box::pin(request::scope(info, async move {
            tracker.handle(inner.call(req), &recover).await
        }))
    }
}

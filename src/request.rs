// Per-request state shared between lifecycle hooks and handler layers
// Carries the default-metrics start time, the do-not-track flag and an
// optional endpoint name, plus the task-local request info that zero-argument
// label providers read.
//
// Numan Thabit 2025 Nov

use axum::extract::MatchedPath;
use axum::http::{Method, Request};
use once_cell::sync::OnceCell;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tower::{Layer, Service};

/// Request-scoped flags introduced by the exporter. Stored as
/// `Arc<RequestState>` in the request extensions so layers nested deeper in
/// the stack can report back to the default-metrics layer.
#[derive(Debug)]
pub struct RequestState {
    started: Instant,
    do_not_track: AtomicBool,
    endpoint: OnceCell<String>,
}

impl Default for RequestState {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestState {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            do_not_track: AtomicBool::new(false),
            endpoint: OnceCell::new(),
        }
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    /// Time since the request was stamped; never negative.
    pub fn elapsed(&self) -> Duration {
        Instant::now().saturating_duration_since(self.started)
    }

    pub fn mark_untracked(&self) {
        self.do_not_track.store(true, Ordering::Relaxed);
    }

    pub fn is_untracked(&self) -> bool {
        self.do_not_track.load(Ordering::Relaxed)
    }

    /// Name the endpoint serving this request. Only the first name sticks.
    pub fn set_endpoint(&self, name: &str) -> bool {
        self.endpoint.set(name.to_string()).is_ok()
    }

    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.get().map(String::as_str)
    }
}

pub fn state_of<B>(req: &Request<B>) -> Option<Arc<RequestState>> {
    req.extensions().get::<Arc<RequestState>>().cloned()
}

pub(crate) fn ensure_state<B>(req: &mut Request<B>) -> Arc<RequestState> {
    if let Some(state) = state_of(req) {
        return state;
    }
    let state = Arc::new(RequestState::new());
    req.extensions_mut().insert(state.clone());
    state
}

/// Snapshot of the request a tracked call belongs to.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    method: Method,
    path: String,
    url_rule: Option<String>,
    state: Option<Arc<RequestState>>,
}

impl RequestInfo {
    pub fn from_request<B>(req: &Request<B>) -> Self {
        Self {
            method: req.method().clone(),
            path: req.uri().path().to_string(),
            url_rule: req
                .extensions()
                .get::<MatchedPath>()
                .map(|matched| matched.as_str().to_string()),
            state: state_of(req),
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Route template the request matched, e.g. `/items/:id`.
    pub fn url_rule(&self) -> Option<&str> {
        self.url_rule.as_deref()
    }

    pub fn endpoint(&self) -> Option<String> {
        self.state
            .as_ref()
            .and_then(|state| state.endpoint().map(str::to_string))
    }

    pub fn state(&self) -> Option<&Arc<RequestState>> {
        self.state.as_ref()
    }
}

tokio::task_local! {
    static CURRENT_REQUEST: RequestInfo;
}

/// The request being served by the enclosing tracked handler, if any.
pub fn current_request() -> Option<RequestInfo> {
    CURRENT_REQUEST.try_with(RequestInfo::clone).ok()
}

pub(crate) fn scope<F: Future>(info: RequestInfo, fut: F) -> impl Future<Output = F::Output> {
    CURRENT_REQUEST.scope(info, fut)
}

#[derive(Debug, Clone)]
enum Mark {
    DoNotTrack,
    Endpoint(Arc<str>),
}

/// Marks requests before the handler runs: either opting them out of the
/// default metrics or naming their endpoint for `GroupBy::Endpoint`.
/// Explicit tracking layers on the same route still record.
#[derive(Debug, Clone)]
pub struct MarkLayer {
    mark: Mark,
}

impl MarkLayer {
    pub fn do_not_track() -> Self {
        Self { mark: Mark::DoNotTrack }
    }

    pub fn endpoint(name: impl AsRef<str>) -> Self {
        Self {
            mark: Mark::Endpoint(Arc::from(name.as_ref())),
        }
    }
}

impl<S> Layer<S> for MarkLayer {
    type Service = MarkService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MarkService {
            inner,
            mark: self.mark.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MarkService<S> {
    inner: S,
    mark: Mark,
}

impl<S, B> Service<Request<B>> for MarkService<S>
where
    S: Service<Request<B>>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = S::Future;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<B>) -> Self::Future {
        let state = ensure_state(&mut req);
        match &self.mark {
            Mark::DoNotTrack => state.mark_untracked(),
            Mark::Endpoint(name) => {
                state.set_endpoint(name);
            }
        }
        self.inner.call(req)
    }
}

// Integration tests for route-level metrics and the metrics endpoint
//
// Numan Thabit 2025 Nov

mod common;

use axum::extract::Request;
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use common::{exporter, get as fetch, has_metric, metric_value, scrape};
use request_metrics::{current_request, LabelValue, Labels, MetricsOptions};
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tower::{service_fn, Layer, ServiceBuilder, ServiceExt};
use tower_http::catch_panic::CatchPanicLayer;

fn status_labels() -> Labels {
    Labels::new().with("status", LabelValue::status())
}

fn path_label() -> LabelValue {
    LabelValue::provider(|| current_request().map(|r| r.path().to_string()).unwrap_or_default())
}

#[tokio::test]
async fn restricted_output() {
    let metrics = exporter(MetricsOptions::default());
    let app = metrics
        .attach(Router::new().route("/", get(|| async { "hello" })))
        .unwrap();
    fetch(&app, "/").await;

    let all = scrape(&app, "/metrics").await;
    assert!(has_metric(&all, "axum_http_request_total", &[("path", "/")]));
    assert!(has_metric(&all, "axum_exporter_info", &[]));

    let only = scrape(&app, "/metrics?name%5B%5D=axum_http_request_duration_seconds").await;
    assert!(has_metric(&only, "axum_http_request_duration_seconds_count", &[("path", "/")]));
    assert!(!only.contains("axum_http_request_total"));
    assert!(!only.contains("axum_exporter_info"));

    let by_sample = scrape(&app, "/metrics?name%5B%5D=axum_http_request_duration_seconds_sum").await;
    assert!(has_metric(&by_sample, "axum_http_request_duration_seconds_sum", &[("path", "/")]));

    let nothing = scrape(&app, "/metrics?name%5B%5D=not_a_metric").await;
    assert!(nothing.trim().is_empty());
}

#[tokio::test]
async fn union_of_name_filters() {
    let metrics = exporter(MetricsOptions::default());
    let app = metrics
        .attach(Router::new().route("/", get(|| async { "hello" })))
        .unwrap();
    fetch(&app, "/").await;

    let text = scrape(
        &app,
        "/metrics?name%5B%5D=axum_http_request_total&name%5B%5D=axum_exporter_info",
    )
    .await;
    assert_eq!(
        metric_value(&text, "axum_http_request_total", &[("method", "GET"), ("status", "200")]),
        Some(1.0)
    );
    assert!(has_metric(&text, "axum_exporter_info", &[]));
    assert!(!text.contains("axum_http_request_duration_seconds"));
    assert!(!text.contains("axum_http_request_average"));
}

#[tokio::test]
async fn content_type_is_the_exposition_format() {
    let metrics = exporter(MetricsOptions::default());
    let app = metrics.attach(Router::new()).unwrap();
    let req = axum::http::Request::builder()
        .uri("/metrics")
        .body(axum::body::Body::empty())
        .unwrap();
    let response = app.oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["content-type"],
        "text/plain; version=0.0.4"
    );
}

#[tokio::test]
async fn standalone_http_server() {
    let metrics = exporter(MetricsOptions::default().path(None));
    let hits = metrics.counter("cnt_hits_total", "hits", Labels::new()).unwrap();
    let app = metrics
        .attach(Router::new().route("/test", get(|| async { "Hello world" }).layer(hits)))
        .unwrap();

    let (status, _) = fetch(&app, "/metrics").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    fetch(&app, "/test").await;

    let server = metrics
        .start_http_server(0, "127.0.0.1", "/metrics")
        .await
        .unwrap()
        .expect("server starts outside the reloader");

    let response = reqwest::get(format!("http://{}/metrics", server.addr)).await.unwrap();
    assert_eq!(response.status().as_u16(), 200);
    let text = response.text().await.unwrap();
    assert_eq!(metric_value(&text, "cnt_hits_total", &[]), Some(1.0));
    assert!(has_metric(&text, "axum_http_request_total", &[("path", "/test")]));

    server.handle.abort();
}

#[tokio::test]
async fn abort_with_503() {
    let metrics = exporter(MetricsOptions::default());
    let by_status = metrics
        .summary("http_index_requests_by_status", "Request latencies by status", status_labels())
        .unwrap();
    let by_status_and_path = metrics
        .histogram(
            "http_index_requests_by_status_and_path",
            "Index requests latencies by status and path",
            Labels::new()
                .with("status", LabelValue::status())
                .with("path", path_label()),
            None,
        )
        .unwrap();

    let app = Router::new().route(
        "/error",
        get(|| async { StatusCode::SERVICE_UNAVAILABLE }).layer(
            ServiceBuilder::new()
                .layer(by_status_and_path)
                .layer(by_status),
        ),
    );
    let app = metrics.attach(app).unwrap();

    let (status, _) = fetch(&app, "/error").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    let text = scrape(&app, "/metrics").await;
    assert_eq!(
        metric_value(&text, "http_index_requests_by_status_count", &[("status", "503")]),
        Some(1.0)
    );
    assert!(has_metric(&text, "http_index_requests_by_status_sum", &[("status", "503")]));

    let labels = [("status", "503"), ("path", "/error")];
    assert_eq!(
        metric_value(&text, "http_index_requests_by_status_and_path_count", &labels),
        Some(1.0)
    );
    assert!(has_metric(&text, "http_index_requests_by_status_and_path_sum", &labels));
    for le in ["0.5", "10"] {
        let mut bucket = labels.to_vec();
        bucket.push(("le", le));
        assert_eq!(
            metric_value(&text, "http_index_requests_by_status_and_path_bucket", &bucket),
            Some(1.0),
            "bucket le={le}"
        );
    }
}

#[tokio::test]
async fn uncaught_panic_is_recorded_as_500() {
    let metrics = exporter(MetricsOptions::default());
    let tracked = metrics
        .summary("http_with_exception", "Tracks the method raising an exception", status_labels())
        .unwrap();

    async fn boom() -> &'static str {
        panic!("handler failed on purpose")
    }

    let surfaced = Arc::new(AtomicBool::new(false));
    let seen = surfaced.clone();
    let app = metrics
        .attach(Router::new().route("/exception", get(boom).layer(tracked)))
        .unwrap()
        .layer(CatchPanicLayer::custom(move |_payload: Box<dyn std::any::Any + Send>| {
            seen.store(true, Ordering::SeqCst);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }));

    let (status, _) = fetch(&app, "/exception").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(surfaced.load(Ordering::SeqCst), "panic must reach the outer handler");

    let text = scrape(&app, "/metrics").await;
    assert_eq!(
        metric_value(&text, "http_with_exception_count", &[("status", "500")]),
        Some(1.0)
    );
    assert!(has_metric(&text, "http_with_exception_sum", &[("status", "500")]));
    assert_eq!(
        metric_value(
            &text,
            "axum_http_request_total",
            &[("path", "/exception"), ("status", "500")]
        ),
        Some(1.0)
    );
}

struct Conflict;

impl IntoResponse for Conflict {
    fn into_response(self) -> Response {
        (
            StatusCode::BAD_REQUEST,
            [("X-Original", "409")],
            "Bad request for conflict",
        )
            .into_response()
    }
}

async fn conflicting() -> Result<&'static str, Conflict> {
    Err(Conflict)
}

#[tokio::test]
async fn error_responses_are_measured_after_conversion() {
    let metrics = exporter(MetricsOptions::default());
    let with_exception = metrics
        .summary("http_with_exception", "Tracks the method raising an exception", status_labels())
        .unwrap();
    let with_code = metrics
        .summary(
            "http_with_code",
            "Tracks the error code of the original exception",
            Labels::new()
                .with("status", LabelValue::status())
                .from_response("code", |outcome| {
                    outcome.header("X-Original").unwrap_or("-1").to_string()
                }),
        )
        .unwrap();

    let app = Router::new()
        .route("/exception", get(conflicting).layer(with_exception))
        .route("/code", get(conflicting).layer(with_code));
    let app = metrics.attach(app).unwrap();

    for _ in 0..3 {
        assert_eq!(fetch(&app, "/exception").await.0, StatusCode::BAD_REQUEST);
    }
    for _ in 0..7 {
        assert_eq!(fetch(&app, "/code").await.0, StatusCode::BAD_REQUEST);
    }

    let text = scrape(&app, "/metrics").await;
    assert_eq!(
        metric_value(&text, "http_with_exception_count", &[("status", "400")]),
        Some(3.0)
    );
    assert!(has_metric(&text, "http_with_exception_sum", &[("status", "400")]));
    assert_eq!(
        metric_value(&text, "http_with_code_count", &[("status", "400"), ("code", "409")]),
        Some(7.0)
    );
    assert!(has_metric(&text, "http_with_code_sum", &[("status", "400"), ("code", "409")]));
}

#[derive(Debug)]
struct UpstreamError(u16);

#[tokio::test]
async fn recovered_service_errors_use_the_recovered_response() {
    let metrics = exporter(MetricsOptions::default());
    let layer = metrics
        .counter(
            "upstream_calls_total",
            "Upstream calls",
            Labels::new()
                .with("status", LabelValue::status())
                .with("code", LabelValue::header("x-original")),
        )
        .unwrap()
        .recover_with(|err: UpstreamError| -> Result<Response, UpstreamError> {
            Ok((StatusCode::BAD_REQUEST, [("x-original", err.0.to_string())]).into_response())
        });

    let svc = layer.layer(service_fn(|_req: Request| async {
        Err::<&'static str, _>(UpstreamError(409))
    }));
    let req = axum::http::Request::builder()
        .uri("/upstream")
        .body(axum::body::Body::empty())
        .unwrap();
    let response = svc.oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let text = String::from_utf8(metrics.exposition().render(&[]).unwrap()).unwrap();
    assert_eq!(
        metric_value(
            &text,
            "upstream_calls_total",
            &[("status", "400"), ("code", "409")]
        ),
        Some(1.0)
    );
}

#[tokio::test]
async fn named_endpoint() {
    let metrics = exporter(MetricsOptions::default());
    let tracked = metrics
        .summary("requests_by_status", "Request latencies by status", status_labels())
        .unwrap();

    let app = Router::new().route(
        "/testing",
        get(|| async {
            tokio::time::sleep(Duration::from_millis(1)).await;
            "OK"
        })
        .layer(
            ServiceBuilder::new()
                .layer(metrics.endpoint("testing_endpoint"))
                .layer(tracked),
        ),
    );
    let app = metrics.attach(app).unwrap();

    for _ in 0..5 {
        assert_eq!(fetch(&app, "/testing").await.0, StatusCode::OK);
    }

    let text = scrape(&app, "/metrics").await;
    assert_eq!(
        metric_value(&text, "requests_by_status_count", &[("status", "200")]),
        Some(5.0)
    );
    let sum = metric_value(&text, "requests_by_status_sum", &[("status", "200")]).unwrap();
    assert!(sum >= 0.005, "five requests of at least 1ms each, got {sum}");
}

async fn reject(_req: Request, _next: Next) -> Response {
    StatusCode::BAD_REQUEST.into_response()
}

#[tokio::test]
async fn rejected_before_the_handler() {
    let metrics = exporter(MetricsOptions::default());
    let app = Router::new()
        .route("/abort/before", get(|| async { "unreachable" }))
        .route_layer(middleware::from_fn(reject));
    let app = metrics.attach(app).unwrap();

    fetch(&app, "/abort/before").await;
    fetch(&app, "/abort/before").await;

    let text = scrape(&app, "/metrics").await;
    assert_eq!(
        metric_value(
            &text,
            "axum_http_request_total",
            &[("method", "GET"), ("status", "400")]
        ),
        Some(2.0)
    );
}

#[tokio::test]
async fn nested_calls_are_tracked_with_raw_values() {
    let metrics = exporter(MetricsOptions::default());
    let lookups = metrics
        .tracker(
            request_metrics::MetricKind::Counter,
            "lookups_total",
            "Lookups by result size",
            Labels::new().from_response("rows", |outcome| {
                outcome
                    .value::<Vec<u32>>()
                    .map(|rows| rows.len().to_string())
                    .unwrap_or_default()
            }),
        )
        .unwrap();

    let rows = lookups
        .call(async { Ok::<_, Infallible>(vec![1u32, 2]) })
        .await
        .unwrap();
    assert_eq!(rows, [1, 2]);

    let text = String::from_utf8(metrics.exposition().render(&[]).unwrap()).unwrap();
    assert_eq!(metric_value(&text, "lookups_total", &[("rows", "2")]), Some(1.0));
}

#[tokio::test]
async fn nested_calls_see_the_request_without_a_route_layer() {
    let metrics = exporter(MetricsOptions::default());
    let lookups = metrics
        .tracker(
            request_metrics::MetricKind::Counter,
            "lookups_total",
            "Lookups by request path",
            Labels::new().with("path", path_label()),
        )
        .unwrap();

    let handler = move || {
        let lookups = lookups.clone();
        async move {
            lookups
                .call(async { Ok::<_, Infallible>("found") })
                .await
                .unwrap_or("missing")
        }
    };
    let app = metrics
        .attach(Router::new().route("/lookup", get(handler)))
        .unwrap();

    assert_eq!(fetch(&app, "/lookup").await.0, StatusCode::OK);

    let text = scrape(&app, "/metrics").await;
    assert_eq!(metric_value(&text, "lookups_total", &[("path", "/lookup")]), Some(1.0));
    assert!(!has_metric(&text, "lookups_total", &[("path", "")]));
}

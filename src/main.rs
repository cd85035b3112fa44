// Demo application for request-metrics
// Runs a small axum service instrumented with the default request metrics
// and a few route-level metrics, optionally exposing them on a separate
// metrics port.
//
// Numan Thabit 2025 Nov

use anyhow::{anyhow, Context, Result};
use axum::extract::Path;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use request_metrics::{
    current_request, ExporterSettings, LabelValue, Labels, MetricsExporter, RuntimeEnv,
};
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing().context("initialize tracing subscriber")?;

    if let Err(err) = run().await {
        tracing::error!(error = ?err, "fatal demo error");
        std::process::exit(1);
    }
    Ok(())
}

async fn run() -> Result<()> {
    let env = RuntimeEnv::load().context("load runtime environment")?;
    let settings = ExporterSettings::load().context("load METRICS_* settings")?;
    let metrics_port = settings.port;
    let metrics_host = settings.host.clone().unwrap_or_else(|| "0.0.0.0".to_string());
    let listen = settings
        .listen
        .clone()
        .unwrap_or_else(|| "0.0.0.0:5000".to_string());

    let options = settings.into_options(env).context("build exporter options")?;
    let metrics = MetricsExporter::new(options).context("create metrics exporter")?;

    metrics
        .info(
            "app_info",
            "Application info",
            None,
            None,
            &[("version", env!("CARGO_PKG_VERSION"))],
        )
        .context("register app info")?;

    let status = || Labels::new().with("status", LabelValue::status());
    let by_path = metrics
        .histogram(
            "by_path_counter",
            "Request latency by request path",
            Labels::new()
                .provider("path", || {
                    current_request()
                        .map(|req| req.path().to_string())
                        .unwrap_or_default()
                })
                .with("status", LabelValue::status()),
            None,
        )
        .context("declare by_path_counter")?;
    let by_status = metrics
        .counter("by_status_counter", "Request count by status", status())
        .context("declare by_status_counter")?;
    let in_progress = metrics
        .gauge("in_progress", "Long running requests in progress", Labels::new())
        .context("declare in_progress")?;
    let errors = metrics
        .summary("errors_by_status", "Failed request latency by status", status())
        .context("declare errors_by_status")?;

    let app = Router::new()
        .route("/", get(index).layer(by_path))
        .route("/skip", get(skip).layer(metrics.do_not_track()))
        .route("/long-running", get(long_running).layer(in_progress))
        .route("/status/:status", get(echo_status).layer(by_status))
        .route(
            "/error",
            get(unavailable).layer(
                ServiceBuilder::new()
                    .layer(metrics.endpoint("error"))
                    .layer(errors),
            ),
        );

    let app = metrics
        .attach(app)
        .context("attach metrics to router")?
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    if let Some(port) = metrics_port {
        match metrics
            .start_http_server(port, &metrics_host, "/metrics")
            .await
            .context("start standalone metrics server")?
        {
            Some(server) => info!(address = %server.addr, "standalone metrics server started"),
            None => info!("standalone metrics server skipped under reloader"),
        }
    }

    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .with_context(|| format!("bind application address {listen}"))?;
    info!(address = %listen, "demo application online");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serve demo application")?;
    info!("shutdown complete");
    Ok(())
}

async fn index() -> &'static str {
    "Hello world"
}

async fn skip() -> &'static str {
    "not tracked by the default metrics"
}

async fn long_running() -> &'static str {
    tokio::time::sleep(Duration::from_millis(750)).await;
    "finished"
}

async fn echo_status(Path(status): Path<u16>) -> Response {
    match StatusCode::from_u16(status) {
        Ok(status) => (status, format!("Status: {status}")).into_response(),
        Err(_) => (StatusCode::BAD_REQUEST, "invalid status").into_response(),
    }
}

async fn unavailable() -> (StatusCode, &'static str) {
    (StatusCode::SERVICE_UNAVAILABLE, "service unavailable")
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "ctrl_c listener error");
    }
    info!("Shutdown signal received, exiting");
}

fn init_tracing() -> Result<()> {
    let env_filter =
        std::env::var("RUST_LOG").unwrap_or_else(|_| "info,hyper=warn".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(env_filter))
        .with_target(false)
        .try_init()
        .map_err(|err| anyhow!("tracing subscriber init: {err}"))
}

// Standalone metrics server
// Serves the metrics endpoint on its own listener, separate from the
// instrumented application, on a background tokio task.
//
// Numan Thabit 2025 Nov

use crate::errors::Result;
use crate::exporter::MetricsExporter;
use axum::Router;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// A running standalone server. Dropping it leaves the server running.
#[derive(Debug)]
pub struct MetricsServer {
    pub addr: SocketAddr,
    pub handle: JoinHandle<()>,
}

pub async fn start_http_server(
    exporter: &MetricsExporter,
    port: u16,
    host: &str,
    endpoint: &str,
) -> Result<Option<MetricsServer>> {
    if exporter.env().is_running_from_reloader() {
        info!(port, "running from reloader; standalone metrics server not started");
        return Ok(None);
    }

    let app: Router = Router::new().route(endpoint, exporter.endpoint_route());
    let listener = TcpListener::bind((host, port)).await?;
    let addr = listener.local_addr()?;
    info!(address = %addr, endpoint, "metrics server listening");

    let handle = tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            warn!(error = %err, "metrics server error");
        }
    });
    Ok(Some(MetricsServer { addr, handle }))
}

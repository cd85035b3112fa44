// Metrics exposition endpoint
// Renders the registry (or the merged multiprocess view) in the Prometheus
// text format, optionally restricted to the families named by repeated
// `name[]` query parameters.
//
// Numan Thabit 2025 Nov

use crate::errors::{ExporterError, Result};
use crate::multiprocess::MultiProcessStore;
use axum::extract::{RawQuery, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use prometheus::proto::MetricFamily;
use prometheus::{Encoder, Registry, TextEncoder};
use std::collections::HashSet;
use std::io;
use std::sync::Arc;
use tracing::error;

const SAMPLE_SUFFIXES: [&str; 3] = ["_bucket", "_count", "_sum"];

/// Source of one scrape.
#[derive(Clone)]
pub struct Exposition {
    registry: Registry,
    multiprocess: Option<MultiProcessStore>,
}

impl Exposition {
    pub fn new(registry: Registry, multiprocess: Option<MultiProcessStore>) -> Self {
        Self {
            registry,
            multiprocess,
        }
    }

    pub fn content_type() -> String {
        TextEncoder::new().format_type().to_string()
    }

    /// Encode the current state. `names` restricts the output; an empty list
    /// means everything.
    pub fn render(&self, names: &[String]) -> Result<Vec<u8>> {
        let families = match &self.multiprocess {
            Some(store) => {
                store.flush(&self.registry)?;
                store.merged_families()?
            }
            None => self.registry.gather(),
        };
        let families = restrict(families, names);

        let mut buffer = Vec::new();
        TextEncoder::new().encode(&families, &mut buffer)?;
        Ok(buffer)
    }
}

/// Keep the families that own at least one of the requested sample names.
pub fn restrict(families: Vec<MetricFamily>, names: &[String]) -> Vec<MetricFamily> {
    if names.is_empty() {
        return families;
    }
    let wanted: HashSet<&str> = names.iter().map(String::as_str).collect();
    families
        .into_iter()
        .filter(|family| {
            let name = family.get_name();
            wanted.contains(name)
                || SAMPLE_SUFFIXES
                    .iter()
                    .any(|suffix| wanted.contains(format!("{name}{suffix}").as_str()))
        })
        .collect()
}

/// Values of every `name[]` query parameter, in order.
pub fn requested_names(query: Option<&str>) -> Vec<String> {
    query
        .map(|query| {
            url::form_urlencoded::parse(query.as_bytes())
                .filter(|(key, _)| key == "name[]")
                .map(|(_, value)| value.into_owned())
                .collect()
        })
        .unwrap_or_default()
}

pub async fn metrics_handler(
    State(exposition): State<Arc<Exposition>>,
    RawQuery(query): RawQuery,
) -> Response {
    let names = requested_names(query.as_deref());
    let rendered = match exposition.multiprocess {
        Some(_) => {
            let exposition = exposition.clone();
            tokio::task::spawn_blocking(move || exposition.render(&names))
                .await
                .unwrap_or_else(|err| Err(ExporterError::Io(io::Error::new(io::ErrorKind::Other, err))))
        }
        None => exposition.render(&names),
    };

    match rendered {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, Exposition::content_type())],
            body,
        )
            .into_response(),
        Err(err) => {
            error!(error = %err, "failed to render metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}

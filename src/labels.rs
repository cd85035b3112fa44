// Label resolution for tracked metrics
// Turns an ordered label spec (name -> constant / provider / response
// extractor) into the fixed label schema of a metric and the value
// functions evaluated on every observation.
//
// Numan Thabit 2025 Nov

use crate::errors::{ExporterError, Result};
use axum::http::StatusCode;
use axum::response::Response;
use std::any::Any;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// What a response extractor gets to look at when a label is resolved.
#[derive(Clone, Copy)]
pub enum Outcome<'a> {
    /// Before-actions run ahead of the handler, so there is nothing to inspect yet.
    Pending,
    /// A full HTTP response, either produced by the handler or synthesized for a failure.
    Response(&'a Response),
    /// The raw return value of a nested (non handler-level) call.
    Value(&'a (dyn Any + Send + Sync)),
}

impl<'a> Outcome<'a> {
    pub fn response(&self) -> Option<&'a Response> {
        match *self {
            Outcome::Response(response) => Some(response),
            _ => None,
        }
    }

    /// Status code of the response, or of a raw value that is itself a `StatusCode`.
    pub fn status(&self) -> Option<StatusCode> {
        match *self {
            Outcome::Response(response) => Some(response.status()),
            Outcome::Value(value) => value.downcast_ref::<StatusCode>().copied(),
            Outcome::Pending => None,
        }
    }

    pub fn header(&self, name: &str) -> Option<&'a str> {
        self.response()?.headers().get(name)?.to_str().ok()
    }

    pub fn value<T: Any>(&self) -> Option<&'a T> {
        match *self {
            Outcome::Value(value) => value.downcast_ref::<T>(),
            _ => None,
        }
    }
}

impl fmt::Debug for Outcome<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Pending => f.write_str("Pending"),
            Outcome::Response(response) => write!(f, "Response({})", response.status()),
            Outcome::Value(_) => f.write_str("Value(..)"),
        }
    }
}

type ProviderFn = Arc<dyn Fn() -> String + Send + Sync>;
type ExtractorFn = Arc<dyn Fn(&Outcome<'_>) -> String + Send + Sync>;

/// Source of a single label value. Evaluated at observation time, never at
/// decoration time.
#[derive(Clone)]
pub enum LabelValue {
    Constant(String),
    /// Zero-argument provider, typically reading `request::current_request()`.
    Provider(ProviderFn),
    /// One-argument extractor receiving the call's outcome.
    FromResponse(ExtractorFn),
}

impl LabelValue {
    pub fn constant(value: impl ToString) -> Self {
        LabelValue::Constant(value.to_string())
    }

    pub fn provider<F>(f: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        LabelValue::Provider(Arc::new(f))
    }

    pub fn from_response<F>(f: F) -> Self
    where
        F: Fn(&Outcome<'_>) -> String + Send + Sync + 'static,
    {
        LabelValue::FromResponse(Arc::new(f))
    }

    /// Numeric status code of the outcome; empty while the call is pending.
    pub fn status() -> Self {
        Self::from_response(|outcome| {
            outcome
                .status()
                .map(|status| status.as_u16().to_string())
                .unwrap_or_default()
        })
    }

    /// Value of a response header; empty when absent or not valid UTF-8.
    pub fn header(name: impl Into<String>) -> Self {
        let name = name.into();
        Self::from_response(move |outcome| outcome.header(&name).unwrap_or_default().to_string())
    }

    fn evaluate(&self, outcome: &Outcome<'_>) -> String {
        match self {
            LabelValue::Constant(value) => value.clone(),
            LabelValue::Provider(provider) => provider(),
            LabelValue::FromResponse(extract) => extract(outcome),
        }
    }
}

impl fmt::Debug for LabelValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LabelValue::Constant(value) => f.debug_tuple("Constant").field(value).finish(),
            LabelValue::Provider(_) => f.write_str("Provider(..)"),
            LabelValue::FromResponse(_) => f.write_str("FromResponse(..)"),
        }
    }
}

/// Ordered label spec of a tracked metric. Insertion order becomes the
/// metric's label schema.
#[derive(Clone, Debug, Default)]
pub struct Labels {
    entries: Vec<(String, LabelValue)>,
}

impl Labels {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: LabelValue) -> Self {
        self.entries.push((name.into(), value));
        self
    }

    pub fn constant(self, name: impl Into<String>, value: impl ToString) -> Self {
        self.with(name, LabelValue::constant(value))
    }

    pub fn provider<F>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.with(name, LabelValue::provider(f))
    }

    pub fn from_response<F>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Outcome<'_>) -> String + Send + Sync + 'static,
    {
        self.with(name, LabelValue::from_response(f))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Validate the spec and freeze it into a resolver. A spec that does not
    /// form a mapping (empty or repeated names) is rejected here, at setup.
    pub fn resolve(&self) -> Result<LabelResolver> {
        let mut seen = HashSet::with_capacity(self.entries.len());
        for (name, _) in &self.entries {
            if name.is_empty() {
                return Err(ExporterError::config("label names must not be empty"));
            }
            if !seen.insert(name.as_str()) {
                return Err(ExporterError::config(format!(
                    "labels needs to be a mapping of unique label names, `{name}` is repeated"
                )));
            }
        }

        let (names, sources): (Vec<String>, Vec<LabelValue>) =
            self.entries.iter().cloned().unzip();
        Ok(LabelResolver { names, sources })
    }
}

impl<K: Into<String>> FromIterator<(K, LabelValue)> for Labels {
    fn from_iter<I: IntoIterator<Item = (K, LabelValue)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}

/// Frozen label schema plus value functions, one per name, same order.
#[derive(Clone, Debug)]
pub struct LabelResolver {
    names: Vec<String>,
    sources: Vec<LabelValue>,
}

impl LabelResolver {
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Fresh label values for one observation, aligned with `names()`.
    pub fn values(&self, outcome: &Outcome<'_>) -> Vec<String> {
        self.sources.iter().map(|source| source.evaluate(outcome)).collect()
    }
}

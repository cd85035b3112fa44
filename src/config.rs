// Exporter configuration
// Options accepted by the exporter, plus loading of the process environment
// (multiprocess directory, reloader detection, hostname) and of
// METRICS_* settings through the config crate.
//
// Numan Thabit 2025 Nov

use crate::errors::{ExporterError, Result};
use crate::request::RequestInfo;
use prometheus::Registry;
use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

/// Sentinel prefix value that disables the default metric prefix.
pub const NO_PREFIX: &str = "#no_prefix";
pub const DEFAULT_PREFIX: &str = "axum";
pub const DEFAULT_PATH: &str = "/metrics";
pub const DEFAULT_HOSTNAME: &str = "bayesian-api";

/// Prefix for the default metric names.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Prefix {
    #[default]
    Default,
    None,
    Custom(String),
}

impl Prefix {
    /// Leading part of every default metric name, separator included.
    pub fn render(&self) -> String {
        match self {
            Prefix::Default => format!("{DEFAULT_PREFIX}_"),
            Prefix::None => String::new(),
            Prefix::Custom(prefix) => format!("{prefix}_"),
        }
    }
}

impl From<&str> for Prefix {
    fn from(value: &str) -> Self {
        match value {
            "" => Prefix::Default,
            NO_PREFIX => Prefix::None,
            other => Prefix::Custom(other.to_string()),
        }
    }
}

type GroupFn = Arc<dyn Fn(&RequestInfo) -> String + Send + Sync>;

/// Request property the default metrics are grouped by. The label carrying
/// the group is named after it.
#[derive(Clone, Default)]
pub enum GroupBy {
    #[default]
    Path,
    /// Matched route template, e.g. `/items/:id`.
    UrlRule,
    /// Name given with `MetricsExporter::endpoint`.
    Endpoint,
    Custom { name: String, group: GroupFn },
}

impl GroupBy {
    pub fn custom<F>(name: impl Into<String>, group: F) -> Self
    where
        F: Fn(&RequestInfo) -> String + Send + Sync + 'static,
    {
        GroupBy::Custom {
            name: name.into(),
            group: Arc::new(group),
        }
    }

    pub fn label_name(&self) -> &str {
        match self {
            GroupBy::Path => "path",
            GroupBy::UrlRule => "url_rule",
            GroupBy::Endpoint => "endpoint",
            GroupBy::Custom { name, .. } => name,
        }
    }

    /// Group value for one request; falls back towards the raw path when the
    /// requested property is unknown for this request.
    pub fn value(&self, info: &RequestInfo) -> String {
        match self {
            GroupBy::Path => info.path().to_string(),
            GroupBy::UrlRule => info.url_rule().unwrap_or(info.path()).to_string(),
            GroupBy::Endpoint => info
                .endpoint()
                .or_else(|| info.url_rule().map(str::to_string))
                .unwrap_or_else(|| info.path().to_string()),
            GroupBy::Custom { group, .. } => group(info),
        }
    }
}

impl fmt::Debug for GroupBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupBy::Custom { name, .. } => f.debug_struct("Custom").field("name", name).finish(),
            other => f.write_str(other.label_name()),
        }
    }
}

impl FromStr for GroupBy {
    type Err = ExporterError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "path" => Ok(GroupBy::Path),
            "url_rule" | "rule" => Ok(GroupBy::UrlRule),
            "endpoint" => Ok(GroupBy::Endpoint),
            other => Err(ExporterError::config(format!("unsupported group_by: {other}"))),
        }
    }
}

/// Process environment the exporter reacts to.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuntimeEnv {
    /// Shared snapshot directory; enables multiprocess mode.
    pub prometheus_multiproc_dir: Option<PathBuf>,
    pub hostname: Option<String>,
    /// Any non-empty value lets the endpoint register under the reloader.
    pub debug_metrics: Option<String>,
    /// Set by the auto-reloader in its child process.
    pub run_from_reloader: Option<String>,
}

impl RuntimeEnv {
    pub fn load() -> Result<Self> {
        Self::from_source(config::Environment::default())
    }

    fn from_source(source: config::Environment) -> Result<Self> {
        let cfg = config::Config::builder().add_source(source).build()?;
        Ok(cfg.try_deserialize()?)
    }

    pub fn hostname(&self) -> &str {
        self.hostname.as_deref().unwrap_or(DEFAULT_HOSTNAME)
    }

    pub fn multiprocess_dir(&self) -> Option<&PathBuf> {
        self.prometheus_multiproc_dir.as_ref().filter(|dir| !dir.as_os_str().is_empty())
    }

    pub fn is_running_from_reloader(&self) -> bool {
        is_set(&self.run_from_reloader)
    }

    pub fn debug_metrics(&self) -> bool {
        is_set(&self.debug_metrics)
    }
}

fn is_set(value: &Option<String>) -> bool {
    value.as_deref().map(|v| !v.is_empty()).unwrap_or(false)
}

/// `METRICS_*` settings for binaries that configure the exporter from the
/// environment.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExporterSettings {
    pub path: Option<String>,
    pub export_defaults: Option<bool>,
    pub prefix: Option<String>,
    pub group_by: Option<String>,
    pub buckets: Option<Vec<f64>>,
    /// Port of the standalone metrics server, if one should run.
    pub port: Option<u16>,
    pub host: Option<String>,
    /// Bind address of the instrumented application.
    pub listen: Option<String>,
}

impl ExporterSettings {
    pub fn load() -> Result<Self> {
        Self::from_source(Self::environment())
    }

    fn environment() -> config::Environment {
        config::Environment::with_prefix("METRICS")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("buckets")
    }

    fn from_source(source: config::Environment) -> Result<Self> {
        let cfg = config::Config::builder().add_source(source).build()?;
        Ok(cfg.try_deserialize()?)
    }

    pub fn into_options(self, env: RuntimeEnv) -> Result<MetricsOptions> {
        let group_by = match self.group_by.as_deref() {
            Some(raw) => raw.parse()?,
            None => GroupBy::default(),
        };
        let path = match self.path {
            Some(path) if path.is_empty() => None,
            Some(path) => Some(path),
            None => Some(DEFAULT_PATH.to_string()),
        };

        Ok(MetricsOptions {
            path,
            export_defaults: self.export_defaults.unwrap_or(true),
            prefix: self.prefix.as_deref().map(Prefix::from).unwrap_or_default(),
            group_by,
            buckets: self.buckets,
            registry: Registry::new(),
            env,
        })
    }
}

/// Options for `MetricsExporter::new`.
#[derive(Clone)]
pub struct MetricsOptions {
    /// Where the metrics endpoint is served; `None` skips registering it.
    pub path: Option<String>,
    pub export_defaults: bool,
    pub prefix: Prefix,
    pub group_by: GroupBy,
    /// Latency buckets of the default histogram; `None` keeps the registry defaults.
    pub buckets: Option<Vec<f64>>,
    pub registry: Registry,
    pub env: RuntimeEnv,
}

impl fmt::Debug for MetricsOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsOptions")
            .field("path", &self.path)
            .field("export_defaults", &self.export_defaults)
            .field("prefix", &self.prefix)
            .field("group_by", &self.group_by)
            .field("buckets", &self.buckets)
            .field("env", &self.env)
            .finish_non_exhaustive()
    }
}

impl Default for MetricsOptions {
    fn default() -> Self {
        Self {
            path: Some(DEFAULT_PATH.to_string()),
            export_defaults: true,
            prefix: Prefix::Default,
            group_by: GroupBy::Path,
            buckets: None,
            registry: Registry::new(),
            env: RuntimeEnv::default(),
        }
    }
}

impl MetricsOptions {
    pub fn path(mut self, path: Option<&str>) -> Self {
        self.path = path.map(str::to_string);
        self
    }

    pub fn export_defaults(mut self, enabled: bool) -> Self {
        self.export_defaults = enabled;
        self
    }

    pub fn prefix(mut self, prefix: impl Into<Prefix>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn group_by(mut self, group_by: GroupBy) -> Self {
        self.group_by = group_by;
        self
    }

    pub fn buckets(mut self, buckets: Vec<f64>) -> Self {
        self.buckets = Some(buckets);
        self
    }

    pub fn registry(mut self, registry: Registry) -> Self {
        self.registry = registry;
        self
    }

    pub fn env(mut self, env: RuntimeEnv) -> Self {
        self.env = env;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    fn source(vars: &[(&str, &str)]) -> config::Map<String, String> {
        vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn prefix_rendering() {
        assert_eq!(Prefix::from("").render(), "axum_");
        assert_eq!(Prefix::from(NO_PREFIX).render(), "");
        assert_eq!(Prefix::from("svc").render(), "svc_");
    }

    #[test]
    fn group_by_parsing() {
        assert!(matches!("path".parse::<GroupBy>().unwrap(), GroupBy::Path));
        assert!(matches!("URL_RULE".parse::<GroupBy>().unwrap(), GroupBy::UrlRule));
        assert!(matches!("endpoint".parse::<GroupBy>().unwrap(), GroupBy::Endpoint));
        assert!(matches!(
            "query".parse::<GroupBy>(),
            Err(ExporterError::Configuration(_))
        ));
    }

    #[test]
    fn group_values_fall_back_to_the_path() {
        let req = Request::builder().uri("/items/3").body(()).unwrap();
        let info = RequestInfo::from_request(&req);
        assert_eq!(GroupBy::Path.value(&info), "/items/3");
        assert_eq!(GroupBy::UrlRule.value(&info), "/items/3");
        assert_eq!(GroupBy::Endpoint.value(&info), "/items/3");

        let custom = GroupBy::custom("first_segment", |info| {
            info.path().split('/').nth(1).unwrap_or_default().to_string()
        });
        assert_eq!(custom.label_name(), "first_segment");
        assert_eq!(custom.value(&info), "items");
    }

    #[test]
    fn runtime_env_from_variables() {
        let env = RuntimeEnv::from_source(config::Environment::default().source(Some(source(&[
            ("PROMETHEUS_MULTIPROC_DIR", "/tmp/metrics"),
            ("RUN_FROM_RELOADER", "true"),
        ]))))
        .unwrap();

        assert_eq!(env.multiprocess_dir(), Some(&PathBuf::from("/tmp/metrics")));
        assert!(env.is_running_from_reloader());
        assert!(!env.debug_metrics());
        assert_eq!(env.hostname(), DEFAULT_HOSTNAME);
    }

    #[test]
    fn settings_from_variables() {
        let settings = ExporterSettings::from_source(ExporterSettings::environment().source(Some(source(&[
            ("METRICS_PATH", "/internal/metrics"),
            ("METRICS_EXPORT_DEFAULTS", "false"),
            ("METRICS_PREFIX", NO_PREFIX),
            ("METRICS_GROUP_BY", "url_rule"),
            ("METRICS_BUCKETS", "0.1,0.5,1"),
            ("METRICS_PORT", "9100"),
        ]))))
        .unwrap();

        assert_eq!(settings.port, Some(9100));
        let options = settings.into_options(RuntimeEnv::default()).unwrap();
        assert_eq!(options.path.as_deref(), Some("/internal/metrics"));
        assert!(!options.export_defaults);
        assert_eq!(options.prefix, Prefix::None);
        assert!(matches!(options.group_by, GroupBy::UrlRule));
        assert_eq!(options.buckets, Some(vec![0.1, 0.5, 1.0]));
    }

    #[test]
    fn empty_settings_keep_defaults() {
        let options = ExporterSettings::default().into_options(RuntimeEnv::default()).unwrap();
        assert_eq!(options.path.as_deref(), Some(DEFAULT_PATH));
        assert!(options.export_defaults);
        assert_eq!(options.prefix, Prefix::Default);
        assert!(options.buckets.is_none());
    }
}

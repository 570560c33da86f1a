//! Instance configuration: the raw serde schema, defaults merging and the
//! resolved [`ScraperConfig`] handed to the scraper.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use http::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, AUTHORIZATION};
use http::Uri;
use regex::{Regex, RegexSet};
use serde::Deserialize;

use crate::error::ConfigError;
use crate::model::{MetricFamily, MetricType};
use crate::parser;

pub const KUBERNETES_TOKEN_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";

const DEFAULT_TIMEOUT_SECS: f64 = 10.0;
const DEFAULT_COLLECTION_INTERVAL_SECS: u64 = 15;

/// A check file: shared `init_config` plus one entry per monitored endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CheckFile {
    #[serde(default)]
    pub init_config: InitConfig,
    #[serde(default)]
    pub instances: Vec<InstanceConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InitConfig {
    /// Namespace used by instances that do not set one.
    pub default_namespace: Option<String>,
    /// Per-namespace option defaults, overridden field by field by each instance.
    #[serde(default)]
    pub default_instances: HashMap<String, InstanceConfig>,
}

impl CheckFile {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<CheckFile, ConfigError> {
        let s = fs::read_to_string(path)?;
        Self::load_from_str(&s)
    }

    pub fn load_from_str(s: &str) -> Result<CheckFile, ConfigError> {
        Ok(serde_yaml::from_str(s)?)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MetricSpec {
    Name(String),
    Renamed(BTreeMap<String, String>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LabelJoinConfig {
    #[serde(default)]
    pub labels_to_match: Vec<String>,
    /// Older single-label spelling of `labels_to_match`.
    pub label_to_match: Option<OneOrMany>,
    #[serde(default)]
    pub labels_to_get: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstanceConfig {
    #[serde(alias = "prometheus_url")]
    pub endpoint_url: Option<String>,
    pub openmetrics_endpoint: Option<String>,
    pub namespace: Option<String>,
    #[serde(default)]
    pub metrics: Vec<MetricSpec>,
    pub prometheus_metrics_prefix: Option<String>,
    #[serde(default)]
    pub label_joins: BTreeMap<String, LabelJoinConfig>,
    #[serde(default)]
    pub labels_mapper: BTreeMap<String, String>,
    #[serde(default)]
    pub exclude_labels: Vec<String>,
    #[serde(default)]
    pub include_labels: Vec<String>,
    #[serde(default)]
    pub type_overrides: BTreeMap<String, String>,
    pub ignore_metrics: Option<Vec<String>>,
    pub ignore_metrics_by_labels: Option<BTreeMap<String, Vec<String>>>,
    pub send_histograms_buckets: Option<bool>,
    pub non_cumulative_buckets: Option<bool>,
    /// Sends buckets as distribution buckets; forces `non_cumulative_buckets`.
    pub send_distribution_buckets: Option<bool>,
    pub send_monotonic_counter: Option<bool>,
    pub send_monotonic_with_gauge: Option<bool>,
    pub send_distribution_counts_as_monotonic: Option<bool>,
    pub send_distribution_sums_as_monotonic: Option<bool>,
    pub health_service_check: Option<bool>,
    pub telemetry: Option<bool>,
    /// Flush first counter values when the endpoint's process started after this one.
    pub use_process_start_time: Option<bool>,
    pub ssl_cert: Option<PathBuf>,
    pub ssl_private_key: Option<PathBuf>,
    pub ssl_ca_cert: Option<PathBuf>,
    pub ssl_verify: Option<bool>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub bearer_token_auth: Option<bool>,
    pub bearer_token_path: Option<PathBuf>,
    #[serde(default)]
    pub extra_headers: BTreeMap<String, String>,
    /// Seconds.
    pub prometheus_timeout: Option<f64>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub ignore_tags: Option<Vec<String>>,
    pub label_to_hostname: Option<String>,
    pub label_to_hostname_suffix: Option<String>,
    pub metadata_metric_name: Option<String>,
    pub metadata_label_map: Option<BTreeMap<String, String>>,
    /// Seconds between two scrapes of this instance when run by the CLI.
    pub min_collection_interval: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LabelJoin {
    /// Sorted, deduplicated. `["*"]` matches every sample.
    pub labels_to_match: Vec<String>,
    pub labels_to_get: Vec<String>,
}

impl LabelJoin {
    pub fn match_all(&self) -> bool {
        self.labels_to_match.iter().any(|l| l == "*")
    }

    pub fn get_all(&self) -> bool {
        self.labels_to_get.iter().any(|l| l == "*")
    }

    /// Key under which the joined labels of this donor are cached.
    pub fn mapping_key(&self) -> String {
        if self.match_all() {
            "*".to_string()
        } else {
            self.labels_to_match.join(",")
        }
    }
}

#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub cert: Option<PathBuf>,
    pub private_key: Option<PathBuf>,
    pub ca_cert: Option<PathBuf>,
    pub verify: bool,
}

#[derive(Debug, Clone)]
pub struct BasicAuth {
    pub username: String,
    pub password: Option<String>,
}

/// Fully resolved configuration for one endpoint.
#[derive(Debug, Clone)]
pub struct ScraperConfig {
    pub endpoint: String,
    pub namespace: String,
    /// Exact source name to destination name.
    pub metrics_mapper: HashMap<String, String>,
    /// Glob keys of `metrics`, in declaration order.
    pub wildcards: Vec<String>,
    wildcards_re: Option<RegexSet>,
    pub prometheus_metrics_prefix: String,
    pub label_joins: BTreeMap<String, LabelJoin>,
    pub ignore_metrics: HashSet<String>,
    ignored_re: Option<RegexSet>,
    pub ignore_metrics_by_labels: BTreeMap<String, Vec<String>>,
    pub send_histograms_buckets: bool,
    pub non_cumulative_buckets: bool,
    pub send_distribution_buckets: bool,
    pub send_monotonic_counter: bool,
    pub send_monotonic_with_gauge: bool,
    pub send_distribution_counts_as_monotonic: bool,
    pub send_distribution_sums_as_monotonic: bool,
    pub labels_mapper: HashMap<String, String>,
    pub exclude_labels: HashSet<String>,
    pub include_labels: HashSet<String>,
    pub type_overrides: HashMap<String, MetricType>,
    type_override_patterns: Vec<(Regex, MetricType)>,
    pub label_to_hostname: Option<String>,
    pub label_to_hostname_suffix: Option<String>,
    pub health_service_check: bool,
    pub telemetry: bool,
    pub use_process_start_time: bool,
    /// Set by the scraper once the first pass is through.
    flush_first_value: bool,
    pub tls: TlsConfig,
    pub basic_auth: Option<BasicAuth>,
    pub headers: HeaderMap,
    pub timeout: Duration,
    pub custom_tags: Vec<String>,
    /// Lines containing any of these substrings are dropped before parsing.
    pub text_filter_blacklist: Vec<String>,
    pub metadata_metric_name: Option<String>,
    pub metadata_label_map: BTreeMap<String, String>,
    pub collection_interval: Duration,
}

/// Check-level defaults consulted by [`configure`].
#[derive(Debug, Clone, Default)]
pub struct CheckDefaults {
    pub default_namespace: Option<String>,
    pub default_instances: HashMap<String, InstanceConfig>,
}

impl From<InitConfig> for CheckDefaults {
    fn from(init: InitConfig) -> Self {
        Self {
            default_namespace: init.default_namespace,
            default_instances: init.default_instances,
        }
    }
}

fn pick<T: Clone>(instance: &Option<T>, default: &Option<T>) -> Option<T> {
    instance.clone().or_else(|| default.clone())
}

/// Translates a shell glob (`*`, `?`) into an anchored regular expression.
pub(crate) fn glob_to_regex(glob: &str) -> String {
    let mut out = String::with_capacity(glob.len() + 8);
    out.push('^');
    for c in glob.chars() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            c => out.push_str(&regex::escape(&c.to_string())),
        }
    }
    out.push('$');
    out
}

fn compile_glob_set(globs: &[String]) -> Result<Option<RegexSet>, ConfigError> {
    if globs.is_empty() {
        return Ok(None);
    }
    let patterns: Vec<String> = globs.iter().map(|g| glob_to_regex(g)).collect();
    RegexSet::new(&patterns)
        .map(Some)
        .map_err(|source| ConfigError::InvalidPattern {
            pattern: globs.join(","),
            source,
        })
}

fn compile_glob(glob: &str) -> Result<Regex, ConfigError> {
    Regex::new(&glob_to_regex(glob)).map_err(|source| ConfigError::InvalidPattern {
        pattern: glob.to_string(),
        source,
    })
}

fn resolve_endpoint(url: &str) -> Result<String, ConfigError> {
    let uri: Uri = url.parse().map_err(|e: http::uri::InvalidUri| ConfigError::InvalidEndpoint {
        url: url.to_string(),
        reason: e.to_string(),
    })?;
    match uri.scheme_str() {
        Some("http") | Some("https") => Ok(url.to_string()),
        _ => Err(ConfigError::InvalidEndpoint {
            url: url.to_string(),
            reason: "scheme must be http or https".to_string(),
        }),
    }
}

fn resolve_label_joins(
    default: &BTreeMap<String, LabelJoinConfig>,
    instance: &BTreeMap<String, LabelJoinConfig>,
) -> BTreeMap<String, LabelJoin> {
    let mut merged = default.clone();
    merged.extend(instance.clone());

    let mut joins = BTreeMap::new();
    for (donor, join) in merged {
        let mut labels = join.labels_to_match.clone();
        if labels.is_empty() {
            if let Some(legacy) = join.label_to_match {
                tracing::warn!("`label_to_match` is being deprecated, please use `labels_to_match`");
                labels = match legacy {
                    OneOrMany::One(label) => vec![label],
                    OneOrMany::Many(labels) => labels,
                };
            }
        }
        if labels.is_empty() {
            tracing::warn!("label join on `{}` has no label to match, ignoring it", donor);
            continue;
        }
        labels.sort();
        labels.dedup();
        joins.insert(
            donor,
            LabelJoin {
                labels_to_match: labels,
                labels_to_get: join.labels_to_get,
            },
        );
    }
    joins
}

fn read_bearer_token(path: &Path) -> Result<String, ConfigError> {
    let token = fs::read_to_string(path).map_err(|source| {
        tracing::error!("cannot get bearer token from path {}: {}", path.display(), source);
        ConfigError::BearerToken {
            path: path.display().to_string(),
            source,
        }
    })?;
    Ok(token.trim_end().to_string())
}

fn header_error(name: &str, reason: impl ToString) -> ConfigError {
    ConfigError::InvalidHeader {
        name: name.to_string(),
        reason: reason.to_string(),
    }
}

fn build_headers(
    extra: &BTreeMap<String, String>,
    bearer_token: Option<&str>,
) -> Result<HeaderMap, ConfigError> {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("text/plain"));
    for (name, value) in extra {
        let header_name =
            HeaderName::from_bytes(name.as_bytes()).map_err(|e| header_error(name, e))?;
        let header_value = HeaderValue::from_str(value).map_err(|e| header_error(name, e))?;
        headers.insert(header_name, header_value);
    }
    if let Some(token) = bearer_token {
        let value = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|e| header_error("authorization", e))?;
        headers.insert(AUTHORIZATION, value);
    }
    Ok(headers)
}

/// Resolves one instance against the check defaults. Fails before any network activity.
pub fn configure(
    instance: &InstanceConfig,
    defaults: &CheckDefaults,
) -> Result<ScraperConfig, ConfigError> {
    if instance.openmetrics_endpoint.is_some() {
        return Err(ConfigError::UnsupportedOption("openmetrics_endpoint"));
    }

    let endpoint = instance
        .endpoint_url
        .as_deref()
        .ok_or(ConfigError::MissingEndpoint)?;
    let endpoint = resolve_endpoint(endpoint)?;

    let namespace = instance
        .namespace
        .clone()
        .or_else(|| defaults.default_namespace.clone())
        .ok_or(ConfigError::MissingNamespace)?;

    let fallback = InstanceConfig::default();
    let default = defaults.default_instances.get(&namespace).unwrap_or(&fallback);

    let mut metrics_mapper = HashMap::new();
    let mut wildcards = Vec::new();
    for entry in default.metrics.iter().chain(instance.metrics.iter()) {
        let pairs: Vec<(String, String)> = match entry {
            MetricSpec::Name(name) => vec![(name.clone(), name.clone())],
            MetricSpec::Renamed(map) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        };
        for (source, destination) in pairs {
            if source.contains('*') {
                if !wildcards.contains(&source) {
                    wildcards.push(source.clone());
                }
            }
            metrics_mapper.insert(source, destination);
        }
    }
    let wildcards_re = compile_glob_set(&wildcards)?;

    let mut ignore_metrics = HashSet::new();
    let mut ignored_patterns = Vec::new();
    for metric in pick(&instance.ignore_metrics, &default.ignore_metrics).unwrap_or_default() {
        if metric.contains('*') {
            ignored_patterns.push(metric);
        } else {
            ignore_metrics.insert(metric);
        }
    }
    let ignored_re = compile_glob_set(&ignored_patterns)?;

    let mut labels_mapper: HashMap<String, String> = default.labels_mapper.clone().into_iter().collect();
    labels_mapper.extend(instance.labels_mapper.clone());
    labels_mapper.insert("le".to_string(), "upper_bound".to_string());

    let mut raw_overrides = default.type_overrides.clone();
    raw_overrides.extend(instance.type_overrides.clone());
    let mut type_overrides = HashMap::new();
    let mut type_override_patterns = Vec::new();
    for (metric, kind) in raw_overrides {
        let kind: MetricType = kind.parse().unwrap_or(MetricType::Untyped);
        if metric.contains('*') {
            type_override_patterns.push((compile_glob(&metric)?, kind));
        } else {
            type_overrides.insert(metric, kind);
        }
    }

    let mut custom_tags = instance.tags.clone();
    let ignore_tags = pick(&instance.ignore_tags, &default.ignore_tags).unwrap_or_default();
    if !ignore_tags.is_empty() {
        let joined = ignore_tags.join("|");
        let ignored_tags_re = Regex::new(&joined).map_err(|source| ConfigError::InvalidPattern {
            pattern: joined.clone(),
            source,
        })?;
        custom_tags.retain(|tag| !ignored_tags_re.is_match(tag));
    }

    let bearer_token = if pick(&instance.bearer_token_auth, &default.bearer_token_auth).unwrap_or(false)
    {
        let path = pick(&instance.bearer_token_path, &default.bearer_token_path)
            .unwrap_or_else(|| PathBuf::from(KUBERNETES_TOKEN_PATH));
        Some(read_bearer_token(&path)?)
    } else {
        None
    };

    let mut extra_headers = default.extra_headers.clone();
    extra_headers.extend(instance.extra_headers.clone());
    let headers = build_headers(&extra_headers, bearer_token.as_deref())?;

    let timeout_secs = pick(&instance.prometheus_timeout, &default.prometheus_timeout)
        .unwrap_or(DEFAULT_TIMEOUT_SECS);
    if timeout_secs <= 0.0 {
        return Err(ConfigError::InvalidTimeout(timeout_secs));
    }
    let timeout = Duration::try_from_secs_f64(timeout_secs)
        .map_err(|_| ConfigError::InvalidTimeout(timeout_secs))?;

    let basic_auth = pick(&instance.username, &default.username).map(|username| BasicAuth {
        username,
        password: pick(&instance.password, &default.password),
    });

    let metadata_metric_name = pick(&instance.metadata_metric_name, &default.metadata_metric_name);
    let metadata_label_map =
        pick(&instance.metadata_label_map, &default.metadata_label_map).unwrap_or_default();

    let flag = |i: Option<bool>, d: Option<bool>, fallback: bool| i.or(d).unwrap_or(fallback);
    let send_distribution_buckets = flag(
        instance.send_distribution_buckets,
        default.send_distribution_buckets,
        false,
    );

    Ok(ScraperConfig {
        endpoint,
        metrics_mapper,
        wildcards,
        wildcards_re,
        prometheus_metrics_prefix: pick(
            &instance.prometheus_metrics_prefix,
            &default.prometheus_metrics_prefix,
        )
        .unwrap_or_default(),
        label_joins: resolve_label_joins(&default.label_joins, &instance.label_joins),
        ignore_metrics,
        ignored_re,
        ignore_metrics_by_labels: pick(
            &instance.ignore_metrics_by_labels,
            &default.ignore_metrics_by_labels,
        )
        .unwrap_or_default(),
        send_histograms_buckets: flag(
            instance.send_histograms_buckets,
            default.send_histograms_buckets,
            true,
        ),
        // distribution buckets need per-bucket counts
        non_cumulative_buckets: send_distribution_buckets
            || flag(
                instance.non_cumulative_buckets,
                default.non_cumulative_buckets,
                false,
            ),
        send_distribution_buckets,
        send_monotonic_counter: flag(
            instance.send_monotonic_counter,
            default.send_monotonic_counter,
            true,
        ),
        send_monotonic_with_gauge: flag(
            instance.send_monotonic_with_gauge,
            default.send_monotonic_with_gauge,
            false,
        ),
        send_distribution_counts_as_monotonic: flag(
            instance.send_distribution_counts_as_monotonic,
            default.send_distribution_counts_as_monotonic,
            false,
        ),
        send_distribution_sums_as_monotonic: flag(
            instance.send_distribution_sums_as_monotonic,
            default.send_distribution_sums_as_monotonic,
            false,
        ),
        labels_mapper,
        exclude_labels: default
            .exclude_labels
            .iter()
            .chain(instance.exclude_labels.iter())
            .cloned()
            .collect(),
        include_labels: default
            .include_labels
            .iter()
            .chain(instance.include_labels.iter())
            .cloned()
            .collect(),
        type_overrides,
        type_override_patterns,
        label_to_hostname: pick(&instance.label_to_hostname, &default.label_to_hostname),
        label_to_hostname_suffix: pick(
            &instance.label_to_hostname_suffix,
            &default.label_to_hostname_suffix,
        ),
        health_service_check: flag(
            instance.health_service_check,
            default.health_service_check,
            true,
        ),
        telemetry: flag(instance.telemetry, default.telemetry, false),
        use_process_start_time: flag(
            instance.use_process_start_time,
            default.use_process_start_time,
            false,
        ),
        flush_first_value: false,
        tls: TlsConfig {
            cert: pick(&instance.ssl_cert, &default.ssl_cert),
            private_key: pick(&instance.ssl_private_key, &default.ssl_private_key),
            ca_cert: pick(&instance.ssl_ca_cert, &default.ssl_ca_cert),
            verify: flag(instance.ssl_verify, default.ssl_verify, true),
        },
        basic_auth,
        headers,
        timeout,
        custom_tags,
        text_filter_blacklist: Vec::new(),
        metadata_metric_name,
        metadata_label_map,
        collection_interval: Duration::from_secs(
            pick(&instance.min_collection_interval, &default.min_collection_interval)
                .unwrap_or(DEFAULT_COLLECTION_INTERVAL_SECS),
        ),
        namespace,
    })
}

impl ScraperConfig {
    pub fn metric_name_with_namespace(&self, metric_name: &str) -> String {
        if self.namespace.is_empty() {
            metric_name.to_string()
        } else {
            format!("{}.{}", self.namespace, metric_name)
        }
    }

    pub fn telemetry_metric_name(&self, metric_name: &str) -> String {
        if self.namespace.is_empty() {
            format!("telemetry.{}", metric_name)
        } else {
            format!("{}.telemetry.{}", self.namespace, metric_name)
        }
    }

    pub fn health_service_check_name(&self) -> String {
        self.metric_name_with_namespace("prometheus.health")
    }

    /// Whether monotonic counts submit their first value instead of using it as a baseline.
    pub fn flush_first_value(&self) -> bool {
        self.flush_first_value
    }

    pub(crate) fn set_flush_first_value(&mut self, flush: bool) {
        self.flush_first_value = flush;
    }

    pub fn matches_wildcard(&self, metric_name: &str) -> bool {
        self.wildcards_re
            .as_ref()
            .map_or(false, |re| re.is_match(metric_name))
    }

    pub fn is_ignored(&self, metric_name: &str) -> bool {
        self.ignore_metrics.contains(metric_name)
            || self
                .ignored_re
                .as_ref()
                .map_or(false, |re| re.is_match(metric_name))
    }

    pub fn is_blacklisted(&self, line: &str) -> bool {
        self.text_filter_blacklist
            .iter()
            .any(|item| line.contains(item.as_str()))
    }

    /// Applies type overrides, drops unsupported families and strips the metrics prefix.
    pub fn prepare_family(&self, mut family: MetricFamily) -> Option<MetricFamily> {
        if let Some(kind) = self.type_overrides.get(&family.name) {
            family.kind = *kind;
        } else if let Some((_, kind)) = self
            .type_override_patterns
            .iter()
            .find(|(re, _)| re.is_match(&family.name))
        {
            family.kind = *kind;
        }

        if !family.kind.is_supported() {
            tracing::error!(
                "Metric type {} unsupported for metric {}, dropping it",
                family.kind,
                family.name
            );
            return None;
        }

        if !self.prometheus_metrics_prefix.is_empty() {
            if let Some(stripped) = family.name.strip_prefix(&self.prometheus_metrics_prefix) {
                family.name = stripped.to_string();
            }
        }
        Some(family)
    }

    /// Lazy family sequence over raw payload lines, with filtering and overrides applied.
    pub fn parse_metric_families<'a, I>(&'a self, lines: I) -> impl Iterator<Item = MetricFamily> + 'a
    where
        I: IntoIterator + 'a,
        I::IntoIter: 'a,
        I::Item: AsRef<str>,
    {
        let lines = lines
            .into_iter()
            .filter(move |line| !self.is_blacklisted(line.as_ref()));
        parser::parse_families(lines).filter_map(move |family| self.prepare_family(family))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(yaml: &str) -> InstanceConfig {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn missing_endpoint_fails_before_anything_else() {
        let err = configure(&instance("namespace: app"), &CheckDefaults::default()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEndpoint));
    }

    #[test]
    fn missing_namespace_uses_check_default() {
        let inst = instance("endpoint_url: http://localhost:9090/metrics");
        let err = configure(&inst, &CheckDefaults::default()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingNamespace));

        let defaults = CheckDefaults {
            default_namespace: Some("app".into()),
            ..Default::default()
        };
        let config = configure(&inst, &defaults).unwrap();
        assert_eq!(config.namespace, "app");
        assert_eq!(config.timeout, Duration::from_secs(10));
        assert!(config.send_histograms_buckets);
        assert!(config.send_monotonic_counter);
        assert!(config.health_service_check);
        assert_eq!(config.labels_mapper.get("le").map(String::as_str), Some("upper_bound"));
    }

    #[test]
    fn invalid_endpoint_scheme() {
        let inst = instance("endpoint_url: ftp://host/metrics\nnamespace: app");
        assert!(matches!(
            configure(&inst, &CheckDefaults::default()),
            Err(ConfigError::InvalidEndpoint { .. })
        ));
    }

    #[test]
    fn openmetrics_endpoint_is_rejected() {
        let inst = instance("openmetrics_endpoint: http://host/metrics\nnamespace: app");
        assert!(matches!(
            configure(&inst, &CheckDefaults::default()),
            Err(ConfigError::UnsupportedOption("openmetrics_endpoint"))
        ));
    }

    #[test]
    fn defaults_are_merged_per_namespace() {
        let default = instance(
            r#"
metrics: [process_cpu_seconds_total]
labels_mapper: { pod: kube_pod }
exclude_labels: [instance]
send_monotonic_counter: false
prometheus_timeout: 3
"#,
        );
        let defaults = CheckDefaults {
            default_namespace: None,
            default_instances: [("app".to_string(), default)].into_iter().collect(),
        };
        let inst = instance(
            r#"
endpoint_url: http://localhost:9090/metrics
namespace: app
metrics:
  - go_goroutines: goroutines
  - "http_*"
exclude_labels: [job]
labels_mapper: { le: bucket }
"#,
        );
        let config = configure(&inst, &defaults).unwrap();
        assert_eq!(
            config.metrics_mapper.get("process_cpu_seconds_total").map(String::as_str),
            Some("process_cpu_seconds_total")
        );
        assert_eq!(
            config.metrics_mapper.get("go_goroutines").map(String::as_str),
            Some("goroutines")
        );
        assert_eq!(config.wildcards, vec!["http_*".to_string()]);
        assert!(config.matches_wildcard("http_requests_total"));
        assert!(!config.matches_wildcard("xhttp_requests_total"));
        assert!(config.exclude_labels.contains("instance"));
        assert!(config.exclude_labels.contains("job"));
        assert_eq!(config.labels_mapper.get("pod").map(String::as_str), Some("kube_pod"));
        // always renamed, whatever the instance says
        assert_eq!(config.labels_mapper.get("le").map(String::as_str), Some("upper_bound"));
        assert!(!config.send_monotonic_counter);
        assert_eq!(config.timeout, Duration::from_secs(3));
    }

    #[test]
    fn timeout_out_of_range_is_rejected() {
        for timeout in &["0", "-1", "1e20", ".nan", ".inf"] {
            let inst = instance(&format!(
                "endpoint_url: http://localhost/metrics\nnamespace: app\nprometheus_timeout: {}",
                timeout
            ));
            assert!(
                matches!(
                    configure(&inst, &CheckDefaults::default()),
                    Err(ConfigError::InvalidTimeout(_))
                ),
                "prometheus_timeout {} accepted",
                timeout
            );
        }
        let inst = instance("endpoint_url: http://localhost/metrics\nnamespace: app\nprometheus_timeout: 0.25");
        let config = configure(&inst, &CheckDefaults::default()).unwrap();
        assert_eq!(config.timeout, Duration::from_millis(250));
    }

    #[test]
    fn distribution_buckets_force_non_cumulative() {
        let inst = instance(
            r#"
endpoint_url: http://localhost/metrics
namespace: app
send_distribution_buckets: true
non_cumulative_buckets: false
use_process_start_time: true
"#,
        );
        let config = configure(&inst, &CheckDefaults::default()).unwrap();
        assert!(config.send_distribution_buckets);
        assert!(config.non_cumulative_buckets);
        assert!(config.use_process_start_time);
        assert!(!config.flush_first_value());
    }

    #[test]
    fn label_joins_accept_both_spellings() {
        let inst = instance(
            r#"
endpoint_url: http://localhost/metrics
namespace: ksm
label_joins:
  kube_pod_info:
    label_to_match: pod
    labels_to_get: [node, pod_ip]
  kube_persistentvolumeclaim_info:
    labels_to_match: [persistentvolumeclaim, namespace]
    labels_to_get: [storageclass]
  broken:
    labels_to_get: [x]
"#,
        );
        let config = configure(&inst, &CheckDefaults::default()).unwrap();
        assert_eq!(config.label_joins.len(), 2);
        assert_eq!(config.label_joins["kube_pod_info"].mapping_key(), "pod");
        assert_eq!(
            config.label_joins["kube_persistentvolumeclaim_info"].mapping_key(),
            "namespace,persistentvolumeclaim"
        );
    }

    #[test]
    fn type_overrides_and_prefix() {
        let inst = instance(
            r#"
endpoint_url: http://localhost/metrics
namespace: app
prometheus_metrics_prefix: myapp_
type_overrides:
  myapp_untyped_one: gauge
  "myapp_wild_*": counter
"#,
        );
        let config = configure(&inst, &CheckDefaults::default()).unwrap();
        let payload = "myapp_untyped_one 1\nmyapp_wild_thing 2\nmyapp_other 3\n";
        let families: Vec<_> = config.parse_metric_families(payload.lines()).collect();
        let got: Vec<_> = families.iter().map(|f| (f.name.as_str(), f.kind)).collect();
        assert_eq!(
            got,
            vec![("untyped_one", MetricType::Gauge), ("wild_thing", MetricType::Counter)]
        );
    }

    #[test]
    fn ignore_tags_filter_custom_tags() {
        let inst = instance(
            r#"
endpoint_url: http://localhost/metrics
namespace: app
tags: ["env:prod", "pod_name:x-1", "team:core"]
ignore_tags: ["^pod_name:"]
"#,
        );
        let config = configure(&inst, &CheckDefaults::default()).unwrap();
        assert_eq!(config.custom_tags, vec!["env:prod".to_string(), "team:core".to_string()]);
    }

    #[test]
    fn missing_bearer_token_file_is_a_config_error() {
        let inst = instance(
            r#"
endpoint_url: https://localhost/metrics
namespace: app
bearer_token_auth: true
bearer_token_path: /nonexistent/token
"#,
        );
        assert!(matches!(
            configure(&inst, &CheckDefaults::default()),
            Err(ConfigError::BearerToken { .. })
        ));
    }

    #[test]
    fn deny_unknown_fields() {
        let bad = r#"
instances:
  - endpoint_url: http://localhost/metrics
    namspace: typo
"#;
        assert!(matches!(CheckFile::load_from_str(bad), Err(ConfigError::Yaml(_))));
    }
}

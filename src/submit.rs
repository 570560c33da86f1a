//! Submission of parsed families to the aggregator.
//!
//! [`Submitter`] is the call contract of the host aggregator. Everything else
//! in this module turns one [`MetricFamily`] into calls on it according to the
//! family type and the instance configuration.

use std::collections::HashMap;

use chrono::Utc;
use tokio::sync::broadcast;

use crate::config::ScraperConfig;
use crate::model::{
    Labels, MetricFamily, MetricType, Sample, ServiceCheckStatus, Submission, SubmissionKind,
};
use crate::parser::parse_golang_float;

pub trait Submitter: Send {
    fn submit(&mut self, submission: Submission);

    fn gauge(&mut self, name: &str, value: f64, tags: &[String], hostname: Option<&str>) {
        self.metric(SubmissionKind::Gauge, name, value, tags, hostname);
    }

    fn monotonic_count(
        &mut self,
        name: &str,
        value: f64,
        tags: &[String],
        hostname: Option<&str>,
        flush_first_value: bool,
    ) {
        self.submit(Submission::Metric {
            kind: SubmissionKind::MonotonicCount,
            name: name.to_string(),
            value,
            tags: tags.to_vec(),
            hostname: hostname.map(str::to_string),
            flush_first_value,
            timestamp: Utc::now(),
        });
    }

    fn rate(&mut self, name: &str, value: f64, tags: &[String], hostname: Option<&str>) {
        self.metric(SubmissionKind::Rate, name, value, tags, hostname);
    }

    fn count(&mut self, name: &str, value: f64, tags: &[String], hostname: Option<&str>) {
        self.metric(SubmissionKind::Count, name, value, tags, hostname);
    }

    /// Always monotonic: buckets come from counters.
    fn histogram_bucket(
        &mut self,
        name: &str,
        value: f64,
        (lower_bound, upper_bound): (f64, f64),
        tags: &[String],
        hostname: Option<&str>,
        flush_first_value: bool,
    ) {
        self.submit(Submission::HistogramBucket {
            name: name.to_string(),
            value,
            lower_bound,
            upper_bound,
            monotonic: true,
            tags: tags.to_vec(),
            hostname: hostname.map(str::to_string),
            flush_first_value,
            timestamp: Utc::now(),
        });
    }

    fn service_check(&mut self, name: &str, status: ServiceCheckStatus, tags: &[String]) {
        self.submit(Submission::ServiceCheck {
            name: name.to_string(),
            status,
            tags: tags.to_vec(),
            timestamp: Utc::now(),
        });
    }

    fn set_metadata(&mut self, name: &str, value: &str) {
        self.submit(Submission::Metadata {
            name: name.to_string(),
            value: value.to_string(),
        });
    }

    fn metric(
        &mut self,
        kind: SubmissionKind,
        name: &str,
        value: f64,
        tags: &[String],
        hostname: Option<&str>,
    ) {
        self.submit(Submission::Metric {
            kind,
            name: name.to_string(),
            value,
            tags: tags.to_vec(),
            hostname: hostname.map(str::to_string),
            flush_first_value: false,
            timestamp: Utc::now(),
        });
    }
}

/// Records every call, in order.
impl Submitter for Vec<Submission> {
    fn submit(&mut self, submission: Submission) {
        self.push(submission);
    }
}

/// Forwards submissions to whatever is listening on the channel.
#[derive(Debug, Clone)]
pub struct ChannelSubmitter {
    sender: broadcast::Sender<Submission>,
}

impl ChannelSubmitter {
    pub fn new(sender: broadcast::Sender<Submission>) -> Self {
        Self { sender }
    }
}

impl Submitter for ChannelSubmitter {
    fn submit(&mut self, submission: Submission) {
        if self.sender.send(submission).is_err() {
            tracing::debug!("no receiver for submission, dropping it");
        }
    }
}

pub(crate) fn is_value_valid(value: f64) -> bool {
    value.is_finite()
}

/// Formats a bucket bound or quantile the same way whatever its spelling in the payload.
pub(crate) fn canonical_float(value: f64) -> String {
    if value.is_infinite() {
        if value > 0.0 { "inf" } else { "-inf" }.to_string()
    } else if value.fract() == 0.0 && value.abs() < 1e16 {
        format!("{:.1}", value)
    } else {
        format!("{}", value)
    }
}

pub fn metric_tags(config: &ScraperConfig, sample: &Sample) -> Vec<String> {
    let mut tags = config.custom_tags.clone();
    for (label_name, label_value) in &sample.labels {
        if config.exclude_labels.contains(label_name) {
            continue;
        }
        if !config.include_labels.is_empty() && !config.include_labels.contains(label_name) {
            continue;
        }
        let tag_name = config.labels_mapper.get(label_name).unwrap_or(label_name);
        tags.push(format!("{}:{}", tag_name, label_value));
    }
    tags
}

/// Hostname taken from the configured label, if present and non-empty.
pub fn sample_hostname(config: &ScraperConfig, sample: &Sample) -> Option<String> {
    let label = config.label_to_hostname.as_ref()?;
    let value = sample.labels.get(label).filter(|v| !v.is_empty())?;
    Some(match &config.label_to_hostname_suffix {
        Some(suffix) => format!("{}{}", value, suffix),
        None => value.clone(),
    })
}

fn ignored_by_labels(config: &ScraperConfig, metric_name: &str, sample: &Sample) -> bool {
    for (label_key, label_values) in &config.ignore_metrics_by_labels {
        if label_values.is_empty() {
            tracing::debug!(
                "skipping filter label `{}` with an empty values list, did you mean to use '*' wildcard?",
                label_key
            );
        } else if label_values.iter().any(|v| v == "*") {
            if sample.labels.contains_key(label_key) {
                tracing::debug!(
                    "skipping metric `{}` due to label key matching: {}",
                    metric_name,
                    label_key
                );
                return true;
            }
        } else if let Some(value) = sample.labels.get(label_key) {
            if label_values.contains(value) {
                tracing::debug!(
                    "skipping metric `{}` due to label `{}` value matching: {}",
                    metric_name,
                    label_key,
                    value
                );
                return true;
            }
        }
    }
    false
}

/// Submits every sample of a family under `metric_name` (namespace added here).
pub fn submit_openmetric(
    config: &ScraperConfig,
    metric_name: &str,
    family: &mut MetricFamily,
    sink: &mut dyn Submitter,
) {
    match family.kind {
        MetricType::Gauge | MetricType::Counter | MetricType::Rate => {
            submit_scalar(config, metric_name, family, sink)
        }
        MetricType::Histogram => submit_histogram(config, metric_name, family, sink),
        MetricType::Summary => submit_summary(config, metric_name, family, sink),
        MetricType::Untyped => tracing::error!(
            "Metric type {} unsupported for metric {}.",
            family.kind,
            metric_name
        ),
    }
}

fn submit_scalar(
    config: &ScraperConfig,
    metric_name: &str,
    family: &MetricFamily,
    sink: &mut dyn Submitter,
) {
    let name = config.metric_name_with_namespace(metric_name);
    for sample in &family.samples {
        if ignored_by_labels(config, metric_name, sample) {
            continue;
        }
        if !is_value_valid(sample.value) {
            tracing::debug!("Metric value is not supported for metric {}", sample.name);
            continue;
        }
        let hostname = sample_hostname(config, sample);
        let tags = metric_tags(config, sample);
        let hostname = hostname.as_deref();

        match family.kind {
            MetricType::Counter if config.send_monotonic_counter => sink.monotonic_count(
                &name,
                sample.value,
                &tags,
                hostname,
                config.flush_first_value(),
            ),
            MetricType::Rate => sink.rate(&name, sample.value, &tags, hostname),
            _ => {
                sink.gauge(&name, sample.value, &tags, hostname);
                if family.kind == MetricType::Counter && config.send_monotonic_with_gauge {
                    sink.monotonic_count(
                        &format!("{}.total", name),
                        sample.value,
                        &tags,
                        hostname,
                        config.flush_first_value(),
                    );
                }
            }
        }
    }
}

fn submit_distribution_count(
    config: &ScraperConfig,
    sink: &mut dyn Submitter,
    monotonic: bool,
    name: &str,
    value: f64,
    tags: &[String],
    hostname: Option<&str>,
) {
    let flush = config.flush_first_value();
    if monotonic {
        sink.monotonic_count(name, value, tags, hostname, flush);
    } else {
        sink.gauge(name, value, tags, hostname);
        if config.send_monotonic_with_gauge {
            sink.monotonic_count(&format!("{}.total", name), value, tags, hostname, flush);
        }
    }
}

fn submit_summary(
    config: &ScraperConfig,
    metric_name: &str,
    family: &mut MetricFamily,
    sink: &mut dyn Submitter,
) {
    let name = config.metric_name_with_namespace(metric_name);
    for sample in family.samples.iter_mut() {
        if !is_value_valid(sample.value) {
            tracing::debug!("Metric value is not supported for metric {}", sample.name);
            continue;
        }
        if ignored_by_labels(config, metric_name, sample) {
            continue;
        }
        let hostname = sample_hostname(config, sample);
        let hostname = hostname.as_deref();

        if sample.name.ends_with("_sum") {
            let tags = metric_tags(config, sample);
            submit_distribution_count(
                config,
                sink,
                config.send_distribution_sums_as_monotonic,
                &format!("{}.sum", name),
                sample.value,
                &tags,
                hostname,
            );
        } else if sample.name.ends_with("_count") {
            let tags = metric_tags(config, sample);
            submit_distribution_count(
                config,
                sink,
                config.send_distribution_counts_as_monotonic,
                &format!("{}.count", name),
                sample.value,
                &tags,
                hostname,
            );
        } else {
            let quantile = match sample.labels.get("quantile").map(|q| parse_golang_float(q)) {
                Some(Ok(quantile)) => quantile,
                Some(Err(_)) => {
                    tracing::debug!("invalid quantile label in metric {}, skipping", metric_name);
                    continue;
                }
                None => {
                    tracing::debug!(
                        "\"quantile\" label not present in metric {:?}. Quantile-less summary metrics are not currently supported. Skipping...",
                        metric_name
                    );
                    continue;
                }
            };
            sample
                .labels
                .insert("quantile".to_string(), canonical_float(quantile));
            let tags = metric_tags(config, sample);
            sink.gauge(&format!("{}.quantile", name), sample.value, &tags, hostname);
        }
    }
}

fn submit_histogram(
    config: &ScraperConfig,
    metric_name: &str,
    family: &mut MetricFamily,
    sink: &mut dyn Submitter,
) {
    if config.non_cumulative_buckets {
        decumulate_histogram_buckets(family);
    }
    let name = config.metric_name_with_namespace(metric_name);
    let count_name = format!("{}.count", name);

    for sample in family.samples.iter_mut() {
        if !is_value_valid(sample.value) {
            tracing::debug!("Metric value is not supported for metric {}", sample.name);
            continue;
        }
        if ignored_by_labels(config, metric_name, sample) {
            continue;
        }
        let hostname = sample_hostname(config, sample);
        let hostname = hostname.as_deref();

        if sample.name.ends_with("_sum") && !config.send_distribution_buckets {
            let tags = metric_tags(config, sample);
            submit_distribution_count(
                config,
                sink,
                config.send_distribution_sums_as_monotonic,
                &format!("{}.sum", name),
                sample.value,
                &tags,
                hostname,
            );
        } else if sample.name.ends_with("_count") && !config.send_distribution_buckets {
            let mut tags = metric_tags(config, sample);
            if config.send_histograms_buckets {
                tags.push("upper_bound:none".to_string());
            }
            submit_distribution_count(
                config,
                sink,
                config.send_distribution_counts_as_monotonic,
                &count_name,
                sample.value,
                &tags,
                hostname,
            );
        } else if config.send_histograms_buckets && sample.name.ends_with("_bucket") {
            let upper_bound = match sample.labels.get("le") {
                Some(le) if le.contains("Inf") => continue,
                Some(le) => match parse_golang_float(le) {
                    Ok(bound) => bound,
                    Err(_) => {
                        tracing::debug!("invalid bucket bound {:?} in metric {}", le, metric_name);
                        continue;
                    }
                },
                None => {
                    tracing::debug!("bucket without `le` label in metric {}, skipping", metric_name);
                    continue;
                }
            };
            if config.send_distribution_buckets {
                submit_distribution_bucket(config, &name, metric_name, upper_bound, sample, hostname, sink);
                continue;
            }
            sample
                .labels
                .insert("le".to_string(), canonical_float(upper_bound));
            let tags = metric_tags(config, sample);
            submit_distribution_count(
                config,
                sink,
                config.send_distribution_counts_as_monotonic,
                &count_name,
                sample.value,
                &tags,
                hostname,
            );
        }
    }
}

/// Sends one de-cumulated bucket as a distribution bucket. Buckets whose bounds
/// collapse (the `-inf`/`-inf` case) always hold 0 and are skipped.
fn submit_distribution_bucket(
    config: &ScraperConfig,
    name: &str,
    metric_name: &str,
    upper_bound: f64,
    sample: &mut Sample,
    hostname: Option<&str>,
    sink: &mut dyn Submitter,
) {
    let lower_bound = match sample.labels.get("lower_bound").map(|lb| parse_golang_float(lb)) {
        Some(Ok(lower_bound)) => lower_bound,
        _ => {
            tracing::warn!(
                "Metric: {} was not containing required bucket boundaries labels: {:?}",
                metric_name,
                sample.labels
            );
            return;
        }
    };
    if lower_bound == upper_bound {
        tracing::warn!(
            "Metric: {} has bucket boundaries equal, skipping: {:?}",
            metric_name,
            sample.labels
        );
        return;
    }
    sample
        .labels
        .insert("le".to_string(), canonical_float(upper_bound));
    sample
        .labels
        .insert("lower_bound".to_string(), canonical_float(lower_bound));
    let tags = metric_tags(config, sample);
    sink.histogram_bucket(
        name,
        sample.value,
        (lower_bound, upper_bound),
        &tags,
        hostname,
        config.flush_first_value(),
    );
}

/// Turns cumulative bucket counts into per-bucket counts and adds a `lower_bound` label.
pub fn decumulate_histogram_buckets(family: &mut MetricFamily) {
    let mut by_context: HashMap<Labels, Vec<(f64, f64)>> = HashMap::new();
    for sample in &family.samples {
        if !sample.name.ends_with("_bucket") {
            continue;
        }
        if let Some(upper) = bucket_bound(sample) {
            by_context
                .entry(bucket_context(&sample.labels))
                .or_default()
                .push((upper, sample.value));
        }
    }

    // (upper bound bits) -> (lower bound, value)
    let mut decumulated: HashMap<Labels, HashMap<u64, (f64, f64)>> = HashMap::new();
    for (context, mut buckets) in by_context {
        buckets.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
        let mut entries = HashMap::new();
        for (i, &(upper, value)) in buckets.iter().enumerate() {
            let entry = if i == 0 {
                let lower = if upper > 0.0 { 0.0 } else { f64::NEG_INFINITY };
                (lower, value)
            } else {
                let (previous_upper, previous_value) = buckets[i - 1];
                (previous_upper, value - previous_value)
            };
            entries.insert(upper.to_bits(), entry);
        }
        decumulated.insert(context, entries);
    }

    for sample in family.samples.iter_mut() {
        if !sample.name.ends_with("_bucket") {
            continue;
        }
        let upper = match bucket_bound(sample) {
            Some(upper) => upper,
            None => continue,
        };
        let entry = decumulated
            .get(&bucket_context(&sample.labels))
            .and_then(|entries| entries.get(&upper.to_bits()));
        if let Some(&(lower, value)) = entry {
            sample
                .labels
                .insert("lower_bound".to_string(), canonical_float(lower));
            sample.value = value;
        }
    }
}

fn bucket_bound(sample: &Sample) -> Option<f64> {
    sample
        .labels
        .get("le")
        .and_then(|le| parse_golang_float(le).ok())
}

fn bucket_context(labels: &Labels) -> Labels {
    labels
        .iter()
        .filter(|(k, _)| k.as_str() != "le" && k.as_str() != "lower_bound")
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

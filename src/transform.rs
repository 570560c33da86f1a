//! Per-family hooks run instead of (or next to) the plain name mapping.

use std::collections::BTreeMap;

use crate::config::ScraperConfig;
use crate::model::MetricFamily;
use crate::parser::parse_golang_float;
use crate::submit::{canonical_float, is_value_valid, submit_openmetric, Submitter};

const MICROS_IN_S: f64 = 1_000_000.0;

pub trait MetricTransformer: Send + Sync {
    fn transform(
        &self,
        family: &mut MetricFamily,
        config: &ScraperConfig,
        sink: &mut dyn Submitter,
    ) -> anyhow::Result<()>;
}

impl<F> MetricTransformer for F
where
    F: Fn(&mut MetricFamily, &ScraperConfig, &mut dyn Submitter) -> anyhow::Result<()> + Send + Sync,
{
    fn transform(
        &self,
        family: &mut MetricFamily,
        config: &ScraperConfig,
        sink: &mut dyn Submitter,
    ) -> anyhow::Result<()> {
        self(family, config, sink)
    }
}

/// Reports labels of a build-info style family as check metadata.
#[derive(Debug, Clone)]
pub struct MetadataTransformer {
    /// Metadata name to source label.
    label_map: BTreeMap<String, String>,
}

impl MetadataTransformer {
    pub fn new(label_map: BTreeMap<String, String>) -> Self {
        Self { label_map }
    }
}

impl MetricTransformer for MetadataTransformer {
    fn transform(
        &self,
        family: &mut MetricFamily,
        _config: &ScraperConfig,
        sink: &mut dyn Submitter,
    ) -> anyhow::Result<()> {
        let sample = family
            .samples
            .first()
            .ok_or_else(|| anyhow::anyhow!("metadata family {} has no sample", family.name))?;
        for (metadata_name, label_name) in &self.label_map {
            if let Some(value) = sample.labels.get(label_name) {
                sink.set_metadata(metadata_name, value);
            }
        }
        Ok(())
    }
}

/// Scales `_sum` values and bucket bounds, then submits under `target`.
#[derive(Debug, Clone)]
pub struct HistogramConverter {
    target: String,
    convert: fn(f64) -> f64,
}

impl HistogramConverter {
    pub fn new(target: impl Into<String>, convert: fn(f64) -> f64) -> Self {
        Self {
            target: target.into(),
            convert,
        }
    }

    pub fn microseconds_to_seconds(target: impl Into<String>) -> Self {
        Self::new(target, |v| v / MICROS_IN_S)
    }

    pub fn seconds_to_microseconds(target: impl Into<String>) -> Self {
        Self::new(target, |v| v * MICROS_IN_S)
    }
}

impl MetricTransformer for HistogramConverter {
    fn transform(
        &self,
        family: &mut MetricFamily,
        config: &ScraperConfig,
        sink: &mut dyn Submitter,
    ) -> anyhow::Result<()> {
        for sample in family.samples.iter_mut() {
            if !is_value_valid(sample.value) {
                continue;
            }
            if sample.name.ends_with("_sum") {
                sample.value = (self.convert)(sample.value);
            } else if sample.name.ends_with("_bucket") {
                if let Some(le) = sample.labels.get_mut("le") {
                    if !le.contains("Inf") {
                        let bound = parse_golang_float(le)?;
                        *le = canonical_float((self.convert)(bound));
                    }
                }
            }
        }
        submit_openmetric(config, &self.target, family, sink);
        Ok(())
    }
}

/// Scales quantile and `_sum` values, then submits under `target`.
#[derive(Debug, Clone)]
pub struct SummaryConverter {
    target: String,
    convert: fn(f64) -> f64,
}

impl SummaryConverter {
    pub fn new(target: impl Into<String>, convert: fn(f64) -> f64) -> Self {
        Self {
            target: target.into(),
            convert,
        }
    }

    pub fn microseconds_to_seconds(target: impl Into<String>) -> Self {
        Self::new(target, |v| v / MICROS_IN_S)
    }

    pub fn seconds_to_microseconds(target: impl Into<String>) -> Self {
        Self::new(target, |v| v * MICROS_IN_S)
    }
}

impl MetricTransformer for SummaryConverter {
    fn transform(
        &self,
        family: &mut MetricFamily,
        config: &ScraperConfig,
        sink: &mut dyn Submitter,
    ) -> anyhow::Result<()> {
        for sample in family.samples.iter_mut() {
            if is_value_valid(sample.value) && !sample.name.ends_with("_count") {
                sample.value = (self.convert)(sample.value);
            }
        }
        submit_openmetric(config, &self.target, family, sink);
        Ok(())
    }
}

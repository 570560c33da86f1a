use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};

/// Label set of a single sample, ordered by label name so tags come out stable.
pub type Labels = BTreeMap<String, String>;

#[derive(Debug, Eq, PartialEq, Clone, Copy, Hash)]
pub enum MetricType {
    Gauge,
    Counter,
    Histogram,
    Summary,
    /// Parsed from `# TYPE x rate` but dropped with other unsupported types; only a
    /// transformer retyping a family gets one submitted as a rate.
    Rate,
    Untyped,
}

impl MetricType {
    /// Families of any other type are dropped after parsing.
    pub fn is_supported(self) -> bool {
        matches!(
            self,
            MetricType::Gauge | MetricType::Counter | MetricType::Histogram | MetricType::Summary
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MetricType::Gauge => "gauge",
            MetricType::Counter => "counter",
            MetricType::Histogram => "histogram",
            MetricType::Summary => "summary",
            MetricType::Rate => "rate",
            MetricType::Untyped => "untyped",
        }
    }
}

impl FromStr for MetricType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let decoded = match s {
            "counter" => MetricType::Counter,
            "gauge" => MetricType::Gauge,
            "histogram" => MetricType::Histogram,
            "summary" => MetricType::Summary,
            "rate" => MetricType::Rate,
            _ => MetricType::Untyped,
        };
        Ok(decoded)
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub name: String,
    pub labels: Labels,
    pub value: f64,
    pub timestamp: Option<DateTime<Utc>>,
}

impl Sample {
    pub fn new(name: impl Into<String>, labels: Labels, value: f64) -> Self {
        Self {
            name: name.into(),
            labels,
            value,
            timestamp: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricFamily {
    pub name: String,
    pub kind: MetricType,
    pub help: Option<String>,
    pub samples: Vec<Sample>,
}

impl MetricFamily {
    pub fn new(name: impl Into<String>, kind: MetricType) -> Self {
        Self {
            name: name.into(),
            kind,
            help: None,
            samples: Vec::new(),
        }
    }
}

#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum ServiceCheckStatus {
    Ok,
    Warning,
    Critical,
    Unknown,
}

impl ServiceCheckStatus {
    /// Numeric status code understood by the aggregator.
    pub fn code(self) -> u8 {
        match self {
            ServiceCheckStatus::Ok => 0,
            ServiceCheckStatus::Warning => 1,
            ServiceCheckStatus::Critical => 2,
            ServiceCheckStatus::Unknown => 3,
        }
    }
}

#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum SubmissionKind {
    Gauge,
    MonotonicCount,
    Rate,
    Count,
}

impl SubmissionKind {
    fn suffix(self) -> &'static str {
        match self {
            SubmissionKind::Gauge => "g",
            SubmissionKind::MonotonicCount => "mc",
            SubmissionKind::Rate => "r",
            SubmissionKind::Count => "c",
        }
    }
}

/// One call made against the aggregator, as recorded or forwarded by a submitter.
#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    Metric {
        kind: SubmissionKind,
        name: String,
        value: f64,
        tags: Vec<String>,
        hostname: Option<String>,
        /// Monotonic counts only: submit the first value seen instead of using it as a baseline.
        flush_first_value: bool,
        timestamp: DateTime<Utc>,
    },
    /// A de-cumulated histogram bucket sent as a distribution.
    HistogramBucket {
        name: String,
        value: f64,
        lower_bound: f64,
        upper_bound: f64,
        monotonic: bool,
        tags: Vec<String>,
        hostname: Option<String>,
        flush_first_value: bool,
        timestamp: DateTime<Utc>,
    },
    ServiceCheck {
        name: String,
        status: ServiceCheckStatus,
        tags: Vec<String>,
        timestamp: DateTime<Utc>,
    },
    Metadata {
        name: String,
        value: String,
    },
}

impl Submission {
    pub fn name(&self) -> &str {
        match self {
            Submission::Metric { name, .. }
            | Submission::HistogramBucket { name, .. }
            | Submission::ServiceCheck { name, .. }
            | Submission::Metadata { name, .. } => name,
        }
    }
}

impl fmt::Display for Submission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Submission::Metric {
                kind,
                name,
                value,
                tags,
                hostname,
                ..
            } => {
                write!(f, "{}:{}|{}", name, value, kind.suffix())?;
                if !tags.is_empty() {
                    write!(f, "|#{}", tags.join(","))?;
                }
                if let Some(host) = hostname {
                    write!(f, "|h:{}", host)?;
                }
                Ok(())
            }
            Submission::HistogramBucket {
                name,
                value,
                lower_bound,
                upper_bound,
                tags,
                hostname,
                ..
            } => {
                write!(f, "{}:{}|hb|@{}:{}", name, value, lower_bound, upper_bound)?;
                if !tags.is_empty() {
                    write!(f, "|#{}", tags.join(","))?;
                }
                if let Some(host) = hostname {
                    write!(f, "|h:{}", host)?;
                }
                Ok(())
            }
            Submission::ServiceCheck {
                name, status, tags, ..
            } => {
                write!(f, "_sc|{}|{}", name, status.code())?;
                if !tags.is_empty() {
                    write!(f, "|#{}", tags.join(","))?;
                }
                Ok(())
            }
            Submission::Metadata { name, value } => write!(f, "_md|{}|{}", name, value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_types_decode_as_untyped() {
        assert_eq!("counter".parse::<MetricType>(), Ok(MetricType::Counter));
        assert_eq!("stateset".parse::<MetricType>(), Ok(MetricType::Untyped));
        assert!(!MetricType::Untyped.is_supported());
        assert!(!MetricType::Rate.is_supported());
        assert!(MetricType::Summary.is_supported());
    }

    #[test]
    fn submission_line_format() {
        let metric = Submission::Metric {
            kind: SubmissionKind::MonotonicCount,
            name: "app.requests".into(),
            value: 10.0,
            tags: vec!["method:GET".into()],
            hostname: Some("node-1".into()),
            flush_first_value: false,
            timestamp: Utc::now(),
        };
        assert_eq!(metric.to_string(), "app.requests:10|mc|#method:GET|h:node-1");

        let bucket = Submission::HistogramBucket {
            name: "app.latency".into(),
            value: 4.0,
            lower_bound: 0.0,
            upper_bound: 0.5,
            monotonic: true,
            tags: vec!["upper_bound:0.5".into(), "lower_bound:0.0".into()],
            hostname: None,
            flush_first_value: true,
            timestamp: Utc::now(),
        };
        assert_eq!(
            bucket.to_string(),
            "app.latency:4|hb|@0:0.5|#upper_bound:0.5,lower_bound:0.0"
        );

        let check = Submission::ServiceCheck {
            name: "app.prometheus.health".into(),
            status: ServiceCheckStatus::Critical,
            tags: vec![],
            timestamp: Utc::now(),
        };
        assert_eq!(check.to_string(), "_sc|app.prometheus.health|2");
    }
}

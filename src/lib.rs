//! Prometheus text exposition scraping for an agent check: fetch an endpoint,
//! group the payload into metric families, enrich them with labels joined from
//! other families and submit gauges, counts and service checks.

pub mod config;
pub mod error;
pub mod join;
pub mod model;
pub mod parser;
pub mod scraper;
pub mod submit;
pub mod transform;

pub use config::{configure, CheckDefaults, CheckFile, InstanceConfig, ScraperConfig};
pub use error::{ConfigError, ScrapeError};
pub use model::{MetricFamily, MetricType, Sample, ServiceCheckStatus, Submission};
pub use scraper::OpenMetricsScraper;
pub use submit::Submitter;

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::AtomicU64;

use chrono::{DateTime, Utc};
use futures::future::FutureExt;
use futures_util::future::RemoteHandle;
use futures_util::StreamExt;
use reqwest::{Certificate, Identity};
use tokio::sync::broadcast;

use crate::config::ScraperConfig;
use crate::error::ScrapeError;
use crate::join::JoinCache;
use crate::model::{MetricFamily, MetricType, ServiceCheckStatus, Submission};
use crate::parser::{FamilyParser, LineBuffer};
use crate::submit::{submit_openmetric, ChannelSubmitter, Submitter};
use crate::transform::{MetadataTransformer, MetricTransformer};

const METRICS_INPUT_COUNT: &str = "metrics.input.count";
const METRICS_PROCESSED_COUNT: &str = "metrics.processed.count";
const METRICS_IGNORED_COUNT: &str = "metrics.ignored.count";
const METRICS_BLACKLIST_COUNT: &str = "metrics.blacklist.count";
const PAYLOAD_SIZE: &str = "payload.size";
const PROCESS_START_TIME: &str = "process_start_time_seconds";

/// State of one scrape pass over a payload.
#[derive(Debug, Default)]
struct Pass {
    parser: FamilyParser,
    payload_size: usize,
    blacklisted: usize,
    /// Hold counter-like families back until the endpoint's start time is known.
    buffer_counters: bool,
    counters: Vec<MetricFamily>,
    process_start_time: Option<f64>,
}

/// Scrapes one endpoint and submits what it finds. Owned by a single task and
/// driven serially, since the label join cache carries state between passes.
pub struct OpenMetricsScraper {
    config: ScraperConfig,
    joins: JoinCache,
    client: reqwest::Client,
    transformers: HashMap<String, Box<dyn MetricTransformer>>,
    prefix_transformers: Vec<(String, Box<dyn MetricTransformer>)>,
    /// Set once a caller registers a transformer; disables the wildcard fallback.
    custom_transformers: bool,
    started_at: DateTime<Utc>,
}

fn read_pem(path: &Path) -> Result<Vec<u8>, ScrapeError> {
    fs::read(path).map_err(|e| ScrapeError::Tls {
        path: path.display().to_string(),
        source: e.into(),
    })
}

fn build_client(config: &ScraperConfig) -> Result<reqwest::Client, ScrapeError> {
    let mut builder = reqwest::Client::builder()
        .timeout(config.timeout)
        .connect_timeout(config.timeout)
        .default_headers(config.headers.clone());

    let tls = &config.tls;
    if let Some(ca_cert) = &tls.ca_cert {
        let pem = read_pem(ca_cert)?;
        let certificate = Certificate::from_pem(&pem).map_err(|e| ScrapeError::Tls {
            path: ca_cert.display().to_string(),
            source: e.into(),
        })?;
        builder = builder.add_root_certificate(certificate);
    }
    if let Some(cert) = &tls.cert {
        // cert and key are read as one PEM bundle
        let mut pem = read_pem(cert)?;
        if let Some(key) = &tls.private_key {
            pem.push(b'\n');
            pem.extend(read_pem(key)?);
        }
        let identity = Identity::from_pem(&pem).map_err(|e| ScrapeError::Tls {
            path: cert.display().to_string(),
            source: e.into(),
        })?;
        builder = builder.identity(identity);
    }
    if !tls.verify {
        builder = builder.danger_accept_invalid_certs(true);
    }

    builder.build().map_err(ScrapeError::Client)
}

impl OpenMetricsScraper {
    pub fn new(config: ScraperConfig) -> Result<Self, ScrapeError> {
        let client = build_client(&config)?;
        let mut scraper = Self {
            config,
            joins: JoinCache::new(),
            client,
            transformers: HashMap::new(),
            prefix_transformers: Vec::new(),
            custom_transformers: false,
            started_at: Utc::now(),
        };

        if let Some(name) = scraper.config.metadata_metric_name.clone() {
            if !scraper.config.metadata_label_map.is_empty() {
                let transformer = MetadataTransformer::new(scraper.config.metadata_label_map.clone());
                scraper.add_transformer(name, Box::new(transformer));
            }
        }
        Ok(scraper)
    }

    pub fn config(&self) -> &ScraperConfig {
        &self.config
    }

    pub fn join_cache(&self) -> &JoinCache {
        &self.joins
    }

    /// Start time compared against the endpoint's `process_start_time_seconds`
    /// when `use_process_start_time` is on. Defaults to when the scraper was built.
    pub fn set_started_at(&mut self, started_at: DateTime<Utc>) {
        self.started_at = started_at;
    }

    /// Lines containing any of these substrings are dropped from subsequent scrapes.
    pub fn set_text_filter_blacklist(&mut self, blacklist: Vec<String>) {
        self.config.text_filter_blacklist = blacklist;
    }

    /// Runs `transformer` for families named `name`; a trailing `*` makes it a
    /// prefix match. Once any transformer is registered here, unmapped families
    /// are no longer submitted through `metrics` wildcards.
    pub fn register_transformer<T>(&mut self, name: impl Into<String>, transformer: T)
    where
        T: MetricTransformer + 'static,
    {
        self.custom_transformers = true;
        self.add_transformer(name.into(), Box::new(transformer));
    }

    fn add_transformer(&mut self, name: String, transformer: Box<dyn MetricTransformer>) {
        match name.strip_suffix('*') {
            Some(prefix) => self
                .prefix_transformers
                .push((prefix.to_string(), transformer)),
            None => {
                self.transformers.insert(name, transformer);
            }
        }
    }

    fn submit_health(&self, status: ServiceCheckStatus, sink: &mut dyn Submitter) {
        if !self.config.health_service_check {
            return;
        }
        let mut tags = vec![format!("endpoint:{}", self.config.endpoint)];
        tags.extend(self.config.custom_tags.iter().cloned());
        sink.service_check(&self.config.health_service_check_name(), status, &tags);
    }

    /// Issues the HTTP request and reports endpoint health.
    pub async fn poll(&self, sink: &mut dyn Submitter) -> Result<reqwest::Response, ScrapeError> {
        let endpoint = &self.config.endpoint;
        let mut request = self.client.get(endpoint.as_str());
        if let Some(auth) = &self.config.basic_auth {
            request = request.basic_auth(&auth.username, auth.password.as_ref());
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(source) => {
                self.submit_health(ServiceCheckStatus::Critical, sink);
                return Err(ScrapeError::Transport {
                    endpoint: endpoint.clone(),
                    source,
                });
            }
        };

        let status = response.status();
        if !status.is_success() {
            self.submit_health(ServiceCheckStatus::Critical, sink);
            return Err(ScrapeError::Status {
                endpoint: endpoint.clone(),
                status,
            });
        }

        self.submit_health(ServiceCheckStatus::Ok, sink);
        Ok(response)
    }

    /// One full scrape: poll, stream the body through the parser and submit.
    pub async fn process(&mut self, sink: &mut dyn Submitter) -> Result<(), ScrapeError> {
        let response = self.poll(sink).await?;
        let mut stream = response.bytes_stream();

        let mut pass = self.begin_pass();
        let mut lines = LineBuffer::default();
        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(source) => {
                    self.joins.abort_pass();
                    self.submit_health(ServiceCheckStatus::Critical, sink);
                    return Err(ScrapeError::Body {
                        endpoint: self.config.endpoint.clone(),
                        source,
                    });
                }
            };
            pass.payload_size += chunk.len();
            for line in lines.push(&chunk) {
                self.consume_line(&mut pass, &line, sink);
            }
        }
        if let Some(line) = lines.finish() {
            self.consume_line(&mut pass, &line, sink);
        }
        self.end_pass(pass, sink);
        Ok(())
    }

    /// Same as [`OpenMetricsScraper::process`] over an in-memory payload, without HTTP.
    pub fn process_lines<I>(&mut self, lines: I, sink: &mut dyn Submitter)
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let mut pass = self.begin_pass();
        for line in lines {
            let line = line.as_ref();
            pass.payload_size += line.len() + 1;
            self.consume_line(&mut pass, line, sink);
        }
        self.end_pass(pass, sink);
    }

    fn begin_pass(&mut self) -> Pass {
        self.joins.begin_pass(&self.config.label_joins);
        Pass {
            buffer_counters: self.config.use_process_start_time && !self.config.flush_first_value(),
            ..Pass::default()
        }
    }

    fn consume_line(&mut self, pass: &mut Pass, line: &str, sink: &mut dyn Submitter) {
        if self.config.is_blacklisted(line) {
            pass.blacklisted += 1;
            return;
        }
        if let Some(family) = pass.parser.push_line(line) {
            self.handle_family(pass, family, sink);
        }
    }

    fn end_pass(&mut self, mut pass: Pass, sink: &mut dyn Submitter) {
        if let Some(family) = pass.parser.finish() {
            self.handle_family(&mut pass, family, sink);
        }

        if let Some(process_start) = pass.process_start_time {
            if unix_seconds(self.started_at) < process_start {
                // the endpoint started after us, its counters began at zero
                self.config.set_flush_first_value(true);
            }
        }
        for family in std::mem::take(&mut pass.counters) {
            self.process_metric(family, sink);
        }
        self.config.set_flush_first_value(true);
        self.joins.end_pass();

        if pass.blacklisted > 0 {
            self.send_telemetry_count(METRICS_BLACKLIST_COUNT, pass.blacklisted, sink);
        }
        if self.config.telemetry {
            let name = self.config.telemetry_metric_name(PAYLOAD_SIZE);
            sink.gauge(&name, pass.payload_size as f64, &self.config.custom_tags, None);
        }
    }

    fn handle_family(&mut self, pass: &mut Pass, family: MetricFamily, sink: &mut dyn Submitter) {
        self.send_telemetry_count(METRICS_INPUT_COUNT, family.samples.len(), sink);
        let family = match self.config.prepare_family(family) {
            Some(family) => family,
            None => return,
        };

        if pass.buffer_counters {
            if family.name == PROCESS_START_TIME {
                let earliest = family.samples.iter().map(|s| s.value).reduce(f64::min);
                if let Some(earliest) = earliest {
                    pass.process_start_time = Some(match pass.process_start_time {
                        Some(current) => current.min(earliest),
                        None => earliest,
                    });
                }
            }
            if matches!(
                family.kind,
                MetricType::Counter | MetricType::Histogram | MetricType::Summary
            ) {
                pass.counters.push(family);
                return;
            }
        }
        self.process_metric(family, sink);
    }

    fn send_telemetry_count(&self, metric: &str, value: usize, sink: &mut dyn Submitter) {
        if self.config.telemetry {
            let name = self.config.telemetry_metric_name(metric);
            sink.count(&name, value as f64, &self.config.custom_tags, None);
        }
    }

    /// Joins, filters and submits a single family. During the first pass of a
    /// scraper with label joins this only feeds the join cache.
    pub fn process_metric(&mut self, mut family: MetricFamily, sink: &mut dyn Submitter) {
        self.joins.store_labels(&family);

        if self.config.is_ignored(&family.name) {
            self.send_telemetry_count(METRICS_IGNORED_COUNT, family.samples.len(), sink);
            return;
        }
        self.send_telemetry_count(METRICS_PROCESSED_COUNT, family.samples.len(), sink);

        self.joins.join_labels(&mut family);
        if self.joins.is_dry_run() {
            return;
        }

        self.submit(family, sink);
    }

    fn submit(&self, mut family: MetricFamily, sink: &mut dyn Submitter) {
        if let Some(mapped) = self.config.metrics_mapper.get(&family.name) {
            submit_openmetric(&self.config, mapped, &mut family, sink);
            return;
        }

        if let Some(transformer) = self.transformers.get(&family.name) {
            if let Err(e) = transformer.transform(&mut family, &self.config, sink) {
                tracing::warn!("Error handling metric: {} - error: {}", family.name, e);
            }
            return;
        }

        for (prefix, transformer) in &self.prefix_transformers {
            if family.name.starts_with(prefix.as_str()) {
                if let Err(e) = transformer.transform(&mut family, &self.config, sink) {
                    tracing::warn!("Error handling metric: {} - error: {}", family.name, e);
                }
            }
        }

        if !self.custom_transformers && self.config.matches_wildcard(&family.name) {
            let name = family.name.clone();
            submit_openmetric(&self.config, &name, &mut family, sink);
            return;
        }

        tracing::debug!(
            "Skipping metric `{}` as it is not defined in the metrics mapper, has no transformer function, nor does it match any wildcards.",
            family.name
        );
    }
}

fn unix_seconds(at: DateTime<Utc>) -> f64 {
    at.timestamp_millis() as f64 / 1000.0
}

pub struct ScrapeWorkerTask {
    scraper: OpenMetricsScraper,
    sink: ChannelSubmitter,
}

impl ScrapeWorkerTask {
    pub fn new(scraper: OpenMetricsScraper, sender: broadcast::Sender<Submission>) -> Self {
        Self {
            scraper,
            sink: ChannelSubmitter::new(sender),
        }
    }

    pub async fn run(mut self) {
        static SPLAY_COUNTER: AtomicU64 = AtomicU64::new(0);
        let interval = self.scraper.config.collection_interval;
        let splay = SPLAY_COUNTER.fetch_add(250, std::sync::atomic::Ordering::Relaxed)
            % (interval.as_millis() as u64).max(1);
        tokio::time::sleep(tokio::time::Duration::from_millis(splay)).await;

        loop {
            self.run_once().await;
            tokio::time::sleep(interval).await;
        }
    }

    pub async fn run_once(&mut self) {
        tracing::info!("scraping {}", self.scraper.config.endpoint);
        if let Err(e) = self.scraper.process(&mut self.sink).await {
            tracing::error!("{:?}", e);
        }
    }
}

/// Keeps a scrape task alive; dropping the worker cancels it.
pub struct ScrapeWorker {
    _remote_handle: RemoteHandle<()>,
}

impl ScrapeWorker {
    pub fn new(scraper: OpenMetricsScraper, sender: broadcast::Sender<Submission>) -> Self {
        let task = ScrapeWorkerTask::new(scraper, sender);
        let (remote, remote_handle) = task.run().remote_handle();

        tokio::spawn(async move {
            remote.await;
        });

        Self {
            _remote_handle: remote_handle,
        }
    }
}

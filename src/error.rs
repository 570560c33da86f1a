use thiserror::Error;

/// Raised while resolving an instance configuration, before any network call.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("you have to define an endpoint_url for each prometheus instance")]
    MissingEndpoint,
    #[error("you have to define a namespace for each prometheus check")]
    MissingNamespace,
    #[error("invalid endpoint url {url}: {reason}")]
    InvalidEndpoint { url: String, reason: String },
    #[error("invalid pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("invalid header {name:?}: {reason}")]
    InvalidHeader { name: String, reason: String },
    #[error("invalid prometheus_timeout {0}, expected a positive number of seconds")]
    InvalidTimeout(f64),
    #[error("the setting `{0}` is not supported by this check")]
    UnsupportedOption(&'static str),
    #[error("cannot get bearer token from {path}: {source}")]
    BearerToken {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("read config failed: {0}")]
    Read(#[from] std::io::Error),
    #[error("invalid yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Raised by a single scrape; the scrape is aborted and nothing from it is submitted afterwards.
#[derive(Error, Debug)]
pub enum ScrapeError {
    #[error("failed to build http client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("request to {endpoint} failed: {source}")]
    Transport {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{endpoint} returned http status {status}")]
    Status {
        endpoint: String,
        status: http::StatusCode,
    },
    #[error("reading body from {endpoint} failed: {source}")]
    Body {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("invalid tls material {path}: {source}")]
    Tls {
        path: String,
        #[source]
        source: TlsMaterialError,
    },
}

#[derive(Error, Debug)]
pub enum TlsMaterialError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),
}

/// A single exposition line that could not be understood. Never fatal to a scrape.
#[derive(Error, Debug, PartialEq)]
pub enum ParseError {
    #[error("invalid metric name")]
    InvalidName,
    #[error("malformed label set: {0}")]
    MalformedLabels(&'static str),
    #[error("duplicate label {0:?}")]
    DuplicateLabel(String),
    #[error("missing sample value")]
    MissingValue,
    #[error("invalid sample value {0:?}")]
    InvalidValue(String),
}

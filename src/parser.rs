//! Incremental parser for the Prometheus text exposition format.
//!
//! Lines are fed one at a time and grouped into [`MetricFamily`] values the
//! same way the reference client library does: a `# HELP` or `# TYPE` line
//! for a new name opens a family, and a sample whose name does not belong to
//! the open family opens an untyped one named after the sample. A family is
//! handed out as soon as the next one starts, so a payload is never held in
//! memory as a whole.

use std::str::FromStr;

use chrono::{TimeZone, Utc};
use lazy_static::lazy_static;
use regex::Regex;

use crate::error::ParseError;
use crate::model::{Labels, MetricFamily, MetricType, Sample};

lazy_static! {
    static ref HELP_RE: Regex = Regex::new(r"^#\s*HELP\s+(\S+)(?:\s+(.*))?$").unwrap();
    static ref TYPE_RE: Regex = Regex::new(r"^#\s*TYPE\s+(\S+)\s+(\S+)").unwrap();
    static ref NAME_RE: Regex = Regex::new(r"^[a-zA-Z_:][a-zA-Z0-9_:]*").unwrap();
}

#[derive(Debug, PartialEq)]
pub enum Entry<'a> {
    Help { metric_name: &'a str, doc: &'a str },
    Type { metric_name: &'a str, kind: MetricType },
    Sample(Sample),
    Ignored,
}

impl<'a> Entry<'a> {
    pub fn parse_line(line: &'a str) -> Result<Entry<'a>, ParseError> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(Entry::Ignored);
        }

        if line.starts_with('#') {
            if let Some(caps) = HELP_RE.captures(line) {
                if let Some(name) = caps.get(1) {
                    return Ok(Entry::Help {
                        metric_name: name.as_str(),
                        doc: caps.get(2).map_or("", |d| d.as_str()),
                    });
                }
            }
            if let Some(caps) = TYPE_RE.captures(line) {
                if let (Some(name), Some(kind)) = (caps.get(1), caps.get(2)) {
                    let kind = MetricType::from_str(kind.as_str()).unwrap_or(MetricType::Untyped);
                    return Ok(Entry::Type {
                        metric_name: name.as_str(),
                        kind,
                    });
                }
            }
            return Ok(Entry::Ignored);
        }

        parse_sample(line).map(Entry::Sample)
    }
}

fn parse_sample(line: &str) -> Result<Sample, ParseError> {
    let name_end = NAME_RE.find(line).ok_or(ParseError::InvalidName)?.end();
    let name = &line[..name_end];

    let mut rest = line[name_end..].trim_start();
    let mut labels = Labels::new();
    if let Some(inner) = rest.strip_prefix('{') {
        let consumed = parse_labels(inner, &mut labels)?;
        rest = &inner[consumed..];
    }

    let mut fields = rest.split_whitespace();
    let raw_value = fields.next().ok_or(ParseError::MissingValue)?;
    let value =
        parse_golang_float(raw_value).map_err(|_| ParseError::InvalidValue(raw_value.to_string()))?;
    let timestamp = fields
        .next()
        .and_then(|ts| ts.parse::<i64>().ok())
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single());

    Ok(Sample {
        name: name.to_string(),
        labels,
        value,
        timestamp,
    })
}

/// Parses the inside of a `{...}` label block and returns how many bytes were consumed,
/// including the closing brace.
fn parse_labels(input: &str, labels: &mut Labels) -> Result<usize, ParseError> {
    let bytes = input.as_bytes();
    let mut pos = 0;
    loop {
        pos = skip_whitespace(bytes, pos);
        match bytes.get(pos) {
            Some(b'}') => return Ok(pos + 1),
            None => return Err(ParseError::MalformedLabels("unterminated label set")),
            _ => {}
        }

        let start = pos;
        while pos < bytes.len() && (bytes[pos].is_ascii_alphanumeric() || bytes[pos] == b'_') {
            pos += 1;
        }
        if pos == start {
            return Err(ParseError::MalformedLabels("expected label name"));
        }
        let label_name = &input[start..pos];

        pos = skip_whitespace(bytes, pos);
        if bytes.get(pos) != Some(&b'=') {
            return Err(ParseError::MalformedLabels("expected '='"));
        }
        pos = skip_whitespace(bytes, pos + 1);
        if bytes.get(pos) != Some(&b'"') {
            return Err(ParseError::MalformedLabels("expected quoted label value"));
        }

        let base = pos + 1;
        let mut value = String::new();
        let mut chars = input[base..].char_indices();
        loop {
            match chars.next() {
                Some((i, '"')) => {
                    pos = base + i + 1;
                    break;
                }
                Some((_, '\\')) => match chars.next() {
                    Some((_, 'n')) => value.push('\n'),
                    Some((_, '\\')) => value.push('\\'),
                    Some((_, '"')) => value.push('"'),
                    Some((_, other)) => {
                        value.push('\\');
                        value.push(other);
                    }
                    None => return Err(ParseError::MalformedLabels("unterminated label value")),
                },
                Some((_, c)) => value.push(c),
                None => return Err(ParseError::MalformedLabels("unterminated label value")),
            }
        }

        if labels.insert(label_name.to_string(), value).is_some() {
            return Err(ParseError::DuplicateLabel(label_name.to_string()));
        }

        pos = skip_whitespace(bytes, pos);
        match bytes.get(pos) {
            Some(b',') => pos += 1,
            Some(b'}') => return Ok(pos + 1),
            _ => return Err(ParseError::MalformedLabels("expected ',' or '}'")),
        }
    }
}

fn skip_whitespace(bytes: &[u8], mut pos: usize) -> usize {
    while pos < bytes.len() && bytes[pos].is_ascii_whitespace() {
        pos += 1;
    }
    pos
}

pub(crate) fn parse_golang_float(s: &str) -> Result<f64, <f64 as FromStr>::Err> {
    match s.to_lowercase().as_str() {
        "nan" => Ok(f64::NAN), // f64::parse doesn't recognize 'nan'
        s => s.parse::<f64>(), // f64::parse expects lowercase [+-]inf
    }
}

fn allowed_sample_names(name: &str, kind: MetricType) -> Vec<String> {
    match kind {
        MetricType::Histogram => vec![
            format!("{}_bucket", name),
            format!("{}_sum", name),
            format!("{}_count", name),
        ],
        MetricType::Summary => vec![
            name.to_string(),
            format!("{}_sum", name),
            format!("{}_count", name),
        ],
        MetricType::Counter => vec![name.to_string(), format!("{}_total", name)],
        _ => vec![name.to_string()],
    }
}

/// Push-based family assembler. Feed lines with [`FamilyParser::push_line`] and
/// collect the trailing family with [`FamilyParser::finish`].
#[derive(Debug, Default)]
pub struct FamilyParser {
    current: Option<MetricFamily>,
    allowed: Vec<String>,
}

impl FamilyParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the previous family when this line starts a new one.
    pub fn push_line(&mut self, line: &str) -> Option<MetricFamily> {
        let entry = match Entry::parse_line(line) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::debug!("skipping malformed line {:?}: {}", line, e);
                return None;
            }
        };

        match entry {
            Entry::Help { metric_name, doc } => {
                let flushed = self.open_if_new(metric_name, MetricType::Untyped);
                if let Some(current) = self.current.as_mut() {
                    current.help = Some(doc.to_string());
                }
                flushed
            }
            Entry::Type { metric_name, kind } => {
                let flushed = self.open_if_new(metric_name, kind);
                if let Some(current) = self.current.as_mut() {
                    current.kind = kind;
                }
                self.allowed = allowed_sample_names(metric_name, kind);
                flushed
            }
            Entry::Sample(sample) => {
                let belongs = self.current.is_some() && self.allowed.iter().any(|n| *n == sample.name);
                let flushed = if belongs {
                    None
                } else {
                    self.open(sample.name.clone(), MetricType::Untyped)
                };
                if let Some(current) = self.current.as_mut() {
                    current.samples.push(sample);
                }
                flushed
            }
            Entry::Ignored => None,
        }
    }

    pub fn finish(&mut self) -> Option<MetricFamily> {
        self.allowed.clear();
        self.current.take().filter(|f| !f.samples.is_empty())
    }

    fn open_if_new(&mut self, name: &str, kind: MetricType) -> Option<MetricFamily> {
        match &self.current {
            Some(current) if current.name == name => None,
            _ => self.open(name.to_string(), kind),
        }
    }

    fn open(&mut self, name: String, kind: MetricType) -> Option<MetricFamily> {
        self.allowed = allowed_sample_names(&name, kind);
        let previous = self.current.replace(MetricFamily::new(name, kind));
        previous.filter(|f| !f.samples.is_empty())
    }
}

/// Lazy, single-pass sequence of families over an iterator of lines.
pub struct Families<I> {
    lines: I,
    parser: FamilyParser,
    exhausted: bool,
}

impl<I> Iterator for Families<I>
where
    I: Iterator,
    I::Item: AsRef<str>,
{
    type Item = MetricFamily;

    fn next(&mut self) -> Option<MetricFamily> {
        if self.exhausted {
            return None;
        }
        for line in self.lines.by_ref() {
            if let Some(family) = self.parser.push_line(line.as_ref()) {
                return Some(family);
            }
        }
        self.exhausted = true;
        self.parser.finish()
    }
}

pub fn parse_families<I>(lines: I) -> Families<I::IntoIter>
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    Families {
        lines: lines.into_iter(),
        parser: FamilyParser::new(),
        exhausted: false,
    }
}

/// Splits a chunked byte stream into lines without buffering the whole body.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in chunk {
            if byte == b'\n' {
                lines.push(self.take_line());
            } else {
                self.pending.push(byte);
            }
        }
        lines
    }

    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            None
        } else {
            Some(self.take_line())
        }
    }

    fn take_line(&mut self) -> String {
        let raw = std::mem::take(&mut self.pending);
        let mut line = String::from_utf8_lossy(&raw).into_owned();
        if line.ends_with('\r') {
            line.pop();
        }
        line
    }
}

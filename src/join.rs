//! Cross-family label enrichment.
//!
//! A "donor" family (for example `kube_pod_info`) carries descriptive labels
//! keyed by one or more identifying labels (`pod`). Every sample of every
//! family that carries the identifying labels gets the donor's labels copied
//! onto it. Joins are resolved against what the previous passes cached, so the
//! very first pass only fills the cache and must not submit anything.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use crate::config::LabelJoin;
use crate::model::{Labels, MetricFamily};

const MATCH_ALL: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinState {
    /// No pass has started yet.
    Empty,
    /// First pass with joins configured: the cache is being built, nothing may be submitted.
    Dry,
    Active,
}

impl Default for JoinState {
    fn default() -> Self {
        JoinState::Empty
    }
}

#[derive(Debug, Clone)]
struct Watched {
    key: String,
    labels: Vec<String>,
    labels_to_get: Vec<String>,
    match_all: bool,
    get_all: bool,
}

#[derive(Debug, Default)]
pub struct JoinCache {
    state: JoinState,
    watched: BTreeMap<String, Watched>,
    singles: BTreeSet<String>,
    mapping: HashMap<String, HashMap<String, Labels>>,
    active: HashMap<String, HashSet<String>>,
}

impl JoinCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> JoinState {
        self.state
    }

    pub fn is_dry_run(&self) -> bool {
        self.state == JoinState::Dry
    }

    pub fn begin_pass(&mut self, joins: &BTreeMap<String, LabelJoin>) {
        if self.state != JoinState::Empty {
            return;
        }
        if joins.is_empty() {
            self.state = JoinState::Active;
            return;
        }

        for (donor, join) in joins {
            let watched = Watched {
                key: join.mapping_key(),
                labels: join.labels_to_match.clone(),
                labels_to_get: join.labels_to_get.clone(),
                match_all: join.match_all(),
                get_all: join.get_all(),
            };
            if watched.match_all {
                self.singles.insert(MATCH_ALL.to_string());
            } else if watched.labels.len() == 1 {
                self.singles.insert(watched.labels[0].clone());
            }
            self.watched.insert(donor.clone(), watched);
        }
        tracing::debug!(
            "watching {} label join(s), first pass only builds the mapping",
            self.watched.len()
        );
        self.state = JoinState::Dry;
    }

    /// Evicts every cached entry not seen during the pass and resets the active set.
    pub fn end_pass(&mut self) {
        let active = std::mem::take(&mut self.active);
        self.mapping.retain(|key, values| {
            match active.get(key) {
                Some(seen) => values.retain(|value, _| seen.contains(value)),
                None => values.clear(),
            }
            !values.is_empty()
        });
        self.state = JoinState::Active;
    }

    /// Forgets what an interrupted pass marked as active. Nothing is evicted and a
    /// dry pass stays dry, so the next full pass decides.
    pub fn abort_pass(&mut self) {
        self.active.clear();
    }

    /// Records the labels of a donor family. Only samples valued exactly 1 count, so
    /// state-set style families (one sample per state, the current one set to 1) work.
    pub fn store_labels(&mut self, family: &MetricFamily) {
        let watched = match self.watched.get(&family.name) {
            Some(watched) => watched,
            None => return,
        };

        for sample in &family.samples {
            if sample.value != 1.0 {
                continue;
            }
            let labels = &sample.labels;
            if !watched.match_all && !watched.labels.iter().all(|l| labels.contains_key(l)) {
                continue;
            }

            let mut joined = Labels::new();
            if watched.get_all {
                for (name, value) in labels {
                    if !watched.labels.contains(name) {
                        joined.insert(name.clone(), value.clone());
                    }
                }
            } else {
                for name in &watched.labels_to_get {
                    if let Some(value) = labels.get(name) {
                        joined.insert(name.clone(), value.clone());
                    }
                }
            }

            let mapping_value = if watched.match_all {
                MATCH_ALL.to_string()
            } else {
                mapping_value(&watched.labels, labels)
            };
            self.mapping
                .entry(watched.key.clone())
                .or_default()
                .entry(mapping_value)
                .or_default()
                .extend(joined);
        }
    }

    /// Copies cached donor labels onto every matching sample and marks the keys as active.
    pub fn join_labels(&mut self, family: &mut MetricFamily) {
        if self.watched.is_empty() {
            return;
        }
        let Self {
            watched,
            singles,
            mapping,
            active,
            ..
        } = self;

        for sample in &mut family.samples {
            let mut matched: Vec<(String, String)> = Vec::new();

            if singles.contains(MATCH_ALL) {
                matched.push((MATCH_ALL.to_string(), MATCH_ALL.to_string()));
            }
            for label in singles.iter() {
                if let Some(value) = sample.labels.get(label) {
                    matched.push((label.clone(), value.clone()));
                }
            }
            for watch in watched.values() {
                if watch.match_all || watch.labels.len() == 1 {
                    continue;
                }
                if matched.iter().any(|(key, _)| *key == watch.key) {
                    continue;
                }
                if watch.labels.iter().all(|l| sample.labels.contains_key(l)) {
                    matched.push((watch.key.clone(), mapping_value(&watch.labels, &sample.labels)));
                }
            }

            for (key, value) in matched {
                if let Some(extra) = mapping.get(&key).and_then(|values| values.get(&value)) {
                    sample
                        .labels
                        .extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
                }
                active.entry(key).or_default().insert(value);
            }
        }
    }

    /// Cached extra labels for one mapping key and value.
    pub fn lookup(&self, key: &str, value: &str) -> Option<&Labels> {
        self.mapping.get(key).and_then(|values| values.get(value))
    }

    /// Number of cached values under a mapping key.
    pub fn cached_len(&self, key: &str) -> usize {
        self.mapping.get(key).map_or(0, |values| values.len())
    }
}

fn mapping_value(names: &[String], labels: &Labels) -> String {
    names
        .iter()
        .map(|name| labels.get(name).map(String::as_str).unwrap_or(""))
        .collect::<Vec<_>>()
        .join(",")
}

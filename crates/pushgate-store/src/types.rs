//! Domain types for the pushgate metric store.
//!
//! A metric group is the latest pushed snapshot for one grouping key. All
//! types serialize to JSON so the disk store can persist them into redb.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Label name of the one grouping label every group carries.
pub const JOB_LABEL: &str = "job";

// ── Grouping key ───────────────────────────────────────────────────

/// The label set that uniquely identifies one metric group.
///
/// Backed by a `BTreeMap`, so insertion order never matters: two keys with
/// the same labels compare, hash, and serialize identically.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupingKey(BTreeMap<String, String>);

impl GroupingKey {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// A key holding only the `job` label.
    pub fn for_job(job: impl Into<String>) -> Self {
        let mut key = Self::new();
        key.insert(JOB_LABEL, job);
        key
    }

    /// Builder-style insert.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.0.insert(name.into(), value.into())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn job(&self) -> Option<&str> {
        self.get(JOB_LABEL)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.0
    }

    /// Canonical string form used as the redb table key.
    pub fn table_key(&self) -> String {
        // A BTreeMap<String, String> always serializes.
        serde_json::to_string(&self.0).unwrap_or_default()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for GroupingKey {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl fmt::Display for GroupingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (name, value)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{name}={value:?}")?;
        }
        f.write_str("}")
    }
}

// ── Metric families ────────────────────────────────────────────────

/// Prometheus metric type of a family.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricType {
    Counter,
    Gauge,
    Histogram,
    Summary,
    #[default]
    Untyped,
}

impl MetricType {
    /// Parse the type token of a `# TYPE` line.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "counter" => Some(Self::Counter),
            "gauge" => Some(Self::Gauge),
            "histogram" => Some(Self::Histogram),
            "summary" => Some(Self::Summary),
            "untyped" => Some(Self::Untyped),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Counter => "counter",
            Self::Gauge => "gauge",
            Self::Histogram => "histogram",
            Self::Summary => "summary",
            Self::Untyped => "untyped",
        }
    }

    /// Sample name suffixes that belong to a family of this type.
    fn sample_suffixes(&self) -> &'static [&'static str] {
        match self {
            Self::Histogram => &["_bucket", "_sum", "_count"],
            Self::Summary => &["_sum", "_count"],
            _ => &[],
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One sample line of a metric family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Full sample name, including any `_bucket`/`_sum`/`_count` suffix.
    pub name: String,
    pub labels: BTreeMap<String, String>,
    #[serde(with = "prom_float")]
    pub value: f64,
    /// Optional explicit timestamp in Unix milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp_ms: Option<i64>,
}

/// A named collection of samples sharing help text and type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricFamily {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub help: Option<String>,
    pub metric_type: MetricType,
    pub samples: Vec<Sample>,
}

impl MetricFamily {
    pub fn new(name: impl Into<String>, metric_type: MetricType) -> Self {
        Self {
            name: name.into(),
            help: None,
            metric_type,
            samples: Vec::new(),
        }
    }

    /// Whether a sample called `sample_name` is part of this family.
    pub fn owns_sample_name(&self, sample_name: &str) -> bool {
        if sample_name == self.name {
            return true;
        }
        sample_name
            .strip_prefix(self.name.as_str())
            .is_some_and(|suffix| self.metric_type.sample_suffixes().contains(&suffix))
    }
}

// ── Groups and write requests ──────────────────────────────────────

/// The latest pushed snapshot for one grouping key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricGroup {
    pub labels: GroupingKey,
    pub metric_families: BTreeMap<String, MetricFamily>,
    /// Unix milliseconds of the last write that touched this group.
    pub last_push_ms: u64,
}

impl MetricGroup {
    pub fn last_push_seconds(&self) -> f64 {
        self.last_push_ms as f64 / 1000.0
    }
}

/// Point-in-time snapshot of every group in a store.
pub type GroupingKeyToMetricGroup = BTreeMap<GroupingKey, MetricGroup>;

/// A transactional unit submitted to a metric store.
///
/// An empty `metric_families` map is a tombstone: the addressed group is
/// dropped whatever `replace` says.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRequest {
    pub labels: GroupingKey,
    pub timestamp: SystemTime,
    pub metric_families: BTreeMap<String, MetricFamily>,
    /// Replace the whole group (PUT) instead of merging by family name (POST).
    pub replace: bool,
}

impl WriteRequest {
    /// A tombstone for `labels`, stamped with the current time.
    pub fn tombstone(labels: GroupingKey) -> Self {
        Self {
            labels,
            timestamp: SystemTime::now(),
            metric_families: BTreeMap::new(),
            replace: false,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.metric_families.is_empty()
    }
}

/// Whether `name` is a valid Prometheus label name.
pub fn is_valid_label_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Whether `name` is a valid Prometheus metric name.
pub fn is_valid_metric_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == ':' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}

/// Milliseconds since the Unix epoch, saturating at zero for earlier times.
pub fn unix_millis(ts: SystemTime) -> u64 {
    ts.duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ── Sample values ──────────────────────────────────────────────────

/// Render a sample value the way the text exposition format spells it.
pub fn format_value(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value == f64::INFINITY {
        "+Inf".to_string()
    } else if value == f64::NEG_INFINITY {
        "-Inf".to_string()
    } else {
        value.to_string()
    }
}

/// Parse a sample value, accepting `+Inf`, `-Inf`, and `NaN`.
pub fn parse_value(s: &str) -> Option<f64> {
    match s {
        "+Inf" | "Inf" => Some(f64::INFINITY),
        "-Inf" => Some(f64::NEG_INFINITY),
        "NaN" => Some(f64::NAN),
        _ => s.parse::<f64>().ok(),
    }
}

/// Stores floats as their text form so non-finite values survive JSON.
mod prom_float {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_value(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        let s = String::deserialize(deserializer)?;
        super::parse_value(&s).ok_or_else(|| D::Error::custom(format!("invalid sample value {s:?}")))
    }
}

//! Core data types shared by the ingestion and query paths
//!
//! # Key Types
//!
//! - **`Labels`**: canonical (sorted, de-duplicated) label set identifying a series
//! - **`TimeSeries`**: a label set plus its samples and exemplars
//! - **`WriteRequest`** / **`ReadRequest`**: decoded remote-write and remote-read payloads
//! - **`TraceBatch`**: spans grouped by resource and instrumentation scope
//! - **`InstanceId`**: identifier generated once per process
//!
//! # Example
//!
//! ```rust
//! use promstore::types::{Labels, Sample, TimeSeries};
//!
//! let labels = Labels::from_pairs([("job", "api"), ("__name__", "http_requests_total")]);
//! assert_eq!(labels.metric_name(), Some("http_requests_total"));
//!
//! let series = TimeSeries::new(labels, vec![Sample::new(1000, 1.0)]);
//! assert_eq!(series.samples.len(), 1);
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Label carrying the metric name
pub const METRIC_NAME_LABEL: &str = "__name__";

/// Store-assigned metric identifier
pub type MetricId = i64;

/// Store-assigned label (key, value) identifier
pub type LabelId = i64;

/// Store-assigned series identifier
pub type SeriesId = i64;

// ============================================================================
// Labels
// ============================================================================

/// A single label pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Label {
    /// Label name
    pub name: String,
    /// Label value
    pub value: String,
}

impl Label {
    /// Create a new label
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Canonical label set
///
/// Labels are kept sorted by name and names are unique (the last value wins
/// on duplicates), so two sets with the same pairs in any order compare and
/// hash equal. This is the series identity used for caching and partitioning.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "Vec<Label>")]
pub struct Labels(Vec<Label>);

impl From<Vec<Label>> for Labels {
    fn from(labels: Vec<Label>) -> Self {
        Self::new(labels)
    }
}

impl Labels {
    /// Build a canonical label set from arbitrary labels
    pub fn new(mut labels: Vec<Label>) -> Self {
        // stable sort keeps input order among equal names so the last one can win
        labels.sort_by(|a, b| a.name.cmp(&b.name));
        let mut canonical: Vec<Label> = Vec::with_capacity(labels.len());
        for label in labels {
            match canonical.last_mut() {
                Some(last) if last.name == label.name => *last = label,
                _ => canonical.push(label),
            }
        }
        Self(canonical)
    }

    /// Build a label set from `(name, value)` pairs
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self::new(pairs.into_iter().map(|(k, v)| Label::new(k, v)).collect())
    }

    /// Value of the `__name__` label, if present
    pub fn metric_name(&self) -> Option<&str> {
        self.get(METRIC_NAME_LABEL)
    }

    /// Value of the named label
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .binary_search_by(|l| l.name.as_str().cmp(name))
            .ok()
            .map(|idx| self.0[idx].value.as_str())
    }

    /// Iterate labels in canonical order
    pub fn iter(&self) -> impl Iterator<Item = &Label> {
        self.0.iter()
    }

    /// Number of labels
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when the set has no labels
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Borrow the labels as a slice
    pub fn as_slice(&self) -> &[Label] {
        &self.0
    }
}

impl fmt::Display for Labels {
    /// Renders as `name{k="v",...}` without the `__name__` pair
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{{", self.metric_name().unwrap_or_default())?;
        let mut first = true;
        for label in self.0.iter().filter(|l| l.name != METRIC_NAME_LABEL) {
            if !first {
                write!(f, ",")?;
            }
            write!(f, "{}={:?}", label.name, label.value)?;
            first = false;
        }
        write!(f, "}}")
    }
}

// ============================================================================
// Samples and series
// ============================================================================

/// A single sample
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Unix timestamp in milliseconds
    pub timestamp: i64,
    /// Sample value
    pub value: f64,
}

impl Sample {
    /// Create a new sample
    pub fn new(timestamp: i64, value: f64) -> Self {
        Self { timestamp, value }
    }
}

/// A sample carrying a small extra label set for trace correlation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exemplar {
    /// Exemplar labels (e.g. `trace_id`)
    pub labels: Vec<Label>,
    /// Unix timestamp in milliseconds
    pub timestamp: i64,
    /// Exemplar value
    pub value: f64,
}

/// A series with its samples and exemplars
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TimeSeries {
    /// Series identity
    pub labels: Labels,
    /// Samples in the order they were received
    pub samples: Vec<Sample>,
    /// Exemplars attached to the series
    #[serde(default)]
    pub exemplars: Vec<Exemplar>,
}

impl TimeSeries {
    /// Create a series without exemplars
    pub fn new(labels: Labels, samples: Vec<Sample>) -> Self {
        Self {
            labels,
            samples,
            exemplars: Vec::new(),
        }
    }

    /// Attach exemplars
    pub fn with_exemplars(mut self, exemplars: Vec<Exemplar>) -> Self {
        self.exemplars = exemplars;
        self
    }
}

/// Decoded remote-write payload
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WriteRequest {
    /// Series to write
    pub timeseries: Vec<TimeSeries>,
}

impl WriteRequest {
    /// Create a write request
    pub fn new(timeseries: Vec<TimeSeries>) -> Self {
        Self { timeseries }
    }

    /// Total samples across all series
    pub fn num_samples(&self) -> usize {
        self.timeseries.iter().map(|ts| ts.samples.len()).sum()
    }
}

// ============================================================================
// Reads
// ============================================================================

/// Label matcher operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchType {
    /// `=`
    Equal,
    /// `!=`
    NotEqual,
    /// `=~`
    Regex,
    /// `!~`
    NotRegex,
}

/// A single label predicate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelMatcher {
    /// Operator
    pub kind: MatchType,
    /// Label name
    pub name: String,
    /// Value or pattern
    pub value: String,
}

impl LabelMatcher {
    /// Create a matcher
    pub fn new(kind: MatchType, name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            value: value.into(),
        }
    }

    /// Shorthand for an equality matcher
    pub fn equal(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(MatchType::Equal, name, value)
    }
}

/// A remote-read query: time range plus label matchers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    /// Inclusive start, milliseconds
    pub start_ms: i64,
    /// Inclusive end, milliseconds
    pub end_ms: i64,
    /// Matchers that every returned series satisfies
    pub matchers: Vec<LabelMatcher>,
}

/// Decoded remote-read payload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReadRequest {
    /// Queries, answered positionally
    pub queries: Vec<Query>,
}

/// Result of a single query
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    /// Matching series with samples inside the query range
    pub timeseries: Vec<TimeSeries>,
}

/// Remote-read response; `results[i]` answers `queries[i]`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReadResponse {
    /// Per-query results
    pub results: Vec<QueryResult>,
}

// ============================================================================
// Traces
// ============================================================================

/// Span or resource attributes
pub type Attributes = BTreeMap<String, serde_json::Value>;

/// Library that produced a group of spans
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstrumentationScope {
    /// Scope name
    pub name: String,
    /// Scope version
    pub version: String,
}

/// A single span
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Span {
    /// Hex trace id
    pub trace_id: String,
    /// Hex span id
    pub span_id: String,
    /// Parent span id, empty for root spans
    #[serde(default)]
    pub parent_span_id: String,
    /// Operation name
    pub name: String,
    /// Start, nanoseconds since the Unix epoch
    pub start_time_unix_nano: i64,
    /// End, nanoseconds since the Unix epoch
    pub end_time_unix_nano: i64,
    /// Span attributes
    #[serde(default)]
    pub attributes: Attributes,
}

impl Span {
    /// Start time in milliseconds
    pub fn start_ms(&self) -> i64 {
        self.start_time_unix_nano / 1_000_000
    }
}

/// Spans sharing a resource and instrumentation scope
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSpans {
    /// Resource attributes (`service.name`, ...)
    pub resource: Attributes,
    /// Instrumentation scope
    pub scope: InstrumentationScope,
    /// Spans
    pub spans: Vec<Span>,
}

/// Decoded trace export payload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TraceBatch {
    /// Spans grouped by resource
    pub resource_spans: Vec<ResourceSpans>,
}

impl TraceBatch {
    /// Total spans in the batch
    pub fn num_spans(&self) -> usize {
        self.resource_spans.iter().map(|rs| rs.spans.len()).sum()
    }
}

// ============================================================================
// Instance identity
// ============================================================================

/// Identifier generated once per process and passed to every component that
/// tags telemetry or diagnostics with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceId(Uuid);

impl InstanceId {
    /// Generate a fresh random identifier
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Underlying UUID
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl From<Uuid> for InstanceId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// A single `category:value` stream tag.
///
/// Either side may be empty, but not both; empty tags are dropped by the
/// encoder.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Tag {
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub value: String,
}

impl Tag {
    pub fn new(category: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            value: value.into(),
        }
    }
}

impl std::fmt::Display for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.category.is_empty(), self.value.is_empty()) {
            (false, false) => write!(f, "{}:{}", self.category, self.value),
            (false, true) => write!(f, "{}", self.category),
            _ => write!(f, "{}", self.value),
        }
    }
}

pub type Tags = Vec<Tag>;

/// Provider-side aggregation requested for a metric.
///
/// # Examples
///
/// ```
/// use oxtrap_common::types::Statistic;
///
/// let stat: Statistic = "samplecount".parse().unwrap();
/// assert_eq!(stat, Statistic::SampleCount);
/// assert_eq!(stat.to_string(), "SampleCount");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Statistic {
    Average,
    Sum,
    Minimum,
    Maximum,
    SampleCount,
}

impl Statistic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Statistic::Average => "Average",
            Statistic::Sum => "Sum",
            Statistic::Minimum => "Minimum",
            Statistic::Maximum => "Maximum",
            Statistic::SampleCount => "SampleCount",
        }
    }
}

impl std::fmt::Display for Statistic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Statistic {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "average" => Ok(Statistic::Average),
            "sum" => Ok(Statistic::Sum),
            "minimum" => Ok(Statistic::Minimum),
            "maximum" => Ok(Statistic::Maximum),
            "samplecount" => Ok(Statistic::SampleCount),
            _ => Err(format!("unknown statistic: {s}")),
        }
    }
}

/// Wire type of a sample as understood by the destination broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricType {
    Int32,
    Uint32,
    Int64,
    Uint64,
    Float64,
    Text,
    Histogram,
}

impl MetricType {
    /// Single-character code used in the `_type` field.
    pub fn code(&self) -> &'static str {
        match self {
            MetricType::Int32 => "i",
            MetricType::Uint32 => "I",
            MetricType::Int64 => "l",
            MetricType::Uint64 => "L",
            MetricType::Float64 => "n",
            MetricType::Text => "s",
            MetricType::Histogram => "h",
        }
    }
}

impl std::fmt::Display for MetricType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

impl std::str::FromStr for MetricType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "i" => Ok(MetricType::Int32),
            "I" => Ok(MetricType::Uint32),
            "l" => Ok(MetricType::Int64),
            "L" => Ok(MetricType::Uint64),
            "n" => Ok(MetricType::Float64),
            "s" => Ok(MetricType::Text),
            "h" => Ok(MetricType::Histogram),
            _ => Err(format!("unrecognized metric type: {s}")),
        }
    }
}

/// Value carried by one sample.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MetricValue {
    Float(f64),
    Int(i64),
    Uint(u64),
    Text(String),
}

impl MetricValue {
    /// Whether this value can be sent with the given wire type.
    pub fn fits(&self, metric_type: MetricType) -> bool {
        match self {
            MetricValue::Text(_) => metric_type == MetricType::Text,
            MetricValue::Float(_) => {
                matches!(metric_type, MetricType::Float64 | MetricType::Histogram)
            }
            MetricValue::Int(_) => matches!(
                metric_type,
                MetricType::Int32 | MetricType::Int64 | MetricType::Float64 | MetricType::Histogram
            ),
            MetricValue::Uint(_) => matches!(
                metric_type,
                MetricType::Uint32
                    | MetricType::Uint64
                    | MetricType::Float64
                    | MetricType::Histogram
            ),
        }
    }
}

impl std::fmt::Display for MetricValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetricValue::Float(v) => write!(f, "{v}"),
            MetricValue::Int(v) => write!(f, "{v}"),
            MetricValue::Uint(v) => write!(f, "{v}"),
            MetricValue::Text(v) => f.write_str(v),
        }
    }
}

/// One encoded-name sample ready to be written to a submission buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    pub name: String,
    pub metric_type: MetricType,
    pub value: MetricValue,
    pub timestamp: Option<DateTime<Utc>>,
}

/// How a collected metric is reported to the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DestinationKind {
    Gauge,
    Counter,
    Histogram,
    Text,
}

impl DestinationKind {
    pub fn metric_type(&self) -> MetricType {
        match self {
            DestinationKind::Gauge | DestinationKind::Counter => MetricType::Float64,
            DestinationKind::Histogram => MetricType::Histogram,
            DestinationKind::Text => MetricType::Text,
        }
    }
}

/// The provider side of a metric mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderMetric {
    #[serde(default)]
    pub disabled: bool,
    pub name: String,
    pub stats: Vec<Statistic>,
    #[serde(default)]
    pub units: String,
}

/// The destination side of a metric mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DestinationMetric {
    /// Defaults to the provider metric name when empty.
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub kind: DestinationKind,
    /// Extra stream tags for this metric only.
    #[serde(default)]
    pub tags: Tags,
}

/// Pairs a provider metric with how it is reported downstream.
///
/// Accepts the legacy `aws`/`circonus` keys as aliases so existing account
/// files keep loading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricDefinition {
    #[serde(alias = "aws")]
    pub provider: ProviderMetric,
    #[serde(alias = "circonus")]
    pub destination: DestinationMetric,
}

impl MetricDefinition {
    pub fn new(name: &str, stats: &[Statistic], units: &str, kind: DestinationKind) -> Self {
        Self {
            provider: ProviderMetric {
                disabled: false,
                name: name.to_string(),
                stats: stats.to_vec(),
                units: units.to_string(),
            },
            destination: DestinationMetric {
                name: String::new(),
                kind,
                tags: Tags::new(),
            },
        }
    }

    pub fn destination_name(&self) -> &str {
        if self.destination.name.is_empty() {
            &self.provider.name
        } else {
            &self.destination.name
        }
    }
}

/// The `[start, end]` range requested from the provider, plus the sample
/// granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub granularity_secs: i64,
}

impl TimeWindow {
    pub fn span(&self) -> Duration {
        self.end - self.start
    }
}

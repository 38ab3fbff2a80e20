pub mod catalog;
pub mod cloudwatch;
pub mod collector;
pub mod engine;
pub mod error;

use chrono::{DateTime, Utc};
use oxtrap_common::types::{Statistic, Tags, TimeWindow};
use serde::{Deserialize, Serialize};

/// One `name=value` metric dimension.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dimension {
    #[serde(alias = "Name")]
    pub name: String,
    #[serde(alias = "Value")]
    pub value: String,
}

impl Dimension {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A monitored resource found by discovery (an instance, a volume, a queue).
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    pub id: String,
    /// Dimensions that select this resource's metrics.
    pub dimensions: Vec<Dimension>,
    /// Identity tags added to every sample of the resource.
    pub tags: Tags,
}

/// A per-metric statistics query.
#[derive(Debug, Clone, PartialEq)]
pub struct StatisticsQuery {
    pub namespace: String,
    pub metric_name: String,
    pub statistics: Vec<Statistic>,
    pub dimensions: Vec<Dimension>,
    pub window: TimeWindow,
}

/// One aggregated datapoint; only the requested statistics are set.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Datapoint {
    pub timestamp: DateTime<Utc>,
    pub average: Option<f64>,
    pub sum: Option<f64>,
    pub minimum: Option<f64>,
    pub maximum: Option<f64>,
    pub sample_count: Option<f64>,
    pub unit: String,
}

impl Datapoint {
    pub fn value(&self, stat: Statistic) -> Option<f64> {
        match stat {
            Statistic::Average => self.average,
            Statistic::Sum => self.sum,
            Statistic::Minimum => self.minimum,
            Statistic::Maximum => self.maximum,
            Statistic::SampleCount => self.sample_count,
        }
    }
}

/// One `(metric, statistic)` pair inside a batched query.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchItem {
    /// Correlation id echoed back on the matching result.
    pub id: String,
    pub namespace: String,
    pub metric_name: String,
    pub statistic: Statistic,
    pub dimensions: Vec<Dimension>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchQuery {
    pub items: Vec<BatchItem>,
    pub window: TimeWindow,
    pub next_token: Option<String>,
}

/// Time series for one batch item, in whatever order the provider chose.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BatchResult {
    pub id: String,
    pub timestamps: Vec<DateTime<Utc>>,
    pub values: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct BatchPage {
    pub results: Vec<BatchResult>,
    pub next_token: Option<String>,
}

/// Provider monitoring API, bound to one account's credentials and region.
#[async_trait::async_trait]
pub trait MetricsApi: Send + Sync {
    /// Provider name used in logs and errors (e.g. "cloudwatch").
    fn name(&self) -> &str;

    /// Most items a single batched query may carry.
    fn batch_limit(&self) -> usize {
        100
    }

    /// Resources in `namespace` that report metrics with `dimension`.
    async fn list_resources(&self, namespace: &str, dimension: &str) -> error::Result<Vec<Resource>>;

    async fn get_statistics(&self, query: &StatisticsQuery) -> error::Result<Vec<Datapoint>>;

    async fn get_metric_data(&self, query: &BatchQuery) -> error::Result<BatchPage>;
}

//! Pulls samples for a set of metric definitions from a [`MetricsApi`] and
//! writes them to a [`MetricBuffer`].
//!
//! Two strategies are supported. `Statistics` issues one query per metric.
//! `Batched` packs `(metric, statistic)` pairs into provider-sized batches and
//! demultiplexes the results through correlation ids.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use oxtrap_check::tags::metric_name_with_stream_tags;
use oxtrap_check::MetricBuffer;
use oxtrap_common::types::{DestinationKind, MetricDefinition, MetricValue, Statistic, Tag, TimeWindow};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::{BatchItem, BatchQuery, BatchResult, Datapoint, Dimension, MetricsApi, StatisticsQuery};

/// How samples are fetched from the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalMode {
    #[default]
    Statistics,
    Batched,
}

/// Id attached to one batch item: `m<metric index>s<statistic>q<sequence>`.
///
/// # Examples
///
/// ```
/// use oxtrap_cloud::engine::CorrelationId;
/// use oxtrap_common::types::Statistic;
///
/// let id: CorrelationId = "m3sSampleCountq17".parse().unwrap();
/// assert_eq!(id, CorrelationId { metric: 3, stat: Statistic::SampleCount, seq: 17 });
/// assert_eq!(id.to_string(), "m3sSampleCountq17");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CorrelationId {
    pub metric: usize,
    pub stat: Statistic,
    pub seq: usize,
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m{}s{}q{}", self.metric, self.stat, self.seq)
    }
}

impl FromStr for CorrelationId {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let invalid = || format!("invalid correlation id: {s}");
        let rest = s.strip_prefix('m').ok_or_else(invalid)?;
        let (metric, rest) = rest.split_once('s').ok_or_else(invalid)?;
        let (stat, seq) = rest.rsplit_once('q').ok_or_else(invalid)?;
        Ok(CorrelationId {
            metric: metric.parse().map_err(|_| invalid())?,
            stat: stat.parse().map_err(|_| invalid())?,
            seq: seq.parse().map_err(|_| invalid())?,
        })
    }
}

/// Retrieval for one namespace and one metric catalog.
pub struct RetrievalEngine<'a> {
    api: &'a dyn MetricsApi,
    namespace: &'a str,
    metrics: &'a [MetricDefinition],
    cancel: &'a CancellationToken,
}

impl<'a> RetrievalEngine<'a> {
    pub fn new(
        api: &'a dyn MetricsApi,
        namespace: &'a str,
        metrics: &'a [MetricDefinition],
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            api,
            namespace,
            metrics,
            cancel,
        }
    }

    /// Collects every enabled metric for `dimensions` over `window`.
    ///
    /// Returns the number of lines written. Access-denied errors abort and are
    /// returned so the collector can back off; any other provider error is
    /// logged and the next metric or batch is tried.
    pub async fn collect(
        &self,
        mode: RetrievalMode,
        window: &TimeWindow,
        dimensions: &[Dimension],
        tags: &[Tag],
        buf: &mut MetricBuffer,
    ) -> Result<usize> {
        let before = buf.len();
        match mode {
            RetrievalMode::Statistics => self.collect_statistics(window, dimensions, tags, buf).await?,
            RetrievalMode::Batched => self.collect_batched(window, dimensions, tags, buf).await?,
        }
        Ok(buf.len() - before)
    }

    async fn collect_statistics(
        &self,
        window: &TimeWindow,
        dimensions: &[Dimension],
        tags: &[Tag],
        buf: &mut MetricBuffer,
    ) -> Result<()> {
        for def in self.metrics.iter().filter(|d| !d.provider.disabled) {
            if self.cancel.is_cancelled() {
                return Ok(());
            }

            let query = StatisticsQuery {
                namespace: self.namespace.to_string(),
                metric_name: def.provider.name.clone(),
                statistics: def.provider.stats.clone(),
                dimensions: dimensions.to_vec(),
                window: *window,
            };
            let mut datapoints: Vec<Datapoint> = match self.api.get_statistics(&query).await {
                Ok(dps) => dps,
                Err(e) if e.is_access_denied() => return Err(e),
                Err(e) => {
                    tracing::warn!(
                        namespace = %self.namespace,
                        metric = %def.provider.name,
                        error = %e,
                        "retrieving metric statistics"
                    );
                    continue;
                }
            };

            datapoints.sort_by_key(|dp| dp.timestamp);
            for dp in &datapoints {
                for stat in &def.provider.stats {
                    if let Some(value) = dp.value(*stat) {
                        record_metric(buf, def, *stat, value, dp.timestamp, tags, &dp.unit);
                    }
                }
            }
        }
        Ok(())
    }

    async fn collect_batched(
        &self,
        window: &TimeWindow,
        dimensions: &[Dimension],
        tags: &[Tag],
        buf: &mut MetricBuffer,
    ) -> Result<()> {
        let pairs: Vec<(usize, Statistic)> = self
            .metrics
            .iter()
            .enumerate()
            .filter(|(_, d)| !d.provider.disabled)
            .flat_map(|(idx, d)| d.provider.stats.iter().map(move |stat| (idx, *stat)))
            .collect();
        let limit = self.api.batch_limit().max(1);

        for (batch, chunk) in pairs.chunks(limit).enumerate() {
            if self.cancel.is_cancelled() {
                return Ok(());
            }

            let items = chunk
                .iter()
                .enumerate()
                .map(|(offset, (metric, stat))| BatchItem {
                    id: CorrelationId {
                        metric: *metric,
                        stat: *stat,
                        seq: batch * limit + offset,
                    }
                    .to_string(),
                    namespace: self.namespace.to_string(),
                    metric_name: self.metrics[*metric].provider.name.clone(),
                    statistic: *stat,
                    dimensions: dimensions.to_vec(),
                })
                .collect();
            let mut query = BatchQuery {
                items,
                window: *window,
                next_token: None,
            };

            loop {
                let page = match self.api.get_metric_data(&query).await {
                    Ok(page) => page,
                    Err(e) if e.is_access_denied() => return Err(e),
                    Err(e) => {
                        tracing::warn!(
                            namespace = %self.namespace,
                            batch,
                            error = %e,
                            "retrieving metric data"
                        );
                        break;
                    }
                };

                for result in page.results {
                    self.record_result(&pairs, result, tags, buf);
                }

                match page.next_token {
                    Some(token) if !self.cancel.is_cancelled() => query.next_token = Some(token),
                    _ => break,
                }
            }
        }
        Ok(())
    }

    fn record_result(
        &self,
        pairs: &[(usize, Statistic)],
        result: BatchResult,
        tags: &[Tag],
        buf: &mut MetricBuffer,
    ) {
        let id = match result.id.parse::<CorrelationId>() {
            Ok(id) if pairs.get(id.seq) == Some(&(id.metric, id.stat)) => id,
            Ok(_) => {
                tracing::warn!(namespace = %self.namespace, id = %result.id, "correlation id out of range, skipping");
                return;
            }
            Err(e) => {
                tracing::warn!(namespace = %self.namespace, error = %e, "skipping result");
                return;
            }
        };
        let def = &self.metrics[id.metric];

        if result.timestamps.len() != result.values.len() {
            tracing::debug!(
                id = %result.id,
                timestamps = result.timestamps.len(),
                values = result.values.len(),
                "mismatched result lengths"
            );
        }
        let mut samples: Vec<(DateTime<Utc>, f64)> =
            result.timestamps.into_iter().zip(result.values).collect();
        samples.sort_by_key(|(ts, _)| *ts);

        for (ts, value) in samples {
            record_metric(buf, def, id.stat, value, ts, tags, "");
        }
    }
}

/// Writes one sample named `<destination name>`<statistic>`.
///
/// Tags are the caller's plus the metric's own plus a `units` tag, taken from
/// the definition or else from the datapoint.
pub fn record_metric(
    buf: &mut MetricBuffer,
    def: &MetricDefinition,
    stat: Statistic,
    value: f64,
    timestamp: DateTime<Utc>,
    tags: &[Tag],
    datapoint_unit: &str,
) {
    let mut all_tags: Vec<Tag> = tags.to_vec();
    all_tags.extend(def.destination.tags.iter().cloned());
    let units = if def.provider.units.is_empty() {
        datapoint_unit
    } else {
        def.provider.units.as_str()
    };
    if !units.is_empty() && units != "None" {
        all_tags.push(Tag::new("units", units.to_lowercase()));
    }

    let name = metric_name_with_stream_tags(
        &format!("{}`{}", def.destination_name(), stat),
        &all_tags,
    );
    let value = match def.destination.kind {
        DestinationKind::Text => MetricValue::Text(value.to_string()),
        _ => MetricValue::Float(value),
    };

    if let Err(e) = buf.write_sample(&name, def.destination.kind.metric_type(), &value, Some(timestamp)) {
        tracing::warn!(metric = %def.provider.name, error = %e, "recording metric");
    }
}

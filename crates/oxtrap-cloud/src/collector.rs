use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use oxtrap_check::{MetricBuffer, MetricSink};
use oxtrap_common::types::{MetricDefinition, Tag, Tags, TimeWindow};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::catalog;
use crate::engine::{RetrievalEngine, RetrievalMode};
use crate::error::{CollectError, ProviderError};
use crate::{Dimension, MetricsApi};

/// How long a collector stays disabled after an access-denied error.
pub const DISABLE_SECS: i64 = 3600;

/// One collector's entry in an account region's `services` list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub namespace: String,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub dimensions: Vec<Dimension>,
    /// Replaces the built-in catalog when non-empty.
    #[serde(default)]
    pub metrics: Vec<MetricDefinition>,
    #[serde(default)]
    pub tags: Tags,
    #[serde(default)]
    pub retrieval: RetrievalMode,
    /// Discover resources on this dimension and collect each one separately.
    #[serde(default)]
    pub resource_dimension: Option<String>,
}

/// Everything a collector needs for one run.
pub struct CollectContext<'a> {
    pub api: &'a dyn MetricsApi,
    pub sink: &'a dyn MetricSink,
    pub window: &'a TimeWindow,
    pub base_tags: &'a [Tag],
    pub cancel: &'a CancellationToken,
    pub now: DateTime<Utc>,
}

#[async_trait]
pub trait Collector: Send + Sync {
    fn id(&self) -> &str;

    /// Built-in catalog for this collector's namespace, empty when none ships.
    fn default_metrics(&self) -> Vec<MetricDefinition>;

    async fn collect(
        &mut self,
        ctx: &CollectContext<'_>,
        buf: &mut MetricBuffer,
    ) -> Result<(), CollectError>;
}

/// State shared by every collector: identity, catalog, tags and the
/// access-denied back-off.
#[derive(Debug, Clone)]
pub struct BaseCollector {
    pub namespace: String,
    pub enabled: bool,
    pub disabled_at: Option<DateTime<Utc>>,
    pub disable_cause: Option<String>,
    pub dimensions: Vec<Dimension>,
    pub metrics: Vec<MetricDefinition>,
    pub tags: Tags,
    pub mode: RetrievalMode,
}

impl BaseCollector {
    pub fn new(namespace: &str, config: &ServiceConfig, metrics: Vec<MetricDefinition>) -> Self {
        let mut tags = config.tags.clone();
        tags.push(Tag::new("service", namespace));
        Self {
            namespace: namespace.to_string(),
            enabled: true,
            disabled_at: None,
            disable_cause: None,
            dimensions: config.dimensions.clone(),
            metrics,
            tags,
            mode: config.retrieval,
        }
    }

    /// Whether the collector may query at `now`. Re-enables once the back-off
    /// has elapsed.
    pub fn ready(&mut self, now: DateTime<Utc>) -> bool {
        if self.enabled {
            return true;
        }
        let since = self.disabled_at.map(|at| now - at);
        if since.map_or(true, |d| d >= Duration::seconds(DISABLE_SECS)) {
            tracing::info!(collector = %self.namespace, "re-enabling collector");
            self.enabled = true;
            self.disabled_at = None;
            self.disable_cause = None;
            return true;
        }
        tracing::debug!(
            collector = %self.namespace,
            cause = self.disable_cause.as_deref().unwrap_or_default(),
            "collector disabled, skipping"
        );
        false
    }

    /// Disables the collector on access-denied errors; anything else is
    /// only logged.
    pub fn track_error(&mut self, err: &ProviderError, now: DateTime<Utc>) {
        if err.is_access_denied() {
            tracing::warn!(
                collector = %self.namespace,
                error = %err,
                "access denied, disabling collector for {DISABLE_SECS}s"
            );
            self.enabled = false;
            self.disabled_at = Some(now);
            self.disable_cause = Some(err.to_string());
        } else {
            tracing::warn!(collector = %self.namespace, error = %err, "provider error");
        }
    }

    fn provider_error(&mut self, err: ProviderError, now: DateTime<Utc>) -> CollectError {
        self.track_error(&err, now);
        CollectError::Provider {
            collector: self.namespace.clone(),
            source: err,
        }
    }

    fn sample_tags(&self, base: &[Tag], extra: &[Tag], dimensions: &[Dimension]) -> Tags {
        let mut tags = base.to_vec();
        tags.extend(self.tags.iter().cloned());
        tags.extend(extra.iter().cloned());
        tags.extend(dimensions.iter().map(|d| Tag::new(d.name.as_str(), d.value.as_str())));
        tags
    }

    fn default_metrics(&self) -> Vec<MetricDefinition> {
        catalog::lookup(&self.namespace)
            .map(|e| e.default_metrics())
            .unwrap_or_default()
    }
}

/// Collects a namespace once with its configured dimensions.
pub struct NamespaceCollector {
    base: BaseCollector,
}

impl NamespaceCollector {
    pub fn new(base: BaseCollector) -> Self {
        Self { base }
    }
}

#[async_trait]
impl Collector for NamespaceCollector {
    fn id(&self) -> &str {
        &self.base.namespace
    }

    fn default_metrics(&self) -> Vec<MetricDefinition> {
        self.base.default_metrics()
    }

    async fn collect(
        &mut self,
        ctx: &CollectContext<'_>,
        buf: &mut MetricBuffer,
    ) -> Result<(), CollectError> {
        if !self.base.ready(ctx.now) {
            return Ok(());
        }

        let tags = self
            .base
            .sample_tags(ctx.base_tags, &[], &self.base.dimensions);
        let result = RetrievalEngine::new(ctx.api, &self.base.namespace, &self.base.metrics, ctx.cancel)
            .collect(self.base.mode, ctx.window, &self.base.dimensions, &tags, buf)
            .await;

        match result {
            Ok(samples) => {
                tracing::debug!(collector = %self.base.namespace, samples, "collected");
                Ok(())
            }
            Err(e) => Err(self.base.provider_error(e, ctx.now)),
        }
    }
}

/// Discovers resources on one dimension and collects each one, submitting
/// per resource.
pub struct ResourceCollector {
    base: BaseCollector,
    resource_dimension: String,
}

impl ResourceCollector {
    pub fn new(base: BaseCollector, resource_dimension: &str) -> Self {
        Self {
            base,
            resource_dimension: resource_dimension.to_string(),
        }
    }
}

#[async_trait]
impl Collector for ResourceCollector {
    fn id(&self) -> &str {
        &self.base.namespace
    }

    fn default_metrics(&self) -> Vec<MetricDefinition> {
        self.base.default_metrics()
    }

    async fn collect(
        &mut self,
        ctx: &CollectContext<'_>,
        buf: &mut MetricBuffer,
    ) -> Result<(), CollectError> {
        if !self.base.ready(ctx.now) {
            return Ok(());
        }

        let resources = match ctx
            .api
            .list_resources(&self.base.namespace, &self.resource_dimension)
            .await
        {
            Ok(resources) => resources,
            Err(e) => return Err(self.base.provider_error(e, ctx.now)),
        };
        tracing::debug!(
            collector = %self.base.namespace,
            dimension = %self.resource_dimension,
            resources = resources.len(),
            "discovered resources"
        );

        for resource in resources {
            if ctx.cancel.is_cancelled() {
                break;
            }

            let mut dimensions = self.base.dimensions.clone();
            dimensions.extend(resource.dimensions.iter().cloned());
            let tags = self
                .base
                .sample_tags(ctx.base_tags, &resource.tags, &dimensions);

            let result = RetrievalEngine::new(ctx.api, &self.base.namespace, &self.base.metrics, ctx.cancel)
                .collect(self.base.mode, ctx.window, &dimensions, &tags, buf)
                .await;
            if let Err(e) = result {
                buf.reset();
                return Err(self.base.provider_error(e, ctx.now));
            }

            if let Err(e) = ctx.sink.submit(buf).await {
                tracing::warn!(
                    collector = %self.base.namespace,
                    resource = %resource.id,
                    error = %e,
                    "submitting resource telemetry"
                );
                ctx.sink
                    .report_error(&CollectError::Submit {
                        collector: self.base.namespace.clone(),
                        source: e,
                    })
                    .await;
            }
            buf.reset();
        }
        Ok(())
    }
}

/// Builds the collectors for one region.
///
/// Disabled services are skipped, as are namespaces with no built-in catalog
/// and no configured metrics. A built-in namespace without configured
/// dimensions discovers resources on its catalog dimension.
pub fn build_collectors(services: &[ServiceConfig]) -> Vec<Box<dyn Collector>> {
    let mut collectors: Vec<Box<dyn Collector>> = Vec::new();

    for service in services {
        if service.disabled {
            tracing::info!(namespace = %service.namespace, "service disabled, skipping");
            continue;
        }

        let entry = catalog::lookup(&service.namespace);
        let metrics = match (service.metrics.is_empty(), entry) {
            (false, _) => service.metrics.clone(),
            (true, Some(entry)) => entry.default_metrics(),
            (true, None) => {
                tracing::warn!(
                    namespace = %service.namespace,
                    "no built-in catalog and no metrics configured, skipping"
                );
                continue;
            }
        };
        let namespace = entry.map_or(service.namespace.trim(), |e| e.namespace);
        let base = BaseCollector::new(namespace, service, metrics);

        let resource_dimension = service.resource_dimension.clone().or_else(|| {
            entry
                .filter(|_| service.dimensions.is_empty())
                .map(|e| e.resource_dimension.to_string())
        });
        match resource_dimension {
            Some(dimension) => collectors.push(Box::new(ResourceCollector::new(base, &dimension))),
            None => collectors.push(Box::new(NamespaceCollector::new(base))),
        }
    }

    collectors
}

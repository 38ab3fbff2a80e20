use std::path::Path;

use anyhow::bail;
use async_trait::async_trait;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::account::{load_accounts, AccountConfig, RegionConfig};
use crate::instance::CollectionInstance;

/// Turns one account region into a running instance.
#[async_trait]
pub trait InstanceFactory: Send + Sync {
    async fn build(
        &self,
        account: &AccountConfig,
        region: &RegionConfig,
    ) -> anyhow::Result<CollectionInstance>;
}

/// Every collection instance of one provider.
pub struct ServiceSupervisor {
    provider: String,
    instances: Vec<CollectionInstance>,
}

impl ServiceSupervisor {
    /// Builds one instance per account region found in `conf_dir`.
    ///
    /// Regions whose instance cannot be built are logged and skipped. Fails
    /// when nothing is left to run.
    pub async fn new(
        provider: &str,
        conf_dir: &Path,
        factory: &dyn InstanceFactory,
    ) -> anyhow::Result<Self> {
        let accounts = load_accounts(conf_dir)?;
        let mut instances = Vec::new();

        for account in &accounts {
            for region in &account.regions {
                match factory.build(account, region).await {
                    Ok(instance) => instances.push(instance),
                    Err(e) => tracing::error!(
                        provider,
                        account = %account.id,
                        region = %region.name,
                        error = %format!("{e:#}"),
                        "skipping instance"
                    ),
                }
            }
        }

        if instances.is_empty() {
            bail!(
                "{provider}: no usable instances in {}",
                conf_dir.display()
            );
        }
        tracing::info!(provider, instances = instances.len(), "provider ready");

        Ok(Self {
            provider: provider.to_string(),
            instances,
        })
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    /// Runs every instance until `cancel` fires and all of them have stopped.
    pub async fn run(self, cancel: CancellationToken) {
        let mut tasks = JoinSet::new();
        for instance in self.instances {
            tasks.spawn(instance.start(cancel.clone()));
        }

        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                tracing::error!(provider = %self.provider, error = %e, "instance task failed");
            }
        }
        tracing::info!(provider = %self.provider, "provider stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::Pipeline;
    use oxtrap_check::{MetricBuffer, MetricSink};
    use oxtrap_cloud::error::Result as ProviderResult;
    use oxtrap_cloud::{BatchPage, BatchQuery, Datapoint, MetricsApi, Resource, StatisticsQuery};
    use std::sync::Arc;
    use tokio::sync::Mutex;

    struct NullApi;

    #[async_trait]
    impl MetricsApi for NullApi {
        fn name(&self) -> &str {
            "null"
        }

        async fn list_resources(&self, _namespace: &str, _dimension: &str) -> ProviderResult<Vec<Resource>> {
            Ok(vec![])
        }

        async fn get_statistics(&self, _query: &StatisticsQuery) -> ProviderResult<Vec<Datapoint>> {
            Ok(vec![])
        }

        async fn get_metric_data(&self, _query: &BatchQuery) -> ProviderResult<BatchPage> {
            Ok(BatchPage::default())
        }
    }

    struct NullSink;

    #[async_trait]
    impl MetricSink for NullSink {
        async fn submit(&self, _buf: &MetricBuffer) -> oxtrap_check::Result<()> {
            Ok(())
        }

        async fn report_error(&self, _err: &(dyn std::error::Error + Send + Sync)) {}
    }

    /// Refuses regions named `bad-*`.
    struct StubFactory;

    #[async_trait]
    impl InstanceFactory for StubFactory {
        async fn build(
            &self,
            account: &AccountConfig,
            region: &RegionConfig,
        ) -> anyhow::Result<CollectionInstance> {
            if region.name.starts_with("bad-") {
                bail!("check not found");
            }
            let pipeline = Pipeline {
                account: account.id.clone(),
                region: region.name.clone(),
                api: Arc::new(NullApi),
                sink: Arc::new(NullSink),
                collectors: Mutex::new(vec![]),
                base_tags: vec![],
            };
            Ok(CollectionInstance::new(pipeline, 60))
        }
    }

    fn account_file(id: &str, regions: &[&str]) -> String {
        let regions: Vec<String> = regions
            .iter()
            .map(|r| format!(r#"{{"name": "{r}"}}"#))
            .collect();
        format!(
            r#"{{"id": "{id}", "aws": {{"access_key_id": "a", "secret_access_key": "s"}}, "destination": {{"api_token": "t"}}, "regions": [{}]}}"#,
            regions.join(",")
        )
    }

    #[tokio::test]
    async fn should_skip_instances_that_fail_to_build() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.json"), account_file("a", &["us-east-1", "bad-1"])).unwrap();
        std::fs::write(dir.path().join("b.json"), account_file("b", &["eu-west-1"])).unwrap();

        let supervisor = ServiceSupervisor::new("aws", dir.path(), &StubFactory).await.unwrap();
        assert_eq!(supervisor.provider(), "aws");
        assert_eq!(supervisor.len(), 2);
    }

    #[tokio::test]
    async fn should_fail_without_usable_instances() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.json"), account_file("a", &["bad-1"])).unwrap();

        assert!(ServiceSupervisor::new("aws", dir.path(), &StubFactory).await.is_err());
    }

    #[tokio::test]
    async fn should_stop_all_instances_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.json"), account_file("a", &["r1", "r2", "r3"])).unwrap();
        let supervisor = ServiceSupervisor::new("aws", dir.path(), &StubFactory).await.unwrap();

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(supervisor.run(cancel.clone()));
        cancel.cancel();

        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}

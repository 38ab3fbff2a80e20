//! Builds collection instances for AWS accounts.

use std::sync::Arc;

use anyhow::{bail, Context};
use async_trait::async_trait;
use oxtrap_check::api::HttpCheckApi;
use oxtrap_check::tags::encode_metric_tags;
use oxtrap_check::{CheckConfig, DestinationCheck};
use oxtrap_cloud::catalog;
use oxtrap_cloud::cloudwatch::CloudWatchClient;
use oxtrap_cloud::collector::{build_collectors, ServiceConfig};
use oxtrap_common::types::{Tag, Tags};
use tokio::sync::Mutex;

use crate::account::{AccountConfig, RegionConfig};
use crate::instance::{CollectionInstance, Pipeline};
use crate::supervisor::InstanceFactory;

/// Destination check for one account region.
pub fn check_config(account: &AccountConfig, region: &RegionConfig) -> CheckConfig {
    let dest = &account.destination;
    let mut tags = vec!["oxtrap:aws".to_string(), format!("aws_region:{}", region.name)];
    tags.extend(encode_metric_tags(&account.tags));

    CheckConfig {
        id: format!("aws_{}_{}", account.id, region.name),
        check_bundle_id: dest.check_bundle_id.clone(),
        broker_id: dest.broker_id.clone(),
        broker_ca_file: dest.broker_ca_file.clone(),
        display_name: format!("aws {} {} /oxtrap", account.id, region.name),
        tags,
        trace_metrics: dest.trace_metrics,
    }
}

/// Configured services, or every built-in namespace when none are listed.
pub fn region_services(region: &RegionConfig) -> Vec<ServiceConfig> {
    if !region.services.is_empty() {
        return region.services.clone();
    }
    catalog::namespaces()
        .map(|ns| ServiceConfig {
            namespace: ns.to_string(),
            ..Default::default()
        })
        .collect()
}

fn base_tags(account: &AccountConfig, region: &RegionConfig) -> Tags {
    let mut tags = account.tags.clone();
    tags.extend(region.tags.iter().cloned());
    tags.push(Tag::new("aws_region", region.name.as_str()));
    tags
}

pub struct AwsInstanceFactory;

#[async_trait]
impl InstanceFactory for AwsInstanceFactory {
    async fn build(
        &self,
        account: &AccountConfig,
        region: &RegionConfig,
    ) -> anyhow::Result<CollectionInstance> {
        let collectors = build_collectors(&region_services(region));
        if collectors.is_empty() {
            bail!("no enabled services");
        }

        let api = match &region.endpoint {
            Some(endpoint) => {
                CloudWatchClient::with_endpoint(&region.name, account.aws.clone(), endpoint)?
            }
            None => CloudWatchClient::new(&region.name, account.aws.clone())?,
        };

        let dest = &account.destination;
        let check_api = HttpCheckApi::new(
            &dest.api_url,
            &dest.api_token,
            &dest.api_app,
            dest.api_ca_file.as_deref(),
        )?;
        let check = DestinationCheck::new(check_config(account, region), Arc::new(check_api))
            .await
            .context("resolving destination check")?;
        tracing::info!(
            account = %account.id,
            region = %region.name,
            check = %check.id(),
            collectors = collectors.len(),
            "destination check resolved"
        );

        let pipeline = Pipeline {
            account: account.id.clone(),
            region: region.name.clone(),
            api: Arc::new(api),
            sink: Arc::new(check),
            collectors: Mutex::new(collectors),
            base_tags: base_tags(account, region),
        };
        Ok(CollectionInstance::new(pipeline, account.period.secs()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::{DestinationConfig, Period};
    use oxtrap_cloud::cloudwatch::AwsCredentials;

    fn account() -> AccountConfig {
        AccountConfig {
            id: "1234".to_string(),
            aws: AwsCredentials {
                access_key_id: "AKID".to_string(),
                secret_access_key: "secret".to_string(),
                session_token: None,
            },
            regions: vec![region()],
            destination: DestinationConfig {
                api_token: "token".to_string(),
                api_app: "oxtrap".to_string(),
                api_url: "http://127.0.0.1:1/v2/".to_string(),
                api_ca_file: None,
                check_bundle_id: None,
                broker_id: Some("/broker/7".to_string()),
                broker_ca_file: None,
                trace_metrics: true,
            },
            period: Period::Detailed,
            tags: vec![Tag::new("Team", "Infra")],
        }
    }

    fn region() -> RegionConfig {
        RegionConfig {
            name: "us-east-1".to_string(),
            services: vec![],
            tags: vec![Tag::new("tier", "prod")],
            endpoint: None,
        }
    }

    #[test]
    fn should_derive_check_identity_from_account_and_region() {
        let config = check_config(&account(), &region());
        assert_eq!(config.id, "aws_1234_us-east-1");
        assert_eq!(config.display_name, "aws 1234 us-east-1 /oxtrap");
        assert_eq!(
            config.tags,
            vec!["oxtrap:aws", "aws_region:us-east-1", "team:infra"]
        );
        assert_eq!(config.broker_id.as_deref(), Some("/broker/7"));
        assert!(config.trace_metrics);
    }

    #[test]
    fn should_default_to_every_builtin_namespace() {
        let services = region_services(&region());
        assert_eq!(services.len(), catalog::namespaces().count());

        let mut configured = region();
        configured.services = vec![ServiceConfig {
            namespace: "AWS/SQS".to_string(),
            ..Default::default()
        }];
        assert_eq!(region_services(&configured).len(), 1);
    }

    #[test]
    fn should_merge_account_and_region_tags() {
        let tags = base_tags(&account(), &region());
        assert_eq!(
            tags,
            vec![
                Tag::new("Team", "Infra"),
                Tag::new("tier", "prod"),
                Tag::new("aws_region", "us-east-1"),
            ]
        );
    }

    #[tokio::test]
    async fn should_fail_when_check_cannot_be_resolved() {
        let result = AwsInstanceFactory.build(&account(), &region()).await;
        assert!(result.is_err());
    }
}

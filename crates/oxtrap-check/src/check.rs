use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use oxtrap_common::types::{MetricType, MetricValue};
use rand::RngCore;
use rustls::ClientConfig;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use url::Url;

use crate::api::{Broker, CheckApi, CheckBundle};
use crate::broker::{broker_cn, build_tls_config, uses_public_certificate};
use crate::error::{CheckError, Result};
use crate::sample::MetricBuffer;
use crate::submit::SubmissionClient;

/// Text metric carrying collection errors to the destination.
pub const ERROR_METRIC_NAME: &str = "oxtrap_errors";

const CHECK_TYPE: &str = "httptrap";
const STATUS_ACTIVE: &str = "active";
const PUBLIC_TRAP_BROKER: &str = "/broker/35";
const UNLIMITED_METRICS: i64 = -1;

/// Identifies and configures the destination check for one instance.
#[derive(Debug, Clone, Default)]
pub struct CheckConfig {
    /// Correlation key; bundles are searched and created with this as target.
    pub id: String,
    /// Use this bundle instead of searching.
    pub check_bundle_id: Option<String>,
    /// Broker for newly created bundles. Defaults to the public trap broker.
    pub broker_id: Option<String>,
    /// CA used for broker TLS instead of the one served by the API.
    pub broker_ca_file: Option<PathBuf>,
    pub display_name: String,
    /// `category:value` tags applied to newly created bundles.
    pub tags: Vec<String>,
    pub trace_metrics: bool,
}

#[derive(Default)]
struct CheckState {
    bundle: Option<CheckBundle>,
    broker: Option<Broker>,
    tls: Option<Arc<ClientConfig>>,
}

impl CheckState {
    fn is_resolved(&self) -> bool {
        self.bundle.is_some() && self.broker.is_some()
    }

    fn submission_url(&self) -> Result<String> {
        let bundle = self
            .bundle
            .as_ref()
            .ok_or_else(|| CheckError::InvalidState("no check bundle".to_string()))?;
        bundle
            .submission_url()
            .map(str::to_string)
            .ok_or_else(|| {
                CheckError::InvalidState(format!("check bundle {} has no submission url", bundle.cid))
            })
    }
}

fn make_secret() -> String {
    let mut seed = [0u8; 2048];
    rand::thread_rng().fill_bytes(&mut seed);
    let digest = hex::encode(Sha256::digest(seed));
    digest[..16].to_string()
}

/// Where collectors hand their buffered samples.
#[async_trait]
pub trait MetricSink: Send + Sync {
    async fn submit(&self, buf: &MetricBuffer) -> Result<()>;

    /// Best-effort report of a collection error. Failures are only logged.
    async fn report_error(&self, err: &(dyn std::error::Error + Send + Sync));

    /// Empty buffer configured for this destination.
    fn new_buffer(&self) -> MetricBuffer {
        MetricBuffer::new()
    }
}

/// One destination check: the bundle samples are filed under and the broker
/// that ingests them.
///
/// Bundle, broker and broker TLS are resolved and cleared together under one
/// lock, so a submit never sees a half refreshed check.
pub struct DestinationCheck {
    config: CheckConfig,
    api: Arc<dyn CheckApi>,
    state: Mutex<CheckState>,
}

impl DestinationCheck {
    /// Resolves (or creates) the bundle and its broker.
    pub async fn new(config: CheckConfig, api: Arc<dyn CheckApi>) -> Result<Self> {
        if config.id.is_empty() {
            return Err(CheckError::ConfigError("check id is required".to_string()));
        }
        let check = Self {
            config,
            api,
            state: Mutex::new(CheckState::default()),
        };
        {
            let mut state = check.state.lock().await;
            check.resolve(&mut state).await?;
        }
        Ok(check)
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    async fn resolve(&self, state: &mut CheckState) -> Result<()> {
        *state = CheckState::default();

        let bundle = self.resolve_bundle().await?;
        let broker_cid = bundle.brokers.first().ok_or_else(|| {
            CheckError::InvalidState(format!("check bundle {} has no brokers", bundle.cid))
        })?;
        let broker = self.api.fetch_broker(broker_cid).await?;
        let tls = self.broker_tls(&bundle, &broker).await?;

        tracing::debug!(
            check = %self.config.id,
            bundle = %bundle.cid,
            broker = %broker.cid,
            custom_tls = tls.is_some(),
            "destination check resolved"
        );

        state.bundle = Some(bundle);
        state.broker = Some(broker);
        state.tls = tls;
        Ok(())
    }

    async fn resolve_bundle(&self) -> Result<CheckBundle> {
        match self.config.check_bundle_id.as_deref() {
            Some(cid) if !cid.is_empty() => {
                let bundle = self.api.fetch_check_bundle(cid).await?;
                if !bundle.is_active() {
                    return Err(CheckError::InactiveBundle(bundle.cid));
                }
                Ok(bundle)
            }
            _ => self.find_or_create_bundle().await,
        }
    }

    async fn find_or_create_bundle(&self) -> Result<CheckBundle> {
        let query = format!("(active:1)(type:\"{CHECK_TYPE}\")(host:{})", self.config.id);
        let bundles = self.api.search_check_bundles(&query).await?;

        let mut active: Vec<CheckBundle> = bundles.into_iter().filter(|b| b.is_active()).collect();
        match active.len() {
            0 => self.create_bundle().await,
            1 => Ok(active.remove(0)),
            count => Err(CheckError::AmbiguousBundle { count, query }),
        }
    }

    async fn create_bundle(&self) -> Result<CheckBundle> {
        let broker = self
            .config
            .broker_id
            .clone()
            .filter(|b| !b.is_empty())
            .unwrap_or_else(|| PUBLIC_TRAP_BROKER.to_string());

        let request = CheckBundle {
            brokers: vec![broker],
            config: [
                ("asynch_metrics".to_string(), "true".to_string()),
                ("secret".to_string(), make_secret()),
            ]
            .into_iter()
            .collect(),
            display_name: self.config.display_name.clone(),
            metric_filters: vec![
                vec!["deny".to_string(), "^$".to_string(), String::new()],
                vec!["allow".to_string(), "^.+$".to_string(), String::new()],
            ],
            metric_limit: UNLIMITED_METRICS,
            notes: Some(format!("oxtrap-{}", env!("CARGO_PKG_VERSION"))),
            period: 60,
            status: STATUS_ACTIVE.to_string(),
            tags: self.config.tags.clone(),
            target: self.config.id.clone(),
            timeout: 10.0,
            check_type: CHECK_TYPE.to_string(),
            ..Default::default()
        };

        let bundle = self.api.create_check_bundle(&request).await?;
        tracing::info!(check = %self.config.id, bundle = %bundle.cid, "created check bundle");
        Ok(bundle)
    }

    async fn broker_tls(
        &self,
        bundle: &CheckBundle,
        broker: &Broker,
    ) -> Result<Option<Arc<ClientConfig>>> {
        let submission_url = bundle.submission_url().ok_or_else(|| {
            CheckError::InvalidState(format!("check bundle {} has no submission url", bundle.cid))
        })?;
        if uses_public_certificate(submission_url) || Url::parse(submission_url)?.scheme() != "https" {
            return Ok(None);
        }

        let cn = broker_cn(broker, submission_url)?;
        let ca = match &self.config.broker_ca_file {
            Some(path) => tokio::fs::read(path).await?,
            None => self.api.fetch_ca_cert().await?.into_bytes(),
        };
        build_tls_config(&ca, &cn).map(Some)
    }

    /// Drops the resolved bundle and broker and resolves them again.
    pub async fn refresh(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        self.resolve(&mut state).await
    }

    pub async fn submission_url(&self) -> Result<String> {
        self.state.lock().await.submission_url()
    }

    pub async fn bundle_cid(&self) -> Option<String> {
        self.state.lock().await.bundle.as_ref().map(|b| b.cid.clone())
    }
}

#[async_trait]
impl MetricSink for DestinationCheck {
    /// Sends the buffer to the broker.
    ///
    /// A failed submission refreshes the check. When the refresh yields a
    /// different submission URL the payload is retried once there.
    async fn submit(&self, buf: &MetricBuffer) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }

        let mut state = self.state.lock().await;
        if !state.is_resolved() {
            self.resolve(&mut state).await?;
        }

        let url = state.submission_url()?;
        let err = match SubmissionClient::new(state.tls.clone())
            .submit(&url, buf.as_bytes())
            .await
        {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };

        tracing::warn!(check = %self.config.id, error = %err, "submission failed, refreshing check");
        if let Err(refresh_err) = self.resolve(&mut state).await {
            tracing::error!(check = %self.config.id, error = %refresh_err, "refreshing check");
            return Err(err);
        }

        let moved = state.submission_url()?;
        if moved == url {
            return Err(err);
        }

        tracing::info!(check = %self.config.id, from = %url, to = %moved, "check moved, retrying submission");
        SubmissionClient::new(state.tls.clone())
            .submit(&moved, buf.as_bytes())
            .await
    }

    async fn report_error(&self, err: &(dyn std::error::Error + Send + Sync)) {
        let mut buf = self.new_buffer();
        let value = MetricValue::Text(err.to_string());
        if let Err(e) = buf.write_sample(ERROR_METRIC_NAME, MetricType::Text, &value, None) {
            tracing::error!(check = %self.config.id, error = %e, "writing error metric sample");
            return;
        }
        if let Err(e) = self.submit(&buf).await {
            tracing::error!(check = %self.config.id, error = %e, "submitting error metric sample");
        }
    }

    fn new_buffer(&self) -> MetricBuffer {
        MetricBuffer::with_trace(self.config.trace_metrics)
    }
}

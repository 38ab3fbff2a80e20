//! AWS CloudWatch over the JSON 1.0 protocol, signed with Signature V4.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Client, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{ProviderError, Result};
use crate::{BatchPage, BatchQuery, BatchResult, Datapoint, Dimension, MetricsApi, Resource, StatisticsQuery};

type HmacSha256 = Hmac<Sha256>;

const PROVIDER: &str = "cloudwatch";
const SERVICE: &str = "monitoring";
const TARGET_PREFIX: &str = "GraniteServiceVersion20100801";
const CONTENT_TYPE: &str = "application/x-amz-json-1.0";

/// Static AWS credentials for one account.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AwsCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    #[serde(default)]
    pub session_token: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct WireDimension<'a> {
    name: &'a str,
    value: &'a str,
}

fn wire_dimensions(dims: &[Dimension]) -> Vec<WireDimension<'_>> {
    dims.iter()
        .map(|d| WireDimension {
            name: &d.name,
            value: &d.value,
        })
        .collect()
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct DimensionFilter<'a> {
    name: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct ListMetricsRequest<'a> {
    namespace: &'a str,
    dimensions: Vec<DimensionFilter<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    next_token: Option<&'a str>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListMetricsResponse {
    #[serde(default)]
    metrics: Vec<WireMetric>,
    #[serde(default)]
    next_token: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WireMetric {
    #[serde(default)]
    dimensions: Vec<Dimension>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct GetMetricStatisticsRequest<'a> {
    namespace: &'a str,
    metric_name: &'a str,
    dimensions: Vec<WireDimension<'a>>,
    start_time: i64,
    end_time: i64,
    period: i64,
    statistics: Vec<&'static str>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GetMetricStatisticsResponse {
    #[serde(default)]
    datapoints: Vec<WireDatapoint>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WireDatapoint {
    timestamp: f64,
    average: Option<f64>,
    sum: Option<f64>,
    minimum: Option<f64>,
    maximum: Option<f64>,
    sample_count: Option<f64>,
    #[serde(default)]
    unit: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct WireMetricStat<'a> {
    metric: WireMetricId<'a>,
    period: i64,
    stat: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct WireMetricId<'a> {
    namespace: &'a str,
    metric_name: &'a str,
    dimensions: Vec<WireDimension<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct WireDataQuery<'a> {
    id: &'a str,
    metric_stat: WireMetricStat<'a>,
    return_data: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct GetMetricDataRequest<'a> {
    metric_data_queries: Vec<WireDataQuery<'a>>,
    start_time: i64,
    end_time: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    next_token: Option<&'a str>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GetMetricDataResponse {
    #[serde(default)]
    metric_data_results: Vec<WireDataResult>,
    #[serde(default)]
    next_token: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WireDataResult {
    id: String,
    #[serde(default)]
    timestamps: Vec<f64>,
    #[serde(default)]
    values: Vec<f64>,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(rename = "__type", default)]
    kind: String,
    #[serde(default, alias = "Message")]
    message: String,
}

fn from_epoch(secs: f64) -> Option<DateTime<Utc>> {
    let whole = secs.trunc();
    let nanos = ((secs - whole) * 1e9).round() as u32;
    DateTime::from_timestamp(whole as i64, nanos)
}

/// Maps an error response to a [`ProviderError`]; the code is the part of
/// `__type` after the last `#`.
fn decode_error(status: u16, body: String) -> ProviderError {
    if status == 429 {
        return ProviderError::RateLimited {
            provider: PROVIDER.to_string(),
        };
    }
    match serde_json::from_str::<ErrorBody>(&body) {
        Ok(err) if !err.kind.is_empty() => {
            let code = err
                .kind
                .rsplit_once('#')
                .map_or(err.kind.as_str(), |(_, code)| code);
            if code == "Throttling" || code == "ThrottlingException" {
                return ProviderError::RateLimited {
                    provider: PROVIDER.to_string(),
                };
            }
            ProviderError::ApiResponseError {
                provider: PROVIDER.to_string(),
                code: code.to_string(),
                message: err.message,
            }
        }
        _ => ProviderError::HttpError {
            provider: PROVIDER.to_string(),
            status,
            body,
        },
    }
}

struct Signature {
    amz_date: String,
    authorization: String,
}

pub struct CloudWatchClient {
    region: String,
    credentials: AwsCredentials,
    endpoint: Url,
    host: String,
    client: Client,
}

impl CloudWatchClient {
    pub fn new(region: &str, credentials: AwsCredentials) -> Result<Self> {
        Self::with_endpoint(
            region,
            credentials,
            &format!("https://monitoring.{region}.amazonaws.com/"),
        )
    }

    /// Client against a non-default endpoint (VPC endpoints, local stubs).
    pub fn with_endpoint(region: &str, credentials: AwsCredentials, endpoint: &str) -> Result<Self> {
        if region.is_empty() {
            return Err(ProviderError::ConfigError("region is required".to_string()));
        }
        if credentials.access_key_id.is_empty() || credentials.secret_access_key.is_empty() {
            return Err(ProviderError::ConfigError(
                "access key id and secret access key are required".to_string(),
            ));
        }

        let endpoint = Url::parse(endpoint)
            .map_err(|e| ProviderError::ConfigError(format!("invalid endpoint {endpoint}: {e}")))?;
        let host = match (endpoint.host_str(), endpoint.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            (None, _) => {
                return Err(ProviderError::ConfigError(format!(
                    "endpoint {endpoint} has no host"
                )))
            }
        };

        let client = Client::builder()
            .use_rustls_tls()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            region: region.to_string(),
            credentials,
            endpoint,
            host,
            client,
        })
    }

    /// AWS Signature V4 for a JSON POST to `/`.
    fn sign(&self, target: &str, payload: &str, now: DateTime<Utc>) -> Result<Signature> {
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();

        // Canonical headers must be sorted by name.
        let mut headers = vec![
            ("content-type", CONTENT_TYPE.to_string()),
            ("host", self.host.clone()),
            ("x-amz-date", amz_date.clone()),
        ];
        if let Some(token) = &self.credentials.session_token {
            headers.push(("x-amz-security-token", token.clone()));
        }
        headers.push(("x-amz-target", target.to_string()));

        let canonical_headers: String = headers
            .iter()
            .map(|(name, value)| format!("{name}:{}\n", value.trim()))
            .collect();
        let signed_headers = headers
            .iter()
            .map(|(name, _)| *name)
            .collect::<Vec<_>>()
            .join(";");

        let hashed_payload = format!("{:x}", Sha256::digest(payload.as_bytes()));
        let canonical_request =
            format!("POST\n/\n\n{canonical_headers}\n{signed_headers}\n{hashed_payload}");

        let scope = format!("{date}/{}/{SERVICE}/aws4_request", self.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{amz_date}\n{scope}\n{:x}",
            Sha256::digest(canonical_request.as_bytes())
        );

        let key = signing_key(&self.credentials.secret_access_key, &date, &self.region, SERVICE)?;
        let signature = hex::encode(hmac_sha256(&key, string_to_sign.as_bytes())?);

        Ok(Signature {
            amz_date,
            authorization: format!(
                "AWS4-HMAC-SHA256 Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
                self.credentials.access_key_id
            ),
        })
    }

    async fn call<B: Serialize + Sync, T: DeserializeOwned>(
        &self,
        operation: &str,
        body: &B,
    ) -> Result<T> {
        let payload = serde_json::to_string(body)?;
        let target = format!("{TARGET_PREFIX}.{operation}");
        let signature = self.sign(&target, &payload, Utc::now())?;

        let mut request = self
            .client
            .post(self.endpoint.clone())
            .header("Content-Type", CONTENT_TYPE)
            .header("X-Amz-Date", &signature.amz_date)
            .header("X-Amz-Target", &target)
            .header("Authorization", &signature.authorization);
        if let Some(token) = &self.credentials.session_token {
            request = request.header("X-Amz-Security-Token", token);
        }

        let response = request.body(payload).send().await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(decode_error(status.as_u16(), body));
        }
        Ok(serde_json::from_str(&body)?)
    }
}

#[async_trait::async_trait]
impl MetricsApi for CloudWatchClient {
    fn name(&self) -> &str {
        PROVIDER
    }

    async fn list_resources(&self, namespace: &str, dimension: &str) -> Result<Vec<Resource>> {
        let mut ids = BTreeSet::new();
        let mut next_token: Option<String> = None;

        loop {
            let request = ListMetricsRequest {
                namespace,
                dimensions: vec![DimensionFilter { name: dimension }],
                next_token: next_token.as_deref(),
            };
            let response: ListMetricsResponse = self.call("ListMetrics", &request).await?;

            for metric in response.metrics {
                ids.extend(
                    metric
                        .dimensions
                        .into_iter()
                        .filter(|d| d.name == dimension)
                        .map(|d| d.value),
                );
            }

            match response.next_token {
                Some(token) if !token.is_empty() => next_token = Some(token),
                _ => break,
            }
        }

        Ok(ids
            .into_iter()
            .map(|id| Resource {
                dimensions: vec![Dimension::new(dimension, id.as_str())],
                id,
                tags: Vec::new(),
            })
            .collect())
    }

    async fn get_statistics(&self, query: &StatisticsQuery) -> Result<Vec<Datapoint>> {
        let request = GetMetricStatisticsRequest {
            namespace: &query.namespace,
            metric_name: &query.metric_name,
            dimensions: wire_dimensions(&query.dimensions),
            start_time: query.window.start.timestamp(),
            end_time: query.window.end.timestamp(),
            period: query.window.granularity_secs,
            statistics: query.statistics.iter().map(|s| s.as_str()).collect(),
        };
        let response: GetMetricStatisticsResponse =
            self.call("GetMetricStatistics", &request).await?;

        Ok(response
            .datapoints
            .into_iter()
            .filter_map(|dp| {
                Some(Datapoint {
                    timestamp: from_epoch(dp.timestamp)?,
                    average: dp.average,
                    sum: dp.sum,
                    minimum: dp.minimum,
                    maximum: dp.maximum,
                    sample_count: dp.sample_count,
                    unit: dp.unit.unwrap_or_default(),
                })
            })
            .collect())
    }

    async fn get_metric_data(&self, query: &BatchQuery) -> Result<BatchPage> {
        let request = GetMetricDataRequest {
            metric_data_queries: query
                .items
                .iter()
                .map(|item| WireDataQuery {
                    id: &item.id,
                    metric_stat: WireMetricStat {
                        metric: WireMetricId {
                            namespace: &item.namespace,
                            metric_name: &item.metric_name,
                            dimensions: wire_dimensions(&item.dimensions),
                        },
                        period: query.window.granularity_secs,
                        stat: item.statistic.as_str(),
                    },
                    return_data: true,
                })
                .collect(),
            start_time: query.window.start.timestamp(),
            end_time: query.window.end.timestamp(),
            next_token: query.next_token.as_deref(),
        };
        let response: GetMetricDataResponse = self.call("GetMetricData", &request).await?;

        Ok(BatchPage {
            results: response
                .metric_data_results
                .into_iter()
                .map(|r| {
                    let (timestamps, values) = r
                        .timestamps
                        .into_iter()
                        .zip(r.values)
                        .filter_map(|(ts, v)| Some((from_epoch(ts)?, v)))
                        .unzip();
                    BatchResult {
                        id: r.id,
                        timestamps,
                        values,
                    }
                })
                .collect(),
            next_token: response.next_token.filter(|t| !t.is_empty()),
        })
    }
}

/// HMAC-SHA256 helper function
fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac =
        HmacSha256::new_from_slice(key).map_err(|e| ProviderError::HmacError(e.to_string()))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn signing_key(secret: &str, date: &str, region: &str, service: &str) -> Result<Vec<u8>> {
    let k_date = hmac_sha256(format!("AWS4{secret}").as_bytes(), date.as_bytes())?;
    let k_region = hmac_sha256(&k_date, region.as_bytes())?;
    let k_service = hmac_sha256(&k_region, service.as_bytes())?;
    hmac_sha256(&k_service, b"aws4_request")
}

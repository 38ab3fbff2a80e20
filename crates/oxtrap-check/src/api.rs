use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{CheckError, Result};

pub const DEFAULT_API_URL: &str = "https://api.circonus.com/v2/";

const AUTH_TOKEN_HEADER: &str = "X-Circonus-Auth-Token";
const APP_NAME_HEADER: &str = "X-Circonus-App-Name";

/// A metric intake definition in the management API.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckBundle {
    #[serde(rename = "_cid", default, skip_serializing_if = "String::is_empty")]
    pub cid: String,
    #[serde(default)]
    pub brokers: Vec<String>,
    #[serde(default)]
    pub config: BTreeMap<String, String>,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub metric_filters: Vec<Vec<String>>,
    #[serde(default)]
    pub metric_limit: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default)]
    pub period: u32,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub timeout: f32,
    #[serde(rename = "type", default)]
    pub check_type: String,
}

impl CheckBundle {
    pub fn submission_url(&self) -> Option<&str> {
        self.config.get("submission_url").map(String::as_str)
    }

    pub fn is_active(&self) -> bool {
        self.status == "active"
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BrokerDetail {
    #[serde(default)]
    pub cn: String,
    #[serde(default)]
    pub ipaddress: Option<String>,
    #[serde(default)]
    pub external_host: Option<String>,
    #[serde(default)]
    pub status: String,
}

/// Ingestion broker serving one or more bundles.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Broker {
    #[serde(rename = "_cid", default)]
    pub cid: String,
    #[serde(rename = "_name", default)]
    pub name: String,
    #[serde(rename = "_details", default)]
    pub details: Vec<BrokerDetail>,
}

#[derive(Debug, Deserialize)]
struct CaCert {
    #[serde(default)]
    contents: String,
}

/// Management API operations a destination check depends on.
#[async_trait]
pub trait CheckApi: Send + Sync {
    async fn fetch_check_bundle(&self, cid: &str) -> Result<CheckBundle>;

    async fn search_check_bundles(&self, query: &str) -> Result<Vec<CheckBundle>>;

    async fn create_check_bundle(&self, bundle: &CheckBundle) -> Result<CheckBundle>;

    async fn fetch_broker(&self, cid: &str) -> Result<Broker>;

    /// PEM contents of the CA that signs broker certificates.
    async fn fetch_ca_cert(&self) -> Result<String>;
}

fn ensure_trailing_slash(mut url: String) -> String {
    if !url.ends_with('/') {
        url.push('/');
    }
    url
}

/// HTTP client for the management API.
pub struct HttpCheckApi {
    base: Url,
    token: String,
    app: String,
    client: Client,
}

impl HttpCheckApi {
    /// `ca_file` replaces the public roots when the API sits behind a private CA.
    pub fn new(api_url: &str, token: &str, app: &str, ca_file: Option<&Path>) -> Result<Self> {
        if token.is_empty() {
            return Err(CheckError::ConfigError("API token is required".to_string()));
        }
        let api_url = if api_url.is_empty() {
            DEFAULT_API_URL
        } else {
            api_url
        };
        let base = Url::parse(&ensure_trailing_slash(api_url.to_string()))?;

        let mut builder = Client::builder()
            .use_rustls_tls()
            .timeout(Duration::from_secs(30));
        if let Some(path) = ca_file {
            let pem = std::fs::read(path)?;
            let cert = reqwest::Certificate::from_pem(&pem)?;
            builder = builder.tls_built_in_root_certs(false).add_root_certificate(cert);
        }

        Ok(Self {
            base,
            token: token.to_string(),
            app: app.to_string(),
            client: builder.build()?,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        Ok(self.base.join(path.trim_start_matches('/'))?)
    }

    fn authorize(&self, req: RequestBuilder) -> RequestBuilder {
        req.header(AUTH_TOKEN_HEADER, &self.token)
            .header(APP_NAME_HEADER, &self.app)
            .header("Accept", "application/json")
    }

    async fn send<T: serde::de::DeserializeOwned>(&self, req: RequestBuilder) -> Result<T> {
        let response = self.authorize(req).send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(CheckError::HttpError {
                status: status.as_u16(),
                body,
            });
        }
        Ok(serde_json::from_str(&body)?)
    }
}

#[async_trait]
impl CheckApi for HttpCheckApi {
    async fn fetch_check_bundle(&self, cid: &str) -> Result<CheckBundle> {
        let url = self.endpoint(cid)?;
        self.send(self.client.get(url)).await
    }

    async fn search_check_bundles(&self, query: &str) -> Result<Vec<CheckBundle>> {
        let url = self.endpoint("check_bundle")?;
        self.send(self.client.get(url).query(&[("search", query)]))
            .await
    }

    async fn create_check_bundle(&self, bundle: &CheckBundle) -> Result<CheckBundle> {
        let url = self.endpoint("check_bundle")?;
        self.send(self.client.post(url).json(bundle)).await
    }

    async fn fetch_broker(&self, cid: &str) -> Result<Broker> {
        let url = self.endpoint(cid)?;
        self.send(self.client.get(url)).await
    }

    async fn fetch_ca_cert(&self) -> Result<String> {
        let url = self.endpoint("pki/ca.crt")?;
        let cert: CaCert = self.send(self.client.get(url)).await?;
        if cert.contents.is_empty() {
            return Err(CheckError::TlsError(
                "CA cert response has no contents".to_string(),
            ));
        }
        Ok(cert.contents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Query;
    use axum::http::HeaderMap;
    use axum::routing::get;
    use axum::{Json, Router};
    use std::collections::HashMap;

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/v2")
    }

    #[test]
    fn should_parse_bundle_and_broker_payloads() {
        let bundle: CheckBundle = serde_json::from_value(serde_json::json!({
            "_cid": "/check_bundle/7",
            "brokers": ["/broker/35"],
            "config": {"submission_url": "https://trap.example.com/module/httptrap/x/y"},
            "status": "active",
            "type": "httptrap",
            "_checks": ["/check/9"]
        }))
        .unwrap();
        assert!(bundle.is_active());
        assert_eq!(
            bundle.submission_url(),
            Some("https://trap.example.com/module/httptrap/x/y")
        );

        let broker: Broker = serde_json::from_value(serde_json::json!({
            "_cid": "/broker/35",
            "_name": "public",
            "_details": [{"cn": "trap01", "ipaddress": "10.1.2.3", "status": "active"}]
        }))
        .unwrap();
        assert_eq!(broker.details[0].ipaddress.as_deref(), Some("10.1.2.3"));
    }

    #[test]
    fn should_require_api_token() {
        assert!(matches!(
            HttpCheckApi::new(DEFAULT_API_URL, "", "app", None),
            Err(CheckError::ConfigError(_))
        ));
    }

    #[tokio::test]
    async fn should_send_auth_headers_and_search_query() {
        let app = Router::new().route(
            "/v2/check_bundle",
            get(
                |headers: HeaderMap, Query(q): Query<HashMap<String, String>>| async move {
                    let token = headers
                        .get(AUTH_TOKEN_HEADER)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .to_string();
                    Json(serde_json::json!([{
                        "_cid": "/check_bundle/1",
                        "status": "active",
                        "target": token,
                        "display_name": q.get("search").cloned().unwrap_or_default()
                    }]))
                },
            ),
        );
        let base = serve(app).await;
        let api = HttpCheckApi::new(&base, "secret-token", "oxtrap", None).unwrap();

        let bundles = api
            .search_check_bundles("(active:1)(type:\"httptrap\")(host:acct)")
            .await
            .unwrap();
        assert_eq!(bundles.len(), 1);
        assert_eq!(bundles[0].target, "secret-token");
        assert_eq!(bundles[0].display_name, "(active:1)(type:\"httptrap\")(host:acct)");
    }

    #[tokio::test]
    async fn should_surface_http_errors_with_body() {
        let app = Router::new().route(
            "/v2/broker/1",
            get(|| async { (axum::http::StatusCode::FORBIDDEN, "denied") }),
        );
        let base = serve(app).await;
        let api = HttpCheckApi::new(&base, "t", "a", None).unwrap();

        match api.fetch_broker("/broker/1").await {
            Err(CheckError::HttpError { status, body }) => {
                assert_eq!(status, 403);
                assert_eq!(body, "denied");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn should_reject_empty_ca_contents() {
        let app = Router::new().route(
            "/v2/pki/ca.crt",
            get(|| async { Json(serde_json::json!({"contents": ""})) }),
        );
        let base = serve(app).await;
        let api = HttpCheckApi::new(&base, "t", "a", None).unwrap();
        assert!(matches!(
            api.fetch_ca_cert().await,
            Err(CheckError::TlsError(_))
        ));
    }
}

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use rustls::ClientConfig;

use crate::error::{CheckError, Result};

const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Sends one buffered payload to a broker.
///
/// A fresh client is built per submission so a broker move or TLS change is
/// picked up immediately; nothing is pooled between calls.
pub struct SubmissionClient {
    tls: Option<Arc<ClientConfig>>,
    timeout: Duration,
}

impl SubmissionClient {
    pub fn new(tls: Option<Arc<ClientConfig>>) -> Self {
        Self {
            tls,
            timeout: Duration::from_secs(30),
        }
    }

    fn build_client(&self) -> Result<Client> {
        let builder = Client::builder()
            .timeout(self.timeout)
            .pool_max_idle_per_host(0);
        let builder = match &self.tls {
            Some(tls) => builder.use_preconfigured_tls(ClientConfig::clone(tls)),
            None => builder.use_rustls_tls(),
        };
        Ok(builder.build()?)
    }

    pub async fn submit(&self, url: &str, payload: &[u8]) -> Result<()> {
        let client = self.build_client()?;
        let response = client
            .put(url)
            .header("User-Agent", USER_AGENT)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json")
            .header("Connection", "close")
            .body(payload.to_vec())
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            tracing::error!(
                url = %url,
                status = %status,
                response = %body,
                "submitting telemetry"
            );
            return Err(CheckError::SubmitFailed {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        tracing::debug!(url = %url, result = %body, "telemetry submitted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::put;
    use axum::Router;
    use tokio::sync::mpsc;

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn should_put_payload_with_json_headers() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let app = Router::new().route(
            "/module/httptrap/abc/secret",
            put(move |headers: HeaderMap, body: String| {
                let tx = tx.clone();
                async move {
                    let ct = headers
                        .get("content-type")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .to_string();
                    tx.send((ct, body)).unwrap();
                    r#"{"stats":1}"#
                }
            }),
        );
        let base = serve(app).await;

        let client = SubmissionClient::new(None);
        client
            .submit(
                &format!("{base}/module/httptrap/abc/secret"),
                b"{\"m\":{\"_type\":\"n\",\"_value\":1}}\n",
            )
            .await
            .unwrap();

        let (ct, body) = rx.recv().await.unwrap();
        assert_eq!(ct, "application/json");
        assert_eq!(body, "{\"m\":{\"_type\":\"n\",\"_value\":1}}\n");
    }

    #[tokio::test]
    async fn should_fail_on_non_success_status() {
        let app = Router::new().route(
            "/trap",
            put(|| async { (StatusCode::NOT_FOUND, "no such check") }),
        );
        let base = serve(app).await;

        let err = SubmissionClient::new(None)
            .submit(&format!("{base}/trap"), b"")
            .await
            .unwrap_err();
        assert!(matches!(err, CheckError::SubmitFailed { status: 404, .. }));
    }
}

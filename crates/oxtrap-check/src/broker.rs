use std::net::IpAddr;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use url::Url;

use crate::api::Broker;
use crate::error::{CheckError, Result};

const PUBLIC_TRAP_HOST: &str = "api.circonus.com";

/// Whether the submission endpoint presents a publicly trusted certificate,
/// so the default roots suffice.
pub fn uses_public_certificate(submission_url: &str) -> bool {
    submission_url.contains(PUBLIC_TRAP_HOST)
}

/// Name the broker certificate is issued for.
///
/// A hostname in the submission URL is used as is. An IP literal has to match
/// one of the broker's registered details, whose CN is returned.
pub fn broker_cn(broker: &Broker, submission_url: &str) -> Result<String> {
    let url = Url::parse(submission_url)?;
    let host = url
        .host_str()
        .ok_or_else(|| CheckError::BrokerMismatch(submission_url.to_string()))?;
    let bare = host.trim_start_matches('[').trim_end_matches(']');

    if bare.parse::<IpAddr>().is_err() {
        return Ok(host.to_string());
    }

    broker
        .details
        .iter()
        .find(|d| d.ipaddress.as_deref() == Some(bare) && !d.cn.is_empty())
        .map(|d| d.cn.clone())
        .ok_or_else(|| CheckError::BrokerMismatch(host.to_string()))
}

/// Verifies the broker chain against `roots`, checking the certificate name
/// against the broker CN instead of the host that was dialed.
#[derive(Debug)]
struct BrokerNameVerifier {
    inner: Arc<WebPkiServerVerifier>,
    server_name: ServerName<'static>,
}

impl ServerCertVerifier for BrokerNameVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        self.inner.verify_server_cert(
            end_entity,
            intermediates,
            &self.server_name,
            ocsp_response,
            now,
        )
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

fn parse_certificates(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    CertificateDer::pem_slice_iter(pem)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| CheckError::TlsError(format!("failed to parse CA certificate: {e}")))
}

/// Client TLS config trusting only `ca_pem` and expecting the broker to
/// present a certificate for `cn`. TLS 1.2 is the floor.
pub fn build_tls_config(ca_pem: &[u8], cn: &str) -> Result<Arc<ClientConfig>> {
    let certs = parse_certificates(ca_pem)?;
    if certs.is_empty() {
        return Err(CheckError::TlsError("no CA certificates found".to_string()));
    }

    let mut roots = RootCertStore::empty();
    for cert in certs {
        roots
            .add(cert)
            .map_err(|e| CheckError::TlsError(format!("failed to add CA certificate: {e}")))?;
    }

    let server_name = ServerName::try_from(cn.to_string())
        .map_err(|e| CheckError::TlsError(format!("invalid broker CN {cn}: {e}")))?;

    let provider: Arc<CryptoProvider> = Arc::new(rustls::crypto::ring::default_provider());
    let inner = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider.clone())
        .build()
        .map_err(|e| CheckError::TlsError(format!("verifier error: {e}")))?;

    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| CheckError::TlsError(e.to_string()))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(BrokerNameVerifier { inner, server_name }))
        .with_no_client_auth();

    Ok(Arc::new(config))
}

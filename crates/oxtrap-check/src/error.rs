/// Errors raised while resolving a destination check or submitting to it.
///
/// # Examples
///
/// ```rust
/// use oxtrap_check::error::CheckError;
///
/// let err = CheckError::InactiveBundle("/check_bundle/42".to_string());
/// assert!(err.to_string().contains("/check_bundle/42"));
/// ```
#[derive(Debug, thiserror::Error)]
pub enum CheckError {
    /// Non-2xx status from the management API.
    #[error("API HTTP error: status={status}, body={body}")]
    HttpError { status: u16, body: String },

    /// Non-2xx status from the broker ingestion endpoint.
    #[error("submission to {url} failed: status={status}")]
    SubmitFailed { url: String, status: u16 },

    /// A configured check bundle exists but is not active.
    #[error("check bundle {0} is not active")]
    InactiveBundle(String),

    /// More than one active bundle matched the search; an operator has to pick.
    #[error("multiple active check bundles ({count}) match {query}")]
    AmbiguousBundle { count: usize, query: String },

    /// The submission URL host could not be matched to any broker detail.
    #[error("unable to match submission host {0} to broker")]
    BrokerMismatch(String),

    /// Operation requires a resolved bundle/broker.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Sample rejected by the line encoder.
    #[error("invalid metric: {0}")]
    InvalidMetric(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("URL error: {0}")]
    UrlError(#[from] url::ParseError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

pub type Result<T> = std::result::Result<T, CheckError>;

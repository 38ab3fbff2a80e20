use oxtrap_check::CheckError;

/// Errors returned by a provider metrics API.
///
/// # Examples
///
/// ```rust
/// use oxtrap_cloud::error::{ErrorClass, ProviderError};
///
/// let err = ProviderError::ApiResponseError {
///     provider: "cloudwatch".to_string(),
///     code: "AccessDeniedException".to_string(),
///     message: "not authorized".to_string(),
/// };
/// assert_eq!(err.class(), ErrorClass::AccessDenied);
/// ```
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// HTTP-level error without a decodable error payload.
    #[error("{provider} API HTTP error: status={status}, body={body}")]
    HttpError {
        provider: String,
        status: u16,
        body: String,
    },

    /// The provider answered with a coded error.
    #[error("{provider} API error: code={code}, message={message}")]
    ApiResponseError {
        provider: String,
        code: String,
        message: String,
    },

    /// Request was throttled by the provider.
    #[error("{provider} API rate limited, retry after backoff")]
    RateLimited { provider: String },

    /// HMAC signing failed.
    #[error("HMAC signing error: {0}")]
    HmacError(String),

    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Account configuration is missing or invalid.
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// How a provider error affects the collector that hit it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Credentials lack permission; the collector backs off for an hour.
    AccessDenied,
    Other,
}

const ACCESS_DENIED_CODES: &[&str] = &["AccessDenied", "AccessDeniedException"];

impl ProviderError {
    /// Stable provider error code, when the provider sent one.
    pub fn code(&self) -> Option<&str> {
        match self {
            ProviderError::ApiResponseError { code, .. } => Some(code),
            ProviderError::RateLimited { .. } => Some("Throttling"),
            _ => None,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self.code() {
            Some(code) if ACCESS_DENIED_CODES.contains(&code) => ErrorClass::AccessDenied,
            _ => ErrorClass::Other,
        }
    }

    pub fn is_access_denied(&self) -> bool {
        self.class() == ErrorClass::AccessDenied
    }
}

pub type Result<T> = std::result::Result<T, ProviderError>;

/// Failure of one collector run.
#[derive(Debug, thiserror::Error)]
pub enum CollectError {
    #[error("collecting {collector}: {source}")]
    Provider {
        collector: String,
        #[source]
        source: ProviderError,
    },

    #[error("submitting {collector} telemetry: {source}")]
    Submit {
        collector: String,
        #[source]
        source: CheckError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: &str) -> ProviderError {
        ProviderError::ApiResponseError {
            provider: "cloudwatch".to_string(),
            code: code.to_string(),
            message: "m".to_string(),
        }
    }

    #[test]
    fn should_classify_access_denied_codes() {
        assert!(api_error("AccessDenied").is_access_denied());
        assert!(api_error("AccessDeniedException").is_access_denied());
        assert_eq!(api_error("InvalidParameterValue").class(), ErrorClass::Other);
    }

    #[test]
    fn should_treat_throttling_and_transport_errors_as_other() {
        let throttled = ProviderError::RateLimited {
            provider: "cloudwatch".to_string(),
        };
        assert_eq!(throttled.code(), Some("Throttling"));
        assert_eq!(throttled.class(), ErrorClass::Other);

        let http = ProviderError::HttpError {
            provider: "cloudwatch".to_string(),
            status: 503,
            body: String::new(),
        };
        assert_eq!(http.code(), None);
        assert_eq!(http.class(), ErrorClass::Other);
    }
}

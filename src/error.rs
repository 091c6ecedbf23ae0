use thiserror::Error;

/// Errors returned by the cirro service clients.
#[derive(Debug, Error)]
pub enum AzureError {
    /// The Azure service answered with a non-success status code.
    #[error("Azure returned HTTP {status}: {message}")]
    Http {
        /// HTTP status code from the service response.
        status: u16,
        /// Response body, best effort.
        message: String,
    },

    /// A transport-level error occurred talking to Azure.
    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    /// The requested blob or queue does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Configuration is invalid (connection string, endpoint, credentials).
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// A serialization or encoding error occurred.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl AzureError {
    /// Returns `true` if the error is transient and the operation may succeed
    /// on retry.
    ///
    /// Throttling (429), request timeouts (408), server errors (5xx), and
    /// transport-level connection failures are considered transient.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http { status, .. } => {
                *status == 408 || *status == 429 || (500..600).contains(status)
            }
            Self::Request(e) => e.is_timeout() || e.is_connect(),
            Self::NotFound(_) | Self::Configuration(_) | Self::Serialization(_) => false,
        }
    }

    /// The HTTP status code behind this error, when there is one.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            Self::Request(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// Turn a non-success response into an [`AzureError::Http`], reading the
    /// body as the message on a best-effort basis.
    pub(crate) async fn from_response(response: reqwest::Response) -> Self {
        let status = response.status().as_u16();
        let message = response.text().await.unwrap_or_default();
        Self::Http { status, message }
    }
}

impl From<serde_json::Error> for AzureError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttled_is_retryable() {
        let err = AzureError::Http {
            status: 429,
            message: "too many requests".into(),
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn server_errors_are_retryable() {
        for status in [500, 502, 503] {
            let err = AzureError::Http {
                status,
                message: String::new(),
            };
            assert!(err.is_retryable(), "HTTP {status} should be retryable");
        }
    }

    #[test]
    fn client_errors_are_not_retryable() {
        for status in [400, 403, 404, 409] {
            let err = AzureError::Http {
                status,
                message: String::new(),
            };
            assert!(!err.is_retryable(), "HTTP {status} should not be retryable");
        }
    }

    #[test]
    fn permanent_variants_are_not_retryable() {
        assert!(!AzureError::NotFound("blob".into()).is_retryable());
        assert!(!AzureError::Configuration("bad".into()).is_retryable());
        assert!(!AzureError::Serialization("bad".into()).is_retryable());
    }

    #[test]
    fn status_extraction() {
        let err = AzureError::Http {
            status: 409,
            message: "conflict".into(),
        };
        assert_eq!(err.status(), Some(409));
        assert_eq!(AzureError::Configuration("x".into()).status(), None);
    }

    #[test]
    fn serde_error_maps_to_serialization() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: AzureError = json_err.into();
        assert!(matches!(err, AzureError::Serialization(_)));
    }

    #[test]
    fn error_display() {
        let err = AzureError::Http {
            status: 503,
            message: "unavailable".into(),
        };
        assert_eq!(err.to_string(), "Azure returned HTTP 503: unavailable");
        assert_eq!(
            AzureError::NotFound("reports/latest.json".into()).to_string(),
            "not found: reports/latest.json"
        );
    }
}

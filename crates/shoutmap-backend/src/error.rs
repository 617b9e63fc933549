//! Error types for the backend client.

use thiserror::Error;

/// Errors that can occur when talking to the backend.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Authentication failed or the token was rejected.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Row or object not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Error response from the REST layer.
    #[error("REST error ({status}): {message}")]
    Rest {
        status: u16,
        code: Option<String>,
        message: String,
    },

    /// Rate limited.
    #[error("rate limited{}", match retry_after_secs {
        Some(secs) => format!(" (retry after {}s)", secs),
        None => String::new(),
    })]
    RateLimited {
        /// Seconds to wait before retrying (from Retry-After header, optional).
        retry_after_secs: Option<u64>,
    },

    /// Realtime channel or socket error.
    #[error("realtime error: {0}")]
    Realtime(String),

    /// Object storage error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Invalid response from server.
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl BackendError {
    /// Check if an error is transient and worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            BackendError::Http(e) => e.is_timeout() || e.is_connect(),
            BackendError::Rest { status, .. } => matches!(status, 500 | 502 | 503 | 504),
            BackendError::RateLimited { .. } => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_errors_are_transient() {
        for status in [500, 502, 503, 504] {
            let err = BackendError::Rest {
                status,
                code: None,
                message: "upstream".to_string(),
            };
            assert!(err.is_transient(), "{} should be transient", status);
        }
    }

    #[test]
    fn test_client_errors_are_permanent() {
        let err = BackendError::Rest {
            status: 409,
            code: Some("23505".to_string()),
            message: "duplicate key".to_string(),
        };
        assert!(!err.is_transient());
        assert!(!BackendError::Auth("expired".to_string()).is_transient());
    }

    #[test]
    fn test_rate_limited_display() {
        let err = BackendError::RateLimited {
            retry_after_secs: Some(3),
        };
        assert_eq!(err.to_string(), "rate limited (retry after 3s)");
        let err = BackendError::RateLimited {
            retry_after_secs: None,
        };
        assert_eq!(err.to_string(), "rate limited");
        assert!(err.is_transient());
    }
}

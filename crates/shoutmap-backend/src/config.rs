//! Connection settings for the backend.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default connect timeout for REST requests.
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default overall timeout for REST requests.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Connection settings for the backend project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Project base URL, e.g. `https://abc.example.co`.
    pub url: String,
    /// Public (anon) API key, sent with every request.
    pub anon_key: String,
    /// Signed-in user's access token; the anon key is used when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_connect_timeout() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_SECS
}

fn default_request_timeout() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

impl BackendConfig {
    pub fn new(url: impl Into<String>, anon_key: impl Into<String>) -> Self {
        Self {
            url: url.into().trim_end_matches('/').to_string(),
            anon_key: anon_key.into(),
            access_token: None,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }

    /// Use a signed-in user's access token.
    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    pub fn with_timeouts(mut self, connect: Duration, request: Duration) -> Self {
        self.connect_timeout_secs = connect.as_secs();
        self.request_timeout_secs = request.as_secs();
        self
    }

    /// Token for the `Authorization` header.
    pub fn bearer_token(&self) -> &str {
        self.access_token.as_deref().unwrap_or(&self.anon_key)
    }

    /// Derive the realtime websocket URL from the project URL.
    ///
    /// `https://abc.example.co` → `wss://abc.example.co/realtime/v1/websocket?apikey=…&vsn=1.0.0`
    pub fn realtime_url(&self) -> String {
        let base = self
            .url
            .replacen("https://", "wss://", 1)
            .replacen("http://", "ws://", 1);
        format!(
            "{}/realtime/v1/websocket?apikey={}&vsn=1.0.0",
            base, self.anon_key
        )
    }
}

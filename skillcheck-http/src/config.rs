//! Connection settings for the assessment backend.

use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Deserializer};

/// Where the backend lives and how to talk to it.
///
/// ```toml
/// baseUrl = "https://api.example.com/v1/"
/// requestTimeout = "15s"
/// bearerToken = "..."
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpConfig {
    pub base_url: String,

    /// Upper bound for a single request, including reading the body.
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Sent as `Authorization: Bearer <token>` on every request.
    #[serde(default, deserialize_with = "deserialize_token")]
    pub bearer_token: Option<SecretString>,
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn deserialize_token<'de, D>(deserializer: D) -> Result<Option<SecretString>, D::Error>
where
    D: Deserializer<'de>,
{
    let token: Option<String> = Option::deserialize(deserializer)?;
    Ok(token.filter(|t| !t.is_empty()).map(SecretString::from))
}

impl HttpConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            request_timeout: default_request_timeout(),
            bearer_token: None,
        }
    }

    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(SecretString::from(token.into()));
        self
    }
}

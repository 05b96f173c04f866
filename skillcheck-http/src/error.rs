//! Error types for skillcheck-http

use thiserror::Error;

/// Failure to construct an [`HttpAssessmentApi`](crate::HttpAssessmentApi).
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("invalid base URL {url}: {reason}")]
    InvalidBaseUrl { url: String, reason: String },

    #[error("failed to build HTTP client: {0}")]
    Build(#[from] reqwest::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_base_url_display() {
        let err = ClientError::InvalidBaseUrl {
            url: "nope".to_string(),
            reason: "relative URL without a base".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "invalid base URL nope: relative URL without a base"
        );
    }
}

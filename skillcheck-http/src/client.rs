//! [`AssessmentApi`] over the backend's REST endpoints.

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, Url};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, trace};

use skillcheck_core::{
    AggregateStatus, ApiError, ApiResult, AssessmentApi, AssessmentResults, JobStatus,
    SubmitAnswerResponse,
};

use crate::config::HttpConfig;
use crate::error::ClientError;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SubmitAnswerRequest<'a> {
    answer_text: &'a str,
}

/// REST client for the assessment backend.
///
/// Every id is percent-encoded into its path segment, so ids containing `/`
/// or spaces address the intended resource.
#[derive(Debug, Clone)]
pub struct HttpAssessmentApi {
    client: Client,
    base_url: Url,
    bearer_token: Option<SecretString>,
}

impl HttpAssessmentApi {
    pub fn new(config: HttpConfig) -> Result<Self, ClientError> {
        let base_url = parse_base_url(&config.base_url)?;
        let client = Client::builder().timeout(config.request_timeout).build()?;
        Ok(Self {
            client,
            base_url,
            bearer_token: config.bearer_token,
        })
    }

    /// Client with default settings for `base_url`.
    pub fn with_base_url(base_url: &str) -> Result<Self, ClientError> {
        Self::new(HttpConfig::new(base_url))
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn url(&self, path: &str) -> ApiResult<Url> {
        self.base_url
            .join(path)
            .map_err(|e| ApiError::Transport(format!("invalid request path {path}: {e}")))
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let request = self.client.request(method, url);
        match &self.bearer_token {
            Some(token) => request.bearer_auth(token.expose_secret()),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> ApiResult<Response> {
        let response = request.send().await.map_err(request_error)?;
        let status = response.status();
        trace!(url = %response.url(), status = status.as_u16(), "Backend responded");

        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let message = error_message(status, &body);
        debug!(status = status.as_u16(), message = %message, "Backend returned an error status");
        Err(ApiError::Status {
            status: status.as_u16(),
            message,
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> ApiResult<T> {
        let url = self.url(path)?;
        let response = self.send(self.request(Method::GET, url)).await?;
        decode(response).await
    }

    async fn post_json<B, T>(&self, path: &str, body: &B) -> ApiResult<T>
    where
        B: Serialize + Sync,
        T: DeserializeOwned,
    {
        let url = self.url(path)?;
        let response = self.send(self.request(Method::POST, url).json(body)).await?;
        decode(response).await
    }

    /// POST without a body, ignoring whatever the backend answers with.
    async fn post_ack(&self, path: &str) -> ApiResult<()> {
        let url = self.url(path)?;
        self.send(self.request(Method::POST, url)).await?;
        Ok(())
    }
}

#[async_trait]
impl AssessmentApi for HttpAssessmentApi {
    async fn job_status(&self, job_id: &str) -> ApiResult<JobStatus> {
        self.get_json(&format!("jobs/{}/status", segment(job_id)))
            .await
    }

    async fn aggregate_scoring_status(&self, assessment_id: &str) -> ApiResult<AggregateStatus> {
        self.get_json(&format!(
            "assessments/{}/scoring-status",
            segment(assessment_id)
        ))
        .await
    }

    async fn submit_answer(
        &self,
        session_id: &str,
        answer_text: &str,
    ) -> ApiResult<SubmitAnswerResponse> {
        self.post_json(
            &format!("sessions/{}/answers", segment(session_id)),
            &SubmitAnswerRequest { answer_text },
        )
        .await
    }

    async fn retry_scoring(&self, assessment_id: &str) -> ApiResult<()> {
        self.post_ack(&format!(
            "assessments/{}/scoring/retry",
            segment(assessment_id)
        ))
        .await
    }

    async fn generate_final_feedback(&self, assessment_id: &str) -> ApiResult<()> {
        self.post_ack(&format!(
            "assessments/{}/final-feedback",
            segment(assessment_id)
        ))
        .await
    }

    async fn results(&self, assessment_id: &str) -> ApiResult<AssessmentResults> {
        self.get_json(&format!("assessments/{}/results", segment(assessment_id)))
            .await
    }
}

/// Parse the base URL so that relative paths join below it.
fn parse_base_url(raw: &str) -> Result<Url, ClientError> {
    let invalid = |reason: String| ClientError::InvalidBaseUrl {
        url: raw.to_string(),
        reason,
    };

    let mut url = Url::parse(raw).map_err(|e| invalid(e.to_string()))?;
    if url.cannot_be_a_base() {
        return Err(invalid("URL cannot be a base".to_string()));
    }
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

fn segment(id: &str) -> String {
    urlencoding::encode(id).into_owned()
}

fn request_error(e: reqwest::Error) -> ApiError {
    if e.is_timeout() {
        ApiError::Timeout
    } else if e.is_decode() {
        ApiError::Decode(e.to_string())
    } else {
        ApiError::Transport(e.to_string())
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> ApiResult<T> {
    let bytes = response.bytes().await.map_err(request_error)?;
    serde_json::from_slice(&bytes).map_err(|e| ApiError::Decode(e.to_string()))
}

/// Best human-readable message from an error response body.
///
/// Prefers a JSON `error` or `message` field, then the raw body, then the
/// status' canonical reason.
fn error_message(status: StatusCode, body: &str) -> String {
    if let Ok(serde_json::Value::Object(fields)) = serde_json::from_str(body) {
        for key in ["error", "message"] {
            if let Some(serde_json::Value::String(message)) = fields.get(key)
                && !message.trim().is_empty()
            {
                return message.clone();
            }
        }
    }

    let body = body.trim();
    if !body.is_empty() {
        return body.to_string();
    }
    status
        .canonical_reason()
        .unwrap_or("request failed")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_gains_trailing_slash() {
        let url = parse_base_url("http://localhost:8080/api/v1").unwrap();
        assert_eq!(url.as_str(), "http://localhost:8080/api/v1/");
        assert_eq!(
            url.join("jobs/a/status").unwrap().as_str(),
            "http://localhost:8080/api/v1/jobs/a/status"
        );
    }

    #[test]
    fn base_url_without_path_is_root() {
        let url = parse_base_url("http://localhost:8080").unwrap();
        assert_eq!(url.as_str(), "http://localhost:8080/");
    }

    #[test]
    fn invalid_base_url_is_rejected() {
        assert!(matches!(
            parse_base_url("not a url"),
            Err(ClientError::InvalidBaseUrl { .. })
        ));
        assert!(matches!(
            parse_base_url("mailto:someone@example.com"),
            Err(ClientError::InvalidBaseUrl { .. })
        ));
    }

    #[test]
    fn segments_are_percent_encoded() {
        assert_eq!(segment("job 1/2?x"), "job%201%2F2%3Fx");
        assert_eq!(segment("plain-id_42"), "plain-id_42");
    }

    #[test]
    fn error_message_prefers_json_fields() {
        assert_eq!(
            error_message(StatusCode::BAD_REQUEST, r#"{"error":"bad answer"}"#),
            "bad answer"
        );
        assert_eq!(
            error_message(StatusCode::BAD_REQUEST, r#"{"message":"try later"}"#),
            "try later"
        );
        assert_eq!(
            error_message(StatusCode::BAD_GATEWAY, "  upstream down \n"),
            "upstream down"
        );
        assert_eq!(
            error_message(StatusCode::SERVICE_UNAVAILABLE, ""),
            "Service Unavailable"
        );
    }

    #[test]
    fn submit_request_body_is_camel_case() {
        let body = serde_json::to_string(&SubmitAnswerRequest { answer_text: "hi" }).unwrap();
        assert_eq!(body, r#"{"answerText":"hi"}"#);
    }
}

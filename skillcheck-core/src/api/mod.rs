//! The seam between the polling core and the assessment backend.
//!
//! [`AssessmentApi`] is the only way the pollers and the session flow talk to
//! the server. `skillcheck-http` implements it over REST; [`MockAssessmentApi`]
//! scripts it for tests.

mod mock;

use async_trait::async_trait;

pub use mock::{MockAssessmentApi, MockCalls};

use crate::error::ApiError;
use crate::types::{AggregateStatus, AssessmentResults, JobStatus, SubmitAnswerResponse};

/// Result type for backend requests.
pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Requests the polling core makes against the assessment backend.
#[async_trait]
pub trait AssessmentApi: Send + Sync {
    /// Current status of one generation or scoring job.
    async fn job_status(&self, job_id: &str) -> ApiResult<JobStatus>;

    /// Rollup over every response-scoring job of an assessment.
    async fn aggregate_scoring_status(&self, assessment_id: &str) -> ApiResult<AggregateStatus>;

    /// Submit the answer to the current question.
    async fn submit_answer(
        &self,
        session_id: &str,
        answer_text: &str,
    ) -> ApiResult<SubmitAnswerResponse>;

    /// Ask the backend to re-run failed scoring jobs.
    async fn retry_scoring(&self, assessment_id: &str) -> ApiResult<()>;

    /// Kick off final feedback generation. Safe to call again after a failure.
    async fn generate_final_feedback(&self, assessment_id: &str) -> ApiResult<()>;

    /// Final results, or a marker that they are still being generated.
    async fn results(&self, assessment_id: &str) -> ApiResult<AssessmentResults>;
}

//! Scripted assessment backend for tests
//!
//! Queue responses per endpoint before driving a poller. Each request
//! consumes one queued response; once a queue is empty the endpoint's
//! fallback is returned (a transport error unless one was set).

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::{ApiResult, AssessmentApi};
use crate::error::ApiError;
use crate::poller::lock;
use crate::types::{AggregateStatus, AssessmentResults, JobStatus, SubmitAnswerResponse};

/// Requests received by a [`MockAssessmentApi`], in order.
#[derive(Debug, Clone, Default)]
pub struct MockCalls {
    pub job_status: Vec<String>,
    /// When each `job_status` request was issued (tokio clock).
    pub job_status_at: Vec<Instant>,
    pub aggregate_scoring_status: Vec<String>,
    pub submit_answer: Vec<(String, String)>,
    pub retry_scoring: Vec<String>,
    pub generate_final_feedback: Vec<String>,
    pub results: Vec<String>,
    /// Requests whose response has been handed back to the caller.
    pub completed: usize,
}

struct Script<T> {
    queue: VecDeque<ApiResult<T>>,
    fallback: Option<ApiResult<T>>,
}

impl<T> Default for Script<T> {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
            fallback: None,
        }
    }
}

impl<T: Clone> Script<T> {
    fn next(&mut self, endpoint: &str) -> ApiResult<T> {
        if let Some(response) = self.queue.pop_front() {
            return response;
        }
        self.fallback.clone().unwrap_or_else(|| {
            Err(ApiError::Transport(format!(
                "no scripted response for {endpoint}"
            )))
        })
    }
}

#[derive(Default)]
struct MockState {
    job_status: Script<JobStatus>,
    aggregate: Script<AggregateStatus>,
    submit: Script<SubmitAnswerResponse>,
    retry_scoring: Script<()>,
    final_feedback: Script<()>,
    results: Script<AssessmentResults>,
    latency: Duration,
    calls: MockCalls,
}

/// In-memory [`AssessmentApi`] driven by scripted responses.
///
/// `retry_scoring` and `generate_final_feedback` succeed unless a failure is
/// queued for them.
pub struct MockAssessmentApi {
    state: Mutex<MockState>,
}

impl MockAssessmentApi {
    pub fn new() -> Self {
        let mut state = MockState::default();
        state.retry_scoring.fallback = Some(Ok(()));
        state.final_feedback.fallback = Some(Ok(()));
        Self {
            state: Mutex::new(state),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        lock(&self.state)
    }

    /// Delay every response by `latency`, measured on the tokio clock.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    pub fn queue_job_status(&self, response: ApiResult<JobStatus>) {
        self.lock().job_status.queue.push_back(response);
    }

    /// Response returned once the job status queue is exhausted.
    pub fn set_job_status_fallback(&self, response: ApiResult<JobStatus>) {
        self.lock().job_status.fallback = Some(response);
    }

    pub fn queue_aggregate_status(&self, response: ApiResult<AggregateStatus>) {
        self.lock().aggregate.queue.push_back(response);
    }

    pub fn set_aggregate_status_fallback(&self, response: ApiResult<AggregateStatus>) {
        self.lock().aggregate.fallback = Some(response);
    }

    pub fn queue_submit_answer(&self, response: ApiResult<SubmitAnswerResponse>) {
        self.lock().submit.queue.push_back(response);
    }

    pub fn queue_retry_scoring(&self, response: ApiResult<()>) {
        self.lock().retry_scoring.queue.push_back(response);
    }

    pub fn queue_final_feedback(&self, response: ApiResult<()>) {
        self.lock().final_feedback.queue.push_back(response);
    }

    pub fn queue_results(&self, response: ApiResult<AssessmentResults>) {
        self.lock().results.queue.push_back(response);
    }

    /// Snapshot of every request received so far.
    pub fn calls(&self) -> MockCalls {
        self.lock().calls.clone()
    }

    async fn respond<T>(&self, take: impl FnOnce(&mut MockState) -> ApiResult<T>) -> ApiResult<T> {
        let (latency, response) = {
            let mut state = self.lock();
            let response = take(&mut state);
            (state.latency, response)
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.lock().calls.completed += 1;
        response
    }
}

impl Default for MockAssessmentApi {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AssessmentApi for MockAssessmentApi {
    async fn job_status(&self, job_id: &str) -> ApiResult<JobStatus> {
        self.respond(|state| {
            state.calls.job_status.push(job_id.to_string());
            state.calls.job_status_at.push(Instant::now());
            state.job_status.next("job_status")
        })
        .await
    }

    async fn aggregate_scoring_status(&self, assessment_id: &str) -> ApiResult<AggregateStatus> {
        self.respond(|state| {
            state
                .calls
                .aggregate_scoring_status
                .push(assessment_id.to_string());
            state.aggregate.next("aggregate_scoring_status")
        })
        .await
    }

    async fn submit_answer(
        &self,
        session_id: &str,
        answer_text: &str,
    ) -> ApiResult<SubmitAnswerResponse> {
        self.respond(|state| {
            state
                .calls
                .submit_answer
                .push((session_id.to_string(), answer_text.to_string()));
            state.submit.next("submit_answer")
        })
        .await
    }

    async fn retry_scoring(&self, assessment_id: &str) -> ApiResult<()> {
        self.respond(|state| {
            state.calls.retry_scoring.push(assessment_id.to_string());
            state.retry_scoring.next("retry_scoring")
        })
        .await
    }

    async fn generate_final_feedback(&self, assessment_id: &str) -> ApiResult<()> {
        self.respond(|state| {
            state
                .calls
                .generate_final_feedback
                .push(assessment_id.to_string());
            state.final_feedback.next("generate_final_feedback")
        })
        .await
    }

    async fn results(&self, assessment_id: &str) -> ApiResult<AssessmentResults> {
        self.respond(|state| {
            state.calls.results.push(assessment_id.to_string());
            state.results.next("results")
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::JobState;

    #[tokio::test]
    async fn queued_responses_are_consumed_in_order() {
        let api = MockAssessmentApi::new();
        api.queue_job_status(Ok(JobStatus::new("job-1", JobState::Running)));
        api.queue_job_status(Ok(JobStatus::completed("job-1")));

        assert_eq!(
            api.job_status("job-1").await.unwrap().status,
            JobState::Running
        );
        assert!(api.job_status("job-1").await.unwrap().is_completed());
        assert_eq!(api.calls().job_status, vec!["job-1", "job-1"]);
    }

    #[tokio::test]
    async fn empty_queue_without_fallback_is_transport_error() {
        let api = MockAssessmentApi::new();
        let err = api.aggregate_scoring_status("a-1").await.unwrap_err();
        assert!(matches!(err, ApiError::Transport(_)));
    }

    #[tokio::test]
    async fn fallback_repeats_after_queue_drains() {
        let api = MockAssessmentApi::new();
        api.queue_aggregate_status(Ok(AggregateStatus::in_progress(0, 2)));
        api.set_aggregate_status_fallback(Ok(AggregateStatus::in_progress(1, 2)));

        assert_eq!(
            api.aggregate_scoring_status("a").await.unwrap().completed_count,
            0
        );
        for _ in 0..3 {
            assert_eq!(
                api.aggregate_scoring_status("a").await.unwrap().completed_count,
                1
            );
        }
    }

    #[tokio::test]
    async fn acknowledgements_succeed_by_default() {
        let api = MockAssessmentApi::new();
        api.queue_final_feedback(Err(ApiError::Timeout));

        assert!(api.generate_final_feedback("a").await.is_err());
        assert!(api.generate_final_feedback("a").await.is_ok());
        assert!(api.retry_scoring("a").await.is_ok());
        assert_eq!(api.calls().generate_final_feedback.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn latency_delays_responses() {
        let api = MockAssessmentApi::new();
        api.set_latency(Duration::from_millis(300));
        api.queue_results(Ok(AssessmentResults::ready(90.0)));

        let start = Instant::now();
        api.results("a").await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(300));
    }
}

use std::future::Future;
use std::sync::Arc;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::feedback::FeedbackRequest;
use super::{FlowEvent, FlowState, SubmitOutcome};
use crate::api::AssessmentApi;
use crate::config::FlowConfig;
use crate::error::{ApiError, FlowError};
use crate::poller::{
    AggregateEvent, AggregateJobPoller, BoundedWaitPoller, JobPollEvent, JobStatusPoller,
};
use crate::types::{
    AggregateProgress, AssessmentResults, Question, SessionProgress, SessionStart,
    SubmitAnswerResponse,
};

/// Capacity of the flow event channel.
const FLOW_EVENT_CAPACITY: usize = 128;

/// Drives one assessment session from the first answer to its final results.
///
/// Owns one poller of each kind. Operations take `&mut self` and run until
/// the step they start has resolved, so at most one operation is in progress
/// at a time. Cancelling [`cancellation_token`](Self::cancellation_token)
/// aborts the operation in progress with [`FlowError::Cancelled`] and every
/// later one.
pub struct SessionFlowController {
    api: Arc<dyn AssessmentApi>,
    config: FlowConfig,
    session_id: String,
    assessment_id: Option<String>,
    state: FlowState,
    current_question: Question,
    pending_question: Option<Question>,
    progress: SessionProgress,
    scoring_error: Option<String>,
    results: Option<AssessmentResults>,
    job_poller: JobStatusPoller,
    bounded_wait: BoundedWaitPoller,
    aggregate: AggregateJobPoller,
    feedback: Arc<FeedbackRequest>,
    events: broadcast::Sender<FlowEvent>,
    shutdown: CancellationToken,
}

impl SessionFlowController {
    pub fn new(api: Arc<dyn AssessmentApi>, config: FlowConfig, start: SessionStart) -> Self {
        let (events, _) = broadcast::channel(FLOW_EVENT_CAPACITY);
        let job_poller = JobStatusPoller::with_config(Arc::clone(&api), config.job.clone());
        let bounded_wait =
            BoundedWaitPoller::with_config(Arc::clone(&api), config.bounded_wait.clone());
        let aggregate = AggregateJobPoller::with_config(Arc::clone(&api), config.aggregate.clone());

        info!(session_id = %start.session_id, question_id = %start.question.id, "Session flow started");

        Self {
            api,
            config,
            session_id: start.session_id,
            assessment_id: None,
            state: FlowState::AwaitingAnswer,
            current_question: start.question,
            pending_question: None,
            progress: start.progress.normalized(),
            scoring_error: None,
            results: None,
            job_poller,
            bounded_wait,
            aggregate,
            feedback: Arc::new(FeedbackRequest::new()),
            events,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FlowEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> FlowState {
        self.state
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Known once the final answer has been accepted.
    pub fn assessment_id(&self) -> Option<&str> {
        self.assessment_id.as_deref()
    }

    /// The question the user is answering, or last answered.
    pub fn current_question(&self) -> &Question {
        &self.current_question
    }

    pub fn progress(&self) -> &SessionProgress {
        &self.progress
    }

    /// Live rollup while all responses are being scored.
    pub fn scoring_progress(&self) -> Option<AggregateProgress> {
        self.aggregate.progress()
    }

    /// Message of the last scoring failure, cleared by a retry.
    pub fn scoring_error(&self) -> Option<&str> {
        self.scoring_error.as_deref()
    }

    pub fn results(&self) -> Option<&AssessmentResults> {
        self.results.as_ref()
    }

    /// Whether final feedback generation was requested successfully.
    pub fn feedback_requested(&self) -> bool {
        self.feedback.is_done()
    }

    /// Token that aborts the operation in progress when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Submit the answer to the current question.
    ///
    /// Waits for the next question to be revealed, or for every response to
    /// be scored after the final answer. If the flow is cancelled while the
    /// request is in flight, the request still runs to completion and its
    /// response is discarded.
    pub async fn submit_answer(&mut self, answer: &str) -> Result<SubmitOutcome, FlowError> {
        self.ensure_live()?;
        self.expect_state(FlowState::AwaitingAnswer)?;
        self.transition(FlowState::Submitting);

        debug!(
            session_id = %self.session_id,
            question_id = %self.current_question.id,
            answer_len = answer.len(),
            "Submitting answer"
        );
        let api = Arc::clone(&self.api);
        let (session_id, answer_text) = (self.session_id.clone(), answer.to_string());
        let request =
            tokio::spawn(async move { api.submit_answer(&session_id, &answer_text).await });
        let submitted = until_cancelled(&self.shutdown, request)
            .await
            .map(|joined| {
                joined.unwrap_or_else(|e| {
                    Err(ApiError::Transport(format!("submit task failed: {e}")))
                })
            });
        let response = match submitted {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                warn!(session_id = %self.session_id, error = %e, "Answer submission failed");
                self.emit(FlowEvent::SubmitFailed(e.to_string()));
                self.transition(FlowState::AwaitingAnswer);
                return Err(FlowError::Submit(e));
            }
            Err(cancelled) => {
                self.transition(FlowState::AwaitingAnswer);
                return Err(cancelled);
            }
        };

        self.update_progress(&response);

        if response.is_complete {
            return self.finish_answers(&response).await;
        }

        let Some(question) = response.question else {
            warn!(session_id = %self.session_id, "Submit response carried no next question");
            self.transition(FlowState::AwaitingAnswer);
            return Err(FlowError::MissingQuestion);
        };
        self.pending_question = Some(question);

        if let Some(job_id) = response.scoring_job_id {
            self.transition(FlowState::AwaitingNextQuestion);
            self.await_bounded_wait(&job_id).await?;
        }

        Ok(SubmitOutcome::NextQuestion(self.reveal_pending()?))
    }

    /// Ask the backend to re-score failed responses and wait again.
    pub async fn retry_scoring(&mut self) -> Result<SubmitOutcome, FlowError> {
        self.ensure_live()?;
        self.expect_state(FlowState::AwaitingAllScoring)?;
        let assessment_id = self.results_key();

        info!(assessment_id = %assessment_id, "Retrying scoring");
        until_cancelled(&self.shutdown, self.api.retry_scoring(&assessment_id))
            .await?
            .map_err(|e| {
                warn!(assessment_id = %assessment_id, error = %e, "Scoring retry request failed");
                FlowError::RetryScoring(e)
            })?;

        self.await_scoring(&assessment_id).await?;
        self.scoring_complete(&assessment_id);
        Ok(SubmitOutcome::AssessmentComplete)
    }

    /// Fetch final results, following generation jobs until they are ready.
    ///
    /// May be called again after any failure.
    pub async fn fetch_results(&mut self) -> Result<AssessmentResults, FlowError> {
        self.ensure_live()?;
        if !matches!(self.state, FlowState::ResultsPending | FlowState::ResultsReady) {
            return Err(FlowError::InvalidState {
                expected: FlowState::ResultsPending.to_string(),
                actual: self.state.to_string(),
            });
        }

        let assessment_id = self.results_key();
        if self.feedback.has_failed() {
            debug!(assessment_id = %assessment_id, "Re-requesting final feedback");
            self.request_final_feedback(&assessment_id);
        }

        let mut handoffs = 0;
        loop {
            let results = until_cancelled(&self.shutdown, self.api.results(&assessment_id))
                .await?
                .map_err(|e| {
                    warn!(assessment_id = %assessment_id, error = %e, "Results request failed");
                    FlowError::Results(e)
                })?;

            if !results.is_generating() {
                info!(assessment_id = %assessment_id, score = ?results.final_score, "Results ready");
                self.results = Some(results.clone());
                self.transition(FlowState::ResultsReady);
                self.emit(FlowEvent::ResultsReady(results.clone()));
                return Ok(results);
            }

            let Some(job_id) = results.job_id else {
                debug!(assessment_id = %assessment_id, "Results processing without a job id");
                return Err(FlowError::ResultsNotReady);
            };
            if handoffs >= self.config.max_result_handoffs {
                warn!(assessment_id = %assessment_id, handoffs, "Results still generating after handoffs");
                return Err(FlowError::ResultsNotReady);
            }
            handoffs += 1;

            debug!(assessment_id = %assessment_id, job_id = %job_id, handoffs, "Waiting on results job");
            self.emit(FlowEvent::ResultsGenerating {
                job_id: job_id.clone(),
            });
            self.await_job(&job_id).await?;
        }
    }

    /// Cancel the operation in progress and stop every poller.
    pub fn teardown(&mut self) {
        self.shutdown.cancel();
        self.job_poller.cancel_polling();
        self.bounded_wait.cancel_polling();
        self.aggregate.cancel_polling();
    }

    async fn finish_answers(
        &mut self,
        response: &SubmitAnswerResponse,
    ) -> Result<SubmitOutcome, FlowError> {
        let assessment_id = response.assessment_id().to_string();
        self.assessment_id = Some(assessment_id.clone());
        info!(session_id = %self.session_id, assessment_id = %assessment_id, "All answers submitted");

        self.transition(FlowState::AwaitingAllScoring);
        self.emit(FlowEvent::AnswersComplete {
            assessment_id: assessment_id.clone(),
        });

        self.await_scoring(&assessment_id).await?;
        self.scoring_complete(&assessment_id);
        Ok(SubmitOutcome::AssessmentComplete)
    }

    async fn await_scoring(&mut self, assessment_id: &str) -> Result<(), FlowError> {
        self.scoring_error = None;
        let mut rx = self.aggregate.subscribe();
        self.aggregate.start_polling(assessment_id);

        loop {
            let event = match until_cancelled(&self.shutdown, rx.recv()).await {
                Ok(event) => event,
                Err(cancelled) => {
                    self.aggregate.cancel_polling();
                    return Err(cancelled);
                }
            };

            match event {
                Ok(AggregateEvent::Progress(progress)) => {
                    self.emit(FlowEvent::ScoringProgress(progress));
                }
                Ok(AggregateEvent::Completed) => return Ok(()),
                Ok(AggregateEvent::Failed(error)) => {
                    let message = error.to_string();
                    warn!(
                        assessment_id = %assessment_id,
                        error = %message,
                        retryable = error.is_retryable(),
                        "Scoring failed"
                    );
                    self.scoring_error = Some(message.clone());
                    self.emit(FlowEvent::ScoringFailed(message));
                    return Err(FlowError::ScoringFailed(error));
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Scoring events lagged");
                }
                Err(RecvError::Closed) => return Err(FlowError::Cancelled),
            }
        }
    }

    fn scoring_complete(&mut self, assessment_id: &str) {
        self.transition(FlowState::ResultsPending);
        self.request_final_feedback(assessment_id);
    }

    async fn await_bounded_wait(&mut self, job_id: &str) -> Result<(), FlowError> {
        let mut rx = self.bounded_wait.subscribe();
        self.bounded_wait.start_polling(job_id);

        loop {
            let event = match until_cancelled(&self.shutdown, rx.recv()).await {
                Ok(event) => event,
                Err(cancelled) => {
                    self.bounded_wait.cancel_polling();
                    return Err(cancelled);
                }
            };

            match event {
                Ok(completion) => {
                    debug!(job_id = %completion.job_id, reason = ?completion.reason, "Next question released");
                    return Ok(());
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Bounded wait events lagged");
                }
                Err(RecvError::Closed) => return Err(FlowError::Cancelled),
            }
        }
    }

    async fn await_job(&mut self, job_id: &str) -> Result<(), FlowError> {
        let mut rx = self.job_poller.subscribe();
        self.job_poller.start_polling(job_id, None);

        loop {
            let event = match until_cancelled(&self.shutdown, rx.recv()).await {
                Ok(event) => event,
                Err(cancelled) => {
                    self.job_poller.cancel_polling();
                    return Err(cancelled);
                }
            };

            match event {
                Ok(JobPollEvent::Progress(status)) => {
                    trace!(job_id = %job_id, status = %status.status, "Results job running");
                }
                Ok(JobPollEvent::Completed(_)) => return Ok(()),
                Ok(JobPollEvent::Failed { error, .. }) => {
                    warn!(job_id = %job_id, error = %error, "Results job failed");
                    return Err(FlowError::Poll(error));
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Job events lagged");
                }
                Err(RecvError::Closed) => return Err(FlowError::Cancelled),
            }
        }
    }

    fn reveal_pending(&mut self) -> Result<Question, FlowError> {
        let question = self.pending_question.take().ok_or(FlowError::MissingQuestion)?;
        self.current_question = question.clone();
        debug!(session_id = %self.session_id, question_id = %question.id, "Question revealed");
        self.emit(FlowEvent::QuestionRevealed(question.clone()));
        self.transition(FlowState::AwaitingAnswer);
        Ok(question)
    }

    fn update_progress(&mut self, response: &SubmitAnswerResponse) {
        let progress = match &response.progress {
            Some(progress) => progress.clone().normalized(),
            None => self.progress.clone().advanced(),
        };
        self.progress = if response.is_complete {
            progress.completed()
        } else {
            progress
        };
        self.emit(FlowEvent::ProgressUpdated(self.progress.clone()));
    }

    fn request_final_feedback(&self, assessment_id: &str) {
        FeedbackRequest::send(
            &self.feedback,
            Arc::clone(&self.api),
            assessment_id.to_string(),
            self.events.clone(),
        );
    }

    fn results_key(&self) -> String {
        self.assessment_id
            .clone()
            .unwrap_or_else(|| self.session_id.clone())
    }

    fn ensure_live(&self) -> Result<(), FlowError> {
        if self.shutdown.is_cancelled() {
            return Err(FlowError::Cancelled);
        }
        Ok(())
    }

    fn expect_state(&self, expected: FlowState) -> Result<(), FlowError> {
        if self.state != expected {
            return Err(FlowError::InvalidState {
                expected: expected.to_string(),
                actual: self.state.to_string(),
            });
        }
        Ok(())
    }

    fn transition(&mut self, to: FlowState) {
        let from = std::mem::replace(&mut self.state, to);
        if from != to {
            debug!("Flow state: {:?} -> {:?}", from, to);
            self.emit(FlowEvent::StateChanged { from, to });
        }
    }

    fn emit(&self, event: FlowEvent) {
        let _ = self.events.send(event);
    }
}

impl Drop for SessionFlowController {
    fn drop(&mut self) {
        self.teardown();
    }
}

async fn until_cancelled<T>(
    shutdown: &CancellationToken,
    fut: impl Future<Output = T>,
) -> Result<T, FlowError> {
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => Err(FlowError::Cancelled),
        output = fut => Ok(output),
    }
}

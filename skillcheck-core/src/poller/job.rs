//! Single-job polling with exponential backoff.
//!
//! [`JobStatusPoller`] requests a job's status immediately, then waits
//! `delay(n)` after every non-terminal answer or transport error. It stops on
//! `completed`, `failed`, or when a positive `max_attempts` cap is reached.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::{CompletionGuard, EVENT_CHANNEL_CAPACITY, Episode, MIN_INTERVAL, lock};
use crate::api::{ApiResult, AssessmentApi};
use crate::config::PollingConfig;
use crate::error::{PollError, PollerStateError};
use crate::types::{JobState, JobStatus};

/// Message for the client-side attempt cap.
const CLIENT_TIMEOUT_MESSAGE: &str =
    "This is taking longer than expected. Please try again.";

/// Events published by a [`JobStatusPoller`].
#[derive(Debug, Clone, PartialEq)]
pub enum JobPollEvent {
    /// A non-terminal status was received.
    Progress(JobStatus),
    /// The job completed. Published at most once per episode.
    Completed(JobStatus),
    /// The job failed or the attempt cap was reached. Published at most once
    /// per episode.
    Failed {
        error: PollError,
        status: Option<JobStatus>,
    },
}

/// Observable state of a [`JobStatusPoller`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobPollSnapshot {
    pub job_id: Option<String>,
    pub is_polling: bool,
    /// Non-terminal responses and transport errors in this episode.
    pub attempt_count: u32,
    pub last_status: Option<JobStatus>,
    pub error: Option<PollError>,
}

/// Polls one job until it reaches a terminal state.
///
/// Subscribe before calling [`start_polling`](Self::start_polling) to observe
/// every event of the episode.
pub struct JobStatusPoller {
    api: Arc<dyn AssessmentApi>,
    default_config: PollingConfig,
    config: PollingConfig,
    state: Arc<Mutex<JobPollSnapshot>>,
    events: broadcast::Sender<JobPollEvent>,
    episode: Option<Episode>,
}

impl JobStatusPoller {
    pub fn new(api: Arc<dyn AssessmentApi>) -> Self {
        Self::with_config(api, PollingConfig::default())
    }

    /// Create a poller whose episodes use `config` unless overridden.
    pub fn with_config(api: Arc<dyn AssessmentApi>, config: PollingConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            api,
            default_config: config.clone(),
            config,
            state: Arc::new(Mutex::new(JobPollSnapshot::default())),
            events,
            episode: None,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobPollEvent> {
        self.events.subscribe()
    }

    pub fn snapshot(&self) -> JobPollSnapshot {
        lock(&self.state).clone()
    }

    pub fn is_polling(&self) -> bool {
        lock(&self.state).is_polling
    }

    pub fn attempt_count(&self) -> u32 {
        lock(&self.state).attempt_count
    }

    /// Schedule used by the current (or next) episode.
    pub fn config(&self) -> &PollingConfig {
        &self.config
    }

    /// Begin polling `job_id`, cancelling any episode already running.
    pub fn start_polling(&mut self, job_id: impl Into<String>, config: Option<PollingConfig>) {
        self.cancel_polling();

        let job_id = job_id.into();
        self.config = config.unwrap_or_else(|| self.default_config.clone());
        *lock(&self.state) = JobPollSnapshot {
            job_id: Some(job_id.clone()),
            is_polling: true,
            ..Default::default()
        };

        info!(
            job_id = %job_id,
            max_attempts = self.config.max_attempts,
            "Starting job status polling"
        );
        self.spawn_episode(job_id);
    }

    /// Stop polling. Responses to requests already in flight are discarded.
    pub fn cancel_polling(&mut self) {
        let mut state = lock(&self.state);
        if let Some(episode) = self.episode.take() {
            episode.cancel();
            debug!(
                job_id = ?state.job_id,
                finished = episode.is_finished(),
                "Cancelled job status polling"
            );
        }
        state.is_polling = false;
    }

    /// Restart the last job from a clean attempt count.
    ///
    /// Rejected while an episode is still polling, or if nothing was ever
    /// started.
    pub fn retry(&mut self) -> Result<(), PollerStateError> {
        let job_id = {
            let mut state = lock(&self.state);
            if state.is_polling {
                return Err(PollerStateError::AlreadyPolling);
            }
            let job_id = state.job_id.clone().ok_or(PollerStateError::NotStarted)?;
            state.error = None;
            state.last_status = None;
            state.attempt_count = 0;
            state.is_polling = true;
            job_id
        };

        // The previous episode has already stopped; drop its handles.
        self.episode = None;
        info!(job_id = %job_id, "Retrying job status polling");
        self.spawn_episode(job_id);
        Ok(())
    }

    /// Forget everything, as if `start_polling` had never been called.
    pub fn reset(&mut self) {
        self.cancel_polling();
        *lock(&self.state) = JobPollSnapshot::default();
        self.config = self.default_config.clone();
    }

    fn spawn_episode(&mut self, job_id: String) {
        let mut episode = Episode::new();
        let task = JobPollTask {
            api: Arc::clone(&self.api),
            job_id,
            config: self.config.clone(),
            state: Arc::clone(&self.state),
            events: self.events.clone(),
            token: episode.token(),
            guard: episode.guard(),
        };
        episode.attach(tokio::spawn(task.run()));
        self.episode = Some(episode);
    }
}

impl Drop for JobStatusPoller {
    fn drop(&mut self) {
        self.cancel_polling();
    }
}

struct JobPollTask {
    api: Arc<dyn AssessmentApi>,
    job_id: String,
    config: PollingConfig,
    state: Arc<Mutex<JobPollSnapshot>>,
    events: broadcast::Sender<JobPollEvent>,
    token: CancellationToken,
    guard: Arc<CompletionGuard>,
}

impl JobPollTask {
    async fn run(self) {
        loop {
            let response = self.api.job_status(&self.job_id).await;
            let Some(delay) = self.handle_response(response) else {
                return;
            };

            trace!(job_id = %self.job_id, delay_ms = delay.as_millis() as u64, "Scheduling next job status check");
            tokio::select! {
                _ = self.token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Apply one response. Returns the delay before the next request, or
    /// `None` when the episode is over.
    fn handle_response(&self, response: ApiResult<JobStatus>) -> Option<Duration> {
        let mut state = lock(&self.state);
        if self.token.is_cancelled() {
            debug!(job_id = %self.job_id, "Discarding job status response after cancellation");
            return None;
        }

        match response {
            Ok(status) => {
                let status = status.normalized();
                state.last_status = Some(status.clone());
                match status.status {
                    JobState::Completed => {
                        state.is_polling = false;
                        if self.guard.try_complete() {
                            info!(job_id = %self.job_id, "Job completed");
                            let _ = self.events.send(JobPollEvent::Completed(status));
                        }
                        return None;
                    }
                    JobState::Failed => {
                        let error = PollError::JobFailed {
                            message: status.failure_message(),
                            retryable: status.retryable,
                        };
                        state.is_polling = false;
                        state.error = Some(error.clone());
                        if self.guard.try_complete() {
                            warn!(job_id = %self.job_id, error = %error, retryable = status.retryable, "Job failed");
                            let _ = self.events.send(JobPollEvent::Failed {
                                error,
                                status: Some(status),
                            });
                        }
                        return None;
                    }
                    JobState::Pending
                    | JobState::Running
                    | JobState::RunningSecondary
                    | JobState::Unknown => {
                        state.attempt_count += 1;
                        trace!(job_id = %self.job_id, status = %status.status, attempt = state.attempt_count, "Job still running");
                        let _ = self.events.send(JobPollEvent::Progress(status));
                    }
                }
            }
            Err(e) => {
                state.attempt_count += 1;
                warn!(job_id = %self.job_id, attempt = state.attempt_count, error = %e, "Job status request failed, will retry");
            }
        }

        if self.config.max_attempts > 0 && state.attempt_count >= self.config.max_attempts {
            let error = PollError::ClientTimeout {
                message: CLIENT_TIMEOUT_MESSAGE.to_string(),
                attempts: state.attempt_count,
            };
            state.is_polling = false;
            state.error = Some(error.clone());
            if self.guard.try_complete() {
                warn!(job_id = %self.job_id, attempts = state.attempt_count, "Job polling attempt cap reached");
                let _ = self.events.send(JobPollEvent::Failed {
                    error,
                    status: state.last_status.clone(),
                });
            }
            return None;
        }

        Some(self.config.delay(state.attempt_count - 1).max(MIN_INTERVAL))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::MockAssessmentApi;
    use crate::error::ApiError;
    use tokio::sync::broadcast::error::TryRecvError;
    use tokio::time::Instant;

    fn fast_config() -> PollingConfig {
        PollingConfig::default()
            .with_initial_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(800))
            .with_backoff_factor(2.0)
    }

    fn poller(api: &Arc<MockAssessmentApi>, config: PollingConfig) -> JobStatusPoller {
        let api: Arc<dyn AssessmentApi> = api.clone();
        JobStatusPoller::with_config(api, config)
    }

    fn running(job_id: &str) -> ApiResult<JobStatus> {
        Ok(JobStatus::new(job_id, JobState::Running))
    }

    async fn next_terminal(rx: &mut broadcast::Receiver<JobPollEvent>) -> JobPollEvent {
        loop {
            match rx.recv().await.unwrap() {
                JobPollEvent::Progress(_) => continue,
                event => return event,
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn completes_after_running_statuses() {
        let api = Arc::new(MockAssessmentApi::new());
        api.queue_job_status(running("job-1"));
        api.queue_job_status(running("job-1"));
        api.queue_job_status(Ok(JobStatus::completed("job-1")));

        let mut poller = poller(&api, fast_config());
        let mut rx = poller.subscribe();
        poller.start_polling("job-1", None);

        let event = next_terminal(&mut rx).await;
        assert!(matches!(event, JobPollEvent::Completed(ref s) if s.job_id == "job-1"));

        let snapshot = poller.snapshot();
        assert!(!snapshot.is_polling);
        assert_eq!(snapshot.attempt_count, 2);
        assert!(snapshot.last_status.unwrap().completed);
    }

    #[tokio::test(start_paused = true)]
    async fn requests_follow_backoff_schedule() {
        let api = Arc::new(MockAssessmentApi::new());
        for _ in 0..5 {
            api.queue_job_status(running("job-1"));
        }
        api.queue_job_status(Ok(JobStatus::completed("job-1")));

        let mut poller = poller(&api, fast_config());
        let mut rx = poller.subscribe();
        poller.start_polling("job-1", None);
        next_terminal(&mut rx).await;

        let at = api.calls().job_status_at;
        let gaps: Vec<u128> = at.windows(2).map(|w| (w[1] - w[0]).as_millis()).collect();
        assert_eq!(gaps, vec![100, 200, 400, 800, 800]);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_initial_delay_still_paces_requests() {
        let api = Arc::new(MockAssessmentApi::new());
        for _ in 0..3 {
            api.queue_job_status(running("job-1"));
        }
        api.queue_job_status(Ok(JobStatus::completed("job-1")));

        let config = PollingConfig::default().with_initial_delay(Duration::ZERO);
        let mut poller = poller(&api, config);
        let mut rx = poller.subscribe();
        poller.start_polling("job-1", None);
        next_terminal(&mut rx).await;

        let at = api.calls().job_status_at;
        let gaps: Vec<Duration> = at.windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(gaps, vec![MIN_INTERVAL; 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn unrecognised_state_keeps_polling() {
        let api = Arc::new(MockAssessmentApi::new());
        api.queue_job_status(Ok(JobStatus::new("job-1", JobState::Unknown)));
        api.queue_job_status(Ok(JobStatus::completed("job-1")));

        let mut poller = poller(&api, fast_config());
        let mut rx = poller.subscribe();
        poller.start_polling("job-1", None);

        match rx.recv().await.unwrap() {
            JobPollEvent::Progress(status) => assert_eq!(status.status, JobState::Unknown),
            other => panic!("expected progress, got {other:?}"),
        }
        assert!(matches!(next_terminal(&mut rx).await, JobPollEvent::Completed(_)));
        assert_eq!(poller.attempt_count(), 1);
        assert!(poller.snapshot().error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn completion_stops_further_requests() {
        let api = Arc::new(MockAssessmentApi::new());
        api.queue_job_status(Ok(JobStatus::completed("job-1")));
        api.set_job_status_fallback(running("job-1"));

        let mut poller = poller(&api, PollingConfig::default());
        let mut rx = poller.subscribe();
        poller.start_polling("job-1", None);

        assert!(matches!(next_terminal(&mut rx).await, JobPollEvent::Completed(_)));
        tokio::time::sleep(Duration::from_secs(120)).await;

        assert_eq!(api.calls().job_status.len(), 1);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test(start_paused = true)]
    async fn unlimited_attempts_survive_transport_errors() {
        let api = Arc::new(MockAssessmentApi::new());
        api.set_job_status_fallback(Err(ApiError::Transport("offline".to_string())));

        let config = PollingConfig::default()
            .with_initial_delay(Duration::from_millis(10))
            .with_max_delay(Duration::from_millis(50))
            .with_max_attempts(0);
        let mut poller = poller(&api, config);
        let mut rx = poller.subscribe();
        poller.start_polling("job-1", None);

        while api.calls().job_status.len() < 100 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        assert!(poller.is_polling());
        assert!(poller.attempt_count() >= 100);
        assert!(poller.snapshot().error.is_none());
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_status_reports_retryable_flag() {
        let api = Arc::new(MockAssessmentApi::new());
        api.queue_job_status(running("job-1"));
        api.queue_job_status(Ok(JobStatus::failed("job-1", "Model overloaded", true)));

        let mut poller = poller(&api, fast_config());
        let mut rx = poller.subscribe();
        poller.start_polling("job-1", None);

        match next_terminal(&mut rx).await {
            JobPollEvent::Failed { error, status } => {
                assert_eq!(
                    error,
                    PollError::JobFailed {
                        message: "Model overloaded".to_string(),
                        retryable: true,
                    }
                );
                assert!(status.unwrap().failed);
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert!(!poller.is_polling());
        assert!(poller.snapshot().error.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_cap_synthesizes_client_timeout() {
        let api = Arc::new(MockAssessmentApi::new());
        api.queue_job_status(running("job-1"));
        api.queue_job_status(Err(ApiError::Timeout));
        api.set_job_status_fallback(running("job-1"));

        let mut poller = poller(&api, fast_config().with_max_attempts(3));
        let mut rx = poller.subscribe();
        poller.start_polling("job-1", None);

        match next_terminal(&mut rx).await {
            JobPollEvent::Failed { error, status } => {
                assert!(matches!(error, PollError::ClientTimeout { attempts: 3, .. }));
                assert!(error.is_retryable());
                assert!(error.to_string().contains("longer than expected"));
                assert_eq!(status.unwrap().status, JobState::Running);
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        assert_eq!(api.calls().job_status.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_discards_in_flight_response() {
        let api = Arc::new(MockAssessmentApi::new());
        api.set_latency(Duration::from_millis(500));
        api.queue_job_status(Ok(JobStatus::completed("job-1")));

        let mut poller = poller(&api, fast_config());
        let mut rx = poller.subscribe();
        poller.start_polling("job-1", None);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(api.calls().job_status.len(), 1);
        poller.cancel_polling();

        tokio::time::sleep(Duration::from_secs(5)).await;

        let snapshot = poller.snapshot();
        assert!(!snapshot.is_polling);
        assert!(snapshot.last_status.is_none());
        assert_eq!(snapshot.attempt_count, 0);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
        assert_eq!(api.calls().job_status.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_restarts_with_initial_delay() {
        let api = Arc::new(MockAssessmentApi::new());
        for _ in 0..3 {
            api.queue_job_status(running("job-1"));
        }
        api.queue_job_status(Ok(JobStatus::failed("job-1", "boom", true)));
        api.queue_job_status(running("job-1"));
        api.queue_job_status(Ok(JobStatus::completed("job-1")));

        let mut poller = poller(&api, fast_config());
        let mut rx = poller.subscribe();
        poller.start_polling("job-1", None);
        assert!(matches!(next_terminal(&mut rx).await, JobPollEvent::Failed { .. }));

        poller.retry().unwrap();
        let snapshot = poller.snapshot();
        assert!(snapshot.is_polling);
        assert_eq!(snapshot.attempt_count, 0);
        assert!(snapshot.error.is_none());

        assert!(matches!(next_terminal(&mut rx).await, JobPollEvent::Completed(_)));

        let at = api.calls().job_status_at;
        assert_eq!(at.len(), 6);
        assert_eq!((at[5] - at[4]).as_millis(), 100);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_rejected_while_polling_or_before_start() {
        let api = Arc::new(MockAssessmentApi::new());
        api.set_job_status_fallback(running("job-1"));

        let mut poller = poller(&api, fast_config());
        assert_eq!(poller.retry(), Err(PollerStateError::NotStarted));

        poller.start_polling("job-1", None);
        assert_eq!(poller.retry(), Err(PollerStateError::AlreadyPolling));
    }

    #[tokio::test(start_paused = true)]
    async fn reset_clears_everything() {
        let api = Arc::new(MockAssessmentApi::new());
        api.set_job_status_fallback(running("job-1"));

        let mut poller = poller(&api, fast_config());
        poller.start_polling("job-1", Some(fast_config().with_max_attempts(9)));
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(poller.attempt_count() > 0);
        assert_eq!(poller.config().max_attempts, 9);

        poller.reset();
        assert_eq!(poller.snapshot(), JobPollSnapshot::default());
        assert_eq!(poller.config().max_attempts, 0);
        assert_eq!(poller.retry(), Err(PollerStateError::NotStarted));

        let calls = api.calls().job_status.len();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(api.calls().job_status.len(), calls);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_replaces_previous_episode() {
        let api = Arc::new(MockAssessmentApi::new());
        api.set_latency(Duration::from_millis(200));
        api.queue_job_status(Ok(JobStatus::completed("old")));
        api.queue_job_status(Ok(JobStatus::completed("new")));

        let mut poller = poller(&api, fast_config());
        let mut rx = poller.subscribe();
        poller.start_polling("old", None);
        tokio::time::sleep(Duration::from_millis(50)).await;
        poller.start_polling("new", None);

        let event = next_terminal(&mut rx).await;
        assert!(matches!(event, JobPollEvent::Completed(ref s) if s.job_id == "new"));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
        assert_eq!(poller.snapshot().job_id.as_deref(), Some("new"));
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_poller_stops_requests() {
        let api = Arc::new(MockAssessmentApi::new());
        api.set_job_status_fallback(running("job-1"));

        let mut poller = poller(&api, fast_config());
        poller.start_polling("job-1", None);
        tokio::time::sleep(Duration::from_millis(250)).await;
        drop(poller);

        let calls = api.calls().job_status.len();
        let start = Instant::now();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(start.elapsed() >= Duration::from_secs(10));
        assert_eq!(api.calls().job_status.len(), calls);
    }
}

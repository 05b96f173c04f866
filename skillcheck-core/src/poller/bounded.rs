//! Deadline-bounded wait for a job.
//!
//! Used between questions: the next question is revealed either when its
//! scoring job reports completion or when `max_wait` elapses, whichever comes
//! first. The two arms run as separate tasks and race through the episode's
//! [`CompletionGuard`].

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use super::{CompletionGuard, EVENT_CHANNEL_CAPACITY, Episode, MIN_INTERVAL, lock};
use crate::api::{ApiResult, AssessmentApi};
use crate::config::BoundedWaitConfig;
use crate::types::JobStatus;

/// Why a bounded wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionReason {
    JobCompleted,
    DeadlineElapsed,
}

/// Published once per episode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundedWaitCompletion {
    pub job_id: String,
    pub reason: CompletionReason,
}

/// Observable state of a [`BoundedWaitPoller`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BoundedWaitSnapshot {
    pub job_id: Option<String>,
    pub is_polling: bool,
    /// Status checks whose responses were applied.
    pub checks: u32,
    pub completion: Option<CompletionReason>,
}

pub struct BoundedWaitPoller {
    api: Arc<dyn AssessmentApi>,
    config: BoundedWaitConfig,
    state: Arc<Mutex<BoundedWaitSnapshot>>,
    events: broadcast::Sender<BoundedWaitCompletion>,
    episode: Option<Episode>,
}

impl BoundedWaitPoller {
    pub fn new(api: Arc<dyn AssessmentApi>) -> Self {
        Self::with_config(api, BoundedWaitConfig::default())
    }

    pub fn with_config(api: Arc<dyn AssessmentApi>, config: BoundedWaitConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            api,
            config,
            state: Arc::new(Mutex::new(BoundedWaitSnapshot::default())),
            events,
            episode: None,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BoundedWaitCompletion> {
        self.events.subscribe()
    }

    pub fn snapshot(&self) -> BoundedWaitSnapshot {
        lock(&self.state).clone()
    }

    pub fn is_polling(&self) -> bool {
        lock(&self.state).is_polling
    }

    /// Wait on `job_id` with the configured deadline and interval.
    pub fn start_polling(&mut self, job_id: impl Into<String>) {
        let BoundedWaitConfig { max_wait, interval } = self.config.clone();
        self.start_polling_with(job_id, max_wait, interval);
    }

    /// Wait on `job_id` for at most `max_wait`, checking every `interval`.
    pub fn start_polling_with(
        &mut self,
        job_id: impl Into<String>,
        max_wait: Duration,
        interval: Duration,
    ) {
        self.cancel_polling();

        let job_id = job_id.into();
        *lock(&self.state) = BoundedWaitSnapshot {
            job_id: Some(job_id.clone()),
            is_polling: true,
            ..Default::default()
        };

        info!(
            job_id = %job_id,
            max_wait_ms = max_wait.as_millis() as u64,
            interval_ms = interval.as_millis() as u64,
            "Starting bounded wait"
        );

        let mut episode = Episode::new();
        let race = Race {
            job_id,
            state: Arc::clone(&self.state),
            events: self.events.clone(),
            token: episode.token(),
            guard: episode.guard(),
        };

        episode.attach(tokio::spawn(race.clone().deadline(max_wait)));
        episode.attach(tokio::spawn(
            race.checks(Arc::clone(&self.api), interval.max(MIN_INTERVAL)),
        ));
        self.episode = Some(episode);
    }

    /// Stop both arms without publishing a completion.
    pub fn cancel_polling(&mut self) {
        let mut state = lock(&self.state);
        if let Some(episode) = self.episode.take() {
            episode.cancel();
            debug!(
                job_id = ?state.job_id,
                finished = episode.is_finished(),
                "Cancelled bounded wait"
            );
        }
        state.is_polling = false;
    }
}

impl Drop for BoundedWaitPoller {
    fn drop(&mut self) {
        self.cancel_polling();
    }
}

#[derive(Clone)]
struct Race {
    job_id: String,
    state: Arc<Mutex<BoundedWaitSnapshot>>,
    events: broadcast::Sender<BoundedWaitCompletion>,
    token: CancellationToken,
    guard: Arc<CompletionGuard>,
}

impl Race {
    async fn deadline(self, max_wait: Duration) {
        tokio::select! {
            _ = self.token.cancelled() => {}
            _ = tokio::time::sleep(max_wait) => self.deadline_elapsed(),
        }
    }

    async fn checks(self, api: Arc<dyn AssessmentApi>, period: Duration) {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.token.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let response = api.job_status(&self.job_id).await;
            if self.apply_check(response) {
                return;
            }
        }
    }

    fn deadline_elapsed(&self) {
        let mut state = lock(&self.state);
        self.finish(&mut state, CompletionReason::DeadlineElapsed);
    }

    /// Returns `true` once the episode is over.
    fn apply_check(&self, response: ApiResult<JobStatus>) -> bool {
        let mut state = lock(&self.state);
        if self.token.is_cancelled() {
            return true;
        }
        state.checks += 1;

        match response {
            Ok(status) if status.is_completed() => {
                self.finish(&mut state, CompletionReason::JobCompleted);
                true
            }
            Ok(status) => {
                trace!(job_id = %self.job_id, status = %status.status, "Job not completed yet");
                false
            }
            Err(e) => {
                debug!(job_id = %self.job_id, error = %e, "Ignoring failed status check");
                false
            }
        }
    }

    /// Must be called with the state lock held.
    fn finish(&self, state: &mut BoundedWaitSnapshot, reason: CompletionReason) {
        if self.token.is_cancelled() || !self.guard.try_complete() {
            return;
        }
        self.token.cancel();
        state.is_polling = false;
        state.completion = Some(reason);

        info!(job_id = %self.job_id, reason = ?reason, "Bounded wait finished");
        let _ = self.events.send(BoundedWaitCompletion {
            job_id: self.job_id.clone(),
            reason,
        });
    }
}

//! Fixed-interval polling of an assessment's scoring rollup.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::{CompletionGuard, EVENT_CHANNEL_CAPACITY, Episode, MIN_INTERVAL, lock};
use crate::api::{ApiResult, AssessmentApi};
use crate::config::AggregateConfig;
use crate::error::PollError;
use crate::types::{AggregateOutcome, AggregateProgress, AggregateStatus};

/// Events published by an [`AggregateJobPoller`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AggregateEvent {
    Progress(AggregateProgress),
    /// Every scoring job completed.
    Completed,
    /// A scoring job failed. Always [`PollError::AggregateFailed`].
    Failed(PollError),
}

/// Observable state of an [`AggregateJobPoller`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregateSnapshot {
    pub assessment_id: Option<String>,
    pub is_polling: bool,
    pub progress: Option<AggregateProgress>,
    pub error: Option<String>,
    pub completed: bool,
    pub checks: u32,
    /// Transport errors since the last successful check.
    pub consecutive_errors: u32,
}

/// Polls until every scoring job of an assessment completed, failing fast as
/// soon as any one of them fails.
///
/// There is no attempt cap: only a terminal rollup or
/// [`cancel_polling`](Self::cancel_polling) ends an episode.
pub struct AggregateJobPoller {
    api: Arc<dyn AssessmentApi>,
    config: AggregateConfig,
    state: Arc<Mutex<AggregateSnapshot>>,
    events: broadcast::Sender<AggregateEvent>,
    episode: Option<Episode>,
}

impl AggregateJobPoller {
    pub fn new(api: Arc<dyn AssessmentApi>) -> Self {
        Self::with_config(api, AggregateConfig::default())
    }

    pub fn with_config(api: Arc<dyn AssessmentApi>, config: AggregateConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            api,
            config,
            state: Arc::new(Mutex::new(AggregateSnapshot::default())),
            events,
            episode: None,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AggregateEvent> {
        self.events.subscribe()
    }

    pub fn snapshot(&self) -> AggregateSnapshot {
        lock(&self.state).clone()
    }

    /// Latest rollup progress, if any check has succeeded.
    pub fn progress(&self) -> Option<AggregateProgress> {
        lock(&self.state).progress.clone()
    }

    pub fn is_polling(&self) -> bool {
        lock(&self.state).is_polling
    }

    pub fn start_polling(&mut self, assessment_id: impl Into<String>) {
        self.cancel_polling();

        let assessment_id = assessment_id.into();
        *lock(&self.state) = AggregateSnapshot {
            assessment_id: Some(assessment_id.clone()),
            is_polling: true,
            ..Default::default()
        };

        info!(
            assessment_id = %assessment_id,
            interval_ms = self.config.interval.as_millis() as u64,
            "Starting aggregate scoring poll"
        );

        let mut episode = Episode::new();
        let task = AggregateTask {
            api: Arc::clone(&self.api),
            assessment_id,
            period: self.config.interval.max(MIN_INTERVAL),
            state: Arc::clone(&self.state),
            events: self.events.clone(),
            token: episode.token(),
            guard: episode.guard(),
        };
        episode.attach(tokio::spawn(task.run()));
        self.episode = Some(episode);
    }

    pub fn cancel_polling(&mut self) {
        let mut state = lock(&self.state);
        if let Some(episode) = self.episode.take() {
            episode.cancel();
            debug!(
                assessment_id = ?state.assessment_id,
                finished = episode.is_finished(),
                "Cancelled aggregate scoring poll"
            );
        }
        state.is_polling = false;
    }
}

impl Drop for AggregateJobPoller {
    fn drop(&mut self) {
        self.cancel_polling();
    }
}

struct AggregateTask {
    api: Arc<dyn AssessmentApi>,
    assessment_id: String,
    period: Duration,
    state: Arc<Mutex<AggregateSnapshot>>,
    events: broadcast::Sender<AggregateEvent>,
    token: CancellationToken,
    guard: Arc<CompletionGuard>,
}

impl AggregateTask {
    async fn run(self) {
        let response = self.api.aggregate_scoring_status(&self.assessment_id).await;
        if self.apply(response) {
            return;
        }

        let mut ticker = tokio::time::interval_at(Instant::now() + self.period, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.token.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let response = self.api.aggregate_scoring_status(&self.assessment_id).await;
            if self.apply(response) {
                return;
            }
        }
    }

    /// Apply one check. Returns `true` once the episode is over.
    fn apply(&self, response: ApiResult<AggregateStatus>) -> bool {
        let mut state = lock(&self.state);
        if self.token.is_cancelled() {
            debug!(assessment_id = %self.assessment_id, "Discarding aggregate status after cancellation");
            return true;
        }
        state.checks += 1;

        let status = match response {
            Ok(status) => status,
            Err(e) => {
                state.consecutive_errors += 1;
                warn!(
                    assessment_id = %self.assessment_id,
                    consecutive_errors = state.consecutive_errors,
                    error = %e,
                    "Aggregate status request failed, will retry"
                );
                return false;
            }
        };

        state.consecutive_errors = 0;
        let progress = AggregateProgress::from(&status);
        state.progress = Some(progress.clone());

        match status.outcome() {
            AggregateOutcome::Failed(message) => {
                state.is_polling = false;
                state.error = Some(message.clone());
                if self.guard.try_complete() {
                    warn!(assessment_id = %self.assessment_id, error = %message, "Aggregate scoring failed");
                    let _ = self.events.send(AggregateEvent::Progress(progress));
                    let _ = self.events
                        .send(AggregateEvent::Failed(PollError::AggregateFailed(message)));
                }
                true
            }
            AggregateOutcome::Completed => {
                state.is_polling = false;
                state.completed = true;
                if self.guard.try_complete() {
                    info!(
                        assessment_id = %self.assessment_id,
                        total = status.total_jobs,
                        "All responses scored"
                    );
                    let _ = self.events.send(AggregateEvent::Progress(progress));
                    let _ = self.events.send(AggregateEvent::Completed);
                }
                true
            }
            AggregateOutcome::InProgress => {
                trace!(
                    assessment_id = %self.assessment_id,
                    completed = status.completed_count,
                    total = status.total_jobs,
                    "Scoring in progress"
                );
                let _ = self.events.send(AggregateEvent::Progress(progress));
                false
            }
        }
    }
}

//! Fire-and-forget final feedback request, issued at most once unless it fails.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::FlowEvent;
use crate::api::AssessmentApi;

const IDLE: u8 = 0;
const IN_FLIGHT: u8 = 1;
const DONE: u8 = 2;
const FAILED: u8 = 3;

#[derive(Debug, Default)]
pub(super) struct FeedbackRequest {
    state: AtomicU8,
}

impl FeedbackRequest {
    pub(super) fn new() -> Self {
        Self::default()
    }

    /// Claim the request if it was never sent or the last attempt failed.
    fn begin(&self) -> bool {
        [IDLE, FAILED].into_iter().any(|from| {
            self.state
                .compare_exchange(from, IN_FLIGHT, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        })
    }

    fn finish(&self, ok: bool) {
        self.state
            .store(if ok { DONE } else { FAILED }, Ordering::Release);
    }

    pub(super) fn has_failed(&self) -> bool {
        self.state.load(Ordering::Acquire) == FAILED
    }

    pub(super) fn is_done(&self) -> bool {
        self.state.load(Ordering::Acquire) == DONE
    }

    /// Spawn the request unless one is in flight or has succeeded.
    pub(super) fn send(
        tracker: &Arc<Self>,
        api: Arc<dyn AssessmentApi>,
        assessment_id: String,
        events: broadcast::Sender<FlowEvent>,
    ) {
        if !tracker.begin() {
            return;
        }

        let tracker = Arc::clone(tracker);
        tokio::spawn(async move {
            match api.generate_final_feedback(&assessment_id).await {
                Ok(()) => {
                    tracker.finish(true);
                    debug!(assessment_id = %assessment_id, "Final feedback requested");
                }
                Err(e) => {
                    tracker.finish(false);
                    warn!(assessment_id = %assessment_id, error = %e, "Final feedback request failed");
                    let _ = events.send(FlowEvent::FeedbackRequestFailed(e.to_string()));
                }
            }
        });
    }
}

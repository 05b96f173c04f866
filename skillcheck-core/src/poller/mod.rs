//! Client-side pollers for server-executed jobs.
//!
//! Every poller owns its episode: the state it exposes, a cancellation
//! token, a one-shot [`CompletionGuard`] and the spawned task(s). Terminal
//! events are published at most once per episode, and only while the state
//! lock is held with the token still live, so `cancel_polling` (which cancels
//! under the same lock) strictly orders against them.
//!
//! Pollers spawn onto the current tokio runtime; `start_polling` must be
//! called from within one.

mod aggregate;
mod bounded;
mod job;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use aggregate::{AggregateEvent, AggregateJobPoller, AggregateSnapshot};
pub use bounded::{BoundedWaitCompletion, BoundedWaitPoller, BoundedWaitSnapshot, CompletionReason};
pub use job::{JobPollEvent, JobPollSnapshot, JobStatusPoller};

/// Capacity of each poller's event channel.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Shortest interval a repeating timer accepts.
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// One-shot flag deciding which of several racing paths completes an episode.
#[derive(Debug, Default)]
pub struct CompletionGuard {
    fired: AtomicBool,
}

impl CompletionGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim completion. Returns `true` for exactly one caller.
    pub fn try_complete(&self) -> bool {
        !self.fired.swap(true, Ordering::AcqRel)
    }

    pub fn is_completed(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}

/// Timers and tasks belonging to one `start_polling` call.
struct Episode {
    token: CancellationToken,
    guard: Arc<CompletionGuard>,
    tasks: Vec<JoinHandle<()>>,
}

impl Episode {
    fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            guard: Arc::new(CompletionGuard::new()),
            tasks: Vec::new(),
        }
    }

    fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    fn guard(&self) -> Arc<CompletionGuard> {
        Arc::clone(&self.guard)
    }

    fn attach(&mut self, task: JoinHandle<()>) {
        self.tasks.push(task);
    }

    /// Stop the episode's timers. In-flight requests run to completion and
    /// their responses are discarded by the task.
    fn cancel(&self) {
        self.token.cancel();
    }

    fn is_finished(&self) -> bool {
        self.tasks.iter().all(JoinHandle::is_finished)
    }
}

impl Drop for Episode {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn completion_guard_fires_once() {
        let guard = CompletionGuard::new();
        assert!(!guard.is_completed());
        assert!(guard.try_complete());
        assert!(!guard.try_complete());
        assert!(guard.is_completed());
    }

    #[test]
    fn completion_guard_admits_one_of_many_threads() {
        let guard = Arc::new(CompletionGuard::new());
        let winners = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let guard = Arc::clone(&guard);
                let winners = Arc::clone(&winners);
                std::thread::spawn(move || {
                    if guard.try_complete() {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(winners.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dropping_episode_cancels_token() {
        let episode = Episode::new();
        let token = episode.token();
        drop(episode);
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn episode_reports_finished_tasks() {
        let mut episode = Episode::new();
        assert!(episode.is_finished());

        let token = episode.token();
        episode.attach(tokio::spawn(async move { token.cancelled().await }));
        assert!(!episode.is_finished());

        episode.cancel();
        for _ in 0..10 {
            if episode.is_finished() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(episode.is_finished());
    }
}

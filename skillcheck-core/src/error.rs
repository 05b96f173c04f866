//! Error types for skillcheck-core

use thiserror::Error;

/// Failure of a single request to the assessment backend.
///
/// Inside the pollers these are always transient: they are counted and the
/// existing schedule continues.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("request timed out")]
    Timeout,

    #[error("server returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("invalid response: {0}")]
    Decode(String),
}

/// Terminal outcome of a polling episode.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PollError {
    /// The server reported the job as failed.
    #[error("{message}")]
    JobFailed { message: String, retryable: bool },

    /// At least one job behind an aggregate status failed.
    #[error("{0}")]
    AggregateFailed(String),

    /// The client-side attempt cap was reached before a terminal status.
    #[error("{message}")]
    ClientTimeout { message: String, attempts: u32 },
}

impl PollError {
    /// Whether restarting the same episode can be expected to help.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::JobFailed { retryable, .. } => *retryable,
            Self::AggregateFailed(_) => true,
            Self::ClientTimeout { .. } => true,
        }
    }
}

/// A poller was asked to do something its current state does not allow.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerStateError {
    #[error("poller is already polling")]
    AlreadyPolling,

    #[error("poller has never been started")]
    NotStarted,
}

/// Errors surfaced by the session flow controller.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FlowError {
    #[error("failed to submit answer: {0}")]
    Submit(#[source] ApiError),

    #[error("scoring failed: {0}")]
    ScoringFailed(#[source] PollError),

    #[error("failed to request scoring retry: {0}")]
    RetryScoring(#[source] ApiError),

    #[error("failed to fetch results: {0}")]
    Results(#[source] ApiError),

    #[error("results are still being generated")]
    ResultsNotReady,

    #[error("server did not return a next question")]
    MissingQuestion,

    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    #[error("session flow was cancelled")]
    Cancelled,

    #[error(transparent)]
    Poll(#[from] PollError),
}

/// Errors from loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

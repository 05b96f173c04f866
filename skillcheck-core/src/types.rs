//! Value types exchanged with the assessment backend.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Message used when a job fails without saying why.
pub const GENERIC_JOB_FAILURE: &str = "Generation failed. Please try again.";

/// Message used when aggregate scoring fails without a job error.
pub const GENERIC_SCORING_FAILURE: &str =
    "One or more responses could not be scored. Please try again.";

/// Lifecycle state of a server-side job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    #[default]
    Pending,
    Running,
    /// A follow-up stage is running after the primary one finished.
    #[serde(alias = "runningSecondary")]
    RunningSecondary,
    Completed,
    Failed,
    /// A state this client does not know yet. Treated as still running.
    #[serde(other)]
    Unknown,
}

impl JobState {
    /// Whether the job will not change state again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::RunningSecondary => write!(f, "running_secondary"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Status of a single generation or scoring job.
///
/// `status` is authoritative. `completed` and `failed` mirror it and are
/// re-derived by [`JobStatus::normalized`] before a status is acted upon.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    pub job_id: String,
    pub status: JobState,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub attempt_count: u32,
    #[serde(default)]
    pub max_attempts: u32,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub failed: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub retryable: bool,
}

impl JobStatus {
    /// A status in the given state with consistent mirror flags.
    pub fn new(job_id: impl Into<String>, status: JobState) -> Self {
        Self {
            job_id: job_id.into(),
            status,
            ..Default::default()
        }
        .normalized()
    }

    /// A completed status.
    pub fn completed(job_id: impl Into<String>) -> Self {
        Self::new(job_id, JobState::Completed)
    }

    /// A failed status carrying an error message.
    pub fn failed(job_id: impl Into<String>, error: impl Into<String>, retryable: bool) -> Self {
        Self {
            error: Some(error.into()),
            retryable,
            ..Self::new(job_id, JobState::Failed)
        }
    }

    /// Set the human-readable progress message.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Re-derive the mirror flags from `status`.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.completed = self.status == JobState::Completed;
        self.failed = self.status == JobState::Failed;
        self
    }

    pub fn is_completed(&self) -> bool {
        self.status == JobState::Completed
    }

    pub fn is_failed(&self) -> bool {
        self.status == JobState::Failed
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// The most specific failure message available.
    pub fn failure_message(&self) -> String {
        self.error
            .as_deref()
            .filter(|e| !e.trim().is_empty())
            .or(Some(self.message.as_str()).filter(|m| !m.trim().is_empty()))
            .unwrap_or(GENERIC_JOB_FAILURE)
            .to_string()
    }
}

/// Rollup over every scoring job belonging to one assessment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateStatus {
    #[serde(default)]
    pub completed_count: u32,
    #[serde(default)]
    pub total_jobs: u32,
    #[serde(default)]
    pub all_completed: bool,
    #[serde(default)]
    pub has_failed: bool,
    #[serde(default)]
    pub failed_job_error: Option<String>,
    #[serde(default)]
    pub message: String,
}

/// What an [`AggregateStatus`] means for the poller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AggregateOutcome {
    InProgress,
    Completed,
    Failed(String),
}

impl AggregateStatus {
    /// An in-progress rollup.
    pub fn in_progress(completed_count: u32, total_jobs: u32) -> Self {
        Self {
            completed_count,
            total_jobs,
            ..Default::default()
        }
    }

    /// A rollup where every job completed.
    pub fn all_completed(total_jobs: u32) -> Self {
        Self {
            completed_count: total_jobs,
            total_jobs,
            all_completed: true,
            ..Default::default()
        }
    }

    /// A rollup where a job failed.
    pub fn failed(completed_count: u32, total_jobs: u32, error: Option<&str>) -> Self {
        Self {
            completed_count,
            total_jobs,
            has_failed: true,
            failed_job_error: error.map(str::to_string),
            ..Default::default()
        }
    }

    /// Classify the rollup. A failure wins over `all_completed`.
    pub fn outcome(&self) -> AggregateOutcome {
        if self.has_failed {
            let message = self
                .failed_job_error
                .as_deref()
                .filter(|e| !e.trim().is_empty())
                .unwrap_or(GENERIC_SCORING_FAILURE);
            return AggregateOutcome::Failed(message.to_string());
        }
        if self.all_completed {
            AggregateOutcome::Completed
        } else {
            AggregateOutcome::InProgress
        }
    }
}

/// Live progress of an aggregate poll, suitable for a progress bar.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateProgress {
    pub completed: u32,
    pub total: u32,
    pub message: String,
}

impl From<&AggregateStatus> for AggregateProgress {
    fn from(status: &AggregateStatus) -> Self {
        let message = if status.message.trim().is_empty() {
            format!(
                "{} of {} responses scored",
                status.completed_count, status.total_jobs
            )
        } else {
            status.message.clone()
        };
        Self {
            completed: status.completed_count,
            total: status.total_jobs,
            message,
        }
    }
}

/// Progress through one assessment session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionProgress {
    #[serde(default)]
    pub current_question: u32,
    #[serde(default)]
    pub total_questions: u32,
    #[serde(default)]
    pub completed_responses: u32,
    #[serde(default)]
    pub percentage: u32,
    #[serde(default)]
    pub is_complete: bool,
}

impl SessionProgress {
    /// Build progress, clamping `completed_responses` to `total_questions`
    /// and deriving `percentage`.
    pub fn new(current_question: u32, total_questions: u32, completed_responses: u32) -> Self {
        Self {
            current_question,
            total_questions,
            completed_responses,
            percentage: 0,
            is_complete: false,
        }
        .normalized()
    }

    /// Re-establish the invariants on a value received from the server.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.completed_responses = self.completed_responses.min(self.total_questions);
        self.percentage = percentage(self.completed_responses, self.total_questions);
        self
    }

    /// Record one more answered question.
    #[must_use]
    pub fn advanced(self) -> Self {
        let completed = self.completed_responses.saturating_add(1);
        let current = if completed < self.total_questions {
            self.current_question.saturating_add(1)
        } else {
            self.current_question
        };
        Self {
            current_question: current,
            completed_responses: completed,
            ..self
        }
        .normalized()
    }

    /// Mark the session as fully answered.
    #[must_use]
    pub fn completed(self) -> Self {
        Self {
            is_complete: true,
            ..self
        }
    }
}

fn percentage(completed: u32, total: u32) -> u32 {
    let total = f64::from(total.max(1));
    (100.0 * f64::from(completed) / total).round() as u32
}

/// A question presented to the user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Question {
    pub id: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skill: Option<String>,
}

impl Question {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            skill: None,
        }
    }
}

/// Initial state a session flow is seeded with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStart {
    pub session_id: String,
    pub question: Question,
    #[serde(default)]
    pub progress: SessionProgress,
}

/// Response to submitting an answer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitAnswerResponse {
    pub session_id: String,
    #[serde(default)]
    pub assessment_id: Option<String>,
    #[serde(default)]
    pub is_complete: bool,
    #[serde(default)]
    pub question: Option<Question>,
    #[serde(default)]
    pub progress: Option<SessionProgress>,
    #[serde(default)]
    pub scoring_job_id: Option<String>,
}

impl SubmitAnswerResponse {
    /// The response for an intermediate answer.
    pub fn next(session_id: impl Into<String>, question: Question) -> Self {
        Self {
            session_id: session_id.into(),
            question: Some(question),
            ..Default::default()
        }
    }

    /// The response for the last answer of the assessment.
    pub fn complete(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            is_complete: true,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_scoring_job(mut self, job_id: impl Into<String>) -> Self {
        self.scoring_job_id = Some(job_id.into());
        self
    }

    #[must_use]
    pub fn with_progress(mut self, progress: SessionProgress) -> Self {
        self.progress = Some(progress);
        self
    }

    /// The id the scoring rollup and results are keyed on.
    pub fn assessment_id(&self) -> &str {
        self.assessment_id.as_deref().unwrap_or(&self.session_id)
    }
}

/// Whether final results are available yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultsStatus {
    Ready,
    Processing,
}

/// Final results of an assessment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssessmentResults {
    #[serde(default)]
    pub status: Option<ResultsStatus>,
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(default)]
    pub final_score: Option<f64>,
    #[serde(default)]
    pub feedback: Option<String>,
    #[serde(default)]
    pub strengths: Vec<String>,
    #[serde(default)]
    pub improvements: Vec<String>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl AssessmentResults {
    /// Results that are ready with the given score.
    pub fn ready(final_score: f64) -> Self {
        Self {
            status: Some(ResultsStatus::Ready),
            final_score: Some(final_score),
            ..Default::default()
        }
    }

    /// Results still being produced by the given job.
    pub fn processing(job_id: impl Into<String>) -> Self {
        Self {
            status: Some(ResultsStatus::Processing),
            job_id: Some(job_id.into()),
            ..Default::default()
        }
    }

    /// Whether the backend is still producing the results.
    pub fn is_generating(&self) -> bool {
        match self.status {
            Some(ResultsStatus::Processing) => true,
            Some(ResultsStatus::Ready) => false,
            None => self.job_id.is_some(),
        }
    }
}

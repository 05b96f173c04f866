use std::fmt;

use crate::types::{AggregateProgress, AssessmentResults, Question, SessionProgress};

/// Where a session is in the answer/score/results lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowState {
    AwaitingAnswer,
    Submitting,
    /// The next question is held back while the previous answer is scored.
    AwaitingNextQuestion,
    /// The final answer was accepted and every response is being scored.
    AwaitingAllScoring,
    ResultsPending,
    ResultsReady,
}

impl fmt::Display for FlowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::AwaitingAnswer => "awaiting_answer",
            Self::Submitting => "submitting",
            Self::AwaitingNextQuestion => "awaiting_next_question",
            Self::AwaitingAllScoring => "awaiting_all_scoring",
            Self::ResultsPending => "results_pending",
            Self::ResultsReady => "results_ready",
        };
        f.write_str(name)
    }
}

/// Published on [`SessionFlowController::subscribe`](super::SessionFlowController::subscribe).
#[derive(Debug, Clone, PartialEq)]
pub enum FlowEvent {
    StateChanged { from: FlowState, to: FlowState },
    ProgressUpdated(SessionProgress),
    QuestionRevealed(Question),
    SubmitFailed(String),
    /// The last answer was accepted; scoring of all responses has begun.
    AnswersComplete { assessment_id: String },
    ScoringProgress(AggregateProgress),
    ScoringFailed(String),
    /// Results are being generated by the given job.
    ResultsGenerating { job_id: String },
    ResultsReady(AssessmentResults),
    FeedbackRequestFailed(String),
}

/// What a successful [`submit_answer`](super::SessionFlowController::submit_answer) led to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    NextQuestion(Question),
    /// Every response is scored and results can be fetched.
    AssessmentComplete,
}

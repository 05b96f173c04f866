//! skillcheck-core: Job polling and session flow for the skillcheck client
//!
//! This crate provides the client-side orchestration around server-executed
//! scoring and generation jobs:
//!
//! - **Job polling** - [`JobStatusPoller`] polls one job with exponential backoff
//! - **Bounded waits** - [`BoundedWaitPoller`] races a deadline against job completion
//! - **Aggregate polling** - [`AggregateJobPoller`] waits for every scoring job of an assessment
//! - **Session flow** - [`SessionFlowController`] drives answers, scoring and results
//! - **Backend seam** - [`AssessmentApi`] with the scripted [`MockAssessmentApi`]
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use skillcheck_core::{
//!     AssessmentApi, FlowConfig, MockAssessmentApi, Question, SessionFlowController,
//!     SessionProgress, SessionStart, SubmitOutcome,
//! };
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let api: Arc<dyn AssessmentApi> = Arc::new(MockAssessmentApi::new());
//!     let start = SessionStart {
//!         session_id: "session-1".to_string(),
//!         question: Question::new("q1", "What does the borrow checker enforce?"),
//!         progress: SessionProgress::new(1, 3, 0),
//!     };
//!
//!     let mut flow = SessionFlowController::new(api, FlowConfig::default(), start);
//!     match flow.submit_answer("Aliasing XOR mutation").await? {
//!         SubmitOutcome::NextQuestion(question) => println!("Next: {}", question.text),
//!         SubmitOutcome::AssessmentComplete => {
//!             let results = flow.fetch_results().await?;
//!             println!("Score: {:?}", results.final_score);
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                SessionFlowController                 │
//! │  ┌──────────────┐ ┌──────────────┐ ┌──────────────┐ │
//! │  │ JobStatus    │ │ BoundedWait  │ │ AggregateJob │ │
//! │  │ Poller       │ │ Poller       │ │ Poller       │ │
//! │  └──────────────┘ └──────────────┘ └──────────────┘ │
//! └─────────────────────────────────────────────────────┘
//!                          │
//!                          ▼
//! ┌─────────────────────────────────────────────────────┐
//! │                   AssessmentApi                      │
//! │        (skillcheck-http or MockAssessmentApi)        │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod config;
pub mod error;
pub mod flow;
pub mod poller;
pub mod types;

// Re-export key types for convenience
pub use api::{ApiResult, AssessmentApi, MockAssessmentApi, MockCalls};
pub use config::{AggregateConfig, BoundedWaitConfig, FlowConfig, PollingConfig};
pub use error::{ApiError, ConfigError, FlowError, PollError, PollerStateError};
pub use flow::{FlowEvent, FlowState, SessionFlowController, SubmitOutcome};
pub use poller::{
    AggregateEvent, AggregateJobPoller, AggregateSnapshot, BoundedWaitCompletion,
    BoundedWaitPoller, BoundedWaitSnapshot, CompletionGuard, CompletionReason, JobPollEvent,
    JobPollSnapshot, JobStatusPoller,
};
pub use types::{
    AggregateOutcome, AggregateProgress, AggregateStatus, AssessmentResults, JobState, JobStatus,
    Question, ResultsStatus, SessionProgress, SessionStart, SubmitAnswerResponse,
};

//! Session flow: submitting answers, waiting on scoring and fetching results.
//!
//! ```text
//! AwaitingAnswer -> Submitting -> AwaitingNextQuestion -> AwaitingAnswer
//!                             \-> AwaitingAllScoring -> ResultsPending -> ResultsReady
//! ```

mod controller;
mod feedback;
mod state;

pub use controller::SessionFlowController;
pub use state::{FlowEvent, FlowState, SubmitOutcome};

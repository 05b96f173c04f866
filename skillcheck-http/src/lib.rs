//! REST implementation of [`skillcheck_core::AssessmentApi`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use skillcheck_core::{AssessmentApi, JobStatusPoller};
//! use skillcheck_http::{HttpAssessmentApi, HttpConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = HttpConfig::new("https://skillcheck.example.com/api/")
//!     .with_request_timeout(Duration::from_secs(10))
//!     .with_bearer_token("token");
//! let api: Arc<dyn AssessmentApi> = Arc::new(HttpAssessmentApi::new(config)?);
//!
//! let mut poller = JobStatusPoller::new(api);
//! let mut events = poller.subscribe();
//! poller.start_polling("job-1", None);
//! let _event = events.recv().await?;
//! # Ok(())
//! # }
//! ```

mod client;
mod config;
mod error;

pub use client::HttpAssessmentApi;
pub use config::HttpConfig;
pub use error::ClientError;

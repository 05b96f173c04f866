//! Logging setup for skillcheck clients.
//!
//! The core crates only emit `tracing` events; binaries and screens call
//! [`init_logging`] once at startup to decide where they go.

mod logging;

pub use logging::{LogConfig, LogFormat, LogInitError, env_filter, init_logging};

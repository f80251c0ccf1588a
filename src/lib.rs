//! Resilient streaming-and-tool-approval session manager.
//!
//! Opens a long-lived server-pushed event stream for one chat turn, keeps it
//! interpretable across network failures (circuit breaker + bounded retries),
//! and coordinates human-in-the-loop approval for tool calls the model
//! requests mid-stream.

pub mod api;
pub mod approval;
pub mod config;
pub mod error;
pub mod monitor;
pub mod resilience;
pub mod session;
pub mod types;
pub mod util;

pub use config::Config;
pub use error::Error;
pub use session::{SessionHandle, SessionManager, SessionUpdate};

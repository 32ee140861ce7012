//! Error taxonomy, retry policy, and configuration for MCP Browser.

pub mod config;
pub mod error;
pub mod retry;

pub use error::{BrowserError, ErrorKind, Result};
pub use retry::RetryPolicy;

//! Rate limiter error types

use thiserror::Error;

/// Errors from the shared bucket store
#[derive(Error, Debug)]
pub enum RateLimitError {
    #[error("Store connection failed: {0}")]
    Connection(String),

    #[error("Store operation failed: {0}")]
    Backend(String),
}

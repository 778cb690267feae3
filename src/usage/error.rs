//! Usage pipeline error types

use thiserror::Error;

/// Errors inside the usage pipeline
#[derive(Error, Debug)]
pub enum UsageError {
    #[error("Spool IO failed: {0}")]
    Spool(#[from] std::io::Error),

    #[error("Publish failed: {0}")]
    Publish(String),
}

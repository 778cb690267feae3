//! Routing error types

use thiserror::Error;

/// Errors from backend selection
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoutingError {
    /// Neither an exact-org nor a wildcard policy exists
    #[error("No routing policy for org '{org}' and model '{model}'")]
    PolicyMissing { org: String, model: String },

    /// The policy's allow/deny lists exclude this key
    #[error("Key '{key_id}' is not permitted to route model '{model}'")]
    Forbidden { key_id: String, model: String },

    /// Every weighted backend is unavailable
    #[error("No backend available for model '{model}'")]
    NoBackendAvailable { model: String },
}

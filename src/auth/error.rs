//! Authentication error types

use thiserror::Error;

/// Typed outcomes of credential validation.
///
/// `Clone` because denials are cached for a short TTL.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Credential not recognized")]
    KeyMissing,

    #[error("Credential is invalid")]
    KeyInvalid,

    #[error("Credential has been revoked")]
    KeyRevoked,

    #[error("Credential has expired")]
    KeyExpired,

    #[error("Credential authority unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Request signature mismatch")]
    SignatureInvalid,
}

impl AuthError {
    /// Whether this denial is a definitive verdict on the credential
    /// (cacheable), as opposed to a transient authority failure.
    pub fn is_definitive(&self) -> bool {
        !matches!(self, AuthError::ServiceUnavailable(_))
    }
}

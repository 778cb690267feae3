//! Request-signature verification.
//!
//! Callers with an issued signing key send `X-Gantry-Signature`: the hex
//! HMAC-SHA256 of the exact request body. The orchestrator buffers the body
//! before this stage so verification and forwarding see the same bytes.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use super::error::AuthError;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the body signature
pub const SIGNATURE_HEADER: &str = "x-gantry-signature";

/// Verify a hex HMAC-SHA256 signature over the buffered body.
///
/// Comparison is constant-time via the MAC verification itself.
pub fn verify_signature(signing_key: &str, body: &[u8], provided_hex: &str) -> Result<(), AuthError> {
    let provided = hex::decode(provided_hex).map_err(|_| AuthError::SignatureInvalid)?;

    let mut mac = HmacSha256::new_from_slice(signing_key.as_bytes())
        .map_err(|_| AuthError::SignatureInvalid)?;
    mac.update(body);
    mac.verify_slice(&provided)
        .map_err(|_| AuthError::SignatureInvalid)
}

/// Produce the hex signature for a body (used by tests and client tooling).
pub fn sign(signing_key: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(signing_key.as_bytes())
        .expect("HMAC accepts any key length");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

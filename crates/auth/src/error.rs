//! Auth errors

use thiserror::Error;

/// Errors raised by token handling and authorization.
#[derive(Debug, Error)]
pub enum AuthError {
    /// No bearer credential was presented
    #[error("missing bearer token")]
    MissingToken,

    /// Token failed signature, audience, issuer or time validation
    #[error("invalid token: {0}")]
    InvalidToken(String),

    /// Token is valid but the referenced object is gone or replaced
    #[error("token subject mismatch: {0}")]
    SubjectMismatch(String),

    /// Signing failed
    #[error("unable to sign token: {0}")]
    Signing(String),

    /// Key material could not be loaded
    #[error("invalid key material: {0}")]
    Key(String),

    /// CEL expression failed to compile or evaluate
    #[error("expression error: {0}")]
    Expression(String),
}

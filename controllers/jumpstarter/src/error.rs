//! Controller-specific error types.

use auth::AuthError;
use protocol::ProtocolError;
use store::StoreError;
use thiserror::Error;

/// Errors that can occur in the Jumpstarter controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Resource store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Token or authorization error
    #[error("auth error: {0}")]
    Auth(#[from] AuthError),

    /// Wire protocol error
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Resource watch failed
    #[error("resource watch failed: {0}")]
    Watch(String),

    /// Listener or connection I/O failed
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

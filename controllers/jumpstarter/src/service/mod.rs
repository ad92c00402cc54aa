//! RPC surface of the controller
//!
//! - `connection`: framed TCP listener and per-connection dispatch
//! - `controller`: controller service handlers (register, listen, dial,
//!   lease CRUD)
//! - `client_v1`: resource-style client service handlers
//! - `router`: the stream splice service
//! - `oidc`: discovery and JWKS endpoints
//! - `listen`: per-lease dial queues
//! - `auth`: bearer resolution to Client/Exporter objects

pub mod auth;
pub mod client_v1;
pub mod connection;
pub mod controller;
pub mod convert;
pub mod listen;
pub mod oidc;
pub mod router;

#[cfg(test)]
mod controller_test;
#[cfg(test)]
mod router_test;

use protocol::messages::Status;
use protocol::Code;
use store::StoreError;

/// RPC failure carrying a wire status code and a one-line reason.
#[derive(Debug)]
pub struct RpcError {
    pub code: Code,
    pub message: String,
}

pub type RpcResult<T> = Result<T, RpcError>;

impl RpcError {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn unauthenticated(message: impl Into<String>) -> Self {
        Self::new(Code::Unauthenticated, message)
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(Code::PermissionDenied, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(Code::NotFound, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(Code::InvalidArgument, message)
    }

    pub fn failed_precondition(message: impl Into<String>) -> Self {
        Self::new(Code::FailedPrecondition, message)
    }

    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Self::new(Code::ResourceExhausted, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(Code::Unavailable, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Code::Internal, message)
    }

    pub fn to_status(&self) -> Status {
        Status::new(self.code, self.message.clone())
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code.as_str(), self.message)
    }
}

impl From<StoreError> for RpcError {
    fn from(err: StoreError) -> Self {
        match &err {
            StoreError::NotFound { .. } => Self::not_found(err.to_string()),
            StoreError::AlreadyExists { .. } => Self::new(Code::AlreadyExists, err.to_string()),
            StoreError::Conflict { .. } => Self::new(Code::Aborted, err.to_string()),
            StoreError::Kube(_) | StoreError::Watch(_) => Self::unavailable(err.to_string()),
            StoreError::Invalid(_) => Self::invalid_argument(err.to_string()),
        }
    }
}

impl From<auth::AuthFailure> for RpcError {
    fn from(err: auth::AuthFailure) -> Self {
        err.into_rpc()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_mapping() {
        let err: RpcError = StoreError::NotFound {
            kind: "Lease",
            name: "lease1".to_string(),
        }
        .into();
        assert_eq!(err.code, Code::NotFound);

        let err: RpcError = StoreError::Conflict {
            kind: "Lease",
            name: "lease1".to_string(),
        }
        .into();
        assert_eq!(err.code, Code::Aborted);
    }

    #[test]
    fn test_status_carries_code_and_reason() {
        let status = RpcError::permission_denied("lease not held by caller").to_status();
        assert_eq!(status.code, Code::PermissionDenied as i32);
        assert_eq!(status.message, "lease not held by caller");
    }
}

//! Object authorizers
//!
//! Decide whether a resolved principal *is* a given Client or Exporter. Two
//! modes: the built-in assertion matching the object's computed subject, and
//! a CEL expression evaluated over `{self, user, kind, prefix}` compiled
//! once per configuration load.

use cel_interpreter::{Context, Program, Value};

use crate::error::AuthError;
use crate::principal::UserInfo;

/// Everything an authorizer may look at for one decision.
pub struct AuthorizeRequest<'a> {
    /// The target object serialized to JSON, bound as `self`
    pub self_object: serde_json::Value,
    /// The object's computed username assertion
    pub computed_subject: String,
    /// The resolved caller
    pub user: &'a UserInfo,
    /// `"Client"` or `"Exporter"`
    pub kind: &'a str,
    /// Internal authentication prefix
    pub prefix: &'a str,
}

/// Configured authorization mode.
pub enum ObjectAuthorizer {
    /// Username equality against the computed subject
    Basic,
    /// Declarative boolean expression
    Cel(CelAuthorizer),
}

impl ObjectAuthorizer {
    pub fn authorize(&self, request: &AuthorizeRequest<'_>) -> Result<bool, AuthError> {
        match self {
            Self::Basic => Ok(request.user.username == request.computed_subject),
            Self::Cel(cel) => cel.authorize(request),
        }
    }
}

/// CEL-based authorizer with the expression compiled up front.
pub struct CelAuthorizer {
    program: Program,
}

impl CelAuthorizer {
    /// Compile the expression; invalid expressions are rejected at config
    /// load, not per request.
    pub fn new(expression: &str) -> Result<Self, AuthError> {
        let program =
            Program::compile(expression).map_err(|e| AuthError::Expression(e.to_string()))?;
        Ok(Self { program })
    }

    pub fn authorize(&self, request: &AuthorizeRequest<'_>) -> Result<bool, AuthError> {
        let mut context = Context::default();
        context
            .add_variable("self", &request.self_object)
            .map_err(|e| AuthError::Expression(e.to_string()))?;
        context
            .add_variable("user", request.user)
            .map_err(|e| AuthError::Expression(e.to_string()))?;
        context
            .add_variable("kind", request.kind)
            .map_err(|e| AuthError::Expression(e.to_string()))?;
        context
            .add_variable("prefix", request.prefix)
            .map_err(|e| AuthError::Expression(e.to_string()))?;

        match self
            .program
            .execute(&context)
            .map_err(|e| AuthError::Expression(e.to_string()))?
        {
            Value::Bool(allowed) => Ok(allowed),
            other => Err(AuthError::Expression(format!(
                "expression must evaluate to bool, got {other:?}"
            ))),
        }
    }
}

//! Resolved principals
//!
//! The authenticator turns a bearer credential into a [`Principal`]; RPC
//! handlers then resolve the principal to a concrete Client or Exporter via
//! the configured authorizer.

use std::collections::BTreeMap;

use serde::Serialize;

/// Identity attributes extracted from a verified credential.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct UserInfo {
    pub username: String,
    pub uid: String,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub extra: BTreeMap<String, Vec<String>>,
}

impl UserInfo {
    pub fn new(username: impl Into<String>, uid: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            uid: uid.into(),
            groups: Vec::new(),
            extra: BTreeMap::new(),
        }
    }
}

/// Object binding carried inside controller-audience tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRef {
    pub kind: String,
    pub namespace: String,
    pub name: String,
    pub uid: String,
}

/// A verified caller: always a user, optionally bound to a stored object.
#[derive(Debug, Clone)]
pub struct Principal {
    pub user: UserInfo,
    /// Present for internal controller-audience tokens
    pub object: Option<ObjectRef>,
}

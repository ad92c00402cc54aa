//! Object references between Jumpstarter resources
//!
//! Follows the Kubernetes `LocalObjectReference` pattern: references are
//! always within the same namespace, so only the name is carried.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Reference to an object in the same namespace.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LocalObjectReference {
    /// Name of the referenced resource
    pub name: String,
}

impl LocalObjectReference {
    /// Create a reference to the named object.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

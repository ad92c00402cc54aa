//! Client CRD
//!
//! A named principal that may request leases in a namespace.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::conditions::Condition;
use crate::references::LocalObjectReference;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "jumpstarter.dev",
    version = "v1alpha1",
    kind = "Client",
    namespaced,
    status = "ClientStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ClientSpec {
    /// Overrides the computed username assertion; must be unique across
    /// clients sharing an authenticator prefix
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClientStatus {
    /// Secret holding the controller-audience credential token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<LocalObjectReference>,

    /// Controller endpoint advertised to this client
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub endpoint: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl Client {
    /// The username this client authenticates as: the explicit override if
    /// set, otherwise `prefix + "client:" + namespace + ":" + name + ":" + uid`.
    pub fn internal_subject(&self, prefix: &str) -> String {
        match &self.spec.username {
            Some(username) => username.clone(),
            None => format!(
                "{prefix}client:{}:{}:{}",
                self.metadata.namespace.as_deref().unwrap_or_default(),
                self.metadata.name.as_deref().unwrap_or_default(),
                self.metadata.uid.as_deref().unwrap_or_default(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn test_client(username: Option<&str>) -> Client {
        Client {
            metadata: ObjectMeta {
                name: Some("test-client".to_string()),
                namespace: Some("default".to_string()),
                uid: Some("0000-1111".to_string()),
                ..Default::default()
            },
            spec: ClientSpec {
                username: username.map(|u| u.to_string()),
            },
            status: None,
        }
    }

    #[test]
    fn test_computed_subject() {
        let client = test_client(None);
        assert_eq!(
            client.internal_subject("jumpstarter:"),
            "jumpstarter:client:default:test-client:0000-1111"
        );
    }

    #[test]
    fn test_username_override_wins() {
        let client = test_client(Some("alice@example.com"));
        assert_eq!(client.internal_subject("jumpstarter:"), "alice@example.com");
    }
}

//! Exporter CRD
//!
//! An agent fronting physical test hardware. Exporters advertise labels and
//! a device report, send liveness heartbeats, and carry a derived
//! back-pointer to the lease currently holding them.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::conditions::{is_condition_true, Condition};
use crate::references::LocalObjectReference;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "jumpstarter.dev",
    version = "v1alpha1",
    kind = "Exporter",
    namespaced,
    status = "ExporterStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ExporterSpec {
    /// Overrides the computed username assertion
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExporterStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Secret holding the controller-audience credential token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<LocalObjectReference>,

    /// Device tree reported by the last Register call
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub devices: Vec<Device>,

    /// Derived back-pointer to the active lease holding this exporter;
    /// recomputed every reconciliation, never authoritative
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_ref: Option<LocalObjectReference>,

    /// Last heartbeat observed on the Status stream
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,

    /// Controller endpoint advertised to this exporter
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub endpoint: String,
}

/// One device in an exporter's report.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub uuid: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_uuid: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

/// Exporter condition types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExporterConditionType {
    Registered,
    Online,
}

impl ExporterConditionType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Registered => "Registered",
            Self::Online => "Online",
        }
    }
}

impl Exporter {
    /// The username this exporter authenticates as.
    pub fn internal_subject(&self, prefix: &str) -> String {
        match &self.spec.username {
            Some(username) => username.clone(),
            None => format!(
                "{prefix}exporter:{}:{}:{}",
                self.metadata.namespace.as_deref().unwrap_or_default(),
                self.metadata.name.as_deref().unwrap_or_default(),
                self.metadata.uid.as_deref().unwrap_or_default(),
            ),
        }
    }

    /// Labels on the exporter, empty map if none.
    pub fn labels(&self) -> BTreeMap<String, String> {
        self.metadata.labels.clone().unwrap_or_default()
    }

    /// Whether the `Online` condition is currently true.
    pub fn is_online(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| is_condition_true(&s.conditions, ExporterConditionType::Online.as_str()))
    }

    /// Liveness as derived from `lastSeen`: online iff a heartbeat was seen
    /// within the offline timeout.
    pub fn seen_within(&self, now: DateTime<Utc>, offline_timeout: Duration) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.last_seen)
            .is_some_and(|seen| now - seen < offline_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conditions::{set_condition, ConditionStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn test_exporter() -> Exporter {
        Exporter {
            metadata: ObjectMeta {
                name: Some("exporter1-dut-a".to_string()),
                namespace: Some("default".to_string()),
                uid: Some("2222-3333".to_string()),
                ..Default::default()
            },
            spec: ExporterSpec { username: None },
            status: Some(ExporterStatus::default()),
        }
    }

    #[test]
    fn test_computed_subject() {
        let exporter = test_exporter();
        assert_eq!(
            exporter.internal_subject("jumpstarter:"),
            "jumpstarter:exporter:default:exporter1-dut-a:2222-3333"
        );
    }

    #[test]
    fn test_online_condition() {
        let mut exporter = test_exporter();
        assert!(!exporter.is_online());

        let status = exporter.status.as_mut().unwrap();
        set_condition(
            &mut status.conditions,
            Condition::new(
                ExporterConditionType::Online.as_str(),
                ConditionStatus::True,
                "Heartbeat",
                "",
                Utc::now(),
            ),
        );
        assert!(exporter.is_online());
    }

    #[test]
    fn test_seen_within() {
        let mut exporter = test_exporter();
        let now = Utc::now();
        assert!(!exporter.seen_within(now, Duration::minutes(3)));

        exporter.status.as_mut().unwrap().last_seen = Some(now - Duration::seconds(30));
        assert!(exporter.seen_within(now, Duration::minutes(3)));
        assert!(!exporter.seen_within(now, Duration::seconds(10)));
    }
}

//! ExporterAccessPolicy CRD
//!
//! An ordered rule set deciding which clients may lease which exporters,
//! with per-rule duration caps and preemptibility. Policies are static
//! configuration evaluated per lease request.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::selector::LabelSelector;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "jumpstarter.dev",
    version = "v1alpha1",
    kind = "ExporterAccessPolicy",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ExporterAccessPolicySpec {
    /// Exporters this policy applies to
    #[serde(default)]
    pub exporter_selector: LabelSelector,

    /// Rules evaluated in priority order; the first matching rule admits
    /// the client
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<AccessRule>,
}

/// One admission rule within a policy.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AccessRule {
    /// Total order within the policy; higher wins
    pub priority: i32,

    /// Clients this rule admits
    #[serde(default)]
    pub client_selector: LabelSelector,

    /// Cap on the effective lease duration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum_duration_seconds: Option<i64>,

    /// Leases admitted by this rule may be preempted by higher-priority
    /// requests
    #[serde(default)]
    pub spot_access: bool,
}

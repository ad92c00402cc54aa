//! Resource-style client v1 message types
//!
//! AIP-style resource names: `namespaces/{namespace}/leases/{name}` and
//! `namespaces/{namespace}/exporters/{name}`.

use std::collections::HashMap;

use crate::messages::{Condition, LabelSelector, Timestamp};

/// Exporter as seen by clients.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Exporter {
    /// `namespaces/{namespace}/exporters/{name}`
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(map = "string, string", tag = "2")]
    pub labels: HashMap<String, String>,
    #[prost(message, repeated, tag = "3")]
    pub devices: Vec<Device>,
    #[prost(bool, tag = "4")]
    pub online: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Device {
    #[prost(string, tag = "1")]
    pub uuid: String,
    #[prost(string, optional, tag = "2")]
    pub parent_uuid: Option<String>,
    #[prost(map = "string, string", tag = "3")]
    pub labels: HashMap<String, String>,
}

/// Lease as seen by clients.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Lease {
    /// `namespaces/{namespace}/leases/{name}`
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(message, optional, tag = "2")]
    pub selector: Option<LabelSelector>,
    #[prost(int64, optional, tag = "3")]
    pub duration_seconds: Option<i64>,
    #[prost(message, optional, tag = "4")]
    pub begin_time: Option<Timestamp>,
    #[prost(message, optional, tag = "5")]
    pub end_time: Option<Timestamp>,
    #[prost(string, tag = "6")]
    pub client: String,
    #[prost(string, tag = "7")]
    pub exporter: String,
    #[prost(message, repeated, tag = "8")]
    pub conditions: Vec<Condition>,
    #[prost(bool, tag = "9")]
    pub ended: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetExporterRequest {
    #[prost(string, tag = "1")]
    pub name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListExportersRequest {
    /// `namespaces/{namespace}`
    #[prost(string, tag = "1")]
    pub parent: String,
    #[prost(int32, tag = "2")]
    pub page_size: i32,
    #[prost(string, tag = "3")]
    pub page_token: String,
    /// Label selector expression, e.g. `dut=a`
    #[prost(string, tag = "4")]
    pub filter: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListExportersResponse {
    #[prost(message, repeated, tag = "1")]
    pub exporters: Vec<Exporter>,
    #[prost(string, tag = "2")]
    pub next_page_token: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetLeaseRequest {
    #[prost(string, tag = "1")]
    pub name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListLeasesRequest {
    #[prost(string, tag = "1")]
    pub parent: String,
    #[prost(int32, tag = "2")]
    pub page_size: i32,
    #[prost(string, tag = "3")]
    pub page_token: String,
    #[prost(string, tag = "4")]
    pub filter: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListLeasesResponse {
    #[prost(message, repeated, tag = "1")]
    pub leases: Vec<Lease>,
    #[prost(string, tag = "2")]
    pub next_page_token: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CreateLeaseRequest {
    #[prost(string, tag = "1")]
    pub parent: String,
    #[prost(message, optional, tag = "2")]
    pub lease: Option<Lease>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpdateLeaseRequest {
    #[prost(message, optional, tag = "1")]
    pub lease: Option<Lease>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeleteLeaseRequest {
    #[prost(string, tag = "1")]
    pub name: String,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct Empty {}

/// Parse `namespaces/{namespace}/{collection}/{name}` resource names.
pub fn parse_resource_name(
    name: &str,
    collection: &str,
) -> Option<(String, String)> {
    let mut parts = name.split('/');
    match (
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
    ) {
        (Some("namespaces"), Some(ns), Some(c), Some(n), None)
            if c == collection && !ns.is_empty() && !n.is_empty() =>
        {
            Some((ns.to_string(), n.to_string()))
        }
        _ => None,
    }
}

/// Parse `namespaces/{namespace}` parent names.
pub fn parse_parent_name(parent: &str) -> Option<String> {
    let mut parts = parent.split('/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some("namespaces"), Some(ns), None) if !ns.is_empty() => Some(ns.to_string()),
        _ => None,
    }
}

/// Format a lease resource name.
pub fn lease_resource_name(namespace: &str, name: &str) -> String {
    format!("namespaces/{namespace}/leases/{name}")
}

/// Format an exporter resource name.
pub fn exporter_resource_name(namespace: &str, name: &str) -> String {
    format!("namespaces/{namespace}/exporters/{name}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_resource_name() {
        assert_eq!(
            parse_resource_name("namespaces/default/leases/lease1", "leases"),
            Some(("default".to_string(), "lease1".to_string()))
        );
        assert_eq!(
            parse_resource_name("namespaces/default/exporters/e1", "leases"),
            None
        );
        assert_eq!(parse_resource_name("leases/lease1", "leases"), None);
        assert_eq!(
            parse_resource_name("namespaces/default/leases/", "leases"),
            None
        );
    }

    #[test]
    fn test_parse_parent_name() {
        assert_eq!(
            parse_parent_name("namespaces/default"),
            Some("default".to_string())
        );
        assert_eq!(parse_parent_name("default"), None);
        assert_eq!(parse_parent_name("namespaces/default/leases"), None);
    }

    #[test]
    fn test_resource_name_roundtrip() {
        let name = lease_resource_name("default", "lease1");
        assert_eq!(
            parse_resource_name(&name, "leases"),
            Some(("default".to_string(), "lease1".to_string()))
        );
    }
}

//! Test utilities for unit testing reconcilers and services
//!
//! Helpers for creating test resources and a reconciler wired to the
//! in-memory store.

#![cfg(test)]

use std::collections::BTreeMap;
use std::sync::Arc;

use auth::TokenService;
use chrono::{DateTime, Utc};
use crds::{
    AccessRule, Client, ClientSpec, Exporter, ExporterAccessPolicy, ExporterAccessPolicySpec,
    ExporterSpec, LabelSelector, Lease, LeaseSpec, LocalObjectReference,
};
use kube::core::ObjectMeta;
use store::{MemoryStore, Store};

use crate::reconciler::Reconciler;
use crate::service::listen::ListenMap;

pub const TEST_NAMESPACE: &str = "default";
pub const TEST_ENDPOINT: &str = "jumpstarter.test:8082";

pub fn test_token_service() -> Arc<TokenService> {
    Arc::new(TokenService::new(
        b"test-controller-key".to_vec(),
        b"test-router-key".to_vec(),
        "jumpstarter:",
    ))
}

pub fn test_reconciler(store: Arc<MemoryStore>) -> Reconciler {
    Reconciler::new(
        store,
        test_token_service(),
        Arc::new(ListenMap::new()),
        TEST_ENDPOINT.to_string(),
        chrono::Duration::seconds(180),
    )
}

fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

pub fn test_client(name: &str, label_pairs: &[(&str, &str)]) -> Client {
    Client {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(TEST_NAMESPACE.to_string()),
            labels: Some(labels(label_pairs)),
            ..Default::default()
        },
        spec: ClientSpec { username: None },
        status: None,
    }
}

pub fn test_exporter(name: &str, label_pairs: &[(&str, &str)]) -> Exporter {
    Exporter {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(TEST_NAMESPACE.to_string()),
            labels: Some(labels(label_pairs)),
            ..Default::default()
        },
        spec: ExporterSpec { username: None },
        status: None,
    }
}

pub fn test_lease(name: &str, client: &str, selector: &[(&str, &str)], seconds: i64) -> Lease {
    Lease {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(TEST_NAMESPACE.to_string()),
            ..Default::default()
        },
        spec: LeaseSpec {
            client_ref: LocalObjectReference::new(client),
            selector: LabelSelector {
                match_labels: labels(selector),
                match_expressions: Vec::new(),
            },
            duration_seconds: Some(seconds),
            begin_time: None,
            end_time: None,
            release: false,
        },
        status: None,
    }
}

pub fn test_policy(
    name: &str,
    exporter_selector: &[(&str, &str)],
    rules: Vec<AccessRule>,
) -> ExporterAccessPolicy {
    ExporterAccessPolicy {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(TEST_NAMESPACE.to_string()),
            ..Default::default()
        },
        spec: ExporterAccessPolicySpec {
            exporter_selector: LabelSelector {
                match_labels: labels(exporter_selector),
                match_expressions: Vec::new(),
            },
            rules,
        },
    }
}

/// Record a heartbeat and derive the exporter's conditions at `now`.
pub async fn heartbeat_exporter(
    store: &Arc<MemoryStore>,
    reconciler: &Reconciler,
    name: &str,
    now: DateTime<Utc>,
) {
    let mut exporter = store.get_exporter(TEST_NAMESPACE, name).await.unwrap();
    let mut status = exporter.status.clone().unwrap_or_default();
    status.last_seen = Some(now);
    exporter.status = Some(status);
    store.update_exporter_status(&exporter).await.unwrap();
    reconciler
        .reconcile_exporter_at(TEST_NAMESPACE, name, now)
        .await
        .unwrap();
}

pub async fn get_lease(store: &Arc<MemoryStore>, name: &str) -> Lease {
    store.get_lease(TEST_NAMESPACE, name).await.unwrap()
}

pub async fn get_exporter(store: &Arc<MemoryStore>, name: &str) -> Exporter {
    store.get_exporter(TEST_NAMESPACE, name).await.unwrap()
}

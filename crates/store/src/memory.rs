//! In-memory store for unit and integration testing
//!
//! Stores resources in memory with the same optimistic-concurrency and
//! status-subresource semantics as the real store, so scheduler tests can
//! run without a cluster. Exporter updates are fanned out over a broadcast
//! channel to back [`Store::watch_exporter`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use crds::{Client, Exporter, ExporterAccessPolicy, LabelSelector, Lease};
use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::error::StoreError;
use crate::store_trait::{ExporterStream, OwnerInfo, Store};

type Key = (String, String);

/// In-memory [`Store`] implementation.
#[derive(Clone)]
pub struct MemoryStore {
    clients: Arc<Mutex<HashMap<Key, Client>>>,
    exporters: Arc<Mutex<HashMap<Key, Exporter>>>,
    leases: Arc<Mutex<HashMap<Key, Lease>>>,
    policies: Arc<Mutex<HashMap<Key, ExporterAccessPolicy>>>,
    secrets: Arc<Mutex<HashMap<Key, String>>>,
    next_version: Arc<Mutex<u64>>,
    exporter_events: broadcast::Sender<Exporter>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (exporter_events, _) = broadcast::channel(64);
        Self {
            clients: Arc::new(Mutex::new(HashMap::new())),
            exporters: Arc::new(Mutex::new(HashMap::new())),
            leases: Arc::new(Mutex::new(HashMap::new())),
            policies: Arc::new(Mutex::new(HashMap::new())),
            secrets: Arc::new(Mutex::new(HashMap::new())),
            next_version: Arc::new(Mutex::new(0)),
            exporter_events,
        }
    }

    fn next_version(&self) -> String {
        let mut counter = self.next_version.lock().unwrap();
        *counter += 1;
        counter.to_string()
    }

    fn key(namespace: &str, name: &str) -> Key {
        (namespace.to_string(), name.to_string())
    }

    fn object_key<M>(metadata: &M) -> Result<Key, StoreError>
    where
        M: MetadataLike,
    {
        match (metadata.namespace(), metadata.name()) {
            (Some(ns), Some(name)) => Ok((ns.to_string(), name.to_string())),
            _ => Err(StoreError::Invalid(
                "object is missing namespace or name".to_string(),
            )),
        }
    }

    /// Seed a client, assigning uid and resource version.
    pub fn insert_client(&self, mut client: Client) -> Client {
        client.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        client.metadata.resource_version = Some(self.next_version());
        let key = Self::object_key(&client.metadata).unwrap();
        self.clients.lock().unwrap().insert(key, client.clone());
        client
    }

    /// Seed an exporter, assigning uid and resource version.
    pub fn insert_exporter(&self, mut exporter: Exporter) -> Exporter {
        exporter.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        exporter.metadata.resource_version = Some(self.next_version());
        let key = Self::object_key(&exporter.metadata).unwrap();
        self.exporters.lock().unwrap().insert(key, exporter.clone());
        exporter
    }

    /// Seed an access policy.
    pub fn insert_policy(&self, mut policy: ExporterAccessPolicy) -> ExporterAccessPolicy {
        policy.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        policy.metadata.resource_version = Some(self.next_version());
        let key = Self::object_key(&policy.metadata).unwrap();
        self.policies.lock().unwrap().insert(key, policy.clone());
        policy
    }

    fn version_conflict(stored: &Option<String>, incoming: &Option<String>) -> bool {
        matches!((stored, incoming), (Some(s), Some(i)) if s != i)
    }
}

// Small helper so key extraction works on any object metadata.
trait MetadataLike {
    fn namespace(&self) -> Option<&str>;
    fn name(&self) -> Option<&str>;
}

impl MetadataLike for kube::core::ObjectMeta {
    fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }
    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_client(&self, namespace: &str, name: &str) -> Result<Client, StoreError> {
        self.clients
            .lock()
            .unwrap()
            .get(&Self::key(namespace, name))
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                kind: "Client",
                name: name.to_string(),
            })
    }

    async fn list_clients(&self, namespace: &str) -> Result<Vec<Client>, StoreError> {
        let mut clients: Vec<Client> = self
            .clients
            .lock()
            .unwrap()
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, c)| c.clone())
            .collect();
        clients.sort_by_key(|c| c.metadata.name.clone());
        Ok(clients)
    }

    async fn update_client_status(&self, client: &Client) -> Result<Client, StoreError> {
        let key = Self::object_key(&client.metadata)?;
        let mut clients = self.clients.lock().unwrap();
        let stored = clients.get_mut(&key).ok_or_else(|| StoreError::NotFound {
            kind: "Client",
            name: key.1.clone(),
        })?;
        if Self::version_conflict(
            &stored.metadata.resource_version,
            &client.metadata.resource_version,
        ) {
            return Err(StoreError::Conflict {
                kind: "Client",
                name: key.1,
            });
        }
        stored.status = client.status.clone();
        stored.metadata.resource_version = Some(self.next_version());
        Ok(stored.clone())
    }

    async fn get_exporter(&self, namespace: &str, name: &str) -> Result<Exporter, StoreError> {
        self.exporters
            .lock()
            .unwrap()
            .get(&Self::key(namespace, name))
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                kind: "Exporter",
                name: name.to_string(),
            })
    }

    async fn list_exporters(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<Exporter>, StoreError> {
        let mut exporters: Vec<Exporter> = self
            .exporters
            .lock()
            .unwrap()
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, e)| e.clone())
            .filter(|e| selector.matches(&e.labels()))
            .collect();
        exporters.sort_by_key(|e| e.metadata.name.clone());
        Ok(exporters)
    }

    async fn update_exporter(&self, exporter: &Exporter) -> Result<Exporter, StoreError> {
        let key = Self::object_key(&exporter.metadata)?;
        let updated = {
            let mut exporters = self.exporters.lock().unwrap();
            let stored = exporters.get_mut(&key).ok_or_else(|| StoreError::NotFound {
                kind: "Exporter",
                name: key.1.clone(),
            })?;
            if Self::version_conflict(
                &stored.metadata.resource_version,
                &exporter.metadata.resource_version,
            ) {
                return Err(StoreError::Conflict {
                    kind: "Exporter",
                    name: key.1,
                });
            }
            stored.metadata.labels = exporter.metadata.labels.clone();
            stored.spec = exporter.spec.clone();
            stored.metadata.resource_version = Some(self.next_version());
            stored.clone()
        };
        let _ = self.exporter_events.send(updated.clone());
        Ok(updated)
    }

    async fn update_exporter_status(&self, exporter: &Exporter) -> Result<Exporter, StoreError> {
        let key = Self::object_key(&exporter.metadata)?;
        let updated = {
            let mut exporters = self.exporters.lock().unwrap();
            let stored = exporters.get_mut(&key).ok_or_else(|| StoreError::NotFound {
                kind: "Exporter",
                name: key.1.clone(),
            })?;
            if Self::version_conflict(
                &stored.metadata.resource_version,
                &exporter.metadata.resource_version,
            ) {
                return Err(StoreError::Conflict {
                    kind: "Exporter",
                    name: key.1,
                });
            }
            stored.status = exporter.status.clone();
            stored.metadata.resource_version = Some(self.next_version());
            stored.clone()
        };
        let _ = self.exporter_events.send(updated.clone());
        Ok(updated)
    }

    async fn watch_exporter(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<ExporterStream, StoreError> {
        let namespace = namespace.to_string();
        let name = name.to_string();
        let stream = BroadcastStream::new(self.exporter_events.subscribe()).filter_map(
            move |event| {
                let namespace = namespace.clone();
                let name = name.clone();
                async move {
                    match event {
                        Ok(exporter)
                            if exporter.metadata.namespace.as_deref() == Some(&namespace)
                                && exporter.metadata.name.as_deref() == Some(&name) =>
                        {
                            Some(exporter)
                        }
                        _ => None,
                    }
                }
            },
        );
        Ok(Box::pin(stream))
    }

    async fn get_lease(&self, namespace: &str, name: &str) -> Result<Lease, StoreError> {
        self.leases
            .lock()
            .unwrap()
            .get(&Self::key(namespace, name))
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                kind: "Lease",
                name: name.to_string(),
            })
    }

    async fn list_leases(&self, namespace: &str) -> Result<Vec<Lease>, StoreError> {
        let mut leases: Vec<Lease> = self
            .leases
            .lock()
            .unwrap()
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, l)| l.clone())
            .collect();
        leases.sort_by_key(|l| l.metadata.name.clone());
        Ok(leases)
    }

    async fn list_active_leases(&self, namespace: &str) -> Result<Vec<Lease>, StoreError> {
        Ok(self
            .list_leases(namespace)
            .await?
            .into_iter()
            .filter(|l| !l.is_ended())
            .collect())
    }

    async fn create_lease(&self, lease: &Lease) -> Result<Lease, StoreError> {
        let key = Self::object_key(&lease.metadata)?;
        let mut leases = self.leases.lock().unwrap();
        if leases.contains_key(&key) {
            return Err(StoreError::AlreadyExists {
                kind: "Lease",
                name: key.1,
            });
        }
        let mut lease = lease.clone();
        lease.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        lease.metadata.resource_version = Some(self.next_version());
        leases.insert(key, lease.clone());
        Ok(lease)
    }

    async fn update_lease(&self, lease: &Lease) -> Result<Lease, StoreError> {
        let key = Self::object_key(&lease.metadata)?;
        let mut leases = self.leases.lock().unwrap();
        let stored = leases.get_mut(&key).ok_or_else(|| StoreError::NotFound {
            kind: "Lease",
            name: key.1.clone(),
        })?;
        if Self::version_conflict(
            &stored.metadata.resource_version,
            &lease.metadata.resource_version,
        ) {
            return Err(StoreError::Conflict {
                kind: "Lease",
                name: key.1,
            });
        }
        stored.spec = lease.spec.clone();
        stored.metadata.resource_version = Some(self.next_version());
        Ok(stored.clone())
    }

    async fn update_lease_status(&self, lease: &Lease) -> Result<Lease, StoreError> {
        let key = Self::object_key(&lease.metadata)?;
        let mut leases = self.leases.lock().unwrap();
        let stored = leases.get_mut(&key).ok_or_else(|| StoreError::NotFound {
            kind: "Lease",
            name: key.1.clone(),
        })?;
        if Self::version_conflict(
            &stored.metadata.resource_version,
            &lease.metadata.resource_version,
        ) {
            return Err(StoreError::Conflict {
                kind: "Lease",
                name: key.1,
            });
        }
        stored.status = lease.status.clone();
        stored.metadata.resource_version = Some(self.next_version());
        Ok(stored.clone())
    }

    async fn delete_lease(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        self.leases
            .lock()
            .unwrap()
            .remove(&Self::key(namespace, name))
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound {
                kind: "Lease",
                name: name.to_string(),
            })
    }

    async fn list_access_policies(
        &self,
        namespace: &str,
    ) -> Result<Vec<ExporterAccessPolicy>, StoreError> {
        let mut policies: Vec<ExporterAccessPolicy> = self
            .policies
            .lock()
            .unwrap()
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, p)| p.clone())
            .collect();
        policies.sort_by_key(|p| p.metadata.name.clone());
        Ok(policies)
    }

    async fn get_secret_token(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<String>, StoreError> {
        Ok(self
            .secrets
            .lock()
            .unwrap()
            .get(&Self::key(namespace, name))
            .cloned())
    }

    async fn ensure_secret(
        &self,
        namespace: &str,
        name: &str,
        token: &str,
        _owner: &OwnerInfo,
    ) -> Result<(), StoreError> {
        self.secrets
            .lock()
            .unwrap()
            .entry(Self::key(namespace, name))
            .or_insert_with(|| token.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crds::{ExporterSpec, LeaseSpec, LeaseStatus, LocalObjectReference};
    use kube::core::ObjectMeta;

    fn test_exporter(name: &str) -> Exporter {
        Exporter {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: ExporterSpec { username: None },
            status: None,
        }
    }

    fn test_lease(name: &str) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: LeaseSpec {
                client_ref: LocalObjectReference::new("test-client"),
                selector: LabelSelector::default(),
                duration_seconds: Some(60),
                begin_time: None,
                end_time: None,
                release: false,
            },
            status: None,
        }
    }

    #[tokio::test]
    async fn test_create_and_get_lease() {
        let store = MemoryStore::new();
        let created = store.create_lease(&test_lease("lease1")).await.unwrap();
        assert!(created.metadata.uid.is_some());

        let fetched = store.get_lease("default", "lease1").await.unwrap();
        assert_eq!(fetched.metadata.uid, created.metadata.uid);
    }

    #[tokio::test]
    async fn test_duplicate_create_rejected() {
        let store = MemoryStore::new();
        store.create_lease(&test_lease("lease1")).await.unwrap();
        let err = store.create_lease(&test_lease("lease1")).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_stale_resource_version_conflicts() {
        let store = MemoryStore::new();
        let created = store.create_lease(&test_lease("lease1")).await.unwrap();

        // First writer wins
        let mut first = created.clone();
        first.status = Some(LeaseStatus::default());
        store.update_lease_status(&first).await.unwrap();

        // Second writer carries the stale version
        let mut second = created;
        second.status = Some(LeaseStatus {
            ended: true,
            ..Default::default()
        });
        let err = store.update_lease_status(&second).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_status_update_keeps_spec() {
        let store = MemoryStore::new();
        let created = store.create_lease(&test_lease("lease1")).await.unwrap();

        let mut update = created.clone();
        update.spec.duration_seconds = Some(999);
        update.status = Some(LeaseStatus::default());
        store.update_lease_status(&update).await.unwrap();

        let fetched = store.get_lease("default", "lease1").await.unwrap();
        assert_eq!(fetched.spec.duration_seconds, Some(60));
        assert!(fetched.status.is_some());
    }

    #[tokio::test]
    async fn test_list_exporters_by_selector() {
        let store = MemoryStore::new();
        let mut a = test_exporter("exporter1-dut-a");
        a.metadata.labels = Some([("dut".to_string(), "a".to_string())].into());
        let mut b = test_exporter("exporter3-dut-b");
        b.metadata.labels = Some([("dut".to_string(), "b".to_string())].into());
        store.insert_exporter(a);
        store.insert_exporter(b);

        let matched = store
            .list_exporters("default", &LabelSelector::from_label("dut", "a"))
            .await
            .unwrap();
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].metadata.name.as_deref(), Some("exporter1-dut-a"));
    }

    #[tokio::test]
    async fn test_watch_exporter_delivers_updates() {
        let store = MemoryStore::new();
        let exporter = store.insert_exporter(test_exporter("exporter1"));

        let mut watch = store.watch_exporter("default", "exporter1").await.unwrap();

        let mut updated = exporter.clone();
        updated.status = Some(Default::default());
        store.update_exporter_status(&updated).await.unwrap();

        let seen = watch.next().await.unwrap();
        assert_eq!(seen.metadata.name.as_deref(), Some("exporter1"));
        assert!(seen.status.is_some());
    }
}

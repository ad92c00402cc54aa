//! Kubernetes-backed store
//!
//! Production [`Store`] implementation over `kube::Api`. Optimistic
//! concurrency rides on `resourceVersion` via replace semantics; HTTP 409
//! responses are mapped to [`StoreError::Conflict`] / `AlreadyExists` so
//! callers can requeue without inspecting transport details.

use async_trait::async_trait;
use crds::{Client, Exporter, ExporterAccessPolicy, LabelSelector, Lease};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::core::ObjectMeta;
use kube::Client as KubeClient;
use kube_runtime::watcher;
use tracing::warn;

use crate::error::StoreError;
use crate::store_trait::{ExporterStream, OwnerInfo, Store};

/// [`Store`] implementation over the Kubernetes API.
#[derive(Clone)]
pub struct KubeStore {
    client: KubeClient,
}

impl KubeStore {
    pub fn new(client: KubeClient) -> Self {
        Self { client }
    }

    fn clients(&self, namespace: &str) -> Api<Client> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn exporters(&self, namespace: &str) -> Api<Exporter> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn leases(&self, namespace: &str) -> Api<Lease> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn policies(&self, namespace: &str) -> Api<ExporterAccessPolicy> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn secrets(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn map_err(kind: &'static str, name: &str, err: kube::Error) -> StoreError {
        match &err {
            kube::Error::Api(resp) if resp.code == 404 => StoreError::NotFound {
                kind,
                name: name.to_string(),
            },
            kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists" => {
                StoreError::AlreadyExists {
                    kind,
                    name: name.to_string(),
                }
            }
            kube::Error::Api(resp) if resp.code == 409 => StoreError::Conflict {
                kind,
                name: name.to_string(),
            },
            _ => StoreError::Kube(err),
        }
    }

    fn name_of(meta: &ObjectMeta) -> Result<&str, StoreError> {
        meta.name
            .as_deref()
            .ok_or_else(|| StoreError::Invalid("object is missing a name".to_string()))
    }

    fn namespace_of(meta: &ObjectMeta) -> Result<&str, StoreError> {
        meta.namespace
            .as_deref()
            .ok_or_else(|| StoreError::Invalid("object is missing a namespace".to_string()))
    }

    fn encode<T: serde::Serialize>(object: &T) -> Result<Vec<u8>, StoreError> {
        serde_json::to_vec(object).map_err(|e| StoreError::Invalid(e.to_string()))
    }
}

#[async_trait]
impl Store for KubeStore {
    async fn get_client(&self, namespace: &str, name: &str) -> Result<Client, StoreError> {
        self.clients(namespace)
            .get(name)
            .await
            .map_err(|e| Self::map_err("Client", name, e))
    }

    async fn list_clients(&self, namespace: &str) -> Result<Vec<Client>, StoreError> {
        let list = self
            .clients(namespace)
            .list(&ListParams::default())
            .await
            .map_err(StoreError::Kube)?;
        Ok(list.items)
    }

    async fn update_client_status(&self, client: &Client) -> Result<Client, StoreError> {
        let name = Self::name_of(&client.metadata)?;
        let namespace = Self::namespace_of(&client.metadata)?;
        self.clients(namespace)
            .replace_status(name, &PostParams::default(), Self::encode(client)?)
            .await
            .map_err(|e| Self::map_err("Client", name, e))
    }

    async fn get_exporter(&self, namespace: &str, name: &str) -> Result<Exporter, StoreError> {
        self.exporters(namespace)
            .get(name)
            .await
            .map_err(|e| Self::map_err("Exporter", name, e))
    }

    async fn list_exporters(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<Exporter>, StoreError> {
        let list = self
            .exporters(namespace)
            .list(&ListParams::default())
            .await
            .map_err(StoreError::Kube)?;
        // Match expressions are evaluated in-process so list semantics stay
        // identical across store implementations.
        Ok(list
            .items
            .into_iter()
            .filter(|e| selector.matches(&e.labels()))
            .collect())
    }

    async fn update_exporter(&self, exporter: &Exporter) -> Result<Exporter, StoreError> {
        let name = Self::name_of(&exporter.metadata)?;
        let namespace = Self::namespace_of(&exporter.metadata)?;
        self.exporters(namespace)
            .replace(name, &PostParams::default(), exporter)
            .await
            .map_err(|e| Self::map_err("Exporter", name, e))
    }

    async fn update_exporter_status(&self, exporter: &Exporter) -> Result<Exporter, StoreError> {
        let name = Self::name_of(&exporter.metadata)?;
        let namespace = Self::namespace_of(&exporter.metadata)?;
        self.exporters(namespace)
            .replace_status(name, &PostParams::default(), Self::encode(exporter)?)
            .await
            .map_err(|e| Self::map_err("Exporter", name, e))
    }

    async fn watch_exporter(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<ExporterStream, StoreError> {
        let api = self.exporters(namespace);
        let config = watcher::Config::default().fields(&format!("metadata.name={name}"));
        let stream = watcher(api, config).filter_map(|event| async move {
            match event {
                Ok(watcher::Event::Apply(exporter))
                | Ok(watcher::Event::InitApply(exporter)) => Some(exporter),
                Ok(_) => None,
                Err(err) => {
                    warn!("exporter watch error: {err}");
                    None
                }
            }
        });
        Ok(Box::pin(stream))
    }

    async fn get_lease(&self, namespace: &str, name: &str) -> Result<Lease, StoreError> {
        self.leases(namespace)
            .get(name)
            .await
            .map_err(|e| Self::map_err("Lease", name, e))
    }

    async fn list_leases(&self, namespace: &str) -> Result<Vec<Lease>, StoreError> {
        let list = self
            .leases(namespace)
            .list(&ListParams::default())
            .await
            .map_err(StoreError::Kube)?;
        Ok(list.items)
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
        let name = Self::name_of(&lease.metadata)?;
        let namespace = Self::namespace_of(&lease.metadata)?;
        self.leases(namespace)
            .create(&PostParams::default(), lease)
            .await
            .map_err(|e| Self::map_err("Lease", name, e))
    }

    async fn update_lease(&self, lease: &Lease) -> Result<Lease, StoreError> {
        let name = Self::name_of(&lease.metadata)?;
        let namespace = Self::namespace_of(&lease.metadata)?;
        self.leases(namespace)
            .replace(name, &PostParams::default(), lease)
            .await
            .map_err(|e| Self::map_err("Lease", name, e))
    }

    async fn update_lease_status(&self, lease: &Lease) -> Result<Lease, StoreError> {
        let name = Self::name_of(&lease.metadata)?;
        let namespace = Self::namespace_of(&lease.metadata)?;
        self.leases(namespace)
            .replace_status(name, &PostParams::default(), Self::encode(lease)?)
            .await
            .map_err(|e| Self::map_err("Lease", name, e))
    }

    async fn delete_lease(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        self.leases(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| Self::map_err("Lease", name, e))
    }

    async fn list_access_policies(
        &self,
        namespace: &str,
    ) -> Result<Vec<ExporterAccessPolicy>, StoreError> {
        let list = self
            .policies(namespace)
            .list(&ListParams::default())
            .await
            .map_err(StoreError::Kube)?;
        Ok(list.items)
    }

    async fn get_secret_token(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<String>, StoreError> {
        match self.secrets(namespace).get(name).await {
            Ok(secret) => Ok(secret
                .data
                .as_ref()
                .and_then(|data| data.get("token"))
                .and_then(|bytes| String::from_utf8(bytes.0.clone()).ok())
                .or_else(|| {
                    secret
                        .string_data
                        .as_ref()
                        .and_then(|data| data.get("token"))
                        .cloned()
                })),
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(None),
            Err(err) => Err(StoreError::Kube(err)),
        }
    }

    async fn ensure_secret(
        &self,
        namespace: &str,
        name: &str,
        token: &str,
        owner: &OwnerInfo,
    ) -> Result<(), StoreError> {
        let api = self.secrets(namespace);
        match api.get(name).await {
            Ok(_) => return Ok(()),
            Err(kube::Error::Api(resp)) if resp.code == 404 => {}
            Err(err) => return Err(StoreError::Kube(err)),
        }

        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                // Garbage-collected together with the owning object
                owner_references: Some(vec![OwnerReference {
                    api_version: owner.api_version.clone(),
                    kind: owner.kind.clone(),
                    name: owner.name.clone(),
                    uid: owner.uid.clone(),
                    controller: Some(true),
                    block_owner_deletion: None,
                }]),
                ..Default::default()
            },
            type_: Some("Opaque".to_string()),
            string_data: Some([("token".to_string(), token.to_string())].into()),
            ..Default::default()
        };

        match api.create(&PostParams::default(), &secret).await {
            Ok(_) => Ok(()),
            Err(err) => match Self::map_err("Secret", name, err) {
                // Lost a create race; the credential already exists
                StoreError::AlreadyExists { .. } => Ok(()),
                other => Err(other),
            },
        }
    }
}

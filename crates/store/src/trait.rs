//! Store trait
//!
//! Abstracts the resource store to enable testing the scheduler and RPC
//! services without a running cluster. The concrete [`crate::KubeStore`]
//! implements this trait; tests use [`crate::MemoryStore`].

use async_trait::async_trait;
use crds::{Client, Exporter, ExporterAccessPolicy, LabelSelector, Lease};
use futures::stream::BoxStream;

use crate::error::StoreError;

/// Stream of exporter updates from a name-scoped watch.
pub type ExporterStream = BoxStream<'static, Exporter>;

/// Owner attached to a credential secret so the store can garbage-collect
/// it together with its Client or Exporter.
#[derive(Debug, Clone)]
pub struct OwnerInfo {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: String,
}

/// Typed CRUD, optimistic concurrency, label-selected list and watch over
/// the persistent resource store.
///
/// All async methods must be `Send` to work with Tokio's work-stealing
/// runtime.
#[async_trait]
pub trait Store: Send + Sync {
    // Clients
    async fn get_client(&self, namespace: &str, name: &str) -> Result<Client, StoreError>;
    async fn list_clients(&self, namespace: &str) -> Result<Vec<Client>, StoreError>;
    async fn update_client_status(&self, client: &Client) -> Result<Client, StoreError>;

    // Exporters
    async fn get_exporter(&self, namespace: &str, name: &str) -> Result<Exporter, StoreError>;
    async fn list_exporters(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<Exporter>, StoreError>;
    /// Update metadata and spec (labels in particular); status untouched.
    async fn update_exporter(&self, exporter: &Exporter) -> Result<Exporter, StoreError>;
    /// Update the status subresource; metadata and spec untouched.
    async fn update_exporter_status(&self, exporter: &Exporter) -> Result<Exporter, StoreError>;
    /// Watch a single exporter for updates.
    async fn watch_exporter(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<ExporterStream, StoreError>;

    // Leases
    async fn get_lease(&self, namespace: &str, name: &str) -> Result<Lease, StoreError>;
    async fn list_leases(&self, namespace: &str) -> Result<Vec<Lease>, StoreError>;
    /// Leases whose status is not ended.
    async fn list_active_leases(&self, namespace: &str) -> Result<Vec<Lease>, StoreError>;
    async fn create_lease(&self, lease: &Lease) -> Result<Lease, StoreError>;
    async fn update_lease(&self, lease: &Lease) -> Result<Lease, StoreError>;
    async fn update_lease_status(&self, lease: &Lease) -> Result<Lease, StoreError>;
    async fn delete_lease(&self, namespace: &str, name: &str) -> Result<(), StoreError>;

    // Access policies
    async fn list_access_policies(
        &self,
        namespace: &str,
    ) -> Result<Vec<ExporterAccessPolicy>, StoreError>;

    // Credential secrets
    async fn get_secret_token(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<String>, StoreError>;
    async fn ensure_secret(
        &self,
        namespace: &str,
        name: &str,
        token: &str,
        owner: &OwnerInfo,
    ) -> Result<(), StoreError>;
}

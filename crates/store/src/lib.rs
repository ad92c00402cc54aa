//! Jumpstarter resource store
//!
//! Abstracts the persistent resource store behind a trait so the scheduler,
//! reconcilers and RPC services can run against either a real cluster or an
//! in-memory store in tests.
//!
//! # Semantics
//!
//! - Typed CRUD on `Client`, `Exporter`, `Lease` and `ExporterAccessPolicy`
//! - Optimistic concurrency: updates carrying a stale `resourceVersion` fail
//!   with [`StoreError::Conflict`] and the caller requeues or re-selects
//! - Label-selected exporter listing and a name-scoped exporter watch
//! - Credential secrets as opaque blobs with a single `token` field

pub mod error;
pub mod kube_store;
#[cfg(feature = "test-util")]
pub mod memory;
#[path = "trait.rs"]
pub mod store_trait;

pub use error::StoreError;
pub use kube_store::KubeStore;
#[cfg(feature = "test-util")]
pub use memory::MemoryStore;
pub use store_trait::{ExporterStream, OwnerInfo, Store};

//! Jumpstarter CRD Definitions
//!
//! Kubernetes Custom Resource Definitions for the Jumpstarter controller:
//! - `Client`: named principal allowed to request leases
//! - `Exporter`: agent fronting physical test hardware
//! - `Lease`: time-bounded exclusive binding of a client to an exporter
//! - `ExporterAccessPolicy`: rules deciding which clients may lease which
//!   exporters
//!
//! Shared building blocks (conditions, label selectors, object references)
//! live in their own modules and are re-exported at the crate root.

pub mod access_policy;
pub mod client;
pub mod conditions;
pub mod exporter;
pub mod lease;
pub mod references;
pub mod selector;

pub use access_policy::*;
pub use client::*;
pub use conditions::*;
pub use exporter::*;
pub use lease::*;
pub use references::*;
pub use selector::*;

/// API group shared by all Jumpstarter resources.
pub const GROUP: &str = "jumpstarter.dev";

/// API version shared by all Jumpstarter resources.
pub const VERSION: &str = "v1alpha1";

/// Label keys under this prefix are owner-managed: `Register` replaces them
/// wholesale and users must not edit them.
pub const MANAGED_LABEL_PREFIX: &str = "jumpstarter.dev/";

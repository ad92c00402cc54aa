//! Reconciliation logic for Jumpstarter resources.
//!
//! Organized by resource kind:
//! - `lease`: the scheduler binding leases to exporters
//! - `exporter`: credentials, liveness conditions and the derived lease
//!   back-pointer
//! - `client`: credentials and the advertised endpoint
//!
//! Reconciliation is level-triggered; every invocation recomputes the
//! correct state from the store and persists it only when it changed.

pub mod client;
pub mod exporter;
pub mod lease;


use std::sync::Arc;

use auth::TokenService;
use store::Store;

use crate::service::listen::ListenMap;

/// Reconciles Jumpstarter resources.
pub struct Reconciler {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) tokens: Arc<TokenService>,
    pub(crate) listen_map: Arc<ListenMap>,
    /// Controller endpoint advertised on client and exporter statuses
    pub(crate) endpoint: String,
    /// Exporters without a heartbeat for this long are offline
    pub(crate) offline_timeout: chrono::Duration,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn Store>,
        tokens: Arc<TokenService>,
        listen_map: Arc<ListenMap>,
        endpoint: String,
        offline_timeout: chrono::Duration,
    ) -> Self {
        Self {
            store,
            tokens,
            listen_map,
            endpoint,
            offline_timeout,
        }
    }
}

//! Kubernetes resource watchers.
//!
//! Watches leases, exporters and clients for changes and triggers
//! reconciliation. A periodic sweep re-reconciles active leases and
//! exporters so time-driven transitions (lease expiry, exporters going
//! stale) fire without a watch event.

use std::sync::Arc;

use crds::{Client, Exporter, Lease};
use futures::TryStreamExt;
use kube::Api;
use kube_runtime::watcher;
use tracing::{debug, error, info, warn};

use crate::error::ControllerError;
use crate::reconciler::Reconciler;

/// Interval between time-driven reconciliation sweeps.
const SWEEP_SECONDS: u64 = 1;

pub struct Watcher {
    reconciler: Arc<Reconciler>,
    client: kube::Client,
    namespace: String,
}

impl Watcher {
    pub fn new(reconciler: Arc<Reconciler>, client: kube::Client, namespace: String) -> Self {
        Self {
            reconciler,
            client,
            namespace,
        }
    }

    /// Starts watching Lease resources.
    pub async fn watch_leases(&self) -> Result<(), ControllerError> {
        info!("starting lease watcher");
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &self.namespace);
        let mut stream = Box::pin(watcher(api, watcher::Config::default()));

        while let Some(event) = stream
            .try_next()
            .await
            .map_err(|e| ControllerError::Watch(format!("lease watcher stream error: {e}")))?
        {
            match event {
                watcher::Event::Apply(lease) | watcher::Event::InitApply(lease) => {
                    let name = lease.metadata.name.as_deref().unwrap_or("<unknown>");
                    debug!(lease = name, "lease event");
                    if let Err(err) = self.reconciler.reconcile_lease(&self.namespace, name).await {
                        error!(lease = name, "failed to reconcile lease: {err}");
                    }
                }
                watcher::Event::Delete(lease) => {
                    let name = lease.metadata.name.as_deref().unwrap_or("<unknown>");
                    info!(lease = name, "lease deleted");
                    // Free the exporter the deleted lease was holding
                    if let Some(reference) =
                        lease.status.as_ref().and_then(|s| s.exporter_ref.as_ref())
                    {
                        if let Err(err) = self
                            .reconciler
                            .reconcile_exporter(&self.namespace, &reference.name)
                            .await
                        {
                            warn!(exporter = %reference.name, "failed to reconcile exporter: {err}");
                        }
                    }
                }
                watcher::Event::Init | watcher::Event::InitDone => {
                    debug!("lease watcher initialized");
                }
            }
        }

        Ok(())
    }

    /// Starts watching Exporter resources.
    pub async fn watch_exporters(&self) -> Result<(), ControllerError> {
        info!("starting exporter watcher");
        let api: Api<Exporter> = Api::namespaced(self.client.clone(), &self.namespace);
        let mut stream = Box::pin(watcher(api, watcher::Config::default()));

        while let Some(event) = stream
            .try_next()
            .await
            .map_err(|e| ControllerError::Watch(format!("exporter watcher stream error: {e}")))?
        {
            match event {
                watcher::Event::Apply(exporter) | watcher::Event::InitApply(exporter) => {
                    let name = exporter.metadata.name.as_deref().unwrap_or("<unknown>");
                    if let Err(err) = self
                        .reconciler
                        .reconcile_exporter(&self.namespace, name)
                        .await
                    {
                        error!(exporter = name, "failed to reconcile exporter: {err}");
                    }
                }
                watcher::Event::Delete(exporter) => {
                    let name = exporter.metadata.name.as_deref().unwrap_or("<unknown>");
                    info!(exporter = name, "exporter deleted");
                }
                watcher::Event::Init | watcher::Event::InitDone => {
                    debug!("exporter watcher initialized");
                }
            }
        }

        Ok(())
    }

    /// Starts watching Client resources.
    pub async fn watch_clients(&self) -> Result<(), ControllerError> {
        info!("starting client watcher");
        let api: Api<Client> = Api::namespaced(self.client.clone(), &self.namespace);
        let mut stream = Box::pin(watcher(api, watcher::Config::default()));

        while let Some(event) = stream
            .try_next()
            .await
            .map_err(|e| ControllerError::Watch(format!("client watcher stream error: {e}")))?
        {
            match event {
                watcher::Event::Apply(client) | watcher::Event::InitApply(client) => {
                    let name = client.metadata.name.as_deref().unwrap_or("<unknown>");
                    if let Err(err) = self.reconciler.reconcile_client(&self.namespace, name).await
                    {
                        error!(client = name, "failed to reconcile client: {err}");
                    }
                }
                watcher::Event::Delete(client) => {
                    let name = client.metadata.name.as_deref().unwrap_or("<unknown>");
                    info!(client = name, "client deleted");
                }
                watcher::Event::Init | watcher::Event::InitDone => {
                    debug!("client watcher initialized");
                }
            }
        }

        Ok(())
    }

    /// Re-reconciles active leases and exporters on a short interval so
    /// expirations and staleness are observed promptly.
    pub async fn sweep(&self) -> Result<(), ControllerError> {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(SWEEP_SECONDS));
        loop {
            ticker.tick().await;

            let leases = match self.reconciler.store.list_active_leases(&self.namespace).await {
                Ok(leases) => leases,
                Err(err) => {
                    warn!("sweep unable to list active leases: {err}");
                    continue;
                }
            };
            for lease in leases {
                if let Some(name) = lease.metadata.name.as_deref() {
                    if let Err(err) = self.reconciler.reconcile_lease(&self.namespace, name).await {
                        warn!(lease = name, "sweep reconcile failed: {err}");
                    }
                }
            }

            let exporters = match self
                .reconciler
                .store
                .list_exporters(&self.namespace, &crds::LabelSelector::default())
                .await
            {
                Ok(exporters) => exporters,
                Err(err) => {
                    warn!("sweep unable to list exporters: {err}");
                    continue;
                }
            };
            for exporter in exporters {
                if let Some(name) = exporter.metadata.name.as_deref() {
                    if let Err(err) = self
                        .reconciler
                        .reconcile_exporter(&self.namespace, name)
                        .await
                    {
                        warn!(exporter = name, "sweep reconcile failed: {err}");
                    }
                }
            }
        }
    }
}

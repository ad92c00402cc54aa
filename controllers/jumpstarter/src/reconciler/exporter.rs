//! Exporter reconciler
//!
//! Ensures the credential secret, advertises the controller endpoint,
//! derives liveness conditions from the last heartbeat and recomputes the
//! lease back-pointer from the authoritative side (`lease.status.exporterRef`).

use chrono::{DateTime, Utc};
use crds::{
    set_condition, Condition, ConditionStatus, ExporterConditionType, LocalObjectReference,
};
use store::OwnerInfo;
use tracing::{debug, info};

use super::Reconciler;
use crate::error::ControllerError;

impl Reconciler {
    pub async fn reconcile_exporter(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<(), ControllerError> {
        self.reconcile_exporter_at(namespace, name, Utc::now()).await
    }

    pub async fn reconcile_exporter_at(
        &self,
        namespace: &str,
        name: &str,
        now: DateTime<Utc>,
    ) -> Result<(), ControllerError> {
        let exporter = match self.store.get_exporter(namespace, name).await {
            Ok(exporter) => exporter,
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => return Err(err.into()),
        };

        let mut status = exporter.status.clone().unwrap_or_default();

        // Credential secret, owned by the exporter for garbage collection
        if status.credential.is_none() {
            let secret_name = format!("{name}-exporter");
            let uid = exporter.metadata.uid.clone().unwrap_or_default();
            let token = self
                .tokens
                .sign_object_token("Exporter", namespace, name, &uid)?;
            self.store
                .ensure_secret(
                    namespace,
                    &secret_name,
                    &token,
                    &OwnerInfo {
                        api_version: format!("{}/{}", crds::GROUP, crds::VERSION),
                        kind: "Exporter".to_string(),
                        name: name.to_string(),
                        uid,
                    },
                )
                .await?;
            info!(exporter = name, secret = secret_name, "created exporter credential");
            status.credential = Some(LocalObjectReference::new(secret_name));
        }

        if status.endpoint != self.endpoint {
            status.endpoint = self.endpoint.clone();
        }

        // Back-pointer derived from active leases; never trusted as input
        let active = self.store.list_active_leases(namespace).await?;
        status.lease_ref = active
            .iter()
            .find(|lease| lease.is_active_on(name))
            .and_then(|lease| lease.metadata.name.clone())
            .map(LocalObjectReference::new);

        // Liveness from the heartbeat
        let online = exporter.seen_within(now, self.offline_timeout);
        set_condition(
            &mut status.conditions,
            Condition::new(
                ExporterConditionType::Online.as_str(),
                if online {
                    ConditionStatus::True
                } else {
                    ConditionStatus::False
                },
                if online { "Heartbeat" } else { "Stale" },
                "",
                now,
            ),
        );
        set_condition(
            &mut status.conditions,
            Condition::new(
                ExporterConditionType::Registered.as_str(),
                if status.devices.is_empty() {
                    ConditionStatus::False
                } else {
                    ConditionStatus::True
                },
                if status.devices.is_empty() {
                    "NoDevices"
                } else {
                    "DevicesReported"
                },
                "",
                now,
            ),
        );

        if exporter.status.as_ref() == Some(&status) {
            return Ok(());
        }

        let mut updated = exporter;
        updated.status = Some(status);
        match self.store.update_exporter_status(&updated).await {
            Ok(_) => Ok(()),
            Err(err) if err.is_conflict() => {
                debug!(exporter = name, "status update lost a race, requeueing");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }
}

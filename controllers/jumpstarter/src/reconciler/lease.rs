//! Lease scheduler
//!
//! Drives every lease toward exactly one outcome: `Ready` with an assigned
//! exporter until its end time, `Unsatisfiable` with a reason, or `Ended`.
//! A bound lease never moves to a different exporter. The exporter's
//! back-pointer is derived state owned by the exporter reconciler and is
//! recomputed in the same pass after any binding change.

use chrono::{DateTime, Duration, Utc};
use crds::{
    set_condition, Condition, ConditionStatus, Lease, LeaseConditionType, LeaseSpec, LeaseStatus,
    LocalObjectReference,
};
use tracing::{debug, info};

use super::Reconciler;
use crate::error::ControllerError;
use crate::policy::{self, Admission};

/// Duration the lease asks for, derived from whichever time fields are set.
/// With an explicit end but no begin, the remaining window from `now` counts.
fn requested_duration_seconds(spec: &LeaseSpec, now: DateTime<Utc>) -> Option<i64> {
    if let Some(seconds) = spec.duration_seconds {
        return Some(seconds);
    }
    match (spec.begin_time, spec.end_time) {
        (Some(begin), Some(end)) => Some((end - begin).num_seconds()),
        (None, Some(end)) => Some((end - now).num_seconds()),
        _ => None,
    }
}

impl Reconciler {
    /// Reconcile one lease against the current store state.
    pub async fn reconcile_lease(&self, namespace: &str, name: &str) -> Result<(), ControllerError> {
        self.reconcile_lease_at(namespace, name, Utc::now()).await
    }

    /// Reconcile at an explicit instant; the scheduler itself never reads
    /// the wall clock.
    pub async fn reconcile_lease_at(
        &self,
        namespace: &str,
        name: &str,
        now: DateTime<Utc>,
    ) -> Result<(), ControllerError> {
        let lease = match self.store.get_lease(namespace, name).await {
            Ok(lease) => lease,
            // Deleted; exporter back-pointers are recomputed on their own
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => return Err(err.into()),
        };

        // Terminal state is frozen
        if lease.is_ended() {
            return Ok(());
        }

        let status = lease.status.clone().unwrap_or_default();

        // Bound lease: hold until expiry or release
        if let Some(exporter_ref) = status.exporter_ref.clone() {
            let expired = status.end_time.is_some_and(|end| now >= end);
            if lease.spec.release || expired {
                let reason = if lease.spec.release { "Released" } else { "Expired" };
                self.end_lease(&lease, reason, now).await?;
                self.reconcile_exporter_at(namespace, &exporter_ref.name, now)
                    .await?;
            } else {
                self.mark_ready(&lease, now).await?;
            }
            return Ok(());
        }

        // Pending lease released or already past its requested window
        if lease.spec.release {
            return self.end_lease(&lease, "Released", now).await;
        }
        if lease.spec.end_time.is_some_and(|end| end <= now) {
            return self.end_lease(&lease, "Expired", now).await;
        }
        if lease.spec.begin_time.is_some_and(|begin| begin > now) {
            return self
                .mark_pending(&lease, "WindowNotOpen", "lease window has not opened yet", now)
                .await;
        }

        let Some(requested) = requested_duration_seconds(&lease.spec, now) else {
            return self
                .mark_unsatisfiable(&lease, "InvalidDuration", "lease carries no usable duration", now)
                .await;
        };
        if requested <= 0 {
            return self
                .mark_unsatisfiable(&lease, "InvalidDuration", "lease duration is not positive", now)
                .await;
        }

        let exporters = self
            .store
            .list_exporters(namespace, &lease.spec.selector)
            .await?;
        if exporters.is_empty() {
            return self
                .mark_unsatisfiable(&lease, "NoMatch", "no exporter matches the selector", now)
                .await;
        }

        let online: Vec<_> = exporters.into_iter().filter(|e| e.is_online()).collect();
        if online.is_empty() {
            return self
                .mark_unsatisfiable(
                    &lease,
                    "NoOnlineMatch",
                    "no matching exporter is online",
                    now,
                )
                .await;
        }

        let client = match self
            .store
            .get_client(namespace, &lease.spec.client_ref.name)
            .await
        {
            Ok(client) => client,
            Err(err) if err.is_not_found() => {
                return self
                    .mark_unsatisfiable(&lease, "NoClient", "requesting client does not exist", now)
                    .await;
            }
            Err(err) => return Err(err.into()),
        };
        let client_labels = client.metadata.labels.clone().unwrap_or_default();
        let policies = self.store.list_access_policies(namespace).await?;

        // Per-exporter admission; exporters without any applicable policy
        // are open to everyone at baseline priority
        let mut candidates: Vec<(Admission, crds::Exporter)> = Vec::new();
        for exporter in online {
            if policy::applicable(&policies, &exporter) {
                if let Some(admission) = policy::admit(&policies, &client_labels, &exporter) {
                    candidates.push((admission, exporter));
                }
            } else {
                candidates.push((Admission::default(), exporter));
            }
        }
        if candidates.is_empty() {
            return self
                .mark_unsatisfiable(
                    &lease,
                    "NoPolicyMatch",
                    "no access policy admits the client",
                    now,
                )
                .await;
        }

        // Highest-priority admission first, then smallest exporter name
        candidates.sort_by(|(a, ea), (b, eb)| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| ea.metadata.name.cmp(&eb.metadata.name))
        });

        let active = self.store.list_active_leases(namespace).await?;
        let holder_of = |exporter_name: &str| {
            active.iter().find(|other| {
                other.metadata.name != lease.metadata.name && other.is_active_on(exporter_name)
            })
        };

        // Free exporters first
        for (admission, exporter) in &candidates {
            let exporter_name = exporter.metadata.name.as_deref().unwrap_or_default();
            if holder_of(exporter_name).is_some() {
                continue;
            }
            if self
                .bind(&lease, admission, exporter_name, requested, now)
                .await?
            {
                self.reconcile_exporter_at(namespace, exporter_name, now).await?;
            }
            return Ok(());
        }

        // Preemption: end a strictly lower-priority spot holder and take its
        // exporter in the same pass
        for (admission, exporter) in &candidates {
            let exporter_name = exporter.metadata.name.as_deref().unwrap_or_default();
            let Some(victim) = holder_of(exporter_name) else {
                continue;
            };
            let victim_status = victim.status.clone().unwrap_or_default();
            if !victim_status.spot_access
                || victim_status.priority.unwrap_or_default() >= admission.priority
            {
                continue;
            }

            info!(
                lease = name,
                victim = victim.metadata.name.as_deref().unwrap_or_default(),
                exporter = exporter_name,
                "preempting lower-priority spot lease"
            );
            self.end_lease(victim, "Preempted", now).await?;
            if self
                .bind(&lease, admission, exporter_name, requested, now)
                .await?
            {
                self.reconcile_exporter_at(namespace, exporter_name, now).await?;
            }
            return Ok(());
        }

        self.mark_pending(&lease, "AllExportersBusy", "all matching exporters are leased", now)
            .await
    }

    /// Assign the exporter and compute the effective window. Returns false
    /// when a concurrent writer won and this pass should simply requeue.
    async fn bind(
        &self,
        lease: &Lease,
        admission: &Admission,
        exporter_name: &str,
        requested_seconds: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, ControllerError> {
        let effective = policy::effective_duration_seconds(requested_seconds, admission);

        let mut updated = lease.clone();
        let mut status = lease.status.clone().unwrap_or_default();
        status.begin_time = Some(now);
        status.end_time = Some(now + Duration::seconds(effective));
        status.exporter_ref = Some(LocalObjectReference::new(exporter_name));
        status.priority = Some(admission.priority);
        status.spot_access = admission.spot_access;
        set_condition(
            &mut status.conditions,
            Condition::new(
                LeaseConditionType::Pending.as_str(),
                ConditionStatus::False,
                "Bound",
                "",
                now,
            ),
        );
        set_condition(
            &mut status.conditions,
            Condition::new(
                LeaseConditionType::Ready.as_str(),
                ConditionStatus::True,
                "Bound",
                format!("assigned exporter {exporter_name}"),
                now,
            ),
        );
        updated.status = Some(status);

        match self.store.update_lease_status(&updated).await {
            Ok(_) => {
                info!(
                    lease = lease.metadata.name.as_deref().unwrap_or_default(),
                    exporter = exporter_name,
                    effective_seconds = effective,
                    "lease bound"
                );
                Ok(true)
            }
            Err(err) if err.is_conflict() => {
                debug!(
                    lease = lease.metadata.name.as_deref().unwrap_or_default(),
                    "binding lost a status update race, requeueing"
                );
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Flip the lease to its terminal ended state. The exporter reference is
    /// retained for record purposes; `ended` is monotonic.
    pub(crate) async fn end_lease(
        &self,
        lease: &Lease,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<(), ControllerError> {
        let namespace = lease.metadata.namespace.as_deref().unwrap_or_default();
        let name = lease.metadata.name.as_deref().unwrap_or_default();

        let mut updated = lease.clone();
        let mut status = lease.status.clone().unwrap_or_default();
        status.ended = true;
        set_condition(
            &mut status.conditions,
            Condition::new(
                LeaseConditionType::Ready.as_str(),
                ConditionStatus::False,
                reason,
                "",
                now,
            ),
        );
        set_condition(
            &mut status.conditions,
            Condition::new(
                LeaseConditionType::Ended.as_str(),
                ConditionStatus::True,
                reason,
                "",
                now,
            ),
        );
        updated.status = Some(status);

        match self.store.update_lease_status(&updated).await {
            Ok(_) => {
                info!(lease = name, reason, "lease ended");
                self.listen_map.remove(namespace, name);
                Ok(())
            }
            Err(err) if err.is_conflict() => {
                debug!(lease = name, "end lost a status update race, requeueing");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn mark_ready(&self, lease: &Lease, now: DateTime<Utc>) -> Result<(), ControllerError> {
        let mut status = lease.status.clone().unwrap_or_default();
        if crds::is_condition_true(&status.conditions, LeaseConditionType::Ready.as_str()) {
            return Ok(());
        }
        set_condition(
            &mut status.conditions,
            Condition::new(
                LeaseConditionType::Ready.as_str(),
                ConditionStatus::True,
                "Bound",
                "",
                now,
            ),
        );
        self.persist_status_if_changed(lease, status).await
    }

    async fn mark_pending(
        &self,
        lease: &Lease,
        reason: &str,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<(), ControllerError> {
        let mut status = lease.status.clone().unwrap_or_default();
        set_condition(
            &mut status.conditions,
            Condition::new(
                LeaseConditionType::Pending.as_str(),
                ConditionStatus::True,
                reason,
                message,
                now,
            ),
        );
        self.persist_status_if_changed(lease, status).await
    }

    async fn mark_unsatisfiable(
        &self,
        lease: &Lease,
        reason: &str,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<(), ControllerError> {
        let mut status = lease.status.clone().unwrap_or_default();
        set_condition(
            &mut status.conditions,
            Condition::new(
                LeaseConditionType::Pending.as_str(),
                ConditionStatus::False,
                reason,
                "",
                now,
            ),
        );
        set_condition(
            &mut status.conditions,
            Condition::new(
                LeaseConditionType::Unsatisfiable.as_str(),
                ConditionStatus::True,
                reason,
                message,
                now,
            ),
        );
        self.persist_status_if_changed(lease, status).await
    }

    /// Write the status back only when it differs; conflicts requeue.
    async fn persist_status_if_changed(
        &self,
        lease: &Lease,
        status: LeaseStatus,
    ) -> Result<(), ControllerError> {
        if lease.status.as_ref() == Some(&status) {
            return Ok(());
        }
        let mut updated = lease.clone();
        updated.status = Some(status);
        match self.store.update_lease_status(&updated).await {
            Ok(_) => Ok(()),
            Err(err) if err.is_conflict() => {
                debug!(
                    lease = lease.metadata.name.as_deref().unwrap_or_default(),
                    "status update lost a race, requeueing"
                );
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }
}

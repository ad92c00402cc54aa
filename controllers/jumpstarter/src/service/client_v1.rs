//! Resource-style client service
//!
//! CRUD on leases and read access to exporters with AIP-style resource
//! names. Updates honour field presence: only fields carried in the request
//! change, and changes are revalidated against the lease time-field law.
//! After binding, the window may only shrink.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use crds::{reconcile_time_fields, Lease, LeaseSpec, LocalObjectReference};
use protocol::client as cpb;
use store::Store;
use uuid::Uuid;

use super::auth::ServiceAuth;
use super::convert;
use super::{RpcError, RpcResult};

pub struct ClientService {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) auth: ServiceAuth,
}

impl ClientService {
    pub fn new(store: Arc<dyn Store>, auth: ServiceAuth) -> Self {
        Self { store, auth }
    }

    /// Namespaced caller check shared by all handlers: the caller must be a
    /// client in the namespace named by the resource.
    async fn auth_client(&self, bearer: &str, namespace: &str) -> RpcResult<crds::Client> {
        let client = self.auth.authenticate_client(bearer).await?;
        if client.metadata.namespace.as_deref() != Some(namespace) {
            return Err(RpcError::permission_denied(
                "caller is not a client in the target namespace",
            ));
        }
        Ok(client)
    }

    pub async fn get_exporter(
        &self,
        bearer: &str,
        request: cpb::GetExporterRequest,
    ) -> RpcResult<cpb::Exporter> {
        let (namespace, name) = cpb::parse_resource_name(&request.name, "exporters")
            .ok_or_else(|| RpcError::invalid_argument("malformed exporter name"))?;
        self.auth_client(bearer, &namespace).await?;

        let exporter = self.store.get_exporter(&namespace, &name).await?;
        Ok(convert::exporter_to_pb(&namespace, &exporter))
    }

    pub async fn list_exporters(
        &self,
        bearer: &str,
        request: cpb::ListExportersRequest,
    ) -> RpcResult<cpb::ListExportersResponse> {
        let namespace = cpb::parse_parent_name(&request.parent)
            .ok_or_else(|| RpcError::invalid_argument("malformed parent name"))?;
        self.auth_client(bearer, &namespace).await?;

        let selector = convert::parse_filter(&request.filter)?;
        let exporters = self.store.list_exporters(&namespace, &selector).await?;
        let (page, next_page_token) =
            paginate(exporters, &request.page_token, request.page_size, |e| {
                e.metadata.name.clone().unwrap_or_default()
            });

        Ok(cpb::ListExportersResponse {
            exporters: page
                .iter()
                .map(|e| convert::exporter_to_pb(&namespace, e))
                .collect(),
            next_page_token,
        })
    }

    pub async fn get_lease(
        &self,
        bearer: &str,
        request: cpb::GetLeaseRequest,
    ) -> RpcResult<cpb::Lease> {
        let (namespace, name) = cpb::parse_resource_name(&request.name, "leases")
            .ok_or_else(|| RpcError::invalid_argument("malformed lease name"))?;
        self.auth_client(bearer, &namespace).await?;

        let lease = self.store.get_lease(&namespace, &name).await?;
        Ok(convert::lease_to_pb(&namespace, &lease))
    }

    pub async fn list_leases(
        &self,
        bearer: &str,
        request: cpb::ListLeasesRequest,
    ) -> RpcResult<cpb::ListLeasesResponse> {
        let namespace = cpb::parse_parent_name(&request.parent)
            .ok_or_else(|| RpcError::invalid_argument("malformed parent name"))?;
        self.auth_client(bearer, &namespace).await?;

        let selector = convert::parse_filter(&request.filter)?;
        let leases: Vec<Lease> = self
            .store
            .list_active_leases(&namespace)
            .await?
            .into_iter()
            .filter(|lease| {
                selector.matches(&lease.metadata.labels.clone().unwrap_or_default())
            })
            .collect();
        let (page, next_page_token) =
            paginate(leases, &request.page_token, request.page_size, |l| {
                l.metadata.name.clone().unwrap_or_default()
            });

        Ok(cpb::ListLeasesResponse {
            leases: page
                .iter()
                .map(|l| convert::lease_to_pb(&namespace, l))
                .collect(),
            next_page_token,
        })
    }

    pub async fn create_lease(
        &self,
        bearer: &str,
        request: cpb::CreateLeaseRequest,
    ) -> RpcResult<cpb::Lease> {
        let namespace = cpb::parse_parent_name(&request.parent)
            .ok_or_else(|| RpcError::invalid_argument("malformed parent name"))?;
        let client = self.auth_client(bearer, &namespace).await?;

        let body = request
            .lease
            .ok_or_else(|| RpcError::invalid_argument("missing lease body"))?;

        let selector = match &body.selector {
            Some(selector) => convert::selector_from_pb(selector)?,
            None => crds::LabelSelector::default(),
        };
        let mut begin_time = timestamp_opt(body.begin_time)?;
        let mut end_time = timestamp_opt(body.end_time)?;
        let mut duration_seconds = body.duration_seconds;
        reconcile_time_fields(&mut begin_time, &mut end_time, &mut duration_seconds)
            .map_err(|e| RpcError::invalid_argument(e.to_string()))?;
        if duration_seconds.is_none() {
            return Err(RpcError::invalid_argument("lease carries no usable duration"));
        }

        let name = Uuid::now_v7().to_string();
        let lease = Lease {
            metadata: kube::core::ObjectMeta {
                name: Some(name),
                namespace: Some(namespace.clone()),
                ..Default::default()
            },
            spec: LeaseSpec {
                client_ref: LocalObjectReference::new(
                    client.metadata.name.clone().unwrap_or_default(),
                ),
                selector,
                duration_seconds,
                begin_time,
                end_time,
                release: false,
            },
            status: None,
        };
        let created = self.store.create_lease(&lease).await?;

        Ok(convert::lease_to_pb(&namespace, &created))
    }

    pub async fn update_lease(
        &self,
        bearer: &str,
        request: cpb::UpdateLeaseRequest,
    ) -> RpcResult<cpb::Lease> {
        let body = request
            .lease
            .ok_or_else(|| RpcError::invalid_argument("missing lease body"))?;
        let (namespace, name) = cpb::parse_resource_name(&body.name, "leases")
            .ok_or_else(|| RpcError::invalid_argument("malformed lease name"))?;
        let client = self.auth_client(bearer, &namespace).await?;

        let mut lease = self.store.get_lease(&namespace, &name).await?;
        if lease.spec.client_ref.name != client.metadata.name.clone().unwrap_or_default() {
            return Err(RpcError::permission_denied("lease not held by client"));
        }
        let status = lease.status.clone().unwrap_or_default();
        if status.ended {
            return Err(RpcError::failed_precondition("lease already ended"));
        }
        let bound = status.exporter_ref.is_some();

        // Field presence: only provided fields change
        if let Some(requested_begin) = timestamp_opt(body.begin_time)? {
            if bound && lease.spec.begin_time != Some(requested_begin) {
                return Err(RpcError::invalid_argument(
                    "cannot update beginTime: lease has already started",
                ));
            }
            lease.spec.begin_time = Some(requested_begin);
        }
        if let Some(seconds) = body.duration_seconds {
            lease.spec.duration_seconds = Some(seconds);
        }
        if let Some(requested_end) = timestamp_opt(body.end_time)? {
            lease.spec.end_time = Some(requested_end);
        }

        // Recalculate the missing field or validate consistency
        let mut begin_time = lease.spec.begin_time;
        let mut end_time = lease.spec.end_time;
        let mut duration_seconds = lease.spec.duration_seconds;
        reconcile_time_fields(&mut begin_time, &mut end_time, &mut duration_seconds)
            .map_err(|e| RpcError::invalid_argument(e.to_string()))?;
        lease.spec.begin_time = begin_time;
        lease.spec.end_time = end_time;
        lease.spec.duration_seconds = duration_seconds;

        // After binding the window may shrink but never grow
        if bound {
            let begin = status
                .begin_time
                .ok_or_else(|| RpcError::internal("bound lease is missing beginTime"))?;
            let current_end = status
                .end_time
                .ok_or_else(|| RpcError::internal("bound lease is missing endTime"))?;
            let new_end = match (lease.spec.end_time, lease.spec.duration_seconds) {
                (Some(end), _) => end,
                (None, Some(seconds)) => begin + chrono::Duration::seconds(seconds),
                (None, None) => current_end,
            };
            if new_end > current_end {
                return Err(RpcError::invalid_argument(
                    "cannot extend a bound lease; request a new one",
                ));
            }
            let updated = self.store.update_lease(&lease).await?;

            let mut shrunk = updated.clone();
            let mut new_status = status;
            new_status.end_time = Some(new_end);
            shrunk.status = Some(new_status);
            let shrunk = self.store.update_lease_status(&shrunk).await?;
            return Ok(convert::lease_to_pb(&namespace, &shrunk));
        }

        let updated = self.store.update_lease(&lease).await?;
        Ok(convert::lease_to_pb(&namespace, &updated))
    }

    /// Delete is a release: the scheduler observes the flag and ends the
    /// lease; actual removal is left to the owner.
    pub async fn delete_lease(
        &self,
        bearer: &str,
        request: cpb::DeleteLeaseRequest,
    ) -> RpcResult<cpb::Empty> {
        let (namespace, name) = cpb::parse_resource_name(&request.name, "leases")
            .ok_or_else(|| RpcError::invalid_argument("malformed lease name"))?;
        let client = self.auth_client(bearer, &namespace).await?;

        let mut lease = self.store.get_lease(&namespace, &name).await?;
        if lease.spec.client_ref.name != client.metadata.name.clone().unwrap_or_default() {
            return Err(RpcError::permission_denied("lease not held by client"));
        }

        lease.spec.release = true;
        self.store.update_lease(&lease).await?;

        Ok(cpb::Empty {})
    }
}

fn timestamp_opt(value: Option<protocol::messages::Timestamp>) -> RpcResult<Option<DateTime<Utc>>> {
    match value {
        Some(ts) => ts
            .to_datetime()
            .map(Some)
            .ok_or_else(|| RpcError::invalid_argument("timestamp out of range")),
        None => Ok(None),
    }
}

/// Name-ordered offset pagination: the page token is the last name of the
/// previous page.
fn paginate<T>(
    mut items: Vec<T>,
    page_token: &str,
    page_size: i32,
    name_of: impl Fn(&T) -> String,
) -> (Vec<T>, String) {
    items.sort_by_key(|item| name_of(item));
    if !page_token.is_empty() {
        items.retain(|item| name_of(item).as_str() > page_token);
    }

    let limit = if page_size > 0 {
        page_size as usize
    } else {
        items.len()
    };
    let has_more = items.len() > limit;
    items.truncate(limit);

    let next = if has_more {
        items.last().map(|item| name_of(item)).unwrap_or_default()
    } else {
        String::new()
    };
    (items, next)
}

//! Controller service handlers
//!
//! Exporter-facing: registration, liveness streaming, listen notifications.
//! Client-facing: dial and thin lease CRUD. Streaming handlers push frames
//! into the per-connection outbound queue and stop on cancellation.

use std::collections::BTreeMap;
use std::sync::Arc;

use auth::TokenService;
use chrono::Utc;
use crds::{Device, Lease, LeaseSpec, LocalObjectReference};
use futures::StreamExt;
use protocol::messages as pb;
use rand::seq::IteratorRandom;
use store::Store;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::auth::ServiceAuth;
use super::convert;
use super::listen::{ListenMap, PushError};
use super::{RpcError, RpcResult};
use crate::config::RouterEntry;

/// Interval between heartbeat refreshes on a Status stream.
const HEARTBEAT_SECONDS: u64 = 10;

/// Controller RPC service state shared across connections.
pub struct ControllerService {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) auth: ServiceAuth,
    pub(crate) tokens: Arc<TokenService>,
    pub(crate) routers: BTreeMap<String, RouterEntry>,
    pub(crate) listen_map: Arc<ListenMap>,
}

impl ControllerService {
    pub fn new(
        store: Arc<dyn Store>,
        auth: ServiceAuth,
        tokens: Arc<TokenService>,
        routers: BTreeMap<String, RouterEntry>,
        listen_map: Arc<ListenMap>,
    ) -> Self {
        Self {
            store,
            auth,
            tokens,
            routers,
            listen_map,
        }
    }

    /// Replace the owner-managed labels and the device report.
    pub async fn register(
        &self,
        bearer: &str,
        request: pb::RegisterRequest,
    ) -> RpcResult<pb::RegisterResponse> {
        let exporter = self.auth.authenticate_exporter(bearer).await?;
        let name = exporter.metadata.name.clone().unwrap_or_default();

        info!(exporter = %name, "registering exporter");

        let mut labels = exporter.metadata.labels.clone().unwrap_or_default();
        labels.retain(|key, _| !key.starts_with(crds::MANAGED_LABEL_PREFIX));
        for (key, value) in &request.labels {
            if key.starts_with(crds::MANAGED_LABEL_PREFIX) {
                labels.insert(key.clone(), value.clone());
            }
        }

        let mut updated = exporter.clone();
        updated.metadata.labels = Some(labels);
        let updated = self.store.update_exporter(&updated).await?;

        let mut status = updated.status.clone().unwrap_or_default();
        status.devices = request
            .reports
            .iter()
            .map(|report| Device {
                uuid: report.uuid.clone(),
                parent_uuid: report.parent_uuid.clone(),
                labels: report
                    .labels
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            })
            .collect();

        let mut with_status = updated;
        with_status.status = Some(status);
        self.store.update_exporter_status(&with_status).await?;

        Ok(pb::RegisterResponse {
            uuid: exporter.metadata.uid.unwrap_or_default(),
        })
    }

    /// Clear the device report; the exporter stays addressable.
    pub async fn unregister(
        &self,
        bearer: &str,
        _request: pb::UnregisterRequest,
    ) -> RpcResult<pb::UnregisterResponse> {
        let exporter = self.auth.authenticate_exporter(bearer).await?;
        let name = exporter.metadata.name.clone().unwrap_or_default();

        let mut status = exporter.status.clone().unwrap_or_default();
        status.devices = Vec::new();

        let mut updated = exporter;
        updated.status = Some(status);
        self.store.update_exporter_status(&updated).await?;

        info!(exporter = %name, "exporter unregistered, reporting no devices");
        Ok(pb::UnregisterResponse {})
    }

    /// Serve dial notifications for one lease held by the exporter.
    pub async fn listen(
        &self,
        bearer: &str,
        request: pb::ListenRequest,
        id: u64,
        out: mpsc::Sender<pb::ControllerReply>,
        cancel: CancellationToken,
    ) -> RpcResult<()> {
        let exporter = self.auth.authenticate_exporter(bearer).await?;
        let namespace = exporter.metadata.namespace.clone().unwrap_or_default();
        let exporter_name = exporter.metadata.name.clone().unwrap_or_default();

        if request.lease_name.is_empty() {
            return Err(RpcError::invalid_argument("empty lease name"));
        }

        let lease = self.store.get_lease(&namespace, &request.lease_name).await?;
        let held = lease
            .status
            .as_ref()
            .and_then(|s| s.exporter_ref.as_ref())
            .is_some_and(|r| r.name == exporter_name);
        if !held {
            return Err(RpcError::permission_denied("lease not held by exporter"));
        }

        let mut queue = self
            .listen_map
            .claim(&namespace, &request.lease_name)
            .ok_or_else(|| {
                RpcError::failed_precondition("another listen stream is already active")
            })?;

        debug!(exporter = %exporter_name, lease = %request.lease_name, "listen stream open");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                message = queue.recv() => match message {
                    Some(message) => {
                        let reply = pb::ControllerReply {
                            id,
                            status: None,
                            eos: false,
                            body: Some(pb::controller_reply::Body::Listen(message)),
                        };
                        if out.send(reply).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }

        self.listen_map.remove(&namespace, &request.lease_name);
        Ok(())
    }

    /// Heartbeat and lease-transition stream for one exporter.
    pub async fn status(
        &self,
        bearer: &str,
        _request: pb::StatusRequest,
        id: u64,
        out: mpsc::Sender<pb::ControllerReply>,
        cancel: CancellationToken,
    ) -> RpcResult<()> {
        let exporter = self.auth.authenticate_exporter(bearer).await?;
        let namespace = exporter.metadata.namespace.clone().unwrap_or_default();
        let name = exporter.metadata.name.clone().unwrap_or_default();

        let mut watch = self.store.watch_exporter(&namespace, &name).await?;

        // The first tick fires immediately, refreshing lastSeen on connect
        let mut ticker =
            tokio::time::interval(std::time::Duration::from_secs(HEARTBEAT_SECONDS));

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(exporter = %name, "status stream terminated normally");
                    break;
                }
                _ = ticker.tick() => {
                    self.touch_last_seen(&namespace, &name).await;
                }
                update = watch.next() => match update {
                    Some(updated) => {
                        let lease_ref = updated
                            .status
                            .as_ref()
                            .and_then(|s| s.lease_ref.as_ref())
                            .map(|r| r.name.clone());
                        let client_name = match &lease_ref {
                            Some(lease_name) => Some(
                                self.store
                                    .get_lease(&namespace, lease_name)
                                    .await?
                                    .spec
                                    .client_ref
                                    .name,
                            ),
                            None => None,
                        };
                        let frame = pb::StatusResponse {
                            leased: lease_ref.is_some(),
                            lease_name: lease_ref,
                            client_name,
                        };
                        let reply = pb::ControllerReply {
                            id,
                            status: None,
                            eos: false,
                            body: Some(pb::controller_reply::Body::Status(frame)),
                        };
                        if out.send(reply).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }

        Ok(())
    }

    async fn touch_last_seen(&self, namespace: &str, name: &str) {
        let exporter = match self.store.get_exporter(namespace, name).await {
            Ok(exporter) => exporter,
            Err(err) => {
                warn!(exporter = name, "unable to refresh lastSeen: {err}");
                return;
            }
        };
        let mut status = exporter.status.clone().unwrap_or_default();
        status.last_seen = Some(Utc::now());
        let mut updated = exporter;
        updated.status = Some(status);
        if let Err(err) = self.store.update_exporter_status(&updated).await {
            warn!(exporter = name, "unable to update lastSeen: {err}");
        }
    }

    /// Issue a router ticket and notify the exporter holding the lease.
    pub async fn dial(&self, bearer: &str, request: pb::DialRequest) -> RpcResult<pb::DialResponse> {
        let client = self.auth.authenticate_client(bearer).await?;
        let namespace = client.metadata.namespace.clone().unwrap_or_default();
        let client_name = client.metadata.name.clone().unwrap_or_default();

        if request.lease_name.is_empty() {
            return Err(RpcError::invalid_argument("empty lease name"));
        }

        let lease = self.store.get_lease(&namespace, &request.lease_name).await?;
        if lease.spec.client_ref.name != client_name {
            return Err(RpcError::permission_denied("lease not held by client"));
        }
        if lease.is_ended() {
            return Err(RpcError::failed_precondition("lease already ended"));
        }

        let stream_id = Uuid::new_v4();
        let token = self
            .tokens
            .sign_router_ticket(&stream_id, Utc::now())
            .map_err(|e| RpcError::internal(format!("unable to sign ticket: {e}")))?;

        let router = self
            .routers
            .values()
            .choose(&mut rand::thread_rng())
            .ok_or_else(|| RpcError::unavailable("no router configured"))?;

        let message = pb::ListenResponse {
            router_endpoint: router.endpoint.clone(),
            router_token: token.clone(),
        };
        match self
            .listen_map
            .push(&namespace, &request.lease_name, message)
        {
            Ok(()) => {}
            Err(PushError::Full) => {
                return Err(RpcError::resource_exhausted("listen queue full"));
            }
            Err(PushError::Closed) => {
                return Err(RpcError::unavailable("listen stream gone"));
            }
        }

        info!(client = %client_name, lease = %request.lease_name, stream = %stream_id, "dial assigned stream");
        Ok(pb::DialResponse {
            router_endpoint: router.endpoint.clone(),
            router_token: token,
        })
    }

    pub async fn get_lease(
        &self,
        bearer: &str,
        request: pb::GetLeaseRequest,
    ) -> RpcResult<pb::GetLeaseResponse> {
        let client = self.auth.authenticate_client(bearer).await?;
        let namespace = client.metadata.namespace.clone().unwrap_or_default();

        let lease = self.store.get_lease(&namespace, &request.name).await?;
        if lease.spec.client_ref.name != client.metadata.name.clone().unwrap_or_default() {
            return Err(RpcError::permission_denied("lease not held by client"));
        }

        let status = lease.status.clone().unwrap_or_default();
        let exporter_uuid = match &status.exporter_ref {
            Some(reference) => Some(
                self.store
                    .get_exporter(&namespace, &reference.name)
                    .await?
                    .metadata
                    .uid
                    .unwrap_or_default(),
            ),
            None => None,
        };

        Ok(pb::GetLeaseResponse {
            duration_seconds: lease.spec.duration_seconds,
            selector: Some(convert::selector_to_pb(&lease.spec.selector)),
            begin_time: status.begin_time.map(pb::Timestamp::from),
            end_time: status.end_time.map(pb::Timestamp::from),
            exporter_uuid,
            conditions: convert::conditions_to_pb(&status.conditions),
            ended: status.ended,
        })
    }

    pub async fn request_lease(
        &self,
        bearer: &str,
        request: pb::RequestLeaseRequest,
    ) -> RpcResult<pb::RequestLeaseResponse> {
        let client = self.auth.authenticate_client(bearer).await?;
        let namespace = client.metadata.namespace.clone().unwrap_or_default();

        if request.duration_seconds <= 0 {
            return Err(RpcError::invalid_argument("duration must be positive"));
        }
        let selector = match &request.selector {
            Some(selector) => convert::selector_from_pb(selector)?,
            None => crds::LabelSelector::default(),
        };

        // UUIDv7 names sort by creation time
        let name = Uuid::now_v7().to_string();
        let lease = Lease {
            metadata: kube::core::ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(namespace),
                ..Default::default()
            },
            spec: LeaseSpec {
                client_ref: LocalObjectReference::new(
                    client.metadata.name.clone().unwrap_or_default(),
                ),
                selector,
                duration_seconds: Some(request.duration_seconds),
                begin_time: None,
                end_time: None,
                release: false,
            },
            status: None,
        };
        self.store.create_lease(&lease).await?;

        Ok(pb::RequestLeaseResponse { name })
    }

    pub async fn release_lease(
        &self,
        bearer: &str,
        request: pb::ReleaseLeaseRequest,
    ) -> RpcResult<pb::ReleaseLeaseResponse> {
        let client = self.auth.authenticate_client(bearer).await?;
        let namespace = client.metadata.namespace.clone().unwrap_or_default();

        let mut lease = self.store.get_lease(&namespace, &request.name).await?;
        if lease.spec.client_ref.name != client.metadata.name.clone().unwrap_or_default() {
            return Err(RpcError::permission_denied("lease not held by client"));
        }

        lease.spec.release = true;
        self.store.update_lease(&lease).await?;

        Ok(pb::ReleaseLeaseResponse {})
    }

    pub async fn list_leases(
        &self,
        bearer: &str,
        _request: pb::ListLeasesRequest,
    ) -> RpcResult<pb::ListLeasesResponse> {
        let client = self.auth.authenticate_client(bearer).await?;
        let namespace = client.metadata.namespace.clone().unwrap_or_default();
        let client_name = client.metadata.name.clone().unwrap_or_default();

        let leases = self.store.list_active_leases(&namespace).await?;
        let names = leases
            .into_iter()
            .filter(|lease| lease.spec.client_ref.name == client_name)
            .filter_map(|lease| lease.metadata.name)
            .collect();

        Ok(pb::ListLeasesResponse { names })
    }
}

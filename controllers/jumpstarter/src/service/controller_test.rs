//! Controller service handler tests against the in-memory store

use std::collections::BTreeMap;
use std::sync::Arc;

use auth::ObjectAuthorizer;
use crds::{Exporter, Lease, LeaseStatus, LocalObjectReference};
use protocol::messages as pb;
use protocol::Code;
use store::{MemoryStore, Store};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::auth::ServiceAuth;
use super::controller::ControllerService;
use super::listen::{ListenMap, LISTEN_QUEUE_DEPTH};
use crate::config::RouterEntry;
use crate::test_utils::*;

struct Fixture {
    store: Arc<MemoryStore>,
    service: Arc<ControllerService>,
    tokens: Arc<auth::TokenService>,
    listen_map: Arc<ListenMap>,
}

fn fixture() -> Fixture {
    let store = Arc::new(MemoryStore::new());
    let store_dyn: Arc<dyn Store> = store.clone();
    let tokens = test_token_service();
    let listen_map = Arc::new(ListenMap::new());

    let routers = BTreeMap::from([(
        "default".to_string(),
        RouterEntry {
            endpoint: "router.test:8083".to_string(),
            labels: BTreeMap::new(),
        },
    )]);

    let auth = ServiceAuth::new(
        store_dyn.clone(),
        tokens.clone(),
        Arc::new(ObjectAuthorizer::Basic),
        None,
        TEST_NAMESPACE.to_string(),
    );
    let service = Arc::new(ControllerService::new(
        store_dyn,
        auth,
        tokens.clone(),
        routers,
        listen_map.clone(),
    ));

    Fixture {
        store,
        service,
        tokens,
        listen_map,
    }
}

fn bearer_for(tokens: &auth::TokenService, kind: &str, object: &kube::core::ObjectMeta) -> String {
    tokens
        .sign_object_token(
            kind,
            object.namespace.as_deref().unwrap_or_default(),
            object.name.as_deref().unwrap_or_default(),
            object.uid.as_deref().unwrap_or_default(),
        )
        .unwrap()
}

async fn bound_lease(store: &Arc<MemoryStore>, name: &str, client: &str, exporter: &str) -> Lease {
    let lease = store
        .create_lease(&test_lease(name, client, &[], 600))
        .await
        .unwrap();
    let mut bound = lease.clone();
    bound.status = Some(LeaseStatus {
        exporter_ref: Some(LocalObjectReference::new(exporter)),
        ..Default::default()
    });
    store.update_lease_status(&bound).await.unwrap()
}

#[tokio::test]
async fn test_register_replaces_managed_labels_and_devices() {
    let f = fixture();
    let exporter = f.store.insert_exporter({
        let mut e = test_exporter("exporter1", &[("dut", "a")]);
        e.metadata
            .labels
            .as_mut()
            .unwrap()
            .insert("jumpstarter.dev/stale".to_string(), "old".to_string());
        e
    });
    let bearer = bearer_for(&f.tokens, "Exporter", &exporter.metadata);

    let response = f
        .service
        .register(
            &bearer,
            pb::RegisterRequest {
                labels: [
                    ("jumpstarter.dev/board".to_string(), "rpi4".to_string()),
                    ("unmanaged".to_string(), "ignored".to_string()),
                ]
                .into(),
                reports: vec![pb::DeviceReport {
                    uuid: "device-1".to_string(),
                    parent_uuid: None,
                    labels: Default::default(),
                }],
            },
        )
        .await
        .unwrap();
    assert_eq!(Some(response.uuid), exporter.metadata.uid);

    let updated = get_exporter(&f.store, "exporter1").await;
    let labels = updated.labels();
    // User-managed labels untouched, managed set replaced wholesale
    assert_eq!(labels.get("dut"), Some(&"a".to_string()));
    assert_eq!(labels.get("jumpstarter.dev/board"), Some(&"rpi4".to_string()));
    assert!(!labels.contains_key("jumpstarter.dev/stale"));
    assert!(!labels.contains_key("unmanaged"));

    let devices = updated.status.unwrap().devices;
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].uuid, "device-1");
}

#[tokio::test]
async fn test_unregister_clears_devices() {
    let f = fixture();
    let exporter = f.store.insert_exporter(test_exporter("exporter1", &[]));
    let bearer = bearer_for(&f.tokens, "Exporter", &exporter.metadata);

    f.service
        .register(
            &bearer,
            pb::RegisterRequest {
                labels: Default::default(),
                reports: vec![pb::DeviceReport {
                    uuid: "device-1".to_string(),
                    parent_uuid: None,
                    labels: Default::default(),
                }],
            },
        )
        .await
        .unwrap();

    f.service
        .unregister(&bearer, pb::UnregisterRequest {})
        .await
        .unwrap();

    let updated: Exporter = get_exporter(&f.store, "exporter1").await;
    assert!(updated.status.unwrap().devices.is_empty());
}

#[tokio::test]
async fn test_register_rejects_unknown_exporter() {
    let f = fixture();
    let bearer = f
        .tokens
        .sign_object_token("Exporter", TEST_NAMESPACE, "ghost", "no-such-uid")
        .unwrap();

    let err = f
        .service
        .register(&bearer, pb::RegisterRequest::default())
        .await
        .unwrap_err();
    assert_eq!(err.code, Code::Unauthenticated);
}

#[tokio::test]
async fn test_register_rejects_recreated_uid() {
    let f = fixture();
    let exporter = f.store.insert_exporter(test_exporter("exporter1", &[]));
    let bearer = f
        .tokens
        .sign_object_token("Exporter", TEST_NAMESPACE, "exporter1", "stale-uid")
        .unwrap();
    assert_ne!(exporter.metadata.uid.as_deref(), Some("stale-uid"));

    let err = f
        .service
        .register(&bearer, pb::RegisterRequest::default())
        .await
        .unwrap_err();
    assert_eq!(err.code, Code::Unauthenticated);
}

#[tokio::test]
async fn test_dial_returns_ticket_and_notifies_listen_queue() {
    let f = fixture();
    let client = f.store.insert_client(test_client("client1", &[]));
    f.store.insert_exporter(test_exporter("exporter1", &[]));
    bound_lease(&f.store, "lease1", "client1", "exporter1").await;

    let bearer = bearer_for(&f.tokens, "Client", &client.metadata);
    let response = f
        .service
        .dial(
            &bearer,
            pb::DialRequest {
                lease_name: "lease1".to_string(),
            },
        )
        .await
        .unwrap();

    assert_eq!(response.router_endpoint, "router.test:8083");
    // The ticket names a stream and verifies under the router key
    f.tokens.verify_router_ticket(&response.router_token).unwrap();

    // The exporter side receives the same coordinates
    let mut queue = f.listen_map.claim(TEST_NAMESPACE, "lease1").unwrap();
    let pushed = queue.try_recv().unwrap();
    assert_eq!(pushed.router_endpoint, response.router_endpoint);
    assert_eq!(pushed.router_token, response.router_token);
}

#[tokio::test]
async fn test_dial_denied_when_lease_not_held() {
    let f = fixture();
    let intruder = f.store.insert_client(test_client("intruder", &[]));
    f.store.insert_client(test_client("client1", &[]));
    f.store.insert_exporter(test_exporter("exporter1", &[]));
    bound_lease(&f.store, "lease1", "client1", "exporter1").await;

    let bearer = bearer_for(&f.tokens, "Client", &intruder.metadata);
    let err = f
        .service
        .dial(
            &bearer,
            pb::DialRequest {
                lease_name: "lease1".to_string(),
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code, Code::PermissionDenied);
}

#[tokio::test]
async fn test_dial_on_ended_lease_fails_precondition() {
    let f = fixture();
    let client = f.store.insert_client(test_client("client1", &[]));
    f.store.insert_exporter(test_exporter("exporter1", &[]));
    let lease = bound_lease(&f.store, "lease1", "client1", "exporter1").await;

    let mut ended = lease.clone();
    let mut status = ended.status.clone().unwrap();
    status.ended = true;
    ended.status = Some(status);
    f.store.update_lease_status(&ended).await.unwrap();

    let bearer = bearer_for(&f.tokens, "Client", &client.metadata);
    let err = f
        .service
        .dial(
            &bearer,
            pb::DialRequest {
                lease_name: "lease1".to_string(),
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code, Code::FailedPrecondition);
}

#[tokio::test]
async fn test_dial_overflow_is_resource_exhausted() {
    let f = fixture();
    let client = f.store.insert_client(test_client("client1", &[]));
    f.store.insert_exporter(test_exporter("exporter1", &[]));
    bound_lease(&f.store, "lease1", "client1", "exporter1").await;

    let bearer = bearer_for(&f.tokens, "Client", &client.metadata);
    let request = pb::DialRequest {
        lease_name: "lease1".to_string(),
    };
    for _ in 0..LISTEN_QUEUE_DEPTH {
        f.service.dial(&bearer, request.clone()).await.unwrap();
    }

    let err = f.service.dial(&bearer, request).await.unwrap_err();
    assert_eq!(err.code, Code::ResourceExhausted);
}

#[tokio::test]
async fn test_listen_stream_delivers_dials_until_cancelled() {
    let f = fixture();
    let client = f.store.insert_client(test_client("client1", &[]));
    let exporter = f.store.insert_exporter(test_exporter("exporter1", &[]));
    bound_lease(&f.store, "lease1", "client1", "exporter1").await;

    let exporter_bearer = bearer_for(&f.tokens, "Exporter", &exporter.metadata);
    let (out_tx, mut out_rx) = mpsc::channel(8);
    let cancel = CancellationToken::new();

    let listen = {
        let service = f.service.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            service
                .listen(
                    &exporter_bearer,
                    pb::ListenRequest {
                        lease_name: "lease1".to_string(),
                    },
                    1,
                    out_tx,
                    cancel,
                )
                .await
        })
    };

    // Give the stream a moment to claim the queue, then dial
    tokio::task::yield_now().await;
    let client_bearer = bearer_for(&f.tokens, "Client", &client.metadata);
    f.service
        .dial(
            &client_bearer,
            pb::DialRequest {
                lease_name: "lease1".to_string(),
            },
        )
        .await
        .unwrap();

    let reply = tokio::time::timeout(std::time::Duration::from_secs(5), out_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply.id, 1);
    assert!(matches!(
        reply.body,
        Some(pb::controller_reply::Body::Listen(ref m)) if m.router_endpoint == "router.test:8083"
    ));

    cancel.cancel();
    listen.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_listen_denied_when_lease_not_held_by_exporter() {
    let f = fixture();
    f.store.insert_client(test_client("client1", &[]));
    let other = f.store.insert_exporter(test_exporter("other-exporter", &[]));
    f.store.insert_exporter(test_exporter("exporter1", &[]));
    bound_lease(&f.store, "lease1", "client1", "exporter1").await;

    let bearer = bearer_for(&f.tokens, "Exporter", &other.metadata);
    let (out_tx, _out_rx) = mpsc::channel(8);
    let err = f
        .service
        .listen(
            &bearer,
            pb::ListenRequest {
                lease_name: "lease1".to_string(),
            },
            1,
            out_tx,
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code, Code::PermissionDenied);
}

#[tokio::test]
async fn test_request_list_get_release_lease_flow() {
    let f = fixture();
    let client = f.store.insert_client(test_client("client1", &[]));
    let bearer = bearer_for(&f.tokens, "Client", &client.metadata);

    let created = f
        .service
        .request_lease(
            &bearer,
            pb::RequestLeaseRequest {
                selector: Some(pb::LabelSelector {
                    match_labels: [("dut".to_string(), "a".to_string())].into(),
                    match_expressions: Vec::new(),
                }),
                duration_seconds: 60,
            },
        )
        .await
        .unwrap();

    let listed = f
        .service
        .list_leases(&bearer, pb::ListLeasesRequest {})
        .await
        .unwrap();
    assert_eq!(listed.names, vec![created.name.clone()]);

    let fetched = f
        .service
        .get_lease(
            &bearer,
            pb::GetLeaseRequest {
                name: created.name.clone(),
            },
        )
        .await
        .unwrap();
    assert_eq!(fetched.duration_seconds, Some(60));
    assert!(!fetched.ended);

    f.service
        .release_lease(
            &bearer,
            pb::ReleaseLeaseRequest {
                name: created.name.clone(),
            },
        )
        .await
        .unwrap();

    let lease = f
        .store
        .get_lease(TEST_NAMESPACE, &created.name)
        .await
        .unwrap();
    assert!(lease.spec.release);
}

#[tokio::test]
async fn test_request_lease_rejects_non_positive_duration() {
    let f = fixture();
    let client = f.store.insert_client(test_client("client1", &[]));
    let bearer = bearer_for(&f.tokens, "Client", &client.metadata);

    let err = f
        .service
        .request_lease(
            &bearer,
            pb::RequestLeaseRequest {
                selector: None,
                duration_seconds: 0,
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code, Code::InvalidArgument);
}

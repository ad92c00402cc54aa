//! Framed TCP listener and per-connection dispatch
//!
//! Requests are multiplexed over one connection by id. Unary handlers run
//! as independent tasks and answer with a single terminal reply; streaming
//! handlers (`Listen`, `Status`) keep emitting replies under their request
//! id until a `Cancel` arrives or the connection closes. A single writer
//! task owns the sink so replies never interleave mid-frame.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use prost::Message;
use protocol::messages as pb;
use protocol::{FrameCodec, ProtocolError};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::client_v1::ClientService;
use super::controller::ControllerService;
use super::{RpcError, RpcResult};
use crate::config::Keepalive;
use crate::error::ControllerError;

/// Connection lifetime limits derived from the keepalive configuration.
#[derive(Debug, Clone, Default)]
pub struct ConnectionLimits {
    pub idle: Option<std::time::Duration>,
    pub max_age: Option<std::time::Duration>,
}

impl From<&Keepalive> for ConnectionLimits {
    fn from(keepalive: &Keepalive) -> Self {
        Self {
            idle: keepalive
                .max_connection_idle_seconds
                .map(std::time::Duration::from_secs),
            max_age: keepalive
                .max_connection_age_seconds
                .map(std::time::Duration::from_secs),
        }
    }
}

/// Accept loop for the controller service.
pub async fn serve_controller(
    listener: TcpListener,
    controller: Arc<ControllerService>,
    client_v1: Arc<ClientService>,
    limits: ConnectionLimits,
) -> Result<(), ControllerError> {
    loop {
        let (socket, peer) = listener.accept().await?;
        debug!(%peer, "controller connection accepted");
        let controller = controller.clone();
        let client_v1 = client_v1.clone();
        let limits = limits.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(socket, controller, client_v1, limits).await {
                debug!(%peer, "controller connection closed: {err}");
            }
        });
    }
}

type StreamTable = Arc<Mutex<HashMap<u64, CancellationToken>>>;

async fn handle_connection(
    socket: TcpStream,
    controller: Arc<ControllerService>,
    client_v1: Arc<ClientService>,
    limits: ConnectionLimits,
) -> Result<(), ControllerError> {
    let framed = Framed::new(socket, FrameCodec::new());
    let (mut sink, mut inbound) = framed.split();

    let (out_tx, mut out_rx) = mpsc::channel::<pb::ControllerReply>(32);
    let writer = tokio::spawn(async move {
        while let Some(reply) = out_rx.recv().await {
            if sink.send(Bytes::from(reply.encode_to_vec())).await.is_err() {
                break;
            }
        }
    });

    let streams: StreamTable = Arc::new(Mutex::new(HashMap::new()));
    let deadline = limits.max_age.map(|age| tokio::time::Instant::now() + age);

    let result = loop {
        if deadline.is_some_and(|d| tokio::time::Instant::now() >= d) {
            debug!("connection reached maximum age");
            break Ok(());
        }

        let frame = match limits.idle {
            Some(idle) => match tokio::time::timeout(idle, inbound.next()).await {
                Ok(frame) => frame,
                Err(_) => {
                    debug!("connection idle, closing");
                    break Ok(());
                }
            },
            None => inbound.next().await,
        };

        match frame {
            None => break Ok(()),
            Some(Err(err)) => break Err(err.into()),
            Some(Ok(bytes)) => match pb::ControllerRequest::decode(bytes.as_ref()) {
                Ok(request) => {
                    dispatch(request, &controller, &client_v1, &out_tx, &streams);
                }
                Err(err) => break Err(ProtocolError::from(err).into()),
            },
        }
    };

    // Connection teardown cancels every open stream and releases their
    // listen-queue claims
    for (_, token) in streams.lock().unwrap().drain() {
        token.cancel();
    }
    drop(out_tx);
    let _ = writer.await;
    result
}

fn dispatch(
    request: pb::ControllerRequest,
    controller: &Arc<ControllerService>,
    client_v1: &Arc<ClientService>,
    out_tx: &mpsc::Sender<pb::ControllerReply>,
    streams: &StreamTable,
) {
    use pb::controller_reply::Body as Rep;
    use pb::controller_request::Body as Req;

    let id = request.id;
    let bearer = request.bearer;
    let Some(body) = request.body else {
        let out = out_tx.clone();
        tokio::spawn(async move {
            send_terminal(
                &out,
                id,
                Err(RpcError::invalid_argument("missing request body")),
            )
            .await;
        });
        return;
    };

    match body {
        Req::Cancel(cancel) => {
            if let Some(token) = streams.lock().unwrap().remove(&cancel.id) {
                token.cancel();
            }
        }

        Req::Listen(req) => {
            let token = CancellationToken::new();
            streams.lock().unwrap().insert(id, token.clone());
            let controller = controller.clone();
            let out = out_tx.clone();
            let streams = streams.clone();
            tokio::spawn(async move {
                let result = controller.listen(&bearer, req, id, out.clone(), token).await;
                streams.lock().unwrap().remove(&id);
                send_terminal(&out, id, result.map(|()| None)).await;
            });
        }

        Req::Status(req) => {
            let token = CancellationToken::new();
            streams.lock().unwrap().insert(id, token.clone());
            let controller = controller.clone();
            let out = out_tx.clone();
            let streams = streams.clone();
            tokio::spawn(async move {
                let result = controller.status(&bearer, req, id, out.clone(), token).await;
                streams.lock().unwrap().remove(&id);
                send_terminal(&out, id, result.map(|()| None)).await;
            });
        }

        Req::Register(req) => {
            let controller = controller.clone();
            spawn_unary(out_tx, id, async move {
                controller.register(&bearer, req).await.map(Rep::Register)
            });
        }
        Req::Unregister(req) => {
            let controller = controller.clone();
            spawn_unary(out_tx, id, async move {
                controller.unregister(&bearer, req).await.map(Rep::Unregister)
            });
        }
        Req::Dial(req) => {
            let controller = controller.clone();
            spawn_unary(out_tx, id, async move {
                controller.dial(&bearer, req).await.map(Rep::Dial)
            });
        }
        Req::GetLease(req) => {
            let controller = controller.clone();
            spawn_unary(out_tx, id, async move {
                controller.get_lease(&bearer, req).await.map(Rep::GetLease)
            });
        }
        Req::RequestLease(req) => {
            let controller = controller.clone();
            spawn_unary(out_tx, id, async move {
                controller
                    .request_lease(&bearer, req)
                    .await
                    .map(Rep::RequestLease)
            });
        }
        Req::ReleaseLease(req) => {
            let controller = controller.clone();
            spawn_unary(out_tx, id, async move {
                controller
                    .release_lease(&bearer, req)
                    .await
                    .map(Rep::ReleaseLease)
            });
        }
        Req::ListLeases(req) => {
            let controller = controller.clone();
            spawn_unary(out_tx, id, async move {
                controller
                    .list_leases(&bearer, req)
                    .await
                    .map(Rep::ListLeases)
            });
        }

        Req::ClientGetExporter(req) => {
            let client_v1 = client_v1.clone();
            spawn_unary(out_tx, id, async move {
                client_v1
                    .get_exporter(&bearer, req)
                    .await
                    .map(Rep::ClientExporter)
            });
        }
        Req::ClientListExporters(req) => {
            let client_v1 = client_v1.clone();
            spawn_unary(out_tx, id, async move {
                client_v1
                    .list_exporters(&bearer, req)
                    .await
                    .map(Rep::ClientListExporters)
            });
        }
        Req::ClientGetLease(req) => {
            let client_v1 = client_v1.clone();
            spawn_unary(out_tx, id, async move {
                client_v1.get_lease(&bearer, req).await.map(Rep::ClientLease)
            });
        }
        Req::ClientListLeases(req) => {
            let client_v1 = client_v1.clone();
            spawn_unary(out_tx, id, async move {
                client_v1
                    .list_leases(&bearer, req)
                    .await
                    .map(Rep::ClientListLeases)
            });
        }
        Req::ClientCreateLease(req) => {
            let client_v1 = client_v1.clone();
            spawn_unary(out_tx, id, async move {
                client_v1
                    .create_lease(&bearer, req)
                    .await
                    .map(Rep::ClientLease)
            });
        }
        Req::ClientUpdateLease(req) => {
            let client_v1 = client_v1.clone();
            spawn_unary(out_tx, id, async move {
                client_v1
                    .update_lease(&bearer, req)
                    .await
                    .map(Rep::ClientLease)
            });
        }
        Req::ClientDeleteLease(req) => {
            let client_v1 = client_v1.clone();
            spawn_unary(out_tx, id, async move {
                client_v1
                    .delete_lease(&bearer, req)
                    .await
                    .map(Rep::ClientEmpty)
            });
        }
    }
}

fn spawn_unary<F>(out_tx: &mpsc::Sender<pb::ControllerReply>, id: u64, handler: F)
where
    F: Future<Output = RpcResult<pb::controller_reply::Body>> + Send + 'static,
{
    let out = out_tx.clone();
    tokio::spawn(async move {
        let result = handler.await.map(Some);
        send_terminal(&out, id, result).await;
    });
}

async fn send_terminal(
    out: &mpsc::Sender<pb::ControllerReply>,
    id: u64,
    result: RpcResult<Option<pb::controller_reply::Body>>,
) {
    let reply = match result {
        Ok(body) => pb::ControllerReply {
            id,
            status: Some(pb::Status::ok()),
            eos: true,
            body,
        },
        Err(err) => {
            warn!(request = id, "rpc failed: {err}");
            pb::ControllerReply {
                id,
                status: Some(err.to_status()),
                eos: true,
                body: None,
            }
        }
    };
    let _ = out.send(reply).await;
}

//! Router service: a two-party byte relay
//!
//! Each logical stream is named by the UUID inside a router ticket. The
//! first party to authenticate under a stream name parks itself; the second
//! is spliced to it; a third is rejected. Frames are relayed byte-identical
//! and in order per direction. `RST_STREAM` and `GOAWAY` propagate to both
//! sides and end the pairing, as does either side disconnecting. Nothing is
//! persisted; a router restart drops all pending halves and both parties
//! re-dial.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use auth::{TokenService, ROUTER_TICKET_LIFETIME_SECONDS};
use bytes::Bytes;
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use prost::Message;
use protocol::messages as pb;
use protocol::{Code, FrameCodec, ProtocolError};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ControllerError;

/// Frames a waiting half may queue before its peer arrives.
const EARLY_FRAME_BUFFER: usize = 32;

/// Outbound queue depth per connection.
const OUTBOUND_DEPTH: usize = 32;

type FrameSender = mpsc::Sender<pb::StreamFrame>;

/// Handles the second arrival passes back to the first.
struct PeerHandles {
    out_tx: FrameSender,
}

struct WaitingHalf {
    peer_slot: oneshot::Sender<PeerHandles>,
    out_tx: FrameSender,
    cancel: CancellationToken,
    registered_at: tokio::time::Instant,
}

enum StreamSlot {
    Waiting(WaitingHalf),
    Paired,
}

/// Outcome of announcing a connection under a stream name.
pub(crate) enum Arrival {
    /// Nobody here yet; wait for the peer's handles
    First {
        peer_rx: oneshot::Receiver<PeerHandles>,
        cancel: CancellationToken,
    },
    /// Peer was waiting; relay into its outbound queue
    Second {
        peer_tx: FrameSender,
        cancel: CancellationToken,
    },
    /// Stream already has both parties
    Conflict,
}

/// Process-local pairing state plus ticket verification.
pub struct RouterService {
    tokens: Arc<TokenService>,
    pending: Mutex<HashMap<String, StreamSlot>>,
}

impl RouterService {
    pub fn new(tokens: Arc<TokenService>) -> Self {
        Self {
            tokens,
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn register(&self, stream_name: &str, out_tx: FrameSender) -> Arrival {
        let mut pending = self.pending.lock().unwrap();
        match pending.remove(stream_name) {
            None => {
                let (peer_slot, peer_rx) = oneshot::channel();
                let cancel = CancellationToken::new();
                pending.insert(
                    stream_name.to_string(),
                    StreamSlot::Waiting(WaitingHalf {
                        peer_slot,
                        out_tx,
                        cancel: cancel.clone(),
                        registered_at: tokio::time::Instant::now(),
                    }),
                );
                Arrival::First { peer_rx, cancel }
            }
            Some(StreamSlot::Waiting(half)) => {
                let cancel = half.cancel.clone();
                let peer_tx = half.out_tx.clone();
                pending.insert(stream_name.to_string(), StreamSlot::Paired);
                if half.peer_slot.send(PeerHandles { out_tx }).is_err() {
                    // First half died between parking and pairing
                    pending.remove(stream_name);
                    cancel.cancel();
                    return Arrival::Conflict;
                }
                Arrival::Second { peer_tx, cancel }
            }
            Some(StreamSlot::Paired) => {
                pending.insert(stream_name.to_string(), StreamSlot::Paired);
                Arrival::Conflict
            }
        }
    }

    /// Remove the pairing entry; called by whichever side exits, idempotent.
    fn finish(&self, stream_name: &str) {
        self.pending.lock().unwrap().remove(stream_name);
    }

    /// Drop waiting halves older than the ticket lifetime.
    pub fn sweep(&self, max_age: tokio::time::Duration) {
        let now = tokio::time::Instant::now();
        let mut pending = self.pending.lock().unwrap();
        pending.retain(|stream_name, slot| match slot {
            StreamSlot::Waiting(half) => {
                if now.duration_since(half.registered_at) >= max_age {
                    debug!(stream = %stream_name, "dropping expired pending half");
                    half.cancel.cancel();
                    false
                } else {
                    true
                }
            }
            StreamSlot::Paired => true,
        });
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// Periodic garbage collection of expired pending halves.
    pub async fn run_gc(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(60));
        let max_age = std::time::Duration::from_secs(ROUTER_TICKET_LIFETIME_SECONDS as u64);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.sweep(max_age),
            }
        }
    }
}

/// Accept loop for the router service.
pub async fn serve_router(
    listener: TcpListener,
    service: Arc<RouterService>,
) -> Result<(), ControllerError> {
    loop {
        let (socket, peer) = listener.accept().await?;
        debug!(%peer, "router connection accepted");
        let service = service.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(service, socket).await {
                debug!(%peer, "router connection closed: {err}");
            }
        });
    }
}

async fn handle_connection(
    service: Arc<RouterService>,
    socket: TcpStream,
) -> Result<(), ControllerError> {
    let framed = Framed::new(socket, FrameCodec::new());
    let (mut sink, mut inbound) = framed.split();

    // The first message must be an authenticated hello
    let hello = match inbound.next().await {
        Some(Ok(bytes)) => match pb::RouterMessage::decode(bytes.as_ref()) {
            Ok(pb::RouterMessage {
                body: Some(pb::router_message::Body::Hello(hello)),
            }) => hello,
            Ok(_) | Err(_) => {
                send_status(
                    &mut sink,
                    Code::InvalidArgument,
                    "expected hello as the first message",
                )
                .await;
                return Ok(());
            }
        },
        _ => return Ok(()),
    };

    let stream_name = match service.tokens.verify_router_ticket(&hello.bearer) {
        Ok(subject) => subject,
        Err(err) => {
            warn!("router authentication failed: {err}");
            send_status(&mut sink, Code::Unauthenticated, "invalid router ticket").await;
            return Ok(());
        }
    };

    let (out_tx, mut out_rx) = mpsc::channel::<pb::StreamFrame>(OUTBOUND_DEPTH);

    match service.register(&stream_name, out_tx) {
        Arrival::Conflict => {
            info!(stream = %stream_name, "rejecting third arrival");
            send_status(&mut sink, Code::FailedPrecondition, "stream already paired").await;
            Ok(())
        }
        Arrival::First { peer_rx, cancel } => {
            info!(stream = %stream_name, "waiting for the other side");
            let writer = tokio::spawn(async move {
                while let Some(frame) = out_rx.recv().await {
                    let message = pb::RouterMessage::frame(frame);
                    if sink
                        .send(Bytes::from(message.encode_to_vec()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            });
            let result = run_waiting(&service, &stream_name, &mut inbound, peer_rx, cancel).await;
            let _ = writer.await;
            result
        }
        Arrival::Second { peer_tx, cancel } => {
            info!(stream = %stream_name, "forwarding");
            let writer = tokio::spawn(async move {
                while let Some(frame) = out_rx.recv().await {
                    let message = pb::RouterMessage::frame(frame);
                    if sink
                        .send(Bytes::from(message.encode_to_vec()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            });
            let result = run_relay(&service, &stream_name, &mut inbound, peer_tx, cancel).await;
            let _ = writer.await;
            result
        }
    }
}

type Inbound = SplitStream<Framed<TcpStream, FrameCodec>>;

/// Park until the peer arrives, buffering a bounded number of early frames.
async fn run_waiting(
    service: &RouterService,
    stream_name: &str,
    inbound: &mut Inbound,
    mut peer_rx: oneshot::Receiver<PeerHandles>,
    cancel: CancellationToken,
) -> Result<(), ControllerError> {
    let mut buffered: Vec<pb::StreamFrame> = Vec::new();

    let peer_tx = loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                service.finish(stream_name);
                return Ok(());
            }
            peer = &mut peer_rx => match peer {
                Ok(handles) => break handles.out_tx,
                Err(_) => {
                    service.finish(stream_name);
                    return Ok(());
                }
            },
            frame = inbound.next() => match frame {
                Some(Ok(bytes)) => {
                    if let Some(frame) = decode_frame(&bytes)? {
                        if buffered.len() >= EARLY_FRAME_BUFFER {
                            cancel.cancel();
                            service.finish(stream_name);
                            return Ok(());
                        }
                        buffered.push(frame);
                    }
                }
                _ => {
                    cancel.cancel();
                    service.finish(stream_name);
                    return Ok(());
                }
            },
        }
    };

    for frame in buffered {
        let terminal = frame.is_terminal();
        if peer_tx.send(frame).await.is_err() || terminal {
            cancel.cancel();
            service.finish(stream_name);
            return Ok(());
        }
    }

    run_relay(service, stream_name, inbound, peer_tx, cancel).await
}

/// Copy inbound frames into the peer's outbound queue until the pairing
/// ends.
async fn run_relay(
    service: &RouterService,
    stream_name: &str,
    inbound: &mut Inbound,
    peer_tx: FrameSender,
    cancel: CancellationToken,
) -> Result<(), ControllerError> {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            frame = inbound.next() => match frame {
                Some(Ok(bytes)) => match decode_frame(&bytes) {
                    Ok(Some(frame)) => {
                        let terminal = frame.is_terminal();
                        if peer_tx.send(frame).await.is_err() {
                            cancel.cancel();
                            break;
                        }
                        if terminal {
                            // Abort and drain end the pairing on both sides
                            cancel.cancel();
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(_) => {
                        cancel.cancel();
                        break;
                    }
                },
                _ => {
                    cancel.cancel();
                    break;
                }
            },
        }
    }

    service.finish(stream_name);
    Ok(())
}

fn decode_frame(bytes: &Bytes) -> Result<Option<pb::StreamFrame>, ProtocolError> {
    let message = pb::RouterMessage::decode(bytes.as_ref())?;
    match message.body {
        Some(pb::router_message::Body::Frame(frame)) => Ok(Some(frame)),
        // Hello or status after the handshake carries nothing to relay
        _ => Ok(None),
    }
}

async fn send_status(
    sink: &mut futures::stream::SplitSink<Framed<TcpStream, FrameCodec>, Bytes>,
    code: Code,
    message: &str,
) {
    let status = pb::RouterMessage::status(pb::Status::new(code, message));
    let _ = sink.send(Bytes::from(status.encode_to_vec())).await;
}

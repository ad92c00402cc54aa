//! Router splice tests over a local listener

use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use prost::Message;
use protocol::messages as pb;
use protocol::{Code, FrameCodec};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use uuid::Uuid;

use super::router::{serve_router, RouterService};
use crate::test_utils::test_token_service;

type Conn = Framed<TcpStream, FrameCodec>;

async fn start_router() -> (String, Arc<RouterService>, Arc<auth::TokenService>) {
    let tokens = test_token_service();
    let service = Arc::new(RouterService::new(tokens.clone()));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let server = service.clone();
    tokio::spawn(async move {
        let _ = serve_router(listener, server).await;
    });
    (addr, service, tokens)
}

async fn connect(addr: &str, ticket: &str) -> Conn {
    let socket = TcpStream::connect(addr).await.unwrap();
    let mut framed = Framed::new(socket, FrameCodec::new());
    framed
        .send(Bytes::from(
            pb::RouterMessage::hello(ticket).encode_to_vec(),
        ))
        .await
        .unwrap();
    framed
}

async fn send_frame(conn: &mut Conn, frame: pb::StreamFrame) {
    conn.send(Bytes::from(pb::RouterMessage::frame(frame).encode_to_vec()))
        .await
        .unwrap();
}

async fn recv_message(conn: &mut Conn) -> Option<pb::RouterMessage> {
    let frame = tokio::time::timeout(std::time::Duration::from_secs(5), conn.next())
        .await
        .expect("timed out waiting for router message")?;
    Some(pb::RouterMessage::decode(frame.unwrap().as_ref()).unwrap())
}

fn expect_data(message: Option<pb::RouterMessage>) -> Vec<u8> {
    match message.and_then(|m| m.body) {
        Some(pb::router_message::Body::Frame(frame)) => {
            assert_eq!(frame.frame_type, pb::FrameType::Data as i32);
            frame.payload
        }
        other => panic!("expected data frame, got {other:?}"),
    }
}

#[tokio::test]
async fn test_splice_relays_bytes_in_order_both_directions() {
    let (addr, _service, tokens) = start_router().await;
    let ticket = tokens
        .sign_router_ticket(&Uuid::new_v4(), Utc::now())
        .unwrap();

    let mut a = connect(&addr, &ticket).await;
    let mut b = connect(&addr, &ticket).await;

    send_frame(&mut a, pb::StreamFrame::data(vec![1, 2, 3])).await;
    send_frame(&mut a, pb::StreamFrame::data((0..=255).collect())).await;

    assert_eq!(expect_data(recv_message(&mut b).await), vec![1, 2, 3]);
    assert_eq!(
        expect_data(recv_message(&mut b).await),
        (0..=255).collect::<Vec<u8>>()
    );

    send_frame(&mut b, pb::StreamFrame::data(vec![9, 9])).await;
    assert_eq!(expect_data(recv_message(&mut a).await), vec![9, 9]);
}

#[tokio::test]
async fn test_third_arrival_is_rejected() {
    let (addr, _service, tokens) = start_router().await;
    let ticket = tokens
        .sign_router_ticket(&Uuid::new_v4(), Utc::now())
        .unwrap();

    let mut a = connect(&addr, &ticket).await;
    let mut b = connect(&addr, &ticket).await;

    // Confirm the pairing is established before the third arrives
    send_frame(&mut a, pb::StreamFrame::data(vec![1])).await;
    expect_data(recv_message(&mut b).await);

    let mut c = connect(&addr, &ticket).await;
    match recv_message(&mut c).await.and_then(|m| m.body) {
        Some(pb::router_message::Body::Status(status)) => {
            assert_eq!(status.code, Code::FailedPrecondition as i32);
        }
        other => panic!("expected status, got {other:?}"),
    }
}

#[tokio::test]
async fn test_invalid_ticket_is_rejected() {
    let (addr, _service, _tokens) = start_router().await;

    let mut conn = connect(&addr, "not-a-ticket").await;
    match recv_message(&mut conn).await.and_then(|m| m.body) {
        Some(pb::router_message::Body::Status(status)) => {
            assert_eq!(status.code, Code::Unauthenticated as i32);
        }
        other => panic!("expected status, got {other:?}"),
    }
}

#[tokio::test]
async fn test_rst_stream_propagates_and_closes_pairing() {
    let (addr, _service, tokens) = start_router().await;
    let ticket = tokens
        .sign_router_ticket(&Uuid::new_v4(), Utc::now())
        .unwrap();

    let mut a = connect(&addr, &ticket).await;
    let mut b = connect(&addr, &ticket).await;

    send_frame(&mut a, pb::StreamFrame::data(vec![1])).await;
    expect_data(recv_message(&mut b).await);

    send_frame(&mut a, pb::StreamFrame::control(pb::FrameType::RstStream)).await;

    // Peer sees the abort, then the stream ends
    match recv_message(&mut b).await.and_then(|m| m.body) {
        Some(pb::router_message::Body::Frame(frame)) => {
            assert_eq!(frame.frame_type, pb::FrameType::RstStream as i32);
        }
        other => panic!("expected rst frame, got {other:?}"),
    }
    assert!(recv_message(&mut b).await.is_none());
}

#[tokio::test]
async fn test_disconnect_cancels_the_peer() {
    let (addr, _service, tokens) = start_router().await;
    let ticket = tokens
        .sign_router_ticket(&Uuid::new_v4(), Utc::now())
        .unwrap();

    let mut a = connect(&addr, &ticket).await;
    let mut b = connect(&addr, &ticket).await;

    send_frame(&mut a, pb::StreamFrame::data(vec![1])).await;
    expect_data(recv_message(&mut b).await);

    drop(a);
    assert!(recv_message(&mut b).await.is_none());
}

#[tokio::test]
async fn test_early_frames_are_delivered_after_pairing() {
    let (addr, _service, tokens) = start_router().await;
    let ticket = tokens
        .sign_router_ticket(&Uuid::new_v4(), Utc::now())
        .unwrap();

    let mut a = connect(&addr, &ticket).await;
    // Data sent before the peer shows up is buffered
    send_frame(&mut a, pb::StreamFrame::data(vec![7, 7, 7])).await;

    // Give the router a moment to park the first half
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let mut b = connect(&addr, &ticket).await;
    assert_eq!(expect_data(recv_message(&mut b).await), vec![7, 7, 7]);
}

#[tokio::test]
async fn test_sweep_drops_stale_pending_halves() {
    let (addr, service, tokens) = start_router().await;
    let ticket = tokens
        .sign_router_ticket(&Uuid::new_v4(), Utc::now())
        .unwrap();

    let mut a = connect(&addr, &ticket).await;
    send_frame(&mut a, pb::StreamFrame::data(vec![1])).await;
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(service.pending_len(), 1);

    // Everything currently parked is older than a zero max age
    service.sweep(std::time::Duration::from_secs(0));
    assert_eq!(service.pending_len(), 0);

    // The parked connection is torn down
    assert!(recv_message(&mut a).await.is_none());
}

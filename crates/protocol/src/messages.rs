//! Controller and router message types
//!
//! Hand-written prost messages; field tags are part of the wire contract and
//! must not be renumbered. Request/reply envelopes multiplex RPCs over one
//! framed connection: each request carries a connection-unique `id`, replies
//! echo it, and server streams emit multiple replies for the same `id` until
//! `eos` or cancellation.

use std::collections::HashMap;

use chrono::{DateTime, TimeZone, Utc};

use crate::client;
use crate::status::Code;

/// Wall-clock instant, protobuf-style.
#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct Timestamp {
    #[prost(int64, tag = "1")]
    pub seconds: i64,
    #[prost(int32, tag = "2")]
    pub nanos: i32,
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(value: DateTime<Utc>) -> Self {
        Self {
            seconds: value.timestamp(),
            nanos: value.timestamp_subsec_nanos() as i32,
        }
    }
}

impl Timestamp {
    pub fn to_datetime(self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.seconds, self.nanos.max(0) as u32).single()
    }
}

/// Observed condition, mirrored from resource status.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Condition {
    #[prost(string, tag = "1")]
    pub r#type: String,
    #[prost(string, tag = "2")]
    pub status: String,
    #[prost(string, tag = "3")]
    pub reason: String,
    #[prost(string, tag = "4")]
    pub message: String,
    #[prost(message, optional, tag = "5")]
    pub last_transition_time: Option<Timestamp>,
}

/// Label selector as carried on the wire.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LabelSelector {
    #[prost(map = "string, string", tag = "1")]
    pub match_labels: HashMap<String, String>,
    #[prost(message, repeated, tag = "2")]
    pub match_expressions: Vec<LabelSelectorRequirement>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LabelSelectorRequirement {
    #[prost(string, tag = "1")]
    pub key: String,
    #[prost(string, tag = "2")]
    pub operator: String,
    #[prost(string, repeated, tag = "3")]
    pub values: Vec<String>,
}

/// RPC outcome attached to every terminal reply.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Status {
    #[prost(enumeration = "Code", tag = "1")]
    pub code: i32,
    #[prost(string, tag = "2")]
    pub message: String,
}

impl Status {
    pub fn ok() -> Self {
        Self {
            code: Code::Ok as i32,
            message: String::new(),
        }
    }

    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code: code as i32,
            message: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == Code::Ok as i32
    }
}

// ---------------------------------------------------------------------------
// Controller service payloads
// ---------------------------------------------------------------------------

/// One device in an exporter's report.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeviceReport {
    #[prost(string, tag = "1")]
    pub uuid: String,
    #[prost(string, optional, tag = "2")]
    pub parent_uuid: Option<String>,
    #[prost(map = "string, string", tag = "3")]
    pub labels: HashMap<String, String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RegisterRequest {
    #[prost(map = "string, string", tag = "1")]
    pub labels: HashMap<String, String>,
    #[prost(message, repeated, tag = "2")]
    pub reports: Vec<DeviceReport>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RegisterResponse {
    #[prost(string, tag = "1")]
    pub uuid: String,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct UnregisterRequest {}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct UnregisterResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListenRequest {
    #[prost(string, tag = "1")]
    pub lease_name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListenResponse {
    #[prost(string, tag = "1")]
    pub router_endpoint: String,
    #[prost(string, tag = "2")]
    pub router_token: String,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct StatusRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StatusResponse {
    #[prost(bool, tag = "1")]
    pub leased: bool,
    #[prost(string, optional, tag = "2")]
    pub lease_name: Option<String>,
    #[prost(string, optional, tag = "3")]
    pub client_name: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DialRequest {
    #[prost(string, tag = "1")]
    pub lease_name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DialResponse {
    #[prost(string, tag = "1")]
    pub router_endpoint: String,
    #[prost(string, tag = "2")]
    pub router_token: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetLeaseRequest {
    #[prost(string, tag = "1")]
    pub name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetLeaseResponse {
    #[prost(int64, optional, tag = "1")]
    pub duration_seconds: Option<i64>,
    #[prost(message, optional, tag = "2")]
    pub selector: Option<LabelSelector>,
    #[prost(message, optional, tag = "3")]
    pub begin_time: Option<Timestamp>,
    #[prost(message, optional, tag = "4")]
    pub end_time: Option<Timestamp>,
    #[prost(string, optional, tag = "5")]
    pub exporter_uuid: Option<String>,
    #[prost(message, repeated, tag = "6")]
    pub conditions: Vec<Condition>,
    #[prost(bool, tag = "7")]
    pub ended: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RequestLeaseRequest {
    #[prost(message, optional, tag = "1")]
    pub selector: Option<LabelSelector>,
    #[prost(int64, tag = "2")]
    pub duration_seconds: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RequestLeaseResponse {
    #[prost(string, tag = "1")]
    pub name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReleaseLeaseRequest {
    #[prost(string, tag = "1")]
    pub name: String,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct ReleaseLeaseResponse {}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct ListLeasesRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListLeasesResponse {
    #[prost(string, repeated, tag = "1")]
    pub names: Vec<String>,
}

/// Tears down the server stream opened under `id` on this connection.
#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct CancelRequest {
    #[prost(uint64, tag = "1")]
    pub id: u64,
}

// ---------------------------------------------------------------------------
// Envelopes
// ---------------------------------------------------------------------------

/// Client → controller envelope.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ControllerRequest {
    /// Connection-unique request id echoed in replies
    #[prost(uint64, tag = "1")]
    pub id: u64,
    /// Bearer credential for this call
    #[prost(string, tag = "2")]
    pub bearer: String,
    #[prost(
        oneof = "controller_request::Body",
        tags = "3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19"
    )]
    pub body: Option<controller_request::Body>,
}

pub mod controller_request {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Body {
        #[prost(message, tag = "3")]
        Register(super::RegisterRequest),
        #[prost(message, tag = "4")]
        Unregister(super::UnregisterRequest),
        #[prost(message, tag = "5")]
        Listen(super::ListenRequest),
        #[prost(message, tag = "6")]
        Status(super::StatusRequest),
        #[prost(message, tag = "7")]
        Dial(super::DialRequest),
        #[prost(message, tag = "8")]
        GetLease(super::GetLeaseRequest),
        #[prost(message, tag = "9")]
        RequestLease(super::RequestLeaseRequest),
        #[prost(message, tag = "10")]
        ReleaseLease(super::ReleaseLeaseRequest),
        #[prost(message, tag = "11")]
        ListLeases(super::ListLeasesRequest),
        #[prost(message, tag = "12")]
        Cancel(super::CancelRequest),
        #[prost(message, tag = "13")]
        ClientGetExporter(super::client::GetExporterRequest),
        #[prost(message, tag = "14")]
        ClientListExporters(super::client::ListExportersRequest),
        #[prost(message, tag = "15")]
        ClientGetLease(super::client::GetLeaseRequest),
        #[prost(message, tag = "16")]
        ClientListLeases(super::client::ListLeasesRequest),
        #[prost(message, tag = "17")]
        ClientCreateLease(super::client::CreateLeaseRequest),
        #[prost(message, tag = "18")]
        ClientUpdateLease(super::client::UpdateLeaseRequest),
        #[prost(message, tag = "19")]
        ClientDeleteLease(super::client::DeleteLeaseRequest),
    }
}

/// Controller → client envelope.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ControllerReply {
    /// Request id this reply answers
    #[prost(uint64, tag = "1")]
    pub id: u64,
    /// Present on terminal replies; absent on intermediate stream frames
    #[prost(message, optional, tag = "2")]
    pub status: Option<Status>,
    /// End of stream marker
    #[prost(bool, tag = "3")]
    pub eos: bool,
    #[prost(
        oneof = "controller_reply::Body",
        tags = "4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17"
    )]
    pub body: Option<controller_reply::Body>,
}

pub mod controller_reply {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Body {
        #[prost(message, tag = "4")]
        Register(super::RegisterResponse),
        #[prost(message, tag = "5")]
        Unregister(super::UnregisterResponse),
        #[prost(message, tag = "6")]
        Listen(super::ListenResponse),
        #[prost(message, tag = "7")]
        Status(super::StatusResponse),
        #[prost(message, tag = "8")]
        Dial(super::DialResponse),
        #[prost(message, tag = "9")]
        GetLease(super::GetLeaseResponse),
        #[prost(message, tag = "10")]
        RequestLease(super::RequestLeaseResponse),
        #[prost(message, tag = "11")]
        ReleaseLease(super::ReleaseLeaseResponse),
        #[prost(message, tag = "12")]
        ListLeases(super::ListLeasesResponse),
        #[prost(message, tag = "13")]
        ClientExporter(super::client::Exporter),
        #[prost(message, tag = "14")]
        ClientListExporters(super::client::ListExportersResponse),
        #[prost(message, tag = "15")]
        ClientLease(super::client::Lease),
        #[prost(message, tag = "16")]
        ClientListLeases(super::client::ListLeasesResponse),
        #[prost(message, tag = "17")]
        ClientEmpty(super::client::Empty),
    }
}

// ---------------------------------------------------------------------------
// Router service
// ---------------------------------------------------------------------------

/// Frame types on a spliced stream; values mirror the HTTP/2 frame registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
#[repr(i32)]
pub enum FrameType {
    Data = 0,
    RstStream = 3,
    Ping = 6,
    Goaway = 7,
}

/// One frame relayed between the two halves of a stream.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StreamFrame {
    #[prost(bytes = "vec", tag = "1")]
    pub payload: Vec<u8>,
    #[prost(enumeration = "FrameType", tag = "2")]
    pub frame_type: i32,
}

impl StreamFrame {
    pub fn data(payload: Vec<u8>) -> Self {
        Self {
            payload,
            frame_type: FrameType::Data as i32,
        }
    }

    pub fn control(frame_type: FrameType) -> Self {
        Self {
            payload: Vec::new(),
            frame_type: frame_type as i32,
        }
    }

    /// RST_STREAM and GOAWAY end the pairing.
    pub fn is_terminal(&self) -> bool {
        self.frame_type == FrameType::RstStream as i32
            || self.frame_type == FrameType::Goaway as i32
    }
}

/// First message on a router connection; the ticket subject names the stream.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RouterHello {
    #[prost(string, tag = "1")]
    pub bearer: String,
}

/// Envelope for router connections, both directions.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RouterMessage {
    #[prost(oneof = "router_message::Body", tags = "1, 2, 3")]
    pub body: Option<router_message::Body>,
}

pub mod router_message {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Body {
        #[prost(message, tag = "1")]
        Hello(super::RouterHello),
        #[prost(message, tag = "2")]
        Frame(super::StreamFrame),
        #[prost(message, tag = "3")]
        Status(super::Status),
    }
}

impl RouterMessage {
    pub fn hello(bearer: impl Into<String>) -> Self {
        Self {
            body: Some(router_message::Body::Hello(RouterHello {
                bearer: bearer.into(),
            })),
        }
    }

    pub fn frame(frame: StreamFrame) -> Self {
        Self {
            body: Some(router_message::Body::Frame(frame)),
        }
    }

    pub fn status(status: Status) -> Self {
        Self {
            body: Some(router_message::Body::Status(status)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn test_register_roundtrip() {
        let request = RegisterRequest {
            labels: [(
                "jumpstarter.dev/board".to_string(),
                "rpi4".to_string(),
            )]
            .into(),
            reports: vec![DeviceReport {
                uuid: "d-1".to_string(),
                parent_uuid: None,
                labels: HashMap::new(),
            }],
        };

        let bytes = request.encode_to_vec();
        let decoded = RegisterRequest::decode(bytes.as_slice()).expect("decode failed");
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_envelope_roundtrip() {
        let request = ControllerRequest {
            id: 7,
            bearer: "token".to_string(),
            body: Some(controller_request::Body::Dial(DialRequest {
                lease_name: "lease1".to_string(),
            })),
        };

        let bytes = request.encode_to_vec();
        let decoded = ControllerRequest::decode(bytes.as_slice()).expect("decode failed");
        assert_eq!(decoded.id, 7);
        assert!(matches!(
            decoded.body,
            Some(controller_request::Body::Dial(ref d)) if d.lease_name == "lease1"
        ));
    }

    #[test]
    fn test_frame_type_registry_values() {
        assert_eq!(FrameType::Data as i32, 0);
        assert_eq!(FrameType::RstStream as i32, 3);
        assert_eq!(FrameType::Ping as i32, 6);
        assert_eq!(FrameType::Goaway as i32, 7);
    }

    #[test]
    fn test_stream_frame_terminal() {
        assert!(StreamFrame::control(FrameType::RstStream).is_terminal());
        assert!(StreamFrame::control(FrameType::Goaway).is_terminal());
        assert!(!StreamFrame::control(FrameType::Ping).is_terminal());
        assert!(!StreamFrame::data(vec![1, 2, 3]).is_terminal());
    }

    #[test]
    fn test_stream_frame_preserves_payload_bytes() {
        let payload: Vec<u8> = (0..=255).collect();
        let frame = StreamFrame::data(payload.clone());

        let bytes = RouterMessage::frame(frame).encode_to_vec();
        let decoded = RouterMessage::decode(bytes.as_slice()).expect("decode failed");

        match decoded.body {
            Some(router_message::Body::Frame(f)) => assert_eq!(f.payload, payload),
            other => panic!("unexpected body: {other:?}"),
        }
    }

    #[test]
    fn test_timestamp_conversion() {
        let now = Utc::now();
        let ts = Timestamp::from(now);
        let back = ts.to_datetime().expect("valid timestamp");
        assert_eq!(back.timestamp(), now.timestamp());
    }
}

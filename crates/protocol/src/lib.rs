//! Jumpstarter wire protocol
//!
//! The controller and router speak length-prefixed binary frames over TCP;
//! each frame carries one protobuf-encoded message. TLS termination is the
//! fronting edge's responsibility, so the listeners here are plaintext.
//!
//! - [`framing`]: `tokio_util::codec` compatible length-prefixed codec
//! - [`messages`]: controller and router message types (hand-written prost)
//! - [`client`]: resource-style client v1 message types
//! - [`status`]: gRPC-compatible status codes

pub mod client;
pub mod error;
pub mod framing;
pub mod messages;
pub mod status;

pub use error::ProtocolError;
pub use framing::{FrameCodec, MAX_FRAME_SIZE};
pub use status::Code;

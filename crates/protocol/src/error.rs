//! Protocol errors

use thiserror::Error;

/// Errors raised while encoding, decoding or framing wire messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame length exceeds the protocol cap; rejected before allocation
    #[error("frame of {size} bytes exceeds maximum of {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("encode error: {0}")]
    Encode(#[from] prost::EncodeError),

    /// Peer violated the message sequence, e.g. skipped the hello
    #[error("unexpected message: {0}")]
    UnexpectedMessage(&'static str),
}

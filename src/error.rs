//! Error types for gofast.

use thiserror::Error;

use crate::codec::CodecError;

/// Main error type for all transport operations.
#[derive(Debug, Error)]
pub enum GofastError {
    /// I/O error on the underlying connection.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error (configuration and tag settings only).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// Malformed CBOR item.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Protocol error (bad framing, illegal flags, unexpected packet).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A request or stream start arrived for an opaque that is already live.
    #[error("duplicate request on opaque {0}")]
    DuplicateRequest(u64),

    /// Tag name not known to this endpoint.
    #[error("unknown tag: {0}")]
    UnknownTag(String),

    /// Tag id found on the wire that no local plug-in decodes.
    #[error("unknown tag id: {0}")]
    UnknownTagId(u64),

    /// A tag plug-in failed to transform a payload.
    #[error("tag {tag} failed: {reason}")]
    Tag {
        /// Tag name.
        tag: &'static str,
        /// Failure description.
        reason: String,
    },

    /// No handler subscribed for the message type.
    #[error("message type {0} not subscribed")]
    NotSubscribed(u64),

    /// Message id falls in the range reserved for internal messages.
    #[error("message id {0} is reserved")]
    ReservedMessageId(u64),

    /// Decoded a message of another type than requested.
    #[error("expected message type {expected}, got {found}")]
    MessageMismatch {
        /// Requested message id.
        expected: u64,
        /// Id carried by the packet.
        found: u64,
    },

    /// Encoded packet exceeds the peer's buffer size.
    #[error("packet of {size} bytes exceeds maximum {max}")]
    PacketTooLarge {
        /// Packet size in bytes.
        size: usize,
        /// Allowed maximum.
        max: usize,
    },

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The peer did not complete the handshake in time.
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// The peer closed the exchange without sending a reply.
    #[error("exchange closed without a response")]
    EmptyResponse,

    /// Operation not allowed on this kind of exchange.
    #[error("operation not allowed: {0}")]
    NotAllowed(&'static str),

    /// Operation on a stream that was already closed locally.
    #[error("stream closed")]
    StreamClosed,

    /// Connection closed or transport torn down.
    #[error("Connection closed")]
    ConnectionClosed,
}

/// Result type alias using GofastError.
pub type Result<T> = std::result::Result<T, GofastError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_converts() {
        let err: GofastError =
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe gone").into();
        assert!(matches!(err, GofastError::Io(_)));
        assert!(err.to_string().contains("pipe gone"));
    }

    #[test]
    fn test_codec_error_converts() {
        let err: GofastError = CodecError::Truncated { need: 3, have: 1 }.into();
        assert!(matches!(err, GofastError::Codec(_)));
    }

    #[test]
    fn test_display_mentions_details() {
        let err = GofastError::MessageMismatch {
            expected: 111,
            found: 112,
        };
        assert_eq!(err.to_string(), "expected message type 111, got 112");
        assert_eq!(
            GofastError::DuplicateRequest(42).to_string(),
            "duplicate request on opaque 42"
        );
    }
}

//! Codec module - the CBOR alphabet for packets and MsgPack for payloads.
//!
//! - [`cbor`] - header, integer, string, indefinite container and tag items
//!   used to frame every packet
//! - [`MsgPackCodec`] - serde payload encoding of application messages
//!
//! # Example
//!
//! ```
//! use bytes::BytesMut;
//! use gofast::codec::cbor;
//!
//! let mut buf = BytesMut::new();
//! cbor::encode_text("hello", &mut buf);
//! let (text, consumed) = cbor::decode_text(&buf).unwrap();
//! assert_eq!(text, "hello");
//! assert_eq!(consumed, 6);
//! ```

pub mod cbor;
mod msgpack;

pub use cbor::CodecError;
pub use msgpack::MsgPackCodec;

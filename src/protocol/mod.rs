//! Protocol module - flag word, packet framing and body encoding.
//!
//! - [`Flags`] - the 16-bit flag word and its [`PacketKind`] classification
//! - [`FrameBuffer`] - deframing of the byte stream into packet bodies
//! - [`PacketBuf`] / [`decode_body`] - building packets and decoding bodies

pub mod flags;
mod frame_buffer;
mod packet;

pub use flags::{Flags, PacketKind};
pub use frame_buffer::{FrameBuffer, DEFAULT_MAX_BODY_SIZE, PACKET_PREFIX};
pub use packet::{decode_body, PacketBuf, RxPacket, MAX_TAG_DEPTH};

//! The 16-bit flag word carried by every packet.
//!
//! ```text
//!  15        11 10   9   8  7       4 3       0
//! ┌────────────┬───┬───┬───┬─────────┬─────────┐
//! │  reserved  │ E │ S │ R │encoding │compress │
//! └────────────┴───┴───┴───┴─────────┴─────────┘
//! ```
//!
//! `R` (Request), `S` (Stream) and `E` (EndStream) together select the
//! exchange shape, see [`PacketKind`].

use std::fmt;

/// Compression id mask (bits 0-3).
pub const COMPRESSION_MASK: u16 = 0x000f;
/// Payload encoding mask (bits 4-7).
pub const ENCODING_MASK: u16 = 0x00f0;
/// Request bit.
pub const REQUEST: u16 = 0x0100;
/// Stream bit.
pub const STREAM: u16 = 0x0200;
/// EndStream bit.
pub const END_STREAM: u16 = 0x0400;
/// Bits with no meaning yet; must be zero on the wire.
pub const RESERVED_MASK: u16 = 0xf800;

const ENCODING_SHIFT: u16 = 4;

/// No compression tag applied.
pub const COMPRESSION_NONE: u8 = 0;
/// Payloads are named MessagePack.
pub const ENCODING_MSGPACK: u8 = 1;

/// Exchange shape selected by the R/S/E bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    /// R+E: one-way message, opaque forgotten after delivery.
    Post,
    /// R+S+E: expects exactly one reply.
    Request,
    /// R+S: opens a bidirectional stream.
    StreamStart,
    /// S: interior message on a live opaque.
    StreamMessage,
    /// E: closes the sender's direction (carries the reply of a request).
    Finish,
}

impl PacketKind {
    /// Flags value with only the protocol bits of this shape set.
    pub const fn flags(self) -> Flags {
        Flags(match self {
            PacketKind::Post => REQUEST | END_STREAM,
            PacketKind::Request => REQUEST | STREAM | END_STREAM,
            PacketKind::StreamStart => REQUEST | STREAM,
            PacketKind::StreamMessage => STREAM,
            PacketKind::Finish => END_STREAM,
        })
    }

    /// True for shapes that open a new exchange.
    #[inline]
    pub const fn is_start(self) -> bool {
        matches!(
            self,
            PacketKind::Post | PacketKind::Request | PacketKind::StreamStart
        )
    }
}

/// The 16-bit flag word.
///
/// Setters mask-and-or their own field and leave every other bit as is.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Flags(u16);

impl Flags {
    /// Wrap a raw flag word.
    #[inline]
    pub const fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    /// Raw flag word.
    #[inline]
    pub const fn bits(self) -> u16 {
        self.0
    }

    /// Compression algorithm id (0-15).
    #[inline]
    pub const fn compression(self) -> u8 {
        (self.0 & COMPRESSION_MASK) as u8
    }

    /// Set the compression id. Values above 15 are truncated to 4 bits.
    #[inline]
    pub fn set_compression(&mut self, id: u8) -> &mut Self {
        self.0 = (self.0 & !COMPRESSION_MASK) | (id as u16 & COMPRESSION_MASK);
        self
    }

    /// Payload encoding id (0-15).
    #[inline]
    pub const fn encoding(self) -> u8 {
        ((self.0 & ENCODING_MASK) >> ENCODING_SHIFT) as u8
    }

    /// Set the payload encoding id. Values above 15 are truncated to 4 bits.
    #[inline]
    pub fn set_encoding(&mut self, id: u8) -> &mut Self {
        self.0 = (self.0 & !ENCODING_MASK) | ((id as u16) << ENCODING_SHIFT & ENCODING_MASK);
        self
    }

    /// Request bit.
    #[inline]
    pub const fn is_request(self) -> bool {
        self.0 & REQUEST != 0
    }

    /// Set or clear the Request bit.
    #[inline]
    pub fn set_request(&mut self, on: bool) -> &mut Self {
        self.set_bit(REQUEST, on)
    }

    /// Stream bit.
    #[inline]
    pub const fn is_stream(self) -> bool {
        self.0 & STREAM != 0
    }

    /// Set or clear the Stream bit.
    #[inline]
    pub fn set_stream(&mut self, on: bool) -> &mut Self {
        self.set_bit(STREAM, on)
    }

    /// EndStream bit.
    #[inline]
    pub const fn is_end_stream(self) -> bool {
        self.0 & END_STREAM != 0
    }

    /// Set or clear the EndStream bit.
    #[inline]
    pub fn set_end_stream(&mut self, on: bool) -> &mut Self {
        self.set_bit(END_STREAM, on)
    }

    #[inline]
    fn set_bit(&mut self, bit: u16, on: bool) -> &mut Self {
        if on {
            self.0 |= bit;
        } else {
            self.0 &= !bit;
        }
        self
    }

    /// Classify the R/S/E triple. `None` for illegal combinations.
    pub const fn kind(self) -> Option<PacketKind> {
        match (self.is_request(), self.is_stream(), self.is_end_stream()) {
            (true, false, true) => Some(PacketKind::Post),
            (true, true, true) => Some(PacketKind::Request),
            (true, true, false) => Some(PacketKind::StreamStart),
            (false, true, false) => Some(PacketKind::StreamMessage),
            (false, false, true) => Some(PacketKind::Finish),
            _ => None,
        }
    }

    /// True when any reserved bit is set.
    #[inline]
    pub const fn has_reserved(self) -> bool {
        self.0 & RESERVED_MASK != 0
    }
}

impl From<PacketKind> for Flags {
    fn from(kind: PacketKind) -> Self {
        kind.flags()
    }
}

impl fmt::Debug for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Flags")
            .field("compression", &self.compression())
            .field("encoding", &self.encoding())
            .field("request", &self.is_request())
            .field("stream", &self.is_stream())
            .field("end_stream", &self.is_end_stream())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_fields(f: Flags) -> (u8, u8, bool, bool, bool) {
        (
            f.compression(),
            f.encoding(),
            f.is_request(),
            f.is_stream(),
            f.is_end_stream(),
        )
    }

    #[test]
    fn test_layout() {
        let mut f = Flags::default();
        f.set_compression(0x3)
            .set_encoding(0x5)
            .set_request(true)
            .set_stream(true)
            .set_end_stream(true);
        assert_eq!(f.bits(), 0x0753);
    }

    #[test]
    fn test_field_independence() {
        // Start from every pattern of the 11 defined bits.
        for bits in 0..=0x07ffu16 {
            let base = Flags::from_bits(bits);
            let (c, e, r, s, end) = all_fields(base);

            let mut f = base;
            f.set_compression(c ^ 0xf);
            assert_eq!(all_fields(f), (c ^ 0xf, e, r, s, end));

            let mut f = base;
            f.set_encoding(e ^ 0xf);
            assert_eq!(all_fields(f), (c, e ^ 0xf, r, s, end));

            let mut f = base;
            f.set_request(!r);
            assert_eq!(all_fields(f), (c, e, !r, s, end));

            let mut f = base;
            f.set_stream(!s);
            assert_eq!(all_fields(f), (c, e, r, !s, end));

            let mut f = base;
            f.set_end_stream(!end);
            assert_eq!(all_fields(f), (c, e, r, s, !end));
        }
    }

    #[test]
    fn test_setters_preserve_reserved_bits() {
        let mut f = Flags::from_bits(0x8000);
        f.set_compression(1).set_encoding(2).set_request(true);
        assert!(f.has_reserved());
        assert_eq!(f.bits() & RESERVED_MASK, 0x8000);
    }

    #[test]
    fn test_oversized_ids_are_truncated() {
        let mut f = Flags::default();
        f.set_compression(0x1f).set_encoding(0x2f);
        assert_eq!(f.compression(), 0xf);
        assert_eq!(f.encoding(), 0xf);
        assert!(!f.is_request());
    }

    #[test]
    fn test_kind_table() {
        let cases = [
            ((true, false, true), Some(PacketKind::Post)),
            ((true, true, true), Some(PacketKind::Request)),
            ((true, true, false), Some(PacketKind::StreamStart)),
            ((false, true, false), Some(PacketKind::StreamMessage)),
            ((false, false, true), Some(PacketKind::Finish)),
            ((true, false, false), None),
            ((false, true, true), None),
            ((false, false, false), None),
        ];
        for ((r, s, e), expected) in cases {
            let mut f = Flags::default();
            f.set_request(r).set_stream(s).set_end_stream(e);
            assert_eq!(f.kind(), expected, "R={r} S={s} E={e}");
        }
    }

    #[test]
    fn test_kind_flags_roundtrip() {
        for kind in [
            PacketKind::Post,
            PacketKind::Request,
            PacketKind::StreamStart,
            PacketKind::StreamMessage,
            PacketKind::Finish,
        ] {
            assert_eq!(Flags::from(kind).kind(), Some(kind));
        }
        assert!(PacketKind::Post.is_start());
        assert!(!PacketKind::Finish.is_start());
    }
}

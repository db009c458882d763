//! Packet encoding and body decoding.
//!
//! ```text
//! packet  := d9 d9 f7 | bytes-header(len) | body
//! body    := tag(opaque) [_ uint(flags) payload? ]
//! payload := tag(37) {_ 38: uint(msg_id), 39: bytes(msgpack) }
//!          | tag(plugin) bytes(transform(payload))
//! ```

use bytes::{Bytes, BytesMut};
use serde::Serialize;

use super::flags::{Flags, PacketKind, ENCODING_MSGPACK};
use super::frame_buffer::PACKET_PREFIX;
use crate::codec::cbor;
use crate::codec::MsgPackCodec;
use crate::error::{GofastError, Result};
use crate::message::Incoming;
use crate::tags::{TagChain, TagTable, TAG_DATA, TAG_ID, TAG_MSG};

/// Deepest tag nesting accepted on receive.
pub const MAX_TAG_DEPTH: usize = 8;

/// Scratch buffers for building one packet.
///
/// `msg` and `work` alternate while the tag chain is applied; `packet` holds
/// the finished wire bytes.
#[derive(Debug, Default)]
pub struct PacketBuf {
    msg: BytesMut,
    work: BytesMut,
    packet: BytesMut,
}

impl PacketBuf {
    /// Create with `capacity` bytes reserved per buffer.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            msg: BytesMut::with_capacity(capacity),
            work: BytesMut::with_capacity(capacity),
            packet: BytesMut::with_capacity(capacity),
        }
    }

    /// Finished packet bytes.
    #[inline]
    pub fn packet(&self) -> &[u8] {
        &self.packet
    }

    /// Length of the finished packet.
    #[inline]
    pub fn len(&self) -> usize {
        self.packet.len()
    }

    /// True before anything was built.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.packet.is_empty()
    }

    fn clear(&mut self) {
        self.msg.clear();
        self.work.clear();
        self.packet.clear();
    }

    /// Build a packet carrying `msg`.
    ///
    /// The compression and encoding fields of `flags` are set from `chain`.
    /// Fails with [`GofastError::PacketTooLarge`] when the packet exceeds
    /// `max`.
    #[allow(clippy::too_many_arguments)]
    pub fn build_message<M: Serialize + ?Sized>(
        &mut self,
        opaque: u64,
        mut flags: Flags,
        msg_id: u64,
        msg: &M,
        size_hint: usize,
        chain: &TagChain,
        max: usize,
    ) -> Result<usize> {
        self.clear();
        self.msg.reserve(size_hint);
        MsgPackCodec::encode_into(msg, &mut self.msg)?;

        cbor::encode_tag(TAG_MSG, &mut self.work);
        cbor::map_start(&mut self.work);
        cbor::encode_uint(TAG_ID, &mut self.work);
        cbor::encode_uint(msg_id, &mut self.work);
        cbor::encode_uint(TAG_DATA, &mut self.work);
        cbor::encode_bytes(&self.msg, &mut self.work);
        cbor::encode_break(&mut self.work);

        for tag in chain.tags() {
            self.msg.clear();
            tag.encode(&self.work, &mut self.msg)?;
            self.work.clear();
            cbor::encode_tag(tag.id(), &mut self.work);
            cbor::encode_bytes(&self.msg, &mut self.work);
        }

        flags
            .set_encoding(ENCODING_MSGPACK)
            .set_compression(chain.compression());
        let size = encode_frame(opaque, flags, &self.work, &mut self.packet);
        if size > max {
            self.packet.clear();
            return Err(GofastError::PacketTooLarge { size, max });
        }
        Ok(size)
    }

    /// Build a bare finish (no payload) for `opaque`.
    pub fn build_finish(&mut self, opaque: u64) -> usize {
        self.clear();
        encode_frame(opaque, PacketKind::Finish.flags(), &[], &mut self.packet)
    }
}

/// Append prefix, length header and body to `out`. Returns bytes written.
fn encode_frame(opaque: u64, flags: Flags, payload: &[u8], out: &mut BytesMut) -> usize {
    let bits = flags.bits() as u64;
    let body_len = cbor::uint_len(opaque) + 1 + cbor::uint_len(bits) + payload.len() + 1;

    let start = out.len();
    out.reserve(PACKET_PREFIX.len() + cbor::MAX_HEAD_LEN + body_len);
    out.extend_from_slice(&PACKET_PREFIX);
    cbor::encode_bytes_header(body_len, out);
    cbor::encode_tag(opaque, out);
    cbor::array_start(out);
    cbor::encode_uint(bits, out);
    out.extend_from_slice(payload);
    cbor::encode_break(out);
    out.len() - start
}

/// A decoded packet body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RxPacket {
    /// Exchange id.
    pub opaque: u64,
    /// Flag word.
    pub flags: Flags,
    /// Carried message, `None` for a bare finish.
    pub message: Option<Incoming>,
}

/// Decode a packet body produced by the frame buffer.
///
/// Tag plug-ins are looked up in `tags`; message bytes are sliced from
/// `body` without copying when no plug-in was applied. Each plug-in layer
/// may expand to at most `max_payload` bytes.
pub fn decode_body(body: Bytes, tags: &TagTable, max_payload: usize) -> Result<RxPacket> {
    let (opaque, mut pos) = cbor::decode_tag(&body)?;
    pos += cbor::decode_array_start(&body[pos..])?;
    let (bits, n) = cbor::decode_uint(&body[pos..])?;
    pos += n;
    let flags = u16::try_from(bits)
        .map(Flags::from_bits)
        .map_err(|_| GofastError::Protocol(format!("flag word {bits:#x} out of range")))?;

    if cbor::is_break(&body[pos..]) {
        expect_end(&body, pos + 1)?;
        return Ok(RxPacket {
            opaque,
            flags,
            message: None,
        });
    }

    let start = pos;
    let (tag, n) = cbor::decode_tag(&body[pos..])?;
    pos += n;
    if tag == TAG_MSG {
        pos += envelope_len(&body[pos..])?;
    } else {
        let (_, n) = cbor::decode_bytes(&body[pos..])?;
        pos += n;
    }
    if !cbor::is_break(&body[pos..]) {
        return Err(GofastError::Protocol("missing break after payload".into()));
    }
    expect_end(&body, pos + 1)?;

    let message = unwind(body.slice(start..pos), tags, max_payload)?;
    Ok(RxPacket {
        opaque,
        flags,
        message: Some(message),
    })
}

fn expect_end(body: &[u8], end: usize) -> Result<()> {
    if end != body.len() {
        return Err(GofastError::Protocol(format!(
            "{} trailing bytes after packet body",
            body.len() - end
        )));
    }
    Ok(())
}

/// Strip plug-in tags until the envelope is reached.
fn unwind(mut payload: Bytes, tags: &TagTable, limit: usize) -> Result<Incoming> {
    for _ in 0..=MAX_TAG_DEPTH {
        let (tag, n) = cbor::decode_tag(&payload)?;
        if tag == TAG_MSG {
            return decode_envelope(&payload, n);
        }
        let plugin = tags.get(tag).ok_or(GofastError::UnknownTagId(tag))?;
        let (inner, _) = cbor::decode_bytes(&payload[n..])?;
        let mut out = BytesMut::with_capacity(inner.len().saturating_mul(2).min(limit));
        plugin.decode(inner, &mut out, limit)?;
        if out.len() > limit {
            return Err(GofastError::Tag {
                tag: plugin.name(),
                reason: format!("decoded payload exceeds {limit} bytes"),
            });
        }
        payload = out.freeze();
    }
    Err(GofastError::Protocol(format!(
        "tag nesting deeper than {MAX_TAG_DEPTH}"
    )))
}

/// Length of the envelope map starting at `buf`.
fn envelope_len(buf: &[u8]) -> Result<usize> {
    let mut pos = cbor::decode_map_start(buf)?;
    while !cbor::is_break(&buf[pos..]) {
        let (key, n) = cbor::decode_uint(&buf[pos..])?;
        pos += n;
        pos += match key {
            TAG_ID => cbor::decode_uint(&buf[pos..])?.1,
            TAG_DATA => cbor::decode_bytes(&buf[pos..])?.1,
            other => {
                return Err(GofastError::Protocol(format!(
                    "unknown envelope key {other}"
                )))
            }
        };
    }
    Ok(pos + 1)
}

/// Decode the envelope whose map starts at `payload[at..]`.
fn decode_envelope(payload: &Bytes, at: usize) -> Result<Incoming> {
    let mut pos = at + cbor::decode_map_start(&payload[at..])?;
    let mut msg_id = None;
    let mut data = None;
    while !cbor::is_break(&payload[pos..]) {
        let (key, n) = cbor::decode_uint(&payload[pos..])?;
        pos += n;
        match key {
            TAG_ID => {
                let (id, n) = cbor::decode_uint(&payload[pos..])?;
                msg_id = Some(id);
                pos += n;
            }
            TAG_DATA => {
                let (bytes, n) = cbor::decode_bytes(&payload[pos..])?;
                let content_start = pos + n - bytes.len();
                data = Some(payload.slice(content_start..pos + n));
                pos += n;
            }
            other => {
                return Err(GofastError::Protocol(format!(
                    "unknown envelope key {other}"
                )))
            }
        }
    }
    match (msg_id, data) {
        (Some(msg_id), Some(data)) => Ok(Incoming { msg_id, data }),
        _ => Err(GofastError::Protocol("incomplete message envelope".into())),
    }
}

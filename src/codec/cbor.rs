//! The CBOR alphabet every packet is built from.
//!
//! Each item starts with a 1-byte header:
//! ```text
//! ┌───────────┬────────────────────┐
//! │ major (3) │ additional info (5)│
//! └───────────┴────────────────────┘
//! ```
//!
//! Additional info below 24 is the value itself. 24, 25, 26 and 27 announce
//! that 1, 2, 4 or 8 big-endian bytes follow. 31 marks an indefinite-length
//! array or map, and the standalone byte `0xff` (major 7, info 31) closes it.
//!
//! Only the subset the packet format needs is implemented: unsigned
//! integers, byte and text strings, indefinite arrays and maps, tags and
//! break.

use bytes::{BufMut, BytesMut};
use thiserror::Error;

/// Major type: unsigned integer.
pub const TYPE_UINT: u8 = 0x00;
/// Major type: negative integer.
pub const TYPE_NEGINT: u8 = 0x20;
/// Major type: byte string.
pub const TYPE_BYTES: u8 = 0x40;
/// Major type: text string.
pub const TYPE_TEXT: u8 = 0x60;
/// Major type: array.
pub const TYPE_ARRAY: u8 = 0x80;
/// Major type: map.
pub const TYPE_MAP: u8 = 0xa0;
/// Major type: tag.
pub const TYPE_TAG: u8 = 0xc0;
/// Major type: simple values, floats and break.
pub const TYPE_SIMPLE: u8 = 0xe0;

/// Mask selecting the major type bits.
pub const MAJOR_MASK: u8 = 0xe0;
/// Mask selecting the additional info bits.
pub const INFO_MASK: u8 = 0x1f;

/// One byte follows the header.
pub const INFO_UINT8: u8 = 24;
/// Two bytes follow the header.
pub const INFO_UINT16: u8 = 25;
/// Four bytes follow the header.
pub const INFO_UINT32: u8 = 26;
/// Eight bytes follow the header.
pub const INFO_UINT64: u8 = 27;
/// Indefinite length (arrays, maps) or break (simple).
pub const INFO_INDEFINITE: u8 = 31;

/// Header opening an indefinite-length array.
pub const ARRAY_START: u8 = TYPE_ARRAY | INFO_INDEFINITE;
/// Header opening an indefinite-length map.
pub const MAP_START: u8 = TYPE_MAP | INFO_INDEFINITE;
/// Break stop code closing an indefinite item.
pub const BREAK: u8 = TYPE_SIMPLE | INFO_INDEFINITE;

/// Largest encoded integer header (1 + 8 bytes).
pub const MAX_HEAD_LEN: usize = 9;

/// Errors raised while decoding CBOR items.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// Input ends before the item does.
    #[error("truncated input: need {need} bytes, have {have}")]
    Truncated {
        /// Bytes the item requires.
        need: usize,
        /// Bytes available.
        have: usize,
    },

    /// Header carries another major type than expected.
    #[error("expected major type {expected:#04x}, found {found:#04x}")]
    UnexpectedType {
        /// Expected major type bits.
        expected: u8,
        /// Header byte found.
        found: u8,
    },

    /// Additional info 28..=30, or 31 where a definite length is required.
    #[error("reserved or unsupported additional info {0}")]
    ReservedInfo(u8),

    /// Text string is not UTF-8.
    #[error("text string is not valid UTF-8")]
    InvalidUtf8,
}

/// Number of bytes `encode_uint` needs for `x`.
#[inline]
pub const fn uint_len(x: u64) -> usize {
    if x < 24 {
        1
    } else if x <= u8::MAX as u64 {
        2
    } else if x <= u16::MAX as u64 {
        3
    } else if x <= u32::MAX as u64 {
        5
    } else {
        9
    }
}

/// Encode `x` as an unsigned integer using the shortest form.
///
/// Returns the number of bytes written.
///
/// # Example
///
/// ```
/// use bytes::BytesMut;
/// use gofast::codec::cbor;
///
/// let mut buf = BytesMut::new();
/// assert_eq!(cbor::encode_uint(500, &mut buf), 3);
/// assert_eq!(&buf[..], &[0x19, 0x01, 0xf4]);
/// ```
pub fn encode_uint(x: u64, buf: &mut BytesMut) -> usize {
    if x < 24 {
        buf.put_u8(TYPE_UINT | x as u8);
    } else if x <= u8::MAX as u64 {
        buf.put_u8(TYPE_UINT | INFO_UINT8);
        buf.put_u8(x as u8);
    } else if x <= u16::MAX as u64 {
        buf.put_u8(TYPE_UINT | INFO_UINT16);
        buf.put_u16(x as u16);
    } else if x <= u32::MAX as u64 {
        buf.put_u8(TYPE_UINT | INFO_UINT32);
        buf.put_u32(x as u32);
    } else {
        buf.put_u8(TYPE_UINT | INFO_UINT64);
        buf.put_u64(x);
    }
    uint_len(x)
}

/// Encode `x` with the integer encoding and patch `major` into its header.
fn encode_head(major: u8, x: u64, buf: &mut BytesMut) -> usize {
    let at = buf.len();
    let n = encode_uint(x, buf);
    buf[at] |= major;
    n
}

/// Encode a tag header.
#[inline]
pub fn encode_tag(tag: u64, buf: &mut BytesMut) -> usize {
    encode_head(TYPE_TAG, tag, buf)
}

/// Encode a byte string header followed by `data`.
pub fn encode_bytes(data: &[u8], buf: &mut BytesMut) -> usize {
    let n = encode_bytes_header(data.len(), buf);
    buf.put_slice(data);
    n + data.len()
}

/// Encode only the header of a byte string of `len` bytes.
#[inline]
pub fn encode_bytes_header(len: usize, buf: &mut BytesMut) -> usize {
    encode_head(TYPE_BYTES, len as u64, buf)
}

/// Encode a text string.
pub fn encode_text(text: &str, buf: &mut BytesMut) -> usize {
    let n = encode_head(TYPE_TEXT, text.len() as u64, buf);
    buf.put_slice(text.as_bytes());
    n + text.len()
}

/// Open an indefinite-length array.
#[inline]
pub fn array_start(buf: &mut BytesMut) -> usize {
    buf.put_u8(ARRAY_START);
    1
}

/// Open an indefinite-length map.
#[inline]
pub fn map_start(buf: &mut BytesMut) -> usize {
    buf.put_u8(MAP_START);
    1
}

/// Close an indefinite-length item.
#[inline]
pub fn encode_break(buf: &mut BytesMut) -> usize {
    buf.put_u8(BREAK);
    1
}

/// Header length implied by the additional info of `header`.
pub fn head_len(header: u8) -> Result<usize, CodecError> {
    match header & INFO_MASK {
        info if info < INFO_UINT8 => Ok(1),
        INFO_UINT8 => Ok(2),
        INFO_UINT16 => Ok(3),
        INFO_UINT32 => Ok(5),
        INFO_UINT64 => Ok(9),
        info => Err(CodecError::ReservedInfo(info)),
    }
}

/// Decode the argument of a definite-length header, whatever its major type.
///
/// Returns the value and the number of bytes consumed.
pub fn decode_head(buf: &[u8]) -> Result<(u64, usize), CodecError> {
    let header = *buf.first().ok_or(CodecError::Truncated { need: 1, have: 0 })?;
    let n = head_len(header)?;
    if buf.len() < n {
        return Err(CodecError::Truncated {
            need: n,
            have: buf.len(),
        });
    }
    let value = match n {
        1 => (header & INFO_MASK) as u64,
        2 => buf[1] as u64,
        3 => u16::from_be_bytes([buf[1], buf[2]]) as u64,
        5 => u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as u64,
        _ => u64::from_be_bytes([
            buf[1], buf[2], buf[3], buf[4], buf[5], buf[6], buf[7], buf[8],
        ]),
    };
    Ok((value, n))
}

fn expect_major(buf: &[u8], major: u8) -> Result<(), CodecError> {
    match buf.first() {
        None => Err(CodecError::Truncated { need: 1, have: 0 }),
        Some(&b) if b & MAJOR_MASK == major => Ok(()),
        Some(&b) => Err(CodecError::UnexpectedType {
            expected: major,
            found: b,
        }),
    }
}

/// Decode an unsigned integer.
#[inline]
pub fn decode_uint(buf: &[u8]) -> Result<(u64, usize), CodecError> {
    expect_major(buf, TYPE_UINT)?;
    decode_head(buf)
}

/// Decode a tag header.
#[inline]
pub fn decode_tag(buf: &[u8]) -> Result<(u64, usize), CodecError> {
    expect_major(buf, TYPE_TAG)?;
    decode_head(buf)
}

/// Decode a byte string, borrowing its content from `buf`.
pub fn decode_bytes(buf: &[u8]) -> Result<(&[u8], usize), CodecError> {
    expect_major(buf, TYPE_BYTES)?;
    let (len, n) = decode_head(buf)?;
    let end = n
        .checked_add(len as usize)
        .filter(|&end| end <= buf.len())
        .ok_or(CodecError::Truncated {
            need: n.saturating_add(len as usize),
            have: buf.len(),
        })?;
    Ok((&buf[n..end], end))
}

/// Decode a text string, borrowing its content from `buf`.
pub fn decode_text(buf: &[u8]) -> Result<(&str, usize), CodecError> {
    expect_major(buf, TYPE_TEXT)?;
    let (len, n) = decode_head(buf)?;
    let end = n
        .checked_add(len as usize)
        .filter(|&end| end <= buf.len())
        .ok_or(CodecError::Truncated {
            need: n.saturating_add(len as usize),
            have: buf.len(),
        })?;
    let text = std::str::from_utf8(&buf[n..end]).map_err(|_| CodecError::InvalidUtf8)?;
    Ok((text, end))
}

/// Consume the header of an indefinite array.
pub fn decode_array_start(buf: &[u8]) -> Result<usize, CodecError> {
    expect_indefinite(buf, ARRAY_START)
}

/// Consume the header of an indefinite map.
pub fn decode_map_start(buf: &[u8]) -> Result<usize, CodecError> {
    expect_indefinite(buf, MAP_START)
}

fn expect_indefinite(buf: &[u8], header: u8) -> Result<usize, CodecError> {
    match buf.first() {
        None => Err(CodecError::Truncated { need: 1, have: 0 }),
        Some(&b) if b == header => Ok(1),
        Some(&b) if b & MAJOR_MASK == header & MAJOR_MASK => {
            Err(CodecError::ReservedInfo(b & INFO_MASK))
        }
        Some(&b) => Err(CodecError::UnexpectedType {
            expected: header & MAJOR_MASK,
            found: b,
        }),
    }
}

/// True when `buf` starts with a break stop code.
#[inline]
pub fn is_break(buf: &[u8]) -> bool {
    buf.first() == Some(&BREAK)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip_uint(x: u64) -> (u64, usize, usize) {
        let mut buf = BytesMut::new();
        let written = encode_uint(x, &mut buf);
        assert_eq!(written, buf.len());
        let (value, consumed) = decode_uint(&buf).unwrap();
        (value, consumed, written)
    }

    #[test]
    fn test_uint_tiers_are_minimal() {
        let cases: [(u64, usize); 12] = [
            (0, 1),
            (23, 1),
            (24, 2),
            (255, 2),
            (256, 3),
            (65_535, 3),
            (65_536, 5),
            (u32::MAX as u64, 5),
            (u32::MAX as u64 + 1, 9),
            (1 << 40, 9),
            (u64::MAX - 1, 9),
            (u64::MAX, 9),
        ];
        for (x, len) in cases {
            let (value, consumed, written) = roundtrip_uint(x);
            assert_eq!(value, x);
            assert_eq!(consumed, len, "consumed for {x}");
            assert_eq!(written, len, "written for {x}");
            assert_eq!(uint_len(x), len);
        }
    }

    #[test]
    fn test_uint_roundtrip_spread() {
        let mut x: u64 = 1;
        while x != 0 {
            for candidate in [x - 1, x, x.wrapping_add(1)] {
                let (value, consumed, written) = roundtrip_uint(candidate);
                assert_eq!(value, candidate);
                assert_eq!(consumed, written);
            }
            x = x.wrapping_shl(1);
        }
    }

    #[test]
    fn test_uint_big_endian_layout() {
        let mut buf = BytesMut::new();
        encode_uint(0x0102_0304, &mut buf);
        assert_eq!(&buf[..], &[0x1a, 0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn test_decode_rejects_short_input() {
        let mut buf = BytesMut::new();
        encode_uint(70_000, &mut buf);
        let err = decode_uint(&buf[..3]).unwrap_err();
        assert_eq!(err, CodecError::Truncated { need: 5, have: 3 });
        assert!(matches!(
            decode_uint(&[]),
            Err(CodecError::Truncated { need: 1, have: 0 })
        ));
    }

    #[test]
    fn test_decode_rejects_reserved_info() {
        assert_eq!(decode_uint(&[0x1c]), Err(CodecError::ReservedInfo(28)));
        assert_eq!(decode_uint(&[0x1f]), Err(CodecError::ReservedInfo(31)));
    }

    #[test]
    fn test_bytes_roundtrip() {
        for data in [&b""[..], b"a", b"hello world", &[0u8; 300][..]] {
            let mut buf = BytesMut::new();
            let written = encode_bytes(data, &mut buf);
            assert_eq!(buf[0] & MAJOR_MASK, TYPE_BYTES);
            let (decoded, consumed) = decode_bytes(&buf).unwrap();
            assert_eq!(decoded, data);
            assert_eq!(consumed, written);
        }
    }

    #[test]
    fn test_text_roundtrip() {
        for text in ["", "x", "gofast", "ünïcödé"] {
            let mut buf = BytesMut::new();
            let written = encode_text(text, &mut buf);
            let (decoded, consumed) = decode_text(&buf).unwrap();
            assert_eq!(decoded, text);
            assert_eq!(consumed, written);
        }
    }

    #[test]
    fn test_text_rejects_invalid_utf8() {
        let buf = [TYPE_TEXT | 2, 0xc3, 0x28];
        assert_eq!(decode_text(&buf), Err(CodecError::InvalidUtf8));
    }

    #[test]
    fn test_bytes_truncated_payload() {
        let mut buf = BytesMut::new();
        encode_bytes(b"abcdef", &mut buf);
        assert!(matches!(
            decode_bytes(&buf[..4]),
            Err(CodecError::Truncated { need: 7, have: 4 })
        ));
    }

    #[test]
    fn test_major_type_mismatch() {
        let mut buf = BytesMut::new();
        encode_text("abc", &mut buf);
        assert!(matches!(
            decode_bytes(&buf),
            Err(CodecError::UnexpectedType {
                expected: TYPE_BYTES,
                ..
            })
        ));
    }

    #[test]
    fn test_tag_roundtrip() {
        let mut buf = BytesMut::new();
        encode_tag(55_799, &mut buf);
        assert_eq!(&buf[..], &[0xd9, 0xd9, 0xf7]);
        assert_eq!(decode_tag(&buf).unwrap(), (55_799, 3));
    }

    #[test]
    fn test_indefinite_containers() {
        let mut buf = BytesMut::new();
        array_start(&mut buf);
        encode_uint(1, &mut buf);
        encode_break(&mut buf);
        map_start(&mut buf);
        encode_break(&mut buf);

        assert_eq!(decode_array_start(&buf).unwrap(), 1);
        assert!(is_break(&buf[2..]));
        assert_eq!(decode_map_start(&buf[3..]).unwrap(), 1);
        assert!(is_break(&buf[4..]));

        // Definite-length array is not accepted.
        assert_eq!(decode_array_start(&[0x82]), Err(CodecError::ReservedInfo(2)));
        assert!(matches!(
            decode_map_start(&[ARRAY_START]),
            Err(CodecError::UnexpectedType { .. })
        ));
    }
}

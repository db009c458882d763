//! Frame buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` for zero-copy buffer management.
//! Implements a state machine for handling fragmented packets:
//! - `WaitingForPrefix`: need the 3-byte packet prefix and the complete
//!   byte-string length header that follows it
//! - `WaitingForBody`: length known, need N more body bytes
//!
//! A corrupt prefix or length header is fatal: the stream has no sync marker
//! other than the prefix itself, so nothing after it can be trusted.
//!
//! # Example
//!
//! ```
//! use gofast::protocol::{FrameBuffer, PACKET_PREFIX};
//!
//! let mut buffer = FrameBuffer::new();
//! let mut wire = PACKET_PREFIX.to_vec();
//! wire.extend_from_slice(&[0x42, 0xaa, 0xbb]); // bytes(2) + body
//!
//! let bodies = buffer.push(&wire).unwrap();
//! assert_eq!(&bodies[0][..], &[0xaa, 0xbb]);
//! ```

use bytes::{Bytes, BytesMut};

use crate::codec::cbor::{self, MAJOR_MASK, TYPE_BYTES};
use crate::error::{GofastError, Result};

/// CBOR tag 55799 header opening every packet.
pub const PACKET_PREFIX: [u8; 3] = [0xd9, 0xd9, 0xf7];

/// Default largest accepted packet body.
pub const DEFAULT_MAX_BODY_SIZE: usize = 16 * 1024 * 1024;

/// State machine for packet parsing.
#[derive(Debug, Clone, Copy)]
enum State {
    /// Waiting for prefix and length header.
    WaitingForPrefix,
    /// Length parsed, waiting for body bytes.
    WaitingForBody { remaining: usize },
}

/// Buffer for accumulating incoming bytes and extracting complete packet bodies.
///
/// All data is stored in a single `BytesMut`; bodies are split off and
/// frozen without copying.
pub struct FrameBuffer {
    /// Accumulated bytes from socket reads.
    buffer: BytesMut,
    /// Current parsing state.
    state: State,
    /// Largest accepted body.
    max_body_size: usize,
}

impl FrameBuffer {
    /// Create a new frame buffer with default settings.
    ///
    /// Default capacity: 64KB, max body: 16MB.
    pub fn new() -> Self {
        Self::with_capacity_and_max_body(64 * 1024, DEFAULT_MAX_BODY_SIZE)
    }

    /// Create a new frame buffer with custom max body size.
    pub fn with_max_body(max_body_size: usize) -> Self {
        Self::with_capacity_and_max_body(64 * 1024, max_body_size)
    }

    /// Create a new frame buffer with custom capacity and max body size.
    pub fn with_capacity_and_max_body(capacity: usize, max_body_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
            state: State::WaitingForPrefix,
            max_body_size,
        }
    }

    /// Push data into the buffer and extract all complete packet bodies.
    ///
    /// Partial data is buffered internally for the next push.
    ///
    /// # Errors
    ///
    /// Returns [`GofastError::Protocol`] on a bad prefix, a length header that
    /// is not a definite byte string, or a body over the maximum size.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Bytes>> {
        self.buffer.extend_from_slice(data);

        let mut bodies = Vec::new();
        while let Some(body) = self.try_extract_one()? {
            bodies.push(body);
        }
        Ok(bodies)
    }

    fn try_extract_one(&mut self) -> Result<Option<Bytes>> {
        match self.state {
            State::WaitingForPrefix => {
                let prefix_len = PACKET_PREFIX.len();
                let have = self.buffer.len().min(prefix_len);
                if self.buffer[..have] != PACKET_PREFIX[..have] {
                    return Err(GofastError::Protocol(format!(
                        "bad packet prefix {:02x?}",
                        &self.buffer[..have]
                    )));
                }
                if self.buffer.len() <= prefix_len {
                    return Ok(None);
                }

                let header = self.buffer[prefix_len];
                if header & MAJOR_MASK != TYPE_BYTES {
                    return Err(GofastError::Protocol(format!(
                        "packet length header {header:#04x} is not a byte string"
                    )));
                }
                let head_len = cbor::head_len(header)
                    .map_err(|e| GofastError::Protocol(format!("packet length: {e}")))?;
                if self.buffer.len() < prefix_len + head_len {
                    return Ok(None);
                }

                let (len, _) = cbor::decode_head(&self.buffer[prefix_len..])?;
                let len = usize::try_from(len).unwrap_or(usize::MAX);
                if len > self.max_body_size {
                    return Err(GofastError::Protocol(format!(
                        "packet body {} exceeds maximum {}",
                        len, self.max_body_size
                    )));
                }

                let _ = self.buffer.split_to(prefix_len + head_len);
                self.state = State::WaitingForBody { remaining: len };
                self.try_extract_one()
            }

            State::WaitingForBody { remaining } => {
                if self.buffer.len() < remaining {
                    return Ok(None);
                }
                let body = self.buffer.split_to(remaining).freeze();
                self.state = State::WaitingForPrefix;
                Ok(Some(body))
            }
        }
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Clear the buffer and reset state.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = State::WaitingForPrefix;
    }

    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match self.state {
            State::WaitingForPrefix => "WaitingForPrefix",
            State::WaitingForBody { .. } => "WaitingForBody",
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_packet(body: &[u8]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&PACKET_PREFIX);
        cbor::encode_bytes(body, &mut buf);
        buf.to_vec()
    }

    #[test]
    fn test_single_complete_packet() {
        let mut buffer = FrameBuffer::new();
        let bodies = buffer.push(&make_packet(b"hello")).unwrap();

        assert_eq!(bodies.len(), 1);
        assert_eq!(&bodies[0][..], b"hello");
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_multiple_packets_in_one_push() {
        let mut buffer = FrameBuffer::new();
        let mut combined = make_packet(b"first");
        combined.extend(make_packet(b"second"));
        combined.extend(make_packet(b"third"));

        let bodies = buffer.push(&combined).unwrap();
        let bodies: Vec<&[u8]> = bodies.iter().map(|b| &b[..]).collect();
        assert_eq!(bodies, vec![&b"first"[..], b"second", b"third"]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_fragmented_length_header() {
        let mut buffer = FrameBuffer::new();
        let body = vec![7u8; 300];
        let packet = make_packet(&body);
        // prefix + first byte of a 3-byte length header
        assert!(buffer.push(&packet[..4]).unwrap().is_empty());
        assert_eq!(buffer.state_name(), "WaitingForPrefix");

        let bodies = buffer.push(&packet[4..]).unwrap();
        assert_eq!(bodies.len(), 1);
        assert_eq!(bodies[0].len(), 300);
    }

    #[test]
    fn test_fragmented_body() {
        let mut buffer = FrameBuffer::new();
        let body = b"this is a longer body that will be fragmented";
        let packet = make_packet(body);

        let partial = PACKET_PREFIX.len() + 2 + 10;
        assert!(buffer.push(&packet[..partial]).unwrap().is_empty());
        assert_eq!(buffer.state_name(), "WaitingForBody");

        let bodies = buffer.push(&packet[partial..]).unwrap();
        assert_eq!(&bodies[0][..], body);
    }

    #[test]
    fn test_empty_body() {
        let mut buffer = FrameBuffer::new();
        let bodies = buffer.push(&make_packet(b"")).unwrap();
        assert_eq!(bodies.len(), 1);
        assert!(bodies[0].is_empty());
    }

    #[test]
    fn test_large_body() {
        let mut buffer = FrameBuffer::new();
        let body = vec![0xAB; 1024 * 1024];
        let bodies = buffer.push(&make_packet(&body)).unwrap();
        assert_eq!(bodies[0].len(), 1024 * 1024);
        assert!(bodies[0].iter().all(|&b| b == 0xAB));
    }

    #[test]
    fn test_max_body_validation() {
        let mut buffer = FrameBuffer::with_max_body(100);
        let result = buffer.push(&make_packet(&[0u8; 1000])[..8]);
        assert!(result.unwrap_err().to_string().contains("exceeds maximum"));
    }

    #[test]
    fn test_bad_prefix_is_fatal() {
        let mut buffer = FrameBuffer::new();
        assert!(buffer.push(&[0xd9, 0x00]).is_err());

        let mut buffer = FrameBuffer::new();
        assert!(matches!(
            buffer.push(b"GET / HTTP/1.1"),
            Err(GofastError::Protocol(_))
        ));
    }

    #[test]
    fn test_length_must_be_byte_string() {
        let mut buffer = FrameBuffer::new();
        let mut wire = PACKET_PREFIX.to_vec();
        wire.push(0x65); // text(5)
        assert!(buffer.push(&wire).is_err());

        let mut buffer = FrameBuffer::new();
        let mut wire = PACKET_PREFIX.to_vec();
        wire.push(0x5f); // indefinite byte string
        assert!(buffer.push(&wire).is_err());
    }

    #[test]
    fn test_clear_resets_state() {
        let mut buffer = FrameBuffer::new();
        let packet = make_packet(b"test");
        buffer.push(&packet[..5]).unwrap();
        assert_eq!(buffer.state_name(), "WaitingForBody");

        buffer.clear();
        assert_eq!(buffer.state_name(), "WaitingForPrefix");
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut buffer = FrameBuffer::new();
        let mut wire = make_packet(b"hi");
        wire.extend(make_packet(&[1u8; 40]));

        let mut all = Vec::new();
        for byte in &wire {
            all.extend(buffer.push(&[*byte]).unwrap());
        }
        assert_eq!(all.len(), 2);
        assert_eq!(&all[0][..], b"hi");
        assert_eq!(all[1].len(), 40);
    }
}

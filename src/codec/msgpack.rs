//! MsgPack payload encoding using `rmp-serde`.
//!
//! Message bodies travel as named MessagePack (struct-as-map), so a payload
//! can be inspected without the Rust type at hand. The flag word announces
//! this as [`ENCODING_MSGPACK`](crate::protocol::flags::ENCODING_MSGPACK).
//!
//! # Example
//!
//! ```
//! use gofast::codec::MsgPackCodec;
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Serialize, Deserialize, PartialEq, Debug)]
//! struct Message {
//!     id: u32,
//!     content: String,
//! }
//!
//! let msg = Message { id: 42, content: "hello".to_string() };
//! let encoded = MsgPackCodec::encode(&msg).unwrap();
//! let decoded: Message = MsgPackCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded, msg);
//! ```

use bytes::{BufMut, BytesMut};

use crate::error::Result;

/// MessagePack codec for message payloads.
pub struct MsgPackCodec;

impl MsgPackCodec {
    /// Encode a value to a fresh MsgPack byte vector.
    #[inline]
    pub fn encode<T: serde::Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(value)?)
    }

    /// Append the MsgPack encoding of `value` to `buf`.
    ///
    /// Returns the number of bytes written. Used on the send path to encode
    /// straight into pooled scratch buffers.
    pub fn encode_into<T: serde::Serialize + ?Sized>(
        value: &T,
        buf: &mut BytesMut,
    ) -> Result<usize> {
        let start = buf.len();
        let mut writer = (&mut *buf).writer();
        rmp_serde::encode::write_named(&mut writer, value)?;
        Ok(writer.into_inner().len() - start)
    }

    /// Decode MsgPack bytes to a value.
    #[inline]
    pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct TestStruct {
        id: u32,
        name: String,
        active: bool,
    }

    #[test]
    fn test_encode_decode_struct() {
        let original = TestStruct {
            id: 42,
            name: "test".to_string(),
            active: true,
        };

        let encoded = MsgPackCodec::encode(&original).unwrap();
        let decoded: TestStruct = MsgPackCodec::decode(&encoded).unwrap();

        assert_eq!(decoded, original);
    }

    #[test]
    fn test_encode_into_appends() {
        let mut buf = BytesMut::from(&b"xx"[..]);
        let n = MsgPackCodec::encode_into(&"hello", &mut buf).unwrap();

        assert_eq!(n, buf.len() - 2);
        assert_eq!(&buf[..2], b"xx");
        let decoded: String = MsgPackCodec::decode(&buf[2..]).unwrap();
        assert_eq!(decoded, "hello");
    }

    #[test]
    fn test_encode_into_matches_encode() {
        let value = TestStruct {
            id: 7,
            name: "seven".to_string(),
            active: false,
        };
        let mut buf = BytesMut::new();
        MsgPackCodec::encode_into(&value, &mut buf).unwrap();
        assert_eq!(&buf[..], &MsgPackCodec::encode(&value).unwrap()[..]);
    }

    #[test]
    fn test_structs_are_maps() {
        let test = TestStruct {
            id: 1,
            name: "x".to_string(),
            active: false,
        };

        let encoded = MsgPackCodec::encode(&test).unwrap();

        // fixmap, not fixarray
        assert_eq!(encoded[0] & 0xF0, 0x80);
    }

    #[test]
    fn test_decode_error_on_invalid_data() {
        let invalid = b"not valid msgpack";
        let result: Result<TestStruct> = MsgPackCodec::decode(invalid);
        assert!(result.is_err());
    }

    #[test]
    fn test_encode_decode_option() {
        let none_val: Option<i32> = None;
        let encoded = MsgPackCodec::encode(&none_val).unwrap();
        assert_eq!(encoded, vec![0xc0]);
        let decoded: Option<i32> = MsgPackCodec::decode(&encoded).unwrap();
        assert_eq!(decoded, None);
    }
}

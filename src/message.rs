//! Application messages.
//!
//! Every message type carries a numeric id agreed on by both peers in
//! advance. Ids below [`RESERVED_MESSAGE_IDS`] belong to the engine.
//!
//! # Example
//!
//! ```
//! use gofast::Message;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Greeting {
//!     text: String,
//! }
//!
//! impl Message for Greeting {
//!     const ID: u64 = 111;
//! }
//! ```

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::MsgPackCodec;
use crate::error::{GofastError, Result};

/// Message ids below this value are reserved for internal messages.
pub const RESERVED_MESSAGE_IDS: u64 = 16;

/// Default scratch reservation for an encoded message.
pub const DEFAULT_MAX_SIZE: usize = 256;

/// A typed message exchanged between peers.
pub trait Message: Serialize + DeserializeOwned + Send + 'static {
    /// Wire id of this message type.
    const ID: u64;

    /// Upper estimate of the encoded size, used to size scratch buffers.
    fn max_size(&self) -> usize {
        DEFAULT_MAX_SIZE
    }
}

/// Reject ids in the reserved range.
pub(crate) fn check_user_id(id: u64) -> Result<()> {
    if id < RESERVED_MESSAGE_IDS {
        return Err(GofastError::ReservedMessageId(id));
    }
    Ok(())
}

/// A received, not yet decoded message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Incoming {
    /// Message type id.
    pub msg_id: u64,
    /// MsgPack encoded body.
    pub data: Bytes,
}

impl Incoming {
    /// Create from raw parts.
    pub fn new(msg_id: u64, data: Bytes) -> Self {
        Self { msg_id, data }
    }

    /// Decode as `M`, checking the message id first.
    pub fn decode<M: Message>(&self) -> Result<M> {
        if self.msg_id != M::ID {
            return Err(GofastError::MessageMismatch {
                expected: M::ID,
                found: self.msg_id,
            });
        }
        MsgPackCodec::decode(&self.data)
    }

    /// True if this carries an `M`.
    #[inline]
    pub fn is<M: Message>(&self) -> bool {
        self.msg_id == M::ID
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Note {
        text: String,
    }

    impl Message for Note {
        const ID: u64 = 111;
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Other;

    impl Message for Other {
        const ID: u64 = 112;
    }

    #[test]
    fn test_decode_checks_id() {
        let data = MsgPackCodec::encode(&Note {
            text: "hello".into(),
        })
        .unwrap();
        let incoming = Incoming::new(111, Bytes::from(data));

        assert!(incoming.is::<Note>());
        assert_eq!(incoming.decode::<Note>().unwrap().text, "hello");
        assert!(matches!(
            incoming.decode::<Other>(),
            Err(GofastError::MessageMismatch {
                expected: 112,
                found: 111
            })
        ));
    }

    #[test]
    fn test_reserved_ids() {
        assert!(check_user_id(0).is_err());
        assert!(check_user_id(15).is_err());
        assert!(check_user_id(16).is_ok());
    }
}

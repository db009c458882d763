//! `Whoami` handshake message.
//!
//! Each side sends its identity as a request right after connecting and
//! answers the peer's request with the same message. `tags` lists the tag
//! plug-ins the sender wants to receive payloads wrapped in.

use serde::{Deserialize, Serialize};

use super::MSG_WHOAMI;
use crate::message::Message;

/// Protocol version string.
pub const PROTOCOL_VERSION: &str = "1.0.0";

/// Identity advertised during handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Whoami {
    /// Transport name.
    pub name: String,
    /// Protocol version, see [`PROTOCOL_VERSION`].
    pub version: String,
    /// Largest packet the sender accepts.
    pub buffer_size: usize,
    /// Tags the sender wants applied to packets it receives.
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Whoami {
    /// Identity for this build.
    pub fn new(name: impl Into<String>, buffer_size: usize, tags: Vec<String>) -> Self {
        Self {
            name: name.into(),
            version: PROTOCOL_VERSION.to_string(),
            buffer_size,
            tags,
        }
    }

    /// True when the peer speaks the same protocol version.
    pub fn is_compatible(&self) -> bool {
        self.version == PROTOCOL_VERSION
    }
}

impl Message for Whoami {
    const ID: u64 = MSG_WHOAMI;

    fn max_size(&self) -> usize {
        64 + self.name.len() + self.tags.iter().map(|t| t.len() + 1).sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::MsgPackCodec;

    #[test]
    fn test_whoami_roundtrip() {
        let whoami = Whoami::new("node-a", 1 << 20, vec!["zstd".into()]);
        assert!(whoami.is_compatible());

        let bytes = MsgPackCodec::encode(&whoami).unwrap();
        assert!(bytes.len() <= whoami.max_size());
        let decoded: Whoami = MsgPackCodec::decode(&bytes).unwrap();
        assert_eq!(decoded, whoami);
    }

    #[test]
    fn test_missing_tags_default_to_empty() {
        #[derive(Serialize)]
        struct Old<'a> {
            name: &'a str,
            version: &'a str,
            buffer_size: usize,
        }
        let bytes = MsgPackCodec::encode(&Old {
            name: "old",
            version: "0.9.0",
            buffer_size: 4096,
        })
        .unwrap();
        let decoded: Whoami = MsgPackCodec::decode(&bytes).unwrap();
        assert!(decoded.tags.is_empty());
        assert!(!decoded.is_compatible());
    }
}

//! Tag chain - pluggable payload transforms wrapped in self-describing tags.
//!
//! A tag plug-in is a pair of pure transforms identified by a CBOR tag
//! number. On send, every tag of the active [`TagChain`] wraps the payload
//! in registration order:
//!
//! ```text
//! tag(zstd) bytes( zstd( tag(msg) {id, data} ) )
//! ```
//!
//! On receive the tags are unwound in the order they appear, looked up in the
//! [`TagTable`] of every plug-in this endpoint knows.
//!
//! Which tags a peer sends with is decided at handshake: each side advertises
//! the tags it wants to receive, and the other side installs those it knows.

#[cfg(feature = "compression")]
mod zstd;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use bytes::BytesMut;

use crate::error::{GofastError, Result};

#[cfg(feature = "compression")]
pub use self::zstd::{ZstdTag, COMPRESSION_ZSTD};

/// Tag wrapping the message envelope.
pub const TAG_MSG: u64 = 37;
/// Envelope map key for the message type id.
pub const TAG_ID: u64 = 38;
/// Envelope map key for the encoded message bytes.
pub const TAG_DATA: u64 = 39;
/// Reserved for a gzip plug-in.
pub const TAG_GZIP: u64 = 40;
/// Reserved for an LZW plug-in.
pub const TAG_LZW: u64 = 41;
/// zstd plug-in.
pub const TAG_ZSTD: u64 = 42;

/// Free-form plug-in settings, e.g. `{"zstd.level": 3}`.
pub type TagSettings = serde_json::Map<String, serde_json::Value>;

/// Builds a tag plug-in from settings.
pub type TagFactory = fn(&TagSettings) -> Result<Arc<dyn Tag>>;

/// A payload transform identified by a CBOR tag number.
///
/// `encode` and `decode` append to `out` and return the number of bytes
/// appended. Both return 0 for empty input and never look past `input`.
/// `decode` must fail rather than append more than `limit` bytes; the input
/// comes from the peer and may expand without bound.
pub trait Tag: Send + Sync + 'static {
    /// CBOR tag number announcing this transform on the wire.
    fn id(&self) -> u64;

    /// Registration name advertised during handshake.
    fn name(&self) -> &'static str;

    /// Compression id reported in the flag word, 0 for non-compressing tags.
    fn compression(&self) -> u8 {
        0
    }

    /// Transform `input` for sending.
    fn encode(&self, input: &[u8], out: &mut BytesMut) -> Result<usize>;

    /// Undo [`encode`](Tag::encode), appending at most `limit` bytes.
    fn decode(&self, input: &[u8], out: &mut BytesMut, limit: usize) -> Result<usize>;
}

impl fmt::Debug for dyn Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tag")
            .field("id", &self.id())
            .field("name", &self.name())
            .finish()
    }
}

/// Registry of tag factories by name.
#[derive(Clone)]
pub struct TagRegistry {
    factories: BTreeMap<String, TagFactory>,
}

impl TagRegistry {
    /// Create a registry without any plug-in.
    pub fn new() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Registry with every plug-in compiled into this build.
    pub fn with_defaults() -> Self {
        #[allow(unused_mut)]
        let mut registry = Self::new();
        #[cfg(feature = "compression")]
        registry.register(zstd::NAME, ZstdTag::factory);
        registry
    }

    /// Register a factory under `name`, replacing any previous one.
    pub fn register(&mut self, name: &str, factory: TagFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    /// True if `name` is known.
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Instantiate every registered plug-in into a lookup table.
    pub fn build(&self, settings: &TagSettings) -> Result<TagTable> {
        let mut table = TagTable::default();
        for factory in self.factories.values() {
            let tag = factory(settings)?;
            if matches!(tag.id(), TAG_MSG | TAG_ID | TAG_DATA) {
                return Err(GofastError::Config(format!(
                    "tag {} uses reserved id {}",
                    tag.name(),
                    tag.id()
                )));
            }
            table.insert(tag);
        }
        Ok(table)
    }
}

impl Default for TagRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Every tag plug-in known locally, by id and by name.
#[derive(Debug, Default, Clone)]
pub struct TagTable {
    by_id: HashMap<u64, Arc<dyn Tag>>,
    by_name: HashMap<&'static str, Arc<dyn Tag>>,
}

impl TagTable {
    /// Add a plug-in instance.
    pub fn insert(&mut self, tag: Arc<dyn Tag>) {
        self.by_name.insert(tag.name(), tag.clone());
        self.by_id.insert(tag.id(), tag);
    }

    /// Look up by wire id.
    pub fn get(&self, id: u64) -> Option<&Arc<dyn Tag>> {
        self.by_id.get(&id)
    }

    /// Look up by name.
    pub fn by_name(&self, name: &str) -> Option<&Arc<dyn Tag>> {
        self.by_name.get(name)
    }

    /// Number of plug-ins.
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// True if no plug-in is known.
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Build the send chain for the tags a peer asked for.
    ///
    /// Names unknown locally are skipped and reported back so the caller can
    /// log the violation.
    pub fn chain_for<S: AsRef<str>>(&self, names: &[S]) -> (TagChain, Vec<String>) {
        let mut tags = Vec::with_capacity(names.len());
        let mut unknown = Vec::new();
        for name in names {
            match self.by_name(name.as_ref()) {
                Some(tag) => tags.push(tag.clone()),
                None => unknown.push(name.as_ref().to_string()),
            }
        }
        (TagChain { tags }, unknown)
    }
}

/// Ordered transforms applied on send.
#[derive(Debug, Default, Clone)]
pub struct TagChain {
    tags: Vec<Arc<dyn Tag>>,
}

impl TagChain {
    /// An empty chain (payload sent as is).
    pub fn empty() -> Self {
        Self::default()
    }

    /// Tags in application order.
    pub fn tags(&self) -> &[Arc<dyn Tag>] {
        &self.tags
    }

    /// True when nothing is applied.
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    /// Compression id of the first compressing tag, for the flag word.
    pub fn compression(&self) -> u8 {
        self.tags
            .iter()
            .map(|t| t.compression())
            .find(|&c| c != 0)
            .unwrap_or(0)
    }

    /// Names in application order.
    pub fn names(&self) -> Vec<&'static str> {
        self.tags.iter().map(|t| t.name()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    /// Reverses bytes; enough to observe ordering through a chain.
    struct Reverse;

    impl Tag for Reverse {
        fn id(&self) -> u64 {
            200
        }
        fn name(&self) -> &'static str {
            "reverse"
        }
        fn encode(&self, input: &[u8], out: &mut BytesMut) -> Result<usize> {
            out.extend(input.iter().rev());
            Ok(input.len())
        }
        fn decode(&self, input: &[u8], out: &mut BytesMut, _limit: usize) -> Result<usize> {
            self.encode(input, out)
        }
    }

    struct Reserved;

    impl Tag for Reserved {
        fn id(&self) -> u64 {
            TAG_MSG
        }
        fn name(&self) -> &'static str {
            "reserved"
        }
        fn encode(&self, input: &[u8], out: &mut BytesMut) -> Result<usize> {
            out.put_slice(input);
            Ok(input.len())
        }
        fn decode(&self, input: &[u8], out: &mut BytesMut, _limit: usize) -> Result<usize> {
            self.encode(input, out)
        }
    }

    fn reverse_factory(_: &TagSettings) -> Result<Arc<dyn Tag>> {
        Ok(Arc::new(Reverse))
    }

    fn reserved_factory(_: &TagSettings) -> Result<Arc<dyn Tag>> {
        Ok(Arc::new(Reserved))
    }

    #[test]
    fn test_registry_build_and_lookup() {
        let mut registry = TagRegistry::new();
        registry.register("reverse", reverse_factory);
        assert!(registry.contains("reverse"));

        let table = registry.build(&TagSettings::new()).unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(200).unwrap().name(), "reverse");
        assert!(table.by_name("reverse").is_some());
        assert!(table.get(201).is_none());
    }

    #[test]
    fn test_reserved_ids_rejected() {
        let mut registry = TagRegistry::new();
        registry.register("reserved", reserved_factory);
        assert!(matches!(
            registry.build(&TagSettings::new()),
            Err(GofastError::Config(_))
        ));
    }

    #[test]
    fn test_chain_for_skips_unknown() {
        let mut registry = TagRegistry::new();
        registry.register("reverse", reverse_factory);
        let table = registry.build(&TagSettings::new()).unwrap();

        let (chain, unknown) = table.chain_for(&["lzw", "reverse"]);
        assert_eq!(chain.names(), vec!["reverse"]);
        assert_eq!(unknown, vec!["lzw".to_string()]);
        assert_eq!(chain.compression(), 0);
    }

    #[test]
    fn test_empty_chain() {
        let chain = TagChain::empty();
        assert!(chain.is_empty());
        assert_eq!(chain.compression(), 0);
    }

    #[cfg(feature = "compression")]
    #[test]
    fn test_defaults_include_zstd() {
        let registry = TagRegistry::with_defaults();
        assert!(registry.contains("zstd"));
        let table = registry.build(&TagSettings::new()).unwrap();
        assert_eq!(table.get(TAG_ZSTD).unwrap().name(), "zstd");
    }
}

//! Transport configuration.
//!
//! Every field has a default, so a partial JSON document is enough:
//!
//! ```
//! use gofast::Config;
//!
//! let config = Config::from_json(r#"{"name": "node-a", "tags": ["zstd"]}"#).unwrap();
//! assert_eq!(config.name, "node-a");
//! assert_eq!(config.batch_size, gofast::config::DEFAULT_BATCH_SIZE);
//! ```

use std::ops::Range;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GofastError, Result};
use crate::tags::{TagRegistry, TagSettings};

/// Default transport name.
pub const DEFAULT_NAME: &str = "gofast";

/// Default largest packet accepted from the peer.
pub const DEFAULT_BUFFER_SIZE: usize = 16 * 1024 * 1024;

/// Default batch size that forces a flush.
pub const DEFAULT_BATCH_SIZE: usize = 64 * 1024;

/// Default capacity of the writer and reader channels.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Default interval flushing idle batches.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(10);

/// Default per-stream inbox capacity.
pub const DEFAULT_STREAM_CAPACITY: usize = 64;

/// Default bound on concurrently running handlers.
pub const DEFAULT_MAX_CONCURRENT_HANDLERS: usize = 1024;

/// Default handshake deadline.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default number of packet scratch buffers.
pub const DEFAULT_POOL_CAPACITY: usize = 1024;

/// First opaque of the dialer's default range.
pub const DIALER_OPAQUE_START: u64 = 0x100;

/// First opaque of the acceptor's default range.
pub const ACCEPTOR_OPAQUE_START: u64 = 0x1_0000_0000;

/// Size of the default opaque ranges.
pub const DEFAULT_OPAQUE_COUNT: u64 = 0x1_0000;

/// Which end of the connection this transport is.
///
/// Only decides the default opaque range, so that two peers built from the
/// same code never pick colliding ids.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Opened the connection.
    #[default]
    Dialer,
    /// Accepted the connection.
    Acceptor,
}

impl Role {
    /// Default opaque range of this role.
    pub fn opaque_range(self) -> Range<u64> {
        let start = match self {
            Role::Dialer => DIALER_OPAQUE_START,
            Role::Acceptor => ACCEPTOR_OPAQUE_START,
        };
        start..start + DEFAULT_OPAQUE_COUNT
    }
}

/// Transport configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Name advertised to the peer.
    pub name: String,
    /// Connection end.
    pub role: Role,
    /// Largest packet accepted from the peer, advertised at handshake.
    pub buffer_size: usize,
    /// Pending bytes that force the writer to flush.
    pub batch_size: usize,
    /// Capacity of the writer command and received packet channels.
    pub channel_capacity: usize,
    /// Idle batches are flushed at this interval.
    #[serde(with = "millis")]
    pub flush_interval: Duration,
    /// Period of keepalive posts; disabled when `None`.
    #[serde(with = "opt_millis")]
    pub heartbeat: Option<Duration>,
    /// Opaque ids this side allocates from; the role default when `None`.
    pub opaque_range: Option<Range<u64>>,
    /// Tags the peer should apply to packets sent to us.
    pub tags: Vec<String>,
    /// Settings passed to tag factories.
    pub tag_settings: TagSettings,
    /// Buffered messages per stream inbox.
    pub stream_capacity: usize,
    /// Handlers allowed to run at once.
    pub max_concurrent_handlers: usize,
    /// Deadline for the peer's identity.
    #[serde(with = "millis")]
    pub handshake_timeout: Duration,
    /// Packet scratch buffers; senders wait when all are in use.
    pub pool_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: DEFAULT_NAME.to_string(),
            role: Role::default(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            batch_size: DEFAULT_BATCH_SIZE,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            heartbeat: None,
            opaque_range: None,
            tags: Vec::new(),
            tag_settings: TagSettings::new(),
            stream_capacity: DEFAULT_STREAM_CAPACITY,
            max_concurrent_handlers: DEFAULT_MAX_CONCURRENT_HANDLERS,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            pool_capacity: DEFAULT_POOL_CAPACITY,
        }
    }
}

impl Config {
    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Set the transport name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the role.
    pub fn role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    /// Set the largest packet accepted.
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Set the flush threshold.
    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Set the channel capacity.
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    /// Set the idle flush interval.
    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Enable keepalive posts every `period`.
    pub fn heartbeat(mut self, period: Duration) -> Self {
        self.heartbeat = Some(period);
        self
    }

    /// Allocate opaques from `range` instead of the role default.
    pub fn opaque_range(mut self, range: Range<u64>) -> Self {
        self.opaque_range = Some(range);
        self
    }

    /// Ask the peer to apply tag `name`.
    pub fn tag(mut self, name: impl Into<String>) -> Self {
        self.tags.push(name.into());
        self
    }

    /// Set a tag factory setting.
    pub fn tag_setting(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.tag_settings.insert(key.into(), value);
        self
    }

    /// Set the per-stream inbox capacity.
    pub fn stream_capacity(mut self, capacity: usize) -> Self {
        self.stream_capacity = capacity;
        self
    }

    /// Set the handler concurrency bound.
    pub fn max_concurrent_handlers(mut self, max: usize) -> Self {
        self.max_concurrent_handlers = max;
        self
    }

    /// Set the handshake deadline.
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set the number of packet scratch buffers.
    pub fn pool_capacity(mut self, capacity: usize) -> Self {
        self.pool_capacity = capacity;
        self
    }

    /// Opaque range in effect.
    pub fn effective_opaque_range(&self) -> Range<u64> {
        self.opaque_range
            .clone()
            .unwrap_or_else(|| self.role.opaque_range())
    }

    /// Writer settings derived from this configuration.
    pub fn writer(&self) -> WriterConfig {
        WriterConfig {
            batch_size: self.batch_size,
            channel_capacity: self.channel_capacity,
            flush_interval: self.flush_interval,
        }
    }

    /// Check values that would stall or break a transport.
    pub fn validate(&self, tags: &TagRegistry) -> Result<()> {
        let positive = [
            ("buffer_size", self.buffer_size),
            ("batch_size", self.batch_size),
            ("channel_capacity", self.channel_capacity),
            ("stream_capacity", self.stream_capacity),
            ("max_concurrent_handlers", self.max_concurrent_handlers),
            ("pool_capacity", self.pool_capacity),
        ];
        if let Some((field, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(GofastError::Config(format!("{field} must be positive")));
        }
        if self.flush_interval.is_zero() {
            return Err(GofastError::Config("flush_interval must be positive".into()));
        }
        if self.heartbeat.is_some_and(|p| p.is_zero()) {
            return Err(GofastError::Config("heartbeat must be positive".into()));
        }
        let range = self.effective_opaque_range();
        if range.is_empty() {
            return Err(GofastError::Config(format!(
                "empty opaque range {:#x}..{:#x}",
                range.start, range.end
            )));
        }
        if let Some(unknown) = self.tags.iter().find(|t| !tags.contains(t)) {
            return Err(GofastError::UnknownTag(unknown.clone()));
        }
        Ok(())
    }
}

/// Configuration for the writer task.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Pending bytes that force a flush.
    pub batch_size: usize,
    /// Channel capacity for the command queue.
    pub channel_capacity: usize,
    /// Idle flush interval.
    pub flush_interval: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Config::default().writer()
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

mod opt_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
    }
}

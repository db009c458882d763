//! Transport statistics.
//!
//! Each transport owns a [`Stats`] block of monotonic counters bumped by its
//! pipeline tasks. A [`StatsRegistry`] collects the live transports of a
//! process (or of whatever scope the caller chooses) for reporting.

use std::collections::BTreeMap;
use std::ops::Add;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::protocol::PacketKind;

macro_rules! counters {
    ($($field:ident: $doc:literal),* $(,)?) => {
        /// Live counters of one transport.
        #[derive(Debug, Default)]
        pub struct Stats {
            $(#[doc = $doc] pub $field: AtomicU64,)*
        }

        impl Stats {
            /// Copy every counter.
            pub fn snapshot(&self) -> StatsSnapshot {
                StatsSnapshot {
                    $($field: self.$field.load(Ordering::Relaxed),)*
                }
            }
        }

        /// Point-in-time copy of [`Stats`].
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
        pub struct StatsSnapshot {
            $(#[doc = $doc] pub $field: u64,)*
        }

        impl StatsSnapshot {
            /// Counters by name.
            pub fn to_map(&self) -> BTreeMap<&'static str, u64> {
                BTreeMap::from([$((stringify!($field), self.$field),)*])
            }
        }

        impl Add for StatsSnapshot {
            type Output = StatsSnapshot;

            fn add(self, rhs: StatsSnapshot) -> StatsSnapshot {
                StatsSnapshot {
                    $($field: self.$field + rhs.$field,)*
                }
            }
        }
    };
}

counters! {
    tx_packets: "Packets handed to the connection.",
    tx_bytes: "Bytes handed to the connection.",
    flushes: "Batched writes.",
    rx_packets: "Packets decoded from the connection.",
    rx_bytes: "Bytes read from the connection.",
    rx_posts: "Posts received.",
    rx_requests: "Requests received.",
    rx_stream_starts: "Stream starts received.",
    rx_stream_messages: "Interior stream messages received.",
    rx_finishes: "Finishes received.",
    dropped: "Packets dropped: unknown opaque, no handler, no capacity.",
    duplicates: "Starts received on an opaque already live.",
    protocol_errors: "Malformed bodies and illegal flag combinations.",
    heartbeats: "Heartbeats received.",
}

impl Stats {
    /// Create a shared block of zeroed counters.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Count one received packet of `kind`.
    pub(crate) fn rx_kind(&self, kind: PacketKind) {
        let counter = match kind {
            PacketKind::Post => &self.rx_posts,
            PacketKind::Request => &self.rx_requests,
            PacketKind::StreamStart => &self.rx_stream_starts,
            PacketKind::StreamMessage => &self.rx_stream_messages,
            PacketKind::Finish => &self.rx_finishes,
        };
        incr(counter);
    }
}

/// Bump a counter by one.
#[inline]
pub(crate) fn incr(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Bump a counter by `n`.
#[inline]
pub(crate) fn add(counter: &AtomicU64, n: usize) {
    counter.fetch_add(n as u64, Ordering::Relaxed);
}

impl Add for &StatsSnapshot {
    type Output = StatsSnapshot;

    fn add(self, rhs: &StatsSnapshot) -> StatsSnapshot {
        *self + *rhs
    }
}

impl std::iter::Sum for StatsSnapshot {
    fn sum<I: Iterator<Item = StatsSnapshot>>(iter: I) -> Self {
        iter.fold(StatsSnapshot::default(), Add::add)
    }
}

/// Collection of live transports' statistics, keyed by transport name.
///
/// Names need not be unique: a second transport registered under a taken
/// name is keyed `name#2`, the next `name#3`, and so on.
///
/// Cheaply cloneable; clones share the same entries.
#[derive(Debug, Clone, Default)]
pub struct StatsRegistry {
    entries: Arc<RwLock<BTreeMap<String, Arc<Stats>>>>,
}

impl StatsRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `stats` under `name`, or under the first free `name#N` when the
    /// name is taken. Returns the key to unregister with.
    pub fn register(&self, name: impl Into<String>, stats: Arc<Stats>) -> String {
        let name = name.into();
        let mut entries = self.entries.write();
        let key = if entries.contains_key(&name) {
            (2u64..)
                .map(|n| format!("{name}#{n}"))
                .find(|key| !entries.contains_key(key))
                .unwrap_or_default()
        } else {
            name
        };
        entries.insert(key.clone(), stats);
        key
    }

    /// Remove `name`. Returns its last counters.
    pub fn unregister(&self, name: &str) -> Option<StatsSnapshot> {
        self.entries.write().remove(name).map(|s| s.snapshot())
    }

    /// Counters of every registered transport.
    pub fn snapshot(&self) -> BTreeMap<String, StatsSnapshot> {
        self.entries
            .read()
            .iter()
            .map(|(name, stats)| (name.clone(), stats.snapshot()))
            .collect()
    }

    /// Sum over every registered transport.
    pub fn aggregate(&self) -> StatsSnapshot {
        self.entries.read().values().map(|s| s.snapshot()).sum()
    }

    /// Number of registered transports.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// True if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

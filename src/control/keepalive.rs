//! Heartbeat and ping messages.

use serde::{Deserialize, Serialize};

use super::{MSG_HEARTBEAT, MSG_PING};
use crate::message::Message;

/// Periodic keepalive post.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Heartbeats sent so far on this transport.
    pub count: u64,
}

impl Message for Heartbeat {
    const ID: u64 = MSG_HEARTBEAT;

    fn max_size(&self) -> usize {
        16
    }
}

/// Connectivity probe. The peer replies with the same `echo`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    /// Opaque value returned unchanged.
    pub echo: u64,
}

impl Message for Ping {
    const ID: u64 = MSG_PING;

    fn max_size(&self) -> usize {
        16
    }
}

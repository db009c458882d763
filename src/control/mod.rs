//! Internal messages answered by the engine itself.
//!
//! Ids below [`RESERVED_MESSAGE_IDS`](crate::message::RESERVED_MESSAGE_IDS)
//! never reach application handlers:
//!
//! | id | message       | exchange |
//! |----|---------------|----------|
//! | 1  | [`Whoami`]    | request, both sides at connect |
//! | 2  | [`Heartbeat`] | post, optional periodic keepalive |
//! | 3  | [`Ping`]      | request, echoed back |

mod keepalive;
mod whoami;

pub use keepalive::{Heartbeat, Ping};
pub use whoami::{Whoami, PROTOCOL_VERSION};

/// Message id of [`Whoami`].
pub const MSG_WHOAMI: u64 = 1;
/// Message id of [`Heartbeat`].
pub const MSG_HEARTBEAT: u64 = 2;
/// Message id of [`Ping`].
pub const MSG_PING: u64 = 3;

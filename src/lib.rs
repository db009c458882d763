//! # gofast
//!
//! Symmetric multiplexed RPC over a single byte stream.
//!
//! Both ends of a connection are peers: each can post one-way messages,
//! send requests and open bidirectional streams, and each answers the
//! other's through handlers registered per message type. Every exchange is
//! identified by an opaque id drawn from the sender's own range, so many
//! run concurrently over one connection.
//!
//! ## Wire format
//!
//! Packets use a small CBOR alphabet: a three byte prefix, the body length,
//! then a tagged array of opaque, flags and an optional message envelope.
//! Message bodies are MsgPack. Tag plug-ins such as [`tags::ZstdTag`]
//! transform envelopes on the way out and back.
//!
//! ## Architecture
//!
//! - **Writer task**: batches packets onto the connection
//! - **Reader task**: frames and decodes packets
//! - **Demultiplexer**: routes packets to pending requests, stream inboxes
//!   and handler tasks
//!
//! ## Example
//!
//! ```ignore
//! use gofast::{Message, Stream, Transport, connect_tcp};
//!
//! #[tokio::main]
//! async fn main() -> gofast::Result<()> {
//!     let transport = Transport::builder()
//!         .name("worker")
//!         .handle(|req: Add, mut stream: Stream| async move {
//!             stream.response(&Sum(req.0 + req.1), true).await
//!         })
//!         .connect(connect_tcp("127.0.0.1:7000").await?)
//!         .await?;
//!
//!     transport.closed().await;
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod config;
pub mod control;
pub mod error;
pub mod handler;
pub mod message;
pub mod pool;
pub mod protocol;
pub mod reader;
pub mod stats;
pub mod stream;
pub mod tags;
pub mod transport;
pub mod writer;

mod demux;
mod link;

pub use config::{Config, Role};
pub use error::{GofastError, Result};
pub use message::{Incoming, Message};
pub use stats::{Stats, StatsRegistry, StatsSnapshot};
pub use stream::Stream;
pub use transport::{connect_tcp, Connection, Transport, TransportBuilder};

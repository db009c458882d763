//! Transport: one connection, many concurrent exchanges.
//!
//! ```text
//!            ┌──────────── Transport ────────────┐
//! post    ─┐ │                                   │
//! request ─┼─┼─► build ─► writer task ─► write half
//! stream  ─┘ │                                   │
//!            │  handlers ◄─ demux ◄─ reader task ◄─ read half
//!            └───────────────────────────────────┘
//! ```
//!
//! Every task runs on a shared tracker and watches a single kill token.
//! The first task to end, for any reason, cancels it, which tears the
//! rest down: pending requests fail with
//! [`ConnectionClosed`](crate::GofastError::ConnectionClosed), stream
//! inboxes end, and waiters on the pools are released.
//!
//! # Example
//!
//! ```ignore
//! let transport = Transport::builder()
//!     .name("client")
//!     .handle(|ping: Ping, mut stream: Stream| async move {
//!         stream.response(&Pong(ping.0), true).await
//!     })
//!     .connect(connect_tcp("127.0.0.1:7000").await?)
//!     .await?;
//!
//! let pong: Pong = transport.request(&Ping(1), true).await?;
//! transport.close().await;
//! ```

mod builder;
mod conn;

pub use builder::TransportBuilder;
pub use conn::{connect_tcp, Connection};

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::control::{Ping, Whoami};
use crate::demux::Control;
use crate::error::{GofastError, Result};
use crate::link::{Link, HANDSHAKE_STEPS};
use crate::message::{check_user_id, Message};
use crate::protocol::PacketKind;
use crate::stats::StatsSnapshot;
use crate::stream::Stream;

/// A running transport.
///
/// Dropping it closes the connection without waiting for the tasks.
pub struct Transport {
    link: Arc<Link>,
    pings: AtomicU64,
}

impl Transport {
    /// Create a transport builder.
    pub fn builder() -> TransportBuilder {
        TransportBuilder::new()
    }

    fn new(link: Arc<Link>) -> Self {
        Self {
            link,
            pings: AtomicU64::new(0),
        }
    }

    /// Exchange identities, then wait until both directions are set up.
    async fn handshake(&self) -> Result<()> {
        let link = &self.link;
        let mut steps = link.handshake.subscribe();
        let exchange = async {
            let peer: Whoami = request_with(link, &link.whoami(), true).await?;
            if !peer.is_compatible() {
                warn!(
                    transport = link.name(),
                    peer = %peer.name,
                    version = %peer.version,
                    "peer speaks another protocol version"
                );
            }
            debug!(
                transport = link.name(),
                peer = %peer.name,
                tags = ?peer.tags,
                "peer identified"
            );
            link.peer.store(Some(Arc::new(peer)));
            link.handshake_step();
            steps
                .wait_for(|steps| *steps >= HANDSHAKE_STEPS)
                .await
                .map_err(|_| GofastError::ConnectionClosed)?;
            Ok::<_, GofastError>(())
        };

        tokio::select! {
            biased;
            _ = link.kill.cancelled() => Err(GofastError::ConnectionClosed),
            done = tokio::time::timeout(link.config.handshake_timeout, exchange) => {
                done.map_err(|_| GofastError::HandshakeTimeout)?
            }
        }
    }

    /// Send a one-way message.
    pub async fn post<M: Message>(&self, msg: &M, flush: bool) -> Result<()> {
        check_user_id(M::ID)?;
        post_with(&self.link, msg, flush).await
    }

    /// Send a request and wait for its response.
    ///
    /// Fails with [`EmptyResponse`](GofastError::EmptyResponse) when the
    /// peer finished the exchange without a message, which is also how a
    /// peer without a handler for `Q` answers.
    pub async fn request<Q: Message, R: Message>(&self, msg: &Q, flush: bool) -> Result<R> {
        check_user_id(Q::ID)?;
        request_with(&self.link, msg, flush).await
    }

    /// Open a bidirectional stream with `msg` as its first message.
    pub async fn stream<M: Message>(&self, msg: &M, flush: bool) -> Result<Stream> {
        check_user_id(M::ID)?;
        let link = &self.link;
        link.check_open()?;
        let lease = Arc::new(link.opaques.lease().await?);
        let opaque = lease.value();
        let packet = link
            .build_message(opaque, PacketKind::StreamStart, msg)
            .await?;

        let (inbox, rx) = mpsc::channel(link.config.stream_capacity);
        link.control(Control::Stream {
            lease: lease.clone(),
            inbox,
        })?;
        let stream = Stream::new(
            link.clone(),
            opaque,
            PacketKind::StreamStart,
            Some(lease),
            Some(rx),
        );
        link.writer.send(packet, flush).await?;
        Ok(stream)
    }

    /// Round trip time of an engine-level ping.
    pub async fn ping(&self) -> Result<Duration> {
        let echo = self.pings.fetch_add(1, Ordering::Relaxed);
        let start = Instant::now();
        let pong: Ping = request_with(&self.link, &Ping { echo }, true).await?;
        if pong.echo != echo {
            return Err(GofastError::Protocol(format!(
                "ping echoed {} instead of {echo}",
                pong.echo
            )));
        }
        Ok(start.elapsed())
    }

    /// Transport name.
    pub fn name(&self) -> &str {
        self.link.name()
    }

    /// Identity the peer announced during the handshake.
    pub fn peer(&self) -> Option<Arc<Whoami>> {
        self.link.peer.load_full()
    }

    /// Current counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.link.stats.snapshot()
    }

    /// Local address of the connection, if it has one.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.link.local_addr
    }

    /// Remote address of the connection, if it has one.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.link.peer_addr
    }

    /// True once the transport is shutting down.
    pub fn is_closed(&self) -> bool {
        self.link.kill.is_cancelled()
    }

    /// Wait until the transport shuts down, from either side.
    pub async fn closed(&self) {
        self.link.kill.cancelled().await;
    }

    /// Shut down and wait for every task, handlers included, to end.
    pub async fn close(&self) {
        self.link.kill.cancel();
        self.link.tracker.wait().await;
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.link.kill.cancel();
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("name", &self.link.name())
            .field("role", &self.link.config.role)
            .field("peer_addr", &self.link.peer_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Send a post on a freshly leased opaque. Does not check the message id.
pub(crate) async fn post_with<M: Message>(link: &Link, msg: &M, flush: bool) -> Result<()> {
    link.check_open()?;
    let lease = link.opaques.lease().await?;
    link.send_message(lease.value(), PacketKind::Post, msg, flush)
        .await
}

/// Send a request and wait for the reply. Does not check the message id.
async fn request_with<Q: Message, R: Message>(link: &Link, msg: &Q, flush: bool) -> Result<R> {
    link.check_open()?;
    let lease = link.opaques.lease().await?;
    let opaque = lease.value();
    // Built before registering so an oversized message leaves nothing behind.
    let packet = link.build_message(opaque, PacketKind::Request, msg).await?;

    let (reply, response) = oneshot::channel();
    link.control(Control::Request { lease, reply })?;
    link.writer.send(packet, flush).await?;

    let incoming = tokio::select! {
        biased;
        got = response => got.map_err(|_| GofastError::ConnectionClosed)?,
        _ = link.kill.cancelled() => return Err(GofastError::ConnectionClosed),
    };
    incoming.ok_or(GofastError::EmptyResponse)?.decode()
}

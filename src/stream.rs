//! Handle on one logical exchange.
//!
//! A [`Stream`] is what a handler receives with the first message of a
//! remote exchange, and what [`Transport::stream`](crate::Transport::stream)
//! returns for a local one. What it may do depends on the exchange:
//!
//! | exchange       | `response` | `stream` | `recv` |
//! |----------------|-----------|----------|--------|
//! | remote post    | no        | no       | no     |
//! | remote request | yes       | no       | no     |
//! | stream (either side) | yes | yes      | yes    |
//!
//! `response` sends a final message and closes the local direction;
//! `close` closes it without a message. Dropping a stream that is still
//! open sends a best-effort finish.
//!
//! The demux hears about a local close before the finish is queued. Once
//! the peer sees the finish it may reuse the opaque, and its next start
//! must find the old entry gone. A local stream also keeps its opaque
//! leased until the handle drops, so the opaque cannot open a new exchange
//! ahead of the finish.
//!
//! # Example
//!
//! ```ignore
//! // Handler side: echo every message back, then finish.
//! |first: Chunk, mut stream: Stream| async move {
//!     stream.stream(&first, false).await?;
//!     while let Some(msg) = stream.recv().await {
//!         stream.stream(&msg.decode::<Chunk>()?, false).await?;
//!     }
//!     stream.close().await
//! }
//! ```

use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::demux::Control;
use crate::error::{GofastError, Result};
use crate::link::Link;
use crate::message::{check_user_id, Incoming, Message};
use crate::pool::OpaqueLease;
use crate::protocol::PacketKind;

/// Runtime handle for one exchange.
pub struct Stream {
    link: Arc<Link>,
    opaque: u64,
    kind: PacketKind,
    /// Shared with the demux entry; only local exchanges hold one.
    lease: Option<Arc<OpaqueLease>>,
    inbox: Option<mpsc::Receiver<Incoming>>,
    closed: bool,
}

impl Stream {
    pub(crate) fn new(
        link: Arc<Link>,
        opaque: u64,
        kind: PacketKind,
        lease: Option<Arc<OpaqueLease>>,
        inbox: Option<mpsc::Receiver<Incoming>>,
    ) -> Self {
        Self {
            link,
            opaque,
            kind,
            lease,
            inbox,
            // Nothing to close on a post.
            closed: kind == PacketKind::Post,
        }
    }

    /// Exchange id.
    #[inline]
    pub fn opaque(&self) -> u64 {
        self.opaque
    }

    /// Shape of the exchange: `Post`, `Request` or `StreamStart`.
    #[inline]
    pub fn kind(&self) -> PacketKind {
        self.kind
    }

    /// True for exchanges this side opened.
    #[inline]
    pub fn is_local(&self) -> bool {
        self.lease.is_some()
    }

    /// True once the local direction is closed.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Send a final message and close the local direction.
    pub async fn response<M: Message>(&mut self, msg: &M, flush: bool) -> Result<()> {
        if self.kind == PacketKind::Post {
            return Err(GofastError::NotAllowed("a post cannot be answered"));
        }
        self.ensure_open()?;
        check_user_id(M::ID)?;
        // Closed even if the send fails: nothing may follow a final message.
        self.closed = true;
        self.link.control(Control::LocalClose {
            opaque: self.opaque,
        })?;
        self.link
            .send_message(self.opaque, PacketKind::Finish, msg, flush)
            .await
    }

    /// Send an interior stream message.
    pub async fn stream<M: Message>(&mut self, msg: &M, flush: bool) -> Result<()> {
        if self.kind != PacketKind::StreamStart {
            return Err(GofastError::NotAllowed("only streams carry interior messages"));
        }
        self.ensure_open()?;
        check_user_id(M::ID)?;
        self.link
            .send_message(self.opaque, PacketKind::StreamMessage, msg, flush)
            .await
    }

    /// Close the local direction with a bare finish.
    pub async fn close(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.closed = true;
        self.link.control(Control::LocalClose {
            opaque: self.opaque,
        })?;
        self.link.send_finish(self.opaque, true).await
    }

    /// Next message from the peer; `None` once the peer closed its direction
    /// or the transport went down.
    pub async fn recv(&mut self) -> Option<Incoming> {
        match &mut self.inbox {
            Some(inbox) => inbox.recv().await,
            None => None,
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(GofastError::StreamClosed);
        }
        self.link.check_open()
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let _ = self.link.control(Control::LocalClose {
            opaque: self.opaque,
        });
        self.link.try_finish(self.opaque);
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("opaque", &self.opaque)
            .field("kind", &self.kind)
            .field("local", &self.is_local())
            .field("closed", &self.closed)
            .finish()
    }
}

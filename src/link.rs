//! State shared by a transport, its streams and its pipeline tasks.

use std::net::SocketAddr;
use std::sync::Arc;

use arc_swap::{ArcSwap, ArcSwapOption};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::config::Config;
use crate::control::Whoami;
use crate::demux::Control;
use crate::error::{GofastError, Result};
use crate::message::Message;
use crate::pool::{OpaquePool, Pool, Pooled};
use crate::protocol::{Flags, PacketBuf, PacketKind};
use crate::stats::Stats;
use crate::tags::{TagChain, TagTable};
use crate::writer::WriterHandle;

/// Handshake steps: the peer's request handled, our request answered.
pub(crate) const HANDSHAKE_STEPS: u8 = 2;

pub(crate) struct Link {
    pub(crate) config: Config,
    pub(crate) kill: CancellationToken,
    pub(crate) tracker: TaskTracker,
    pub(crate) writer: WriterHandle,
    pub(crate) control: mpsc::UnboundedSender<Control>,
    pub(crate) packets: Pool<PacketBuf>,
    pub(crate) opaques: OpaquePool,
    /// Send chain, swapped in when the peer's handshake arrives.
    pub(crate) encoders: ArcSwap<TagChain>,
    pub(crate) decoders: Arc<TagTable>,
    pub(crate) peer: ArcSwapOption<Whoami>,
    pub(crate) stats: Arc<Stats>,
    pub(crate) handshake: watch::Sender<u8>,
    pub(crate) local_addr: Option<SocketAddr>,
    pub(crate) peer_addr: Option<SocketAddr>,
}

impl Link {
    #[inline]
    pub(crate) fn name(&self) -> &str {
        &self.config.name
    }

    pub(crate) fn check_open(&self) -> Result<()> {
        if self.kill.is_cancelled() {
            return Err(GofastError::ConnectionClosed);
        }
        Ok(())
    }

    /// Largest packet the peer accepts; unbounded until it said.
    fn peer_buffer_size(&self) -> usize {
        self.peer
            .load()
            .as_ref()
            .map_or(usize::MAX, |peer| peer.buffer_size)
    }

    /// Build a message packet in a pooled buffer.
    pub(crate) async fn build<M: Serialize + ?Sized>(
        &self,
        opaque: u64,
        flags: Flags,
        msg_id: u64,
        msg: &M,
        size_hint: usize,
    ) -> Result<Pooled<PacketBuf>> {
        self.check_open()?;
        let mut buf = self.packets.acquire().await?;
        let chain = self.encoders.load();
        buf.build_message(
            opaque,
            flags,
            msg_id,
            msg,
            size_hint,
            &chain,
            self.peer_buffer_size(),
        )?;
        Ok(buf)
    }

    /// Build a packet carrying a typed message.
    pub(crate) async fn build_message<M: Message>(
        &self,
        opaque: u64,
        kind: PacketKind,
        msg: &M,
    ) -> Result<Pooled<PacketBuf>> {
        self.build(opaque, kind.flags(), M::ID, msg, msg.max_size())
            .await
    }

    /// Build and send a typed message.
    pub(crate) async fn send_message<M: Message>(
        &self,
        opaque: u64,
        kind: PacketKind,
        msg: &M,
        flush: bool,
    ) -> Result<()> {
        let packet = self.build_message(opaque, kind, msg).await?;
        self.writer.send(packet, flush).await
    }

    /// Send a bare finish.
    pub(crate) async fn send_finish(&self, opaque: u64, flush: bool) -> Result<()> {
        self.check_open()?;
        let mut buf = self.packets.acquire().await?;
        buf.build_finish(opaque);
        self.writer.send(buf, flush).await
    }

    /// Queue a bare finish without waiting. Used from `Drop`.
    pub(crate) fn try_finish(&self, opaque: u64) {
        if self.kill.is_cancelled() {
            return;
        }
        let sent = self.packets.try_acquire().is_some_and(|mut buf| {
            buf.build_finish(opaque);
            self.writer.try_send(buf)
        });
        if !sent {
            debug!(opaque, "could not queue finish");
        }
    }

    /// Answer a start with a bare finish from a background task.
    pub(crate) fn refuse(self: &Arc<Self>, opaque: u64) {
        let link = self.clone();
        self.tracker.spawn(async move {
            if let Err(e) = link.send_finish(opaque, true).await {
                debug!(opaque, error = %e, "could not refuse exchange");
            }
        });
    }

    pub(crate) fn control(&self, control: Control) -> Result<()> {
        self.control
            .send(control)
            .map_err(|_| GofastError::ConnectionClosed)
    }

    /// Apply the tags the peer asked for to everything we send from now on.
    pub(crate) fn install_tags(&self, names: &[String]) {
        let (chain, unknown) = self.decoders.chain_for(names);
        for name in unknown {
            warn!(transport = self.name(), tag = %name, "peer requested unknown tag");
        }
        debug!(transport = self.name(), tags = ?chain.names(), "send tags installed");
        self.encoders.store(Arc::new(chain));
    }

    pub(crate) fn handshake_step(&self) {
        self.handshake.send_modify(|steps| *steps += 1);
    }

    /// Identity advertised to the peer.
    pub(crate) fn whoami(&self) -> Whoami {
        Whoami::new(
            self.config.name.clone(),
            self.config.buffer_size,
            self.config.tags.clone(),
        )
    }
}

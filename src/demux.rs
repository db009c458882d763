//! Demultiplexer: routes received packets to the exchange they belong to.
//!
//! The demux task is the only owner of the table of live opaques, so it
//! needs no locks. It listens on two channels with a fixed priority:
//!
//! ```text
//! local callers ──► Control (unbounded) ──┐  biased
//! reader        ──► RxPacket (bounded)  ──┴─► demux ─► pending replies
//!                                                     ─► stream inboxes
//!                                                     ─► handler tasks
//! ```
//!
//! A caller registers its exchange before sending the packet that opens
//! it, and controls are always drained before the next packet, so a reply
//! can never overtake its registration.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::control::{Heartbeat, Ping, Whoami, MSG_HEARTBEAT, MSG_PING, MSG_WHOAMI};
use crate::error::{GofastError, Result};
use crate::handler::HandlerRegistry;
use crate::link::Link;
use crate::message::{Incoming, Message, RESERVED_MESSAGE_IDS};
use crate::pool::OpaqueLease;
use crate::protocol::{PacketKind, RxPacket};
use crate::stats::{self, Stats};
use crate::stream::Stream;

/// Events from local callers.
pub(crate) enum Control {
    /// A request was built; resolve `reply` with the peer's finish.
    Request {
        lease: OpaqueLease,
        reply: oneshot::Sender<Option<Incoming>>,
    },
    /// A stream was built; deliver the peer's messages to `inbox`.
    Stream {
        lease: Arc<OpaqueLease>,
        inbox: mpsc::Sender<Incoming>,
    },
    /// The local direction of `opaque` is closed.
    LocalClose { opaque: u64 },
}

/// A live exchange.
enum Entry {
    /// Local request waiting for its reply.
    Pending {
        reply: oneshot::Sender<Option<Incoming>>,
        _lease: OpaqueLease,
    },
    /// Stream, or a remote request until answered.
    Open {
        /// `None` once the peer closed its direction.
        inbox: Option<mpsc::Sender<Incoming>>,
        local_closed: bool,
        /// Held for local exchanges only, together with their handle.
        _lease: Option<Arc<OpaqueLease>>,
    },
}

pub(crate) struct Demux {
    link: Arc<Link>,
    handlers: Arc<HandlerRegistry>,
    capacity: Arc<Semaphore>,
    entries: HashMap<u64, Entry>,
    stats: Arc<Stats>,
}

impl Demux {
    pub(crate) fn new(link: Arc<Link>, handlers: Arc<HandlerRegistry>) -> Self {
        let capacity = Arc::new(Semaphore::new(link.config.max_concurrent_handlers));
        let stats = link.stats.clone();
        Self {
            link,
            handlers,
            capacity,
            entries: HashMap::new(),
            stats,
        }
    }

    /// Run until the reader ends or the transport is killed.
    pub(crate) async fn run(
        mut self,
        mut control: mpsc::UnboundedReceiver<Control>,
        mut packets: mpsc::Receiver<RxPacket>,
    ) -> Result<()> {
        let kill = self.link.kill.clone();
        loop {
            tokio::select! {
                biased;

                _ = kill.cancelled() => break,

                Some(event) = control.recv() => self.on_control(event),

                packet = packets.recv() => match packet {
                    Some(packet) => self.on_packet(packet).await,
                    None => {
                        debug!(transport = self.link.name(), "receive side ended");
                        break;
                    }
                },
            }
        }
        debug!(
            transport = self.link.name(),
            live = self.entries.len(),
            "demux exiting"
        );
        Ok(())
    }

    fn on_control(&mut self, event: Control) {
        match event {
            Control::Request { lease, reply } => {
                self.entries.insert(
                    lease.value(),
                    Entry::Pending {
                        reply,
                        _lease: lease,
                    },
                );
            }
            Control::Stream { lease, inbox } => {
                self.entries.insert(
                    lease.value(),
                    Entry::Open {
                        inbox: Some(inbox),
                        local_closed: false,
                        _lease: Some(lease),
                    },
                );
            }
            Control::LocalClose { opaque } => {
                let done = match self.entries.get_mut(&opaque) {
                    Some(Entry::Open {
                        inbox,
                        local_closed,
                        ..
                    }) => {
                        *local_closed = true;
                        inbox.is_none()
                    }
                    _ => false,
                };
                if done {
                    self.entries.remove(&opaque);
                }
            }
        }
    }

    async fn on_packet(&mut self, packet: RxPacket) {
        let RxPacket {
            opaque,
            flags,
            message,
        } = packet;

        let Some(kind) = flags.kind() else {
            warn!(
                transport = self.link.name(),
                opaque,
                ?flags,
                "illegal flag combination"
            );
            stats::incr(&self.stats.protocol_errors);
            if flags.is_request() && !self.entries.contains_key(&opaque) {
                self.link.refuse(opaque);
            }
            return;
        };
        self.stats.rx_kind(kind);

        if kind.is_start() {
            if self.entries.contains_key(&opaque) {
                let e = GofastError::DuplicateRequest(opaque);
                warn!(transport = self.link.name(), error = %e, "dropping start");
                stats::incr(&self.stats.duplicates);
                // The live exchange keeps the table entry; the new one is
                // answered so its sender does not wait forever.
                if kind != PacketKind::Post {
                    self.link.refuse(opaque);
                }
                return;
            }
            let Some(message) = message else {
                warn!(transport = self.link.name(), opaque, ?kind, "start without message");
                stats::incr(&self.stats.protocol_errors);
                if kind != PacketKind::Post {
                    self.link.refuse(opaque);
                }
                return;
            };
            self.on_start(opaque, kind, message);
            return;
        }

        let Some(entry) = self.entries.get_mut(&opaque) else {
            debug!(transport = self.link.name(), opaque, ?kind, "no live exchange");
            stats::incr(&self.stats.dropped);
            return;
        };

        match entry {
            Entry::Pending { .. } => {
                if kind != PacketKind::Finish {
                    warn!(transport = self.link.name(), opaque, "stream message on a request");
                    stats::incr(&self.stats.protocol_errors);
                    return;
                }
                if let Some(Entry::Pending { reply, .. }) = self.entries.remove(&opaque) {
                    let _ = reply.send(message);
                }
            }
            Entry::Open {
                inbox,
                local_closed,
                ..
            } => {
                if kind == PacketKind::StreamMessage {
                    match message {
                        Some(message) => deliver(inbox, message, &self.link).await,
                        None => stats::incr(&self.stats.protocol_errors),
                    }
                    return;
                }
                if let Some(message) = message {
                    deliver(inbox, message, &self.link).await;
                }
                // Dropping the sender is the close notification.
                *inbox = None;
                if *local_closed {
                    self.entries.remove(&opaque);
                }
            }
        }
    }

    fn on_start(&mut self, opaque: u64, kind: PacketKind, message: Incoming) {
        if message.msg_id < RESERVED_MESSAGE_IDS {
            self.on_internal(opaque, kind, message);
            return;
        }

        if !self.handlers.contains(message.msg_id) {
            warn!(
                transport = self.link.name(),
                error = %GofastError::NotSubscribed(message.msg_id),
                opaque,
                "dropping start"
            );
            stats::incr(&self.stats.dropped);
            if kind != PacketKind::Post {
                self.link.refuse(opaque);
            }
            return;
        }

        let permit = match self.capacity.clone().try_acquire_owned() {
            Ok(p) => p,
            Err(_) => {
                warn!(
                    transport = self.link.name(),
                    opaque,
                    msg_id = message.msg_id,
                    "handler capacity reached, dropping start"
                );
                stats::incr(&self.stats.dropped);
                if kind != PacketKind::Post {
                    self.link.refuse(opaque);
                }
                return;
            }
        };

        let inbox = match kind {
            PacketKind::Post => None,
            PacketKind::Request => {
                self.entries.insert(
                    opaque,
                    Entry::Open {
                        inbox: None,
                        local_closed: false,
                        _lease: None,
                    },
                );
                None
            }
            _ => {
                let (tx, rx) = mpsc::channel(self.link.config.stream_capacity);
                self.entries.insert(
                    opaque,
                    Entry::Open {
                        inbox: Some(tx),
                        local_closed: false,
                        _lease: None,
                    },
                );
                Some(rx)
            }
        };

        let stream = Stream::new(self.link.clone(), opaque, kind, None, inbox);
        self.dispatch(message, stream, permit);
    }

    fn dispatch(&self, message: Incoming, stream: Stream, permit: OwnedSemaphorePermit) {
        let handlers = self.handlers.clone();
        let name = self.link.name().to_string();
        self.link.tracker.spawn(async move {
            // Permit is held until this task completes
            let _permit = permit;
            let msg_id = message.msg_id;
            if let Err(e) = handlers.dispatch(message, stream).await {
                warn!(transport = %name, msg_id, error = %e, "handler failed");
            }
        });
    }

    /// Engine messages: handshake, keepalive and ping.
    fn on_internal(&mut self, opaque: u64, kind: PacketKind, message: Incoming) {
        match (message.msg_id, kind) {
            (MSG_WHOAMI, PacketKind::Request) => match message.decode::<Whoami>() {
                Ok(peer) => {
                    if !peer.is_compatible() {
                        warn!(
                            transport = self.link.name(),
                            peer = %peer.name,
                            version = %peer.version,
                            "peer speaks another protocol version"
                        );
                    }
                    self.link.install_tags(&peer.tags);
                    self.link.handshake_step();
                    let whoami = self.link.whoami();
                    self.reply(opaque, whoami);
                }
                Err(e) => self.bad_internal(opaque, kind, e),
            },
            (MSG_PING, PacketKind::Request) => match message.decode::<Ping>() {
                Ok(ping) => self.reply(opaque, ping),
                Err(e) => self.bad_internal(opaque, kind, e),
            },
            (MSG_HEARTBEAT, PacketKind::Post) => match message.decode::<Heartbeat>() {
                Ok(beat) => {
                    stats::incr(&self.stats.heartbeats);
                    debug!(transport = self.link.name(), count = beat.count, "heartbeat");
                }
                Err(e) => self.bad_internal(opaque, kind, e),
            },
            (msg_id, _) => {
                self.bad_internal(opaque, kind, GofastError::ReservedMessageId(msg_id))
            }
        }
    }

    fn reply<M: Message + Sync>(&self, opaque: u64, msg: M) {
        let link = self.link.clone();
        self.link.tracker.spawn(async move {
            if let Err(e) = link
                .send_message(opaque, PacketKind::Finish, &msg, true)
                .await
            {
                debug!(opaque, error = %e, "could not answer engine request");
            }
        });
    }

    fn bad_internal(&self, opaque: u64, kind: PacketKind, error: GofastError) {
        warn!(transport = self.link.name(), opaque, ?kind, error = %error, "bad engine message");
        stats::incr(&self.stats.protocol_errors);
        if kind != PacketKind::Post {
            self.link.refuse(opaque);
        }
    }
}

/// Hand a message to a stream inbox, waiting for room.
///
/// A dropped receiver just discards the message.
async fn deliver(inbox: &mut Option<mpsc::Sender<Incoming>>, message: Incoming, link: &Link) {
    let Some(tx) = inbox.as_ref() else {
        stats::incr(&link.stats.protocol_errors);
        return;
    };
    tokio::select! {
        biased;
        _ = link.kill.cancelled() => {}
        sent = tx.send(message) => {
            if sent.is_err() {
                stats::incr(&link.stats.dropped);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::MsgPackCodec;
    use crate::config::Config;
    use crate::pool::{OpaquePool, Pool};
    use crate::protocol::{decode_body, FrameBuffer, PacketBuf};
    use crate::tags::{TagChain, TagTable};
    use crate::writer::spawn_writer_task;
    use arc_swap::{ArcSwap, ArcSwapOption};
    use bytes::Bytes;
    use serde::{Deserialize, Serialize};
    use std::collections::VecDeque;
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};
    use tokio::sync::watch;
    use tokio::task::JoinHandle;
    use tokio_util::sync::CancellationToken;
    use tokio_util::task::TaskTracker;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Word(String);

    impl Message for Word {
        const ID: u64 = 111;
    }

    struct Harness {
        link: Arc<Link>,
        rx: mpsc::Sender<RxPacket>,
        /// Peer end of the connection; sees what the demux sends.
        wire: DuplexStream,
        frames: FrameBuffer,
        bodies: VecDeque<Bytes>,
        task: JoinHandle<Result<()>>,
    }

    impl Harness {
        fn new(handlers: HandlerRegistry) -> Self {
            let (ours, wire) = duplex(64 * 1024);
            let config = Config::default();
            let kill = CancellationToken::new();
            let stats = Stats::new();
            let (writer, _) = spawn_writer_task(ours, config.writer(), stats.clone(), kill.clone());
            let (control, control_rx) = mpsc::unbounded_channel();
            let link = Arc::new(Link {
                packets: Pool::new(16, PacketBuf::default),
                opaques: OpaquePool::new(config.effective_opaque_range()).unwrap(),
                config,
                kill,
                tracker: TaskTracker::new(),
                writer,
                control,
                encoders: ArcSwap::from_pointee(TagChain::empty()),
                decoders: Arc::new(TagTable::default()),
                peer: ArcSwapOption::empty(),
                stats,
                handshake: watch::channel(0).0,
                local_addr: None,
                peer_addr: None,
            });
            let (rx, packets) = mpsc::channel(16);
            let demux = Demux::new(link.clone(), Arc::new(handlers));
            let task = tokio::spawn(demux.run(control_rx, packets));
            Self {
                link,
                rx,
                wire,
                frames: FrameBuffer::new(),
                bodies: VecDeque::new(),
                task,
            }
        }

        async fn feed(&self, opaque: u64, kind: PacketKind, message: Option<Incoming>) {
            let packet = RxPacket {
                opaque,
                flags: kind.flags(),
                message,
            };
            self.rx.send(packet).await.unwrap();
        }

        /// Next packet the demux side wrote.
        async fn sent(&mut self) -> RxPacket {
            let mut chunk = [0u8; 4096];
            while self.bodies.is_empty() {
                let n = self.wire.read(&mut chunk).await.unwrap();
                assert!(n > 0, "connection closed");
                self.bodies.extend(self.frames.push(&chunk[..n]).unwrap());
            }
            let body = self.bodies.pop_front().unwrap();
            decode_body(body, &TagTable::default(), usize::MAX).unwrap()
        }

        /// Wait until the demux drained everything fed so far.
        async fn settle(&self) {
            while self.rx.capacity() < self.rx.max_capacity() {
                tokio::task::yield_now().await;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }

    fn word(text: &str) -> Incoming {
        let data = MsgPackCodec::encode(&Word(text.into())).unwrap();
        Incoming::new(Word::ID, Bytes::from(data))
    }

    #[tokio::test]
    async fn test_pending_request_resolved_by_finish() {
        let h = Harness::new(HandlerRegistry::new());
        let lease = h.link.opaques.lease().await.unwrap();
        let opaque = lease.value();
        let (reply, response) = oneshot::channel();
        h.link.control(Control::Request { lease, reply }).unwrap();

        h.feed(opaque, PacketKind::Finish, Some(word("pong"))).await;
        let incoming = response.await.unwrap().unwrap();
        assert_eq!(incoming.decode::<Word>().unwrap(), Word("pong".into()));
    }

    #[tokio::test]
    async fn test_bare_finish_resolves_empty() {
        let h = Harness::new(HandlerRegistry::new());
        let lease = h.link.opaques.lease().await.unwrap();
        let opaque = lease.value();
        let (reply, response) = oneshot::channel();
        h.link.control(Control::Request { lease, reply }).unwrap();

        h.feed(opaque, PacketKind::Finish, None).await;
        assert!(response.await.unwrap().is_none());
        // Opaque released with the entry.
        h.settle().await;
        assert_eq!(h.link.opaques.leased(), 0);
    }

    #[tokio::test]
    async fn test_unknown_opaque_dropped() {
        let h = Harness::new(HandlerRegistry::new());
        h.feed(0x42, PacketKind::StreamMessage, Some(word("late"))).await;
        h.feed(0x42, PacketKind::Finish, None).await;
        h.settle().await;
        let stats = h.link.stats.snapshot();
        assert_eq!(stats.dropped, 2);
        assert_eq!(stats.rx_finishes, 1);
    }

    #[tokio::test]
    async fn test_duplicate_start_counted() {
        let h = Harness::new(HandlerRegistry::new());
        let lease = h.link.opaques.lease().await.unwrap();
        let opaque = lease.value();
        let (reply, _response) = oneshot::channel();
        h.link.control(Control::Request { lease, reply }).unwrap();

        h.feed(opaque, PacketKind::Request, Some(word("again"))).await;
        h.settle().await;
        assert_eq!(h.link.stats.snapshot().duplicates, 1);
    }

    #[tokio::test]
    async fn test_duplicate_request_refused() {
        let mut h = Harness::new(HandlerRegistry::new());
        let lease = h.link.opaques.lease().await.unwrap();
        let opaque = lease.value();
        let (reply, mut response) = oneshot::channel();
        h.link.control(Control::Request { lease, reply }).unwrap();

        h.feed(opaque, PacketKind::Request, Some(word("again"))).await;
        let refusal = h.sent().await;
        assert_eq!(refusal.opaque, opaque);
        assert_eq!(refusal.flags.kind(), Some(PacketKind::Finish));
        assert!(refusal.message.is_none());
        assert_eq!(h.link.stats.snapshot().duplicates, 1);
        // The live exchange is untouched.
        assert!(response.try_recv().is_err());
        h.feed(opaque, PacketKind::Finish, Some(word("late"))).await;
        assert!(response.await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_duplicate_post_not_answered() {
        let mut h = Harness::new(HandlerRegistry::new());
        let lease = h.link.opaques.lease().await.unwrap();
        let opaque = lease.value();
        let (reply, _response) = oneshot::channel();
        h.link.control(Control::Request { lease, reply }).unwrap();

        h.feed(opaque, PacketKind::Post, Some(word("again"))).await;
        h.settle().await;
        assert_eq!(h.link.stats.snapshot().duplicates, 1);
        // Nothing was written for the post; the next packet out is the ping reply.
        let data = MsgPackCodec::encode(&Ping { echo: 1 }).unwrap();
        h.feed(
            0x8000,
            PacketKind::Request,
            Some(Incoming::new(MSG_PING, Bytes::from(data))),
        )
        .await;
        assert_eq!(h.sent().await.opaque, 0x8000);
    }

    #[tokio::test]
    async fn test_answered_opaque_reusable_at_once() {
        let mut handlers = HandlerRegistry::new();
        handlers
            .register(|w: Word, mut stream: Stream| async move {
                stream.response(&w, true).await
            })
            .unwrap();
        let mut h = Harness::new(handlers);

        for round in 0..50 {
            let text = round.to_string();
            h.feed(0x5000, PacketKind::Request, Some(word(&text))).await;
            // The peer may reuse the opaque the moment it sees the finish.
            let reply = h.sent().await;
            assert_eq!(reply.opaque, 0x5000);
            assert_eq!(reply.message.unwrap().decode::<Word>().unwrap(), Word(text));
        }
        assert_eq!(h.link.stats.snapshot().duplicates, 0);
    }

    #[tokio::test]
    async fn test_unsubscribed_request_refused() {
        let mut h = Harness::new(HandlerRegistry::new());
        h.feed(0x7000, PacketKind::Request, Some(word("anyone?"))).await;

        let refusal = h.sent().await;
        assert_eq!(refusal.opaque, 0x7000);
        assert_eq!(refusal.flags.kind(), Some(PacketKind::Finish));
        assert!(refusal.message.is_none());
        assert_eq!(h.link.stats.snapshot().dropped, 1);
    }

    #[tokio::test]
    async fn test_illegal_flags_refused() {
        let mut h = Harness::new(HandlerRegistry::new());
        // R alone is not a valid exchange shape.
        let mut flags = PacketKind::Post.flags();
        flags.set_end_stream(false);
        h.rx
            .send(RxPacket {
                opaque: 0x9000,
                flags,
                message: Some(word("?")),
            })
            .await
            .unwrap();

        assert_eq!(h.sent().await.opaque, 0x9000);
        assert_eq!(h.link.stats.snapshot().protocol_errors, 1);
    }

    #[tokio::test]
    async fn test_request_handler_answers() {
        let mut handlers = HandlerRegistry::new();
        handlers
            .register(|w: Word, mut stream: Stream| async move {
                stream.response(&Word(w.0.replace("ping", "pong")), true).await
            })
            .unwrap();
        let mut h = Harness::new(handlers);
        h.feed(0x5000, PacketKind::Request, Some(word("ping"))).await;

        let reply = h.sent().await;
        assert_eq!(reply.opaque, 0x5000);
        assert_eq!(reply.flags.kind(), Some(PacketKind::Finish));
        let msg = reply.message.unwrap().decode::<Word>().unwrap();
        assert_eq!(msg, Word("pong".into()));
    }

    #[tokio::test]
    async fn test_stream_delivered_in_order_then_closed() {
        let (tx, mut seen) = mpsc::unbounded_channel();
        let mut handlers = HandlerRegistry::new();
        handlers
            .register(move |first: Word, mut stream: Stream| {
                let tx = tx.clone();
                async move {
                    tx.send(Some(first.0)).unwrap();
                    while let Some(msg) = stream.recv().await {
                        tx.send(Some(msg.decode::<Word>()?.0)).unwrap();
                    }
                    tx.send(None).unwrap();
                    stream.close().await
                }
            })
            .unwrap();
        let mut h = Harness::new(handlers);

        h.feed(0x6000, PacketKind::StreamStart, Some(word("0"))).await;
        for i in 1..5 {
            h.feed(0x6000, PacketKind::StreamMessage, Some(word(&i.to_string())))
                .await;
        }
        h.feed(0x6000, PacketKind::Finish, None).await;

        for i in 0..5 {
            assert_eq!(seen.recv().await.unwrap(), Some(i.to_string()));
        }
        assert_eq!(seen.recv().await.unwrap(), None);

        // The handler's own close.
        let fin = h.sent().await;
        assert_eq!(fin.opaque, 0x6000);
        assert_eq!(fin.flags.kind(), Some(PacketKind::Finish));
        // Both directions closed: a late message finds nothing.
        h.settle().await;
        h.feed(0x6000, PacketKind::StreamMessage, Some(word("late"))).await;
        h.settle().await;
        assert_eq!(h.link.stats.snapshot().dropped, 1);
    }

    #[tokio::test]
    async fn test_ping_echoed() {
        let mut h = Harness::new(HandlerRegistry::new());
        let data = MsgPackCodec::encode(&Ping { echo: 77 }).unwrap();
        h.feed(
            0x8000,
            PacketKind::Request,
            Some(Incoming::new(MSG_PING, Bytes::from(data))),
        )
        .await;

        let reply = h.sent().await;
        assert_eq!(reply.opaque, 0x8000);
        let pong = reply.message.unwrap().decode::<Ping>().unwrap();
        assert_eq!(pong.echo, 77);
    }

    #[tokio::test]
    async fn test_kill_fails_pending() {
        let h = Harness::new(HandlerRegistry::new());
        let lease = h.link.opaques.lease().await.unwrap();
        let (reply, response) = oneshot::channel();
        h.link.control(Control::Request { lease, reply }).unwrap();

        h.link.kill.cancel();
        assert!(response.await.is_err());
        assert!(h.task.await.unwrap().is_ok());
    }
}

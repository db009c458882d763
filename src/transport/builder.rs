//! Transport builder: handlers, tags and configuration, then connect.

use std::future::Future;
use std::sync::Arc;

use arc_swap::{ArcSwap, ArcSwapOption};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use super::conn::Connection;
use super::{post_with, Transport};
use crate::config::Config;
use crate::control::Heartbeat;
use crate::demux::Demux;
use crate::error::{GofastError, Result};
use crate::handler::{HandlerRegistry, HandlerResult};
use crate::link::Link;
use crate::message::Message;
use crate::pool::{OpaquePool, Pool};
use crate::protocol::PacketBuf;
use crate::reader::spawn_reader_task;
use crate::stats::{Stats, StatsRegistry};
use crate::stream::Stream;
use crate::tags::{TagChain, TagFactory, TagRegistry};
use crate::writer::spawn_writer_task;

/// Builder for configuring and connecting a [`Transport`].
///
/// Handlers must be registered here; the set is fixed once connected.
pub struct TransportBuilder {
    config: Config,
    tags: TagRegistry,
    handlers: HandlerRegistry,
    stats_registry: Option<StatsRegistry>,
    errors: Vec<GofastError>,
}

impl TransportBuilder {
    /// Create a builder with default configuration and every built-in tag.
    pub fn new() -> Self {
        Self {
            config: Config::default(),
            tags: TagRegistry::with_defaults(),
            handlers: HandlerRegistry::new(),
            stats_registry: None,
            errors: Vec::new(),
        }
    }

    /// Replace the configuration.
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Set the transport name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Replace the tag plug-ins.
    pub fn tags(mut self, tags: TagRegistry) -> Self {
        self.tags = tags;
        self
    }

    /// Add a tag plug-in.
    pub fn tag(mut self, name: &str, factory: TagFactory) -> Self {
        self.tags.register(name, factory);
        self
    }

    /// Subscribe a handler to messages of type `M`.
    ///
    /// A reserved message id is reported by [`connect`](Self::connect).
    pub fn handle<M, F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(M, Stream) -> Fut + Send + Sync + 'static,
        M: Message,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        if let Err(e) = self.handlers.register(handler) {
            self.errors.push(e);
        }
        self
    }

    /// Publish this transport's counters in `registry` while it is open.
    pub fn stats_registry(mut self, registry: StatsRegistry) -> Self {
        self.stats_registry = Some(registry);
        self
    }

    /// Start the transport over `conn` and run the handshake.
    ///
    /// This will:
    /// 1. Validate the configuration and instantiate tags
    /// 2. Spawn the writer, reader and demultiplexer tasks
    /// 3. Exchange identities with the peer
    ///
    /// On error every task is stopped before returning.
    pub async fn connect<C: Connection>(self, conn: C) -> Result<Transport> {
        if let Some(e) = self.errors.into_iter().next() {
            return Err(e);
        }
        let config = self.config;
        config.validate(&self.tags)?;
        let decoders = Arc::new(self.tags.build(&config.tag_settings)?);
        let opaques = OpaquePool::new(config.effective_opaque_range())?;

        let local_addr = conn.local_addr();
        let peer_addr = conn.peer_addr();
        let (read_half, write_half) = tokio::io::split(conn);

        let kill = CancellationToken::new();
        let tracker = TaskTracker::new();
        let stats = Stats::new();

        let (writer, writer_task) =
            spawn_writer_task(write_half, config.writer(), stats.clone(), kill.clone());
        let (packets, reader_task) = spawn_reader_task(
            read_half,
            config.buffer_size,
            config.channel_capacity,
            decoders.clone(),
            stats.clone(),
            kill.clone(),
        );
        let (control, control_rx) = mpsc::unbounded_channel();
        let (handshake, _) = watch::channel(0);

        let link = Arc::new(Link {
            packets: Pool::new(config.pool_capacity, PacketBuf::default),
            config,
            kill,
            tracker,
            writer,
            control,
            opaques,
            encoders: ArcSwap::from_pointee(TagChain::empty()),
            decoders,
            peer: ArcSwapOption::empty(),
            stats,
            handshake,
            local_addr,
            peer_addr,
        });

        let demux = Demux::new(link.clone(), Arc::new(self.handlers));
        let demux_task = tokio::spawn(demux.run(control_rx, packets));

        supervise(&link, "writer", writer_task);
        supervise(&link, "reader", reader_task);
        supervise(&link, "demux", demux_task);
        spawn_teardown(&link, self.stats_registry);
        if let Some(period) = link.config.heartbeat {
            spawn_heartbeat(&link, period);
        }
        link.tracker.close();

        info!(
            transport = link.name(),
            role = ?link.config.role,
            peer = ?link.peer_addr,
            "transport started"
        );

        let transport = Transport::new(link);
        if let Err(e) = transport.handshake().await {
            transport.close().await;
            return Err(e);
        }
        Ok(transport)
    }
}

impl Default for TransportBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Kill the transport once `task` ends, whatever the outcome.
fn supervise(link: &Arc<Link>, task_name: &'static str, task: JoinHandle<Result<()>>) {
    let kill = link.kill.clone();
    let name = link.name().to_string();
    link.tracker.spawn(async move {
        match task.await {
            Ok(Ok(())) => debug!(transport = %name, task = task_name, "task finished"),
            Ok(Err(e)) => error!(transport = %name, task = task_name, error = %e, "task failed"),
            Err(e) => error!(transport = %name, task = task_name, error = %e, "task panicked"),
        }
        kill.cancel();
    });
}

/// Release waiters and unpublish counters once killed.
fn spawn_teardown(link: &Arc<Link>, registry: Option<StatsRegistry>) {
    let registered = registry.map(|registry| {
        let key = registry.register(link.name(), link.stats.clone());
        (registry, key)
    });
    let link = link.clone();
    link.tracker.clone().spawn(async move {
        link.kill.cancelled().await;
        link.packets.close();
        link.opaques.close();
        if let Some((registry, key)) = registered {
            registry.unregister(&key);
        }
        info!(transport = link.name(), "transport closed");
    });
}

fn spawn_heartbeat(link: &Arc<Link>, period: std::time::Duration) {
    let link = link.clone();
    link.tracker.clone().spawn(async move {
        let mut tick = interval_at(Instant::now() + period, period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut count = 0u64;
        loop {
            tokio::select! {
                biased;
                _ = link.kill.cancelled() => break,
                _ = tick.tick() => {}
            }
            count += 1;
            if let Err(e) = post_with(&link, &Heartbeat { count }, true).await {
                debug!(transport = link.name(), error = %e, "heartbeat stopped");
                break;
            }
        }
    });
}

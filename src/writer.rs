//! Dedicated writer task batching packets onto the connection.
//!
//! Senders never touch the connection. They build a packet in a pooled
//! [`PacketBuf`] and hand it to the writer task over a bounded channel; the
//! task appends it to the current batch and writes the whole batch with one
//! `write_all` when a sender asked for a flush, when the batch reaches
//! `batch_size`, or when the flush interval ticks on a non-empty batch.
//!
//! # Architecture
//!
//! ```text
//! Caller 1 ─┐
//! Caller 2 ─┼─► mpsc::Sender<TxCommand> ─► Writer Task ─► write half
//! Caller N ─┘          (bounded)              │
//!                                             └─► oneshot result per flushing caller
//! ```
//!
//! A failed write fails every waiting sender and ends the task; the
//! transport treats that as a connection fault.

use std::io;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::WriterConfig;
use crate::error::{GofastError, Result};
use crate::pool::Pooled;
use crate::protocol::PacketBuf;
use crate::stats::{self, Stats};

/// Result reported to a flushing sender.
type FlushResult = std::result::Result<(), io::ErrorKind>;

/// A packet ready to be written.
#[derive(Debug)]
pub struct TxCommand {
    /// Built packet; returned to its pool once copied into the batch.
    pub packet: Pooled<PacketBuf>,
    /// Write the batch out right after this packet.
    pub flush: bool,
    /// Notified with the outcome of the write carrying this packet.
    pub done: Option<oneshot::Sender<FlushResult>>,
}

/// Handle for sending packets to the writer task.
///
/// This is cheaply cloneable and can be shared across tasks.
#[derive(Debug, Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<TxCommand>,
}

impl WriterHandle {
    /// Queue a packet.
    ///
    /// With `flush`, waits until the batch carrying the packet was written
    /// and reports the write's outcome. Without, returns once queued.
    pub async fn send(&self, packet: Pooled<PacketBuf>, flush: bool) -> Result<()> {
        if !flush {
            return self
                .tx
                .send(TxCommand {
                    packet,
                    flush,
                    done: None,
                })
                .await
                .map_err(|_| GofastError::ConnectionClosed);
        }

        let (done, result) = oneshot::channel();
        self.tx
            .send(TxCommand {
                packet,
                flush,
                done: Some(done),
            })
            .await
            .map_err(|_| GofastError::ConnectionClosed)?;
        match result.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(kind)) => Err(GofastError::Io(io::Error::new(kind, "batched write failed"))),
            Err(_) => Err(GofastError::ConnectionClosed),
        }
    }

    /// Queue a packet without waiting; dropped if the queue is full.
    ///
    /// Returns true if queued.
    pub fn try_send(&self, packet: Pooled<PacketBuf>) -> bool {
        self.tx
            .try_send(TxCommand {
                packet,
                flush: true,
                done: None,
            })
            .is_ok()
    }

    /// True once the writer task has ended.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Spawn the writer task and return a handle for sending packets.
///
/// The task ends when every handle is dropped, when `kill` is cancelled, or
/// on the first write error.
pub fn spawn_writer_task<W>(
    writer: W,
    config: WriterConfig,
    stats: Arc<Stats>,
    kill: CancellationToken,
) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity);
    let task = tokio::spawn(writer_loop(rx, writer, config, stats, kill));
    (WriterHandle { tx }, task)
}

/// Pending batch and the senders waiting on it.
struct Batch {
    bytes: BytesMut,
    packets: usize,
    waiters: Vec<oneshot::Sender<FlushResult>>,
}

impl Batch {
    fn push(&mut self, cmd: TxCommand) -> bool {
        self.bytes.extend_from_slice(cmd.packet.packet());
        self.packets += 1;
        if let Some(done) = cmd.done {
            self.waiters.push(done);
        }
        cmd.flush
    }

    fn is_empty(&self) -> bool {
        self.packets == 0
    }
}

async fn writer_loop<W>(
    mut rx: mpsc::Receiver<TxCommand>,
    mut writer: W,
    config: WriterConfig,
    stats: Arc<Stats>,
    kill: CancellationToken,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut batch = Batch {
        bytes: BytesMut::with_capacity(config.batch_size * 2),
        packets: 0,
        waiters: Vec::new(),
    };
    let mut tick = interval_at(Instant::now() + config.flush_interval, config.flush_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            _ = kill.cancelled() => {
                debug!(pending = batch.packets, "writer cancelled");
                return Ok(());
            }

            cmd = rx.recv() => {
                let Some(cmd) = cmd else {
                    if !batch.is_empty() {
                        write_batch(&mut writer, &mut batch, &stats, &kill).await?;
                    }
                    debug!("writer channel closed");
                    return Ok(());
                };

                let mut flush = batch.push(cmd);
                // Take whatever else is ready before deciding.
                while !flush && batch.bytes.len() < config.batch_size {
                    match rx.try_recv() {
                        Ok(cmd) => flush |= batch.push(cmd),
                        Err(_) => break,
                    }
                }
                if flush || batch.bytes.len() >= config.batch_size {
                    write_batch(&mut writer, &mut batch, &stats, &kill).await?;
                }
            }

            _ = tick.tick(), if !batch.is_empty() => {
                write_batch(&mut writer, &mut batch, &stats, &kill).await?;
            }
        }
    }
}

/// Write the batch out and notify its waiters.
async fn write_batch<W>(
    writer: &mut W,
    batch: &mut Batch,
    stats: &Stats,
    kill: &CancellationToken,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let write = async {
        writer.write_all(&batch.bytes).await?;
        writer.flush().await
    };
    let result = tokio::select! {
        result = write => result,
        // Waiters see their senders dropped.
        _ = kill.cancelled() => return Ok(()),
    };

    if result.is_ok() {
        trace!(bytes = batch.bytes.len(), packets = batch.packets, "flushed");
        stats::incr(&stats.flushes);
        stats::add(&stats.tx_packets, batch.packets);
        stats::add(&stats.tx_bytes, batch.bytes.len());
    }
    let outcome = result.as_ref().map(|_| ()).map_err(|e| e.kind());
    for done in batch.waiters.drain(..) {
        let _ = done.send(outcome);
    }
    result?;
    batch.bytes.clear();
    batch.packets = 0;
    Ok(())
}

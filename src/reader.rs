//! Reader task: bytes from the connection to decoded packets.
//!
//! ```text
//! read half ─► 64 KiB reads ─► FrameBuffer ─► decode_body ─► mpsc<RxPacket> ─► demux
//! ```
//!
//! Malformed bodies are dropped and counted; the stream stays usable since
//! framing is intact. End of stream, I/O errors and framing errors end the
//! task.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::Result;
use crate::protocol::{decode_body, FrameBuffer, RxPacket};
use crate::stats::{self, Stats};
use crate::tags::TagTable;

/// Size of a single read from the connection.
pub const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Spawn the reader task.
///
/// Decoded packets arrive on the returned bounded channel, which is what
/// pushes back on the peer when the demultiplexer falls behind.
/// `max_body_size` bounds both a frame and the payload a tag plug-in may
/// inflate it to.
pub fn spawn_reader_task<R>(
    reader: R,
    max_body_size: usize,
    capacity: usize,
    tags: Arc<TagTable>,
    stats: Arc<Stats>,
    kill: CancellationToken,
) -> (mpsc::Receiver<RxPacket>, JoinHandle<Result<()>>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(capacity);
    let frames = FrameBuffer::with_max_body(max_body_size);
    let task = tokio::spawn(reader_loop(
        reader,
        frames,
        max_body_size,
        tx,
        tags,
        stats,
        kill,
    ));
    (rx, task)
}

async fn reader_loop<R>(
    mut reader: R,
    mut frames: FrameBuffer,
    max_payload: usize,
    tx: mpsc::Sender<RxPacket>,
    tags: Arc<TagTable>,
    stats: Arc<Stats>,
    kill: CancellationToken,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = vec![0u8; READ_CHUNK_SIZE];

    loop {
        let n = tokio::select! {
            biased;
            _ = kill.cancelled() => return Ok(()),
            n = reader.read(&mut chunk) => n?,
        };
        if n == 0 {
            debug!(buffered = frames.len(), "connection closed by peer");
            return Ok(());
        }
        stats::add(&stats.rx_bytes, n);

        for body in frames.push(&chunk[..n])? {
            let packet = match decode_body(body, &tags, max_payload) {
                Ok(packet) => packet,
                Err(e) => {
                    warn!(error = %e, "dropping malformed packet");
                    stats::incr(&stats.protocol_errors);
                    continue;
                }
            };
            stats::incr(&stats.rx_packets);

            tokio::select! {
                biased;
                _ = kill.cancelled() => return Ok(()),
                sent = tx.send(packet) => {
                    if sent.is_err() {
                        debug!("demultiplexer gone, reader exiting");
                        return Ok(());
                    }
                }
            }
        }
    }
}

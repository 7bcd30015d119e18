//! Dedicated writer task for outbound frames.
//!
//! Serialization runs on its own task fed by an mpsc channel, so request
//! paths never contend on a transport lock. Ready frames are coalesced into
//! a single vectored write when the transport is a byte stream.
//!
//! ```text
//! request path ─┐
//! keepalive    ─┼─► mpsc::Sender<Bytes> ─► writer task ─► transport
//! dispatch     ─┘
//! ```
//!
//! Closing the channel (dropping every handle) is the serialize-side
//! shutdown signal; the writer task drains and exits cleanly.

use std::io::IoSlice;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{RSocketError, Result};

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Maximum frames coalesced into a single vectored write.
const MAX_BATCH_SIZE: usize = 64;

/// Configuration for the writer task.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Channel capacity for the frame queue.
    pub channel_capacity: usize,
    /// Coalesce ready frames into one vectored write. Message-oriented
    /// transports need one write per frame, so they disable this.
    pub coalesce: bool,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            coalesce: true,
        }
    }
}

/// Handle for queueing encoded frames to the writer task.
///
/// Cheaply cloneable; the bounded channel provides natural backpressure.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<Bytes>,
}

impl WriterHandle {
    /// Queue an encoded frame, waiting for channel capacity if needed.
    pub async fn send(&self, frame: Bytes) -> Result<()> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| RSocketError::ConnectionClosed)
    }

    /// Queue an encoded frame without waiting; fails when the queue is full.
    pub fn try_send(&self, frame: Bytes) -> Result<()> {
        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                RSocketError::Connection("Write queue full".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => RSocketError::ConnectionClosed,
        })
    }

    /// Ask the writer task to drain queued frames and exit, dropping its
    /// transport half. An empty buffer is the shutdown sentinel; real frames
    /// are never shorter than a header.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(Bytes::new()).await;
    }
}

/// Spawn the writer task and return a handle for queueing frames.
pub fn spawn_writer_task<W>(writer: W, config: WriterConfig) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity);
    let task = tokio::spawn(writer_loop(rx, writer, config.coalesce));
    (WriterHandle { tx }, task)
}

/// Main writer loop: receive frames, batch, write, flush.
async fn writer_loop<W>(mut rx: mpsc::Receiver<Bytes>, mut writer: W, coalesce: bool) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let max_batch = if coalesce { MAX_BATCH_SIZE } else { 1 };

    loop {
        let first = match rx.recv().await {
            Some(frame) => frame,
            // Channel closed: clean shutdown.
            None => return Ok(()),
        };
        if first.is_empty() {
            return Ok(());
        }

        let mut batch = Vec::with_capacity(max_batch);
        batch.push(first);
        let mut shutdown = false;
        while batch.len() < max_batch {
            match rx.try_recv() {
                Ok(frame) if frame.is_empty() => {
                    shutdown = true;
                    break;
                }
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        write_batch(&mut writer, &batch).await?;
        if shutdown {
            return Ok(());
        }
    }
}

/// Write a batch of frames with vectored I/O, handling partial writes.
async fn write_batch<W>(writer: &mut W, batch: &[Bytes]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let total_size: usize = batch.iter().map(|f| f.len()).sum();
    let mut total_written = 0;

    while total_written < total_size {
        let slices = remaining_slices(batch, total_written);
        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(RSocketError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// Build the IoSlice array for the data beyond `skip_bytes`.
fn remaining_slices(batch: &[Bytes], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len());
    let mut skipped = 0;

    for frame in batch {
        let end = skipped + frame.len();
        if skip_bytes < end {
            let start = skip_bytes.saturating_sub(skipped);
            slices.push(IoSlice::new(&frame[start..]));
        }
        skipped = end;
    }

    slices
}

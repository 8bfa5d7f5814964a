//! Writer task for the async client.
//!
//! Senders hand encoded frames to one task over a bounded channel; the task
//! coalesces whatever is queued into a single buffer and writes it in one
//! go. A full channel is the backpressure signal: `send` waits for room, up
//! to the configured timeout.
//!
//! ```text
//! send() ─┐
//! send() ─┼─► mpsc::Sender<Bytes> ─► writer task ─► TCP write half
//! send() ─┘
//! ```

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::task::JoinHandle;

use crate::error::{GatewayError, Result};

/// Frames that may wait for the writer before `send` blocks.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// How long `send` waits for room in a full channel.
pub const DEFAULT_BACKPRESSURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Most frames coalesced into one write.
const MAX_BATCH_FRAMES: usize = 64;

/// Writer task settings.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Frames queued ahead of the writer.
    pub channel_capacity: usize,
    /// Longest wait for room before `send` gives up.
    pub backpressure_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            backpressure_timeout: DEFAULT_BACKPRESSURE_TIMEOUT,
        }
    }
}

/// Sending side of the writer task. Cheap to clone.
#[derive(Debug, Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<Bytes>,
    timeout: Duration,
}

impl WriterHandle {
    /// Queue an encoded frame.
    ///
    /// Fails with [`GatewayError::BackpressureTimeout`] if the channel stays
    /// full for the configured timeout, and with
    /// [`GatewayError::ConnectionClosed`] once the writer task has ended.
    pub async fn send(&self, frame: Bytes) -> Result<()> {
        self.tx
            .send_timeout(frame, self.timeout)
            .await
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => GatewayError::BackpressureTimeout,
                SendTimeoutError::Closed(_) => GatewayError::ConnectionClosed,
            })
    }

    /// Frames queued and not yet picked up by the writer.
    pub fn pending_count(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}

/// Spawn the writer task over `writer`.
///
/// The task ends, shutting down the write half, once every handle is dropped.
pub fn spawn_writer_task<W>(writer: W, config: WriterConfig) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
    let handle = WriterHandle {
        tx,
        timeout: config.backpressure_timeout,
    };
    (handle, tokio::spawn(writer_loop(rx, writer)))
}

async fn writer_loop<W>(mut rx: mpsc::Receiver<Bytes>, mut writer: W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut out = BytesMut::new();

    while let Some(first) = rx.recv().await {
        out.extend_from_slice(&first);
        let mut frames = 1;
        while frames < MAX_BATCH_FRAMES {
            let Ok(frame) = rx.try_recv() else { break };
            out.extend_from_slice(&frame);
            frames += 1;
        }

        writer.write_all(&out).await?;
        writer.flush().await?;
        tracing::trace!("wrote {} frames, {} bytes", frames, out.len());
        out.clear();
    }

    writer.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt};

    #[test]
    fn test_writer_config_default() {
        let config = WriterConfig::default();
        assert_eq!(config.channel_capacity, DEFAULT_CHANNEL_CAPACITY);
        assert_eq!(config.backpressure_timeout, DEFAULT_BACKPRESSURE_TIMEOUT);
    }

    #[tokio::test]
    async fn test_frames_written_in_order() {
        let (client, mut server) = duplex(4096);
        let (handle, _task) = spawn_writer_task(client, WriterConfig::default());

        for i in 0..100u32 {
            handle.send(Bytes::copy_from_slice(&i.to_le_bytes())).await.unwrap();
        }

        let mut buf = vec![0u8; 400];
        server.read_exact(&mut buf).await.unwrap();
        for (i, chunk) in buf.chunks(4).enumerate() {
            assert_eq!(u32::from_le_bytes(chunk.try_into().unwrap()), i as u32);
        }
    }

    #[tokio::test]
    async fn test_full_channel_times_out() {
        // The peer never reads, so the writer stalls on its first frame.
        let (client, _server) = duplex(1);
        let config = WriterConfig {
            channel_capacity: 1,
            backpressure_timeout: Duration::from_millis(50),
        };
        let (handle, _task) = spawn_writer_task(client, config);

        handle.send(Bytes::from_static(b"stalled")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.send(Bytes::from_static(b"queued")).await.unwrap();
        assert_eq!(handle.pending_count(), 1);

        assert!(matches!(
            handle.send(Bytes::from_static(b"rejected")).await,
            Err(GatewayError::BackpressureTimeout)
        ));
    }

    #[tokio::test]
    async fn test_send_after_writer_ended() {
        let (client, server) = duplex(64);
        drop(server);
        let (handle, task) = spawn_writer_task(client, WriterConfig::default());

        // The first write hits the closed pipe and ends the task.
        handle.send(Bytes::from_static(b"x")).await.unwrap();
        assert!(task.await.unwrap().is_err());

        assert!(matches!(
            handle.send(Bytes::from_static(b"y")).await,
            Err(GatewayError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_shutdown_when_handles_dropped() {
        let (client, mut server) = duplex(4096);
        let (handle, task) = spawn_writer_task(client, WriterConfig::default());

        handle.send(Bytes::from_static(b"bye")).await.unwrap();
        drop(handle);

        assert!(task.await.unwrap().is_ok());
        let mut buf = Vec::new();
        server.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"bye");
    }
}

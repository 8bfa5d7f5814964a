//! Async endpoint client.
//!
//! [`GatewayClient`] is the remote side of the protocol: it connects to a
//! gateway, sends frames through a dedicated writer task and decodes
//! incoming frames on a read task. Test harnesses and emulators use it.
//!
//! # Example
//!
//! ```no_run
//! use kpa_gateway::{Command, GatewayClient, Payload};
//! use kpa_gateway::protocol::CommandArg;
//!
//! # async fn run() -> kpa_gateway::Result<()> {
//! let mut client = GatewayClient::connect("127.0.0.1:4000").await?;
//! client.send_command(Command::new(2, 3, vec![CommandArg::Word(5)])).await?;
//!
//! if let Some(frame) = client.recv().await {
//!     if let Payload::Receipt(receipt) = frame.payload {
//!         assert!(receipt.is_success());
//!     }
//! }
//! client.close().await?;
//! # Ok(())
//! # }
//! ```

use std::net::SocketAddr;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::protocol::{Command, FrameBuffer, TransportFrame};
use crate::writer::{spawn_writer_task, WriterConfig, WriterHandle};

/// Frames buffered between the read task and `recv`.
const INBOUND_CAPACITY: usize = 256;

/// Read buffer size.
const READ_BUFFER_SIZE: usize = 16 * 1024;

/// A connected protocol endpoint.
pub struct GatewayClient {
    writer: WriterHandle,
    frames: mpsc::Receiver<TransportFrame>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<Result<()>>,
}

impl GatewayClient {
    /// Connect with the default writer configuration.
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        Self::connect_with_config(addr, WriterConfig::default()).await
    }

    pub async fn connect_with_config(addr: impl ToSocketAddrs, config: WriterConfig) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let local_addr = stream.local_addr()?;
        let peer_addr = stream.peer_addr()?;

        let (reader, write_half) = stream.into_split();
        let (writer, writer_task) = spawn_writer_task(write_half, config);

        let (frames_tx, frames) = mpsc::channel(INBOUND_CAPACITY);
        let reader_task = tokio::spawn(async move {
            if let Err(e) = Self::read_loop(reader, frames_tx).await {
                tracing::error!("Read loop error: {}", e);
            }
        });

        tracing::debug!("connected {} -> {}", local_addr, peer_addr);
        Ok(Self {
            writer,
            frames,
            local_addr,
            peer_addr,
            reader_task,
            writer_task,
        })
    }

    /// Reassemble and decode frames until the peer closes.
    ///
    /// Undecodable frames are logged and skipped; an impossible length
    /// field ends the loop.
    async fn read_loop<R: AsyncRead + Unpin>(
        mut reader: R,
        frames: mpsc::Sender<TransportFrame>,
    ) -> Result<()> {
        let mut frame_buffer = FrameBuffer::new();
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => return Ok(()),
                Ok(n) => n,
                Err(e) => return Err(e.into()),
            };

            for raw in frame_buffer.push(&buf[..n])? {
                match TransportFrame::decode(&raw) {
                    Ok(frame) => {
                        if frames.send(frame).await.is_err() {
                            // Client dropped.
                            return Ok(());
                        }
                    }
                    Err(e) => tracing::warn!("dropping undecodable frame: {}", e),
                }
            }
        }
    }

    /// Encode and send a frame.
    pub async fn send(&self, frame: &TransportFrame) -> Result<()> {
        self.writer.send(frame.encode()?).await
    }

    /// Send a command stamped with the current time.
    pub async fn send_command(&self, command: Command) -> Result<()> {
        self.send(&TransportFrame::new(command)).await
    }

    /// Send bytes as-is. Useful for exercising the peer's error handling.
    pub async fn send_raw(&self, data: Bytes) -> Result<()> {
        self.writer.send(data).await
    }

    /// Next decoded frame, or `None` once the connection has closed.
    pub async fn recv(&mut self) -> Option<TransportFrame> {
        self.frames.recv().await
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Frames queued for writing.
    pub fn pending_frames(&self) -> usize {
        self.writer.pending_count()
    }

    /// Flush queued frames, close the write side and stop reading.
    pub async fn close(self) -> Result<()> {
        let Self {
            writer,
            reader_task,
            writer_task,
            ..
        } = self;

        drop(writer);
        let flushed = match writer_task.await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!("writer task failed: {}", e);
                Ok(())
            }
        };
        reader_task.abort();
        flushed
    }
}

impl std::fmt::Debug for GatewayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayClient")
            .field("local_addr", &self.local_addr)
            .field("peer_addr", &self.peer_addr)
            .finish_non_exhaustive()
    }
}

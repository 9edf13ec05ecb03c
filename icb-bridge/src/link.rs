//! Connection to the ICB server.
//!
//! The socket is split once: the read half goes to the group read loop,
//! which is its only reader, and the write half is owned by a single writer
//! task. Every outbound packet (login, ping replies, relayed room messages)
//! is queued to that task through a [`LinkWriter`], so frames from
//! concurrent callers are written whole and in queue order.

use std::future::Future;

use icb_proto::packet::{self, FrameReader, Packet, PacketError, ReadError};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Number of outbound packets that may wait for the writer task.
const WRITE_QUEUE_DEPTH: usize = 64;

/// Errors from writing to the ICB server.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    /// The writer task has stopped; nothing more can be sent.
    #[error("connection to group server closed")]
    Closed,

    /// The packet could not be encoded.
    #[error("cannot encode packet: {0}")]
    Encode(#[from] PacketError),

    /// An underlying I/O error occurred.
    #[error("group server I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A frame queued for the writer task.
#[derive(Debug)]
pub struct Outbound {
    frame: Vec<u8>,
    done: oneshot::Sender<Result<(), LinkError>>,
}

impl Outbound {
    /// The encoded frame, length prefix included.
    #[must_use]
    pub fn frame(&self) -> &[u8] {
        &self.frame
    }

    /// Decodes the queued frame back into a packet.
    ///
    /// # Errors
    ///
    /// Returns [`PacketError`] if the frame does not decode.
    pub fn packet(&self) -> Result<Packet, PacketError> {
        packet::decode(self.frame.get(1..).unwrap_or_default())
    }

    /// Reports the outcome of the write back to the caller.
    pub fn complete(self, result: Result<(), LinkError>) {
        // The caller may have given up waiting.
        let _ = self.done.send(result);
    }
}

/// Cloneable handle for sending packets to the ICB server.
#[derive(Debug, Clone)]
pub struct LinkWriter {
    tx: mpsc::Sender<Outbound>,
}

impl LinkWriter {
    /// Creates a writer and the receiving end of its queue.
    ///
    /// [`spawn_writer`] drains the receiver into a socket; tests can drain
    /// it directly to observe outbound packets.
    #[must_use]
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self { tx }, rx)
    }

    /// Sends one packet and waits until it has been written to the socket.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Encode`] if the packet cannot be framed,
    /// [`LinkError::Io`] if the socket write fails, and
    /// [`LinkError::Closed`] if the writer task is gone.
    pub async fn write(&self, packet: &Packet) -> Result<(), LinkError> {
        let frame = packet::encode(packet)?;
        let (done, ack) = oneshot::channel();
        self.tx
            .send(Outbound { frame, done })
            .await
            .map_err(|_| LinkError::Closed)?;
        ack.await.map_err(|_| LinkError::Closed)?
    }

    /// Whether the writer task is still accepting packets.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Spawns the writer task that owns `writer`.
///
/// The task stops at the first failed write; that caller gets the I/O error
/// and later callers get [`LinkError::Closed`].
pub fn spawn_writer<W>(writer: W) -> (LinkWriter, JoinHandle<()>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (link, rx) = LinkWriter::channel(WRITE_QUEUE_DEPTH);
    let handle = tokio::spawn(writer_loop(writer, rx));
    (link, handle)
}

async fn writer_loop<W: AsyncWrite + Unpin>(mut writer: W, mut rx: mpsc::Receiver<Outbound>) {
    while let Some(outbound) = rx.recv().await {
        match write_frame(&mut writer, &outbound.frame).await {
            Ok(()) => outbound.complete(Ok(())),
            Err(e) => {
                tracing::error!(error = %e, "write to group server failed");
                outbound.complete(Err(LinkError::Io(e)));
                break;
            }
        }
    }
    tracing::debug!("group writer task stopped");
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &[u8]) -> std::io::Result<()> {
    writer.write_all(frame).await?;
    writer.flush().await
}

/// Source of raw inbound frames.
///
/// Implemented by [`FrameReader`] over the socket's read half; the read loop
/// only depends on this trait.
pub trait PacketSource: Send {
    /// Reads the next frame payload.
    fn read(&mut self) -> impl Future<Output = Result<Vec<u8>, ReadError>> + Send;
}

impl<R: AsyncRead + Unpin + Send> PacketSource for FrameReader<R> {
    async fn read(&mut self) -> Result<Vec<u8>, ReadError> {
        self.read_frame().await
    }
}

/// A connected ICB link.
pub struct GroupLink {
    /// Frame reader over the socket's read half.
    pub reader: FrameReader<OwnedReadHalf>,
    /// Handle to the writer task.
    pub writer: LinkWriter,
    /// The writer task itself.
    pub writer_task: JoinHandle<()>,
}

/// Connects to the ICB server at `addr` and starts the writer task.
///
/// # Errors
///
/// Returns [`LinkError::Io`] if the TCP connection fails.
pub async fn connect(addr: &str) -> Result<GroupLink, LinkError> {
    let stream = TcpStream::connect(addr).await?;
    let peer = stream.peer_addr()?;
    tracing::info!(addr = %addr, peer = %peer, "connected to group server");

    let (read_half, write_half) = stream.into_split();
    let (writer, writer_task) = spawn_writer(write_half);
    Ok(GroupLink {
        reader: FrameReader::new(read_half),
        writer,
        writer_task,
    })
}

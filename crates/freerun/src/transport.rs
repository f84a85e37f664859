//! # Transport Abstraction
//!
//! A minimal interface for moving frame sets between a peer and the broker.
//!
//! ## Philosophy
//!
//! - **Frame-Oriented**: The transport moves multipart messages as opaque segments.
//!   It knows nothing about invocations or routing.
//! - **Non-Blocking Send**: `send` only enqueues. A writer task drains the queue, so
//!   neither the broker's router nor a caller ever waits on socket back-pressure.
//! - **Zero Linger**: `close` drops whatever is still queued.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::Mutex;
use tokio::sync::Notify;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::warn;

use freerpc::FrameSet;
use freerpc::frames::FrameSetDecoder;
use freerpc::frames::encode_frame_set;

use crate::endpoint::Endpoint;

/// Errors that occur at the network layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The peer is unreachable or the connection was dropped.
    ConnectionLost(String),
    /// The byte stream is not a valid sequence of frame sets.
    Framing(String),
    /// Generic I/O failure.
    Io(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            Self::Framing(msg) => write!(f, "Framing error: {}", msg),
            Self::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<freerpc::Error> for TransportError {
    fn from(e: freerpc::Error) -> Self {
        Self::Framing(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// A bidirectional pipe of frame sets.
///
/// This trait is object-safe (`Arc<dyn Transport>`).
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Queues a frame set for delivery.
    ///
    /// # Invariants
    /// - Must not block.
    /// - Must return `Err` once the transport is closed.
    fn send(&self, frames: FrameSet) -> Result<()>;

    /// Waits for the next frame set. `Ok(None)` means the connection is closed.
    async fn recv(&self) -> Result<Option<FrameSet>>;

    /// Closes the transport, discarding queued frames. Pending `recv` calls return `Ok(None)`.
    fn close(&self);
}

/// Reads frame sets off a byte stream.
pub(crate) struct FrameReader<R> {
    inner: R,
    decoder: FrameSetDecoder,
    chunk: Box<[u8]>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub(crate) fn new(inner: R) -> Self {
        Self {
            inner,
            decoder: FrameSetDecoder::new(),
            chunk: vec![0u8; 64 * 1024].into_boxed_slice(),
        }
    }

    pub(crate) async fn next(&mut self) -> Result<Option<FrameSet>> {
        loop {
            if let Some(set) = self.decoder.next_frame_set()? {
                return Ok(Some(set));
            }
            let n = self.inner.read(&mut self.chunk).await?;
            if n == 0 {
                return Ok(None);
            }
            self.decoder.feed(&self.chunk[..n]);
        }
    }
}

/// Drains the send queue onto the socket, batching whatever is already queued.
async fn write_loop<W: AsyncWrite + Unpin>(mut out: W, mut rx: mpsc::UnboundedReceiver<FrameSet>) {
    let mut buf = Vec::new();
    while let Some(frames) = rx.recv().await {
        buf.clear();
        append_frames(&frames, &mut buf);
        while let Ok(more) = rx.try_recv() {
            append_frames(&more, &mut buf);
        }
        if let Err(e) = out.write_all(&buf).await {
            debug!(error = %e, "write failed, stopping writer");
            return;
        }
    }
}

fn append_frames(frames: &[Vec<u8>], buf: &mut Vec<u8>) {
    match encode_frame_set(frames) {
        Ok(bytes) => buf.extend_from_slice(&bytes),
        Err(e) => warn!(error = %e, "dropping frame set that cannot be framed"),
    }
}

/// A TCP connection carrying frame sets.
pub struct TcpTransport {
    tx: mpsc::UnboundedSender<FrameSet>,
    reader: Mutex<FrameReader<OwnedReadHalf>>,
    writer: JoinHandle<()>,
    closed: AtomicBool,
    close_notify: Notify,
    peer: Option<SocketAddr>,
}

impl TcpTransport {
    /// Connects to a broker.
    pub async fn connect(endpoint: &Endpoint) -> Result<Self> {
        let stream = TcpStream::connect(endpoint.connect_addr())
            .await
            .map_err(|e| TransportError::ConnectionLost(format!("{}: {}", endpoint, e)))?;
        Ok(Self::from_stream(stream))
    }

    /// Wraps an established stream. Must be called from within a Tokio runtime.
    pub fn from_stream(stream: TcpStream) -> Self {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "set_nodelay failed");
        }
        let peer = stream.peer_addr().ok();
        let (read, write) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_loop(write, rx));
        Self {
            tx,
            reader: Mutex::new(FrameReader::new(read)),
            writer,
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
            peer,
        }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }
}

#[async_trait::async_trait]
impl Transport for TcpTransport {
    fn send(&self, frames: FrameSet) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::ConnectionLost("transport closed".into()));
        }
        self.tx
            .send(frames)
            .map_err(|_| TransportError::ConnectionLost("writer stopped".into()))
    }

    async fn recv(&self) -> Result<Option<FrameSet>> {
        let notified = self.close_notify.notified();
        if self.closed.load(Ordering::Acquire) {
            return Ok(None);
        }
        let mut reader = self.reader.lock().await;
        tokio::select! {
            _ = notified => Ok(None),
            frames = reader.next() => frames,
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.close_notify.notify_waiters();
        self.writer.abort();
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.writer.abort();
    }
}

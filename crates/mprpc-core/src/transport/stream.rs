use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{watch, Mutex as AsyncMutex};

use crate::TransportError;

use super::{wait_closed, TransportBackend};

/// Default read size per chunk.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8192;

/// Byte-stream transport over any `AsyncRead + AsyncWrite` (Unix socket,
/// TCP, `tokio::io::duplex`).
///
/// The stream is split so reads and writes proceed concurrently. Writes are
/// serialized by the writer mutex, so one `write_all` is never interleaved
/// with another.
#[derive(Clone)]
pub struct StreamTransport {
    inner: Arc<StreamInner>,
}

impl std::fmt::Debug for StreamTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamTransport")
            .field("closed", &self.is_closed_inner())
            .finish_non_exhaustive()
    }
}

struct StreamInner {
    reader: AsyncMutex<Box<dyn AsyncRead + Unpin + Send + Sync>>,
    writer: AsyncMutex<Box<dyn AsyncWrite + Unpin + Send + Sync>>,
    closed: watch::Sender<bool>,
    read_buffer_size: usize,
}

impl StreamTransport {
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
    {
        Self::with_read_buffer_size(stream, DEFAULT_READ_BUFFER_SIZE)
    }

    pub fn with_read_buffer_size<S>(stream: S, read_buffer_size: usize) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (closed, _) = watch::channel(false);
        Self {
            inner: Arc::new(StreamInner {
                reader: AsyncMutex::new(Box::new(reader)),
                writer: AsyncMutex::new(Box::new(writer)),
                closed,
                read_buffer_size: read_buffer_size.max(1),
            }),
        }
    }

    pub fn pair() -> (Self, Self) {
        let (a, b) = tokio::io::duplex(65536);
        (Self::new(a), Self::new(b))
    }

    fn is_closed_inner(&self) -> bool {
        *self.inner.closed.borrow()
    }
}

impl TransportBackend for StreamTransport {
    async fn read_chunk(&self) -> Result<Bytes, TransportError> {
        if self.is_closed_inner() {
            return Err(TransportError::Closed);
        }

        let closed = self.inner.closed.subscribe();
        let mut reader = self.inner.reader.lock().await;
        let mut buf = BytesMut::with_capacity(self.inner.read_buffer_size);

        tokio::select! {
            _ = wait_closed(closed) => Err(TransportError::Closed),
            read = reader.read_buf(&mut buf) => match read {
                Ok(0) => Err(TransportError::Closed),
                Ok(_) => Ok(buf.freeze()),
                Err(e) => Err(TransportError::Io(e)),
            },
        }
    }

    async fn write_all(&self, bytes: Bytes) -> Result<(), TransportError> {
        if self.is_closed_inner() {
            return Err(TransportError::Closed);
        }

        let closed = self.inner.closed.subscribe();
        // Waiting on the writer lock is covered by close() as well.
        let write = async {
            let mut writer = self.inner.writer.lock().await;
            writer.write_all(&bytes).await?;
            writer.flush().await
        };

        tokio::select! {
            _ = wait_closed(closed) => Err(TransportError::Closed),
            written = write => written.map_err(TransportError::Io),
        }
    }

    fn close(&self) {
        self.inner.closed.send_replace(true);
    }

    async fn shutdown(&self) {
        self.close();
        // A writer stuck on a peer that stopped reading holds the lock; the
        // socket is released when the last handle drops in that case.
        if let Ok(mut writer) = self.inner.writer.try_lock() {
            if let Err(e) = writer.shutdown().await {
                tracing::debug!(error = %e, "stream shutdown failed");
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.is_closed_inner()
    }
}

//! Transport enum and internal backend trait.
//!
//! The public API is the [`Transport`] enum. Each backend lives in its own
//! module under `transport/` and implements the internal [`TransportBackend`]
//! trait. A transport moves raw bytes only; message boundaries are recovered
//! by [`MessageDecoder`](crate::MessageDecoder).

use bytes::Bytes;
use tokio::sync::watch;

use crate::TransportError;

pub(crate) trait TransportBackend: Send + Sync + Clone + 'static {
    /// Read the next chunk of bytes. `Err(Closed)` on EOF or after `close`.
    async fn read_chunk(&self) -> Result<Bytes, TransportError>;
    /// Write all bytes of one encoded message contiguously.
    async fn write_all(&self, bytes: Bytes) -> Result<(), TransportError>;
    /// Mark closed and wake blocked readers. Non-blocking.
    fn close(&self);
    /// `close`, then shut the write half down so the peer observes EOF.
    async fn shutdown(&self);
    fn is_closed(&self) -> bool;
}

#[derive(Clone, Debug)]
pub enum Transport {
    #[cfg(feature = "stream")]
    Stream(stream::StreamTransport),
    #[cfg(feature = "mem")]
    Mem(mem::MemTransport),
}

impl Transport {
    pub async fn read_chunk(&self) -> Result<Bytes, TransportError> {
        match self {
            #[cfg(feature = "stream")]
            Transport::Stream(t) => t.read_chunk().await,
            #[cfg(feature = "mem")]
            Transport::Mem(t) => t.read_chunk().await,
        }
    }

    pub async fn write_all(&self, bytes: Bytes) -> Result<(), TransportError> {
        match self {
            #[cfg(feature = "stream")]
            Transport::Stream(t) => t.write_all(bytes).await,
            #[cfg(feature = "mem")]
            Transport::Mem(t) => t.write_all(bytes).await,
        }
    }

    pub fn close(&self) {
        match self {
            #[cfg(feature = "stream")]
            Transport::Stream(t) => t.close(),
            #[cfg(feature = "mem")]
            Transport::Mem(t) => t.close(),
        }
    }

    pub async fn shutdown(&self) {
        match self {
            #[cfg(feature = "stream")]
            Transport::Stream(t) => t.shutdown().await,
            #[cfg(feature = "mem")]
            Transport::Mem(t) => t.shutdown().await,
        }
    }

    pub fn is_closed(&self) -> bool {
        match self {
            #[cfg(feature = "stream")]
            Transport::Stream(t) => t.is_closed(),
            #[cfg(feature = "mem")]
            Transport::Mem(t) => t.is_closed(),
        }
    }

    #[cfg(feature = "mem")]
    pub fn mem_pair() -> (Self, Self) {
        let (a, b) = mem::MemTransport::pair();
        (Transport::Mem(a), Transport::Mem(b))
    }

    #[cfg(feature = "stream")]
    pub fn stream<S>(stream: S) -> Self
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + Sync + 'static,
    {
        Transport::Stream(stream::StreamTransport::new(stream))
    }

    #[cfg(feature = "stream")]
    pub fn stream_pair() -> (Self, Self) {
        let (a, b) = stream::StreamTransport::pair();
        (Transport::Stream(a), Transport::Stream(b))
    }

    /// Connect to a host process listening on a Unix domain socket.
    #[cfg(all(feature = "stream", unix))]
    pub async fn unix(path: impl AsRef<std::path::Path>) -> Result<Self, TransportError> {
        let stream = tokio::net::UnixStream::connect(path.as_ref()).await?;
        tracing::debug!(path = %path.as_ref().display(), "connected unix socket");
        Ok(Self::stream(stream))
    }

    /// Connect to a host process listening on TCP.
    #[cfg(feature = "stream")]
    pub async fn tcp(addr: impl tokio::net::ToSocketAddrs) -> Result<Self, TransportError> {
        let stream = tokio::net::TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        tracing::debug!(peer = ?stream.peer_addr().ok(), "connected tcp socket");
        Ok(Self::stream(stream))
    }
}

/// Resolve once `closed` flips to true (or its sender is gone).
pub(crate) async fn wait_closed(mut closed: watch::Receiver<bool>) {
    loop {
        if *closed.borrow_and_update() {
            return;
        }
        if closed.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(feature = "mem")]
pub mod mem;
#[cfg(feature = "stream")]
pub mod stream;

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use crate::TransportError;

use super::{wait_closed, TransportBackend};

const CHANNEL_CAPACITY: usize = 64;

/// In-process transport pair.
///
/// Unlike a byte stream, every `write_all` arrives as exactly one chunk on
/// the other side, so tests control where message boundaries fall.
#[derive(Clone, Debug)]
pub struct MemTransport {
    inner: Arc<MemInner>,
}

#[derive(Debug)]
struct MemInner {
    /// Dropped on close so the peer observes EOF.
    tx: Mutex<Option<mpsc::Sender<Bytes>>>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,
    closed: watch::Sender<bool>,
}

impl MemTransport {
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::channel(CHANNEL_CAPACITY);
        let (tx_b, rx_b) = mpsc::channel(CHANNEL_CAPACITY);

        let a = MemInner {
            tx: Mutex::new(Some(tx_b)),
            rx: tokio::sync::Mutex::new(rx_a),
            closed: watch::channel(false).0,
        };
        let b = MemInner {
            tx: Mutex::new(Some(tx_a)),
            rx: tokio::sync::Mutex::new(rx_b),
            closed: watch::channel(false).0,
        };

        (
            Self { inner: Arc::new(a) },
            Self { inner: Arc::new(b) },
        )
    }

    fn is_closed_inner(&self) -> bool {
        *self.inner.closed.borrow()
    }
}

impl TransportBackend for MemTransport {
    async fn read_chunk(&self) -> Result<Bytes, TransportError> {
        if self.is_closed_inner() {
            return Err(TransportError::Closed);
        }

        let closed = self.inner.closed.subscribe();
        let mut rx = self.inner.rx.lock().await;
        tokio::select! {
            _ = wait_closed(closed) => Err(TransportError::Closed),
            chunk = rx.recv() => chunk.ok_or(TransportError::Closed),
        }
    }

    async fn write_all(&self, bytes: Bytes) -> Result<(), TransportError> {
        if self.is_closed_inner() {
            return Err(TransportError::Closed);
        }

        let closed = self.inner.closed.subscribe();
        let tx = self
            .inner
            .tx
            .lock()
            .clone()
            .ok_or(TransportError::Closed)?;
        // A full channel must not outlive close().
        tokio::select! {
            _ = wait_closed(closed) => Err(TransportError::Closed),
            sent = tx.send(bytes) => sent.map_err(|_| TransportError::Closed),
        }
    }

    fn close(&self) {
        self.inner.closed.send_replace(true);
        self.inner.tx.lock().take();
    }

    async fn shutdown(&self) {
        self.close();
    }

    fn is_closed(&self) -> bool {
        self.is_closed_inner()
    }
}

//! In-memory transport for tests.

use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use tokio::sync::Notify;
use tokio::sync::mpsc;

use freerpc::FrameSet;

use crate::transport::Result;
use crate::transport::Transport;
use crate::transport::TransportError;

/// One end of an in-memory connection.
///
/// Frame sets sent on one end are received by the other. Closing an end makes
/// the other end's `recv` return `Ok(None)` once it has drained what was sent.
pub struct DuplexTransport {
    tx: Mutex<Option<mpsc::UnboundedSender<FrameSet>>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<FrameSet>>,
    closed: AtomicBool,
    close_notify: Notify,
}

impl DuplexTransport {
    /// Creates a pair of transports connected to each other.
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        (Self::new(tx_a, rx_b), Self::new(tx_b, rx_a))
    }

    fn new(tx: mpsc::UnboundedSender<FrameSet>, rx: mpsc::UnboundedReceiver<FrameSet>) -> Self {
        Self {
            tx: Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
        }
    }
}

#[async_trait::async_trait]
impl Transport for DuplexTransport {
    fn send(&self, frames: FrameSet) -> Result<()> {
        let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        match tx.as_ref() {
            Some(tx) => tx
                .send(frames)
                .map_err(|_| TransportError::ConnectionLost("peer dropped".into())),
            None => Err(TransportError::ConnectionLost("transport closed".into())),
        }
    }

    async fn recv(&self) -> Result<Option<FrameSet>> {
        let notified = self.close_notify.notified();
        if self.closed.load(Ordering::Acquire) {
            return Ok(None);
        }
        let mut rx = self.rx.lock().await;
        tokio::select! {
            _ = notified => Ok(None),
            frames = rx.recv() => Ok(frames),
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
        self.close_notify.notify_waiters();
    }
}

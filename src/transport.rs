use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc, Mutex,
};
use tokio::{sync::mpsc, time::Instant};

use crate::error::{PadError, Result};

/// Stream of raw buffers delivered by the notify characteristic
pub type NotificationStream = BoxStream<'static, Vec<u8>>;

/// Byte-level link to a single device
///
/// The controller only needs to write frames to the command characteristic and
/// to receive buffers from the notify characteristic. Discovery and link setup
/// happen before a transport is handed over.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Write one frame to the command characteristic
    async fn write(&self, frame: &[u8]) -> Result<()>;

    /// Enable notifications and return the inbound buffer stream
    async fn notifications(&self) -> Result<NotificationStream>;

    /// Whether the link is still up
    async fn is_connected(&self) -> bool;

    /// Tear the link down
    async fn disconnect(&self) -> Result<()>;
}

/// In-memory transport that records writes and replays injected notifications
#[derive(Clone)]
pub struct MockTransport {
    writes: Arc<Mutex<Vec<(Instant, Bytes)>>>,
    inbound_tx: mpsc::UnboundedSender<Vec<u8>>,
    inbound_rx: Arc<Mutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>>,
    connected: Arc<AtomicBool>,
    fail_writes: Arc<AtomicBool>,
    fail_notifications: Arc<AtomicBool>,
    disconnect_calls: Arc<AtomicUsize>,
}

impl MockTransport {
    /// Create a connected mock transport
    #[must_use]
    pub fn new() -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            writes: Arc::new(Mutex::new(Vec::new())),
            inbound_tx,
            inbound_rx: Arc::new(Mutex::new(Some(inbound_rx))),
            connected: Arc::new(AtomicBool::new(true)),
            fail_writes: Arc::new(AtomicBool::new(false)),
            fail_notifications: Arc::new(AtomicBool::new(false)),
            disconnect_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Deliver a buffer as if the device had notified it
    pub fn inject(&self, data: impl Into<Vec<u8>>) {
        let _ = self.inbound_tx.send(data.into());
    }

    /// Frames written so far
    #[must_use]
    pub fn written(&self) -> Vec<Bytes> {
        self.lock_writes().iter().map(|(_, f)| f.clone()).collect()
    }

    /// Frames written so far, with their write instants
    #[must_use]
    pub fn written_at(&self) -> Vec<(Instant, Bytes)> {
        self.lock_writes().clone()
    }

    /// Make every subsequent write fail
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make enabling notifications fail
    pub fn set_fail_notifications(&self, fail: bool) {
        self.fail_notifications.store(fail, Ordering::SeqCst);
    }

    /// Number of `disconnect` calls so far
    #[must_use]
    pub fn disconnect_calls(&self) -> usize {
        self.disconnect_calls.load(Ordering::SeqCst)
    }

    fn lock_writes(&self) -> std::sync::MutexGuard<'_, Vec<(Instant, Bytes)>> {
        self.writes
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn write(&self, frame: &[u8]) -> Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(PadError::Disconnected);
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(PadError::transport("write", "mock write failure"));
        }
        self.lock_writes()
            .push((Instant::now(), Bytes::copy_from_slice(frame)));
        Ok(())
    }

    async fn notifications(&self) -> Result<NotificationStream> {
        if self.fail_notifications.load(Ordering::SeqCst) {
            return Err(PadError::transport("subscribe", "mock notify failure"));
        }
        let receiver = self
            .inbound_rx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
            .ok_or_else(|| PadError::transport("subscribe", "notifications already taken"))?;

        Ok(stream::unfold(receiver, |mut rx| async move {
            rx.recv().await.map(|data| (data, rx))
        })
        .boxed())
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) -> Result<()> {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

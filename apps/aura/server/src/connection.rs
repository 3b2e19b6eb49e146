use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use thiserror::Error;
use tokio::sync::{mpsc, Notify};

/// Outbound frames are queued as encoded envelope text and drained into the
/// socket by the connection's writer task.
pub type OutboundReceiver = mpsc::Receiver<String>;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    #[error("outbound queue is full")]
    Full,
    #[error("connection closed")]
    Closed,
}

/// Cheaply clonable sending side of a live connection.
///
/// The registry stores these; the connection handler keeps the socket.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    sender: mpsc::Sender<String>,
    remote_addr: String,
    evicted: AtomicBool,
    evict_signal: Notify,
}

impl ConnectionHandle {
    /// Creates a handle backed by a bounded queue of `depth` frames.
    pub fn channel(remote_addr: impl Into<String>, depth: usize) -> (Self, OutboundReceiver) {
        let (sender, receiver) = mpsc::channel(depth.max(1));
        let handle = Self {
            inner: Arc::new(HandleInner {
                sender,
                remote_addr: remote_addr.into(),
                evicted: AtomicBool::new(false),
                evict_signal: Notify::new(),
            }),
        };
        (handle, receiver)
    }

    /// Queues a frame without waiting. A full queue counts as a failed send.
    pub fn send(&self, frame: String) -> Result<(), SendError> {
        self.inner.sender.try_send(frame).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => SendError::Full,
            mpsc::error::TrySendError::Closed(_) => SendError::Closed,
        })
    }

    pub fn remote_addr(&self) -> &str {
        &self.inner.remote_addr
    }

    /// Asks the owning handler to shut the connection down.
    pub fn evict(&self) {
        if !self.inner.evicted.swap(true, Ordering::AcqRel) {
            self.inner.evict_signal.notify_one();
        }
    }

    pub fn is_evicted(&self) -> bool {
        self.inner.evicted.load(Ordering::Acquire)
    }

    /// Resolves once [`ConnectionHandle::evict`] has been called.
    pub async fn evicted(&self) {
        if self.is_evicted() {
            return;
        }
        self.inner.evict_signal.notified().await;
    }

    pub fn same_connection(&self, other: &ConnectionHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("remote_addr", &self.inner.remote_addr)
            .field("evicted", &self.is_evicted())
            .finish()
    }
}

//! Outbound half of the per-client signalling channel.
//!
//! Messages are serialised at `send` time and placed on a bounded queue
//! drained by the connection's writer task, so concurrent senders can never
//! interleave bytes of distinct frames. Overflow means the client is not
//! keeping up; the transport closes itself and every further send fails.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};
use crate::signal::SignalMessage;

/// Normal closure, RFC 6455.
pub const CLOSE_NORMAL: u16 = 1000;
/// Policy violation, used when the outbound queue overflows.
pub const CLOSE_SLOW_CONSUMER: u16 = 1008;
/// Internal error during session setup.
pub const CLOSE_INTERNAL: u16 = 1011;

/// A frame handed to the connection's writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    /// A serialised signalling message.
    Message(String),
    /// Request to send a close frame and stop writing.
    Close { code: u16, reason: String },
}

struct Inner {
    tx: mpsc::Sender<OutboundFrame>,
    closed: AtomicBool,
    closed_notify: CancellationToken,
}

/// Cheaply cloneable handle to one client's outbound signalling queue.
#[derive(Clone)]
pub struct SignalTransport {
    inner: Arc<Inner>,
}

impl SignalTransport {
    /// Create a transport and the receiving end its writer task drains.
    pub fn pair(capacity: usize) -> (Self, mpsc::Receiver<OutboundFrame>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                inner: Arc::new(Inner {
                    tx,
                    closed: AtomicBool::new(false),
                    closed_notify: CancellationToken::new(),
                }),
            },
            rx,
        )
    }

    /// Serialise and enqueue one message.
    ///
    /// Queue overflow closes the transport and returns
    /// [`Error::SlowConsumer`]; the peer is expected to be evicted.
    pub fn send(&self, msg: &SignalMessage) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::TransportClosed);
        }

        let text = serde_json::to_string(msg)?;
        match self.inner.tx.try_send(OutboundFrame::Message(text)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("outbound signalling queue full, closing transport");
                self.close(CLOSE_SLOW_CONSUMER, "slow consumer");
                Err(Error::SlowConsumer)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.inner.closed.store(true, Ordering::Release);
                Err(Error::TransportClosed)
            }
        }
    }

    /// Request a close frame. Idempotent; later sends fail with
    /// [`Error::TransportClosed`].
    pub fn close(&self, code: u16, reason: &str) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // Best effort: if the queue is full the writer stops anyway once the
        // session drops its receiver.
        let _ = self.inner.tx.try_send(OutboundFrame::Close {
            code,
            reason: reason.to_string(),
        });
        self.inner.closed_notify.cancel();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Resolves once the transport has been closed, so read loops can end
    /// promptly instead of waiting for the client to disconnect.
    pub async fn closed(&self) {
        self.inner.closed_notify.cancelled().await;
    }
}

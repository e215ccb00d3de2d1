//! Live client connection state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use relaydesk_core::ids::{ConnectionId, SessionId};
use relaydesk_core::session::Participant;

/// Why a frame could not be queued.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryFailure {
    QueueFull,
    Closed,
}

impl DeliveryFailure {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::QueueFull => "queue_full",
            Self::Closed => "closed",
        }
    }
}

/// A connected client, bound for its lifetime to one participant and at
/// most one session. Agent connections without a session are lobby
/// connections and only receive lifecycle events.
#[derive(Debug)]
pub struct ClientConnection {
    pub id: ConnectionId,
    pub session_id: Option<SessionId>,
    pub participant: Participant,
    tx: mpsc::Sender<String>,
    /// Close requests bypass the frame queue so a full queue cannot swallow
    /// them.
    closed: CancellationToken,
    pub connected_at: Instant,
    last_seen: Mutex<Instant>,
    /// Count of frames dropped due to a full or closed queue.
    pub dropped_messages: AtomicU64,
}

impl ClientConnection {
    pub fn new(
        session_id: Option<SessionId>,
        participant: Participant,
        tx: mpsc::Sender<String>,
    ) -> Self {
        let now = Instant::now();
        Self {
            id: ConnectionId::new(),
            session_id,
            participant,
            tx,
            closed: CancellationToken::new(),
            connected_at: now,
            last_seen: Mutex::new(now),
            dropped_messages: AtomicU64::new(0),
        }
    }

    /// Queue a text frame without waiting. Nothing is queued once the
    /// connection has been asked to close.
    pub fn send(&self, frame: String) -> Result<(), DeliveryFailure> {
        let result = if self.closed.is_cancelled() {
            Err(DeliveryFailure::Closed)
        } else {
            self.tx.try_send(frame).map_err(|e| match e {
                TrySendError::Full(_) => DeliveryFailure::QueueFull,
                TrySendError::Closed(_) => DeliveryFailure::Closed,
            })
        };
        if result.is_err() {
            let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    /// Ask the writer to flush what is already queued and close the socket.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.closed.cancelled()
    }

    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Record inbound activity (any frame or pong).
    pub fn mark_alive(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }

    pub fn is_agent(&self) -> bool {
        self.participant.as_agent().is_some()
    }
}

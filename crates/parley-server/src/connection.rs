//! Live socket connection state.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use parley_core::{ConnectionId, Outbound, Role, SessionCode};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Frame queued for the socket writer task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OutboundFrame {
    /// Encoded JSON envelope.
    Text(Arc<str>),
    /// Protocol-level ping (heartbeat probe).
    Ping,
    /// Close the socket with a code and reason.
    Close {
        /// Close code (1000, 1008, ...).
        code: u16,
        /// Human-readable reason.
        reason: String,
    },
}

/// Registration data, set by `register`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Registration {
    /// Granted role; `None` until registered.
    pub role: Option<Role>,
    /// Session owned or joined.
    pub session_code: Option<SessionCode>,
    /// BCP-47 language of the connection.
    pub language_code: Option<String>,
    /// Optional display name.
    pub display_name: Option<String>,
}

/// One connected socket.
pub struct Connection {
    id: ConnectionId,
    tx: mpsc::Sender<OutboundFrame>,
    registration: Mutex<Registration>,
    connected_at: Instant,
    last_seen: Mutex<Instant>,
    is_alive: AtomicBool,
    dropped_messages: AtomicU64,
    cancel: CancellationToken,
}

impl Connection {
    /// New connection writing to `tx`.
    pub fn new(id: ConnectionId, tx: mpsc::Sender<OutboundFrame>) -> Self {
        Self::with_cancel(id, tx, CancellationToken::new())
    }

    /// New connection using `cancel` as its teardown token.
    pub fn with_cancel(
        id: ConnectionId,
        tx: mpsc::Sender<OutboundFrame>,
        cancel: CancellationToken,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            tx,
            registration: Mutex::new(Registration::default()),
            connected_at: now,
            last_seen: Mutex::new(now),
            is_alive: AtomicBool::new(true),
            dropped_messages: AtomicU64::new(0),
            cancel,
        }
    }

    /// Connection id.
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Queue an envelope. Returns `false` if the queue is full or closed.
    pub fn send(&self, message: &Outbound) -> bool {
        match message.encode() {
            Ok(json) => self.send_text(Arc::from(json)),
            Err(e) => {
                warn!(connection_id = %self.id, error = %e, "failed to encode outbound message");
                false
            }
        }
    }

    /// Queue pre-encoded JSON, shared across a fan-out.
    pub fn send_text(&self, json: Arc<str>) -> bool {
        self.push(OutboundFrame::Text(json))
    }

    /// Queue a heartbeat ping.
    pub fn send_ping(&self) -> bool {
        self.push(OutboundFrame::Ping)
    }

    /// Queue a close frame.
    pub fn close(&self, code: u16, reason: impl Into<String>) -> bool {
        self.push(OutboundFrame::Close {
            code,
            reason: reason.into(),
        })
    }

    fn push(&self, frame: OutboundFrame) -> bool {
        if self.tx.try_send(frame).is_ok() {
            true
        } else {
            let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Whether the writer side has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Messages dropped because the queue was full or closed.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Record liveness (pong or any inbound frame).
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
        *self.last_seen.lock() = Instant::now();
    }

    /// Take the alive flag, leaving it cleared.
    ///
    /// Returns `true` if the peer answered since the previous check.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }

    /// Time since the peer was last heard from.
    pub fn last_seen_elapsed(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Copy of the registration data.
    pub fn registration(&self) -> Registration {
        self.registration.lock().clone()
    }

    /// Role, if registered.
    pub fn role(&self) -> Option<Role> {
        self.registration.lock().role
    }

    /// Session code, if registered into one.
    pub fn session_code(&self) -> Option<SessionCode> {
        self.registration.lock().session_code.clone()
    }

    /// Language, if registered.
    pub fn language_code(&self) -> Option<String> {
        self.registration.lock().language_code.clone()
    }

    /// Replace the registration data.
    pub fn set_registration(&self, registration: Registration) {
        *self.registration.lock() = registration;
    }

    /// Token cancelled when this connection is torn down.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel in-flight work and signal the socket tasks to stop.
    pub fn terminate(&self) {
        self.cancel.cancel();
    }

    /// Whether [`terminate`](Self::terminate) has been called.
    pub fn is_terminated(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("registration", &*self.registration.lock())
            .finish_non_exhaustive()
    }
}

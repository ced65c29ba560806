//! Session identity, lifecycle state machine, and the WebSocket binding handle.
//!
//! A [`Session`] pairs exactly one [`PtyChannel`] with at most one WebSocket
//! client. The session owns the PTY; the WebSocket side only ever holds a
//! [`WsBinding`] — a channel sender used to enqueue outbound frames and to
//! deliver the final close frame. State advances monotonically:
//! `Starting → Running → Draining → Closed`, with no way back out of
//! `Closed`.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use super::pty::PtyChannel;

/// Current Unix time in milliseconds.
pub fn now_ms() -> u64 {
    #[allow(clippy::cast_possible_truncation)]
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

/// Process-unique session identifier: a monotonic counter plus the creation
/// timestamp, stringified as `"<counter>-<unix_ms>"` in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId {
    counter: u64,
    created_ms: u64,
}

impl SessionId {
    pub(crate) fn next(counter: &AtomicU64) -> Self {
        Self {
            counter: counter.fetch_add(1, Ordering::SeqCst) + 1,
            created_ms: now_ms(),
        }
    }

    pub fn counter(self) -> u64 {
        self.counter
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.counter, self.created_ms)
    }
}

/// Session lifecycle state. Ordered: transitions only ever move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Starting,
    Running,
    Draining,
    Closed,
}

/// Why a session ended. The first reason recorded wins; later close attempts
/// keep it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    ClientClose,
    IdleTimeout,
    AbsoluteTimeout,
    ShellExit(i32),
    AuthFailure,
    CapacityExceeded,
    ShuttingDown,
    ProtocolError,
    IoError,
}

impl CloseReason {
    /// WebSocket close code sent to the client for this reason.
    pub fn close_code(self) -> u16 {
        match self {
            Self::ClientClose => 1000,
            Self::ShuttingDown => 1001,
            Self::ProtocolError => 1002,
            Self::IoError => 1011,
            Self::AuthFailure => 4401,
            Self::IdleTimeout | Self::AbsoluteTimeout => 4408,
            Self::CapacityExceeded => 4429,
            Self::ShellExit(_) => 4500,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClientClose => "client_close",
            Self::IdleTimeout => "idle_timeout",
            Self::AbsoluteTimeout => "absolute_timeout",
            Self::ShellExit(_) => "shell_exit",
            Self::AuthFailure => "auth_failure",
            Self::CapacityExceeded => "capacity",
            Self::ShuttingDown => "shutting_down",
            Self::ProtocolError => "protocol_error",
            Self::IoError => "io_error",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ShellExit(code) => write!(f, "shell_exit({code})"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Frames a session may enqueue toward its bound WebSocket.
#[derive(Debug)]
pub enum WsOutbound {
    /// Raw PTY output, shipped as one WS frame.
    Data(Vec<u8>),
    /// A JSON control frame (pong, exit notice).
    Text(String),
    /// Protocol-level keepalive ping.
    Ping,
    /// Final frame; the sink closes after sending it.
    Close { code: u16, reason: &'static str },
}

/// Sender half held by a session for its bound socket.
pub type WsBinding = mpsc::Sender<WsOutbound>;

/// Errors from binding a WebSocket to a session.
#[derive(Debug, PartialEq, Eq)]
pub enum BindError {
    NotFound,
    AlreadyBound,
    Closed,
}

impl fmt::Display for BindError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindError::NotFound => write!(f, "session not found"),
            BindError::AlreadyBound => write!(f, "session already has a bound socket"),
            BindError::Closed => write!(f, "session is closed"),
        }
    }
}

/// One live pairing of a PTY-backed shell with at most one WebSocket client.
pub struct Session {
    id: SessionId,
    owner: String,
    created_at: Instant,
    last_activity_ms: AtomicU64,
    pty: Arc<PtyChannel>,
    ws: Mutex<Option<WsBinding>>,
    state: Mutex<SessionState>,
    close_reason: Mutex<Option<CloseReason>>,
    cancel: CancellationToken,
}

impl Session {
    pub(crate) fn new(id: SessionId, owner: &str, pty: Arc<PtyChannel>) -> Self {
        Self {
            id,
            owner: owner.to_string(),
            created_at: Instant::now(),
            last_activity_ms: AtomicU64::new(now_ms()),
            pty,
            ws: Mutex::new(None),
            state: Mutex::new(SessionState::Starting),
            close_reason: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn pty(&self) -> &Arc<PtyChannel> {
        &self.pty
    }

    /// Record activity now. Called on every successful byte transfer in
    /// either direction and on every received pong.
    pub fn touch(&self) {
        self.last_activity_ms.store(now_ms(), Ordering::Relaxed);
    }

    /// Time since the last recorded activity.
    pub fn idle_for(&self) -> Duration {
        let last = self.last_activity_ms.load(Ordering::Relaxed);
        Duration::from_millis(now_ms().saturating_sub(last))
    }

    pub async fn state(&self) -> SessionState {
        *self.state.lock().await
    }

    /// Advance the state machine. Backward transitions (including any
    /// transition out of `Closed`) are ignored; returns whether the state
    /// changed.
    pub(crate) async fn advance(&self, next: SessionState) -> bool {
        let mut state = self.state.lock().await;
        if next > *state {
            *state = next;
            true
        } else {
            false
        }
    }

    /// Start closing with `reason`. Returns `false` when the session is
    /// already draining or closed — the first recorded reason stands.
    pub(crate) async fn begin_close(&self, reason: CloseReason) -> bool {
        let mut state = self.state.lock().await;
        if *state >= SessionState::Draining {
            return false;
        }
        *state = SessionState::Draining;
        let mut slot = self.close_reason.lock().await;
        if slot.is_none() {
            *slot = Some(reason);
        }
        true
    }

    pub async fn close_reason(&self) -> Option<CloseReason> {
        *self.close_reason.lock().await
    }

    /// Attach the outbound frame sender of a WebSocket. One binding per
    /// session; rebinding is refused.
    pub(crate) async fn bind_ws(&self, tx: WsBinding) -> Result<(), BindError> {
        if *self.state.lock().await >= SessionState::Draining {
            return Err(BindError::Closed);
        }
        let mut ws = self.ws.lock().await;
        if ws.is_some() {
            return Err(BindError::AlreadyBound);
        }
        *ws = Some(tx);
        Ok(())
    }

    /// Detach and return the binding, if any. Idempotent.
    pub(crate) async fn take_ws(&self) -> Option<WsBinding> {
        self.ws.lock().await.take()
    }

    pub async fn has_ws(&self) -> bool {
        self.ws.lock().await.is_some()
    }

    /// Per-session cancellation signal observed by both pumps.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

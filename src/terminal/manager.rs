//! Session lifecycle management: admission, timeouts, and shutdown fan-out.
//!
//! [`SessionManager`] is the single authority for creating, looking up, and
//! destroying terminal sessions. It enforces the `max_sessions` cap, drives
//! idle and absolute timeouts from a periodic [`tick`](SessionManager::tick),
//! and fans shutdown out to every live session on
//! [`drain`](SessionManager::drain).
//!
//! ## Concurrency
//!
//! The session table is behind an `RwLock`. `create` holds the write lock
//! across the limit-check and insert to prevent TOCTOU races; no lock is ever
//! held across a PTY reap or WebSocket send. `close` is idempotent from any
//! caller — the first recorded [`CloseReason`] wins.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::pty::{PtyChannel, SpawnError, Window};
use super::session::{BindError, CloseReason, Session, SessionId, SessionState, WsBinding, WsOutbound};
use crate::config::TerminalConfig;

/// Errors from session admission.
#[derive(Debug)]
pub enum AdmissionError {
    /// The table already holds `max_sessions` live sessions.
    Capacity(usize),
    /// The manager is draining; no new sessions are admitted.
    ShuttingDown,
    Spawn(SpawnError),
}

impl std::fmt::Display for AdmissionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdmissionError::Capacity(max) => write!(f, "session limit reached (max {max})"),
            AdmissionError::ShuttingDown => write!(f, "shutting down"),
            AdmissionError::Spawn(e) => write!(f, "failed to spawn shell: {e}"),
        }
    }
}

/// Manages the pool of live terminal sessions.
///
/// Cloneable — all clones share the same inner state.
#[derive(Clone)]
pub struct SessionManager {
    sessions: Arc<RwLock<HashMap<SessionId, Arc<Session>>>>,
    cfg: Arc<TerminalConfig>,
    draining: Arc<AtomicBool>,
    next_id: Arc<AtomicU64>,
}

impl SessionManager {
    pub fn new(cfg: TerminalConfig) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            cfg: Arc::new(cfg),
            draining: Arc::new(AtomicBool::new(false)),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Create a session: spawn the shell on a fresh PTY and insert it into
    /// the table. Holds the write lock through the entire check-and-insert.
    ///
    /// A failed spawn leaves no partial state behind.
    pub async fn create(&self, owner: &str) -> Result<Arc<Session>, AdmissionError> {
        if self.draining.load(Ordering::SeqCst) {
            return Err(AdmissionError::ShuttingDown);
        }

        let session = {
            let mut sessions = self.sessions.write().await;
            // Re-check under the lock: drain may have raced the fast path
            if self.draining.load(Ordering::SeqCst) {
                return Err(AdmissionError::ShuttingDown);
            }
            if sessions.len() >= self.cfg.max_sessions {
                return Err(AdmissionError::Capacity(self.cfg.max_sessions));
            }

            let id = SessionId::next(&self.next_id);
            let pty = PtyChannel::spawn(&self.cfg.shell_command, &HashMap::new(), Window::default())
                .map_err(AdmissionError::Spawn)?;
            let session = Arc::new(Session::new(id, owner, Arc::new(pty)));
            sessions.insert(id, Arc::clone(&session));
            info!(
                "session {id} created (pid {}, total {})",
                session.pty().pid(),
                sessions.len()
            );
            session
        };

        session.advance(SessionState::Running).await;
        self.spawn_exit_watcher(Arc::clone(&session));
        Ok(session)
    }

    /// Watch for the shell exiting on its own — a session whose child dies
    /// must be closed whether or not a client is attached. When a socket is
    /// bound, the downlink gets `exit_wait` to drain remaining output and
    /// report the exit itself; `close` being idempotent makes the race benign.
    fn spawn_exit_watcher(&self, session: Arc<Session>) {
        let manager = self.clone();
        let cancel = session.cancel_token();
        tokio::spawn(async move {
            let code = tokio::select! {
                () = cancel.cancelled() => return,
                code = session.pty().wait_exit() => code,
            };
            if session.has_ws().await {
                let _ = tokio::time::timeout(manager.cfg.exit_wait(), cancel.cancelled()).await;
            }
            manager.close(session.id(), CloseReason::ShellExit(code)).await;
        });
    }

    /// Look up a session by id.
    pub async fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.read().await.get(&id).cloned()
    }

    /// Count of live sessions.
    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Attach a WebSocket's outbound sender to a session. One binding per
    /// session; rebinding is refused.
    pub async fn bind_ws(&self, id: SessionId, tx: WsBinding) -> Result<(), BindError> {
        let Some(session) = self.get(id).await else {
            return Err(BindError::NotFound);
        };
        session.bind_ws(tx).await
    }

    /// Detach the WebSocket from a session. Idempotent. A session whose
    /// client disconnects is closed (close-on-disconnect policy).
    pub async fn unbind_ws(&self, id: SessionId) {
        let Some(session) = self.get(id).await else {
            return;
        };
        if session.take_ws().await.is_some() {
            self.close(id, CloseReason::ClientClose).await;
        }
    }

    /// Close a session. Idempotent: the first caller performs the teardown
    /// and its reason is the one reported; later calls return immediately.
    ///
    /// Teardown order: record the reason, cancel the pumps, notify a bound
    /// socket (exit notice, then close frame), reap the PTY, remove from the
    /// table.
    pub async fn close(&self, id: SessionId, reason: CloseReason) -> bool {
        let Some(session) = self.get(id).await else {
            return false;
        };
        // Only the first caller notifies the client; the reap and removal
        // below are re-runnable so an interrupted teardown can be finished
        // by any later caller (tick, drain, the peer pump).
        if session.begin_close(reason).await {
            let reason = session.close_reason().await.unwrap_or(reason);
            debug!("session {id} closing ({reason})");
            session.cancel_token().cancel();

            if let Some(ws) = session.take_ws().await {
                // Best-effort: a stalled socket must not hold up the reap
                if let CloseReason::ShellExit(code) = reason {
                    let notice = serde_json::json!({"type": "exit", "code": code}).to_string();
                    let _ =
                        tokio::time::timeout(Duration::from_secs(1), ws.send(WsOutbound::Text(notice)))
                            .await;
                }
                let frame = WsOutbound::Close {
                    code: reason.close_code(),
                    reason: reason.as_str(),
                };
                let _ = tokio::time::timeout(Duration::from_secs(1), ws.send(frame)).await;
            }
        }

        session
            .pty()
            .close(self.cfg.exit_grace(), self.cfg.exit_wait())
            .await;
        session.advance(SessionState::Closed).await;

        let (removed, remaining) = {
            let mut sessions = self.sessions.write().await;
            let removed = sessions.remove(&id).is_some();
            (removed, sessions.len())
        };
        if removed {
            let reason = session.close_reason().await.unwrap_or(reason);
            info!("session {id} closed ({reason}, {remaining} live)");
        }
        true
    }

    /// Periodic expiry sweep. Decisions are snapshotted under the read lock;
    /// the closes run after it is released.
    pub async fn tick(&self) {
        let mut expired: Vec<(SessionId, CloseReason)> = Vec::new();
        {
            let sessions = self.sessions.read().await;
            for (id, session) in sessions.iter() {
                if session.state().await >= SessionState::Draining {
                    continue;
                }
                if session.created_at().elapsed() >= self.cfg.max_session() {
                    expired.push((*id, CloseReason::AbsoluteTimeout));
                } else if session.idle_for() >= self.cfg.idle_timeout() {
                    expired.push((*id, CloseReason::IdleTimeout));
                }
            }
        }

        for (id, reason) in expired {
            info!("session {id} expired ({reason})");
            self.close(id, reason).await;
        }
    }

    /// Reject new sessions and close every live one with `ShuttingDown`.
    /// Returns once the table is empty; the draining flag stays set for the
    /// rest of the process lifetime.
    pub async fn drain(&self) {
        self.draining.store(true, Ordering::SeqCst);
        let ids: Vec<SessionId> = self.sessions.read().await.keys().copied().collect();
        if ids.is_empty() {
            return;
        }
        info!("draining {} session(s)", ids.len());
        join_all(
            ids.into_iter()
                .map(|id| self.close(id, CloseReason::ShuttingDown)),
        )
        .await;

        let left = self.count().await;
        if left > 0 {
            warn!("{left} session(s) survived drain");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cfg(max_sessions: usize) -> TerminalConfig {
        TerminalConfig {
            shell_command: "/bin/sh".to_string(),
            max_sessions,
            ..TerminalConfig::default()
        }
    }

    #[tokio::test]
    async fn capacity_is_enforced_without_mutating_state() {
        let manager = SessionManager::new(test_cfg(1));
        let first = manager.create("User").await.expect("first session");
        let err = manager.create("User").await;
        assert!(matches!(err, Err(AdmissionError::Capacity(1))));
        assert_eq!(manager.count().await, 1);

        // Closing frees the slot again
        manager.close(first.id(), CloseReason::ClientClose).await;
        assert_eq!(manager.count().await, 0);
        let second = manager.create("User").await.expect("slot freed");
        manager.close(second.id(), CloseReason::ClientClose).await;
    }

    #[tokio::test]
    async fn spawn_failure_leaves_no_partial_state() {
        let mut cfg = test_cfg(4);
        cfg.shell_command = "/no/such/shell".to_string();
        let manager = SessionManager::new(cfg);
        assert!(matches!(
            manager.create("User").await,
            Err(AdmissionError::Spawn(SpawnError::ShellNotFound(_)))
        ));
        assert_eq!(manager.count().await, 0);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_keeps_the_first_reason() {
        let manager = SessionManager::new(test_cfg(2));
        let session = manager.create("User").await.expect("session");
        let id = session.id();

        assert!(manager.close(id, CloseReason::IdleTimeout).await);
        // Second close: session is gone from the table, nothing re-runs
        assert!(!manager.close(id, CloseReason::ClientClose).await);
        assert_eq!(
            session.close_reason().await,
            Some(CloseReason::IdleTimeout)
        );
        assert_eq!(session.state().await, SessionState::Closed);
        assert_eq!(manager.count().await, 0);
    }

    #[tokio::test]
    async fn unbind_closes_under_the_disconnect_policy() {
        let manager = SessionManager::new(test_cfg(2));
        let session = manager.create("User").await.expect("session");
        let (tx, _rx) = tokio::sync::mpsc::channel(4);
        manager.bind_ws(session.id(), tx).await.expect("bind");

        manager.unbind_ws(session.id()).await;
        assert_eq!(manager.count().await, 0);
        assert_eq!(session.close_reason().await, Some(CloseReason::ClientClose));

        // Idempotent on a session that no longer exists
        manager.unbind_ws(session.id()).await;
    }

    #[tokio::test]
    async fn drain_closes_everything_and_rejects_new_sessions() {
        let manager = SessionManager::new(test_cfg(4));
        let a = manager.create("User").await.expect("a");
        let b = manager.create("User").await.expect("b");

        manager.drain().await;
        assert_eq!(manager.count().await, 0);
        assert_eq!(a.close_reason().await, Some(CloseReason::ShuttingDown));
        assert_eq!(b.close_reason().await, Some(CloseReason::ShuttingDown));
        assert!(matches!(
            manager.create("User").await,
            Err(AdmissionError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn tick_closes_idle_sessions() {
        let mut cfg = test_cfg(2);
        cfg.idle_timeout_secs = 1;
        let manager = SessionManager::new(cfg);
        let session = manager.create("User").await.expect("session");

        manager.tick().await;
        assert_eq!(manager.count().await, 1, "fresh session must survive");

        tokio::time::sleep(Duration::from_millis(1200)).await;
        manager.tick().await;
        assert_eq!(manager.count().await, 0);
        assert_eq!(session.close_reason().await, Some(CloseReason::IdleTimeout));
    }

    #[tokio::test]
    async fn tick_closes_overlong_sessions() {
        let mut cfg = test_cfg(2);
        cfg.max_session_secs = 1;
        let manager = SessionManager::new(cfg);
        let session = manager.create("User").await.expect("session");

        tokio::time::sleep(Duration::from_millis(1200)).await;
        // Activity does not save a session past its absolute lifetime
        session.touch();
        manager.tick().await;
        assert_eq!(manager.count().await, 0);
        assert_eq!(
            session.close_reason().await,
            Some(CloseReason::AbsoluteTimeout)
        );
    }

    #[tokio::test]
    async fn shell_exit_closes_the_session_without_a_client() {
        let manager = SessionManager::new(test_cfg(2));
        let session = manager.create("User").await.expect("session");
        session.pty().write_all(b"exit 0\n").await.expect("write");

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while manager.count().await > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(manager.count().await, 0);
        assert_eq!(
            session.close_reason().await,
            Some(CloseReason::ShellExit(0))
        );
    }
}

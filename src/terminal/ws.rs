//! WebSocket transport for terminal sessions.
//!
//! ## Connection lifecycle
//!
//! 1. Client connects to `GET <WebPath>/ws`. The shared key is taken from the
//!    `Authorization: Key <K>` header when present, else from the `?key=<K>`
//!    query parameter (browsers cannot set headers on WebSocket upgrades).
//!    A bad credential completes the upgrade and immediately closes with
//!    code 4401 — no session is created.
//! 2. Admission: one PTY-backed session per socket. Failures are reported as
//!    a JSON error text frame followed by a close frame (4429 capacity,
//!    4503 shutting down, 1011 spawn failure).
//! 3. Two pumps run until either side ends: the uplink decodes client
//!    control frames and feeds the PTY; the downlink ships PTY output as
//!    binary frames (base64 text when `?encoding=base64` was negotiated).
//!
//! ## Control messages (client → server, UTF-8 JSON text frames)
//!
//! | Type     | Fields         | Effect                                    |
//! |----------|----------------|-------------------------------------------|
//! | `input`  | `data`         | bytes forwarded verbatim to the PTY        |
//! | `resize` | `cols`, `rows` | terminal window resize, applied immediately|
//! | `ping`   | `ts`           | replied with `{"type":"pong","ts":<same>}` |
//!
//! Server → client: PTY output as binary frames chunked at `buffer_size`;
//! `{"type":"exit","code":N}` immediately before the close when the shell
//! exits; protocol-level pings every `ping_interval_secs`.

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::{header, HeaderMap};
use axum::response::Response;
use base64::Engine;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::manager::{AdmissionError, SessionManager};
use super::pty::PtyError;
use super::session::{CloseReason, Session, WsOutbound};
use super::TerminalService;
use crate::auth;
use crate::config::TerminalConfig;

/// Close code for failures that have no [`CloseReason`] (e.g. spawn errors).
const CLOSE_INTERNAL: u16 = 1011;

/// Close code for admissions refused because the host is landing.
const CLOSE_SHUTTING_DOWN: u16 = 4503;

/// Query parameters accepted on the upgrade request.
#[derive(Deserialize)]
pub struct WsQuery {
    /// Shared key fallback for browsers (see module docs).
    pub key: Option<String>,
    /// `base64` switches the downlink to base64 text frames.
    pub encoding: Option<String>,
}

/// How PTY output frames are encoded toward the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DownlinkEncoding {
    Binary,
    Base64,
}

/// Control messages decoded off client text frames.
#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ClientMsg {
    Input { data: String },
    Resize { cols: u16, rows: u16 },
    Ping { ts: i64 },
}

/// Frames the downlink may queue before PTY reads suspend (backpressure).
fn outbound_capacity(cfg: &TerminalConfig) -> usize {
    (cfg.write_high_watermark / cfg.buffer_size).max(1)
}

/// `GET <WebPath>/ws` — WebSocket upgrade handler.
///
/// The credential is resolved before the upgrade; the verdict is carried into
/// the socket task so the browser always sees a proper close frame.
pub async fn ws_upgrade(
    State(service): State<Arc<TerminalService>>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let authed = auth::handshake_key_valid(
        &service.cfg().auth_key,
        authorization,
        query.key.as_deref(),
    );
    let encoding = match query.encoding.as_deref() {
        Some("base64") => DownlinkEncoding::Base64,
        _ => DownlinkEncoding::Binary,
    };
    ws.on_upgrade(move |socket| handle_ws(socket, service, authed, encoding))
}

/// Per-socket task: admission, binding, and the uplink loop.
async fn handle_ws(
    socket: WebSocket,
    service: Arc<TerminalService>,
    authed: bool,
    encoding: DownlinkEncoding,
) {
    if !authed {
        warn!("terminal socket rejected: bad credentials");
        reject(socket, None, CloseReason::AuthFailure.close_code(), "auth_failure").await;
        return;
    }

    let session = match service.manager().create("User").await {
        Ok(session) => session,
        Err(e @ AdmissionError::Capacity(_)) => {
            info!("terminal socket rejected: {e}");
            reject(
                socket,
                Some(json!({"error": "capacity"})),
                CloseReason::CapacityExceeded.close_code(),
                "capacity",
            )
            .await;
            return;
        }
        Err(AdmissionError::ShuttingDown) => {
            reject(
                socket,
                Some(json!({"error": "shutting_down"})),
                CLOSE_SHUTTING_DOWN,
                "shutting_down",
            )
            .await;
            return;
        }
        Err(AdmissionError::Spawn(e)) => {
            warn!("terminal spawn failed: {e}");
            reject(
                socket,
                Some(json!({"error": "spawn_failed"})),
                CLOSE_INTERNAL,
                "spawn_failed",
            )
            .await;
            return;
        }
    };

    let id = session.id();
    let cfg = service.cfg().clone();
    let manager = service.manager().clone();

    let (ws_sink, ws_stream) = socket.split();
    let (tx, rx) = mpsc::channel::<WsOutbound>(outbound_capacity(&cfg));

    if let Err(e) = manager.bind_ws(id, tx.clone()).await {
        // Only reachable if the session died between create and bind
        warn!("session {id} bind failed: {e}");
        manager.close(id, CloseReason::IoError).await;
        return;
    }
    info!("session {id} bound to WebSocket client");

    let mut sink_task = tokio::spawn(sink_writer(ws_sink, rx, encoding));
    let mut downlink_task = tokio::spawn(downlink(
        Arc::clone(&session),
        manager.clone(),
        tx.clone(),
        cfg.clone(),
    ));

    match uplink(&session, ws_stream, &tx, &cfg).await {
        // Disconnect: detach, which closes under the default policy
        Some(CloseReason::ClientClose) => manager.unbind_ws(id).await,
        Some(reason) => {
            manager.close(id, reason).await;
        }
        None => {}
    }

    // Both helpers observe the cancellation token; give them the exit window
    drop(tx);
    if tokio::time::timeout(cfg.exit_wait(), &mut downlink_task)
        .await
        .is_err()
    {
        downlink_task.abort();
    }
    if tokio::time::timeout(cfg.exit_wait(), &mut sink_task)
        .await
        .is_err()
    {
        sink_task.abort();
    }
    debug!("session {id} socket task finished");
}

/// Client→PTY pump plus protocol keepalive.
///
/// Returns the close reason this side decided on, or `None` when the session
/// was closed elsewhere (shell exit, timeout, drain) and the close frame is
/// already on its way.
async fn uplink(
    session: &Arc<Session>,
    mut ws_stream: SplitStream<WebSocket>,
    tx: &mpsc::Sender<WsOutbound>,
    cfg: &TerminalConfig,
) -> Option<CloseReason> {
    let id = session.id();
    let cancel = session.cancel_token();
    let mut ping = tokio::time::interval(cfg.ping_interval());
    let mut last_pong = tokio::time::Instant::now();

    loop {
        tokio::select! {
            () = cancel.cancelled() => return None,
            _ = ping.tick() => {
                if last_pong.elapsed() >= cfg.pong_timeout() {
                    warn!("session {id} missed pong deadline");
                    return Some(CloseReason::IoError);
                }
                if tx.send(WsOutbound::Ping).await.is_err() {
                    return Some(CloseReason::IoError);
                }
            }
            msg = ws_stream.next() => match msg {
                None | Some(Err(_)) => return Some(CloseReason::ClientClose),
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<ClientMsg>(text.as_str()) {
                        Ok(ClientMsg::Input { data }) => {
                            let write = session.pty().write_all(data.as_bytes());
                            match tokio::time::timeout(cfg.input_stall(), write).await {
                                Ok(Ok(())) => session.touch(),
                                Ok(Err(PtyError::Closed | PtyError::Eof)) => {
                                    // Shell is gone; the exit watcher reports it
                                    return None;
                                }
                                Ok(Err(PtyError::Io(e))) => {
                                    debug!("session {id} input write failed: {e}");
                                    return Some(CloseReason::IoError);
                                }
                                Err(_) => {
                                    warn!("session {id} input stalled");
                                    return Some(CloseReason::IoError);
                                }
                            }
                        }
                        Ok(ClientMsg::Resize { cols, rows }) => {
                            if cols == 0 || rows == 0 {
                                return Some(CloseReason::ProtocolError);
                            }
                            if let Err(e) = session.pty().resize(cols, rows).await {
                                debug!("session {id} resize failed: {e}");
                            }
                        }
                        Ok(ClientMsg::Ping { ts }) => {
                            session.touch();
                            let pong = json!({"type": "pong", "ts": ts}).to_string();
                            let _ = tx.send(WsOutbound::Text(pong)).await;
                        }
                        Err(e) => {
                            debug!("session {id} bad control frame: {e}");
                            return Some(CloseReason::ProtocolError);
                        }
                    }
                }
                Some(Ok(Message::Binary(_))) => {
                    // Input is UTF-8 JSON text only
                    return Some(CloseReason::ProtocolError);
                }
                Some(Ok(Message::Pong(_))) => {
                    last_pong = tokio::time::Instant::now();
                    session.touch();
                }
                Some(Ok(Message::Ping(_))) => {} // axum answers pings itself
                Some(Ok(Message::Close(_))) => return Some(CloseReason::ClientClose),
            }
        }
    }
}

/// PTY→client pump. Reads are chunked at `buffer_size`; the bounded channel
/// to the sink suspends reads while the client drains its queue.
async fn downlink(
    session: Arc<Session>,
    manager: SessionManager,
    tx: mpsc::Sender<WsOutbound>,
    cfg: TerminalConfig,
) {
    let cancel = session.cancel_token();
    let mut buf = vec![0u8; cfg.buffer_size];
    let reason = loop {
        let n = tokio::select! {
            () = cancel.cancelled() => return,
            r = session.pty().read(&mut buf) => match r {
                Ok(n) => n,
                Err(PtyError::Eof | PtyError::Closed) => {
                    // Shell exited: all output has been forwarded, resolve
                    // the code and let close() deliver the exit notice
                    let code = tokio::time::timeout(cfg.exit_grace(), session.pty().wait_exit())
                        .await
                        .unwrap_or(-1);
                    break CloseReason::ShellExit(code);
                }
                Err(PtyError::Io(e)) => {
                    debug!("session {} downlink read failed: {e}", session.id());
                    break CloseReason::IoError;
                }
            }
        };
        session.touch();
        if tx.send(WsOutbound::Data(buf[..n].to_vec())).await.is_err() {
            return;
        }
    };
    manager.close(session.id(), reason).await;
}

/// Funnel task: forwards queued frames to the socket sink. Dies after the
/// close frame or when every sender is gone.
async fn sink_writer(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<WsOutbound>,
    encoding: DownlinkEncoding,
) {
    while let Some(out) = rx.recv().await {
        let msg = match out {
            WsOutbound::Data(bytes) => match encoding {
                DownlinkEncoding::Binary => Message::Binary(bytes.into()),
                DownlinkEncoding::Base64 => {
                    let text = base64::engine::general_purpose::STANDARD.encode(&bytes);
                    Message::Text(text.into())
                }
            },
            WsOutbound::Text(text) => Message::Text(text.into()),
            WsOutbound::Ping => Message::Ping(Vec::new().into()),
            WsOutbound::Close { code, reason } => {
                let frame = CloseFrame {
                    code,
                    reason: reason.into(),
                };
                let _ = sink.send(Message::Close(Some(frame))).await;
                break;
            }
        };
        if sink.send(msg).await.is_err() {
            break;
        }
    }
}

/// Pre-session refusal: optional JSON notice, then a close frame.
async fn reject(
    mut socket: WebSocket,
    notice: Option<serde_json::Value>,
    code: u16,
    reason: &'static str,
) {
    if let Some(notice) = notice {
        let _ = socket.send(Message::Text(notice.to_string().into())).await;
    }
    let frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    let _ = socket.send(Message::Close(Some(frame))).await;
}

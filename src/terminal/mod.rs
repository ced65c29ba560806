//! Browser-accessible terminal service.
//!
//! [`TerminalService`] composes the pieces: the [`manager`] keeps the session
//! table, [`ws`] turns upgraded sockets into PTY-bound sessions, [`assets`]
//! serves the xterm.js page, and [`pty`] owns the shell processes. The
//! service exposes exactly two host-facing hooks — a router to mount under
//! the configured web path, and `init`/`shutdown` for the lifecycle.

pub mod assets;
pub mod manager;
pub mod pty;
pub mod session;
pub mod ws;

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path as UrlPath, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::{Config, TerminalConfig};
use assets::{AssetError, AssetProvider};
use manager::SessionManager;

/// Facade over the terminal subsystem, shared by handlers and the lifecycle.
pub struct TerminalService {
    cfg: TerminalConfig,
    manager: SessionManager,
    assets: Arc<dyn AssetProvider>,
    tick_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl TerminalService {
    pub fn new(cfg: TerminalConfig) -> Self {
        let manager = SessionManager::new(cfg.clone());
        let assets = assets::provider_for(&cfg.web_root);
        Self {
            cfg,
            manager,
            assets,
            tick_task: Mutex::new(None),
        }
    }

    pub fn cfg(&self) -> &TerminalConfig {
        &self.cfg
    }

    pub fn manager(&self) -> &SessionManager {
        &self.manager
    }

    /// Routes to mount under the configured web path: the terminal page, the
    /// WebSocket upgrade, and static asset pass-through.
    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/", get(serve_index))
            .route("/ws", get(ws::ws_upgrade))
            .route("/{asset}", get(serve_asset))
            .with_state(self)
    }

    /// Start the periodic expiry tick. Idempotent; refused once the manager
    /// is draining so a landing host cannot be reinitialized.
    pub async fn init(&self) {
        let mut guard = self.tick_task.lock().await;
        if guard.is_some() {
            return;
        }
        if self.manager.is_draining() {
            warn!("terminal init refused: shutting down");
            return;
        }
        let manager = self.manager.clone();
        *guard = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            loop {
                interval.tick().await;
                manager.tick().await;
            }
        }));
        info!(
            "terminal service started (shell {}, max {} sessions)",
            self.cfg.shell_command, self.cfg.max_sessions
        );
    }

    /// Drain every session, then stop the tick task. Sessions are reaped
    /// before this returns.
    pub async fn shutdown(&self) {
        self.manager.drain().await;
        if let Some(task) = self.tick_task.lock().await.take() {
            task.abort();
        }
        info!("terminal service stopped");
    }
}

/// Resolve the effective CORS origin: terminal override, else the server
/// global, else `*`.
pub fn effective_cors_origin(config: &Config) -> String {
    config
        .terminal
        .cors_origin
        .clone()
        .or_else(|| config.server.cors_origin.clone())
        .unwrap_or_else(|| "*".to_string())
}

/// `GET <WebPath>/` — the terminal page.
async fn serve_index(State(service): State<Arc<TerminalService>>) -> Response {
    asset_response(service.assets.as_ref(), "index.html", None)
}

/// `GET <WebPath>/<asset>` — static pass-through with content-type inference
/// and single-range support.
async fn serve_asset(
    State(service): State<Arc<TerminalService>>,
    UrlPath(asset): UrlPath<String>,
    headers: HeaderMap,
) -> Response {
    let range = headers.get(header::RANGE).and_then(|v| v.to_str().ok());
    asset_response(service.assets.as_ref(), &asset, range)
}

fn asset_response(provider: &dyn AssetProvider, path: &str, range: Option<&str>) -> Response {
    let asset = match provider.fetch(path) {
        Ok(asset) => asset,
        Err(AssetError::NotFound) => return StatusCode::NOT_FOUND.into_response(),
        Err(AssetError::Io(e)) => {
            warn!("asset {path} failed to load: {e}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let len = asset.bytes.len() as u64;
    if let Some(range) = range {
        let Some((start, end)) = assets::parse_range(range, len) else {
            return (
                StatusCode::RANGE_NOT_SATISFIABLE,
                [(header::CONTENT_RANGE, format!("bytes */{len}"))],
            )
                .into_response();
        };
        #[allow(clippy::cast_possible_truncation)]
        let slice = asset.bytes[start as usize..=end as usize].to_vec();
        return (
            StatusCode::PARTIAL_CONTENT,
            [
                (header::CONTENT_TYPE, asset.content_type.to_string()),
                (header::CONTENT_RANGE, format!("bytes {start}-{end}/{len}")),
                (header::ACCEPT_RANGES, "bytes".to_string()),
            ],
            slice,
        )
            .into_response();
    }

    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, asset.content_type.to_string()),
            (header::ACCEPT_RANGES, "bytes".to_string()),
        ],
        asset.bytes,
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;

    fn config_with(terminal_origin: Option<&str>, server_origin: Option<&str>) -> Config {
        Config {
            server: ServerConfig {
                cors_origin: server_origin.map(ToString::to_string),
                ..ServerConfig::default()
            },
            terminal: TerminalConfig {
                cors_origin: terminal_origin.map(ToString::to_string),
                ..TerminalConfig::default()
            },
            logging: crate::config::LoggingConfig::default(),
        }
    }

    #[test]
    fn cors_origin_prefers_the_terminal_override() {
        let config = config_with(Some("https://a.example"), Some("https://b.example"));
        assert_eq!(effective_cors_origin(&config), "https://a.example");
    }

    #[test]
    fn cors_origin_falls_back_to_the_server_global() {
        let config = config_with(None, Some("https://b.example"));
        assert_eq!(effective_cors_origin(&config), "https://b.example");
    }

    #[test]
    fn cors_origin_defaults_to_wildcard() {
        let config = config_with(None, None);
        assert_eq!(effective_cors_origin(&config), "*");
    }
}

//! Shared application state passed to handlers via axum's `State` extractor.

use std::sync::Arc;
use std::time::Instant;

use crate::config::Config;
use crate::terminal::TerminalService;

/// Shared application state for the hydrogen host.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the host started (for uptime calculation).
    pub start_time: Instant,
    /// The terminal subsystem facade.
    pub terminal: Arc<TerminalService>,
}

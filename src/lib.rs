#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! hydrogen library — the building blocks of the service host.
//!
//! The hardest subsystem lives under [`terminal`]: a multi-session bridge
//! that attaches browser xterm.js clients over WebSocket to server-spawned
//! PTY shell processes. The remaining modules are the host plumbing:
//!
//! - `config` — TOML configuration with env overrides
//! - `auth` — shared-key handshake validation
//! - `lifecycle` — subsystem registry (launch/landing coordination)
//! - `routes` — host-level HTTP handlers (health)
//! - `state` — shared state handed to axum handlers

pub mod auth;
pub mod config;
pub mod lifecycle;
pub mod routes;
pub mod state;
pub mod terminal;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use lifecycle::{Registry, Subsystem, TerminalSubsystem};
pub use state::AppState;
pub use terminal::TerminalService;

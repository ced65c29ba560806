#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # hydrogen
//!
//! Long-lived embedded HTTP/WebSocket service host. Its flagship subsystem
//! is the browser-accessible terminal: xterm.js clients attach over
//! WebSocket to server-spawned PTY shell sessions, coordinated with the rest
//! of the host through a launch/landing lifecycle.

use std::sync::Arc;
use std::time::Instant;

use axum::http::HeaderValue;
use axum::routing::get;
use axum::Router;
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use hydrogen::{
    config::Config, lifecycle::Registry, routes, terminal, AppState, TerminalService,
    TerminalSubsystem,
};

/// Embedded HTTP/WebSocket service host with a browser-accessible terminal.
#[derive(Parser)]
#[command(name = "hydrogen", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the host (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config_path = match cli.command {
        Some(Commands::Serve { config }) => config,
        None => None,
    };
    run_host(config_path.as_deref()).await;
}

async fn run_host(config_path: Option<&str>) {
    let config = Config::load(config_path);

    // Initialize tracing
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    // Validate config before proceeding
    let validation_errors = config.validate();
    if !validation_errors.is_empty() {
        for err in &validation_errors {
            error!("Config error: {err}");
        }
        std::process::exit(1);
    }

    info!("hydrogen v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", config.server.listen);

    if config.terminal.enabled && config.terminal.auth_key == "change-me" {
        warn!("Using default terminal key — set HYDROGEN_AUTH_KEY or update config");
    }

    let config = Arc::new(config);
    let terminal_service = Arc::new(TerminalService::new(config.terminal.clone()));
    let state = AppState {
        config: Arc::clone(&config),
        start_time: Instant::now(),
        terminal: Arc::clone(&terminal_service),
    };

    // Network first: subsystem readiness gates on the listener being up
    let listener = TcpListener::bind(&config.server.listen)
        .await
        .expect("Failed to bind");
    let (ready_tx, ready_rx) = watch::channel(false);
    let _ = ready_tx.send(true);

    let mut registry = Registry::new();
    if config.terminal.enabled {
        registry.register(Box::new(TerminalSubsystem::new(
            Arc::clone(&terminal_service),
            ready_rx,
        )));
    }
    if let Err(e) = registry.launch().await {
        error!("Launch failed: {e}");
        std::process::exit(1);
    }

    // Build router
    let mut app = Router::new()
        .route("/api/health", get(routes::health::health))
        .with_state(state);
    if config.terminal.enabled {
        app = app.nest(
            &config.terminal.web_path,
            Arc::clone(&terminal_service).router(),
        );
        info!("Terminal mounted at {}", config.terminal.web_path);
    }

    let app = app
        .layer(cors_layer(&config))
        .layer(TraceLayer::new_for_http())
        .layer(tower::limit::ConcurrencyLimitLayer::new(
            config.server.max_connections,
        ));

    info!("Server ready");

    // Graceful shutdown on SIGINT/SIGTERM
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("Failed to register SIGTERM");
            tokio::select! {
                _ = ctrl_c => info!("Received SIGINT"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("Received SIGINT");
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .expect("Server error");

    // Landing: reverse of launch; the terminal drains and reaps every PTY
    info!("Landing...");
    registry.land().await;
    info!("Goodbye");
}

/// Build the CORS layer from the resolved origin policy.
fn cors_layer(config: &Config) -> CorsLayer {
    let origin = terminal::effective_cors_origin(config);
    let base = CorsLayer::new().allow_methods(Any).allow_headers([
        axum::http::header::AUTHORIZATION,
        axum::http::header::CONTENT_TYPE,
        axum::http::header::ACCEPT,
    ]);
    if origin == "*" {
        return base.allow_origin(Any);
    }
    match origin.parse::<HeaderValue>() {
        Ok(value) => base.allow_origin(value),
        Err(e) => {
            warn!("Invalid CORS origin {origin:?} ({e}), falling back to \"*\"");
            base.allow_origin(Any)
        }
    }
}

//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `HYDROGEN_AUTH_KEY`, `HYDROGEN_LISTEN`
//! 2. **Config file** — path via `--config <path>`, or `hydrogen.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:8080"
//! max_connections = 64
//!
//! [terminal]
//! enabled = true
//! web_path = "/terminal"
//! web_root = "PAYLOAD:/terminal"     # or a filesystem path
//! shell_command = "/bin/bash"
//! max_sessions = 10
//! idle_timeout_secs = 600
//! max_session_secs = 3600
//! auth_key = "your-secret-key"
//!
//! [logging]
//! level = "info"
//! ```

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub terminal: TerminalConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:8080`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Maximum concurrent connections (default 64).
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Global CORS origin. Subsystems may override; unset means `*`.
    #[serde(default)]
    pub cors_origin: Option<String>,
}

/// Terminal subsystem settings.
#[derive(Debug, Clone, Deserialize)]
pub struct TerminalConfig {
    /// Gates the whole subsystem (default true).
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// HTTP mount point (default `/terminal`).
    #[serde(default = "default_web_path")]
    pub web_path: String,
    /// Static asset source: `PAYLOAD:/...` selects the compiled-in bundle,
    /// anything else is a filesystem path (default `PAYLOAD:/terminal`).
    #[serde(default = "default_web_root")]
    pub web_root: String,
    /// Shell executed for each session (default `/bin/bash`). Validated at
    /// startup.
    #[serde(default = "default_shell_command")]
    pub shell_command: String,
    /// Hard cap on live sessions (default 10).
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Seconds of inactivity before a session is closed (default 600).
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Absolute session lifetime in seconds (default 3600).
    #[serde(default = "default_max_session_secs")]
    pub max_session_secs: u64,
    /// PTY read chunk and WebSocket frame size in bytes (default 4096).
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Seconds between protocol-level pings (default 20).
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    /// Seconds without a pong before the socket is considered dead
    /// (default 30).
    #[serde(default = "default_pong_timeout_secs")]
    pub pong_timeout_secs: u64,
    /// Seconds the pumps get to wind down on close (default 10).
    #[serde(default = "default_exit_wait_secs")]
    pub exit_wait_secs: u64,
    /// Seconds between SIGHUP and SIGKILL during PTY teardown (default 2).
    #[serde(default = "default_exit_grace_secs")]
    pub exit_grace_secs: u64,
    /// Seconds a blocked PTY input write is tolerated (default 5).
    #[serde(default = "default_input_stall_secs")]
    pub input_stall_secs: u64,
    /// Outbound queue size in bytes above which PTY reads suspend
    /// (default 1 MiB).
    #[serde(default = "default_write_high_watermark")]
    pub write_high_watermark: usize,
    /// Outbound queue size in bytes at which PTY reads resume
    /// (default 256 KiB).
    #[serde(default = "default_write_low_watermark")]
    pub write_low_watermark: usize,
    /// Per-subsystem CORS origin override.
    #[serde(default)]
    pub cors_origin: Option<String>,
    /// Shared key accepted as `Authorization: Key <K>` or `?key=<K>`.
    /// Override with `HYDROGEN_AUTH_KEY`. Defaults to `"change-me"` which
    /// triggers a startup warning.
    #[serde(default = "default_auth_key")]
    pub auth_key: String,
}

impl TerminalConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn max_session(&self) -> Duration {
        Duration::from_secs(self.max_session_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_secs(self.pong_timeout_secs)
    }

    pub fn exit_wait(&self) -> Duration {
        Duration::from_secs(self.exit_wait_secs)
    }

    pub fn exit_grace(&self) -> Duration {
        Duration::from_secs(self.exit_grace_secs)
    }

    pub fn input_stall(&self) -> Duration {
        Duration::from_secs(self.input_stall_secs)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG`.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_max_connections() -> usize {
    64
}
fn default_enabled() -> bool {
    true
}
fn default_web_path() -> String {
    "/terminal".to_string()
}
fn default_web_root() -> String {
    "PAYLOAD:/terminal".to_string()
}
fn default_shell_command() -> String {
    "/bin/bash".to_string()
}
fn default_max_sessions() -> usize {
    10
}
fn default_idle_timeout_secs() -> u64 {
    600
}
fn default_max_session_secs() -> u64 {
    3600
}
fn default_buffer_size() -> usize {
    4096
}
fn default_ping_interval_secs() -> u64 {
    20
}
fn default_pong_timeout_secs() -> u64 {
    30
}
fn default_exit_wait_secs() -> u64 {
    10
}
fn default_exit_grace_secs() -> u64 {
    2
}
fn default_input_stall_secs() -> u64 {
    5
}
fn default_write_high_watermark() -> usize {
    1024 * 1024
}
fn default_write_low_watermark() -> usize {
    256 * 1024
}
fn default_auth_key() -> String {
    "change-me".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_connections: default_max_connections(),
            cors_origin: None,
        }
    }
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            web_path: default_web_path(),
            web_root: default_web_root(),
            shell_command: default_shell_command(),
            max_sessions: default_max_sessions(),
            idle_timeout_secs: default_idle_timeout_secs(),
            max_session_secs: default_max_session_secs(),
            buffer_size: default_buffer_size(),
            ping_interval_secs: default_ping_interval_secs(),
            pong_timeout_secs: default_pong_timeout_secs(),
            exit_wait_secs: default_exit_wait_secs(),
            exit_grace_secs: default_exit_grace_secs(),
            input_stall_secs: default_input_stall_secs(),
            write_high_watermark: default_write_high_watermark(),
            write_low_watermark: default_write_low_watermark(),
            cors_origin: None,
            auth_key: default_auth_key(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file >
    /// defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure). Otherwise
    /// looks for `hydrogen.toml` in the current directory, falling back to
    /// compiled defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("hydrogen.toml").exists() {
            let content =
                std::fs::read_to_string("hydrogen.toml").expect("Failed to read hydrogen.toml");
            toml::from_str(&content).expect("Failed to parse hydrogen.toml")
        } else {
            Config::default()
        };

        // Env var overrides
        if let Ok(key) = std::env::var("HYDROGEN_AUTH_KEY") {
            config.terminal.auth_key = key;
        }
        if let Ok(listen) = std::env::var("HYDROGEN_LISTEN") {
            config.server.listen = listen;
        }

        config
    }

    /// Check the configuration for fatal problems. Returns every error found
    /// so the operator can fix them in one pass.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        let t = &self.terminal;

        if !t.web_path.starts_with('/') || t.web_path.len() < 2 || t.web_path.ends_with('/') {
            errors.push(format!(
                "terminal.web_path must look like \"/terminal\", got {:?}",
                t.web_path
            ));
        }
        if t.buffer_size == 0 {
            errors.push("terminal.buffer_size must be greater than zero".to_string());
        }
        if t.write_low_watermark >= t.write_high_watermark {
            errors.push(format!(
                "terminal.write_low_watermark ({}) must be below write_high_watermark ({})",
                t.write_low_watermark, t.write_high_watermark
            ));
        }
        if t.max_sessions == 0 {
            errors.push("terminal.max_sessions must be greater than zero".to_string());
        }
        if t.enabled && !Path::new(&t.shell_command).exists() {
            errors.push(format!(
                "terminal.shell_command does not exist: {}",
                t.shell_command
            ));
        }
        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let config = Config::default();
        assert_eq!(config.server.listen, "0.0.0.0:8080");
        assert!(config.terminal.enabled);
        assert_eq!(config.terminal.web_path, "/terminal");
        assert_eq!(config.terminal.web_root, "PAYLOAD:/terminal");
        assert_eq!(config.terminal.max_sessions, 10);
        assert_eq!(config.terminal.idle_timeout_secs, 600);
        assert_eq!(config.terminal.max_session_secs, 3600);
        assert_eq!(config.terminal.buffer_size, 4096);
        assert_eq!(config.terminal.ping_interval_secs, 20);
        assert_eq!(config.terminal.pong_timeout_secs, 30);
        assert_eq!(config.terminal.exit_wait_secs, 10);
        assert_eq!(config.terminal.exit_grace_secs, 2);
        assert_eq!(config.terminal.write_high_watermark, 1024 * 1024);
        assert_eq!(config.terminal.write_low_watermark, 256 * 1024);
        assert_eq!(config.terminal.auth_key, "change-me");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let config: Config = toml::from_str(
            r#"
            [terminal]
            max_sessions = 2
            auth_key = "k"
            "#,
        )
        .expect("parse");
        assert_eq!(config.terminal.max_sessions, 2);
        assert_eq!(config.terminal.auth_key, "k");
        assert_eq!(config.terminal.web_path, "/terminal");
        assert_eq!(config.server.listen, "0.0.0.0:8080");
    }

    #[test]
    fn full_toml_round_trips() {
        let config: Config = toml::from_str(
            r#"
            [server]
            listen = "127.0.0.1:9000"
            cors_origin = "https://ops.example"

            [terminal]
            enabled = false
            web_path = "/tty"
            web_root = "/srv/terminal"
            shell_command = "/bin/sh"
            idle_timeout_secs = 30

            [logging]
            level = "debug"
            "#,
        )
        .expect("parse");
        assert_eq!(config.server.listen, "127.0.0.1:9000");
        assert_eq!(config.server.cors_origin.as_deref(), Some("https://ops.example"));
        assert!(!config.terminal.enabled);
        assert_eq!(config.terminal.web_path, "/tty");
        assert_eq!(config.terminal.web_root, "/srv/terminal");
        assert_eq!(config.terminal.idle_timeout(), Duration::from_secs(30));
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn validate_flags_bad_web_paths() {
        for bad in ["terminal", "/", "/terminal/"] {
            let config = Config {
                terminal: TerminalConfig {
                    web_path: bad.to_string(),
                    shell_command: "/bin/sh".to_string(),
                    ..TerminalConfig::default()
                },
                ..Config::default()
            };
            assert!(
                !config.validate().is_empty(),
                "web_path {bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn validate_flags_a_missing_shell() {
        let config = Config {
            terminal: TerminalConfig {
                shell_command: "/no/such/shell".to_string(),
                ..TerminalConfig::default()
            },
            ..Config::default()
        };
        assert!(config
            .validate()
            .iter()
            .any(|e| e.contains("shell_command")));
    }

    #[test]
    fn validate_ignores_the_shell_when_disabled() {
        let config = Config {
            terminal: TerminalConfig {
                enabled: false,
                shell_command: "/no/such/shell".to_string(),
                ..TerminalConfig::default()
            },
            ..Config::default()
        };
        assert!(config.validate().is_empty());
    }

    #[test]
    fn validate_flags_inverted_watermarks() {
        let config = Config {
            terminal: TerminalConfig {
                shell_command: "/bin/sh".to_string(),
                write_high_watermark: 1024,
                write_low_watermark: 2048,
                ..TerminalConfig::default()
            },
            ..Config::default()
        };
        assert!(config.validate().iter().any(|e| e.contains("watermark")));
    }

    #[test]
    fn accepted_config_validates_clean() {
        let config = Config {
            terminal: TerminalConfig {
                shell_command: "/bin/sh".to_string(),
                ..TerminalConfig::default()
            },
            ..Config::default()
        };
        assert!(config.validate().is_empty());
    }
}

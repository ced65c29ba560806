//! Subsystem lifecycle: launch in dependency order, land in reverse.
//!
//! Every long-lived part of the host implements [`Subsystem`] and registers
//! with the [`Registry`]. Launch walks the registration order: a subsystem
//! must report ready before it is started, and a failure anywhere stops the
//! already-started prefix in reverse before the error is surfaced — launch
//! never leaves a half-started host behind. Landing mirrors launch in
//! reverse order and never skips a subsystem because an earlier stop failed.

use std::fmt;
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nix::pty::{openpty, Winsize};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::terminal::TerminalService;

/// Attempts made waiting for a subsystem to report ready.
const READY_ATTEMPTS: u32 = 20;
/// Delay between readiness polls.
const READY_POLL: Duration = Duration::from_millis(100);

/// Contract every host subsystem implements.
#[async_trait]
pub trait Subsystem: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether the subsystem's preconditions hold. Polled before `start`.
    async fn ready(&self) -> bool;

    async fn start(&self) -> Result<(), String>;

    async fn stop(&self) -> Result<(), String>;
}

/// Errors surfaced by [`Registry::launch`].
#[derive(Debug)]
pub enum LaunchError {
    /// The subsystem never reported ready within the polling window.
    NotReady { name: &'static str },
    SubsystemStartFailed { name: &'static str, error: String },
}

impl fmt::Display for LaunchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LaunchError::NotReady { name } => {
                write!(f, "subsystem {name} did not become ready")
            }
            LaunchError::SubsystemStartFailed { name, error } => {
                write!(f, "subsystem {name} failed to start: {error}")
            }
        }
    }
}

/// Ordered collection of subsystems with launch/landing coordination.
#[derive(Default)]
pub struct Registry {
    subsystems: Vec<Box<dyn Subsystem>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subsystem. Registration order is dependency order: leaves
    /// first.
    pub fn register(&mut self, subsystem: Box<dyn Subsystem>) {
        self.subsystems.push(subsystem);
    }

    /// Start every subsystem in registration order. On failure the started
    /// prefix is landed in reverse before the error is returned.
    pub async fn launch(&self) -> Result<(), LaunchError> {
        for (idx, subsystem) in self.subsystems.iter().enumerate() {
            let name = subsystem.name();
            if !wait_ready(subsystem.as_ref()).await {
                error!("subsystem {name} not ready, aborting launch");
                self.land_prefix(idx).await;
                return Err(LaunchError::NotReady { name });
            }
            if let Err(error) = subsystem.start().await {
                error!("subsystem {name} failed to start: {error}");
                self.land_prefix(idx).await;
                return Err(LaunchError::SubsystemStartFailed { name, error });
            }
            info!("subsystem {name} started");
        }
        Ok(())
    }

    /// Stop every subsystem in reverse registration order.
    pub async fn land(&self) {
        self.land_prefix(self.subsystems.len()).await;
    }

    async fn land_prefix(&self, count: usize) {
        for subsystem in self.subsystems[..count].iter().rev() {
            let name = subsystem.name();
            match subsystem.stop().await {
                Ok(()) => info!("subsystem {name} landed"),
                Err(e) => warn!("subsystem {name} failed to land cleanly: {e}"),
            }
        }
    }
}

async fn wait_ready(subsystem: &dyn Subsystem) -> bool {
    for _ in 0..READY_ATTEMPTS {
        if subsystem.ready().await {
            return true;
        }
        tokio::time::sleep(READY_POLL).await;
    }
    false
}

/// Lifecycle adapter for the terminal service.
pub struct TerminalSubsystem {
    service: Arc<TerminalService>,
    /// Flipped by the host once the network listener is bound.
    server_ready: watch::Receiver<bool>,
}

impl TerminalSubsystem {
    pub fn new(service: Arc<TerminalService>, server_ready: watch::Receiver<bool>) -> Self {
        Self {
            service,
            server_ready,
        }
    }
}

#[async_trait]
impl Subsystem for TerminalSubsystem {
    fn name(&self) -> &'static str {
        "terminal"
    }

    /// Preconditions: listener up, shell executable, PTY allocation works.
    async fn ready(&self) -> bool {
        *self.server_ready.borrow()
            && shell_is_executable(&self.service.cfg().shell_command)
            && pty_smoke_test()
    }

    async fn start(&self) -> Result<(), String> {
        self.service.init().await;
        Ok(())
    }

    /// Drains every session (reaping guaranteed) before the upkeep task is
    /// torn down.
    async fn stop(&self) -> Result<(), String> {
        self.service.shutdown().await;
        Ok(())
    }
}

fn shell_is_executable(path: &str) -> bool {
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Allocate and immediately release a PTY pair.
fn pty_smoke_test() -> bool {
    let winsize = Winsize {
        ws_row: 24,
        ws_col: 80,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    openpty(&winsize, None).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    type EventLog = Arc<Mutex<Vec<String>>>;

    struct StubSubsystem {
        name: &'static str,
        log: EventLog,
        fail_start: bool,
    }

    #[async_trait]
    impl Subsystem for StubSubsystem {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn ready(&self) -> bool {
            true
        }

        async fn start(&self) -> Result<(), String> {
            self.log.lock().unwrap().push(format!("start:{}", self.name));
            if self.fail_start {
                Err("boom".to_string())
            } else {
                Ok(())
            }
        }

        async fn stop(&self) -> Result<(), String> {
            self.log.lock().unwrap().push(format!("stop:{}", self.name));
            Ok(())
        }
    }

    fn stub(name: &'static str, log: &EventLog, fail_start: bool) -> Box<StubSubsystem> {
        Box::new(StubSubsystem {
            name,
            log: Arc::clone(log),
            fail_start,
        })
    }

    #[tokio::test]
    async fn launch_runs_in_order_and_landing_reverses() {
        let log: EventLog = Arc::default();
        let mut registry = Registry::new();
        registry.register(stub("a", &log, false));
        registry.register(stub("b", &log, false));
        registry.register(stub("c", &log, false));

        registry.launch().await.expect("launch");
        registry.land().await;

        let events = log.lock().unwrap().clone();
        assert_eq!(
            events,
            vec!["start:a", "start:b", "start:c", "stop:c", "stop:b", "stop:a"]
        );
    }

    #[tokio::test]
    async fn start_failure_lands_the_started_prefix() {
        let log: EventLog = Arc::default();
        let mut registry = Registry::new();
        registry.register(stub("a", &log, false));
        registry.register(stub("b", &log, true));
        registry.register(stub("c", &log, false));

        let err = registry.launch().await.expect_err("launch must fail");
        assert!(matches!(
            err,
            LaunchError::SubsystemStartFailed { name: "b", .. }
        ));

        let events = log.lock().unwrap().clone();
        // c never started; a was unwound
        assert_eq!(events, vec!["start:a", "start:b", "stop:a"]);
    }

    #[tokio::test]
    async fn unready_subsystem_aborts_launch() {
        struct NeverReady;

        #[async_trait]
        impl Subsystem for NeverReady {
            fn name(&self) -> &'static str {
                "never"
            }
            async fn ready(&self) -> bool {
                false
            }
            async fn start(&self) -> Result<(), String> {
                panic!("start must not run");
            }
            async fn stop(&self) -> Result<(), String> {
                Ok(())
            }
        }

        let mut registry = Registry::new();
        registry.register(Box::new(NeverReady));
        let err = registry.launch().await.expect_err("launch must fail");
        assert!(matches!(err, LaunchError::NotReady { name: "never" }));
    }

    #[test]
    fn shell_probe_accepts_a_real_shell() {
        assert!(shell_is_executable("/bin/sh"));
        assert!(!shell_is_executable("/no/such/shell"));
        assert!(!shell_is_executable("/etc/hostname"));
    }

    #[test]
    fn pty_smoke_test_passes() {
        assert!(pty_smoke_test());
    }

    #[tokio::test]
    async fn terminal_subsystem_waits_for_the_listener() {
        let cfg = crate::config::TerminalConfig {
            shell_command: "/bin/sh".to_string(),
            ..crate::config::TerminalConfig::default()
        };
        let service = Arc::new(TerminalService::new(cfg));
        let (tx, rx) = watch::channel(false);
        let subsystem = TerminalSubsystem::new(service, rx);

        assert!(!subsystem.ready().await);
        tx.send(true).expect("flip readiness");
        assert!(subsystem.ready().await);

        subsystem.start().await.expect("start");
        subsystem.stop().await.expect("stop");
    }
}

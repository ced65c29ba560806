//! PTY allocation, shell spawning, and byte-level channel I/O.
//!
//! A [`PtyChannel`] owns one PTY master and the shell process attached to its
//! slave side. The channel is full duplex: `read` pulls shell output off the
//! master, `write_all` pushes client input into it. The master fd is kept
//! alive for the channel lifetime so resize ioctls can be issued on it.
//!
//! The child is a session leader (`setsid`) with the slave as its controlling
//! terminal, so `kill(-pgid, sig)` reaches the whole process tree while the
//! kernel's job control layer still protects the shell from stray SIGINTs.

use std::collections::HashMap;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use nix::pty::{openpty, OpenptyResult, Winsize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error};

/// Terminal window dimensions in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub cols: u16,
    pub rows: u16,
}

impl Window {
    fn winsize(self) -> Winsize {
        Winsize {
            ws_row: self.rows,
            ws_col: self.cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        }
    }
}

impl Default for Window {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

/// Errors that can occur while spawning a shell on a fresh PTY.
#[derive(Debug)]
pub enum SpawnError {
    /// The shell binary does not exist.
    ShellNotFound(String),
    /// The kernel refused to allocate a PTY pair.
    PtyExhausted(nix::Error),
    /// Process creation failed before exec (fork, fd setup).
    Fork(std::io::Error),
    /// The shell exists but could not be executed.
    Exec(std::io::Error),
}

impl std::fmt::Display for SpawnError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SpawnError::ShellNotFound(path) => write!(f, "shell not found: {path}"),
            SpawnError::PtyExhausted(e) => write!(f, "PTY allocation failed: {e}"),
            SpawnError::Fork(e) => write!(f, "failed to fork shell process: {e}"),
            SpawnError::Exec(e) => write!(f, "failed to exec shell: {e}"),
        }
    }
}

/// Errors surfaced by channel I/O after a successful spawn.
#[derive(Debug)]
pub enum PtyError {
    /// The child side is gone; no more bytes will arrive.
    Eof,
    /// The channel was closed locally; the operation was refused.
    Closed,
    Io(std::io::Error),
}

impl std::fmt::Display for PtyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PtyError::Eof => write!(f, "PTY reached end of stream"),
            PtyError::Closed => write!(f, "PTY channel is closed"),
            PtyError::Io(e) => write!(f, "PTY I/O error: {e}"),
        }
    }
}

/// Full-duplex byte transport to a shell process on a PTY.
pub struct PtyChannel {
    pid: u32,
    pgid: i32,
    /// Master fd kept for resize ioctls; dropped on close.
    master: Mutex<Option<OwnedFd>>,
    /// Read half (dup of the master) for the downlink pump.
    reader: Mutex<Option<tokio::fs::File>>,
    /// Write half (dup of the master) for the uplink pump.
    writer: Mutex<Option<tokio::fs::File>>,
    window: Mutex<Window>,
    closed: AtomicBool,
    /// Publishes the child's exit code once the reaper task observes it.
    exit_rx: watch::Receiver<Option<i32>>,
}

impl PtyChannel {
    /// Allocate a PTY, spawn `shell` on its slave side, and arm the reaper.
    ///
    /// The child inherits the server environment merged with `env` overrides;
    /// `TERM` defaults to `xterm-256color` when not overridden. The `Child`
    /// handle moves into a background task whose `wait` reaps the process and
    /// publishes its exit code.
    pub fn spawn(
        shell: &str,
        env: &HashMap<String, String>,
        window: Window,
    ) -> Result<Self, SpawnError> {
        if !Path::new(shell).exists() {
            return Err(SpawnError::ShellNotFound(shell.to_string()));
        }

        let OpenptyResult { master, slave } =
            openpty(&window.winsize(), None).map_err(SpawnError::PtyExhausted)?;
        let slave_fd = slave.as_raw_fd();

        let mut cmd = Command::new(shell);
        cmd.kill_on_drop(true);
        // The child's stdio is wired to the PTY slave in pre_exec, so tell
        // tokio not to set up pipes.
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        cmd.envs(env);
        if !env.contains_key("TERM") {
            cmd.env("TERM", "xterm-256color");
        }

        // SAFETY: all syscalls used here are async-signal-safe per POSIX.
        unsafe {
            cmd.pre_exec(move || {
                // New session: the child becomes the session leader
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                // The PTY slave becomes the controlling terminal
                if libc::ioctl(slave_fd, libc::TIOCSCTTY, 0) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                libc::dup2(slave_fd, 0);
                libc::dup2(slave_fd, 1);
                libc::dup2(slave_fd, 2);
                if slave_fd > 2 {
                    libc::close(slave_fd);
                }
                Ok(())
            });
        }

        let mut child = cmd.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => SpawnError::ShellNotFound(shell.to_string()),
            std::io::ErrorKind::PermissionDenied => SpawnError::Exec(e),
            _ => SpawnError::Fork(e),
        })?;
        drop(slave);

        let pid = child.id().unwrap_or(0);
        // pgid = pid because the shell is a session leader via setsid()
        #[allow(clippy::cast_possible_wrap)]
        let pgid = pid as i32;

        // Dup the master: one fd per direction, the original kept for resize
        let master_raw: RawFd = master.as_raw_fd();
        let reader_fd: RawFd = unsafe { libc::dup(master_raw) };
        if reader_fd < 0 {
            return Err(SpawnError::Fork(std::io::Error::last_os_error()));
        }
        let writer_fd: RawFd = unsafe { libc::dup(master_raw) };
        if writer_fd < 0 {
            unsafe {
                libc::close(reader_fd);
            }
            return Err(SpawnError::Fork(std::io::Error::last_os_error()));
        }
        // SAFETY: we own these file descriptors via dup
        let reader = tokio::fs::File::from_std(unsafe { std::fs::File::from_raw_fd(reader_fd) });
        let writer = tokio::fs::File::from_std(unsafe { std::fs::File::from_raw_fd(writer_fd) });

        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => {
                    let code = status.code().unwrap_or(-1);
                    debug!("shell pid {pid} exited with code {code}");
                    let _ = exit_tx.send(Some(code));
                }
                Err(e) => {
                    error!("shell pid {pid} wait error: {e}");
                    let _ = exit_tx.send(Some(-1));
                }
            }
        });

        Ok(PtyChannel {
            pid,
            pgid,
            master: Mutex::new(Some(master)),
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
            window: Mutex::new(window),
            closed: AtomicBool::new(false),
            exit_rx,
        })
    }

    /// OS process ID of the shell.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Read shell output into `buf`. EIO from the master means the child side
    /// is gone and reads as [`PtyError::Eof`].
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, PtyError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PtyError::Closed);
        }
        let mut guard = self.reader.lock().await;
        let Some(file) = guard.as_mut() else {
            return Err(PtyError::Closed);
        };
        match file.read(buf).await {
            Ok(0) => Err(PtyError::Eof),
            Ok(n) => Ok(n),
            Err(e) if e.raw_os_error() == Some(libc::EIO) => Err(PtyError::Eof),
            Err(e) => Err(PtyError::Io(e)),
        }
    }

    /// Write `data` to the shell's input, retrying until fully accepted.
    pub async fn write_all(&self, data: &[u8]) -> Result<(), PtyError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PtyError::Closed);
        }
        let mut guard = self.writer.lock().await;
        let Some(file) = guard.as_mut() else {
            return Err(PtyError::Closed);
        };
        let map = |e: std::io::Error| match e.raw_os_error() {
            Some(libc::EIO) | Some(libc::EPIPE) => PtyError::Closed,
            _ => PtyError::Io(e),
        };
        file.write_all(data).await.map_err(map)?;
        file.flush().await.map_err(map)
    }

    /// Set the terminal window size. No-op when the size is unchanged.
    pub async fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        let mut window = self.window.lock().await;
        if window.cols == cols && window.rows == rows {
            return Ok(());
        }
        let master = self.master.lock().await;
        let Some(fd) = master.as_ref() else {
            return Err(PtyError::Closed);
        };
        let next = Window { cols, rows };
        let ws = next.winsize();
        // SAFETY: TIOCSWINSZ is a well-defined ioctl that reads a Winsize struct.
        let ret = unsafe { libc::ioctl(fd.as_raw_fd(), libc::TIOCSWINSZ, std::ptr::addr_of!(ws)) };
        if ret == -1 {
            return Err(PtyError::Io(std::io::Error::last_os_error()));
        }
        *window = next;
        Ok(())
    }

    /// Deliver `signal` to the child's process group.
    pub fn signal(&self, signal: i32) -> Result<(), PtyError> {
        if self.pgid <= 0 {
            return Err(PtyError::Closed);
        }
        let ret = unsafe { libc::kill(-self.pgid, signal) };
        if ret == 0 {
            Ok(())
        } else {
            Err(PtyError::Io(std::io::Error::last_os_error()))
        }
    }

    /// Exit code of the shell, if it has been reaped.
    pub fn exit_code(&self) -> Option<i32> {
        *self.exit_rx.borrow()
    }

    /// Wait until the shell has been reaped and return its exit code.
    pub async fn wait_exit(&self) -> i32 {
        let mut rx = self.exit_rx.clone();
        loop {
            if let Some(code) = *rx.borrow_and_update() {
                return code;
            }
            if rx.changed().await.is_err() {
                return -1;
            }
        }
    }

    /// Graceful teardown: EOF, SIGHUP, grace wait, SIGKILL, reap.
    ///
    /// Sequence: drop the write half and the master (EOF toward the child),
    /// SIGHUP to the process group, poll for the exit on a 50 ms cadence
    /// until `grace` expires, SIGKILL, then wait up to `exit_wait` for the
    /// reap. Returns the exit code, or `None` if the child could not be
    /// reaped in time (logged at error level, never left as a zombie holder).
    ///
    /// Idempotent and safe when the child is already gone; concurrent callers
    /// wait for the single reap.
    pub async fn close(&self, grace: Duration, exit_wait: Duration) -> Option<i32> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return tokio::time::timeout(exit_wait, self.wait_exit()).await.ok();
        }

        // EOF toward the child. The read half is left in place: a pump may be
        // parked in a read, which the child's exit will unblock.
        self.writer.lock().await.take();
        self.master.lock().await.take();

        if self.exit_code().is_none() && self.pgid > 0 {
            let _ = unsafe { libc::kill(-self.pgid, libc::SIGHUP) };
            let deadline = tokio::time::Instant::now() + grace;
            while self.exit_code().is_none() && tokio::time::Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            if self.exit_code().is_none() {
                debug!("pid {} survived SIGHUP grace, sending SIGKILL", self.pid);
                let _ = unsafe { libc::kill(-self.pgid, libc::SIGKILL) };
            }
        }

        let code = match tokio::time::timeout(exit_wait, self.wait_exit()).await {
            Ok(code) => Some(code),
            Err(_) => {
                error!(
                    "pid {} not reaped within {:?}, detaching",
                    self.pid, exit_wait
                );
                None
            }
        };
        self.reader.lock().await.take();
        code
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GRACE: Duration = Duration::from_secs(2);
    const EXIT_WAIT: Duration = Duration::from_secs(5);

    fn contains(haystack: &[u8], needle: &[u8]) -> bool {
        haystack.windows(needle.len()).any(|w| w == needle)
    }

    async fn read_until(pty: &PtyChannel, needle: &[u8], timeout: Duration) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline && !contains(&out, needle) {
            match tokio::time::timeout(Duration::from_millis(250), pty.read(&mut buf)).await {
                Ok(Ok(n)) => out.extend_from_slice(&buf[..n]),
                Ok(Err(_)) => break,
                Err(_) => {}
            }
        }
        out
    }

    #[tokio::test]
    async fn spawn_missing_shell_fails() {
        let err = PtyChannel::spawn("/no/such/shell", &HashMap::new(), Window::default());
        assert!(matches!(err, Err(SpawnError::ShellNotFound(_))));
    }

    #[tokio::test]
    async fn echo_round_trip() {
        let pty = PtyChannel::spawn("/bin/sh", &HashMap::new(), Window::default()).unwrap();
        pty.write_all(b"echo hydrogen-echo-ok\n").await.unwrap();
        let out = read_until(&pty, b"hydrogen-echo-ok", Duration::from_secs(5)).await;
        assert!(contains(&out, b"hydrogen-echo-ok"));
        pty.close(GRACE, EXIT_WAIT).await;
    }

    #[tokio::test]
    async fn resize_is_visible_to_the_shell() {
        let pty = PtyChannel::spawn("/bin/sh", &HashMap::new(), Window::default()).unwrap();
        pty.resize(100, 40).await.unwrap();
        pty.write_all(b"stty size\n").await.unwrap();
        let out = read_until(&pty, b"40 100", Duration::from_secs(5)).await;
        assert!(
            contains(&out, b"40 100"),
            "stty did not report the new size: {:?}",
            String::from_utf8_lossy(&out)
        );
        pty.close(GRACE, EXIT_WAIT).await;
    }

    #[tokio::test]
    async fn resize_unchanged_is_noop() {
        let pty = PtyChannel::spawn("/bin/sh", &HashMap::new(), Window::default()).unwrap();
        pty.resize(80, 24).await.unwrap();
        pty.resize(80, 24).await.unwrap();
        pty.close(GRACE, EXIT_WAIT).await;
    }

    #[tokio::test]
    async fn close_reaps_the_child() {
        let pty = PtyChannel::spawn("/bin/sh", &HashMap::new(), Window::default()).unwrap();
        let pid = pty.pid();
        assert!(pid > 0);
        let code = pty.close(GRACE, EXIT_WAIT).await;
        assert!(code.is_some(), "child was not reaped");
        // After the reap the pid must no longer exist
        #[allow(clippy::cast_possible_wrap)]
        let ret = unsafe { libc::kill(pid as i32, 0) };
        assert_eq!(ret, -1, "pid {pid} still exists after close");
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let pty = PtyChannel::spawn("/bin/sh", &HashMap::new(), Window::default()).unwrap();
        let first = pty.close(GRACE, EXIT_WAIT).await;
        let second = pty.close(GRACE, EXIT_WAIT).await;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn write_after_close_is_refused() {
        let pty = PtyChannel::spawn("/bin/sh", &HashMap::new(), Window::default()).unwrap();
        pty.close(GRACE, EXIT_WAIT).await;
        assert!(matches!(
            pty.write_all(b"echo nope\n").await,
            Err(PtyError::Closed)
        ));
    }

    #[tokio::test]
    async fn signal_reaches_the_process_group() {
        // SIGKILL: interactive shells ignore SIGTERM
        let pty = PtyChannel::spawn("/bin/sh", &HashMap::new(), Window::default()).unwrap();
        pty.signal(libc::SIGKILL).unwrap();
        let code = tokio::time::timeout(Duration::from_secs(5), pty.wait_exit())
            .await
            .expect("shell did not die from SIGKILL");
        // Killed by signal: no exit code
        assert_eq!(code, -1);
        pty.close(GRACE, EXIT_WAIT).await;
    }

    #[tokio::test]
    async fn shell_exit_surfaces_exit_code() {
        let pty = PtyChannel::spawn("/bin/sh", &HashMap::new(), Window::default()).unwrap();
        pty.write_all(b"exit 7\n").await.unwrap();
        let code = tokio::time::timeout(Duration::from_secs(5), pty.wait_exit())
            .await
            .expect("shell did not exit");
        assert_eq!(code, 7);
        pty.close(GRACE, EXIT_WAIT).await;
    }
}

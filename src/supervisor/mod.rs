//! Worker process supervisor.
//!
//! Owns the single locally spawned worker. `start` and `stop` are the only
//! mutators, both idempotent and both synchronous: neither waits for the worker
//! to exit. A monitor task owns the child and records its exit code. Once the
//! handle is released, whether by `stop` or because the worker died on its own,
//! the monitor force-kills the direct child and what is left of its tree when
//! the grace period ends.

mod locate;
mod terminator;

pub use locate::{default_resources_dir, resolve, worker_exe_name, Deployment, LaunchSpec};
pub(crate) use terminator::is_gone;
pub use terminator::{
    platform_terminator, ProcessGroupTerminator, TaskkillTerminator, Terminator,
};

use crate::error::SpawnError;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerState {
    NotStarted,
    Running,
    Terminating,
    Terminated,
}

/// Exit observed by the monitor. `code` is `None` when killed by a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerExit {
    pub code: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    pub deployment: Deployment,
    /// Time the worker gets to exit after a tree-termination request before its
    /// direct child is killed.
    #[serde(with = "humantime_serde")]
    pub stop_grace: Duration,
}

struct ProcessHandle {
    pid: u32,
    stop_tx: Option<oneshot::Sender<Duration>>,
}

struct Inner {
    state: WorkerState,
    handle: Option<ProcessHandle>,
    // Exit channel of the most recent worker; kept after stop for diagnostics.
    exit_rx: Option<watch::Receiver<Option<WorkerExit>>>,
}

impl Inner {
    fn exited(&self) -> Option<WorkerExit> {
        self.exit_rx.as_ref().and_then(|rx| *rx.borrow())
    }

}

pub struct Supervisor {
    cfg: SupervisorConfig,
    terminator: Arc<dyn Terminator>,
    inner: Mutex<Inner>,
}

impl Supervisor {
    pub fn new(cfg: SupervisorConfig) -> Self {
        Self::with_terminator(cfg, platform_terminator())
    }

    pub fn with_terminator(cfg: SupervisorConfig, terminator: Box<dyn Terminator>) -> Self {
        Self {
            cfg,
            terminator: Arc::from(terminator),
            inner: Mutex::new(Inner {
                state: WorkerState::NotStarted,
                handle: None,
                exit_rx: None,
            }),
        }
    }

    // Shutdown must still work after a panic elsewhere poisoned the lock.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> WorkerState {
        let mut inner = self.lock();
        self.refresh(&mut inner);
        inner.state
    }

    pub fn pid(&self) -> Option<u32> {
        let mut inner = self.lock();
        self.refresh(&mut inner);
        inner.handle.as_ref().map(|h| h.pid)
    }

    /// Exit of the most recent worker, if it has been observed.
    pub fn last_exit(&self) -> Option<WorkerExit> {
        self.lock().exited()
    }

    /// Spawn the worker unless one is already running. Returns its pid.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) -> Result<u32, SpawnError> {
        let mut inner = self.lock();
        self.refresh(&mut inner);
        if let (WorkerState::Running, Some(handle)) = (inner.state, inner.handle.as_ref()) {
            tracing::debug!(pid = handle.pid, "worker already running");
            return Ok(handle.pid);
        }

        let launch = resolve(&self.cfg.deployment)?;
        tracing::info!(program = %launch.program.display(), args = ?launch.args, "starting worker");

        let mut cmd = Command::new(&launch.program);
        cmd.args(&launch.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        self.terminator.prepare(&mut cmd);

        let mut child = cmd.spawn().map_err(|source| SpawnError::Launch {
            program: launch.program.clone(),
            source,
        })?;
        let Some(pid) = child.id() else {
            return Err(SpawnError::Launch {
                program: launch.program,
                source: std::io::Error::other("worker exited before its pid was read"),
            });
        };

        if let Some(out) = child.stdout.take() {
            forward_output(out, pid, OutputStream::Stdout);
        }
        if let Some(err) = child.stderr.take() {
            forward_output(err, pid, OutputStream::Stderr);
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(monitor(
            child,
            pid,
            stop_rx,
            exit_tx,
            self.terminator.clone(),
        ));

        inner.handle = Some(ProcessHandle {
            pid,
            stop_tx: Some(stop_tx),
        });
        inner.exit_rx = Some(exit_rx);
        inner.state = WorkerState::Running;
        tracing::info!(pid, "worker started");
        Ok(pid)
    }

    /// Terminate the worker's process tree. A no-op when nothing is running.
    ///
    /// Returns immediately; the state becomes `Terminated` without waiting for
    /// exit confirmation.
    pub fn stop(&self) {
        let mut inner = self.lock();
        if inner.handle.is_none() {
            tracing::debug!("stop requested with no worker running");
            return;
        }
        self.release(&mut inner);
    }

    // A worker that died on its own is no longer Running, but helpers it started
    // may be; they are released the same way a stop would.
    fn refresh(&self, inner: &mut Inner) {
        if inner.state == WorkerState::Running && inner.exited().is_some() {
            self.release(inner);
        }
    }

    // Every path that gives up the handle goes through here, so no exit leaves
    // the worker's tree behind.
    fn release(&self, inner: &mut Inner) {
        let Some(mut handle) = inner.handle.take() else {
            return;
        };
        inner.state = WorkerState::Terminating;
        let pid = handle.pid;

        let signalled = if inner.exited().is_none() {
            tracing::info!(pid, terminator = self.terminator.name(), "stopping worker");
            self.terminator.terminate(pid)
        } else {
            tracing::debug!(pid, terminator = self.terminator.name(), "sweeping after worker exit");
            self.terminator.sweep(pid)
        };
        match signalled {
            Ok(()) => {}
            Err(e) if is_gone(&e) => tracing::debug!(pid, "nothing left of the worker tree"),
            Err(e) => tracing::warn!(pid, "could not launch tree termination: {e}"),
        }
        if let Some(tx) = handle.stop_tx.take() {
            // The monitor escalates once the grace period is over.
            let _ = tx.send(self.cfg.stop_grace);
        }
        inner.state = WorkerState::Terminated;
    }

    /// Wait until the most recent worker's exit has been observed.
    pub async fn wait_exit(&self, timeout: Duration) -> Option<WorkerExit> {
        let rx = self.lock().exit_rx.clone()?;
        tokio::time::timeout(timeout, wait_exit(rx))
            .await
            .ok()
            .flatten()
    }

    /// Poll `addr` until the worker accepts TCP connections.
    ///
    /// Fails early if the worker exits while we wait.
    pub async fn wait_ready(&self, addr: SocketAddr, timeout: Duration) -> Result<(), SpawnError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(exit) = self.last_exit() {
                return Err(SpawnError::ExitedEarly { code: exit.code });
            }
            if tokio::net::TcpStream::connect(addr).await.is_ok() {
                tracing::debug!(%addr, "worker is accepting connections");
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(SpawnError::NotReady {
                    addr,
                    waited: timeout,
                });
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn wait_exit(mut rx: watch::Receiver<Option<WorkerExit>>) -> Option<WorkerExit> {
    loop {
        if let Some(exit) = *rx.borrow_and_update() {
            return Some(exit);
        }
        if rx.changed().await.is_err() {
            return *rx.borrow();
        }
    }
}

async fn monitor(
    mut child: Child,
    pid: u32,
    mut stop_rx: oneshot::Receiver<Duration>,
    exit_tx: watch::Sender<Option<WorkerExit>>,
    terminator: Arc<dyn Terminator>,
) {
    let mut deadline = None;
    let status = tokio::select! {
        status = child.wait() => status,
        grace = &mut stop_rx => {
            // A dropped sender means the supervisor is gone: no grace.
            let until = Instant::now() + grace.unwrap_or_default();
            deadline = Some(until);
            match tokio::time::timeout_at(until, child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    tracing::warn!(pid, "worker outlived its stop grace period, killing it");
                    if let Err(e) = child.start_kill() {
                        tracing::warn!(pid, "kill failed: {e}");
                    }
                    child.wait().await
                }
            }
        }
    };

    let exit = match status {
        Ok(status) => {
            tracing::info!(pid, code = ?status.code(), "worker exited");
            WorkerExit {
                code: status.code(),
            }
        }
        Err(e) => {
            tracing::warn!(pid, "failed to observe worker exit: {e}");
            WorkerExit { code: None }
        }
    };
    exit_tx.send_replace(Some(exit));

    // Helpers can outlive the worker and ignore the polite request. Whatever is
    // left of the tree when the grace period ends is killed.
    let until = match deadline {
        Some(until) => until,
        None => match stop_rx.await {
            Ok(grace) => Instant::now() + grace,
            Err(_) => Instant::now(),
        },
    };
    tokio::time::sleep_until(until).await;
    match terminator.force(pid) {
        Ok(()) => tracing::debug!(pid, "forced what was left of the worker tree"),
        Err(e) if is_gone(&e) => {}
        Err(e) => tracing::warn!(pid, "could not force the worker tree: {e}"),
    }
}

#[derive(Debug, Clone, Copy)]
enum OutputStream {
    Stdout,
    Stderr,
}

/// Forward the worker's output line by line to the log under the `worker` target.
fn forward_output<R>(reader: R, pid: u32, stream: OutputStream)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    // The worker's console encoding is not guaranteed to be UTF-8.
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end();
                    match stream {
                        OutputStream::Stdout => tracing::info!(target: "worker", pid, "{line}"),
                        OutputStream::Stderr => tracing::warn!(target: "worker", pid, "{line}"),
                    }
                }
                Err(e) => {
                    tracing::debug!(pid, ?stream, "worker output closed: {e}");
                    break;
                }
            }
        }
    });
}

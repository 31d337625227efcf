//! Platform strategies for terminating the worker's whole process tree.
//!
//! The worker may start helpers of its own, so signalling only the top-level pid
//! can leave orphans. Each strategy uses the mechanism the OS provides for trees.
//! None of them waits for the tree to exit.

use std::io;
use std::process::{Command, Stdio};

pub trait Terminator: Send + Sync {
    fn name(&self) -> &'static str;

    /// Adjust the worker command before it is spawned.
    fn prepare(&self, _cmd: &mut tokio::process::Command) {}

    /// Request termination of the tree rooted at `pid` and return immediately.
    fn terminate(&self, pid: u32) -> io::Result<()>;

    /// Signal what is left of the tree after its root `pid` exited on its own.
    ///
    /// A no-op where the tree cannot be addressed once its root is gone.
    fn sweep(&self, _pid: u32) -> io::Result<()> {
        Ok(())
    }

    /// Kill whatever is left of the tree once the stop grace period is over.
    fn force(&self, _pid: u32) -> io::Result<()> {
        Ok(())
    }
}

/// `ESRCH`: nothing was left to signal.
pub(crate) fn is_gone(err: &io::Error) -> bool {
    #[cfg(unix)]
    {
        err.raw_os_error() == Some(libc::ESRCH)
    }
    #[cfg(not(unix))]
    {
        err.kind() == io::ErrorKind::NotFound
    }
}

/// Windows: `taskkill /pid <pid> /T /F` kills the process and all descendants.
///
/// taskkill is an auxiliary process; it is launched detached and its outcome is
/// only logged. It already forces, and it finds descendants through their root,
/// so `sweep` and `force` keep the no-op defaults: once the root is gone its pid
/// may belong to an unrelated process.
#[derive(Debug, Default, Clone, Copy)]
pub struct TaskkillTerminator;

impl TaskkillTerminator {
    pub fn command(&self, pid: u32) -> Command {
        let mut cmd = Command::new("taskkill");
        cmd.args(["/pid", &pid.to_string(), "/T", "/F"]);
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            const CREATE_NO_WINDOW: u32 = 0x0800_0000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }
        cmd
    }
}

impl Terminator for TaskkillTerminator {
    fn name(&self) -> &'static str {
        "taskkill"
    }

    fn terminate(&self, pid: u32) -> io::Result<()> {
        let mut cmd = self.command(pid);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let child = cmd.spawn()?;
        std::thread::Builder::new()
            .name("worker-taskkill".into())
            .spawn(move || match child.wait_with_output() {
                Ok(out) if out.status.success() => {
                    tracing::debug!(pid, "worker tree terminated");
                }
                Ok(out) => {
                    tracing::warn!(
                        pid,
                        code = ?out.status.code(),
                        stderr = %String::from_utf8_lossy(&out.stderr).trim(),
                        "taskkill reported failure"
                    );
                }
                Err(e) => tracing::warn!(pid, "taskkill failed: {e}"),
            })?;
        Ok(())
    }
}

/// Unix: the worker is spawned as the leader of its own process group, so one
/// signal to the group reaches every descendant that did not leave it.
#[derive(Debug, Clone, Copy)]
pub struct ProcessGroupTerminator {
    signal: i32,
}

#[cfg(unix)]
impl Default for ProcessGroupTerminator {
    fn default() -> Self {
        Self {
            signal: libc::SIGTERM,
        }
    }
}

impl ProcessGroupTerminator {
    pub fn with_signal(signal: i32) -> Self {
        Self { signal }
    }

    pub fn signal(&self) -> i32 {
        self.signal
    }
}

#[cfg(unix)]
impl Terminator for ProcessGroupTerminator {
    fn name(&self) -> &'static str {
        "process-group"
    }

    fn prepare(&self, cmd: &mut tokio::process::Command) {
        cmd.process_group(0);
    }

    fn terminate(&self, pid: u32) -> io::Result<()> {
        self.signal_group(pid, self.signal)
    }

    // The group outlives its leader for as long as any member is alive.
    fn sweep(&self, pid: u32) -> io::Result<()> {
        self.signal_group(pid, self.signal)
    }

    fn force(&self, pid: u32) -> io::Result<()> {
        self.signal_group(pid, libc::SIGKILL)
    }
}

#[cfg(unix)]
impl ProcessGroupTerminator {
    fn signal_group(&self, pid: u32, signal: i32) -> io::Result<()> {
        let pgid = libc::pid_t::try_from(pid)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
        // SAFETY: killpg only sends a signal; no memory is shared with the callee.
        let rc = unsafe { libc::killpg(pgid, signal) };
        if rc == 0 {
            tracing::debug!(pid, signal, "signalled worker process group");
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

/// Strategy for the platform this binary runs on.
#[cfg(unix)]
pub fn platform_terminator() -> Box<dyn Terminator> {
    Box::new(ProcessGroupTerminator::default())
}

#[cfg(windows)]
pub fn platform_terminator() -> Box<dyn Terminator> {
    Box::new(TaskkillTerminator)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taskkill_targets_the_tree() {
        let cmd = TaskkillTerminator.command(4242);
        let args: Vec<String> = cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(cmd.get_program(), "taskkill");
        assert_eq!(args, ["/pid", "4242", "/T", "/F"]);
    }

    #[cfg(unix)]
    #[test]
    fn unix_uses_process_groups() {
        let t = platform_terminator();
        assert_eq!(t.name(), "process-group");
        assert_eq!(ProcessGroupTerminator::default().signal(), libc::SIGTERM);
        assert_eq!(
            ProcessGroupTerminator::with_signal(libc::SIGKILL).signal(),
            libc::SIGKILL
        );
    }

    #[cfg(unix)]
    #[test]
    fn signalling_a_missing_group_is_an_error() {
        // Far above any default pid_max.
        let err = ProcessGroupTerminator::default()
            .terminate(0x3fff_fff0)
            .unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ESRCH));
        assert!(is_gone(&err));
        let err = ProcessGroupTerminator::default().force(0x3fff_fff0).unwrap_err();
        assert!(is_gone(&err));
    }

    #[test]
    fn taskkill_never_sweeps_without_a_root() {
        assert!(TaskkillTerminator.sweep(4242).is_ok());
        assert!(TaskkillTerminator.force(4242).is_ok());
    }
}

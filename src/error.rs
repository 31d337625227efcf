//! Failure taxonomy shared by the supervisor, the streaming client and the reducer.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// The worker could not be made available. Fatal to the worker, not to the host.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("worker executable not found at {}", path.display())]
    NotFound { path: PathBuf },

    #[error("failed to launch worker {}", program.display())]
    Launch {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("worker exited during startup (exit code {code:?})")]
    ExitedEarly { code: Option<i32> },

    #[error("worker did not accept connections on {addr} within {}", humantime::format_duration(*waited))]
    NotReady { addr: SocketAddr, waited: Duration },
}

/// Why a request was refused before any network I/O.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("no file selected")]
    EmptyFilePath,
    #[error("keyword must not be blank")]
    EmptyKeyword,
    #[error("top_n must be at least 1")]
    ZeroTopN,
}

/// Terminal reason of a failed session. Every variant ends the session exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// Non-success status, connection failure, stalled or truncated body.
    #[error("transport error: {0}")]
    Transport(String),

    /// A `data: ` line whose payload is not a well-formed frame.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The worker sent an `error` frame; the message is shown verbatim.
    #[error("{0}")]
    BackendReported(String),

    #[error(transparent)]
    InvalidRequest(#[from] RequestError),

    #[error("session cancelled")]
    Cancelled,
}

impl SessionError {
    pub fn is_transport(&self) -> bool {
        matches!(self, SessionError::Transport(_))
    }

    pub fn is_protocol(&self) -> bool {
        matches!(self, SessionError::Protocol(_))
    }

    /// User-facing failure reason.
    pub fn reason(&self) -> String {
        self.to_string()
    }
}

impl From<reqwest::Error> for SessionError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            SessionError::Transport(format!("request timed out: {e}"))
        } else {
            SessionError::Transport(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_message_is_passed_through_verbatim() {
        let e = SessionError::BackendReported("[Errno 2] No such file or directory".into());
        assert_eq!(e.reason(), "[Errno 2] No such file or directory");
        assert!(!e.is_transport());
        assert!(!e.is_protocol());
    }

    #[test]
    fn not_ready_formats_wait_time() {
        let e = SpawnError::NotReady {
            addr: "127.0.0.1:6759".parse().unwrap(),
            waited: Duration::from_secs(20),
        };
        assert_eq!(
            e.to_string(),
            "worker did not accept connections on 127.0.0.1:6759 within 20s"
        );
    }
}

//! One aggregation session: open the stream, fold frames, route events.

use crate::client::StreamingClient;
use crate::error::SessionError;
use crate::model::{AggregateRequest, SessionEvent};
use crate::session::SessionState;
use crate::supervisor::Supervisor;
use futures::StreamExt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc::UnboundedSender, oneshot};

/// Wait for a freshly spawned worker before the first request.
#[derive(Clone)]
pub struct Readiness {
    pub supervisor: Arc<Supervisor>,
    pub addr: SocketAddr,
    pub timeout: Duration,
}

async fn open(
    client: &StreamingClient,
    request: &AggregateRequest,
    readiness: Option<&Readiness>,
) -> Result<crate::client::FrameStream, SessionError> {
    if let Some(r) = readiness {
        r.supervisor
            .wait_ready(r.addr, r.timeout)
            .await
            .map_err(|e| SessionError::Transport(format!("worker unavailable: {e}")))?;
    }
    client.request(request).await
}

/// Drive one session to its terminal state.
///
/// Every path ends with exactly one terminal event on `event_tx`. Firing or
/// dropping `cancel_rx` abandons the session and closes its connection.
pub async fn run_session(
    client: StreamingClient,
    request: AggregateRequest,
    readiness: Option<Readiness>,
    event_tx: UnboundedSender<SessionEvent>,
    mut cancel_rx: oneshot::Receiver<()>,
) -> SessionState {
    let mut state = SessionState::new();
    let emit = |state: &SessionState, transition| {
        if let Some(ev) = state.event(transition) {
            let _ = event_tx.send(ev);
        }
    };

    let opened = tokio::select! {
        r = open(&client, &request, readiness.as_ref()) => r,
        _ = &mut cancel_rx => Err(SessionError::Cancelled),
    };
    let mut frames = match opened {
        Ok(frames) => frames,
        Err(e) => {
            tracing::warn!(keyword = %request.keyword, "session failed to open: {e}");
            let t = state.fail(e);
            emit(&state, t);
            return state;
        }
    };

    loop {
        tokio::select! {
            item = frames.next() => {
                let t = match item {
                    Some(Ok(frame)) => state.apply(frame),
                    Some(Err(e)) => state.fail(e),
                    None => state.fail(SessionError::Transport(
                        "stream ended before a terminal frame".into(),
                    )),
                };
                emit(&state, t);
            }
            _ = &mut cancel_rx => {
                let t = state.fail(SessionError::Cancelled);
                emit(&state, t);
            }
        }
        if state.is_terminal() {
            break;
        }
    }
    // Closes the connection if the session ended before the body did.
    drop(frames);

    match state.failure() {
        None => tracing::info!(
            keyword = %request.keyword,
            processed = state.tally().processed,
            total = state.tally().total,
            "session completed"
        ),
        Some(reason) => tracing::warn!(keyword = %request.keyword, %reason, "session failed"),
    }
    state
}

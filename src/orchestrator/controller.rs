//! Application controller.
//!
//! Binds the worker's lifecycle to the application's and serializes aggregation
//! requests: one session at a time. Emits events for presentation layers.

use super::session_task::{run_session, Readiness};
use crate::client::StreamingClient;
use crate::error::SessionError;
use crate::model::{AggregateRequest, SessionEvent, Tally};
use crate::session::SessionState;
use crate::supervisor::{Supervisor, WorkerState};
use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;

/// Commands emitted by presentation layers.
#[derive(Debug, Clone)]
pub enum AppCommand {
    Aggregate(AggregateRequest),
    /// Abandon the active session; the worker keeps running.
    Cancel,
    /// Host reactivated: start the worker again if none is running.
    Reactivate,
    Quit,
}

/// Events emitted to presentation layers.
#[derive(Debug, Clone)]
pub enum AppEvent {
    WorkerStarted { pid: u32 },
    WorkerStopped,
    SessionStarted(AggregateRequest),
    Session(SessionEvent),
    Info(String),
}

/// Collaborators the controller drives.
pub struct Controller {
    /// `None` when the worker is managed outside this process.
    pub supervisor: Option<Arc<Supervisor>>,
    pub client: StreamingClient,
    /// Worker address used to wait for readiness after a spawn.
    pub worker_addr: SocketAddr,
    pub ready_timeout: Duration,
}

/// Internal handle for the running session task.
struct SessionCtx {
    cancel_tx: Option<oneshot::Sender<()>>,
    handle: Option<tokio::task::JoinHandle<SessionState>>,
    forward: tokio::task::JoinHandle<()>,
}

impl SessionCtx {
    fn cancel(&mut self) {
        if let Some(tx) = self.cancel_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Controller {
    fn start_worker(&self, event_tx: &UnboundedSender<AppEvent>) {
        let Some(sup) = &self.supervisor else {
            return;
        };
        match sup.start() {
            Ok(pid) => {
                let _ = event_tx.send(AppEvent::WorkerStarted { pid });
            }
            Err(e) => {
                tracing::error!("worker failed to start: {e:#}");
                let _ = event_tx.send(AppEvent::Info(format!("Worker failed to start: {e}")));
            }
        }
    }

    fn stop_worker(&self, event_tx: &UnboundedSender<AppEvent>) {
        if let Some(sup) = &self.supervisor {
            let was_running = sup.state() == WorkerState::Running;
            sup.stop();
            if was_running {
                let _ = event_tx.send(AppEvent::WorkerStopped);
            }
        }
    }

    fn start_session(
        &self,
        request: AggregateRequest,
        event_tx: &UnboundedSender<AppEvent>,
    ) -> SessionCtx {
        let readiness = self.supervisor.as_ref().map(|sup| Readiness {
            supervisor: sup.clone(),
            addr: self.worker_addr,
            timeout: self.ready_timeout,
        });
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let (session_tx, mut session_rx) = mpsc::unbounded_channel::<SessionEvent>();

        let app_tx = event_tx.clone();
        let forward = tokio::spawn(async move {
            while let Some(ev) = session_rx.recv().await {
                let _ = app_tx.send(AppEvent::Session(ev));
            }
        });

        let _ = event_tx.send(AppEvent::SessionStarted(request.clone()));
        let client = self.client.clone();
        let handle = tokio::spawn(run_session(
            client, request, readiness, session_tx, cancel_rx,
        ));
        SessionCtx {
            cancel_tx: Some(cancel_tx),
            handle: Some(handle),
            forward,
        }
    }

    /// Run until `Quit` or until the command channel closes.
    ///
    /// The worker is started on entry and stopped on every exit path.
    pub async fn run(
        self,
        event_tx: UnboundedSender<AppEvent>,
        mut cmd_rx: UnboundedReceiver<AppCommand>,
    ) -> Result<()> {
        self.start_worker(&event_tx);

        let mut session: Option<SessionCtx> = None;
        let mut quit_pending = false;

        loop {
            tokio::select! {
                cmd = cmd_rx.recv(), if !quit_pending => {
                    match cmd {
                        Some(AppCommand::Aggregate(req)) => {
                            if session.is_some() {
                                let _ = event_tx.send(AppEvent::Info(
                                    "An aggregation is already running".into(),
                                ));
                            } else {
                                session = Some(self.start_session(req, &event_tx));
                            }
                        }
                        Some(AppCommand::Cancel) => {
                            if let Some(ctx) = session.as_mut() {
                                ctx.cancel();
                                let _ = event_tx.send(AppEvent::Info("Cancelling…".into()));
                            }
                        }
                        Some(AppCommand::Reactivate) => {
                            let running = self
                                .supervisor
                                .as_ref()
                                .is_some_and(|s| s.state() == WorkerState::Running);
                            if !running {
                                self.start_worker(&event_tx);
                            }
                        }
                        Some(AppCommand::Quit) | None => {
                            // Quit waits for the session task so its terminal event is delivered.
                            quit_pending = true;
                            match session.as_mut() {
                                Some(ctx) => ctx.cancel(),
                                None => break,
                            }
                        }
                    }
                }
                // Do not take the JoinHandle before this branch wins; otherwise it can be dropped
                // if another select branch is chosen, and we'll never observe completion.
                maybe_done = async {
                    if let Some(ctx) = &mut session {
                        if let Some(h) = ctx.handle.as_mut() {
                            return Some(h.await);
                        }
                    }
                    futures::future::pending().await
                } => {
                    if let Some(join_res) = maybe_done {
                        if let Some(mut ctx) = session.take() {
                            ctx.handle.take();
                            // The session's sender is gone, so forwarding drains and ends.
                            let _ = ctx.forward.await;
                        }
                        if let Err(e) = join_res {
                            // The task died without its terminal event; emit one on its behalf.
                            tracing::error!("session task failed: {e}");
                            let _ = event_tx.send(AppEvent::Session(SessionEvent::Failed {
                                reason: SessionError::Transport(format!("session task failed: {e}")),
                                last: Tally::default(),
                            }));
                        }
                        if quit_pending {
                            break;
                        }
                    }
                }
            }
        }

        self.stop_worker(&event_tx);
        Ok(())
    }
}

//! Session reducer.
//!
//! Folds frames into the externally visible state of one aggregation session.
//! Progress and done frames replace the whole tally: the worker has already
//! aggregated and ranked, so counts are never merged locally.

use crate::error::SessionError;
use crate::model::{Frame, FrameKind, SessionEvent, SessionStatus, Tally};

/// Effect of feeding one input into a [`SessionState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Updated,
    Completed,
    Failed,
    /// The session was already terminal; nothing changed.
    Ignored,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    tally: Tally,
    status: SessionStatus,
    failure: Option<SessionError>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionState {
    pub fn new() -> Self {
        Self {
            tally: Tally::default(),
            status: SessionStatus::Active,
            failure: None,
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn tally(&self) -> &Tally {
        &self.tally
    }

    pub fn failure(&self) -> Option<&SessionError> {
        self.failure.as_ref()
    }

    pub fn is_terminal(&self) -> bool {
        self.status != SessionStatus::Active
    }

    /// Rounded completion percentage; 0 while the total is unknown or zero.
    pub fn percent(&self) -> u8 {
        self.tally.percent()
    }

    pub fn apply(&mut self, frame: Frame) -> Transition {
        if self.is_terminal() {
            tracing::debug!(kind = ?frame.kind, "ignoring frame after session end");
            return Transition::Ignored;
        }
        match frame.kind {
            FrameKind::Progress | FrameKind::Done => {
                if frame.processed < self.tally.processed {
                    return self.fail(SessionError::Protocol(format!(
                        "processed count went backwards ({} after {})",
                        frame.processed, self.tally.processed
                    )));
                }
                self.tally = Tally {
                    processed: frame.processed,
                    total: frame.total,
                    keywords: frame.keywords,
                };
                if frame.kind == FrameKind::Done {
                    self.status = SessionStatus::Completed;
                    Transition::Completed
                } else {
                    Transition::Updated
                }
            }
            FrameKind::Error => {
                let message = frame
                    .message
                    .unwrap_or_else(|| crate::client::DEFAULT_ERROR_MESSAGE.to_string());
                self.fail(SessionError::BackendReported(message))
            }
        }
    }

    /// End the session as failed. Only the first failure is kept.
    pub fn fail(&mut self, reason: SessionError) -> Transition {
        if self.is_terminal() {
            tracing::debug!(%reason, "ignoring failure after session end");
            return Transition::Ignored;
        }
        self.status = SessionStatus::Failed;
        self.failure = Some(reason);
        Transition::Failed
    }

    /// Event to route to presentation layers for a transition, if any.
    pub fn event(&self, transition: Transition) -> Option<SessionEvent> {
        match transition {
            Transition::Updated => Some(SessionEvent::Progress(self.tally.clone())),
            Transition::Completed => Some(SessionEvent::Completed(self.tally.clone())),
            Transition::Failed => Some(SessionEvent::Failed {
                reason: self
                    .failure
                    .clone()
                    .unwrap_or_else(|| SessionError::Protocol("unknown failure".into())),
                last: self.tally.clone(),
            }),
            Transition::Ignored => None,
        }
    }
}

/// Pure fold over a frame sequence.
pub fn fold<I>(frames: I) -> SessionState
where
    I: IntoIterator<Item = Frame>,
{
    frames.into_iter().fold(SessionState::new(), |mut state, frame| {
        state.apply(frame);
        state
    })
}

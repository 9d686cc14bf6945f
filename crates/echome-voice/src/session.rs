//! Per-session protocol state machine.
//!
//! ```text
//! Connecting --StartSent--> AwaitingStartAck --Started--> Active
//! Active --FinishSent--> Finishing --Finished--> Closed
//! Active --Finished--> Closed
//! any non-terminal --Failed--> Failed
//! ```

use crate::error::VoiceError;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    AwaitingStartAck,
    Active,
    Finishing,
    Closed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// The start command (run-task or session.update) was written.
    StartSent,
    /// The upstream acknowledged the start.
    Started,
    /// The finish command was written.
    FinishSent,
    /// The upstream reported the task complete.
    Finished,
    /// The upstream reported failure, or a leg hit a fatal error.
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }

    /// Returns the state reached by applying `event`.
    pub fn on(self, event: SessionEvent) -> Result<Self, VoiceError> {
        use SessionEvent as E;
        use SessionState as S;

        let next = match (self, event) {
            (S::Connecting, E::StartSent) => S::AwaitingStartAck,
            (S::AwaitingStartAck, E::Started) => S::Active,
            (S::Active, E::FinishSent) => S::Finishing,
            (S::Active | S::Finishing, E::Finished) => S::Closed,
            (s, E::Failed) if !s.is_terminal() => S::Failed,
            (from, event) => return Err(VoiceError::IllegalTransition { from, event }),
        };
        Ok(next)
    }
}

/// Shared view of one session's state, updated by both legs.
#[derive(Debug, Clone)]
pub(crate) struct SessionTracker {
    state: Arc<watch::Sender<SessionState>>,
}

impl SessionTracker {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(SessionState::Connecting);
        Self { state: Arc::new(tx) }
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn advance(&self, event: SessionEvent) -> Result<SessionState, VoiceError> {
        let mut outcome = Ok(SessionState::Connecting);
        self.state.send_if_modified(|current| match current.on(event) {
            Ok(next) => {
                *current = next;
                outcome = Ok(next);
                true
            }
            Err(e) => {
                outcome = Err(e);
                false
            }
        });
        if let Ok(next) = &outcome {
            tracing::trace!(state = ?next, ?event, "voice session transition");
        }
        outcome
    }

    /// Marks the session failed unless it already ended.
    pub fn fail(&self) {
        let _ = self.advance(SessionEvent::Failed);
    }
}

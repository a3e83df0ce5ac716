//! Lifecycle state of a worker's connection.

use std::fmt;

/// Where a worker is in its connect / listen / teardown cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Thread launched, startup not finished.
    Created,
    /// Loop running, no socket.
    Ready,
    /// A connect attempt is in flight.
    Connecting,
    /// The last connect attempt failed. The socket slot stays claimed until
    /// a keepalive retries.
    Failed,
    /// Handshake done, listeners not yet registered.
    Connected,
    /// Handshake done and listeners registered.
    Listening,
    /// Listeners and socket are being torn down.
    Closing,
    /// Loop exited.
    Stopped,
}

/// Rejected state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("illegal worker transition {from} -> {to}")]
pub struct IllegalTransition {
    pub from: WorkerState,
    pub to: WorkerState,
}

impl WorkerState {
    /// A socket exists or is being created.
    pub fn socket_exists(self) -> bool {
        matches!(
            self,
            WorkerState::Connecting
                | WorkerState::Failed
                | WorkerState::Connected
                | WorkerState::Listening
        )
    }

    pub fn listeners_registered(self) -> bool {
        self == WorkerState::Listening
    }

    pub fn can_transition_to(self, to: WorkerState) -> bool {
        use WorkerState::*;
        matches!(
            (self, to),
            (Created, Ready)
                | (Ready, Connecting)
                | (Failed, Connecting)
                | (Connecting, Connected)
                | (Connecting, Failed)
                | (Connected, Listening)
                | (Ready | Failed | Connected | Listening, Closing)
                | (Closing, Ready)
                | (_, Stopped)
        ) && self != Stopped
    }

    /// Move to `to` if the edge is legal; otherwise leave `self` unchanged.
    pub fn transition(&mut self, to: WorkerState) -> Result<(), IllegalTransition> {
        if !self.can_transition_to(to) {
            return Err(IllegalTransition { from: *self, to });
        }
        *self = to;
        Ok(())
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkerState::Created => "created",
            WorkerState::Ready => "ready",
            WorkerState::Connecting => "connecting",
            WorkerState::Failed => "failed",
            WorkerState::Connected => "connected",
            WorkerState::Listening => "listening",
            WorkerState::Closing => "closing",
            WorkerState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

//! Handshake state tracking for both roles.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Idle,
    /// Initiator: request sent, waiting for Allow/Deny.
    AwaitingAuthResponse,
    /// Listener: request received, waiting for the operator.
    AwaitingOperatorDecision,
    Established,
}

impl HandshakeState {
    /// Whether `self -> next` is a transition either role can make.
    /// Falling back to `Idle` is always allowed except once established.
    pub fn can_advance(self, next: HandshakeState) -> bool {
        use HandshakeState::*;
        matches!(
            (self, next),
            (Idle, AwaitingAuthResponse)
                | (Idle, AwaitingOperatorDecision)
                | (AwaitingAuthResponse, Established)
                | (AwaitingOperatorDecision, Established)
                | (AwaitingAuthResponse, Idle)
                | (AwaitingOperatorDecision, Idle)
        )
    }
}

/// Current state of one handshake attempt, with transitions logged.
#[derive(Debug)]
pub(crate) struct Tracker {
    role: &'static str,
    state: HandshakeState,
}

impl Tracker {
    pub(crate) fn new(role: &'static str) -> Self {
        Self {
            role,
            state: HandshakeState::Idle,
        }
    }

    pub(crate) fn state(&self) -> HandshakeState {
        self.state
    }

    pub(crate) fn advance(&mut self, next: HandshakeState) {
        if !self.state.can_advance(next) {
            tracing::warn!(role = self.role, from = ?self.state, to = ?next, "unexpected handshake transition");
        } else {
            tracing::debug!(role = self.role, from = ?self.state, to = ?next, "handshake transition");
        }
        self.state = next;
    }
}

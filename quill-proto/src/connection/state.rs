use crate::{frame::ConnectionClose, Error};

#[derive(Debug, Clone)]
pub(super) struct State {
    /// Nested [`InnerState`] to enforce all state transitions are done in this module.
    inner: InnerState,
}

impl State {
    pub(super) fn idle() -> Self {
        Self {
            inner: InnerState::Idle,
        }
    }

    pub(super) fn move_to_handshaking(&mut self) {
        assert!(
            matches!(self.inner, InnerState::Idle),
            "invalid state transition {:?} -> handshaking",
            self.as_type()
        );
        self.inner = InnerState::Handshaking;
    }

    pub(super) fn move_to_handshake_complete(&mut self) {
        assert!(
            matches!(self.inner, InnerState::Handshaking),
            "invalid state transition {:?} -> handshake complete",
            self.as_type()
        );
        self.inner = InnerState::HandshakeComplete;
    }

    /// Moves to a closing state after the application closes the connection.
    pub(super) fn move_to_closing(&mut self) {
        assert!(
            matches!(self.inner, InnerState::HandshakeComplete),
            "invalid state transition {:?} -> closing",
            self.as_type()
        );
        self.inner = InnerState::Closing;
    }

    /// Moves to a draining state after the peer closes the connection.
    pub(super) fn move_to_draining(&mut self, reason: ConnectionClose) {
        assert!(
            !self.is_terminal(),
            "invalid state transition {:?} -> draining",
            self.as_type()
        );
        self.inner = InnerState::Draining { reason };
    }

    /// Records an unrecoverable error. Later errors do not replace the first.
    pub(super) fn move_to_failed(&mut self, error: Error) {
        if !matches!(self.inner, InnerState::Failed(_)) {
            self.inner = InnerState::Failed(error);
        }
    }

    pub(super) fn is_idle(&self) -> bool {
        matches!(self.inner, InnerState::Idle)
    }

    pub(super) fn is_handshaking(&self) -> bool {
        matches!(self.inner, InnerState::Handshaking)
    }

    pub(super) fn is_handshake_complete(&self) -> bool {
        matches!(self.inner, InnerState::HandshakeComplete)
    }

    /// Whether no further packets may be processed or produced
    pub(super) fn is_terminal(&self) -> bool {
        matches!(
            self.inner,
            InnerState::Draining { .. } | InnerState::Failed(_)
        )
    }

    pub(super) fn error(&self) -> Option<Error> {
        match self.inner {
            InnerState::Failed(e) => Some(e),
            _ => None,
        }
    }

    pub(super) fn as_type(&self) -> StateType {
        match self.inner {
            InnerState::Idle => StateType::Idle,
            InnerState::Handshaking => StateType::Handshaking,
            InnerState::HandshakeComplete => StateType::HandshakeComplete,
            InnerState::Closing => StateType::Closing,
            InnerState::Draining { .. } => StateType::Draining,
            InnerState::Failed(_) => StateType::Failed,
        }
    }
}

#[derive(Debug, Clone)]
enum InnerState {
    Idle,
    Handshaking,
    HandshakeComplete,
    Closing,
    Draining { reason: ConnectionClose },
    Failed(Error),
}

/// Coarse phase of a connection's lifetime
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum StateType {
    /// A server connection waiting for the client's first packet
    Idle,
    /// Handshake bytes are being exchanged in cleartext packets
    Handshaking,
    /// 1-RTT keys are installed and application data may flow
    HandshakeComplete,
    /// The application closed the connection; a CONNECTION_CLOSE is queued or sent
    Closing,
    /// The peer closed the connection
    Draining,
    /// An unrecoverable error tore the connection down
    Failed,
}

use thiserror::Error;

use crate::coding::UnexpectedEnd;

/// Reasons an engine operation can fail
#[derive(Debug, Error, Clone, Copy, Eq, PartialEq, Hash)]
pub enum Error {
    /// Input was malformed, truncated, or outside the range the wire format can express
    #[error("invalid argument")]
    InvalidArgument,
    /// A header carried a form that is understood but a type tag that is not
    #[error("unknown packet type")]
    UnknownPacketType,
    /// The destination buffer cannot hold the encoding
    #[error("insufficient buffer space")]
    NoBuffer,
    /// A cleartext packet failed its integrity check
    #[error("bad packet hash")]
    BadPacketHash,
    /// Well-formed input that the peer was not allowed to send at this point
    #[error("protocol violation")]
    Proto,
    /// The operation is not permitted in the connection's current state
    #[error("invalid state")]
    InvalidState,
    /// A TLS or AEAD collaborator reported failure
    #[error("callback failure")]
    CallbackFailure,
    /// An internal invariant was violated
    #[error("internal error")]
    Internal,
}

impl Error {
    /// Whether the connection must be torn down after this error surfaces
    pub fn is_fatal(self) -> bool {
        !matches!(self, Self::InvalidState | Self::NoBuffer)
    }
}

impl From<UnexpectedEnd> for Error {
    fn from(_: UnexpectedEnd) -> Self {
        Self::InvalidArgument
    }
}

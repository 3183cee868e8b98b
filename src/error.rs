//! Crate-level error types.

use std::fmt;

use crate::transport::TransportError;

/// Errors produced by the molsync crate.
///
/// Structural errors (`InvalidState`, `InvalidOperation`, `ArgumentInvalid`)
/// are returned synchronously to the caller that broke the protocol
/// sequence. `Transport` and `Decode` end the stream task they occur in and
/// never reach sibling streams. Cancellation is not an error: cancelled
/// tasks complete with `Ok(())`.
#[derive(Debug)]
pub enum SessionError {
    /// The token, stream or connection has already been torn down, or a
    /// one-way transition was attempted twice.
    InvalidState(String),
    /// Operation issued out of protocol sequence (e.g. queueing before the
    /// stream was started).
    InvalidOperation(String),
    /// Malformed message payload, rejected before queuing.
    ArgumentInvalid(String),
    /// Underlying RPC or network failure.
    Transport(TransportError),
    /// A received payload could not be decoded.
    Decode(prost::DecodeError),
    /// TOML options parsing/serialization failure.
    OptionsParse(String),
    /// Generic I/O failure.
    Io(std::io::Error),
}

impl SessionError {
    /// Whether this error is a programmer error in call sequencing or
    /// arguments, as opposed to a runtime failure.
    #[must_use]
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::InvalidState(_)
                | Self::InvalidOperation(_)
                | Self::ArgumentInvalid(_)
        )
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidState(msg) => write!(f, "invalid state: {msg}"),
            Self::InvalidOperation(msg) => {
                write!(f, "invalid operation: {msg}")
            }
            Self::ArgumentInvalid(msg) => {
                write!(f, "invalid argument: {msg}")
            }
            Self::Transport(e) => write!(f, "transport error: {e}"),
            Self::Decode(e) => write!(f, "decode error: {e}"),
            Self::OptionsParse(msg) => {
                write!(f, "options parse error: {msg}")
            }
            Self::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport(e) => Some(e),
            Self::Decode(e) => Some(e),
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TransportError> for SessionError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

impl From<prost::DecodeError> for SessionError {
    fn from(e: prost::DecodeError) -> Self {
        Self::Decode(e)
    }
}

impl From<std::io::Error> for SessionError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

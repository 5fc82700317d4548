//! Error types for the engine channel, the relay, and the handshake machines.

use std::fmt;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Engine channel
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("engine endpoint unavailable after {attempts} attempts: {source}")]
    Unavailable {
        attempts: u32,
        #[source]
        source: std::io::Error,
    },
    #[error("encoded {command} frame is {len} bytes; frames must stay below {max}")]
    FrameTooLarge {
        command: &'static str,
        len: usize,
        max: usize,
    },
    #[error("malformed engine frame: {0}")]
    Malformed(String),
    #[error("engine closed the channel before replying")]
    UnexpectedEof,
    #[error("engine did not reply within {0:?}")]
    Timeout(Duration),
    #[error("engine channel is closed")]
    Closed,
    #[error("engine channel I/O: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Relay
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("relay {call} request failed with status {status}")]
    Status { call: &'static str, status: u16 },
    #[error("relay unreachable: {0}")]
    Transport(String),
    #[error("unexpected relay {call} response: {reason}")]
    Unexpected { call: &'static str, reason: String },
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

/// Why a handshake machine ended in `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    ChannelUnavailable,
    ProtocolError,
    ConfigRejected,
    RelayRequestFailed(u16),
    RelayUnreachable,
    SessionLost,
    Cancelled,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ChannelUnavailable => f.write_str("engine unavailable"),
            Self::ProtocolError => f.write_str("engine protocol error"),
            Self::ConfigRejected => f.write_str("config rejected"),
            Self::RelayRequestFailed(status) => write!(f, "relay request failed ({status})"),
            Self::RelayUnreachable => f.write_str("relay unreachable"),
            Self::SessionLost => f.write_str("session lost"),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("media engine unavailable: {0}")]
    ChannelUnavailable(#[source] ChannelError),
    #[error("media engine protocol error: {0}")]
    Protocol(#[source] ChannelError),
    #[error("media engine rejected the config")]
    ConfigRejected,
    #[error(transparent)]
    Relay(#[from] RelayError),
    #[error("push subscription closed before streaming started")]
    SessionLost,
    #[error("handshake cancelled")]
    Cancelled,
    /// The affordance was invoked before the matching push was observed.
    #[error("cannot {action} while {state}")]
    NotReady { action: &'static str, state: String },
    #[error("handshake already failed: {0}")]
    AlreadyFailed(FailureKind),
}

impl From<ChannelError> for HandshakeError {
    fn from(e: ChannelError) -> Self {
        match e {
            ChannelError::Unavailable { .. } => Self::ChannelUnavailable(e),
            other => Self::Protocol(other),
        }
    }
}

impl HandshakeError {
    /// The failure this error records on the machine, if it is fatal.
    ///
    /// `NotReady` is not fatal: the machine keeps its state.
    pub fn kind(&self) -> Option<FailureKind> {
        match self {
            Self::ChannelUnavailable(_) => Some(FailureKind::ChannelUnavailable),
            Self::Protocol(_) => Some(FailureKind::ProtocolError),
            Self::ConfigRejected => Some(FailureKind::ConfigRejected),
            Self::Relay(RelayError::Status { status, .. }) => {
                Some(FailureKind::RelayRequestFailed(*status))
            }
            Self::Relay(RelayError::Unexpected { .. }) => Some(FailureKind::ProtocolError),
            Self::Relay(RelayError::Transport(_)) => Some(FailureKind::RelayUnreachable),
            Self::SessionLost => Some(FailureKind::SessionLost),
            Self::Cancelled => Some(FailureKind::Cancelled),
            Self::NotReady { .. } => None,
            Self::AlreadyFailed(kind) => Some(*kind),
        }
    }
}

use std::time::Duration;

use thiserror::Error;
use tokio_util::codec::LinesCodecError;

use crate::command::CommandId;

/// Top-level error type for the `dimm-api` crate.
///
/// Covers every failure mode of an OpenTPL session: connection setup,
/// wire framing, per-command outcomes, and per-variable data quality.
/// `dimm-core` maps these into controller-level errors.
#[derive(Debug, Error)]
pub enum Error {
    // ── Connection ──────────────────────────────────────────────────
    /// TCP connect failed or timed out.
    #[error("could not connect to {addr}: {reason}")]
    Connect { addr: String, reason: String },

    /// Socket read/write failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection went away while the operation was outstanding.
    #[error("connection lost: {reason}")]
    ConnectionLost { reason: String },

    /// The session was already closed.
    #[error("session is not connected")]
    NotConnected,

    /// `AUTH PLAIN` was refused or the handshake could not be completed.
    #[error("authentication failed: {message}")]
    Authentication { message: String },

    // ── Protocol ────────────────────────────────────────────────────
    /// Line could not be parsed or violated framing rules.
    #[error("protocol error: {0}")]
    Protocol(String),

    // ── Commands ────────────────────────────────────────────────────
    /// No completion arrived within the command timeout.
    #[error("command {id} timed out after {elapsed:?}")]
    Timeout { id: CommandId, elapsed: Duration },

    /// Device answered `COMMAND FAILED` (or an error/abort preceding it).
    #[error("command {id} rejected by device: {reason}")]
    Rejected { id: CommandId, reason: String },

    /// The in-flight table is full.
    #[error("too many pending commands (limit {limit})")]
    TooManyPending { limit: usize },

    /// An identifier is already in use by a pending command.
    #[error("command id {id} is already pending")]
    DuplicateId { id: CommandId },

    /// Completion was signalled twice for the same command.
    #[error("command {id} already completed")]
    AlreadyCompleted { id: CommandId },

    // ── Data ────────────────────────────────────────────────────────
    /// A variable came back as an error, `NULL`, or an unparsable value.
    #[error("bad value for {name}: {reason}")]
    DataQuality { name: String, reason: String },
}

impl Error {
    /// Returns `true` for failures that a fresh connection may cure.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connect { .. } | Self::Io(_) | Self::ConnectionLost { .. } | Self::NotConnected
        )
    }

    /// Returns `true` if retrying the same operation later is reasonable.
    pub fn is_transient(&self) -> bool {
        self.is_connection_error() || matches!(self, Self::Timeout { .. } | Self::TooManyPending { .. })
    }

    pub(crate) fn lost(reason: impl Into<String>) -> Self {
        Self::ConnectionLost {
            reason: reason.into(),
        }
    }
}

impl From<LinesCodecError> for Error {
    fn from(err: LinesCodecError) -> Self {
        match err {
            LinesCodecError::MaxLineLengthExceeded => {
                Self::Protocol("line exceeds maximum length".into())
            }
            LinesCodecError::Io(e) => Self::Io(e),
        }
    }
}
